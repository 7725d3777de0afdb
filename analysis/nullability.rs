//! The nullability analysis: a two-point lattice {NotNull ⊑ Nullable} with
//! join = OR and meet = AND, run over a routine's CFG.

use derive_more::Display;

use super::*;
use crate::bytecode::{cfg, opcodes, ArgVal, Constant};

// SECTION: analysis interface

/// Whether a value may be the null literal.
#[derive(Copy, Clone, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
pub enum Nullability {
    NotNull,
    Nullable,
}

/// Abstract environment.
pub type Env = Environment<Nullability>;

/// Analyze one routine against the given global scope.  Builds the CFG,
/// seeds the entry environment from the signature, and solves to fixpoint.
pub fn analyze(
    routine: &Valid<Routine>,
    globals: &Globals,
) -> Result<Solution<Nullability>, AnalysisError> {
    let cfg = cfg::build(&routine.0.code)?;
    let dfa = NullabilityAnalysis::new(routine, globals);
    solve(&dfa, &cfg)
}

/// Classification of an annotation: nullable iff it is the null type itself
/// or an optional/union whose members include the null type.  Anything
/// else, including a missing annotation, is non-null.
pub fn classify(annotation: Option<&Annotation>) -> Nullability {
    match annotation {
        Some(Annotation::NoneType) => Nullability::Nullable,
        Some(Annotation::Optional(_)) => Nullability::Nullable,
        Some(Annotation::Union(members)) => {
            if members.iter().any(|m| *m == Annotation::NoneType) {
                Nullability::Nullable
            } else {
                Nullability::NotNull
            }
        }
        _ => Nullability::NotNull,
    }
}

// SECTION: analysis implementation

use Nullability as N;

impl AbstractValue for Nullability {
    type Concrete = Constant;

    const BOTTOM: Self = N::NotNull;

    fn alpha(val: &Constant) -> Self {
        if *val == Constant::None {
            N::Nullable
        } else {
            N::NotNull
        }
    }

    fn leq(&self, rhs: &Self) -> bool {
        self <= rhs
    }

    fn join(&self, rhs: &Self) -> Self {
        *self.max(rhs)
    }

    fn meet(&self, rhs: &Self) -> Self {
        *self.min(rhs)
    }
}

/// The `Dataflow` instance for one routine.
pub struct NullabilityAnalysis<'a> {
    routine: &'a Routine,
    globals: &'a Globals,
    // tag -> full record, for provenance lookups during calls.
    by_offset: Map<Tag, &'a Instr>,
    /// Annotations that could not be classified; informational only.
    pub diagnostics: Vec<String>,
}

impl<'a> NullabilityAnalysis<'a> {
    pub fn new(routine: &'a Valid<Routine>, globals: &'a Globals) -> Self {
        let routine = &routine.0;
        let mut diagnostics = Vec::new();
        for (name, annotation) in &routine.annotations {
            if let Annotation::Unknown(text) = annotation {
                diagnostics.push(format!(
                    "routine {}: unclassifiable annotation `{text}` on `{name}`, treated as non-null",
                    routine.name
                ));
            }
        }
        NullabilityAnalysis {
            routine,
            globals,
            by_offset: routine.code.iter().map(|instr| (instr.offset, instr)).collect(),
            diagnostics,
        }
    }

    // immediate arguments are guaranteed by `Routine::validate`.
    fn arg(instr: &Instr) -> u32 {
        instr.arg.expect("validated: opcode carries an argument")
    }

    fn pop(
        env: &mut Env,
        instr: &Instr,
        declared: i32,
    ) -> Result<Tagged<Nullability>, AnalysisError> {
        env.stack.pop().ok_or(AnalysisError::BytecodeInvariant {
            offset: instr.offset,
            block: 0,
            declared,
            got: 0,
        })
    }

    // The only inter-procedural edge: pop the arguments and the callee,
    // then look through the callee's provenance for LOAD_GLOBAL of an
    // annotated routine and join the classifications of their declared
    // returns.  No evidence means non-null.
    fn call_function(&self, instr: &Instr, env: &mut Env) -> Result<(), AnalysisError> {
        let declared = opcodes::stack_effect(instr.opcode, instr.arg);
        for _ in 0..Self::arg(instr) {
            Self::pop(env, instr, declared)?;
        }
        let callee = Self::pop(env, instr, declared)?;

        let mut out = N::NotNull;
        for tag in &callee.tags {
            let Some(source) = self.by_offset.get(tag) else { continue };
            if source.opname != "LOAD_GLOBAL" {
                continue;
            }
            let Some(ArgVal::Name(name)) = &source.argval else { continue };
            if let Some(Global::Routine(sig)) = self.globals.get(name) {
                out = out.join(&classify(sig.returns.as_ref()));
            }
        }
        env.stack.push(Tagged::from_instr(instr.offset, out));
        Ok(())
    }
}

impl Dataflow for NullabilityAnalysis<'_> {
    type Value = Nullability;

    // Parameters with annotations start out classified; everything else is
    // absent (and reads as non-null through LOAD_FAST).
    fn entry_env(&self) -> Env {
        let mut locals = LocalsDomain::new();
        for (name, annotation) in &self.routine.annotations {
            if name == "return" {
                continue;
            }
            let Some(slot) = self.routine.params.iter().position(|p| p == name) else {
                continue;
            };
            locals.insert(
                slot as u32,
                Tagged::new(Set::new(), classify(Some(annotation))),
            );
        }
        Environment {
            locals,
            ..Environment::default()
        }
    }

    fn transfer(&self, instr: &Instr, env: &Env) -> Result<Env, AnalysisError> {
        let mut env = env.clone();
        let declared = opcodes::stack_effect(instr.opcode, instr.arg);

        // loop-shape bookkeeping; POP_BLOCK unwinds the operand stack to
        // the depth recorded at loop entry.
        let mut effect = declared;
        match instr.opname.as_str() {
            "POP_BLOCK" => {
                // the loop shape must stay non-empty: POP_BLOCK outside any
                // SETUP_LOOP scope is malformed bytecode.
                if env.shape.len() < 2 {
                    return Err(AnalysisError::LoopShapeMismatch {
                        offset: instr.offset,
                        block: 0,
                    });
                }
                let popped = env.shape.pop().expect("checked above");
                effect = -(popped as i32);
            }
            "SETUP_LOOP" => {
                *env.shape.last_mut().expect("loop shape is never empty") += effect as i64;
                env.shape.push(0);
            }
            _ => {
                *env.shape.last_mut().expect("loop shape is never empty") += effect as i64;
            }
        }

        let recognized = matches!(
            instr.opname.as_str(),
            "LOAD_CONST" | "STORE_FAST" | "LOAD_FAST" | "CALL_FUNCTION"
        );
        if recognized {
            let old_len = env.stack.len();
            match instr.opname.as_str() {
                "LOAD_CONST" => {
                    let value = match &instr.argval {
                        Some(ArgVal::Const(c)) => N::alpha(c),
                        _ => N::NotNull,
                    };
                    env.stack.push(Tagged::from_instr(instr.offset, value));
                }
                "STORE_FAST" => {
                    let val = Self::pop(&mut env, instr, declared)?;
                    env.locals.insert(Self::arg(instr), val);
                }
                "LOAD_FAST" => {
                    let val = match env.locals.get(&Self::arg(instr)) {
                        Some(val) => val.clone(),
                        // unseen locals are treated as non-null.
                        None => Tagged::from_instr(instr.offset, N::NotNull),
                    };
                    env.stack.push(val);
                }
                "CALL_FUNCTION" => self.call_function(instr, &mut env)?,
                _ => unreachable!(),
            }
            let got = env.stack.len() as i32 - old_len as i32;
            if got != declared {
                return Err(AnalysisError::BytecodeInvariant {
                    offset: instr.offset,
                    block: 0,
                    declared,
                    got,
                });
            }
        } else if effect < 0 {
            for _ in 0..-effect {
                Self::pop(&mut env, instr, effect)?;
            }
        } else {
            for _ in 0..effect {
                env.stack.push(Tagged::from_instr(instr.offset, N::BOTTOM));
            }
        }

        Ok(env)
    }
}
