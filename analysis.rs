//! Abstract interpretation over the control-flow graph.
//!
//! The lattice kit lives here: the `AbstractValue` trait implemented once
//! per domain, the `Tagged` provenance wrapper, the pointwise stack, locals,
//! and globals domains, and the `Environment` tying them together.  The
//! round-based fixpoint engine (`solve`) iterates a `Dataflow` instance's
//! transfer function over the live blocks until nothing changes.

use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt::{Display, Formatter, Result as FmtResult};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::bytecode::{Cfg, Instr};
use crate::commons::{Valid, Validate, ValidationError};

pub mod nullability;

#[cfg(test)]
mod tests;

/// Provenance tags are instruction identities, i.e. offsets.
pub type Tag = u32;

// SECTION: errors

/// A fatal analysis failure.  Each aborts the `solve` of the routine under
/// analysis; one routine's failure never invalidates another's analysis.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum AnalysisError {
    #[display(fmt = "malformed cfg: jump from offset {} (block {}) misses a block head", offset, block)]
    MalformedCfg { offset: u32, block: usize },
    #[display(fmt = "stack shape mismatch at offset {} (block {}): lengths {} vs {}", offset, block, left, right)]
    StackShapeMismatch {
        offset: u32,
        block: usize,
        left: usize,
        right: usize,
    },
    #[display(fmt = "loop shape mismatch at offset {} (block {})", offset, block)]
    LoopShapeMismatch { offset: u32, block: usize },
    #[display(fmt = "stack effect violated at offset {} (block {}): declared {}, got {}", offset, block, declared, got)]
    BytecodeInvariant {
        offset: u32,
        block: usize,
        declared: i32,
        got: i32,
    },
}
impl std::error::Error for AnalysisError {}

impl AnalysisError {
    // errors surface the block index even when raised below the engine,
    // which patches it in here.
    fn in_block(mut self, b: usize) -> Self {
        match &mut self {
            AnalysisError::MalformedCfg { block, .. }
            | AnalysisError::StackShapeMismatch { block, .. }
            | AnalysisError::LoopShapeMismatch { block, .. }
            | AnalysisError::BytecodeInvariant { block, .. } => *block = b,
        }
        self
    }
}

impl From<crate::bytecode::cfg::CfgError> for AnalysisError {
    fn from(e: crate::bytecode::cfg::CfgError) -> Self {
        AnalysisError::MalformedCfg {
            offset: e.offset,
            block: e.block,
        }
    }
}

// A shape violation detected inside the domain operations, before the engine
// can say which block it belongs to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ShapeError {
    Stack { left: usize, right: usize },
    Loop,
}

impl ShapeError {
    fn at(self, offset: u32) -> AnalysisError {
        match self {
            ShapeError::Stack { left, right } => AnalysisError::StackShapeMismatch {
                offset,
                block: 0,
                left,
                right,
            },
            ShapeError::Loop => AnalysisError::LoopShapeMismatch { offset, block: 0 },
        }
    }
}

// SECTION: lattice kit

/// An abstract value from an abstract lattice.
///
/// Any abstract domain for a single value implements this.
pub trait AbstractValue: Clone + Display + Eq {
    /// The concrete values we're abstracting.
    type Concrete;

    /// The bottom value of the lattice.
    const BOTTOM: Self;

    /// The abstraction of a concrete value.
    fn alpha(val: &Self::Concrete) -> Self;

    /// The partial order: `self` is at most as high as `rhs`.
    fn leq(&self, rhs: &Self) -> bool;

    /// The least upper bound of two abstract values.
    fn join(&self, rhs: &Self) -> Self;

    /// The greatest lower bound of two abstract values.
    fn meet(&self, rhs: &Self) -> Self;
}

/// An abstract value plus the set of instructions whose results flowed into
/// it.  The tags are metadata: join and meet union them, but the partial
/// order looks at the value alone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tagged<A> {
    pub tags: Set<Tag>,
    pub value: A,
}

impl<A: AbstractValue> Tagged<A> {
    pub fn new(tags: Set<Tag>, value: A) -> Self {
        Tagged { tags, value }
    }

    // a value originating at a single instruction.
    pub fn from_instr(offset: Tag, value: A) -> Self {
        Tagged {
            tags: Set::from([offset]),
            value,
        }
    }

    pub fn bottom() -> Self {
        Tagged {
            tags: Set::new(),
            value: A::BOTTOM,
        }
    }

    pub fn leq(&self, rhs: &Self) -> bool {
        self.value.leq(&rhs.value)
    }

    pub fn join(&self, rhs: &Self) -> Self {
        Tagged {
            tags: self.tags.union(&rhs.tags).copied().collect(),
            value: self.value.join(&rhs.value),
        }
    }

    pub fn meet(&self, rhs: &Self) -> Self {
        Tagged {
            tags: self.tags.union(&rhs.tags).copied().collect(),
            value: self.value.meet(&rhs.value),
        }
    }
}

impl<A: AbstractValue> Display for Tagged<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{} (from {{", self.value)?;
        let len = self.tags.len();
        for (i, tag) in self.tags.iter().enumerate() {
            if i + 1 == len {
                write!(f, "{tag}")?;
            } else {
                write!(f, "{tag}, ")?;
            }
        }
        write!(f, "}})")
    }
}

/// The operand stack: an indexed sequence of tagged values.  Two stacks can
/// be combined only when they have the same length.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackDomain<A>(pub Vec<Tagged<A>>);

impl<A: AbstractValue> StackDomain<A> {
    pub fn new() -> Self {
        StackDomain(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, val: Tagged<A>) {
        self.0.push(val);
    }

    pub fn pop(&mut self) -> Option<Tagged<A>> {
        self.0.pop()
    }

    pub fn top(&self) -> Option<&Tagged<A>> {
        self.0.last()
    }

    fn zip_with(
        &self,
        rhs: &Self,
        f: impl Fn(&Tagged<A>, &Tagged<A>) -> Tagged<A>,
    ) -> Result<Self, ShapeError> {
        if self.len() != rhs.len() {
            return Err(ShapeError::Stack {
                left: self.len(),
                right: rhs.len(),
            });
        }
        Ok(StackDomain(
            self.0.iter().zip(&rhs.0).map(|(a, b)| f(a, b)).collect(),
        ))
    }

    pub fn join(&self, rhs: &Self) -> Result<Self, ShapeError> {
        self.zip_with(rhs, Tagged::join)
    }

    pub fn meet(&self, rhs: &Self) -> Result<Self, ShapeError> {
        self.zip_with(rhs, Tagged::meet)
    }

    pub fn leq(&self, rhs: &Self) -> Result<bool, ShapeError> {
        if self.len() != rhs.len() {
            return Err(ShapeError::Stack {
                left: self.len(),
                right: rhs.len(),
            });
        }
        Ok(self.0.iter().zip(&rhs.0).all(|(a, b)| a.leq(b)))
    }
}

impl<A: AbstractValue> Display for StackDomain<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "[")?;
        for (i, val) in self.0.iter().enumerate() {
            if i + 1 == self.0.len() {
                write!(f, "{val}")?;
            } else {
                write!(f, "{val}, ")?;
            }
        }
        write!(f, "]")
    }
}

/// A sparse pointwise map domain; used for both locals (keyed by slot) and
/// globals (keyed by name).  A key present on only one side is carried over
/// unchanged, in join and meet alike.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapDomain<K: Ord, A>(pub Map<K, Tagged<A>>);

pub type LocalsDomain<A> = MapDomain<u32, A>;
pub type GlobalsDomain<A> = MapDomain<String, A>;

impl<K: Ord + Clone, A: AbstractValue> MapDomain<K, A> {
    pub fn new() -> Self {
        MapDomain(Map::new())
    }

    pub fn get(&self, key: &K) -> Option<&Tagged<A>> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: K, val: Tagged<A>) {
        self.0.insert(key, val);
    }

    fn merge_with(&self, rhs: &Self, f: impl Fn(&Tagged<A>, &Tagged<A>) -> Tagged<A>) -> Self {
        let mut map = self.0.clone();
        for (k, rhs_val) in &rhs.0 {
            match map.get_mut(k) {
                Some(lhs_val) => *lhs_val = f(lhs_val, rhs_val),
                None => {
                    map.insert(k.clone(), rhs_val.clone());
                }
            }
        }
        MapDomain(map)
    }

    pub fn join(&self, rhs: &Self) -> Self {
        self.merge_with(rhs, Tagged::join)
    }

    pub fn meet(&self, rhs: &Self) -> Self {
        self.merge_with(rhs, Tagged::meet)
    }

    // keys missing from either side don't constrain the order.
    pub fn leq(&self, rhs: &Self) -> bool {
        self.0.iter().all(|(k, lhs_val)| match rhs.0.get(k) {
            Some(rhs_val) => lhs_val.leq(rhs_val),
            None => true,
        })
    }
}

impl<K: Ord + Display, A: AbstractValue> Display for MapDomain<K, A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{{")?;
        for (i, (key, val)) in self.0.iter().enumerate() {
            if i + 1 == self.0.len() {
                write!(f, "{key} -> {val}")?;
            } else {
                write!(f, "{key} -> {val}, ")?;
            }
        }
        write!(f, "}}")
    }
}

/// The loop-shape stack: operand-stack depth per active loop scope.
/// `SETUP_LOOP` pushes a fresh zero, `POP_BLOCK` pops the top, everything
/// else adds its stack effect to the top.  Never empty.
pub type LoopShape = Vec<i64>;

/// The full abstract state at a program point.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Environment<A: AbstractValue> {
    pub stack: StackDomain<A>,
    pub locals: LocalsDomain<A>,
    pub globals: GlobalsDomain<A>,
    pub shape: LoopShape,
}

impl<A: AbstractValue> Default for Environment<A> {
    fn default() -> Self {
        Environment {
            stack: StackDomain::new(),
            locals: LocalsDomain::new(),
            globals: GlobalsDomain::new(),
            shape: vec![0],
        }
    }
}

impl<A: AbstractValue> Environment<A> {
    // Loop shapes agree on their common prefix or the join is refused; the
    // merged shape is that prefix.
    fn merge_shape(&self, rhs: &Self) -> Result<LoopShape, ShapeError> {
        let m = self.shape.len().min(rhs.shape.len());
        if self.shape[..m] != rhs.shape[..m] {
            return Err(ShapeError::Loop);
        }
        Ok(self.shape[..m].to_vec())
    }

    pub fn join(&self, rhs: &Self) -> Result<Self, ShapeError> {
        Ok(Environment {
            stack: self.stack.join(&rhs.stack)?,
            locals: self.locals.join(&rhs.locals),
            globals: self.globals.join(&rhs.globals),
            shape: self.merge_shape(rhs)?,
        })
    }

    pub fn meet(&self, rhs: &Self) -> Result<Self, ShapeError> {
        Ok(Environment {
            stack: self.stack.meet(&rhs.stack)?,
            locals: self.locals.meet(&rhs.locals),
            globals: self.globals.meet(&rhs.globals),
            shape: self.merge_shape(rhs)?,
        })
    }

    pub fn leq(&self, rhs: &Self) -> Result<bool, ShapeError> {
        Ok(self.stack.leq(&rhs.stack)?
            && self.locals.leq(&rhs.locals)
            && self.globals.leq(&rhs.globals))
    }
}

impl<A: AbstractValue> Display for Environment<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "<{}; {}; {}>", self.stack, self.locals, self.globals)
    }
}

// SECTION: routine metadata

/// A type annotation as the host reports it.  Classification into the
/// nullability domain happens in `nullability::classify`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Annotation {
    /// The null type itself.
    NoneType,
    Name(String),
    Optional(Box<Annotation>),
    Union(Vec<Annotation>),
    /// An annotation the host could not express; classified conservatively
    /// and reported as a diagnostic.
    Unknown(String),
}

/// The return signature of a globally visible routine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Signature {
    pub returns: Option<Annotation>,
}

/// What a global name is bound to: an annotated routine, or something the
/// analysis has no use for.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Global {
    Routine(Signature),
    Opaque,
}

/// The read-only global scope shared by all routine analyses.
pub type Globals = Map<String, Global>;

/// An annotated routine: the unit of analysis.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Routine {
    pub name: String,
    /// Parameter names in order; slot i holds parameter i at entry.
    pub params: Vec<String>,
    /// Parameter annotations, optionally including the key "return".
    pub annotations: Map<String, Annotation>,
    pub code: Vec<Instr>,
}

impl Validate for Routine {
    // Offsets must strictly increase, parameter names must be unique, and
    // every opcode that requires an immediate must have one.  The transfer
    // function indexes immediates directly on the strength of this check.
    fn validate(self) -> Result<Valid<Self>, ValidationError> {
        use crate::bytecode::opcodes;

        for pair in self.code.windows(2) {
            if pair[0].offset >= pair[1].offset {
                return Err(ValidationError(format!(
                    "routine {}: offsets do not increase at {}",
                    self.name, pair[1].offset
                )));
            }
        }
        for instr in &self.code {
            let required = opcodes::by_code(instr.opcode).is_some_and(|op| op.has_arg);
            if required && instr.arg.is_none() {
                return Err(ValidationError(format!(
                    "routine {}: `{}` at offset {} is missing its argument",
                    self.name, instr.opname, instr.offset
                )));
            }
        }
        let unique: Set<&String> = self.params.iter().collect();
        if unique.len() != self.params.len() {
            return Err(ValidationError(format!(
                "routine {}: duplicate parameter names",
                self.name
            )));
        }
        Ok(Valid(self))
    }
}

// SECTION: analysis state

/// The per-routine analysis state: before/after environments keyed by
/// instruction offset and one environment per CFG edge.  Absent entries
/// are bottom.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct State<A: AbstractValue> {
    pub before: Map<Tag, Environment<A>>,
    pub after: Map<Tag, Environment<A>>,
    pub edges: Map<(usize, usize), Environment<A>>,
}

impl<A: AbstractValue> State<A> {
    pub fn new() -> Self {
        State {
            before: Map::new(),
            after: Map::new(),
            edges: Map::new(),
        }
    }
}

impl<A: AbstractValue> Default for State<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// A solved analysis: the fixpoint state plus the joined abstract value of
/// the routine's result over all live return sites.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Solution<A: AbstractValue> {
    pub state: State<A>,
    pub summary: Tagged<A>,
}

// SECTION: intraprocedural dataflow analysis framework

/// An analysis instance over a fixed routine: it knows the entry environment
/// induced by the signature and how each instruction transforms an
/// environment.  The transfer function must be monotone in the
/// non-provenance component and must never mutate its argument.
pub trait Dataflow {
    type Value: AbstractValue;

    /// The environment on entry to block 0.
    fn entry_env(&self) -> Environment<Self::Value>;

    /// The per-instruction transfer function; returns a fresh environment.
    fn transfer(
        &self,
        instr: &Instr,
        env: &Environment<Self::Value>,
    ) -> Result<Environment<Self::Value>, AnalysisError>;
}

/// Iterate rounds over the live blocks of `cfg` until fixpoint and report
/// the per-instruction and per-edge environments plus the return summary.
pub fn solve<D: Dataflow>(dfa: &D, cfg: &Cfg) -> Result<Solution<D::Value>, AnalysisError> {
    let mut state = State::new();
    if let Some(block) = cfg.blocks.first() {
        state.before.insert(block[0].offset, dfa.entry_env());
    }

    let mut changed = true;
    while changed {
        changed = round(dfa, cfg, &mut state)?;
    }

    // the summary joins the top of stack at every live return site; the
    // vacuous join is bottom.
    let summary = cfg
        .returns
        .iter()
        .filter_map(|ret| state.before.get(ret))
        .filter_map(|env| env.stack.top())
        .fold(Tagged::bottom(), |acc, top| acc.join(top));

    Ok(Solution { state, summary })
}

// One round: every live block in index order.  Returns whether any before
// or after environment changed.
fn round<D: Dataflow>(dfa: &D, cfg: &Cfg, state: &mut State<D::Value>) -> Result<bool, AnalysisError> {
    let mut changed = false;

    for (i, block) in cfg.live_blocks() {
        let first = block[0].offset;

        // the incoming environment: the join over all non-bottom
        // predecessor edges, or what we already know about the block head.
        let preds = cfg.reverse_edges.get(&i);
        let incoming: Vec<&Environment<D::Value>> = preds
            .map(|ps| ps.iter().filter_map(|p| state.edges.get(&(*p, i))).collect())
            .unwrap_or_default();

        let join = if incoming.is_empty() {
            if preds.is_some_and(|ps| !ps.is_empty()) && !state.before.contains_key(&first) {
                // reachable only through edges that carry nothing yet; the
                // round that populates one of them reports a change, so we
                // will be back.
                continue;
            }
            state.before.get(&first).cloned().unwrap_or_default()
        } else {
            let mut acc = incoming[0].clone();
            for env in &incoming[1..] {
                acc = acc.join(env).map_err(|e| e.at(first).in_block(i))?;
            }
            acc
        };

        if state.before.get(&first) != Some(&join) {
            changed = true;
            state.before.insert(first, join.clone());
        }

        // propagate through the block.
        let mut env = join;
        for instr in block {
            state.before.insert(instr.offset, env.clone());
            let after = dfa.transfer(instr, &env).map_err(|e| e.in_block(i))?;
            if state.after.get(&instr.offset) != Some(&after) {
                changed = true;
            }
            state.after.insert(instr.offset, after.clone());
            env = after;
        }

        // the block's final environment flows out along every edge.
        if let Some(succs) = cfg.edges.get(&i) {
            for j in succs {
                state.edges.insert((i, *j), env.clone());
            }
        }
    }

    Ok(changed)
}
