// General analysis tests: the lattice kit, the engine invariants, and the
// end-to-end nullability scenarios.

use pretty_assertions::assert_eq;

use super::nullability::{analyze, classify, Env, Nullability, NullabilityAnalysis};
use super::*;
use crate::bytecode::cfg;
use crate::bytecode::opcodes;
use crate::bytecode::parser::parse;

use Nullability::{NotNull, Nullable};

// SECTION: helpers

fn routine(
    name: &str,
    params: &[&str],
    annotations: &[(&str, Annotation)],
    listing: &str,
) -> Valid<Routine> {
    Routine {
        name: name.to_string(),
        params: params.iter().map(|p| p.to_string()).collect(),
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        code: parse(listing).unwrap(),
    }
    .validate()
    .unwrap()
}

fn optional(name: &str) -> Annotation {
    Annotation::Optional(Box::new(Annotation::Name(name.to_string())))
}

// a global scope with one routine `g` whose declared return is nullable.
fn globals_with_nullable_g() -> Globals {
    Map::from([(
        "g".to_string(),
        Global::Routine(Signature {
            returns: Some(optional("int")),
        }),
    )])
}

fn solved(routine: &Valid<Routine>, globals: &Globals) -> Solution<Nullability> {
    let solution = analyze(routine, globals).unwrap();
    check_invariants(routine, globals, &solution);
    solution
}

// The fixpoint invariants, checked on a finished solution:
// - the before of each block head is the join of its incoming edges;
// - after = transfer(before) for every live instruction;
// - the stack delta of every live instruction matches the declared effect
//   (POP_BLOCK excepted);
// - dead blocks have no assigned environments;
// - the summary is the join over the live return sites.
fn check_invariants(
    routine: &Valid<Routine>,
    globals: &Globals,
    solution: &Solution<Nullability>,
) {
    let cfg = cfg::build(&routine.0.code).unwrap();
    let dfa = NullabilityAnalysis::new(routine, globals);
    let state = &solution.state;

    for (i, block) in cfg.live_blocks() {
        if let Some(preds) = cfg.reverse_edges.get(&i) {
            let incoming: Vec<&Env> = preds
                .iter()
                .filter_map(|p| state.edges.get(&(*p, i)))
                .collect();
            if let Some((head, rest)) = incoming.split_first() {
                let join = rest
                    .iter()
                    .fold((*head).clone(), |acc, env| acc.join(env).unwrap());
                assert_eq!(state.before[&block[0].offset], join);
            }
        }

        let mut env = state.before[&block[0].offset].clone();
        for instr in block {
            assert_eq!(state.before[&instr.offset], env);
            let after = dfa.transfer(instr, &env).unwrap();
            assert_eq!(state.after[&instr.offset], after);
            if instr.opname != "POP_BLOCK" {
                assert_eq!(
                    after.stack.len() as i32 - env.stack.len() as i32,
                    opcodes::stack_effect(instr.opcode, instr.arg),
                    "stack balance at offset {}",
                    instr.offset
                );
            }
            env = after;
        }
    }

    for i in &cfg.dead_nodes {
        for instr in &cfg.blocks[*i] {
            assert!(!state.before.contains_key(&instr.offset));
            assert!(!state.after.contains_key(&instr.offset));
        }
    }

    let expected = cfg
        .returns
        .iter()
        .filter_map(|ret| state.before.get(ret))
        .filter_map(|env| env.stack.top())
        .fold(Tagged::bottom(), |acc, top| acc.join(top));
    assert_eq!(solution.summary, expected);
}

// SECTION: lattice kit

#[test]
fn nullability_lattice_tables() {
    assert_eq!(NotNull.join(&Nullable), Nullable);
    assert_eq!(NotNull.join(&NotNull), NotNull);
    assert_eq!(Nullable.meet(&Nullable), Nullable);
    assert_eq!(Nullable.meet(&NotNull), NotNull);
    // the order is non-strict: every element is below itself.
    assert!(NotNull.leq(&NotNull));
    assert!(NotNull.leq(&Nullable));
    assert!(Nullable.leq(&Nullable));
    assert!(!Nullable.leq(&NotNull));
    assert_eq!(Nullability::BOTTOM, NotNull);
}

#[test]
fn tagged_ops_union_tags_but_order_ignores_them() {
    let a = Tagged::from_instr(0, NotNull);
    let b = Tagged::from_instr(4, Nullable);
    let joined = a.join(&b);
    assert_eq!(joined.tags, Set::from([0, 4]));
    assert_eq!(joined.value, Nullable);
    let met = a.meet(&b);
    assert_eq!(met.tags, Set::from([0, 4]));
    assert_eq!(met.value, NotNull);
    // provenance is metadata: a ⊑ b despite disjoint tags.
    assert!(a.leq(&b));
}

#[test]
fn locals_carry_one_sided_keys_in_join_and_meet() {
    let mut left: LocalsDomain<Nullability> = LocalsDomain::new();
    left.insert(0, Tagged::from_instr(0, Nullable));
    let mut right: LocalsDomain<Nullability> = LocalsDomain::new();
    right.insert(1, Tagged::from_instr(2, NotNull));

    for merged in [left.join(&right), left.meet(&right)] {
        assert_eq!(merged.get(&0), Some(&Tagged::from_instr(0, Nullable)));
        assert_eq!(merged.get(&1), Some(&Tagged::from_instr(2, NotNull)));
    }
}

#[test]
fn stack_join_requires_matching_lengths() {
    let mut left: StackDomain<Nullability> = StackDomain::new();
    left.push(Tagged::from_instr(0, NotNull));
    let right: StackDomain<Nullability> = StackDomain::new();
    assert_eq!(
        left.join(&right),
        Err(ShapeError::Stack { left: 1, right: 0 })
    );
}

#[test]
fn environment_join_checks_loop_shape_prefix() {
    let mut left: Env = Environment::default();
    left.shape = vec![1];
    left.stack.push(Tagged::from_instr(0, NotNull));
    let mut right: Env = Environment::default();
    right.shape = vec![0, 1];
    right.stack.push(Tagged::from_instr(2, NotNull));

    assert_eq!(left.join(&right), Err(ShapeError::Loop));

    // agreeing prefixes merge down to the common prefix.
    right.shape = vec![1, 0];
    assert_eq!(left.join(&right).unwrap().shape, vec![1]);
}

#[test]
fn transfer_is_monotone_on_the_value_component() {
    let routine = routine(
        "f",
        &["x"],
        &[],
        "0 LOAD_FAST 0 (x)\n\
         2 RETURN_VALUE\n",
    );
    let globals = Globals::new();
    let dfa = NullabilityAnalysis::new(&routine, &globals);

    let mut low: Env = Environment::default();
    low.locals.insert(0, Tagged::new(Set::new(), NotNull));
    let mut high: Env = Environment::default();
    high.locals.insert(0, Tagged::new(Set::new(), Nullable));
    assert!(low.leq(&high).unwrap());

    let instr = &routine.0.code[0];
    let low_out = dfa.transfer(instr, &low).unwrap();
    let high_out = dfa.transfer(instr, &high).unwrap();
    assert!(low_out.leq(&high_out).unwrap());
}

// SECTION: annotation classification

#[test]
fn classifies_annotations() {
    assert_eq!(classify(Some(&Annotation::NoneType)), Nullable);
    assert_eq!(classify(Some(&optional("int"))), Nullable);
    assert_eq!(
        classify(Some(&Annotation::Union(vec![
            Annotation::Name("int".to_string()),
            Annotation::NoneType,
        ]))),
        Nullable
    );
    assert_eq!(
        classify(Some(&Annotation::Union(vec![
            Annotation::Name("int".to_string()),
            Annotation::Name("str".to_string()),
        ]))),
        NotNull
    );
    assert_eq!(classify(Some(&Annotation::Name("int".to_string()))), NotNull);
    assert_eq!(classify(None), NotNull);
    assert_eq!(
        classify(Some(&Annotation::Unknown("T | weird".to_string()))),
        NotNull
    );
}

#[test]
fn unknown_annotations_are_diagnosed_not_fatal() {
    let routine = routine(
        "f",
        &["x"],
        &[("x", Annotation::Unknown("T | weird".to_string()))],
        "0 LOAD_FAST 0 (x)\n\
         2 RETURN_VALUE\n",
    );
    let globals = Globals::new();
    let dfa = NullabilityAnalysis::new(&routine, &globals);
    assert_eq!(dfa.diagnostics.len(), 1);
    assert!(dfa.diagnostics[0].contains("x"));
    assert_eq!(solved(&routine, &globals).summary.value, NotNull);
}

// SECTION: end-to-end scenarios

#[test]
fn s1_identity_on_nullable_parameter() {
    let routine = routine(
        "f",
        &["x"],
        &[("x", optional("T")), ("return", optional("T"))],
        "0 LOAD_FAST 0 (x)\n\
         2 RETURN_VALUE\n",
    );
    assert_eq!(solved(&routine, &Globals::new()).summary.value, Nullable);
}

#[test]
fn s2_identity_on_nonnull_parameter() {
    let routine = routine(
        "f",
        &["x"],
        &[("x", Annotation::Name("int".to_string()))],
        "0 LOAD_FAST 0 (x)\n\
         2 RETURN_VALUE\n",
    );
    assert_eq!(solved(&routine, &Globals::new()).summary.value, NotNull);
}

#[test]
fn s3_constant_returns() {
    let none = routine(
        "f",
        &[],
        &[],
        "0 LOAD_CONST 0 (None)\n\
         2 RETURN_VALUE\n",
    );
    let solution = solved(&none, &Globals::new());
    assert_eq!(solution.summary.value, Nullable);
    assert_eq!(solution.summary.tags, Set::from([0]));

    let one = routine(
        "f",
        &[],
        &[],
        "0 LOAD_CONST 0 (1)\n\
         2 RETURN_VALUE\n",
    );
    assert_eq!(solved(&one, &Globals::new()).summary.value, NotNull);
}

#[test]
fn s4_conditional_result_joins_both_branches() {
    // 1 if x.foo() else None
    let routine = routine(
        "f",
        &["x"],
        &[("x", Annotation::Name("int".to_string()))],
        " 0 LOAD_FAST 0 (x)\n\
          2 LOAD_ATTR 0 (foo)\n\
          4 CALL_FUNCTION 0\n\
          6 POP_JUMP_IF_FALSE 12\n\
          8 LOAD_CONST 1 (1)\n\
         10 RETURN_VALUE\n\
         12 LOAD_CONST 0 (None)\n\
         14 RETURN_VALUE\n",
    );
    let solution = solved(&routine, &Globals::new());
    assert_eq!(solution.summary.value, Nullable);
    // provenance: the constant pushes at both return sites.
    assert_eq!(solution.summary.tags, Set::from([8, 12]));
}

#[test]
fn s5_call_propagates_declared_return_annotation() {
    let listing = "0 LOAD_GLOBAL 0 (g)\n\
                   2 LOAD_FAST 0 (x)\n\
                   4 CALL_FUNCTION 1\n\
                   6 RETURN_VALUE\n";
    let r = routine(
        "f",
        &["x"],
        &[("x", Annotation::Name("int".to_string()))],
        listing,
    );
    assert_eq!(
        solved(&r, &globals_with_nullable_g()).summary.value,
        Nullable
    );
    // no evidence about the callee means non-null.
    assert_eq!(solved(&r, &Globals::new()).summary.value, NotNull);
}

#[test]
fn s6_loop_preserves_carried_local() {
    // for y in xs: z = g(y)
    // return z
    let routine = routine(
        "f",
        &["xs"],
        &[("xs", Annotation::Name("list".to_string()))],
        "  0 SETUP_LOOP 20 (to 22)\n\
           2 LOAD_FAST 0 (xs)\n\
           4 GET_ITER\n\
        >> 6 FOR_ITER 12 (to 20)\n\
           8 STORE_FAST 1 (y)\n\
          10 LOAD_GLOBAL 0 (g)\n\
          12 LOAD_FAST 1 (y)\n\
          14 CALL_FUNCTION 1\n\
          16 STORE_FAST 2 (z)\n\
          18 JUMP_ABSOLUTE 6\n\
        >>20 POP_BLOCK\n\
        >>22 LOAD_FAST 2 (z)\n\
          24 RETURN_VALUE\n",
    );
    let solution = solved(&routine, &globals_with_nullable_g());
    assert_eq!(solution.summary.value, Nullable);
    // the carried value's provenance points at the call.
    assert!(solution.summary.tags.contains(&14));
}

#[test]
fn routine_without_returns_summarizes_to_bottom() {
    let routine = routine("f", &[], &[], "");
    let solution = solved(&routine, &Globals::new());
    assert_eq!(solution.summary, Tagged::bottom());
}

// SECTION: failure modes

#[test]
fn mismatched_stack_depths_fail_the_join() {
    let routine = routine(
        "f",
        &[],
        &[],
        "0 LOAD_CONST 0 (1)\n\
         2 LOAD_CONST 1 (2)\n\
         4 POP_JUMP_IF_FALSE 8\n\
         6 LOAD_CONST 2 (3)\n\
         8 RETURN_VALUE\n",
    );
    let err = analyze(&routine, &Globals::new()).unwrap_err();
    assert_eq!(
        err,
        AnalysisError::StackShapeMismatch {
            offset: 8,
            block: 2,
            left: 1,
            right: 2,
        }
    );
}

#[test]
fn stack_underflow_is_a_bytecode_invariant_failure() {
    let routine = routine(
        "f",
        &[],
        &[],
        "0 POP_TOP\n\
         2 LOAD_CONST 0 (None)\n\
         4 RETURN_VALUE\n",
    );
    let err = analyze(&routine, &Globals::new()).unwrap_err();
    assert!(matches!(
        err,
        AnalysisError::BytecodeInvariant { offset: 0, .. }
    ));
}

#[test]
fn pop_block_outside_a_loop_is_rejected() {
    let routine = routine(
        "f",
        &[],
        &[],
        "0 POP_BLOCK\n\
         2 LOAD_CONST 0 (None)\n\
         4 RETURN_VALUE\n",
    );
    let err = analyze(&routine, &Globals::new()).unwrap_err();
    assert_eq!(
        err,
        AnalysisError::LoopShapeMismatch {
            offset: 0,
            block: 0
        }
    );
}

#[test]
fn malformed_jump_targets_abort_the_analysis() {
    let routine = routine(
        "f",
        &[],
        &[],
        "0 JUMP_ABSOLUTE 3\n\
         2 RETURN_VALUE\n",
    );
    let err = analyze(&routine, &Globals::new()).unwrap_err();
    assert!(matches!(err, AnalysisError::MalformedCfg { offset: 0, .. }));
}

// SECTION: validation

#[test]
fn validation_rejects_broken_routines() {
    let decreasing = Routine {
        name: "f".to_string(),
        params: vec![],
        annotations: Map::new(),
        code: parse(
            "4 LOAD_CONST 0 (None)\n\
             2 RETURN_VALUE\n",
        )
        .unwrap(),
    };
    assert!(decreasing.validate().is_err());

    let duplicate_params = Routine {
        name: "f".to_string(),
        params: vec!["x".to_string(), "x".to_string()],
        annotations: Map::new(),
        code: vec![],
    };
    assert!(duplicate_params.validate().is_err());

    let mut missing_arg = Routine {
        name: "f".to_string(),
        params: vec![],
        annotations: Map::new(),
        code: parse("0 LOAD_CONST 0 (None)\n").unwrap(),
    };
    missing_arg.code[0].arg = None;
    assert!(missing_arg.validate().is_err());
}
