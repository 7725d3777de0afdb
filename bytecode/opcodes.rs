//! The decoder's static opcode knowledge: numeric codes, the stack-effect
//! oracle, and the jump/goto/return classification the CFG builder needs.
//!
//! The table covers the CPython-3.6-era subset this checker recognizes plus
//! enough generic opcodes to express real routine bodies; everything else is
//! rejected by the listing parser up front.

/// How an opcode's jump target, if any, is encoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JumpKind {
    None,
    Absolute,
    Relative,
}

#[derive(Clone, Copy, Debug)]
pub struct OpInfo {
    pub name: &'static str,
    pub code: u8,
    pub jump: JumpKind,
    // unconditional transfer to the jump target (no fall-through edge).
    pub goto: bool,
    // returns from the routine.
    pub ret: bool,
    pub has_arg: bool,
    // net stack delta; CALL_FUNCTION is handled separately since its delta
    // depends on the immediate argument.
    effect: i32,
}

use JumpKind::{Absolute, Relative};
use JumpKind::None as NoJump;

#[rustfmt::skip]
const TABLE: &[OpInfo] = &[
    OpInfo { name: "POP_TOP",           code:   1, jump: NoJump,   goto: false, ret: false, has_arg: false, effect: -1 },
    OpInfo { name: "ROT_TWO",           code:   2, jump: NoJump,   goto: false, ret: false, has_arg: false, effect:  0 },
    OpInfo { name: "DUP_TOP",           code:   4, jump: NoJump,   goto: false, ret: false, has_arg: false, effect:  1 },
    OpInfo { name: "UNARY_NOT",         code:  12, jump: NoJump,   goto: false, ret: false, has_arg: false, effect:  0 },
    OpInfo { name: "BINARY_ADD",        code:  23, jump: NoJump,   goto: false, ret: false, has_arg: false, effect: -1 },
    OpInfo { name: "BINARY_SUBTRACT",   code:  24, jump: NoJump,   goto: false, ret: false, has_arg: false, effect: -1 },
    OpInfo { name: "GET_ITER",          code:  68, jump: NoJump,   goto: false, ret: false, has_arg: false, effect:  0 },
    OpInfo { name: "RETURN_VALUE",      code:  83, jump: NoJump,   goto: false, ret: true,  has_arg: false, effect: -1 },
    OpInfo { name: "POP_BLOCK",         code:  87, jump: NoJump,   goto: false, ret: false, has_arg: false, effect:  0 },
    OpInfo { name: "FOR_ITER",          code:  93, jump: Relative, goto: false, ret: false, has_arg: true,  effect:  1 },
    OpInfo { name: "LOAD_CONST",        code: 100, jump: NoJump,   goto: false, ret: false, has_arg: true,  effect:  1 },
    OpInfo { name: "LOAD_ATTR",         code: 106, jump: NoJump,   goto: false, ret: false, has_arg: true,  effect:  0 },
    OpInfo { name: "COMPARE_OP",        code: 107, jump: NoJump,   goto: false, ret: false, has_arg: true,  effect: -1 },
    OpInfo { name: "JUMP_FORWARD",      code: 110, jump: Relative, goto: true,  ret: false, has_arg: true,  effect:  0 },
    OpInfo { name: "JUMP_ABSOLUTE",     code: 113, jump: Absolute, goto: true,  ret: false, has_arg: true,  effect:  0 },
    OpInfo { name: "POP_JUMP_IF_FALSE", code: 114, jump: Absolute, goto: false, ret: false, has_arg: true,  effect: -1 },
    OpInfo { name: "POP_JUMP_IF_TRUE",  code: 115, jump: Absolute, goto: false, ret: false, has_arg: true,  effect: -1 },
    OpInfo { name: "LOAD_GLOBAL",       code: 116, jump: NoJump,   goto: false, ret: false, has_arg: true,  effect:  1 },
    OpInfo { name: "SETUP_LOOP",        code: 120, jump: Relative, goto: false, ret: false, has_arg: true,  effect:  0 },
    OpInfo { name: "LOAD_FAST",         code: 124, jump: NoJump,   goto: false, ret: false, has_arg: true,  effect:  1 },
    OpInfo { name: "STORE_FAST",        code: 125, jump: NoJump,   goto: false, ret: false, has_arg: true,  effect: -1 },
    OpInfo { name: "CALL_FUNCTION",     code: 131, jump: NoJump,   goto: false, ret: false, has_arg: true,  effect:  0 },
];

pub fn by_name(name: &str) -> Option<&'static OpInfo> {
    TABLE.iter().find(|op| op.name == name)
}

pub fn by_code(code: u8) -> Option<&'static OpInfo> {
    TABLE.iter().find(|op| op.code == code)
}

/// The net operand-stack delta of `opcode` given its immediate argument.
/// Unknown opcodes are conservatively reported as having no effect.
pub fn stack_effect(opcode: u8, arg: Option<u32>) -> i32 {
    match by_code(opcode) {
        Some(op) if op.name == "CALL_FUNCTION" => -(arg.unwrap_or(0) as i32),
        Some(op) => op.effect,
        None => 0,
    }
}

pub fn is_jump(opcode: u8) -> bool {
    by_code(opcode).is_some_and(|op| op.jump != NoJump)
}

pub fn is_goto(opcode: u8) -> bool {
    by_code(opcode).is_some_and(|op| op.goto)
}

pub fn is_return(opcode: u8) -> bool {
    by_code(opcode).is_some_and(|op| op.ret)
}

// a branch ends a basic block: any jump or a return.
pub fn is_branch(opcode: u8) -> bool {
    is_jump(opcode) || is_return(opcode)
}
