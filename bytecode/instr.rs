//! The instruction records consumed from the decoder.

use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

/// A primitive constant appearing as an immediate argument.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Display for Constant {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Constant::None => write!(f, "None"),
            Constant::Bool(true) => write!(f, "True"),
            Constant::Bool(false) => write!(f, "False"),
            Constant::Int(n) => write!(f, "{n}"),
            Constant::Str(s) => write!(f, "'{s}'"),
        }
    }
}

/// The decoded immediate argument of an instruction.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ArgVal {
    Const(Constant),
    Name(String),
    Target(u32),
}

impl Display for ArgVal {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ArgVal::Const(c) => c.fmt(f),
            ArgVal::Name(n) => write!(f, "{n}"),
            ArgVal::Target(t) => write!(f, "to {t}"),
        }
    }
}

/// One decoded instruction.  Identity within a routine is `offset`; the
/// analysis keys all of its maps by offset and keeps the full records off to
/// the side.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Instr {
    pub offset: u32,
    pub opname: String,
    pub opcode: u8,
    pub arg: Option<u32>,
    pub argval: Option<ArgVal>,
    pub is_jump_target: bool,
}

impl Instr {
    // the resolved jump target, if this instruction has one.
    pub fn target(&self) -> Option<u32> {
        match self.argval {
            Some(ArgVal::Target(t)) => Some(t),
            _ => None,
        }
    }
}

impl Display for Instr {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let marker = if self.is_jump_target { ">>" } else { "  " };
        write!(f, "{marker} {:>4} {:<20}", self.offset, self.opname)?;
        if let Some(arg) = self.arg {
            write!(f, " {arg:>3}")?;
            if let Some(argval) = &self.argval {
                write!(f, " ({argval})")?;
            }
        }
        Ok(())
    }
}
