pub mod cfg;
pub mod instr;
pub mod opcodes;
pub mod parser;

pub use cfg::Cfg;
pub use instr::{ArgVal, Constant, Instr};
