// parser for dis-style instruction listings.
//
// One instruction per line:
//
//     >>   12 LOAD_CONST   0 (None)
//
// The leading `>>` marker is optional (jump targets are recomputed from the
// resolved jump edges anyway), `arg` is the raw immediate, and the
// parenthesized part is the decoded argval: a constant (`None`, `True`,
// `False`, an integer, a `'string'`), a name, or an explicit `to N` jump
// target.  Relative jump targets written as raw immediates are resolved to
// absolute offsets here, so the CFG builder only ever sees `to` offsets.

use derive_more::Display;
use logos::Logos;

use super::instr::{ArgVal, Constant, Instr};
use super::opcodes;
use super::opcodes::JumpKind;

// SECTION: interface

pub fn parse(listing: &str) -> Result<Vec<Instr>, ParseError> {
    let mut instrs = Vec::new();
    for (lineno, line) in listing.lines().enumerate() {
        let tokens = lex(line).map_err(|e| e.at_line(lineno + 1))?;
        if tokens.is_empty() {
            continue;
        }
        let instr = instr_r(&mut Parser::new(line, tokens)).map_err(|e| e.at_line(lineno + 1))?;
        instrs.push(instr);
    }
    resolve_jumps(&mut instrs);
    Ok(instrs)
}

// A parse error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ParseError(pub String);
impl std::error::Error for ParseError {}

impl ParseError {
    fn at_line(self, lineno: usize) -> Self {
        ParseError(format!("line {lineno}: {}", self.0))
    }
}

// SECTION: lexer

#[derive(Logos, Clone, Copy, Debug, Eq, PartialEq)]
#[logos(skip r"[ \t]+")]
#[logos(skip r"#[^\n]*")]
enum TokenKind {
    #[token(">>")]
    Marker,
    #[regex(r"-?[0-9]+")]
    Int,
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,
    #[regex(r"'[^']*'")]
    Str,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    text: String,
}

fn lex(line: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = TokenKind::lexer(line);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        match result {
            Ok(kind) => tokens.push(Token {
                kind,
                text: lexer.slice().to_string(),
            }),
            Err(()) => {
                return Err(ParseError(format!("unexpected character `{}`", lexer.slice())))
            }
        }
    }
    Ok(tokens)
}

// SECTION: parser functionality

#[derive(Clone, Debug)]
struct Parser<'a> {
    line: &'a str,      // the line being parsed, for error messages
    tokens: Vec<Token>, // the token stream
    pos: usize,         // the position in the token stream
}

// utility functions for traversing the token stream and creating error
// messages.
impl<'a> Parser<'a> {
    fn new(line: &'a str, tokens: Vec<Token>) -> Self {
        Parser {
            line,
            tokens,
            pos: 0,
        }
    }

    // if the next token has the given kind advances the iterator and returns
    // its text, otherwise returns None.
    fn eat(&mut self, kind: TokenKind) -> Option<String> {
        match self.tokens.get(self.pos) {
            Some(tok) if tok.kind == kind => {
                self.pos += 1;
                Some(tok.text.clone())
            }
            _ => None,
        }
    }

    // returns an Ok or Err result depending on whether the next token has the
    // given kind, advancing the iterator on an Ok result.
    fn expect(&mut self, kind: TokenKind) -> Result<String, ParseError> {
        self.eat(kind)
            .ok_or_else(|| ParseError(format!("expected {kind:?} in `{}`", self.line)))
    }

    fn peek(&self) -> Option<TokenKind> {
        self.tokens.get(self.pos).map(|tok| tok.kind)
    }

    fn end(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

// [>>] offset OPNAME [arg [( argval )]]
fn instr_r(parser: &mut Parser) -> Result<Instr, ParseError> {
    let marked = parser.eat(TokenKind::Marker).is_some();
    let offset = int_r(&parser.expect(TokenKind::Int)?)?;
    let opname = parser.expect(TokenKind::Ident)?;
    let op = opcodes::by_name(&opname)
        .ok_or_else(|| ParseError(format!("unknown opcode `{opname}`")))?;

    let arg = match parser.eat(TokenKind::Int) {
        Some(text) => Some(int_r(&text)?),
        None => None,
    };
    let argval = if parser.eat(TokenKind::LParen).is_some() {
        let argval = argval_r(parser)?;
        parser.expect(TokenKind::RParen)?;
        Some(argval)
    } else {
        None
    };
    if !parser.end() {
        return Err(ParseError(format!("trailing tokens in `{}`", parser.line)));
    }
    if op.has_arg && arg.is_none() {
        return Err(ParseError(format!("`{opname}` requires an immediate argument")));
    }
    if !op.has_arg && arg.is_some() {
        return Err(ParseError(format!("`{opname}` takes no immediate argument")));
    }

    Ok(Instr {
        offset,
        opname,
        opcode: op.code,
        arg,
        argval,
        is_jump_target: marked,
    })
}

// None | True | False | int | 'str' | to int | name
fn argval_r(parser: &mut Parser) -> Result<ArgVal, ParseError> {
    match parser.peek() {
        Some(TokenKind::Int) => {
            let text = parser.expect(TokenKind::Int)?;
            Ok(ArgVal::Const(Constant::Int(int_r(&text)?)))
        }
        Some(TokenKind::Str) => {
            let text = parser.expect(TokenKind::Str)?;
            Ok(ArgVal::Const(Constant::Str(
                text.trim_matches('\'').to_string(),
            )))
        }
        Some(TokenKind::Ident) => {
            let word = parser.expect(TokenKind::Ident)?;
            match word.as_str() {
                "None" => Ok(ArgVal::Const(Constant::None)),
                "True" => Ok(ArgVal::Const(Constant::Bool(true))),
                "False" => Ok(ArgVal::Const(Constant::Bool(false))),
                "to" => {
                    let target = parser.expect(TokenKind::Int)?;
                    Ok(ArgVal::Target(int_r(&target)?))
                }
                _ => Ok(ArgVal::Name(word)),
            }
        }
        _ => Err(ParseError(format!("expected argval in `{}`", parser.line))),
    }
}

fn int_r<T: std::str::FromStr>(text: &str) -> Result<T, ParseError> {
    text.parse::<T>()
        .map_err(|_| ParseError(format!("bad integer `{text}`")))
}

// SECTION: jump resolution

// Fill in `ArgVal::Target` for every jump instruction that was written with a
// raw immediate (absolute jumps carry the target offset directly, relative
// jumps the delta from the following instruction), then mark every targeted
// offset as a jump target.
fn resolve_jumps(instrs: &mut [Instr]) {
    let mut targets = Vec::new();
    for instr in instrs.iter_mut() {
        let op = opcodes::by_code(instr.opcode).expect("parsed from the opcode table");
        let target = match (op.jump, &instr.argval) {
            (JumpKind::None, _) => continue,
            (_, Some(ArgVal::Target(t))) => *t,
            (JumpKind::Absolute, _) => instr.arg.expect("jumps carry an argument"),
            (JumpKind::Relative, _) => {
                // wordcode: every instruction is two bytes.
                instr.offset + 2 + instr.arg.expect("jumps carry an argument")
            }
        };
        instr.argval = Some(ArgVal::Target(target));
        targets.push(target);
    }
    for instr in instrs.iter_mut() {
        if targets.contains(&instr.offset) {
            instr.is_jump_target = true;
        }
    }
}
