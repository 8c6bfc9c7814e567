//! Quince language front end
//!
//! This crate contains the surface-syntax half of the pipeline: the lexer,
//! the AST, and a recursive-descent parser with Pratt-style expression
//! parsing. Everything downstream (bytecode compiler, VM) lives in
//! `quince-vm`.

pub mod ast;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::Program;
pub use error::SyntaxError;
pub use lexer::Lexer;
pub use parser::Parser;

/// Parse a complete source text into a program.
pub fn parse(source: &str) -> Result<Program, SyntaxError> {
    let lexer = Lexer::new(source);
    let mut parser = Parser::new(lexer)?;
    parser.parse_program()
}
