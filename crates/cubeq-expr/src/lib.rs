//! cubeq expressions - value language, evaluator and backend script compiler

pub mod ast;
mod constants;
mod eval;
mod filter_eval;
mod interval;
mod parser;
pub mod script;

pub use ast::*;
pub use constants::fold_constants;
pub use eval::{lookup_path, EvalError};
pub use filter_eval::FilterEvaluator;
pub use interval::Interval;
pub use parser::{parse, parse_with_constants, ParseError};
pub use script::{filter_script, value_script, Helper, ScriptCompiler, ScriptError};
