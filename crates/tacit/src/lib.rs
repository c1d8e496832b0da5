//! Tacit — an embeddable scripting language with cooperative, time-sliced
//! execution.
//!
//! Tacit compiles a small dynamically-typed language into three-address code
//! and runs it one instruction per step, so a host application stays in
//! control: drive the machine in bounded time slices, catch errors as
//! structured values, and exchange named values with the script's globals.
//!
//! # Features
//!
//! - **Single-pass compiler**: source goes straight to TAC with back-patched
//!   jumps; there is no AST.
//! - **Cooperative scheduling**: `run_until_done` honors a per-call time
//!   budget, and host intrinsics can park partial results to resume across
//!   steps (the `wait` intrinsic is built this way).
//! - **Prototype-based objects**: maps link to parents through `__isa`;
//!   the builtin types are themselves maps, so `"abc".len` and `len("abc")`
//!   are the same call.
//! - **Host intrinsics**: register native functions with named, defaulted
//!   parameters; scripts call them like any other function.
//! - **Interactive input**: the parser persists across chunks, so incomplete
//!   blocks and bracket-continued lines work REPL-style.
//!
//! # Quick start
//!
//! ```
//! use tacit::Interpreter;
//!
//! let mut interp = Interpreter::with_source(r#"
//! greet = function(name)
//! return "hello, " + name + "!"
//! end function
//! print greet("world")
//! "#);
//! interp.run_until_done(60.0, true);
//! assert_eq!(interp.take_output(), vec!["hello, world!"]);
//! ```
//!
//! # Registering an intrinsic
//!
//! ```
//! use tacit::{Interpreter, IntrinsicResult, IntrinsicSpec, Value};
//!
//! let mut interp = Interpreter::with_source("print double(21)");
//! interp.register_intrinsic(
//!     IntrinsicSpec::new("double").param("x", 0),
//!     |vm, _partial| {
//!         let x = vm.local("x").as_number().unwrap_or(0.0);
//!         Ok(IntrinsicResult::Done(Value::Number(x * 2.0)))
//!     },
//! );
//! interp.run_until_done(60.0, true);
//! assert_eq!(interp.take_output(), vec!["42"]);
//! ```
//!
//! # The language, briefly
//!
//! Numbers (64-bit floats, doubling as booleans), strings, lists, maps, and
//! functions. `if`/`else if`/`else`, `while`, `for ... in`, `break`,
//! `continue`. Blocks close with conjoined keywords (`end if`, `end while`,
//! `end for`, `end function`). Statements end at a newline or `;`. Negative
//! indexes count from the end of a sequence; `a.b` is sugar for `a["b"]`;
//! `@f` takes a function reference without calling it.

mod builtins;
mod compiler;
mod error;
mod interp;
mod intrinsic;
mod lexer;
mod methods;
mod operators;
mod tac;
mod value;
mod vm;

pub use compiler::Parser;
pub use error::{Error, ErrorInfo, Result, RuntimeError, RuntimeKind, SourceLoc};
pub use interp::{HostInfo, Interpreter};
pub use intrinsic::{Intrinsic, IntrinsicFn, IntrinsicRegistry, IntrinsicResult, IntrinsicSpec};
pub use lexer::{Lexer, Token, TokenKind};
pub use tac::{BinOp, CmpOp, Line, Op, UnaryOp};
pub use value::{AssignOverride, FuncDef, Param, SeqElemRef, Value, ValueMap};
pub use vm::{BuiltinTypes, Context, Machine, OutputSink};
