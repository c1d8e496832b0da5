//! Structured errors for the lexer, compiler, and virtual machine.
//!
//! Every error carries a message and an optional [`SourceLoc`]. The machine
//! fills in the location of the executing instruction when a runtime error
//! surfaces without one, so hosts always see `Kind Error: message
//! [context line N]` regardless of where the error was raised.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

/// A (context name, line number) pair attached to compiled instructions and
/// to errors. The context name is usually a chunk or file name; the REPL uses
/// its own context name for interactively entered code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub context: Rc<str>,
    pub line: u32,
}

impl SourceLoc {
    pub fn new(context: impl Into<Rc<str>>, line: u32) -> Self {
        Self {
            context: context.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} line {}]", self.context, self.line)
    }
}

/// Message plus optional location, shared by the lexer and compiler variants.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub message: String,
    pub location: Option<SourceLoc>,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(loc) = &self.location {
            write!(f, " {}", loc)?;
        }
        Ok(())
    }
}

/// The runtime error subkinds of §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    UndefinedIdentifier,
    KeyNotFound,
    IndexOutOfRange,
    TypeMismatch,
    TooManyArguments,
    LimitExceeded,
}

/// A runtime error: subkind, message, optional location.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: RuntimeKind,
    pub message: String,
    pub location: Option<SourceLoc>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(loc) = &self.location {
            write!(f, " {}", loc)?;
        }
        Ok(())
    }
}

/// The error taxonomy: one variant per pipeline stage.
///
/// User script cannot catch these; the interpreter façade reports them to the
/// error sink and skips the remainder of the offending call frame.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Lexer Error: {0}")]
    Lexer(ErrorInfo),

    #[error("Compiler Error: {0}")]
    Compiler(ErrorInfo),

    #[error("Runtime Error: {0}")]
    Runtime(RuntimeError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn lexer(message: impl Into<String>) -> Self {
        Error::Lexer(ErrorInfo {
            message: message.into(),
            location: None,
        })
    }

    pub fn compiler(message: impl Into<String>) -> Self {
        Error::Compiler(ErrorInfo {
            message: message.into(),
            location: None,
        })
    }

    pub fn runtime(kind: RuntimeKind, message: impl Into<String>) -> Self {
        Error::Runtime(RuntimeError {
            kind,
            message: message.into(),
            location: None,
        })
    }

    pub fn undefined_identifier(name: &str) -> Self {
        Self::runtime(
            RuntimeKind::UndefinedIdentifier,
            format!("Undefined Identifier: '{}' is unknown in this context", name),
        )
    }

    pub fn key_not_found(key: &str) -> Self {
        Self::runtime(
            RuntimeKind::KeyNotFound,
            format!("Key Not Found: '{}' not found in map", key),
        )
    }

    pub fn index_out_of_range(index: f64) -> Self {
        Self::runtime(
            RuntimeKind::IndexOutOfRange,
            format!("Index Error (index {} out of range)", index),
        )
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeKind::TypeMismatch, message)
    }

    pub fn too_many_arguments() -> Self {
        Self::runtime(RuntimeKind::TooManyArguments, "Too Many Arguments")
    }

    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::runtime(RuntimeKind::LimitExceeded, message)
    }

    /// Attach a location if the error does not already carry one.
    pub fn with_location(mut self, loc: SourceLoc) -> Self {
        let slot = match &mut self {
            Error::Lexer(info) | Error::Compiler(info) => &mut info.location,
            Error::Runtime(err) => &mut err.location,
        };
        if slot.is_none() {
            *slot = Some(loc);
        }
        self
    }

    pub fn location(&self) -> Option<&SourceLoc> {
        match self {
            Error::Lexer(info) | Error::Compiler(info) => info.location.as_ref(),
            Error::Runtime(err) => err.location.as_ref(),
        }
    }

    /// The runtime subkind, if this is a runtime error.
    pub fn runtime_kind(&self) -> Option<RuntimeKind> {
        match self {
            Error::Runtime(err) => Some(err.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_location() {
        let err = Error::undefined_identifier("foo")
            .with_location(SourceLoc::new("script", 12));
        assert_eq!(
            err.to_string(),
            "Runtime Error: Undefined Identifier: 'foo' is unknown in this context [script line 12]"
        );
    }

    #[test]
    fn test_with_location_does_not_overwrite() {
        let err = Error::compiler("bad token")
            .with_location(SourceLoc::new("a", 1))
            .with_location(SourceLoc::new("b", 2));
        assert_eq!(err.location().unwrap().line, 1);
    }

    #[test]
    fn test_runtime_kind() {
        assert_eq!(
            Error::too_many_arguments().runtime_kind(),
            Some(RuntimeKind::TooManyArguments)
        );
        assert_eq!(Error::lexer("x").runtime_kind(), None);
    }
}
