//! Three-address-code instruction set and compiled line representation.
//!
//! This module defines the opcodes the compiler produces and the machine
//! executes. A [`Line`] names at most one destination and two source
//! operands; operands are [`Value`]s and may be variable, temporary, or
//! sequence-element references that the machine resolves lazily against the
//! current context.

use std::fmt;

use crate::error::SourceLoc;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Operator enums
// ---------------------------------------------------------------------------

/// Binary operators. Arithmetic ops delegate to
/// [`crate::operators::apply_binop`]; `Isa` needs the machine's builtin type
/// maps and is handled in the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Plus,
    Minus,
    Times,
    DividedBy,
    Mod,
    Power,
    /// Fuzzy conjunction: `clamp01(|a| * |b|)`.
    And,
    /// Fuzzy disjunction: `clamp01(|a| + |b| - |a|*|b|)`.
    Or,
    Isa,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Plus => "+",
            BinOp::Minus => "-",
            BinOp::Times => "*",
            BinOp::DividedBy => "/",
            BinOp::Mod => "%",
            BinOp::Power => "^",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Isa => "isa",
        }
    }
}

/// Comparison operators. `Equal`/`NotEqual` produce the fuzzy equality score;
/// the ordering comparisons produce a strict 0 or 1 (or a *TypeMismatch* for
/// incomparable operands).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Equal,
    NotEqual,
    Greater,
    GreatOrEqual,
    Lesser,
    LessOrEqual,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Equal => "==",
            CmpOp::NotEqual => "!=",
            CmpOp::Greater => ">",
            CmpOp::GreatOrEqual => ">=",
            CmpOp::Lesser => "<",
            CmpOp::LessOrEqual => "<=",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation: `-x`.
    Minus,
    /// Fuzzy negation: `1 - clamp01(|x|)`.
    Not,
}

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// One TAC opcode.
///
/// Conventions: `lhs` is the destination (a variable, temp, or sequence
/// element reference), `rhsA`/`rhsB` the sources. Jump targets live in `rhsA`
/// as line numbers; forward jumps are emitted with `rhsA = None` and
/// back-patched by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Noop,

    /// `lhs = rhsA`. If `rhsA` is a non-`@` variable or element reference
    /// that resolves to a function, the machine begins a zero-argument call
    /// whose result lands in `lhs` instead.
    Assign,

    /// Like `Assign`, but the destination is the implicit result `_`,
    /// honored only when the machine's store-implicit flag is set.
    AssignImplicit,

    /// `lhs = rhsA <op> rhsB`.
    Binary(BinOp),

    /// `lhs = rhsA <cmp> rhsB`, producing a number in [0, 1].
    Compare(CmpOp),

    /// `lhs = <op> rhsA`.
    Unary(UnaryOp),

    /// Resolve a literal list or map operand into a fresh container.
    ///
    /// List and map literals are compiled as container values whose elements
    /// may still be temp/variable references; `Copy` re-evaluates them so a
    /// literal inside a loop yields a new container on every pass.
    Copy,

    /// `lhs = {"__isa": rhsA}` — the `new` operator. `rhsA` must be a map.
    New,

    /// `lhs = element count of rhsA` (string chars, list items, map entries).
    Length,

    /// `lhs = rhsA[rhsB]`, with auto-invocation of function results (the
    /// dot-method path). `@`-flagged element reads compile to `Assign` with a
    /// sequence-element operand instead.
    ElemLoad,

    /// `lhs = i-th element of rhsA in iteration order` where `i = rhsB`.
    /// Lists yield elements, strings characters, maps `{"key": k,
    /// "value": v}` mini-maps. Used by `for` loop lowering.
    ElemIter,

    /// Store `rhsA` into the sequence element named by `lhs`. Consults the
    /// map's assign-override hook before writing.
    ElemStore,

    /// Push `rhsA` onto the current context's argument stack.
    PushParam,

    /// `lhs = call rhsA with rhsB arguments` popped from the arg stack.
    /// A sequence-element callee supplies the implicit `self` receiver.
    CallFunction,

    /// Invoke the registered intrinsic `rhsA` (by id) with the current
    /// context and any parked partial result. This is the single-line body
    /// of every intrinsic wrapper function.
    CallIntrinsic,

    /// Unconditional jump to line `rhsA`.
    Goto,

    /// Jump to `rhsA` when `rhsB` is truthy (nonzero).
    GotoIfB,

    /// Jump to `rhsA` when `rhsB` is falsy.
    GotoIfNotB,

    /// Jump to `rhsA` only when `rhsB` is strictly true (fuzzy values below
    /// 1 do not jump). Backbone of short-circuit `or`.
    GotoIfTrulyB,

    /// Copy temp slot 0 into the caller's designated result slot and pop the
    /// context. On the root context, jumps past the end instead.
    Return,

    /// `lhs = rhsA` where `rhsA` is a function literal: capture the current
    /// context's variables as the function's outer scope at this point.
    BindAssign,
}

// ---------------------------------------------------------------------------
// Lines
// ---------------------------------------------------------------------------

/// One compiled TAC line: `(lhs, op, rhsA, rhsB)` plus source location.
#[derive(Debug, Clone)]
pub struct Line {
    pub lhs: Option<Value>,
    pub op: Op,
    pub rhs_a: Option<Value>,
    pub rhs_b: Option<Value>,
    pub location: SourceLoc,
}

impl Line {
    pub fn new(
        lhs: Option<Value>,
        op: Op,
        rhs_a: Option<Value>,
        rhs_b: Option<Value>,
        location: SourceLoc,
    ) -> Self {
        Self {
            lhs,
            op,
            rhs_a,
            rhs_b,
            location,
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lhs = self.lhs.as_ref().map(|v| v.code_form(2));
        let a = self.rhs_a.as_ref().map(|v| v.code_form(2));
        let b = self.rhs_b.as_ref().map(|v| v.code_form(2));
        let dash = "_".to_string();
        let lhs = lhs.as_ref().unwrap_or(&dash);
        let a = a.as_ref().unwrap_or(&dash);
        let b = b.as_ref().unwrap_or(&dash);
        match self.op {
            Op::Noop => write!(f, "noop"),
            Op::Assign => write!(f, "{} := {}", lhs, a),
            Op::AssignImplicit => write!(f, "_ := {}", a),
            Op::Binary(op) => write!(f, "{} := {} {} {}", lhs, a, op.symbol(), b),
            Op::Compare(op) => write!(f, "{} := {} {} {}", lhs, a, op.symbol(), b),
            Op::Unary(UnaryOp::Minus) => write!(f, "{} := -{}", lhs, a),
            Op::Unary(UnaryOp::Not) => write!(f, "{} := not {}", lhs, a),
            Op::Copy => write!(f, "{} := copy {}", lhs, a),
            Op::New => write!(f, "{} := new {}", lhs, a),
            Op::Length => write!(f, "{} := len({})", lhs, a),
            Op::ElemLoad => write!(f, "{} := {}[{}]", lhs, a, b),
            Op::ElemIter => write!(f, "{} := {} iter {}", lhs, a, b),
            Op::ElemStore => write!(f, "{} := {}", lhs, a),
            Op::PushParam => write!(f, "push {}", a),
            Op::CallFunction => write!(f, "{} := call {} ({} args)", lhs, a, b),
            Op::CallIntrinsic => write!(f, "{} := intrinsic {}", lhs, a),
            Op::Goto => write!(f, "goto {}", a),
            Op::GotoIfB => write!(f, "goto {} if {}", a, b),
            Op::GotoIfNotB => write!(f, "goto {} if not {}", a, b),
            Op::GotoIfTrulyB => write!(f, "goto {} if truly {}", a, b),
            Op::Return => write!(f, "return"),
            Op::BindAssign => write!(f, "{} := bind {}", lhs, a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceLoc;

    #[test]
    fn test_line_display() {
        let loc = SourceLoc::new("test", 1);
        let line = Line::new(
            Some(Value::Temp(2)),
            Op::Binary(BinOp::Plus),
            Some(Value::Var("x".into(), false)),
            Some(Value::Number(1.0)),
            loc,
        );
        assert_eq!(line.to_string(), "_2 := x + 1");
    }
}
