//! Binary, comparison, and unary operator evaluation on values.
//!
//! These are stateless helpers used by the machine's opcode dispatch. The
//! `isa` operator is the one binary op not handled here, since it needs the
//! machine's builtin type maps.

use crate::error::{Error, Result};
use crate::tac::{BinOp, CmpOp, UnaryOp};
use crate::value::{MAX_LIST_SIZE, MAX_STRING_SIZE, RECURSION_DEPTH, Value, format_number};

fn clamp01(x: f64) -> f64 {
    x.abs().clamp(0.0, 1.0)
}

fn type_error(op: &str, left: &Value, right: &Value) -> Error {
    Error::type_mismatch(format!(
        "Type Error: '{}' not defined for {} and {}",
        op,
        left.type_name(),
        right.type_name()
    ))
}

/// Apply a binary operator to two resolved values.
///
/// Beyond plain arithmetic this covers the sequence forms: string
/// concatenation (`"a" + x` stringifies x), string and list repetition by a
/// possibly fractional factor, list concatenation, and map merging.
pub fn apply_binop(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinOp::Plus => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::Str(a), _) => {
                let b = match right {
                    Value::Str(b) => b.to_string(),
                    Value::Number(n) => format_number(*n),
                    Value::Null => String::new(),
                    _ => return Err(type_error("+", left, right)),
                };
                if a.len() + b.len() > MAX_STRING_SIZE {
                    return Err(Error::limit_exceeded("string too large"));
                }
                Ok(Value::from(format!("{}{}", a, b)))
            }
            (Value::List(a), Value::List(b)) => {
                let mut out = a.borrow().clone();
                out.extend(b.borrow().iter().cloned());
                if out.len() > MAX_LIST_SIZE {
                    return Err(Error::limit_exceeded("list too large"));
                }
                Ok(Value::list(out))
            }
            (Value::Map(a), Value::Map(b)) => {
                let mut out = a.borrow().clone();
                for (k, v) in b.borrow().iter() {
                    out.insert(k.clone(), v.clone());
                }
                Ok(Value::map(out))
            }
            _ => Err(type_error("+", left, right)),
        },

        BinOp::Minus => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a - b)),
            _ => Err(type_error("-", left, right)),
        },

        BinOp::Times => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a * b)),
            (Value::Str(s), Value::Number(n)) => repeat_string(s, *n),
            (Value::List(l), Value::Number(n)) => repeat_list(&l.borrow(), *n),
            _ => Err(type_error("*", left, right)),
        },

        BinOp::DividedBy => match (left, right) {
            // IEEE semantics: division by zero yields an infinity, not an error
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a / b)),
            (Value::Str(s), Value::Number(n)) => repeat_string(s, 1.0 / n),
            (Value::List(l), Value::Number(n)) => repeat_list(&l.borrow(), 1.0 / n),
            _ => Err(type_error("/", left, right)),
        },

        BinOp::Mod => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a % b)),
            _ => Err(type_error("%", left, right)),
        },

        BinOp::Power => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a.powf(*b))),
            _ => Err(type_error("^", left, right)),
        },

        // Fuzzy logic: numbers participate with their clamped magnitude, so
        // `0.3 and 0.5` is 0.15 and `0.3 or 0.5` is 0.65.
        BinOp::And => {
            let (a, b) = (clamp01(left.bool_value()), clamp01(right.bool_value()));
            Ok(Value::Number(a * b))
        }
        BinOp::Or => {
            let (a, b) = (clamp01(left.bool_value()), clamp01(right.bool_value()));
            Ok(Value::Number(a + b - a * b))
        }

        BinOp::Isa => unreachable!("isa is dispatched by the machine"),
    }
}

fn repeat_string(s: &str, factor: f64) -> Result<Value> {
    if !factor.is_finite() || factor <= 0.0 {
        return Ok(Value::from(""));
    }
    let chars: Vec<char> = s.chars().collect();
    let total = (chars.len() as f64 * factor).floor() as usize;
    if total > MAX_STRING_SIZE {
        return Err(Error::limit_exceeded("string too large"));
    }
    let mut out = String::with_capacity(total);
    for i in 0..total {
        out.push(chars[i % chars.len()]);
    }
    Ok(Value::from(out))
}

fn repeat_list(items: &[Value], factor: f64) -> Result<Value> {
    if !factor.is_finite() || factor <= 0.0 || items.is_empty() {
        return Ok(Value::list(Vec::new()));
    }
    let total = (items.len() as f64 * factor).floor() as usize;
    if total > MAX_LIST_SIZE {
        return Err(Error::limit_exceeded("list too large"));
    }
    let mut out = Vec::with_capacity(total);
    for i in 0..total {
        out.push(items[i % items.len()].clone());
    }
    Ok(Value::list(out))
}

/// Apply a comparison operator, producing a number in [0, 1].
///
/// Equality is the fuzzy equality score (deeply cyclic containers bottom out
/// at 0.5); the ordering comparisons are defined for number/number and
/// string/string pairs only.
pub fn apply_cmpop(op: CmpOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        CmpOp::Equal => Ok(Value::Number(left.equality(right, RECURSION_DEPTH))),
        CmpOp::NotEqual => Ok(Value::Number(1.0 - left.equality(right, RECURSION_DEPTH))),
        _ => {
            let ordered = match (left, right) {
                (Value::Number(a), Value::Number(b)) => match op {
                    CmpOp::Greater => a > b,
                    CmpOp::GreatOrEqual => a >= b,
                    CmpOp::Lesser => a < b,
                    CmpOp::LessOrEqual => a <= b,
                    _ => unreachable!(),
                },
                (Value::Str(a), Value::Str(b)) => match op {
                    CmpOp::Greater => a > b,
                    CmpOp::GreatOrEqual => a >= b,
                    CmpOp::Lesser => a < b,
                    CmpOp::LessOrEqual => a <= b,
                    _ => unreachable!(),
                },
                _ => return Err(type_error(op.symbol(), left, right)),
            };
            Ok(Value::from(ordered))
        }
    }
}

/// Apply a unary operator.
pub fn apply_unaryop(op: UnaryOp, operand: &Value) -> Result<Value> {
    match op {
        UnaryOp::Minus => match operand {
            Value::Number(n) => Ok(Value::Number(-n)),
            _ => Err(Error::type_mismatch(format!(
                "Type Error: unary '-' not defined for {}",
                operand.type_name()
            ))),
        },
        UnaryOp::Not => Ok(Value::Number(1.0 - clamp01(operand.bool_value()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueMap;

    #[test]
    fn test_arithmetic() {
        let v = apply_binop(BinOp::Plus, &Value::Number(40.0), &Value::Number(2.0)).unwrap();
        assert_eq!(v, Value::Number(42.0));
        let v = apply_binop(BinOp::Power, &Value::Number(2.0), &Value::Number(8.0)).unwrap();
        assert_eq!(v, Value::Number(256.0));
        let v = apply_binop(BinOp::Mod, &Value::Number(10.0), &Value::Number(3.0)).unwrap();
        assert_eq!(v, Value::Number(1.0));
    }

    #[test]
    fn test_string_concat_stringifies_rhs() {
        let v = apply_binop(BinOp::Plus, &Value::from("n="), &Value::Number(3.0)).unwrap();
        assert_eq!(v, Value::from("n=3"));
        assert!(apply_binop(BinOp::Plus, &Value::Number(3.0), &Value::from("x")).is_err());
    }

    #[test]
    fn test_fractional_repetition() {
        let v = apply_binop(BinOp::Times, &Value::from("abc"), &Value::Number(2.5)).unwrap();
        assert_eq!(v, Value::from("abcabca"));
        let v = apply_binop(BinOp::DividedBy, &Value::from("hello"), &Value::Number(2.0)).unwrap();
        assert_eq!(v, Value::from("he"));
        let v = apply_binop(BinOp::Times, &Value::from("x"), &Value::Number(-1.0)).unwrap();
        assert_eq!(v, Value::from(""));
    }

    #[test]
    fn test_list_ops() {
        let a = Value::list(vec![Value::Number(1.0)]);
        let b = Value::list(vec![Value::Number(2.0)]);
        let v = apply_binop(BinOp::Plus, &a, &b).unwrap();
        assert_eq!(v, Value::list(vec![Value::Number(1.0), Value::Number(2.0)]));
        let v = apply_binop(BinOp::Times, &a, &Value::Number(3.0)).unwrap();
        assert_eq!(v.as_list().unwrap().borrow().len(), 3);
    }

    #[test]
    fn test_map_merge() {
        let mut a = ValueMap::new();
        a.insert_str("x", Value::one());
        let mut b = ValueMap::new();
        b.insert_str("y", Value::Number(2.0));
        let v = apply_binop(BinOp::Plus, &Value::map(a), &Value::map(b)).unwrap();
        let m = v.as_map().unwrap().borrow();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get_str("y"), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_fuzzy_logic() {
        let v = apply_binop(BinOp::And, &Value::Number(0.5), &Value::Number(0.5)).unwrap();
        assert_eq!(v, Value::Number(0.25));
        let v = apply_binop(BinOp::Or, &Value::Number(0.5), &Value::Number(0.5)).unwrap();
        assert_eq!(v, Value::Number(0.75));
        let v = apply_unaryop(UnaryOp::Not, &Value::Number(0.25)).unwrap();
        assert_eq!(v, Value::Number(0.75));
        let v = apply_unaryop(UnaryOp::Not, &Value::from("truthy")).unwrap();
        assert_eq!(v, Value::Number(0.0));
    }

    #[test]
    fn test_comparisons() {
        let v = apply_cmpop(CmpOp::Lesser, &Value::Number(1.0), &Value::Number(2.0)).unwrap();
        assert_eq!(v, Value::Number(1.0));
        let v = apply_cmpop(CmpOp::Greater, &Value::from("b"), &Value::from("a")).unwrap();
        assert_eq!(v, Value::Number(1.0));
        assert!(apply_cmpop(CmpOp::Lesser, &Value::Number(1.0), &Value::from("a")).is_err());
        let v = apply_cmpop(CmpOp::NotEqual, &Value::Number(1.0), &Value::Number(1.0)).unwrap();
        assert_eq!(v, Value::Number(0.0));
    }

    #[test]
    fn test_division_by_zero_is_infinite() {
        let v = apply_binop(BinOp::DividedBy, &Value::Number(1.0), &Value::Number(0.0)).unwrap();
        assert_eq!(v.as_number().unwrap(), f64::INFINITY);
    }
}
