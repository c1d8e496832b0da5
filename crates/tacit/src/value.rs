//! The tagged universe of runtime values.
//!
//! A [`Value`] is either a concrete datum (null, number, string, list, map,
//! function) or a *reference* produced by the compiler as a TAC operand
//! (variable, temporary, sequence element). References never exist at rest in
//! user data; the machine resolves them against the current context.
//!
//! Containers have reference semantics: cloning a `Value::List` or
//! `Value::Map` clones the handle, not the contents. Cyclic maps are legal,
//! so every recursive operation here (rendering, hashing, equality) takes a
//! depth budget and degrades gracefully when it runs out.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHasher;

use crate::error::{Error, Result};
use crate::tac::Line;

/// Maximum string length, in characters.
pub const MAX_STRING_SIZE: usize = 0x00FF_FFFF;
/// Maximum list length, in elements.
pub const MAX_LIST_SIZE: usize = 0x00FF_FFFF;
/// Maximum number of `__isa` hops when walking a prototype chain.
pub const MAX_ISA_DEPTH: usize = 1000;
/// Default recursion budget for rendering, hashing, and equality.
pub const RECURSION_DEPTH: usize = 16;
/// The magic key that links a map to its prototype.
pub const ISA_KEY: &str = "__isa";

/// Assignment-override hook on a map. Returns true when the write was
/// handled and the map entry should not be touched. Consulted before any
/// prototype walk. The hook must not mutate the map it is installed on.
pub type AssignOverride = Rc<dyn Fn(&Value, &Value) -> bool>;

/// One parameter of a function: name plus declared default.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: Rc<str>,
    pub default: Value,
}

impl Param {
    pub fn new(name: impl Into<Rc<str>>, default: Value) -> Self {
        Self {
            name: name.into(),
            default,
        }
    }
}

/// A compiled function body: parameter list plus code block.
///
/// The code list is shared (`Rc<RefCell<...>>`) because the parser fills it
/// in after the function value has already been created, and because function
/// equality is identity of this code object.
#[derive(Debug)]
pub struct FuncDef {
    pub params: Vec<Param>,
    pub code: Rc<RefCell<Vec<Line>>>,
}

impl FuncDef {
    pub fn new(params: Vec<Param>) -> Self {
        Self {
            params,
            code: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

/// An `a[b]` / `a.b` handle: sequence expression, index expression, and the
/// no-invoke flag set by the `@` address-of form.
#[derive(Debug, Clone)]
pub struct SeqElemRef {
    pub seq: Value,
    pub index: Value,
    pub no_invoke: bool,
}

/// A runtime value (or compiler-produced reference).
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    /// 64-bit float; also the boolean type (0 false, nonzero true).
    Number(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<ValueMap>>),
    /// Function definition plus the outer scope captured at bind time.
    Function(Rc<FuncDef>, Option<Rc<RefCell<ValueMap>>>),
    /// Identifier reference; the bool is the no-invoke flag.
    Var(Rc<str>, bool),
    /// Context-local temporary slot; slot 0 holds a function's return value.
    Temp(u32),
    SeqElem(Box<SeqElemRef>),
}

impl Value {
    pub fn zero() -> Value {
        Value::Number(0.0)
    }

    pub fn one() -> Value {
        Value::Number(1.0)
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn map(map: ValueMap) -> Value {
        Value::Map(Rc::new(RefCell::new(map)))
    }

    pub fn seq_elem(seq: Value, index: Value, no_invoke: bool) -> Value {
        Value::SeqElem(Box::new(SeqElemRef {
            seq,
            index,
            no_invoke,
        }))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Function(..) => "function",
            Value::Var(..) | Value::Temp(_) | Value::SeqElem(_) => "reference",
        }
    }

    /// True for the compiler-produced reference variants.
    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Var(..) | Value::Temp(_) | Value::SeqElem(_))
    }

    /// Boolean coercion, as a number so that fuzzy logic can pass through.
    /// Numbers return themselves; everything else returns exactly 0 or 1.
    pub fn bool_value(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Number(n) => *n,
            Value::Str(s) => {
                if s.is_empty() {
                    0.0
                } else {
                    1.0
                }
            }
            Value::List(l) => {
                if l.borrow().is_empty() {
                    0.0
                } else {
                    1.0
                }
            }
            Value::Map(m) => {
                if m.borrow().is_empty() {
                    0.0
                } else {
                    1.0
                }
            }
            Value::Function(..) => 1.0,
            Value::Var(..) | Value::Temp(_) | Value::SeqElem(_) => 0.0,
        }
    }

    pub fn is_truthy(&self) -> bool {
        self.bool_value() != 0.0
    }

    /// Strictly true: the abs-clamped boolean value reaches 1. Fuzzy values
    /// in (0, 1) are truthy but not *truly* true; `GotoAifTrulyB` and the
    /// short-circuit forms of `and`/`or` use this.
    pub fn is_truly(&self) -> bool {
        self.bool_value().abs() >= 1.0
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Rc<RefCell<Vec<Value>>>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Rc<RefCell<ValueMap>>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Identity comparison: pointer equality for containers and functions,
    /// exact value equality for scalars. Used by `isa` and the prototype
    /// walk, where structural equality would be wrong.
    pub fn ref_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a, _), Value::Function(b, _)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Equality score in [0, 1].
    ///
    /// Scalars compare exactly (0 or 1). Containers compare element-wise,
    /// spending one unit of `depth` per level; when the budget runs out the
    /// comparison bottoms out at the fuzzy midpoint 0.5. Functions compare
    /// by identity of their code object.
    pub fn equality(&self, other: &Value, depth: usize) -> f64 {
        match (self, other) {
            (Value::Null, Value::Null) => 1.0,
            (Value::Number(a), Value::Number(b)) => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            (Value::Str(a), Value::Str(b)) => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return 1.0;
                }
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return 0.0;
                }
                if depth == 0 {
                    return 0.5;
                }
                let mut score: f64 = 1.0;
                for (x, y) in a.iter().zip(b.iter()) {
                    score = score.min(x.equality(y, depth - 1));
                    if score == 0.0 {
                        break;
                    }
                }
                score
            }
            (Value::Map(a), Value::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return 1.0;
                }
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return 0.0;
                }
                if depth == 0 {
                    return 0.5;
                }
                let mut score: f64 = 1.0;
                for (k, v) in a.iter() {
                    match b.get(k) {
                        Some(bv) => score = score.min(v.equality(&bv, depth - 1)),
                        None => return 0.0,
                    }
                    if score == 0.0 {
                        break;
                    }
                }
                score
            }
            (Value::Function(a, _), Value::Function(b, _)) => {
                if Rc::ptr_eq(a, b) {
                    1.0
                } else {
                    0.0
                }
            }
            // Reference variants only meet inside unresolved literals.
            (Value::Var(a, af), Value::Var(b, bf)) => {
                if a == b && af == bf {
                    1.0
                } else {
                    0.0
                }
            }
            (Value::Temp(a), Value::Temp(b)) => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Feed this value into a hasher, consistent with [`Value::equality`].
    ///
    /// Containers at depth 0 hash by element count only; map entry hashes
    /// combine order-independently because map equality ignores entry order.
    pub fn hash_value<H: Hasher>(&self, state: &mut H, depth: usize) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Number(n) => {
                state.write_u8(1);
                let n = if *n == 0.0 { 0.0 } else { *n };
                state.write_u64(n.to_bits());
            }
            Value::Str(s) => {
                state.write_u8(2);
                s.hash(state);
            }
            Value::List(l) => {
                state.write_u8(3);
                let l = l.borrow();
                state.write_usize(l.len());
                if depth > 0 {
                    for item in l.iter() {
                        item.hash_value(state, depth - 1);
                    }
                }
            }
            Value::Map(m) => {
                state.write_u8(4);
                let m = m.borrow();
                state.write_usize(m.len());
                if depth > 0 {
                    let mut acc: u64 = 0;
                    for (k, v) in m.iter() {
                        let mut h = FxHasher::default();
                        k.hash_value(&mut h, depth - 1);
                        v.hash_value(&mut h, depth - 1);
                        acc = acc.wrapping_add(h.finish());
                    }
                    state.write_u64(acc);
                }
            }
            Value::Function(def, _) => {
                state.write_u8(5);
                state.write_usize(Rc::as_ptr(def) as usize);
            }
            Value::Var(name, _) => {
                state.write_u8(6);
                name.hash(state);
            }
            Value::Temp(n) => {
                state.write_u8(7);
                state.write_u32(*n);
            }
            Value::SeqElem(_) => state.write_u8(8),
        }
    }

    /// Three-way ordering used by sort intrinsics: values order by type rank
    /// first (null, number, string, list, map, function), then numerically or
    /// lexicographically within numbers and strings. Other same-rank pairs
    /// compare equal, which keeps stable sorts stable.
    pub fn compare(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Number(_) => 1,
                Value::Str(_) => 2,
                Value::List(_) => 3,
                Value::Map(_) => 4,
                Value::Function(..) => 5,
                _ => 6,
            }
        }
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }

    /// Render for user output (`print`): strings appear without quotes at the
    /// top level, but quoted inside containers.
    pub fn to_display_string(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, RECURSION_DEPTH, false);
        out
    }

    /// Render as source text that reconstructs the value, within the given
    /// recursion budget. Containers past the budget render as `[...]`/`{...}`.
    pub fn code_form(&self, depth: usize) -> String {
        let mut out = String::new();
        self.render(&mut out, depth, true);
        out
    }

    fn render(&self, out: &mut String, depth: usize, quote: bool) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Number(n) => out.push_str(&format_number(*n)),
            Value::Str(s) => {
                if quote {
                    out.push('"');
                    out.push_str(&s.replace('"', "\"\""));
                    out.push('"');
                } else {
                    out.push_str(s);
                }
            }
            Value::List(l) => {
                if depth == 0 {
                    out.push_str("[...]");
                    return;
                }
                out.push('[');
                for (i, item) in l.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render(out, depth - 1, true);
                }
                out.push(']');
            }
            Value::Map(m) => {
                if depth == 0 {
                    out.push_str("{...}");
                    return;
                }
                out.push('{');
                for (i, (k, v)) in m.borrow().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.render(out, depth - 1, true);
                    out.push_str(": ");
                    v.render(out, depth - 1, true);
                }
                out.push('}');
            }
            Value::Function(def, _) => {
                out.push_str("FUNCTION(");
                for (i, p) in def.params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&p.name);
                    if !matches!(p.default, Value::Null) {
                        out.push('=');
                        p.default.render(out, depth.saturating_sub(1), true);
                    }
                }
                out.push(')');
            }
            Value::Var(name, no_invoke) => {
                if *no_invoke {
                    out.push('@');
                }
                out.push_str(name);
            }
            Value::Temp(n) => {
                out.push('_');
                out.push_str(&n.to_string());
            }
            Value::SeqElem(se) => {
                if se.no_invoke {
                    out.push('@');
                }
                se.seq.render(out, depth.saturating_sub(1), quote);
                out.push('[');
                se.index.render(out, depth.saturating_sub(1), true);
                out.push(']');
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equality(other, RECURSION_DEPTH) >= 1.0
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Number(if b { 1.0 } else { 0.0 })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s.as_str()))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::map(map)
    }
}

/// Render a number the way script output expects: integral values without a
/// decimal point, moderate values with up to six decimal places, and very
/// large or small magnitudes in scientific notation.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "INF" } else { "-INF" }.to_string();
    }
    if n == n.trunc() && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    if n.abs() >= 1e10 || (n != 0.0 && n.abs() < 1e-4) {
        let s = format!("{:E}", n);
        return if s.contains("E-") {
            s
        } else {
            s.replace('E', "E+")
        };
    }
    let s = format!("{:.6}", n);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Resolve a (possibly negative) index against a sequence of the given
/// length. Negative indexes count from the end; anything outside
/// `[-len, len-1]` is an *IndexOutOfRange* error, and fractional indexes are
/// a *TypeMismatch*.
pub fn normalize_index(index: f64, len: usize) -> Result<usize> {
    if !index.is_finite() || index != index.trunc() {
        return Err(Error::type_mismatch(format!(
            "index must be an integer (got {})",
            format_number(index)
        )));
    }
    let mut i = index as i64;
    if i < 0 {
        i += len as i64;
    }
    if i < 0 || i >= len as i64 {
        return Err(Error::index_out_of_range(index));
    }
    Ok(i as usize)
}

// ---------------------------------------------------------------------------
// ValueMap
// ---------------------------------------------------------------------------

/// Key wrapper giving `IndexMap` the value model's equality and hashing.
#[derive(Clone, Debug)]
struct MapKey(Value);

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.equality(&other.0, RECURSION_DEPTH) >= 1.0
    }
}

impl Eq for MapKey {}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_value(state, RECURSION_DEPTH);
    }
}

/// An insertion-ordered mapping from value to value.
///
/// Keys use the same equality relation as ordinary value comparison, and
/// hashing is consistent with it. The optional [`AssignOverride`] hook is
/// consulted on element writes before the entry is touched.
#[derive(Clone, Default)]
pub struct ValueMap {
    entries: IndexMap<MapKey, Value>,
    pub assign_override: Option<AssignOverride>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.entries.get(&MapKey(key.clone())).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<Value> {
        self.get(&Value::from(key))
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.entries.contains_key(&MapKey(key.clone()))
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        self.entries.insert(MapKey(key), value);
    }

    pub fn insert_str(&mut self, key: &str, value: Value) {
        self.insert(Value::from(key), value);
    }

    /// Remove an entry, preserving the order of the rest.
    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        self.entries.shift_remove(&MapKey(key.clone()))
    }

    pub fn get_index(&self, index: usize) -> Option<(Value, Value)> {
        self.entries
            .get_index(index)
            .map(|(k, v)| (k.0.clone(), v.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (&k.0, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.keys().map(|k| &k.0)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }

    /// The `__isa` prototype link, if present.
    pub fn isa(&self) -> Option<Value> {
        self.get_str(ISA_KEY)
    }
}

impl fmt::Debug for ValueMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (&k.0, v)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Number(-3.0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
        assert!(Value::list(vec![Value::one()]).is_truthy());
    }

    #[test]
    fn test_is_truly() {
        assert!(Value::Number(1.0).is_truly());
        assert!(Value::Number(-1.5).is_truly());
        assert!(!Value::Number(0.5).is_truly());
        assert!(Value::from("yes").is_truly());
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(1.0 / 3.0), "0.333333");
        assert_eq!(format_number(f64::INFINITY), "INF");
    }

    #[test]
    fn test_equality_scores() {
        let a = Value::list(vec![Value::one(), Value::from("x")]);
        let b = Value::list(vec![Value::one(), Value::from("x")]);
        let c = Value::list(vec![Value::one(), Value::from("y")]);
        assert_eq!(a.equality(&b, RECURSION_DEPTH), 1.0);
        assert_eq!(a.equality(&c, RECURSION_DEPTH), 0.0);
        assert_eq!(Value::one().equality(&Value::from("1"), RECURSION_DEPTH), 0.0);
    }

    #[test]
    fn test_cyclic_equality_is_fuzzy() {
        let a = Value::map(ValueMap::new());
        let b = Value::map(ValueMap::new());
        a.as_map().unwrap().borrow_mut().insert_str("next", a.clone());
        b.as_map().unwrap().borrow_mut().insert_str("next", b.clone());
        let score = a.equality(&b, RECURSION_DEPTH);
        assert_eq!(score, 0.5);
    }

    #[test]
    fn test_cyclic_render_is_bounded() {
        let a = Value::map(ValueMap::new());
        a.as_map().unwrap().borrow_mut().insert_str("me", a.clone());
        let s = a.to_display_string();
        assert!(s.contains("{...}"));
    }

    #[test]
    fn test_code_form_round_trippable_text() {
        let mut m = ValueMap::new();
        m.insert_str("x", Value::one());
        let v = Value::map(m);
        assert_eq!(v.code_form(RECURSION_DEPTH), "{\"x\": 1}");
        assert_eq!(Value::from("isn't \"real\"").code_form(3), "\"isn't \"\"real\"\"\"");
    }

    #[test]
    fn test_map_key_equality_and_order() {
        let mut m = ValueMap::new();
        m.insert(Value::Number(1.0), Value::from("one"));
        m.insert(Value::from("k"), Value::from("str"));
        m.insert(Value::Number(1.0), Value::from("uno"));
        assert_eq!(m.len(), 2);
        assert_eq!(m.get(&Value::Number(1.0)), Some(Value::from("uno")));
        let keys: Vec<String> = m.keys().map(|k| k.to_display_string()).collect();
        assert_eq!(keys, vec!["1", "k"]);
    }

    #[test]
    fn test_normalize_index() {
        assert_eq!(normalize_index(-1.0, 5).unwrap(), 4);
        assert_eq!(normalize_index(0.0, 5).unwrap(), 0);
        assert!(normalize_index(5.0, 5).is_err());
        assert!(normalize_index(-6.0, 5).is_err());
        assert!(normalize_index(1.5, 5).is_err());
    }

    #[test]
    fn test_compare_ordering() {
        assert_eq!(Value::Number(1.0).compare(&Value::Number(2.0)), Ordering::Less);
        assert_eq!(Value::from("a").compare(&Value::from("b")), Ordering::Less);
        assert_eq!(Value::Null.compare(&Value::Number(0.0)), Ordering::Less);
    }
}
