//! Intrinsic (host function) registry.
//!
//! Hosts expose native functions to script by registering an
//! [`IntrinsicSpec`] (name plus typed parameters with defaults) together with
//! a native callable. Each registration gets a unique integer id and a
//! one-line wrapper function whose body is a single `CallIntrinsic` opcode;
//! name resolution hands that wrapper out whenever a script references an
//! otherwise-undefined identifier that matches an intrinsic name.
//!
//! The native callable runs with the wrapper's context on top of the machine
//! stack, so declared parameters are readable as locals via
//! [`Machine::local`]. Returning [`IntrinsicResult::Partial`] parks a value
//! on that context and re-invokes the callable on the next step — the
//! cooperative-yield half of the scheduler.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::{Result, SourceLoc};
use crate::tac::{Line, Op};
use crate::value::{FuncDef, Param, Value};
use crate::vm::Machine;

/// What an intrinsic invocation produced.
pub enum IntrinsicResult {
    /// Finished; the value becomes the call's result.
    Done(Value),
    /// Not finished: park this value on the context and re-invoke next step,
    /// passing it back as the prior partial result.
    Partial(Value),
    /// Not finished and nothing to remember; re-invoke next step with a null
    /// partial result.
    Waiting,
}

/// Native callable signature: current machine (with the wrapper context on
/// top of the stack) and the previously parked partial result, if any.
pub type IntrinsicFn = Rc<dyn Fn(&mut Machine, Option<Value>) -> Result<IntrinsicResult>>;

/// Declarative half of a registration: name and parameters.
///
/// # Example
///
/// ```
/// use tacit::{IntrinsicSpec, Value};
///
/// let spec = IntrinsicSpec::new("clampTo")
///     .param("self", Value::Null)
///     .param("limit", 1.0);
/// assert_eq!(spec.name(), "clampTo");
/// ```
#[derive(Clone)]
pub struct IntrinsicSpec {
    name: String,
    params: Vec<Param>,
}

impl IntrinsicSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter with a default value.
    pub fn param(mut self, name: &str, default: impl Into<Value>) -> Self {
        self.params.push(Param::new(name, default.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A registered intrinsic: id, name, wrapper function, native callable.
pub struct Intrinsic {
    pub id: u32,
    pub name: Rc<str>,
    pub(crate) func: IntrinsicFn,
    wrapper: Value,
}

impl Intrinsic {
    /// The shared one-line wrapper function value for this intrinsic.
    pub fn wrapper(&self) -> Value {
        self.wrapper.clone()
    }
}

/// Lookup by id (dense) and by name.
#[derive(Default)]
pub struct IntrinsicRegistry {
    items: Vec<Rc<Intrinsic>>,
    by_name: FxHashMap<String, u32>,
}

impl IntrinsicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native callable under the given spec; returns its id.
    /// Re-registering a name replaces the old entry in name lookup.
    pub fn register(&mut self, spec: IntrinsicSpec, func: IntrinsicFn) -> u32 {
        let id = self.items.len() as u32;
        let def = FuncDef::new(spec.params);
        def.code.borrow_mut().push(Line::new(
            Some(Value::Temp(0)),
            Op::CallIntrinsic,
            Some(Value::Number(id as f64)),
            None,
            SourceLoc::new("intrinsic", 0),
        ));
        let wrapper = Value::Function(Rc::new(def), None);
        let intrinsic = Rc::new(Intrinsic {
            id,
            name: Rc::from(spec.name.as_str()),
            func,
            wrapper,
        });
        self.by_name.insert(spec.name, id);
        self.items.push(intrinsic);
        id
    }

    pub fn by_id(&self, id: u32) -> Option<Rc<Intrinsic>> {
        self.items.get(id as usize).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Rc<Intrinsic>> {
        self.by_name.get(name).and_then(|id| self.by_id(*id))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Shared handle used by the machine and the interpreter façade.
pub type RegistryRef = Rc<RefCell<IntrinsicRegistry>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut reg = IntrinsicRegistry::new();
        let id = reg.register(
            IntrinsicSpec::new("six").param("x", Value::Null),
            Rc::new(|_, _| Ok(IntrinsicResult::Done(Value::Number(6.0)))),
        );
        assert_eq!(id, 0);
        let by_name = reg.by_name("six").unwrap();
        assert_eq!(by_name.id, id);
        assert!(reg.by_name("seven").is_none());
    }

    #[test]
    fn test_wrapper_is_single_call_line() {
        let mut reg = IntrinsicRegistry::new();
        let id = reg.register(
            IntrinsicSpec::new("noop"),
            Rc::new(|_, _| Ok(IntrinsicResult::Done(Value::Null))),
        );
        let intr = reg.by_id(id).unwrap();
        let Value::Function(def, None) = intr.wrapper() else {
            panic!("wrapper should be an unbound function");
        };
        let code = def.code.borrow();
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].op, Op::CallIntrinsic);
        assert_eq!(code[0].rhs_a, Some(Value::Number(id as f64)));
    }
}
