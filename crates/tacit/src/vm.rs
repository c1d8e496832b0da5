//! The virtual machine: a call stack of execution contexts driven one TAC
//! line per step.
//!
//! The machine is the only module that mutates runtime state; the compiler is
//! pure translation and `operators` is a stateless helper. Each [`Machine`]
//! owns a stack of [`Context`]s with the root (global) context at the bottom.
//! One call to [`Machine::step`] fetches, resolves, and executes a single
//! line; cooperative scheduling falls out of that: the host decides how many
//! steps to run, and an intrinsic that parks a partial result leaves the code
//! pointer on its own line so the next step re-invokes it.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::interp::HostInfo;
use crate::intrinsic::{IntrinsicResult, RegistryRef};
use crate::operators::{apply_binop, apply_cmpop, apply_unaryop};
use crate::tac::{BinOp, Line, Op};
use crate::value::{
    ISA_KEY, MAX_ISA_DEPTH, Param, Value, ValueMap, normalize_index,
};

/// Hard cap on the argument push-down stack.
pub const MAX_ARGS: usize = 255;

/// Where a call's (or assignment's) result goes.
#[derive(Clone)]
pub(crate) enum Dest {
    None,
    /// A variable, temp, or sequence-element reference in the caller.
    Ref(Value),
    /// The implicit result `_`, honored only in store-implicit mode.
    Implicit,
}

/// Standard-output sink: a growing buffer by default, or a host callback.
pub enum OutputSink {
    Buffer(Vec<String>),
    Callback(Box<dyn FnMut(&str)>),
}

impl Default for OutputSink {
    fn default() -> Self {
        OutputSink::Buffer(Vec::new())
    }
}

impl OutputSink {
    pub fn write_line(&mut self, line: &str) {
        match self {
            OutputSink::Buffer(buf) => buf.push(line.to_string()),
            OutputSink::Callback(f) => f(line),
        }
    }

    /// Drain buffered lines (empty in callback mode).
    pub fn take(&mut self) -> Vec<String> {
        match self {
            OutputSink::Buffer(buf) => std::mem::take(buf),
            OutputSink::Callback(_) => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// One call frame: code pointer, locals, temporaries, argument stack, and
/// the slot in the caller where the return value lands.
///
/// Local variables live in a [`ValueMap`] behind an `Rc` so that script can
/// see them as a real map value through the reserved `locals` name. The map
/// is created lazily; most frames never touch it.
pub struct Context {
    pub(crate) code: Rc<RefCell<Vec<Line>>>,
    /// Index of the next line to execute.
    pub line_num: usize,
    pub(crate) variables: Option<Rc<RefCell<ValueMap>>>,
    pub(crate) outer_vars: Option<Rc<RefCell<ValueMap>>>,
    pub self_value: Option<Value>,
    pub(crate) args: Vec<Value>,
    pub(crate) result_storage: Dest,
    /// Parked value from a suspended intrinsic.
    pub partial_result: Option<Value>,
    temps: Vec<Value>,
    pub implicit_result_count: u64,
}

impl Context {
    pub(crate) fn new(code: Rc<RefCell<Vec<Line>>>) -> Self {
        Self {
            code,
            line_num: 0,
            variables: None,
            outer_vars: None,
            self_value: None,
            args: Vec::new(),
            result_storage: Dest::None,
            partial_result: None,
            temps: Vec::new(),
            implicit_result_count: 0,
        }
    }

    pub(crate) fn ensure_locals(&mut self) -> Rc<RefCell<ValueMap>> {
        if self.variables.is_none() {
            self.variables = Some(Rc::new(RefCell::new(ValueMap::new())));
        }
        self.variables.clone().unwrap()
    }

    fn set_local(&mut self, name: Rc<str>, value: Value) {
        let locals = self.ensure_locals();
        locals.borrow_mut().insert(Value::Str(name), value);
    }

    /// Temps are zero-initialized on demand; reading past the end yields
    /// null, so slot 0 (a function's return value) always exists.
    pub fn get_temp(&self, num: u32) -> Value {
        self.temps.get(num as usize).cloned().unwrap_or(Value::Null)
    }

    pub fn set_temp(&mut self, num: u32, value: Value) {
        let i = num as usize;
        if i >= self.temps.len() {
            self.temps.resize(i + 1, Value::Null);
        }
        self.temps[i] = value;
    }

    /// Push one argument for an upcoming call. Fails past [`MAX_ARGS`].
    pub fn push_arg(&mut self, value: Value) -> Result<()> {
        if self.args.len() >= MAX_ARGS {
            return Err(Error::too_many_arguments());
        }
        self.args.push(value);
        Ok(())
    }

    pub fn done(&self) -> bool {
        self.line_num >= self.code.borrow().len()
    }
}

// ---------------------------------------------------------------------------
// Builtin type maps
// ---------------------------------------------------------------------------

/// The five builtin type maps (`string`, `list`, `map`, `number`,
/// `funcRef`). They are ordinary map values; dot-syntax on a non-map value
/// dispatches into the matching one, and a map's `__isa` chain terminates at
/// the map type.
#[derive(Clone)]
pub struct BuiltinTypes {
    pub string: Value,
    pub list: Value,
    pub map: Value,
    pub number: Value,
    pub function: Value,
}

impl BuiltinTypes {
    pub(crate) fn empty() -> Self {
        Self {
            string: Value::map(ValueMap::new()),
            list: Value::map(ValueMap::new()),
            map: Value::map(ValueMap::new()),
            number: Value::map(ValueMap::new()),
            function: Value::map(ValueMap::new()),
        }
    }

    fn for_value(&self, v: &Value) -> Option<&Value> {
        match v {
            Value::Str(_) => Some(&self.string),
            Value::List(_) => Some(&self.list),
            Value::Map(_) => Some(&self.map),
            Value::Number(_) => Some(&self.number),
            Value::Function(..) => Some(&self.function),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// The VM proper.
pub struct Machine {
    stack: Vec<Context>,
    out: OutputSink,
    yielding: bool,
    store_implicit: bool,
    start: Instant,
    registry: RegistryRef,
    types: BuiltinTypes,
    host_info: HostInfo,
    rng: StdRng,
}

impl Machine {
    pub(crate) fn new(
        code: Rc<RefCell<Vec<Line>>>,
        registry: RegistryRef,
        types: BuiltinTypes,
        host_info: HostInfo,
    ) -> Self {
        Self {
            stack: vec![Context::new(code)],
            out: OutputSink::default(),
            yielding: false,
            store_implicit: false,
            start: Instant::now(),
            registry,
            types,
            host_info,
            rng: StdRng::from_entropy(),
        }
    }

    fn top(&self) -> &Context {
        self.stack.last().unwrap()
    }

    fn top_mut(&mut self) -> &mut Context {
        self.stack.last_mut().unwrap()
    }

    /// Done when only the root remains and its code pointer is past the end.
    pub fn done(&self) -> bool {
        self.stack.len() == 1 && self.stack[0].done()
    }

    /// Seconds since this machine started running.
    pub fn run_time(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn yielding(&self) -> bool {
        self.yielding
    }

    pub fn set_yielding(&mut self, yielding: bool) {
        self.yielding = yielding;
    }

    pub fn store_implicit(&self) -> bool {
        self.store_implicit
    }

    pub fn set_store_implicit(&mut self, on: bool) {
        self.store_implicit = on;
    }

    /// True when the top context has a parked intrinsic partial result.
    pub fn partial_parked(&self) -> bool {
        self.top().partial_result.is_some()
    }

    pub fn implicit_result_count(&self) -> u64 {
        self.stack[0].implicit_result_count
    }

    /// Clear the stack back to the root and rewind it. Globals survive; the
    /// run clock restarts.
    pub fn reset(&mut self) {
        self.stack.truncate(1);
        let root = &mut self.stack[0];
        root.line_num = 0;
        root.temps.clear();
        root.args.clear();
        root.partial_result = None;
        self.yielding = false;
        self.start = Instant::now();
    }

    /// Advance the top context past its last line, abandoning the rest of
    /// that call frame. Used by `stop` and by error recovery.
    pub fn jump_top_to_end(&mut self) {
        let top = self.top_mut();
        let end = top.code.borrow().len();
        top.line_num = end;
        top.partial_result = None;
    }

    pub fn print_line(&mut self, line: &str) {
        self.out.write_line(line);
    }

    pub fn take_output(&mut self) -> Vec<String> {
        self.out.take()
    }

    pub fn set_output_callback(&mut self, callback: Box<dyn FnMut(&str)>) {
        self.out = OutputSink::Callback(callback);
    }

    pub fn types(&self) -> &BuiltinTypes {
        &self.types
    }

    pub fn host_info(&self) -> &HostInfo {
        &self.host_info
    }

    pub fn set_host_info(&mut self, info: HostInfo) {
        self.host_info = info;
    }

    /// Next pseudo-random number in [0, 1).
    pub fn random(&mut self) -> f64 {
        self.rng.r#gen::<f64>()
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.stack[0]
            .variables
            .as_ref()
            .and_then(|v| v.borrow().get_str(name))
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.stack[0].set_local(Rc::from(name), value);
    }

    fn root_locals(&mut self) -> Rc<RefCell<ValueMap>> {
        self.stack[0].ensure_locals()
    }

    /// Read a local of the current (top) context by name — how intrinsics
    /// access their bound parameters. `self` resolves the receiver first.
    pub fn local(&self, name: &str) -> Value {
        if name == "self" {
            if let Some(v) = &self.top().self_value {
                return v.clone();
            }
        }
        if let Some(vars) = &self.top().variables {
            if let Some(v) = vars.borrow().get_str(name) {
                return v;
            }
        }
        Value::Null
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Execute one TAC line.
    ///
    /// A context whose code pointer is past the end behaves as an implicit
    /// `Return` (on the root, the machine is simply done). Any error is
    /// annotated with the executing line's source location.
    pub fn step(&mut self) -> Result<()> {
        let at_end = {
            let top = self.top();
            top.line_num >= top.code.borrow().len()
        };
        if at_end {
            if self.stack.len() > 1 {
                return self.do_return();
            }
            return Ok(());
        }
        let line = {
            let top = self.top();
            let code = top.code.borrow();
            code[top.line_num].clone()
        };
        self.top_mut().line_num += 1;
        self.exec_line(&line)
            .map_err(|e| e.with_location(line.location.clone()))
    }

    fn exec_line(&mut self, line: &Line) -> Result<()> {
        let rhs_a = line.rhs_a.clone().unwrap_or(Value::Null);
        match line.op {
            Op::Noop => Ok(()),

            Op::Assign | Op::ElemStore => {
                let dest = dest_of(&line.lhs);
                self.resolve_or_call(&rhs_a, dest)
            }

            Op::AssignImplicit => self.resolve_or_call(&rhs_a, Dest::Implicit),

            Op::Binary(op) => {
                let a = self.resolve(&rhs_a)?;
                let b = self.resolve(line.rhs_b.as_ref().unwrap_or(&Value::Null))?;
                let v = if op == BinOp::Isa {
                    Value::from(self.value_isa(&a, &b))
                } else {
                    apply_binop(op, &a, &b)?
                };
                self.store_lhs(line, v)
            }

            Op::Compare(op) => {
                let a = self.resolve(&rhs_a)?;
                let b = self.resolve(line.rhs_b.as_ref().unwrap_or(&Value::Null))?;
                let v = apply_cmpop(op, &a, &b)?;
                self.store_lhs(line, v)
            }

            Op::Unary(op) => {
                let a = self.resolve(&rhs_a)?;
                let v = apply_unaryop(op, &a)?;
                self.store_lhs(line, v)
            }

            Op::Copy => {
                let v = match &rhs_a {
                    Value::List(l) => {
                        let items: Vec<Value> = l.borrow().clone();
                        let mut out = Vec::with_capacity(items.len());
                        for item in &items {
                            out.push(self.resolve(item)?);
                        }
                        Value::list(out)
                    }
                    Value::Map(m) => {
                        let entries: Vec<(Value, Value)> = m
                            .borrow()
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        let mut out = ValueMap::new();
                        for (k, v) in &entries {
                            out.insert(self.resolve(k)?, self.resolve(v)?);
                        }
                        Value::map(out)
                    }
                    other => self.resolve(other)?,
                };
                self.store_lhs(line, v)
            }

            Op::New => {
                let v = self.resolve(&rhs_a)?;
                match v {
                    Value::Map(_) => {
                        let mut m = ValueMap::new();
                        m.insert_str(ISA_KEY, v);
                        self.store_lhs(line, Value::map(m))
                    }
                    other => Err(Error::type_mismatch(format!(
                        "Type Error: 'new' requires a map (got {})",
                        other.type_name()
                    ))),
                }
            }

            Op::Length => {
                let v = self.resolve(&rhs_a)?;
                let len = match &v {
                    Value::Str(s) => s.chars().count(),
                    Value::List(l) => l.borrow().len(),
                    Value::Map(m) => m.borrow().len(),
                    Value::Null => 0,
                    other => {
                        return Err(Error::type_mismatch(format!(
                            "Type Error: {} has no length",
                            other.type_name()
                        )));
                    }
                };
                self.store_lhs(line, Value::from(len))
            }

            Op::ElemLoad => {
                let dest = dest_of(&line.lhs);
                let seqv = self.resolve(&rhs_a)?;
                let idxv = self.resolve(line.rhs_b.as_ref().unwrap_or(&Value::Null))?;
                let v = self.element_lookup(&seqv, &idxv)?;
                if matches!(v, Value::Function(..)) {
                    self.begin_call(v, 0, Some(seqv), dest)
                } else {
                    self.store_dest(dest, v)
                }
            }

            Op::ElemIter => {
                let seqv = self.resolve(&rhs_a)?;
                let idxv = self.resolve(line.rhs_b.as_ref().unwrap_or(&Value::Null))?;
                let i = idxv.as_number().unwrap_or(0.0) as usize;
                let v = match &seqv {
                    Value::List(l) => l
                        .borrow()
                        .get(i)
                        .cloned()
                        .ok_or_else(|| Error::index_out_of_range(i as f64))?,
                    Value::Str(s) => s
                        .chars()
                        .nth(i)
                        .map(|c| Value::from(c.to_string()))
                        .ok_or_else(|| Error::index_out_of_range(i as f64))?,
                    Value::Map(m) => {
                        let (k, v) = m
                            .borrow()
                            .get_index(i)
                            .ok_or_else(|| Error::index_out_of_range(i as f64))?;
                        let mut entry = ValueMap::new();
                        entry.insert_str("key", k);
                        entry.insert_str("value", v);
                        Value::map(entry)
                    }
                    other => {
                        return Err(Error::type_mismatch(format!(
                            "Type Error: can't iterate over {}",
                            other.type_name()
                        )));
                    }
                };
                self.store_lhs(line, v)
            }

            Op::PushParam => {
                let v = self.resolve(&rhs_a)?;
                self.top_mut().push_arg(v)
            }

            Op::CallFunction => {
                let argc = line
                    .rhs_b
                    .as_ref()
                    .and_then(|v| v.as_number())
                    .unwrap_or(0.0) as usize;
                let dest = dest_of(&line.lhs);
                let (callee, receiver) = match &rhs_a {
                    Value::Var(name, _) => (self.resolve_var(name)?, None),
                    Value::SeqElem(se) => {
                        let seqv = self.resolve(&se.seq)?;
                        let idxv = self.resolve(&se.index)?;
                        let f = self.element_lookup(&seqv, &idxv)?;
                        (f, Some(seqv))
                    }
                    other => (self.resolve(other)?, None),
                };
                if matches!(callee, Value::Function(..)) {
                    self.begin_call(callee, argc, receiver, dest)
                } else if argc == 0 {
                    // calling a plain value with no arguments is the value
                    self.store_dest(dest, callee)
                } else {
                    let top = self.top_mut();
                    let keep = top.args.len().saturating_sub(argc);
                    top.args.truncate(keep);
                    Err(Error::too_many_arguments())
                }
            }

            Op::CallIntrinsic => {
                let id = rhs_a.as_number().unwrap_or(-1.0);
                let intrinsic = self.registry.borrow().by_id(id as u32);
                let Some(intrinsic) = intrinsic else {
                    return Err(Error::type_mismatch(format!(
                        "Type Error: unknown intrinsic id {}",
                        id
                    )));
                };
                let partial = self.top_mut().partial_result.take();
                let func = intrinsic.func.clone();
                match (*func)(self, partial)? {
                    IntrinsicResult::Done(v) => {
                        self.top_mut().set_temp(0, v);
                        Ok(())
                    }
                    IntrinsicResult::Partial(v) => {
                        let top = self.top_mut();
                        top.partial_result = Some(v);
                        top.line_num -= 1;
                        Ok(())
                    }
                    IntrinsicResult::Waiting => {
                        let top = self.top_mut();
                        top.partial_result = Some(Value::Null);
                        top.line_num -= 1;
                        Ok(())
                    }
                }
            }

            Op::Goto => {
                self.top_mut().line_num = jump_target(line)?;
                Ok(())
            }

            Op::GotoIfB => {
                let c = self.resolve(line.rhs_b.as_ref().unwrap_or(&Value::Null))?;
                if c.is_truthy() {
                    self.top_mut().line_num = jump_target(line)?;
                }
                Ok(())
            }

            Op::GotoIfNotB => {
                let c = self.resolve(line.rhs_b.as_ref().unwrap_or(&Value::Null))?;
                if !c.is_truthy() {
                    self.top_mut().line_num = jump_target(line)?;
                }
                Ok(())
            }

            Op::GotoIfTrulyB => {
                let c = self.resolve(line.rhs_b.as_ref().unwrap_or(&Value::Null))?;
                if c.is_truly() {
                    self.top_mut().line_num = jump_target(line)?;
                }
                Ok(())
            }

            Op::Return => self.do_return(),

            Op::BindAssign => {
                let Value::Function(def, _) = &rhs_a else {
                    return Err(Error::type_mismatch(
                        "Type Error: bind requires a function literal",
                    ));
                };
                let outer = self.top_mut().ensure_locals();
                let bound = Value::Function(def.clone(), Some(outer));
                self.store_lhs(line, bound)
            }
        }
    }

    fn store_lhs(&mut self, line: &Line, value: Value) -> Result<()> {
        match &line.lhs {
            Some(dest) => self.store(dest, value),
            None => Ok(()),
        }
    }

    fn store_dest(&mut self, dest: Dest, value: Value) -> Result<()> {
        match dest {
            Dest::None => Ok(()),
            Dest::Ref(d) => self.store(&d, value),
            Dest::Implicit => {
                self.store_implicit_result(value);
                Ok(())
            }
        }
    }

    fn store_implicit_result(&mut self, value: Value) {
        if !self.store_implicit {
            return;
        }
        self.stack[0].implicit_result_count += 1;
        let globals = self.root_locals();
        globals.borrow_mut().insert(Value::from("_"), value);
    }

    /// Resolve an rvalue reference, beginning a zero-argument call when it
    /// names a function (unless the reference carries the `@` flag). When a
    /// call is begun, the result lands in `dest` after the callee returns.
    fn resolve_or_call(&mut self, operand: &Value, dest: Dest) -> Result<()> {
        match operand {
            Value::Var(name, no_invoke) => {
                let v = self.resolve_var(name)?;
                if !no_invoke && matches!(v, Value::Function(..)) {
                    self.begin_call(v, 0, None, dest)
                } else {
                    self.store_dest(dest, v)
                }
            }
            Value::SeqElem(se) => {
                let seqv = self.resolve(&se.seq)?;
                let idxv = self.resolve(&se.index)?;
                let v = self.element_lookup(&seqv, &idxv)?;
                if !se.no_invoke && matches!(v, Value::Function(..)) {
                    self.begin_call(v, 0, Some(seqv), dest)
                } else {
                    self.store_dest(dest, v)
                }
            }
            other => {
                let v = self.resolve(other)?;
                self.store_dest(dest, v)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Operand resolution
    // -----------------------------------------------------------------------

    /// Resolve an operand to a concrete value without invoking functions.
    pub(crate) fn resolve(&mut self, operand: &Value) -> Result<Value> {
        match operand {
            Value::Var(name, _) => self.resolve_var(name),
            Value::Temp(n) => Ok(self.top().get_temp(*n)),
            Value::SeqElem(se) => {
                let seqv = self.resolve(&se.seq)?;
                let idxv = self.resolve(&se.index)?;
                self.element_lookup(&seqv, &idxv)
            }
            other => Ok(other.clone()),
        }
    }

    /// Variable resolution: reserved names, locals, captured outer scope,
    /// globals, then registered intrinsics (handing out the shared wrapper).
    fn resolve_var(&mut self, name: &Rc<str>) -> Result<Value> {
        match &**name {
            "self" => {
                if let Some(v) = &self.top().self_value {
                    return Ok(v.clone());
                }
                // fall through: intrinsic params named `self` bind as locals
            }
            "locals" => return Ok(Value::Map(self.top_mut().ensure_locals())),
            "globals" => return Ok(Value::Map(self.root_locals())),
            "outer" => {
                if let Some(o) = self.top().outer_vars.clone() {
                    return Ok(Value::Map(o));
                }
                return Ok(Value::Map(self.root_locals()));
            }
            _ => {}
        }
        let key = Value::Str(name.clone());
        if let Some(vars) = &self.top().variables {
            if let Some(v) = vars.borrow().get(&key) {
                return Ok(v);
            }
        }
        if let Some(outer) = &self.top().outer_vars {
            if let Some(v) = outer.borrow().get(&key) {
                return Ok(v);
            }
        }
        if self.stack.len() > 1 {
            if let Some(root_vars) = &self.stack[0].variables {
                if let Some(v) = root_vars.borrow().get(&key) {
                    return Ok(v);
                }
            }
        }
        if let Some(intrinsic) = self.registry.borrow().by_name(name) {
            return Ok(intrinsic.wrapper());
        }
        Err(Error::undefined_identifier(name))
    }

    /// `seq[index]` / `seq.name` lookup. Maps walk the `__isa` chain (capped
    /// at [`MAX_ISA_DEPTH`]); non-map values dispatch string keys into their
    /// builtin type map.
    pub(crate) fn element_lookup(&self, seq: &Value, index: &Value) -> Result<Value> {
        match seq {
            Value::List(l) => match index {
                Value::Number(n) => {
                    let l = l.borrow();
                    let i = normalize_index(*n, l.len())?;
                    Ok(l[i].clone())
                }
                Value::Str(_) => self.type_member(seq, index),
                _ => Err(Error::type_mismatch(format!(
                    "Type Error: list index must be a number (got {})",
                    index.type_name()
                ))),
            },
            Value::Str(s) => match index {
                Value::Number(n) => {
                    let count = s.chars().count();
                    let i = normalize_index(*n, count)?;
                    let c = s.chars().nth(i).unwrap();
                    Ok(Value::from(c.to_string()))
                }
                Value::Str(_) => self.type_member(seq, index),
                _ => Err(Error::type_mismatch(format!(
                    "Type Error: string index must be a number (got {})",
                    index.type_name()
                ))),
            },
            Value::Map(_) => self.map_lookup(seq, index),
            Value::Number(_) | Value::Function(..) => self.type_member(seq, index),
            Value::Null => Err(Error::type_mismatch(
                "Type Error: null is not indexable",
            )),
            other => Err(Error::type_mismatch(format!(
                "Type Error: {} is not indexable",
                other.type_name()
            ))),
        }
    }

    /// Look a key up in the builtin type map for a non-map value.
    fn type_member(&self, seq: &Value, index: &Value) -> Result<Value> {
        if let Some(Value::Map(type_map)) = self.types.for_value(seq) {
            if let Some(v) = type_map.borrow().get(index) {
                return Ok(v);
            }
        }
        Err(Error::key_not_found(&index.to_display_string()))
    }

    /// Map lookup with prototype-chain walk. A chain longer than
    /// [`MAX_ISA_DEPTH`] (a cycle, in practice) fails with a best-effort
    /// *KeyNotFound* rather than recursing forever.
    fn map_lookup(&self, start: &Value, key: &Value) -> Result<Value> {
        let mut current = start.clone();
        for _ in 0..MAX_ISA_DEPTH {
            let Value::Map(m) = &current else { break };
            let (found, next) = {
                let b = m.borrow();
                (b.get(key), b.isa())
            };
            if let Some(v) = found {
                return Ok(v);
            }
            match next {
                Some(n) => current = n,
                None => {
                    // end of chain: the builtin map type is the implicit root
                    if let Value::Map(mt) = &self.types.map {
                        if let Some(v) = mt.borrow().get(key) {
                            return Ok(v);
                        }
                    }
                    return Err(Error::key_not_found(&key.to_display_string()));
                }
            }
        }
        Err(Error::key_not_found(&key.to_display_string()))
    }

    /// `value isa type`. The builtin type maps match their own kinds; for
    /// map operands the `__isa` chain is walked by identity.
    pub fn value_isa(&self, value: &Value, type_value: &Value) -> bool {
        match type_value {
            Value::Null => matches!(value, Value::Null),
            Value::Map(_) => match value {
                Value::Number(_) => type_value.ref_eq(&self.types.number),
                Value::Str(_) => type_value.ref_eq(&self.types.string),
                Value::List(_) => type_value.ref_eq(&self.types.list),
                Value::Function(..) => type_value.ref_eq(&self.types.function),
                Value::Map(_) => {
                    if type_value.ref_eq(&self.types.map) {
                        return true;
                    }
                    let mut current = value.clone();
                    for _ in 0..MAX_ISA_DEPTH {
                        let Value::Map(m) = &current else { return false };
                        let next = m.borrow().isa();
                        match next {
                            Some(n) => {
                                if n.ref_eq(type_value) {
                                    return true;
                                }
                                current = n;
                            }
                            None => return false,
                        }
                    }
                    false
                }
                _ => false,
            },
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Calls and returns
    // -----------------------------------------------------------------------

    /// Construct and push a call frame.
    ///
    /// Arguments are taken from the current context's push-down stack. A
    /// dot-call binds the receiver to `self`; if the callee's first
    /// parameter is literally named `self`, binding shifts past it. Missing
    /// parameters take their declared defaults; surplus arguments are a
    /// *TooManyArguments* error.
    pub(crate) fn begin_call(
        &mut self,
        callee: Value,
        arg_count: usize,
        receiver: Option<Value>,
        dest: Dest,
    ) -> Result<()> {
        let Value::Function(def, outer) = callee else {
            return Err(Error::type_mismatch("Type Error: not a function"));
        };
        let args = {
            let top = self.top_mut();
            let at = top.args.len().saturating_sub(arg_count);
            top.args.split_off(at)
        };
        let mut ctx = Context::new(def.code.clone());
        ctx.outer_vars = outer;
        let mut params: &[Param] = &def.params;
        if let Some(recv) = receiver {
            ctx.self_value = Some(recv);
            if params.first().is_some_and(|p| &*p.name == "self") {
                params = &params[1..];
            }
        }
        if args.len() > params.len() {
            return Err(Error::too_many_arguments());
        }
        for (i, p) in params.iter().enumerate() {
            let v = args.get(i).cloned().unwrap_or_else(|| p.default.clone());
            ctx.set_local(p.name.clone(), v);
        }
        ctx.result_storage = dest;
        self.stack.push(ctx);
        Ok(())
    }

    /// Copy temp slot 0 into the caller's result slot and pop the context.
    /// On the root context, jump past the end instead.
    fn do_return(&mut self) -> Result<()> {
        if self.stack.len() == 1 {
            self.jump_top_to_end();
            return Ok(());
        }
        let ctx = self.stack.pop().unwrap();
        let result = ctx.get_temp(0);
        match ctx.result_storage {
            Dest::Ref(d) => self.store(&d, result),
            Dest::Implicit => {
                self.store_implicit_result(result);
                Ok(())
            }
            Dest::None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Stores
    // -----------------------------------------------------------------------

    pub(crate) fn store(&mut self, dest: &Value, value: Value) -> Result<()> {
        match dest {
            Value::Temp(n) => {
                self.top_mut().set_temp(*n, value);
                Ok(())
            }
            Value::Var(name, _) => match &**name {
                "self" => {
                    self.top_mut().self_value = Some(value);
                    Ok(())
                }
                "locals" | "globals" => Err(Error::type_mismatch(format!(
                    "Type Error: can't assign to '{}'",
                    name
                ))),
                _ => {
                    self.top_mut().set_local(name.clone(), value);
                    Ok(())
                }
            },
            Value::SeqElem(se) => {
                let seqv = self.resolve(&se.seq)?;
                let idxv = self.resolve(&se.index)?;
                self.set_elem(&seqv, &idxv, value)
            }
            _ => Err(Error::type_mismatch(
                "Type Error: invalid assignment target",
            )),
        }
    }

    fn set_elem(&mut self, seq: &Value, index: &Value, value: Value) -> Result<()> {
        match seq {
            Value::List(l) => match index {
                Value::Number(n) => {
                    let len = l.borrow().len();
                    let i = normalize_index(*n, len)?;
                    l.borrow_mut()[i] = value;
                    Ok(())
                }
                _ => Err(Error::type_mismatch(format!(
                    "Type Error: list index must be a number (got {})",
                    index.type_name()
                ))),
            },
            Value::Map(m) => {
                // the assign-override hook runs before any entry is touched
                let hook = m.borrow().assign_override.clone();
                if let Some(hook) = hook {
                    if (*hook)(index, &value) {
                        return Ok(());
                    }
                }
                m.borrow_mut().insert(index.clone(), value);
                Ok(())
            }
            Value::Str(_) => Err(Error::type_mismatch(
                "Type Error: strings cannot be modified by index",
            )),
            other => Err(Error::type_mismatch(format!(
                "Type Error: {} does not accept element assignment",
                other.type_name()
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Debugging
    // -----------------------------------------------------------------------

    /// Write the top context's code (with a marker on the current line) and
    /// its variables to the standard-output sink.
    pub fn dump_top_context(&mut self) {
        let mut lines = Vec::new();
        {
            let top = self.top();
            let code = top.code.borrow();
            lines.push("Code:".to_string());
            for (i, line) in code.iter().enumerate() {
                let marker = if i == top.line_num { ">" } else { " " };
                lines.push(format!("{} {:4}: {}", marker, i, line));
            }
            lines.push("Variables:".to_string());
            match &top.variables {
                Some(vars) if !vars.borrow().is_empty() => {
                    for (k, v) in vars.borrow().iter() {
                        lines.push(format!("  {}: {}", k.to_display_string(), v.code_form(3)));
                    }
                }
                _ => lines.push("  (none)".to_string()),
            }
        }
        for line in lines {
            self.out.write_line(&line);
        }
    }
}

fn dest_of(lhs: &Option<Value>) -> Dest {
    match lhs {
        Some(v) => Dest::Ref(v.clone()),
        None => Dest::None,
    }
}

fn jump_target(line: &Line) -> Result<usize> {
    match line.rhs_a.as_ref().and_then(|v| v.as_number()) {
        Some(n) if n >= 0.0 => Ok(n as usize),
        _ => Err(Error::type_mismatch("Type Error: jump target missing")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RuntimeKind, SourceLoc};
    use crate::intrinsic::IntrinsicRegistry;

    fn machine_with(code: Vec<Line>) -> Machine {
        Machine::new(
            Rc::new(RefCell::new(code)),
            Rc::new(RefCell::new(IntrinsicRegistry::new())),
            BuiltinTypes::empty(),
            HostInfo::default(),
        )
    }

    fn loc() -> SourceLoc {
        SourceLoc::new("test", 1)
    }

    #[test]
    fn test_basic_arithmetic_lines() {
        let code = vec![
            Line::new(
                Some(Value::Temp(0)),
                Op::Binary(BinOp::Plus),
                Some(Value::Number(40.0)),
                Some(Value::Number(2.0)),
                loc(),
            ),
            Line::new(
                Some(Value::Var("x".into(), false)),
                Op::Assign,
                Some(Value::Temp(0)),
                None,
                loc(),
            ),
        ];
        let mut m = machine_with(code);
        while !m.done() {
            m.step().unwrap();
        }
        assert_eq!(m.get_global("x"), Some(Value::Number(42.0)));
    }

    #[test]
    fn test_arg_cap() {
        let mut ctx = Context::new(Rc::new(RefCell::new(Vec::new())));
        for _ in 0..MAX_ARGS {
            ctx.push_arg(Value::one()).unwrap();
        }
        let err = ctx.push_arg(Value::one()).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeKind::TooManyArguments));
    }

    #[test]
    fn test_prototype_cycle_fails_key_not_found() {
        let m = machine_with(Vec::new());
        let a = Value::map(ValueMap::new());
        let b = Value::map(ValueMap::new());
        a.as_map().unwrap().borrow_mut().insert_str(ISA_KEY, b.clone());
        b.as_map().unwrap().borrow_mut().insert_str(ISA_KEY, a.clone());
        let err = m.element_lookup(&a, &Value::from("missing")).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeKind::KeyNotFound));
    }

    #[test]
    fn test_error_carries_location() {
        let code = vec![Line::new(
            Some(Value::Temp(0)),
            Op::Assign,
            Some(Value::Var("nope".into(), false)),
            None,
            SourceLoc::new("chunk", 7),
        )];
        let mut m = machine_with(code);
        let err = m.step().unwrap_err();
        assert_eq!(err.location().unwrap().line, 7);
        assert_eq!(
            err.runtime_kind(),
            Some(RuntimeKind::UndefinedIdentifier)
        );
    }

    #[test]
    fn test_reset_preserves_globals() {
        let mut m = machine_with(Vec::new());
        m.set_global("keep", Value::from("me"));
        m.reset();
        assert_eq!(m.get_global("keep"), Some(Value::from("me")));
    }
}
