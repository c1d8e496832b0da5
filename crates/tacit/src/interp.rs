//! The interpreter façade: source in, a driveable machine out.
//!
//! [`Interpreter`] bundles a [`Parser`] and a [`Machine`] behind the calls an
//! embedding host actually makes: compile, step, run-until-done with a time
//! budget, REPL-style incremental input, and global get/set. Errors from any
//! stage are caught here, formatted as single lines, sent to the error sink,
//! and answered by skipping the rest of the offending call frame — the
//! machine stays usable and globals survive.

use std::cell::RefCell;
use std::rc::Rc;

use crate::builtins;
use crate::compiler::Parser;
use crate::error::{Error, Result};
use crate::intrinsic::{IntrinsicRegistry, IntrinsicResult, IntrinsicSpec, RegistryRef};
use crate::methods;
use crate::value::Value;
use crate::vm::{BuiltinTypes, Machine, OutputSink};

/// Identity of the embedding application, surfaced to script through the
/// `version` intrinsic.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub name: String,
    pub info: String,
    pub version: String,
}

/// An embeddable interpreter instance.
///
/// # Example
///
/// ```
/// use tacit::Interpreter;
///
/// let mut interp = Interpreter::with_source("print 6 * 7");
/// interp.run_until_done(60.0, true);
/// assert_eq!(interp.take_output(), vec!["42"]);
/// ```
pub struct Interpreter {
    source: String,
    parser: Option<Parser>,
    machine: Option<Machine>,
    registry: RegistryRef,
    types: BuiltinTypes,
    host_info: HostInfo,
    pending_output: Option<Box<dyn FnMut(&str)>>,
    errors: OutputSink,
    implicit: OutputSink,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// A fresh interpreter with the standard intrinsics registered and no
    /// source installed yet.
    pub fn new() -> Self {
        let mut reg = IntrinsicRegistry::new();
        builtins::register_standard(&mut reg);
        let types = methods::install(&mut reg);
        Self {
            source: String::new(),
            parser: None,
            machine: None,
            registry: Rc::new(RefCell::new(reg)),
            types,
            host_info: HostInfo::default(),
            pending_output: None,
            errors: OutputSink::default(),
            implicit: OutputSink::default(),
        }
    }

    pub fn with_source(source: impl Into<String>) -> Self {
        let mut interp = Self::new();
        interp.source = source.into();
        interp
    }

    /// Discard the parser and machine and install new source. Registered
    /// intrinsics survive; globals do not.
    pub fn reset(&mut self, source: impl Into<String>) {
        self.source = source.into();
        self.parser = None;
        self.machine = None;
    }

    /// Parse the installed source and build the machine. Returns false (and
    /// reports through the error sink) on a compile error.
    pub fn compile(&mut self) -> bool {
        if self.machine.is_some() {
            return true;
        }
        if self.parser.is_none() {
            self.parser = Some(Parser::new());
        }
        let source = self.source.clone();
        let result = self.parser.as_mut().unwrap().parse(&source, false);
        match result {
            Ok(()) => {
                let code = self.parser.as_ref().unwrap().root_code();
                let mut machine = Machine::new(
                    code,
                    self.registry.clone(),
                    self.types.clone(),
                    self.host_info.clone(),
                );
                if let Some(cb) = self.pending_output.take() {
                    machine.set_output_callback(cb);
                }
                self.machine = Some(machine);
                true
            }
            Err(e) => {
                self.parser = None;
                self.report_error(&e);
                false
            }
        }
    }

    /// Execute one TAC line (compiling first if needed).
    pub fn step(&mut self) {
        if self.machine.is_none() && !self.compile() {
            return;
        }
        let machine = self.machine.as_mut().unwrap();
        if let Err(e) = machine.step() {
            machine.jump_top_to_end();
            self.report_error(&e);
        }
    }

    /// Drive the machine until it finishes, yields, exceeds the time budget
    /// (seconds, polled after each step), or — when `return_early` is set —
    /// an intrinsic parks a partial result. State is kept between calls, so
    /// repeated invocation resumes exactly where the previous one stopped.
    pub fn run_until_done(&mut self, time_limit: f64, return_early: bool) {
        if self.machine.is_none() && !self.compile() {
            return;
        }
        let start = self.machine.as_ref().unwrap().run_time();
        loop {
            let machine = self.machine.as_mut().unwrap();
            if machine.done() {
                break;
            }
            if machine.yielding() {
                machine.set_yielding(false);
                break;
            }
            if let Err(e) = machine.step() {
                machine.jump_top_to_end();
                self.report_error(&e);
                return;
            }
            let machine = self.machine.as_ref().unwrap();
            if return_early && machine.partial_parked() {
                break;
            }
            if machine.run_time() - start > time_limit {
                break;
            }
        }
    }

    /// Feed one chunk of interactive input. If the parser still needs more
    /// (an open block or continued line), this returns immediately;
    /// otherwise the new code runs within the time budget, and a fresh
    /// implicit result is sent to the implicit-output sink.
    ///
    /// # Example
    ///
    /// ```
    /// use tacit::Interpreter;
    ///
    /// let mut interp = Interpreter::new();
    /// interp.repl("x = 6 * 7", 60.0);
    /// interp.repl("x", 60.0);
    /// assert_eq!(interp.take_implicit_output(), vec!["42"]);
    /// ```
    pub fn repl(&mut self, line: &str, time_limit: f64) {
        if self.machine.is_none() && !self.compile() {
            return;
        }
        self.machine.as_mut().unwrap().set_store_implicit(true);
        let before = self.machine.as_ref().unwrap().implicit_result_count();
        let parse_result = self.parser.as_mut().unwrap().parse(line, true);
        if let Err(e) = parse_result {
            self.report_error(&e);
            return;
        }
        if self.parser.as_ref().unwrap().need_more_input() {
            return;
        }
        self.run_until_done(time_limit, false);
        let implicit_line = {
            let machine = self.machine.as_ref().unwrap();
            if machine.implicit_result_count() > before {
                match machine.get_global("_") {
                    Some(Value::Null) | None => None,
                    Some(v) => Some(v.to_display_string()),
                }
            } else {
                None
            }
        };
        if let Some(line) = implicit_line {
            self.implicit.write_line(&line);
        }
    }

    /// Rewind the machine to the top of the program. Globals set by the
    /// previous run remain.
    pub fn restart(&mut self) {
        if let Some(machine) = &mut self.machine {
            machine.reset();
        }
    }

    /// Abandon the current call frame and any pending interactive block.
    pub fn stop(&mut self) {
        if let Some(machine) = &mut self.machine {
            machine.jump_top_to_end();
        }
        if let Some(parser) = &mut self.parser {
            parser.partial_reset();
        }
    }

    pub fn done(&self) -> bool {
        self.machine.as_ref().is_some_and(|m| m.done())
    }

    pub fn running(&self) -> bool {
        self.machine.as_ref().is_some_and(|m| !m.done())
    }

    pub fn need_more_input(&self) -> bool {
        self.parser.as_ref().is_some_and(|p| p.need_more_input())
    }

    /// Read a global by name (compiles first if needed so that globals set
    /// before running are visible).
    ///
    /// # Example
    ///
    /// ```
    /// use tacit::{Interpreter, Value};
    ///
    /// let mut interp = Interpreter::with_source("y = x + 1");
    /// interp.set_global("x", Value::Number(41.0));
    /// interp.run_until_done(60.0, true);
    /// assert_eq!(interp.get_global("y"), Some(Value::Number(42.0)));
    /// ```
    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.machine.as_ref().and_then(|m| m.get_global(name))
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        if self.machine.is_none() && !self.compile() {
            return;
        }
        self.machine.as_mut().unwrap().set_global(name, value);
    }

    /// Register a host intrinsic. The callable runs with the wrapper context
    /// on top of the stack (parameters readable via [`Machine::local`]) and
    /// may park partial results to cooperate with the scheduler.
    pub fn register_intrinsic<F>(&mut self, spec: IntrinsicSpec, func: F) -> u32
    where
        F: Fn(&mut Machine, Option<Value>) -> Result<IntrinsicResult> + 'static,
    {
        self.registry.borrow_mut().register(spec, Rc::new(func))
    }

    pub fn host_info(&self) -> &HostInfo {
        &self.host_info
    }

    pub fn set_host_info(&mut self, info: HostInfo) {
        self.host_info = info.clone();
        if let Some(machine) = &mut self.machine {
            machine.set_host_info(info);
        }
    }

    /// Drain buffered standard output.
    pub fn take_output(&mut self) -> Vec<String> {
        self.machine
            .as_mut()
            .map(|m| m.take_output())
            .unwrap_or_default()
    }

    /// Drain buffered error lines.
    ///
    /// # Example
    ///
    /// ```
    /// use tacit::Interpreter;
    ///
    /// let mut interp = Interpreter::with_source("print nope");
    /// interp.run_until_done(60.0, true);
    /// let errors = interp.take_errors();
    /// assert!(errors[0].contains("Undefined Identifier"));
    /// ```
    pub fn take_errors(&mut self) -> Vec<String> {
        self.errors.take()
    }

    /// Drain buffered implicit (REPL echo) output.
    pub fn take_implicit_output(&mut self) -> Vec<String> {
        self.implicit.take()
    }

    /// Route standard output to a callback instead of the internal buffer.
    pub fn set_output_callback(&mut self, callback: Box<dyn FnMut(&str)>) {
        match &mut self.machine {
            Some(machine) => machine.set_output_callback(callback),
            None => self.pending_output = Some(callback),
        }
    }

    pub fn set_error_callback(&mut self, callback: Box<dyn FnMut(&str)>) {
        self.errors = OutputSink::Callback(callback);
    }

    pub fn set_implicit_output_callback(&mut self, callback: Box<dyn FnMut(&str)>) {
        self.implicit = OutputSink::Callback(callback);
    }

    /// Debug dump of the current code and variables to standard output.
    pub fn dump_top_context(&mut self) {
        if let Some(machine) = &mut self.machine {
            machine.dump_top_context();
        }
    }

    fn report_error(&mut self, error: &Error) {
        self.errors.write_line(&error.to_string());
    }
}
