use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use tacit::{
    HostInfo, Interpreter, IntrinsicResult, IntrinsicSpec, Value, ValueMap,
};

/// Run a source to completion and return (stdout lines, error lines).
fn run(source: &str) -> (Vec<String>, Vec<String>) {
    let mut interp = Interpreter::with_source(source);
    interp.run_until_done(60.0, false);
    (interp.take_output(), interp.take_errors())
}

/// Run a source expected to finish without errors; return stdout lines.
fn output(source: &str) -> Vec<String> {
    let (out, errors) = run(source);
    assert_eq!(errors, Vec::<String>::new(), "unexpected errors for {:?}", source);
    out
}

#[test]
fn test_arithmetic_and_precedence() {
    assert_eq!(output("print 2 + 3 * 4"), vec!["14"]);
    assert_eq!(output("print (2 + 3) * 4"), vec!["20"]);
    assert_eq!(output("print 2^3^2"), vec!["512"]);
    assert_eq!(output("print -2^2"), vec!["-4"]);
    assert_eq!(output("print 10 % 3"), vec!["1"]);
    assert_eq!(output("print 7 / 2"), vec!["3.5"]);
}

#[test]
fn test_string_operations() {
    assert_eq!(output(r#"print "foo" + "bar""#), vec!["foobar"]);
    assert_eq!(output(r#"print "n = " + 3"#), vec!["n = 3"]);
    assert_eq!(output(r#"print "ab" * 3"#), vec!["ababab"]);
    assert_eq!(output(r#"print "hello" / 2"#), vec!["he"]);
    assert_eq!(output(r#"print "isn't ""real""""#), vec![r#"isn't "real""#]);
}

#[test]
fn test_negative_indexing() {
    assert_eq!(output("s = \"hello\"; print s[-1]"), vec!["o"]);
    assert_eq!(output("s = \"hello\"; print s[0]"), vec!["h"]);
    assert_eq!(output("l = [1, 2, 3]; print l[-1]"), vec!["3"]);
    // seq[-k-1] == seq[len-k-1]
    assert_eq!(output("l = [10, 20, 30]; print l[-3]"), vec!["10"]);
}

#[test]
fn test_index_out_of_range() {
    let (_, errors) = run("l = [1, 2]; print l[5]");
    assert!(errors[0].contains("Index Error"), "got: {:?}", errors);
}

#[test]
fn test_prototype_chain() {
    let source = r#"
a = {"x": 1}
b = {}
b.__isa = a
print b.x
"#;
    assert_eq!(output(source), vec!["1"]);
}

#[test]
fn test_prototype_write_does_not_touch_parent() {
    let source = r#"
a = {"x": 1}
b = {}
b.__isa = a
b.x = 2
print b.x
print a.x
"#;
    assert_eq!(output(source), vec!["2", "1"]);
}

#[test]
fn test_key_not_found() {
    let (_, errors) = run("m = {}; print m.missing");
    assert!(errors[0].contains("Key Not Found"), "got: {:?}", errors);
}

#[test]
fn test_if_else_chains() {
    let source = r#"
x = 5
if x > 10 then
print "big"
else if x > 3 then
print "mid"
else
print "small"
end if
"#;
    assert_eq!(output(source), vec!["mid"]);
    assert_eq!(
        output("if 1 then print \"y\" else print \"n\""),
        vec!["y"]
    );
    assert_eq!(
        output("if 0 then print \"y\" else print \"n\""),
        vec!["n"]
    );
}

#[test]
fn test_while_loop_with_break() {
    let source = r#"
i = 0
while true
i = i + 1
if i >= 3 then break
end while
print i
"#;
    assert_eq!(output(source), vec!["3"]);
}

#[test]
fn test_for_loop_with_continue() {
    let source = r#"
total = 0
for i in range(1, 5)
if i % 2 == 0 then continue
total = total + i
end for
print total
"#;
    assert_eq!(output(source), vec!["9"]);
}

#[test]
fn test_nested_loops_break_inner_only() {
    let source = r#"
found = ""
for i in range(1, 3)
for j in range(1, 3)
if j == 2 then break
found = found + i + ":" + j + " "
end for
end for
print found
"#;
    assert_eq!(output(source), vec!["1:1 2:1 3:1 "]);
}

#[test]
fn test_for_over_string_and_map() {
    let source = r#"
out = ""
for c in "abc"
out = out + c + "."
end for
print out
"#;
    assert_eq!(output(source), vec!["a.b.c."]);

    let source = r#"
m = {"a": 1, "b": 2}
total = 0
keys = ""
for kv in m
total = total + kv.value
keys = keys + kv.key
end for
print keys + ":" + total
"#;
    assert_eq!(output(source), vec!["ab:3"]);
}

#[test]
fn test_functions_and_recursion() {
    let source = r#"
fact = function(n)
if n <= 1 then return 1
return n * fact(n - 1)
end function
print fact(6)
"#;
    assert_eq!(output(source), vec!["720"]);
}

#[test]
fn test_parameter_defaults() {
    let source = r#"
greet = function(name, greeting = "hi")
return greeting + ", " + name
end function
print greet("ada")
print greet("ada", "hello")
"#;
    assert_eq!(output(source), vec!["hi, ada", "hello, ada"]);
}

#[test]
fn test_function_reference_auto_invokes() {
    let source = r#"
answer = function()
return 42
end function
x = answer
print x
f = @answer
print f()
"#;
    // `x = answer` calls; `@answer` takes the reference
    assert_eq!(output(source), vec!["42", "42"]);
}

#[test]
fn test_closure_captures_outer_scope() {
    let source = r#"
makeAdder = function(n)
add = function(x)
return x + n
end function
return @add
end function
add5 = makeAdder(5)
print add5(3)
"#;
    assert_eq!(output(source), vec!["8"]);
}

#[test]
fn test_dot_call_binds_self() {
    let source = r#"
account = {"balance": 100}
account.deposit = function(amount)
self.balance = self.balance + amount
return self.balance
end function
print account.deposit(50)
print account.balance
"#;
    assert_eq!(output(source), vec!["150", "150"]);
}

#[test]
fn test_methods_via_prototype() {
    let source = r#"
Animal = {"legs": 4}
Animal.describe = function()
return "has " + self.legs + " legs"
end function
dog = new Animal
print dog.describe
print dog isa Animal
"#;
    assert_eq!(output(source), vec!["has 4 legs", "1"]);
}

#[test]
fn test_isa_builtin_types() {
    assert_eq!(output("print 3 isa number"), vec!["1"]);
    assert_eq!(output("print \"x\" isa string"), vec!["1"]);
    assert_eq!(output("print [] isa list"), vec!["1"]);
    assert_eq!(output("print {} isa map"), vec!["1"]);
    assert_eq!(output("print 3 isa string"), vec!["0"]);
    assert_eq!(output("print null isa null"), vec!["1"]);
}

#[test]
fn test_builtin_methods() {
    assert_eq!(output(r#"print "Hello".upper"#), vec!["HELLO"]);
    assert_eq!(output(r#"print "a,b,c".split(",")"#), vec![r#"["a", "b", "c"]"#]);
    assert_eq!(output("l = [3, 1, 2]; l.sort; print l.join(\",\")"), vec!["1,2,3"]);
    assert_eq!(output("print [1, 2, 3].sum"), vec!["6"]);
    assert_eq!(output("print len([1, 2, 3])"), vec!["3"]);
    assert_eq!(output("print [10, 20].hasIndex(1)"), vec!["1"]);
    assert_eq!(output("print [10, 20].hasIndex(2)"), vec!["0"]);
    assert_eq!(output("print [5, 6, 7].indexOf(6)"), vec!["1"]);
    assert_eq!(output("m = {\"k\": 9}; print m.hasIndex(\"k\")"), vec!["1"]);
}

#[test]
fn test_slicing() {
    assert_eq!(output(r#"print "hello"[1:3]"#), vec!["el"]);
    assert_eq!(output(r#"print "hello"[:2]"#), vec!["he"]);
    assert_eq!(output("print [1, 2, 3, 4][1:]"), vec!["[2, 3, 4]"]);
    assert_eq!(output("print [1, 2, 3, 4][-2:]"), vec!["[3, 4]"]);
}

#[test]
fn test_chained_comparisons() {
    assert_eq!(output("print 1 < 2 < 3"), vec!["1"]);
    assert_eq!(output("print 3 < 2 < 1"), vec!["0"]);
    assert_eq!(output("print 1 < 2 < 2"), vec!["0"]);
}

#[test]
fn test_short_circuit_skips_rhs() {
    let source = r#"
called = 0
f = function()
globals.called = 1
return 1
end function
x = 0 and f
y = 1 or f
print called
print x + y
"#;
    assert_eq!(output(source), vec!["0", "1"]);
}

#[test]
fn test_container_rendering() {
    assert_eq!(output(r#"print [1, "a"]"#), vec![r#"[1, "a"]"#]);
    assert_eq!(output(r#"print {"a": 1}"#), vec![r#"{"a": 1}"#]);
    assert_eq!(output("print null"), vec!["null"]);
}

#[test]
fn test_list_literal_in_loop_is_fresh() {
    let source = r#"
keep = null
for i in range(1, 2)
l = [0]
l.push i
if keep == null then keep = l
end for
print keep
"#;
    // the literal produced a fresh list each pass, so the first one kept
    // its own contents
    assert_eq!(output(source), vec!["[0, 1]"]);
}

#[test]
fn test_runtime_error_skips_frame_and_recovers() {
    let source = r#"
f = function()
print nope
return 1
end function
f
print "after"
"#;
    let mut interp = Interpreter::with_source(source);
    interp.run_until_done(60.0, false);
    let errors = interp.take_errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Undefined Identifier"));
    // the machine is still usable: keep driving to completion
    while !interp.done() {
        interp.run_until_done(60.0, false);
    }
    assert_eq!(interp.take_output(), vec!["after"]);
}

#[test]
fn test_error_message_format() {
    let (_, errors) = run("x = 1\nprint nope");
    assert_eq!(errors.len(), 1);
    assert!(
        errors[0].starts_with("Runtime Error: Undefined Identifier"),
        "got: {}",
        errors[0]
    );
    assert!(errors[0].ends_with("[main line 2]"), "got: {}", errors[0]);
}

#[test]
fn test_assignment_to_reserved_names() {
    let (_, errors) = run("globals = 1");
    assert!(errors[0].contains("can't assign to 'globals'"), "got: {:?}", errors);
    let (_, errors) = run("locals = 1");
    assert!(errors[0].contains("can't assign to 'locals'"), "got: {:?}", errors);
}

#[test]
fn test_compile_error_reported() {
    let mut interp = Interpreter::with_source("x = 1\nend if");
    interp.run_until_done(60.0, false);
    let errors = interp.take_errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Compiler Error:"), "got: {}", errors[0]);
    assert!(!interp.running());
}

#[test]
fn test_globals_persist_across_restart() {
    let mut interp = Interpreter::with_source("x = 42\nprint x");
    interp.run_until_done(60.0, false);
    assert_eq!(interp.take_output(), vec!["42"]);
    interp.restart();
    assert_eq!(interp.get_global("x"), Some(Value::Number(42.0)));
    interp.run_until_done(60.0, false);
    assert_eq!(interp.take_output(), vec!["42"]);
}

#[test]
fn test_reset_is_idempotent() {
    let source = "for i in range(1, 3)\nprint i * i\nend for";
    let mut interp = Interpreter::with_source(source);
    interp.run_until_done(60.0, false);
    let first = interp.take_output();
    interp.reset(source);
    interp.run_until_done(60.0, false);
    let second = interp.take_output();
    assert_eq!(first, second);
    assert_eq!(first, vec!["1", "4", "9"]);
}

#[test]
fn test_time_sliced_run_matches_unbounded_run() {
    let source = r#"
i = 0
while i < 20
i = i + 1
print i * 2
end while
"#;
    let mut whole = Interpreter::with_source(source);
    whole.run_until_done(60.0, false);
    let expected = whole.take_output();

    let mut sliced = Interpreter::with_source(source);
    let mut guard = 0;
    while !sliced.done() {
        sliced.run_until_done(0.0, false);
        guard += 1;
        assert!(guard < 100_000, "sliced run failed to make progress");
    }
    assert_eq!(sliced.take_output(), expected);
}

#[test]
fn test_wait_parks_and_resumes() {
    let mut interp = Interpreter::with_source("wait 0.01\nprint \"ok\"");
    interp.run_until_done(60.0, true);
    // during the wait we are handed control back, with nothing printed yet
    assert!(!interp.done());
    assert_eq!(interp.take_output(), Vec::<String>::new());
    while !interp.done() {
        interp.run_until_done(60.0, true);
    }
    assert_eq!(interp.take_output(), vec!["ok"]);
    assert!(interp.take_errors().is_empty());
}

#[test]
fn test_yield_returns_to_host() {
    let mut interp = Interpreter::with_source("yield\nprint \"after yield\"");
    interp.run_until_done(60.0, false);
    assert!(!interp.done());
    assert_eq!(interp.take_output(), Vec::<String>::new());
    interp.run_until_done(60.0, false);
    assert!(interp.done());
    assert_eq!(interp.take_output(), vec!["after yield"]);
}

#[test]
fn test_cooperative_intrinsic_reentry_sequence() {
    let log: Rc<RefCell<Vec<Option<f64>>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = log.clone();
    let mut interp = Interpreter::with_source("x = countdown");
    interp.register_intrinsic(IntrinsicSpec::new("countdown"), move |_, partial| {
        let n = partial.as_ref().and_then(|v| v.as_number());
        seen.borrow_mut().push(n);
        Ok(match n {
            None => IntrinsicResult::Partial(Value::Number(0.0)),
            Some(n) if n < 2.0 => IntrinsicResult::Partial(Value::Number(n + 1.0)),
            Some(n) => IntrinsicResult::Done(Value::Number(n)),
        })
    });
    interp.run_until_done(60.0, false);
    assert!(interp.done());
    // three parks => three re-entries, each fed the stored partial
    assert_eq!(
        *log.borrow(),
        vec![None, Some(0.0), Some(1.0), Some(2.0)]
    );
    assert_eq!(interp.get_global("x"), Some(Value::Number(2.0)));
}

#[test]
fn test_arg_cap_255_ok_256_fails() {
    // a 255-parameter function called with 255 arguments works
    let params: Vec<String> = (0..255).map(|i| format!("p{}", i)).collect();
    let args: Vec<String> = (0..255).map(|i| i.to_string()).collect();
    let source = format!(
        "f = function({})\nreturn p254\nend function\nprint f({})",
        params.join(", "),
        args.join(", ")
    );
    assert_eq!(output(&source), vec!["254"]);

    // pushing a 256th argument fails with Too Many Arguments
    let args: Vec<String> = (0..256).map(|i| i.to_string()).collect();
    let source = format!(
        "f = function({})\nreturn 0\nend function\nprint f({})",
        params.join(", "),
        args.join(", ")
    );
    let (_, errors) = run(&source);
    assert!(errors[0].contains("Too Many Arguments"), "got: {:?}", errors);
}

#[test]
fn test_too_many_args_for_function() {
    let source = "f = function(a)\nreturn a\nend function\nf 1, 2";
    let (_, errors) = run(source);
    assert!(errors[0].contains("Too Many Arguments"), "got: {:?}", errors);
}

#[test]
fn test_prototype_cycle_terminates() {
    let source = r#"
a = {}
b = {}
a.__isa = b
b.__isa = a
print a.missing
"#;
    let (_, errors) = run(source);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Key Not Found"), "got: {:?}", errors);
}

#[test]
fn test_code_form_round_trip() {
    let mut first = Interpreter::with_source(
        r#"v = {"nums": [1, 2.5, "two"], "ok": 1, 3: "three"}"#,
    );
    first.run_until_done(60.0, false);
    let v = first.get_global("v").unwrap();
    let source = format!("w = {}", v.code_form(16));
    let mut second = Interpreter::with_source(&source);
    second.run_until_done(60.0, false);
    assert!(second.take_errors().is_empty());
    let w = second.get_global("w").unwrap();
    assert_eq!(v.equality(&w, 16), 1.0);
}

#[test]
fn test_host_globals_exchange() {
    let mut interp = Interpreter::with_source("doubled = n * 2");
    interp.set_global("n", Value::Number(21.0));
    interp.run_until_done(60.0, false);
    assert_eq!(interp.get_global("doubled"), Some(Value::Number(42.0)));
    // lists cross the boundary by reference
    interp.set_global("l", Value::list(vec![Value::Number(1.0)]));
    assert_eq!(
        interp.get_global("l"),
        Some(Value::list(vec![Value::Number(1.0)]))
    );
}

#[test]
fn test_assign_override_hook_runs_before_write() {
    let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = log.clone();
    let mut map = ValueMap::new();
    map.assign_override = Some(Rc::new(move |key, value| {
        seen.borrow_mut()
            .push(format!("{}={}", key.to_display_string(), value.to_display_string()));
        true // handled: swallow the write
    }));
    let mut interp = Interpreter::with_source("m.x = 5");
    interp.set_global("m", Value::map(map));
    interp.run_until_done(60.0, false);
    assert!(interp.take_errors().is_empty());
    assert_eq!(*log.borrow(), vec!["x=5"]);
    let m = interp.get_global("m").unwrap();
    let m = m.as_map().unwrap().borrow();
    assert!(m.get_str("x").is_none(), "override should swallow the write");
}

#[test]
fn test_version_intrinsic_reports_host_info() {
    let mut interp = Interpreter::with_source("v = version\nprint v.hostName");
    interp.set_host_info(HostInfo {
        name: "TestHost".to_string(),
        info: "https://example.invalid".to_string(),
        version: "9.9".to_string(),
    });
    interp.run_until_done(60.0, false);
    assert!(interp.take_errors().is_empty());
    assert_eq!(interp.take_output(), vec!["TestHost"]);
}

#[test]
fn test_output_callback() {
    let lines: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = lines.clone();
    let mut interp = Interpreter::with_source("print \"routed\"");
    interp.set_output_callback(Box::new(move |s| sink.borrow_mut().push(s.to_string())));
    interp.run_until_done(60.0, false);
    assert_eq!(*lines.borrow(), vec!["routed"]);
    assert!(interp.take_output().is_empty());
}

#[test]
fn test_dump_top_context() {
    let mut interp = Interpreter::with_source("x = 1 + 2");
    interp.run_until_done(60.0, false);
    interp.dump_top_context();
    let out = interp.take_output();
    assert!(out.iter().any(|l| l.starts_with("Code:")));
    assert!(out.iter().any(|l| l.contains("Variables:")));
}
