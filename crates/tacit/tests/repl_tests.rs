use pretty_assertions::assert_eq;
use tacit::{Interpreter, Value};

#[test]
fn test_implicit_results_echo() {
    let mut interp = Interpreter::new();
    interp.repl("x = 6 * 7", 60.0);
    assert_eq!(interp.take_implicit_output(), Vec::<String>::new());
    interp.repl("x", 60.0);
    assert_eq!(interp.take_implicit_output(), vec!["42"]);
    interp.repl("x + 1", 60.0);
    assert_eq!(interp.take_implicit_output(), vec!["43"]);
}

#[test]
fn test_implicit_result_bound_to_underscore() {
    let mut interp = Interpreter::new();
    interp.repl("2 + 3", 60.0);
    assert_eq!(interp.get_global("_"), Some(Value::Number(5.0)));
    interp.repl("_ * 2", 60.0);
    assert_eq!(interp.get_global("_"), Some(Value::Number(10.0)));
}

#[test]
fn test_null_results_are_not_echoed() {
    let mut interp = Interpreter::new();
    interp.repl("print \"side effect\"", 60.0);
    assert_eq!(interp.take_output(), vec!["side effect"]);
    assert_eq!(interp.take_implicit_output(), Vec::<String>::new());
}

#[test]
fn test_block_continuation_across_chunks() {
    let mut interp = Interpreter::new();
    interp.repl("if 2 > 1 then", 60.0);
    assert!(interp.need_more_input());
    interp.repl("y = 10", 60.0);
    assert!(interp.need_more_input());
    interp.repl("end if", 60.0);
    assert!(!interp.need_more_input());
    assert_eq!(interp.get_global("y"), Some(Value::Number(10.0)));
}

#[test]
fn test_function_definition_across_chunks() {
    let mut interp = Interpreter::new();
    interp.repl("twice = function(x)", 60.0);
    assert!(interp.need_more_input());
    interp.repl("return x * 2", 60.0);
    interp.repl("end function", 60.0);
    assert!(!interp.need_more_input());
    interp.repl("twice(21)", 60.0);
    assert_eq!(interp.take_implicit_output(), vec!["42"]);
}

#[test]
fn test_line_continuation_with_open_bracket() {
    let mut interp = Interpreter::new();
    interp.repl("nums = [1, 2,", 60.0);
    assert!(interp.need_more_input());
    interp.repl("3]", 60.0);
    assert!(!interp.need_more_input());
    interp.repl("nums.sum", 60.0);
    assert_eq!(interp.take_implicit_output(), vec!["6"]);
}

#[test]
fn test_line_continuation_trailing_operator_and_comment() {
    let mut interp = Interpreter::new();
    interp.repl("total = 1 + // carry on", 60.0);
    assert!(interp.need_more_input());
    interp.repl("2", 60.0);
    assert!(!interp.need_more_input());
    assert_eq!(interp.get_global("total"), Some(Value::Number(3.0)));
}

#[test]
fn test_globals_persist_between_chunks() {
    let mut interp = Interpreter::new();
    interp.repl("count = 0", 60.0);
    interp.repl("count = count + 1", 60.0);
    interp.repl("count = count + 1", 60.0);
    assert_eq!(interp.get_global("count"), Some(Value::Number(2.0)));
}

#[test]
fn test_stop_clears_pending_block() {
    let mut interp = Interpreter::new();
    interp.repl("while true", 60.0);
    assert!(interp.need_more_input());
    interp.stop();
    assert!(!interp.need_more_input());
    interp.repl("done = 1", 60.0);
    assert_eq!(interp.get_global("done"), Some(Value::Number(1.0)));
}

#[test]
fn test_compile_error_keeps_session_alive() {
    let mut interp = Interpreter::new();
    interp.repl("x = 1", 60.0);
    interp.repl("end while", 60.0);
    let errors = interp.take_errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Compiler Error:"), "got: {}", errors[0]);
    // the session continues, with earlier globals intact
    interp.repl("x + 1", 60.0);
    assert_eq!(interp.take_implicit_output(), vec!["2"]);
}

#[test]
fn test_runtime_error_keeps_session_alive() {
    let mut interp = Interpreter::new();
    interp.repl("boom", 60.0);
    let errors = interp.take_errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Undefined Identifier"));
    interp.repl("ok = 1", 60.0);
    assert_eq!(interp.get_global("ok"), Some(Value::Number(1.0)));
}

#[test]
fn test_loop_executes_within_one_chunk() {
    let mut interp = Interpreter::new();
    interp.repl("total = 0", 60.0);
    interp.repl("for i in range(1, 4)", 60.0);
    interp.repl("total = total + i", 60.0);
    interp.repl("end for", 60.0);
    assert_eq!(interp.get_global("total"), Some(Value::Number(10.0)));
}
