//! Single-pass parser/compiler: tokens in, TAC lines out.
//!
//! There is no AST. Expression parsing returns operand [`Value`]s (literals,
//! temps, variable and element references) while emitting lines into the
//! current [`ParseState`]; statement parsing strings those together with
//! back-patched jumps. Forward jumps are emitted with an empty target and a
//! back-patch entry naming the keyword they wait for (`end if`, `end while`,
//! `break`, ...); `continue` targets come from the jump-point stack.
//!
//! Parser state persists across [`Parser::parse`] calls so an interactive
//! host can feed incomplete blocks line by line; [`Parser::need_more_input`]
//! reports whether a block (or a bracket-continued line) is still open.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use crate::error::{Error, Result, SourceLoc};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::tac::{BinOp, CmpOp, Line, Op, UnaryOp};
use crate::value::{FuncDef, Param, Value, ValueMap};

/// A forward jump (or block marker) awaiting its destination.
struct BackPatch {
    line_num: usize,
    wait_for: &'static str,
}

/// A code position that `continue` branches back to.
struct JumpPoint {
    line_num: usize,
    keyword: &'static str,
}

/// One output unit under construction: a growing line list (shared with the
/// function value or root context that will execute it), the back-patch and
/// jump-point stacks, and the next free temp number.
struct ParseState {
    code: Rc<RefCell<Vec<Line>>>,
    backpatches: Vec<BackPatch>,
    jump_points: Vec<JumpPoint>,
    next_temp: u32,
}

impl ParseState {
    fn new() -> Self {
        Self::with_code(Rc::new(RefCell::new(Vec::new())), 0)
    }

    fn with_code(code: Rc<RefCell<Vec<Line>>>, next_temp: u32) -> Self {
        Self {
            code,
            backpatches: Vec::new(),
            jump_points: Vec::new(),
            next_temp,
        }
    }

    fn open(&self) -> bool {
        !self.backpatches.is_empty() || !self.jump_points.is_empty()
    }
}

/// Would a line ending in this token continue onto the next line?
fn token_continues(tok: &Token) -> bool {
    use TokenKind::*;
    match tok.kind {
        OpAssign | OpPlus | OpMinus | OpTimes | OpDivide | OpMod | OpPower | OpEqual
        | OpNotEqual | OpGreater | OpGreatEqual | OpLesser | OpLessEqual | AddressOf | Comma
        | Colon | Dot | LParen | LSquare | LCurly => true,
        Keyword => matches!(tok.text.as_str(), "and" | "or" | "not" | "isa" | "new" | "in"),
        _ => false,
    }
}

/// The compiler. One instance per interpreter; feed it source chunks with
/// [`Parser::parse`] and hand the root code block to a machine.
pub struct Parser {
    /// Context name stamped into source locations and error messages.
    pub error_context: Rc<str>,
    output: ParseState,
    /// Enclosing outputs while a `function ... end function` body is open.
    output_stack: Vec<ParseState>,
    /// A function literal whose body starts after the current statement.
    pending_function: Option<Rc<FuncDef>>,
    /// Buffered source for an interactive line that continues.
    partial_input: String,
    /// Root-code length at the last point with no open blocks. Rolling back
    /// to here can never strand a half-emitted construct (an unpatched jump,
    /// an unbound function body) in the program.
    clean_len: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            error_context: Rc::from("main"),
            output: ParseState::new(),
            output_stack: Vec::new(),
            pending_function: None,
            partial_input: String::new(),
            clean_len: 0,
        }
    }

    /// The top-level code block (the root context's program).
    pub fn root_code(&self) -> Rc<RefCell<Vec<Line>>> {
        match self.output_stack.first() {
            Some(state) => state.code.clone(),
            None => self.output.code.clone(),
        }
    }

    /// True while a multi-line block or continued line is open.
    pub fn need_more_input(&self) -> bool {
        !self.partial_input.is_empty()
            || !self.output_stack.is_empty()
            || self.output.open()
            || self.pending_function.is_some()
    }

    /// Abandon any open blocks and buffered partial input, keeping all
    /// completely compiled code.
    pub fn partial_reset(&mut self) {
        self.partial_input.clear();
        self.reset_block_state();
        self.root_code().borrow_mut().truncate(self.clean_len);
    }

    fn reset_block_state(&mut self) {
        while let Some(prev) = self.output_stack.pop() {
            self.output = prev;
        }
        self.output.backpatches.clear();
        self.output.jump_points.clear();
        self.pending_function = None;
    }

    /// Compile one source chunk, appending lines to the current output.
    ///
    /// In REPL mode a chunk whose last meaningful token implies continuation
    /// (open bracket, comma, operator) is buffered instead of parsed, and
    /// open blocks are left pending for the next chunk. Outside REPL mode an
    /// open block at end of input is a *Compiler* error. On any error, lines
    /// emitted by the failed chunk are rolled back and block state is reset;
    /// previously compiled code and the machine keep working.
    pub fn parse(&mut self, source: &str, repl_mode: bool) -> Result<()> {
        if repl_mode && !source.trim().is_empty() {
            let last = Lexer::last_token(source);
            if token_continues(&last) {
                self.store_partial(source);
                return Ok(());
            }
        }
        let combined = if self.partial_input.is_empty() {
            source.to_string()
        } else {
            let mut s = mem::take(&mut self.partial_input);
            s.push_str(source);
            s
        };
        let root_code = self.root_code();
        let mut tokens = Lexer::new(&combined);
        let result = self.parse_lines(&mut tokens).and_then(|()| {
            if !repl_mode && self.need_more_input() {
                Err(Error::compiler(
                    "unexpected end of script: a block is still open",
                ))
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            // roll back to the last clean state so no half-emitted
            // construct is left reachable
            self.reset_block_state();
            root_code.borrow_mut().truncate(self.clean_len);
            let loc = SourceLoc::new(self.error_context.clone(), tokens.line_num());
            return Err(e.with_location(loc));
        }
        if !self.need_more_input() {
            self.clean_len = root_code.borrow().len();
        }
        Ok(())
    }

    fn store_partial(&mut self, source: &str) {
        // only the last line's comment must go; earlier lines keep theirs
        match source.rfind('\n') {
            Some(i) => {
                self.partial_input.push_str(&source[..=i]);
                self.partial_input.push_str(Lexer::trim_comment(&source[i + 1..]));
            }
            None => self.partial_input.push_str(Lexer::trim_comment(source)),
        }
    }

    fn parse_lines(&mut self, tokens: &mut Lexer) -> Result<()> {
        while !tokens.at_end() {
            self.parse_statement(tokens, false)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Emission helpers
    // -----------------------------------------------------------------------

    fn loc(&self, tokens: &Lexer) -> SourceLoc {
        SourceLoc::new(self.error_context.clone(), tokens.line_num())
    }

    fn err_at(&self, tokens: &Lexer, message: String) -> Error {
        Error::compiler(message).with_location(self.loc(tokens))
    }

    fn add_line(
        &mut self,
        lhs: Option<Value>,
        op: Op,
        rhs_a: Option<Value>,
        rhs_b: Option<Value>,
        loc: SourceLoc,
    ) {
        self.output
            .code
            .borrow_mut()
            .push(Line::new(lhs, op, rhs_a, rhs_b, loc));
    }

    fn here(&self) -> usize {
        self.output.code.borrow().len()
    }

    fn patch(&mut self, line_num: usize, dest: usize) {
        self.output.code.borrow_mut()[line_num].rhs_a = Some(Value::Number(dest as f64));
    }

    fn push_backpatch(&mut self, line_num: usize, wait_for: &'static str) {
        self.output.backpatches.push(BackPatch { line_num, wait_for });
    }

    fn new_temp(&mut self) -> u32 {
        let t = self.output.next_temp;
        self.output.next_temp += 1;
        t
    }

    fn require(&mut self, tokens: &mut Lexer, kind: TokenKind, what: &str) -> Result<Token> {
        let tok = tokens.dequeue()?;
        if tok.kind != kind {
            return Err(self.err_at(tokens, format!("expected {}, got '{}'", what, tok.text)));
        }
        Ok(tok)
    }

    fn require_keyword(&mut self, tokens: &mut Lexer, word: &str) -> Result<()> {
        let tok = tokens.dequeue()?;
        if !tok.is_keyword(word) {
            return Err(self.err_at(tokens, format!("expected '{}', got '{}'", word, tok.text)));
        }
        Ok(())
    }

    /// Skip end-of-line tokens inside brackets (line continuation).
    fn skip_eols(&mut self, tokens: &mut Lexer) -> Result<()> {
        while !tokens.at_end() && tokens.peek()?.kind == TokenKind::EOL {
            tokens.dequeue()?;
        }
        Ok(())
    }

    /// Materialize an operand into something later lines can consume
    /// directly: references and literals that need per-execution evaluation
    /// go through a temp; plain scalars and temps pass through.
    fn fully_evaluate(&mut self, value: Value, tokens: &Lexer) -> Result<Value> {
        let loc = self.loc(tokens);
        let materialized = match value {
            Value::Var(..) => {
                let t = self.new_temp();
                self.add_line(Some(Value::Temp(t)), Op::Assign, Some(value), None, loc);
                Value::Temp(t)
            }
            Value::SeqElem(se) if !se.no_invoke => {
                let t = self.new_temp();
                self.add_line(
                    Some(Value::Temp(t)),
                    Op::ElemLoad,
                    Some(se.seq),
                    Some(se.index),
                    loc,
                );
                Value::Temp(t)
            }
            Value::SeqElem(se) => {
                let t = self.new_temp();
                self.add_line(
                    Some(Value::Temp(t)),
                    Op::Assign,
                    Some(Value::SeqElem(se)),
                    None,
                    loc,
                );
                Value::Temp(t)
            }
            Value::List(_) | Value::Map(_) => {
                let t = self.new_temp();
                self.add_line(Some(Value::Temp(t)), Op::Copy, Some(value), None, loc);
                Value::Temp(t)
            }
            Value::Function(..) => {
                let t = self.new_temp();
                self.add_line(Some(Value::Temp(t)), Op::BindAssign, Some(value), None, loc);
                Value::Temp(t)
            }
            other => other,
        };
        Ok(materialized)
    }

    /// Emit an assignment, picking the opcode by the shape of both sides.
    fn emit_assign(&mut self, lhs: Value, rhs: Value, loc: SourceLoc) {
        match (&lhs, &rhs) {
            (_, Value::Function(..)) => self.add_line(Some(lhs), Op::BindAssign, Some(rhs), None, loc),
            (_, Value::List(_)) | (_, Value::Map(_)) => {
                self.add_line(Some(lhs), Op::Copy, Some(rhs), None, loc)
            }
            (Value::SeqElem(_), _) => self.add_line(Some(lhs), Op::ElemStore, Some(rhs), None, loc),
            _ => self.add_line(Some(lhs), Op::Assign, Some(rhs), None, loc),
        }
    }

    fn emit_implicit(&mut self, rhs: Value, tokens: &Lexer) -> Result<()> {
        let rhs = match rhs {
            Value::Function(..) | Value::List(_) | Value::Map(_) => {
                self.fully_evaluate(rhs, tokens)?
            }
            other => other,
        };
        let loc = self.loc(tokens);
        self.add_line(None, Op::AssignImplicit, Some(rhs), None, loc);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Back-patch plumbing
    // -----------------------------------------------------------------------

    /// Patch the open `if` branch to land here: skip `break` and completed
    /// `end if` entries, then patch and remove the waiting `else` entry.
    fn patch_else(&mut self) -> Result<()> {
        let here = self.here();
        let mut found: Option<usize> = None;
        for (i, bp) in self.output.backpatches.iter().enumerate().rev() {
            match bp.wait_for {
                "break" | "end if" => continue,
                "else" => {
                    found = Some(i);
                    break;
                }
                _ => break,
            }
        }
        let Some(i) = found else {
            return Err(Error::compiler("'else' without matching 'if'"));
        };
        let line = self.output.backpatches.remove(i).line_num;
        self.patch(line, here);
        Ok(())
    }

    /// Close an `if` block: patch everything down to (and including) the
    /// distinguished `if:MARK` entry pushed when the block opened. `break`
    /// entries pass through untouched for the enclosing loop.
    fn patch_end_if(&mut self) -> Result<()> {
        let here = self.here();
        let mut to_patch: Vec<usize> = Vec::new();
        let mut to_remove: Vec<usize> = Vec::new();
        let mut found_mark = false;
        for (i, bp) in self.output.backpatches.iter().enumerate().rev() {
            match bp.wait_for {
                "break" => continue,
                "else" | "end if" => {
                    to_patch.push(bp.line_num);
                    to_remove.push(i);
                }
                "if:MARK" => {
                    to_remove.push(i);
                    found_mark = true;
                    break;
                }
                _ => break,
            }
        }
        if !found_mark {
            return Err(Error::compiler("'end if' without matching 'if'"));
        }
        for i in to_remove {
            self.output.backpatches.remove(i);
        }
        for line in to_patch {
            self.patch(line, here);
        }
        Ok(())
    }

    /// Close a `while`/`for`: emit the jump back to the loop top, then send
    /// the loop's exit condition and any pending `break`s to the line after.
    fn close_loop(&mut self, kw: &'static str, endkw: &'static str, loc: SourceLoc) -> Result<()> {
        let mismatch = || Error::compiler(format!("'{}' without matching '{}'", endkw, kw));
        let Some(jp) = self.output.jump_points.pop() else {
            return Err(mismatch());
        };
        if jp.keyword != kw {
            return Err(mismatch());
        }
        self.add_line(
            None,
            Op::Goto,
            Some(Value::Number(jp.line_num as f64)),
            None,
            loc,
        );
        let exit = self.here();
        let mut to_patch: Vec<usize> = Vec::new();
        let mut to_remove: Vec<usize> = Vec::new();
        let mut closed = false;
        for (i, bp) in self.output.backpatches.iter().enumerate().rev() {
            if bp.wait_for == "break" || bp.wait_for == endkw {
                to_patch.push(bp.line_num);
                to_remove.push(i);
                if bp.wait_for == endkw {
                    closed = true;
                    break;
                }
            } else {
                break;
            }
        }
        if !closed {
            return Err(mismatch());
        }
        for i in to_remove {
            self.output.backpatches.remove(i);
        }
        for line in to_patch {
            self.patch(line, exit);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    /// Parse one statement. In `single_line` mode (the body of a one-line
    /// `if`) the trailing end-of-line is left for the caller.
    fn parse_statement(&mut self, tokens: &mut Lexer, single_line: bool) -> Result<()> {
        let tok = tokens.peek()?;
        if tok.kind == TokenKind::EOL {
            if !single_line {
                tokens.dequeue()?;
            }
            return Ok(());
        }
        let loc = self.loc(tokens);
        if tok.kind == TokenKind::Keyword {
            match tok.text.as_str() {
                "return" => {
                    tokens.dequeue()?;
                    let next = tokens.peek()?;
                    let rhs = if next.kind == TokenKind::EOL
                        || next.is_keyword("else")
                        || next.is_keyword("else if")
                    {
                        Value::Null
                    } else {
                        self.parse_expr(tokens)?
                    };
                    self.emit_assign(Value::Temp(0), rhs, loc.clone());
                    self.add_line(None, Op::Return, None, None, loc);
                }
                "if" => {
                    tokens.dequeue()?;
                    self.parse_if(tokens, single_line)?;
                }
                "else" => {
                    tokens.dequeue()?;
                    let j = self.here();
                    self.add_line(None, Op::Goto, None, None, loc);
                    self.push_backpatch(j, "end if");
                    self.patch_else()?;
                    if tokens.peek()?.kind != TokenKind::EOL {
                        self.parse_statement(tokens, true)?;
                    }
                }
                "else if" => {
                    tokens.dequeue()?;
                    let j = self.here();
                    self.add_line(None, Op::Goto, None, None, loc.clone());
                    self.push_backpatch(j, "end if");
                    self.patch_else()?;
                    let cond = self.parse_expr(tokens)?;
                    let cond = self.fully_evaluate(cond, tokens)?;
                    self.require_keyword(tokens, "then")?;
                    let n = self.here();
                    self.add_line(None, Op::GotoIfNotB, None, Some(cond), loc);
                    self.push_backpatch(n, "else");
                }
                "end if" => {
                    tokens.dequeue()?;
                    self.patch_end_if()?;
                }
                "while" => {
                    tokens.dequeue()?;
                    let top = self.here();
                    self.output.jump_points.push(JumpPoint {
                        line_num: top,
                        keyword: "while",
                    });
                    let cond = self.parse_expr(tokens)?;
                    let cond = self.fully_evaluate(cond, tokens)?;
                    let n = self.here();
                    self.add_line(None, Op::GotoIfNotB, None, Some(cond), loc);
                    self.push_backpatch(n, "end while");
                }
                "end while" => {
                    tokens.dequeue()?;
                    self.close_loop("while", "end while", loc)?;
                }
                "for" => {
                    tokens.dequeue()?;
                    let var_tok =
                        self.require(tokens, TokenKind::Identifier, "a loop variable name")?;
                    self.require_keyword(tokens, "in")?;
                    let seq = self.parse_expr(tokens)?;
                    let seq = self.fully_evaluate(seq, tokens)?;
                    let idx = self.new_temp();
                    self.add_line(
                        Some(Value::Temp(idx)),
                        Op::Assign,
                        Some(Value::Number(-1.0)),
                        None,
                        loc.clone(),
                    );
                    let top = self.here();
                    self.output.jump_points.push(JumpPoint {
                        line_num: top,
                        keyword: "for",
                    });
                    self.add_line(
                        Some(Value::Temp(idx)),
                        Op::Binary(BinOp::Plus),
                        Some(Value::Temp(idx)),
                        Some(Value::one()),
                        loc.clone(),
                    );
                    let len = self.new_temp();
                    self.add_line(
                        Some(Value::Temp(len)),
                        Op::Length,
                        Some(seq.clone()),
                        None,
                        loc.clone(),
                    );
                    let cmp = self.new_temp();
                    self.add_line(
                        Some(Value::Temp(cmp)),
                        Op::Compare(CmpOp::Lesser),
                        Some(Value::Temp(idx)),
                        Some(Value::Temp(len)),
                        loc.clone(),
                    );
                    let n = self.here();
                    self.add_line(None, Op::GotoIfNotB, None, Some(Value::Temp(cmp)), loc.clone());
                    self.push_backpatch(n, "end for");
                    self.add_line(
                        Some(Value::Var(Rc::from(var_tok.text.as_str()), false)),
                        Op::ElemIter,
                        Some(seq),
                        Some(Value::Temp(idx)),
                        loc,
                    );
                }
                "end for" => {
                    tokens.dequeue()?;
                    self.close_loop("for", "end for", loc)?;
                }
                "break" => {
                    tokens.dequeue()?;
                    if self.output.jump_points.is_empty() {
                        return Err(self.err_at(tokens, "'break' outside of a loop".to_string()));
                    }
                    let j = self.here();
                    self.add_line(None, Op::Goto, None, None, loc);
                    self.push_backpatch(j, "break");
                }
                "continue" => {
                    tokens.dequeue()?;
                    let Some(jp) = self.output.jump_points.last() else {
                        return Err(
                            self.err_at(tokens, "'continue' outside of a loop".to_string())
                        );
                    };
                    let target = jp.line_num as f64;
                    self.add_line(None, Op::Goto, Some(Value::Number(target)), None, loc);
                }
                "end function" => {
                    tokens.dequeue()?;
                    if self.output_stack.is_empty() {
                        return Err(self.err_at(
                            tokens,
                            "'end function' without matching 'function'".to_string(),
                        ));
                    }
                    if self.output.open() {
                        return Err(self.err_at(
                            tokens,
                            "'end function' reached with an unclosed block".to_string(),
                        ));
                    }
                    self.output = self.output_stack.pop().unwrap();
                }
                _ => self.parse_assignment(tokens)?,
            }
        } else {
            self.parse_assignment(tokens)?;
        }

        if !single_line {
            let t = tokens.peek()?;
            if t.kind != TokenKind::EOL {
                return Err(
                    self.err_at(tokens, format!("extra token '{}' at end of statement", t.text))
                );
            }
            tokens.dequeue()?;
        }

        if let Some(def) = self.pending_function.take() {
            if single_line {
                return Err(self.err_at(
                    tokens,
                    "a function body must start on a new line".to_string(),
                ));
            }
            let state = ParseState::with_code(def.code.clone(), 1);
            self.output_stack.push(mem::replace(&mut self.output, state));
        }
        Ok(())
    }

    /// `if` statement, both multi-line and single-line forms. The condition
    /// has already had its `if` keyword consumed.
    fn parse_if(&mut self, tokens: &mut Lexer, in_single_line: bool) -> Result<()> {
        let loc = self.loc(tokens);
        let cond = self.parse_expr(tokens)?;
        let cond = self.fully_evaluate(cond, tokens)?;
        self.require_keyword(tokens, "then")?;

        if tokens.peek()?.kind == TokenKind::EOL {
            if in_single_line {
                return Err(self.err_at(
                    tokens,
                    "expected a statement after 'then' on the same line".to_string(),
                ));
            }
            // multi-line: the body is parsed by the flat statement loop;
            // the marker lets `end if` find where this block began.
            self.push_backpatch(self.here(), "if:MARK");
            let n = self.here();
            self.add_line(None, Op::GotoIfNotB, None, Some(cond), loc);
            self.push_backpatch(n, "else");
            return Ok(());
        }

        // single-line: if c then stmt [else stmt] — patched immediately
        let n = self.here();
        self.add_line(None, Op::GotoIfNotB, None, Some(cond), loc.clone());
        self.parse_statement(tokens, true)?;
        let next = tokens.peek()?;
        if next.is_keyword("else") {
            tokens.dequeue()?;
            let j = self.here();
            self.add_line(None, Op::Goto, None, None, loc);
            let here = self.here();
            self.patch(n, here);
            self.parse_statement(tokens, true)?;
            let end = self.here();
            self.patch(j, end);
        } else if next.is_keyword("else if") {
            tokens.dequeue()?;
            let j = self.here();
            self.add_line(None, Op::Goto, None, None, loc);
            let here = self.here();
            self.patch(n, here);
            self.parse_if(tokens, true)?;
            let end = self.here();
            self.patch(j, end);
        } else {
            let here = self.here();
            self.patch(n, here);
        }
        Ok(())
    }

    /// Assignment, expression statement, or command-style call.
    fn parse_assignment(&mut self, tokens: &mut Lexer) -> Result<()> {
        let expr = self.parse_expr(tokens)?;
        let tok = tokens.peek()?;
        let loc = self.loc(tokens);

        if tok.kind == TokenKind::EOL || tok.is_keyword("else") || tok.is_keyword("else if") {
            return self.emit_implicit(expr, tokens);
        }

        if tok.kind == TokenKind::OpAssign {
            tokens.dequeue()?;
            match &expr {
                Value::Var(_, false) | Value::SeqElem(_) => {}
                Value::Var(_, true) => {
                    return Err(
                        self.err_at(tokens, "can't assign to an '@' reference".to_string())
                    );
                }
                _ => {
                    return Err(
                        self.err_at(tokens, "improper assignment target".to_string())
                    );
                }
            }
            let rhs = self.parse_expr(tokens)?;
            self.emit_assign(expr, rhs, loc);
            return Ok(());
        }

        // command syntax: a callable reference followed by arguments
        if !matches!(expr, Value::Var(..) | Value::SeqElem(_)) {
            return Err(self.err_at(tokens, format!("unexpected token '{}'", tok.text)));
        }
        let mut arg_count = 0usize;
        loop {
            let arg = self.parse_expr(tokens)?;
            let arg = self.fully_evaluate(arg, tokens)?;
            self.add_line(None, Op::PushParam, Some(arg), None, loc.clone());
            arg_count += 1;
            if tokens.peek()?.kind == TokenKind::Comma {
                tokens.dequeue()?;
            } else {
                break;
            }
        }
        let t = self.new_temp();
        self.add_line(
            Some(Value::Temp(t)),
            Op::CallFunction,
            Some(expr),
            Some(Value::Number(arg_count as f64)),
            loc.clone(),
        );
        self.add_line(None, Op::AssignImplicit, Some(Value::Temp(t)), None, loc);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Expressions (precedence climbing, lowest first)
    // -----------------------------------------------------------------------

    fn parse_expr(&mut self, tokens: &mut Lexer) -> Result<Value> {
        self.parse_or(tokens)
    }

    /// `or`, short-circuiting through `GotoAifTrulyB`: when the left side is
    /// strictly true we skip evaluating the right side and land on a line
    /// that forces the result to 1.
    fn parse_or(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let mut val = self.parse_and(tokens)?;
        let mut jumps: Vec<usize> = Vec::new();
        let mut temp = 0u32;
        while tokens.peek()?.is_keyword("or") {
            tokens.dequeue()?;
            let loc = self.loc(tokens);
            let a = self.fully_evaluate(val, tokens)?;
            let j = self.here();
            self.add_line(None, Op::GotoIfTrulyB, None, Some(a.clone()), loc.clone());
            jumps.push(j);
            let rhs = self.parse_and(tokens)?;
            let b = self.fully_evaluate(rhs, tokens)?;
            temp = self.new_temp();
            self.add_line(
                Some(Value::Temp(temp)),
                Op::Binary(BinOp::Or),
                Some(a),
                Some(b),
                loc,
            );
            val = Value::Temp(temp);
        }
        if !jumps.is_empty() {
            let loc = self.loc(tokens);
            self.add_line(
                None,
                Op::Goto,
                Some(Value::Number((self.here() + 2) as f64)),
                None,
                loc.clone(),
            );
            let shortcut = self.here();
            self.add_line(Some(Value::Temp(temp)), Op::Assign, Some(Value::one()), None, loc);
            for j in jumps {
                self.patch(j, shortcut);
            }
        }
        Ok(val)
    }

    /// `and`, short-circuiting through `GotoAifNotB` to a line forcing 0.
    fn parse_and(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let mut val = self.parse_not(tokens)?;
        let mut jumps: Vec<usize> = Vec::new();
        let mut temp = 0u32;
        while tokens.peek()?.is_keyword("and") {
            tokens.dequeue()?;
            let loc = self.loc(tokens);
            let a = self.fully_evaluate(val, tokens)?;
            let j = self.here();
            self.add_line(None, Op::GotoIfNotB, None, Some(a.clone()), loc.clone());
            jumps.push(j);
            let rhs = self.parse_not(tokens)?;
            let b = self.fully_evaluate(rhs, tokens)?;
            temp = self.new_temp();
            self.add_line(
                Some(Value::Temp(temp)),
                Op::Binary(BinOp::And),
                Some(a),
                Some(b),
                loc,
            );
            val = Value::Temp(temp);
        }
        if !jumps.is_empty() {
            let loc = self.loc(tokens);
            self.add_line(
                None,
                Op::Goto,
                Some(Value::Number((self.here() + 2) as f64)),
                None,
                loc.clone(),
            );
            let shortcut = self.here();
            self.add_line(Some(Value::Temp(temp)), Op::Assign, Some(Value::zero()), None, loc);
            for j in jumps {
                self.patch(j, shortcut);
            }
        }
        Ok(val)
    }

    fn parse_not(&mut self, tokens: &mut Lexer) -> Result<Value> {
        if tokens.peek()?.is_keyword("not") {
            tokens.dequeue()?;
            let loc = self.loc(tokens);
            let operand = self.parse_not(tokens)?;
            let a = self.fully_evaluate(operand, tokens)?;
            let t = self.new_temp();
            self.add_line(Some(Value::Temp(t)), Op::Unary(UnaryOp::Not), Some(a), None, loc);
            return Ok(Value::Temp(t));
        }
        self.parse_comparisons(tokens)
    }

    /// Left-associative comparison chain: `a < b < c` multiplies the
    /// pairwise results, so the chain is true only when every link is.
    fn parse_comparisons(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let mut val = self.parse_add_sub(tokens)?;
        let mut chain: Option<u32> = None;
        loop {
            let op = match tokens.peek()?.kind {
                TokenKind::OpEqual => CmpOp::Equal,
                TokenKind::OpNotEqual => CmpOp::NotEqual,
                TokenKind::OpGreater => CmpOp::Greater,
                TokenKind::OpGreatEqual => CmpOp::GreatOrEqual,
                TokenKind::OpLesser => CmpOp::Lesser,
                TokenKind::OpLessEqual => CmpOp::LessOrEqual,
                _ => break,
            };
            tokens.dequeue()?;
            let loc = self.loc(tokens);
            let a = self.fully_evaluate(val, tokens)?;
            let rhs = self.parse_add_sub(tokens)?;
            let b = self.fully_evaluate(rhs, tokens)?;
            let t = self.new_temp();
            self.add_line(
                Some(Value::Temp(t)),
                Op::Compare(op),
                Some(a),
                Some(b.clone()),
                loc.clone(),
            );
            chain = Some(match chain {
                None => t,
                Some(prev) => {
                    let combined = self.new_temp();
                    self.add_line(
                        Some(Value::Temp(combined)),
                        Op::Binary(BinOp::Times),
                        Some(Value::Temp(prev)),
                        Some(Value::Temp(t)),
                        loc,
                    );
                    combined
                }
            });
            val = b;
        }
        Ok(match chain {
            Some(t) => Value::Temp(t),
            None => val,
        })
    }

    fn parse_add_sub(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let mut val = self.parse_mult_div(tokens)?;
        loop {
            let op = match tokens.peek()?.kind {
                TokenKind::OpPlus => BinOp::Plus,
                TokenKind::OpMinus => BinOp::Minus,
                _ => break,
            };
            tokens.dequeue()?;
            let loc = self.loc(tokens);
            let a = self.fully_evaluate(val, tokens)?;
            let rhs = self.parse_mult_div(tokens)?;
            let b = self.fully_evaluate(rhs, tokens)?;
            let t = self.new_temp();
            self.add_line(Some(Value::Temp(t)), Op::Binary(op), Some(a), Some(b), loc);
            val = Value::Temp(t);
        }
        Ok(val)
    }

    fn parse_mult_div(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let mut val = self.parse_unary_minus(tokens)?;
        loop {
            let op = match tokens.peek()?.kind {
                TokenKind::OpTimes => BinOp::Times,
                TokenKind::OpDivide => BinOp::DividedBy,
                TokenKind::OpMod => BinOp::Mod,
                _ => break,
            };
            tokens.dequeue()?;
            let loc = self.loc(tokens);
            let a = self.fully_evaluate(val, tokens)?;
            let rhs = self.parse_unary_minus(tokens)?;
            let b = self.fully_evaluate(rhs, tokens)?;
            let t = self.new_temp();
            self.add_line(Some(Value::Temp(t)), Op::Binary(op), Some(a), Some(b), loc);
            val = Value::Temp(t);
        }
        Ok(val)
    }

    fn parse_unary_minus(&mut self, tokens: &mut Lexer) -> Result<Value> {
        if tokens.peek()?.kind == TokenKind::OpMinus {
            tokens.dequeue()?;
            let loc = self.loc(tokens);
            let operand = self.parse_unary_minus(tokens)?;
            if let Value::Number(n) = operand {
                return Ok(Value::Number(-n));
            }
            let a = self.fully_evaluate(operand, tokens)?;
            let t = self.new_temp();
            self.add_line(Some(Value::Temp(t)), Op::Unary(UnaryOp::Minus), Some(a), None, loc);
            return Ok(Value::Temp(t));
        }
        self.parse_power(tokens)
    }

    /// `^` is right-associative; the exponent re-enters at unary-minus level
    /// so `2^-3` and `2^3^2` both parse naturally.
    fn parse_power(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let mut val = self.parse_isa(tokens)?;
        while tokens.peek()?.kind == TokenKind::OpPower {
            tokens.dequeue()?;
            let loc = self.loc(tokens);
            let a = self.fully_evaluate(val, tokens)?;
            let rhs = self.parse_unary_minus(tokens)?;
            let b = self.fully_evaluate(rhs, tokens)?;
            let t = self.new_temp();
            self.add_line(
                Some(Value::Temp(t)),
                Op::Binary(BinOp::Power),
                Some(a),
                Some(b),
                loc,
            );
            val = Value::Temp(t);
        }
        Ok(val)
    }

    fn parse_isa(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let mut val = self.parse_call(tokens)?;
        while tokens.peek()?.is_keyword("isa") {
            tokens.dequeue()?;
            let loc = self.loc(tokens);
            let a = self.fully_evaluate(val, tokens)?;
            let rhs = self.parse_call(tokens)?;
            let b = self.fully_evaluate(rhs, tokens)?;
            let t = self.new_temp();
            self.add_line(
                Some(Value::Temp(t)),
                Op::Binary(BinOp::Isa),
                Some(a),
                Some(b),
                loc,
            );
            val = Value::Temp(t);
        }
        Ok(val)
    }

    /// Postfix chain: `.name`, `[index]`, `[from:to]`, and `(args)`.
    fn parse_call(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let mut val = self.parse_atom(tokens)?;
        loop {
            match tokens.peek()?.kind {
                TokenKind::Dot => {
                    tokens.dequeue()?;
                    // materialize the base: element references collapse via
                    // ElemLoad, bare variables resolve (auto-invoking a
                    // parameterless function), and container literals copy so
                    // the code's literal is never mutated in place
                    if matches!(
                        val,
                        Value::SeqElem(_) | Value::Var(..) | Value::List(_) | Value::Map(_)
                    ) {
                        val = self.fully_evaluate(val, tokens)?;
                    }
                    let name = self.require(tokens, TokenKind::Identifier, "an identifier after '.'")?;
                    val = Value::seq_elem(val, Value::from(name.text.as_str()), false);
                }
                TokenKind::LSquare => {
                    tokens.dequeue()?;
                    if matches!(
                        val,
                        Value::SeqElem(_) | Value::Var(..) | Value::List(_) | Value::Map(_)
                    ) {
                        val = self.fully_evaluate(val, tokens)?;
                    }
                    self.skip_eols(tokens)?;
                    let mut from = Value::Null;
                    if tokens.peek()?.kind != TokenKind::Colon {
                        from = self.parse_expr(tokens)?;
                    }
                    if tokens.peek()?.kind == TokenKind::Colon {
                        // slice syntax lowers to the slice intrinsic
                        tokens.dequeue()?;
                        let to = if tokens.peek()?.kind == TokenKind::RSquare {
                            Value::Null
                        } else {
                            self.parse_expr(tokens)?
                        };
                        self.require(tokens, TokenKind::RSquare, "']'")?;
                        let loc = self.loc(tokens);
                        let base = self.fully_evaluate(val, tokens)?;
                        let from = self.fully_evaluate(from, tokens)?;
                        let to = self.fully_evaluate(to, tokens)?;
                        self.add_line(None, Op::PushParam, Some(base), None, loc.clone());
                        self.add_line(None, Op::PushParam, Some(from), None, loc.clone());
                        self.add_line(None, Op::PushParam, Some(to), None, loc.clone());
                        let t = self.new_temp();
                        self.add_line(
                            Some(Value::Temp(t)),
                            Op::CallFunction,
                            Some(Value::Var(Rc::from("slice"), false)),
                            Some(Value::Number(3.0)),
                            loc,
                        );
                        val = Value::Temp(t);
                    } else {
                        self.require(tokens, TokenKind::RSquare, "']'")?;
                        let idx = self.fully_evaluate(from, tokens)?;
                        val = Value::seq_elem(val, idx, false);
                    }
                }
                TokenKind::LParen => {
                    tokens.dequeue()?;
                    let loc = self.loc(tokens);
                    let mut arg_count = 0usize;
                    self.skip_eols(tokens)?;
                    if tokens.peek()?.kind != TokenKind::RParen {
                        loop {
                            let arg = self.parse_expr(tokens)?;
                            let arg = self.fully_evaluate(arg, tokens)?;
                            self.add_line(None, Op::PushParam, Some(arg), None, loc.clone());
                            arg_count += 1;
                            self.skip_eols(tokens)?;
                            if tokens.peek()?.kind == TokenKind::Comma {
                                tokens.dequeue()?;
                                self.skip_eols(tokens)?;
                            } else {
                                break;
                            }
                        }
                    }
                    self.require(tokens, TokenKind::RParen, "')'")?;
                    let t = self.new_temp();
                    self.add_line(
                        Some(Value::Temp(t)),
                        Op::CallFunction,
                        Some(val),
                        Some(Value::Number(arg_count as f64)),
                        loc,
                    );
                    val = Value::Temp(t);
                }
                _ => break,
            }
        }
        Ok(val)
    }

    fn parse_atom(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let tok = tokens.dequeue()?;
        match tok.kind {
            TokenKind::Number => tok
                .text
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| self.err_at(tokens, format!("invalid number '{}'", tok.text))),
            TokenKind::Str => Ok(Value::from(tok.text)),
            TokenKind::Identifier => Ok(Value::Var(Rc::from(tok.text.as_str()), false)),
            TokenKind::AddressOf => {
                let target = self.parse_call(tokens)?;
                match target {
                    Value::Var(name, _) => Ok(Value::Var(name, true)),
                    Value::SeqElem(mut se) => {
                        se.no_invoke = true;
                        Ok(Value::SeqElem(se))
                    }
                    _ => Err(self.err_at(
                        tokens,
                        "'@' requires an identifier or member reference".to_string(),
                    )),
                }
            }
            TokenKind::LParen => {
                let e = self.parse_expr(tokens)?;
                self.require(tokens, TokenKind::RParen, "')'")?;
                Ok(e)
            }
            TokenKind::LSquare => {
                let mut items = Vec::new();
                self.skip_eols(tokens)?;
                if tokens.peek()?.kind != TokenKind::RSquare {
                    loop {
                        let item = self.parse_expr(tokens)?;
                        items.push(self.fully_evaluate(item, tokens)?);
                        self.skip_eols(tokens)?;
                        if tokens.peek()?.kind == TokenKind::Comma {
                            tokens.dequeue()?;
                            self.skip_eols(tokens)?;
                            if tokens.peek()?.kind == TokenKind::RSquare {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                self.require(tokens, TokenKind::RSquare, "']'")?;
                Ok(Value::list(items))
            }
            TokenKind::LCurly => {
                let mut map = ValueMap::new();
                self.skip_eols(tokens)?;
                if tokens.peek()?.kind != TokenKind::RCurly {
                    loop {
                        let key = self.parse_expr(tokens)?;
                        let key = self.fully_evaluate(key, tokens)?;
                        self.require(tokens, TokenKind::Colon, "':'")?;
                        let value = self.parse_expr(tokens)?;
                        let value = self.fully_evaluate(value, tokens)?;
                        map.insert(key, value);
                        self.skip_eols(tokens)?;
                        if tokens.peek()?.kind == TokenKind::Comma {
                            tokens.dequeue()?;
                            self.skip_eols(tokens)?;
                            if tokens.peek()?.kind == TokenKind::RCurly {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                self.require(tokens, TokenKind::RCurly, "'}'")?;
                Ok(Value::map(map))
            }
            TokenKind::Keyword => match tok.text.as_str() {
                "null" => Ok(Value::Null),
                "true" => Ok(Value::one()),
                "false" => Ok(Value::zero()),
                "function" => self.parse_function_literal(tokens),
                "new" => {
                    let operand = self.parse_call(tokens)?;
                    let a = self.fully_evaluate(operand, tokens)?;
                    let loc = self.loc(tokens);
                    let t = self.new_temp();
                    self.add_line(Some(Value::Temp(t)), Op::New, Some(a), None, loc);
                    Ok(Value::Temp(t))
                }
                other => Err(self.err_at(
                    tokens,
                    format!("unexpected keyword '{}' in expression", other),
                )),
            },
            TokenKind::EOL => {
                Err(self.err_at(tokens, "expression expected, found end of line".to_string()))
            }
            _ => Err(self.err_at(tokens, format!("unexpected token '{}'", tok.text))),
        }
    }

    /// `function(params)` header. The body is not parsed here: the function
    /// value is returned immediately with an empty (shared) code block, and
    /// at the end of the current statement the parser switches its output
    /// into that block until the matching `end function`.
    fn parse_function_literal(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let mut params: Vec<Param> = Vec::new();
        if tokens.peek()?.kind == TokenKind::LParen {
            tokens.dequeue()?;
            if tokens.peek()?.kind != TokenKind::RParen {
                loop {
                    let name = self.require(tokens, TokenKind::Identifier, "a parameter name")?;
                    let default = if tokens.peek()?.kind == TokenKind::OpAssign {
                        tokens.dequeue()?;
                        self.parse_param_default(tokens)?
                    } else {
                        Value::Null
                    };
                    params.push(Param::new(name.text.as_str(), default));
                    if tokens.peek()?.kind == TokenKind::Comma {
                        tokens.dequeue()?;
                    } else {
                        break;
                    }
                }
            }
            self.require(tokens, TokenKind::RParen, "')'")?;
        }
        if tokens.peek()?.kind != TokenKind::EOL {
            return Err(self.err_at(
                tokens,
                "a function body must begin on a new line".to_string(),
            ));
        }
        let def = Rc::new(FuncDef::new(params));
        self.pending_function = Some(def.clone());
        Ok(Value::Function(def, None))
    }

    /// Parameter defaults are literals only.
    fn parse_param_default(&mut self, tokens: &mut Lexer) -> Result<Value> {
        let tok = tokens.dequeue()?;
        match tok.kind {
            TokenKind::Number => tok
                .text
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| self.err_at(tokens, format!("invalid number '{}'", tok.text))),
            TokenKind::Str => Ok(Value::from(tok.text)),
            TokenKind::OpMinus => {
                let next = self.require(tokens, TokenKind::Number, "a number after '-'")?;
                next.text
                    .parse::<f64>()
                    .map(|n| Value::Number(-n))
                    .map_err(|_| self.err_at(tokens, format!("invalid number '{}'", next.text)))
            }
            TokenKind::Keyword if tok.text == "null" => Ok(Value::Null),
            TokenKind::Keyword if tok.text == "true" => Ok(Value::one()),
            TokenKind::Keyword if tok.text == "false" => Ok(Value::zero()),
            _ => Err(self.err_at(
                tokens,
                "a parameter default must be a literal".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ops_of(source: &str) -> Vec<Op> {
        let mut parser = Parser::new();
        parser.parse(source, false).unwrap();
        let code = parser.root_code();
        let ops: Vec<Op> = code.borrow().iter().map(|l| l.op).collect();
        ops
    }

    #[test]
    fn test_simple_assignment_shape() {
        let ops = ops_of("x = 1 + 2");
        assert_eq!(ops, vec![Op::Binary(BinOp::Plus), Op::Assign]);
    }

    #[test]
    fn test_expression_statement_is_implicit() {
        let ops = ops_of("1 + 2");
        assert_eq!(ops, vec![Op::Binary(BinOp::Plus), Op::AssignImplicit]);
    }

    #[test]
    fn test_command_call_shape() {
        let ops = ops_of("print \"hi\"");
        assert_eq!(
            ops,
            vec![Op::PushParam, Op::CallFunction, Op::AssignImplicit]
        );
    }

    #[test]
    fn test_mismatched_end_if() {
        let mut parser = Parser::new();
        let err = parser.parse("end if", false).unwrap_err();
        assert!(err.to_string().contains("without matching 'if'"));
    }

    #[test]
    fn test_open_block_fails_outside_repl() {
        let mut parser = Parser::new();
        assert!(parser.parse("while true", false).is_err());
        // failed chunk is rolled back entirely
        assert_eq!(parser.root_code().borrow().len(), 0);
        assert!(!parser.need_more_input());
    }

    #[test]
    fn test_repl_block_continuation() {
        let mut parser = Parser::new();
        parser.parse("if 1 > 2 then", true).unwrap();
        assert!(parser.need_more_input());
        parser.parse("x = 1", true).unwrap();
        assert!(parser.need_more_input());
        parser.parse("end if", true).unwrap();
        assert!(!parser.need_more_input());
    }

    #[test]
    fn test_repl_line_continuation_buffers() {
        let mut parser = Parser::new();
        parser.parse("x = [1,", true).unwrap();
        assert!(parser.need_more_input());
        assert_eq!(parser.root_code().borrow().len(), 0);
        parser.parse("2]", true).unwrap();
        assert!(!parser.need_more_input());
        assert!(!parser.root_code().borrow().is_empty());
    }

    #[test]
    fn test_break_outside_loop() {
        let mut parser = Parser::new();
        assert!(parser.parse("break", false).is_err());
    }

    #[test]
    fn test_function_body_state_switching() {
        let mut parser = Parser::new();
        parser
            .parse("f = function(a, b=2)\nreturn a + b\nend function\n", false)
            .unwrap();
        let code = parser.root_code();
        // the only root line is the bind-assignment
        assert_eq!(code.borrow().len(), 1);
        assert_eq!(code.borrow()[0].op, Op::BindAssign);
        let Some(Value::Function(def, None)) = code.borrow()[0].rhs_a.clone() else {
            panic!("expected a function literal operand");
        };
        assert_eq!(def.params.len(), 2);
        assert_eq!(&*def.params[1].name, "b");
        assert_eq!(def.params[1].default, Value::Number(2.0));
        assert!(!def.code.borrow().is_empty());
    }

    #[test]
    fn test_jump_targets_are_patched() {
        let mut parser = Parser::new();
        parser
            .parse("while x < 3\nx = x + 1\nend while\n", false)
            .unwrap();
        let code = parser.root_code();
        for line in code.borrow().iter() {
            match line.op {
                Op::Goto | Op::GotoIfB | Op::GotoIfNotB | Op::GotoIfTrulyB => {
                    assert!(line.rhs_a.is_some(), "unpatched jump: {}", line);
                }
                _ => {}
            }
        }
    }
}
