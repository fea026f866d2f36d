use crate::source::{Position, SourceBuffer, SourceFile};
use crate::ParseError;

fn is_latin_letter(c: u8) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_uppercase()
}

fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

fn is_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\x0b' | b'\x0c' | b'\r')
}

pub(crate) fn is_whitespace_string(input: &str) -> bool {
    input.bytes().all(is_space)
}

/// A tagged item on a [`TokenSink`]'s detail channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detail {
    pub what: &'static str,
    pub item: String,
}

/// Receives the text matched by a recognizer, plus a stack of tagged details
/// for recognizers that decompose their match (argument lists, parameter
/// lists, complex variables).
#[derive(Debug, Default)]
pub struct TokenSink {
    value: String,
    details: Vec<Detail>,
}

impl TokenSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, value: &str) {
        self.value.clear();
        self.value.push_str(value);
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn add_detail(&mut self, what: &'static str, item: &str) {
        self.details.push(Detail {
            what,
            item: item.to_string(),
        });
    }

    pub fn has_details(&self) -> bool {
        !self.details.is_empty()
    }

    pub fn pop_detail(&mut self) -> Option<Detail> {
        self.details.pop()
    }

    pub fn top_detail(&self) -> Option<&Detail> {
        self.details.last()
    }
}

/// Backtracking recursive-descent scanner.
///
/// Every recognizer either appends its pre-operation byte index to the index
/// stack and advances the buffer, or increments the fail counter and leaves
/// the buffer alone. A non-zero fail counter short-circuits every subsequent
/// recognizer, so grammar rules chain calls and inspect `ok()` once at the
/// end. `back(n)` undoes the last `n` operations (failed ones first),
/// `push`/`reset`/`pop` snapshot whole-rule state, and `compress` collapses a
/// finished rule's stack footprint to a single entry so that callers count
/// operations at the rule's granularity.
#[derive(Debug)]
pub struct Scanner {
    source: SourceBuffer,
    stack: Vec<usize>,
    failed: usize,
    saved: Vec<(usize, usize)>,
}

impl Scanner {
    pub fn new(files: Vec<SourceFile>) -> Self {
        Self {
            source: SourceBuffer::new(files),
            stack: Vec::new(),
            failed: 0,
            saved: Vec::new(),
        }
    }

    pub fn position(&self) -> Position {
        self.source.position()
    }

    pub fn source(&self) -> &SourceBuffer {
        &self.source
    }

    pub fn ok(&self) -> bool {
        self.failed == 0
    }

    pub fn failed(&self) -> bool {
        self.failed != 0
    }

    pub fn finished(&self) -> bool {
        self.stack
            .last()
            .map_or(true, |&index| index == self.source.index())
            && !self.source.has_next()
    }

    /// Exact match against the head of the input.
    pub fn try_token(&mut self, token: &str) -> &mut Self {
        if self.failed == 0 && self.source.compare_head(token) {
            self.stack.push(self.source.index());
            self.source.move_by(token.len() as isize);
        } else {
            self.failed += 1;
        }
        self
    }

    pub fn try_token_ws(&mut self, token: &str) -> &mut Self {
        self.push();
        self.try_token(token);
        self.skipws(true);
        self.compress();
        self.pop();
        self
    }

    /// First match wins; reports which token matched through `out`.
    pub fn try_one_of(&mut self, tokens: &[&str], out: &mut TokenSink) -> &mut Self {
        if self.failed == 0 {
            let mut it = tokens.iter();
            let mut last = it.next().expect("bug: empty token list");
            self.try_token(last);
            for token in it {
                if self.failed == 0 {
                    break;
                }
                last = token;
                self.back(1).try_token(last);
            }
            if self.failed == 0 {
                out.put(last);
            }
        } else {
            self.failed += 1;
        }
        self
    }

    /// Optional whitespace plus `%>`, tolerating the `% >` variant.
    pub fn try_close_expression(&mut self) -> &mut Self {
        if self.failed == 0 {
            self.push();
            self.skipws(false);
            if !self.try_token("%>").ok() {
                self.back(1).try_token("% >");
            }
            self.compress();
            self.pop();
        } else {
            self.failed += 1;
        }
        self
    }

    /// NAME: `[A-Za-z_][A-Za-z0-9_]*`.
    pub fn try_name(&mut self, out: &mut TokenSink) -> &mut Self {
        if self.failed == 0 && self.source.has_next() {
            self.source.mark();
            let c = self.source.current();
            if is_latin_letter(c) || c == b'_' {
                while self.source.has_next() && {
                    let c = self.source.current();
                    is_latin_letter(c) || is_digit(c) || c == b'_'
                } {
                    self.source.step();
                }
                self.stack.push(self.source.get_mark());
                let text = self.source.take_from_mark();
                out.put(&text);
            } else {
                self.source.unmark();
                self.failed += 1;
            }
        } else {
            self.failed += 1;
        }
        self
    }

    pub fn try_name_ws(&mut self, out: &mut TokenSink) -> &mut Self {
        self.push();
        self.try_name(out);
        self.skipws(true);
        self.compress();
        self.pop();
        self
    }

    /// Double-quoted string literal with backslash escapes. The matched text
    /// keeps its quotes. An unterminated string is not recoverable.
    pub fn try_string(&mut self, out: &mut TokenSink) -> Result<&mut Self, ParseError> {
        if self.failed == 0 && self.source.has_next() {
            self.source.mark();
            if self.source.current() == b'"' {
                let mut escaped = false;
                self.source.step();
                loop {
                    if !self.source.has_next() {
                        let mark = self.source.get_mark();
                        self.source.move_to(mark);
                        self.source.unmark();
                        return Err(self.raise("expected \", found EOF instead"));
                    }
                    let c = self.source.current();
                    if c == b'"' && !escaped {
                        break;
                    }
                    if escaped {
                        escaped = false;
                    } else if c == b'\\' {
                        escaped = true;
                    }
                    self.source.step();
                }
                self.source.step();
                self.stack.push(self.source.get_mark());
                let text = self.source.take_from_mark();
                out.put(&text);
            } else {
                self.source.unmark();
                self.failed += 1;
            }
        } else {
            self.failed += 1;
        }
        Ok(self)
    }

    pub fn try_string_ws(&mut self, out: &mut TokenSink) -> Result<&mut Self, ParseError> {
        self.push();
        if let Err(e) = self.try_string(out) {
            return Err(e);
        }
        self.skipws(true);
        self.compress();
        self.pop();
        Ok(self)
    }

    /// NUMBER: `[-+]?(0x[0-9A-Fa-f]+|[0-9]+(\.[0-9]+)?)`.
    pub fn try_number(&mut self, out: &mut TokenSink) -> &mut Self {
        if self.failed == 0 && self.source.has_next() {
            self.source.mark();
            let mut c = self.source.current();

            if c == b'-' || c == b'+' {
                c = self.source.step_get();
            }
            let mut hex = false;
            if c == b'0' && self.source.has_next() {
                if self.source.step_get() == b'x' {
                    hex = true;
                    if self.source.has_next() {
                        c = self.source.step_get();
                    } else {
                        hex = false;
                    }
                } else {
                    self.source.move_by(-1);
                }
            }

            let is_num = |c: u8, hex: bool| {
                c.is_ascii_digit()
                    || (hex && (b'a'..=b'f').contains(&c))
                    || (hex && (b'A'..=b'F').contains(&c))
            };
            if is_num(c, hex) {
                let mut dot = false;
                while is_num(c, hex) || (!dot && c == b'.') {
                    if c == b'.' {
                        dot = true;
                    }
                    c = self.source.step_get();
                }
                self.stack.push(self.source.get_mark());
                let text = self.source.take_from_mark();
                out.put(&text);
            } else {
                self.source.unmark();
                self.failed += 1;
            }
        } else {
            self.failed += 1;
        }
        self
    }

    pub fn try_number_ws(&mut self, out: &mut TokenSink) -> &mut Self {
        self.push();
        self.try_number(out);
        self.skipws(true);
        self.compress();
        self.pop();
        self
    }

    /// Optional `[ STRING | NUMBER | VARIABLE ]` array subscript after a
    /// variable part.
    fn try_subscript(&mut self) -> Result<&mut Self, ParseError> {
        if self.try_token("[").skipws(false).ok() {
            let mut sub = TokenSink::new();
            let mut found = self.try_string(&mut sub)?.ok();
            if !found {
                found = self.back(1).try_number(&mut sub).ok();
            }
            if !found {
                found = self.back(1).try_variable(&mut sub)?.ok();
            }
            if !found {
                return Err(self.raise("expected STRING, VARIABLE or NUMBER as array subscript"));
            }
            if !self.skipws(false).try_token("]").ok() {
                return Err(self.raise("expected closing ']' after array subscript"));
            }
        } else {
            self.back(2);
        }
        Ok(self)
    }

    /// VARIABLE: `*? name args? sub? ((.|->) name sub? ()? )* ()?`.
    pub fn try_variable(&mut self, out: &mut TokenSink) -> Result<&mut Self, ParseError> {
        if self.failed == 0 && self.source.has_next() {
            self.push();
            self.source.mark();

            if self.source.current() == b'*' {
                self.source.step();
            }
            self.try_name(&mut TokenSink::new());
            self.try_argument_list(out)?;
            let entered = self.ok() || {
                self.back(1);
                self.ok()
            };
            if entered {
                self.try_subscript()?;
                loop {
                    self.skipws(false)
                        .try_one_of(&[".", "->"], &mut TokenSink::new())
                        .skipws(false)
                        .try_name(&mut TokenSink::new());
                    if !self.ok() {
                        break;
                    }
                    self.try_subscript()?;
                    if !self.try_token("()").ok() {
                        self.back(1);
                    }
                }

                // four operations per failed chain attempt: ws, token, ws, name
                self.back(4);

                if !self.try_token("()").ok() {
                    self.back(1);
                }

                let text = self.source.take_from_mark();
                out.put(&text);
            } else {
                self.source.unmark();
            }
            self.compress();
            self.pop();
        } else {
            self.failed += 1;
        }
        Ok(self)
    }

    pub fn try_variable_ws(&mut self, out: &mut TokenSink) -> Result<&mut Self, ParseError> {
        self.push();
        if let Err(e) = self.try_variable(out) {
            return Err(e);
        }
        self.skipws(true);
        self.compress();
        self.pop();
        Ok(self)
    }

    /// Complex variable: `VARIABLE ( | FILTER )*`. Each filter is reported as
    /// a `complex_variable` detail; the head variable as
    /// `complex_variable_name`, pushed last.
    pub fn try_complex_variable(&mut self, out: &mut TokenSink) -> Result<&mut Self, ParseError> {
        if self.failed == 0 && self.source.has_next() {
            self.push();
            self.source.mark();
            let mut var = TokenSink::new();
            self.try_variable(&mut var)?;
            if self.ok() {
                loop {
                    let mut filter = TokenSink::new();
                    self.skipws(false).try_token("|").skipws(false);
                    self.try_filter(&mut filter)?;
                    if !self.ok() {
                        break;
                    }
                    out.add_detail("complex_variable", filter.value());
                }

                self.back(4);

                let text = self.source.take_from_mark();
                out.put(&text);
                out.add_detail("complex_variable_name", var.value());
            } else {
                self.source.unmark();
            }
            self.compress();
            self.pop();
        } else {
            self.failed += 1;
        }
        Ok(self)
    }

    pub fn try_complex_variable_ws(
        &mut self,
        out: &mut TokenSink,
    ) -> Result<&mut Self, ParseError> {
        self.push();
        if let Err(e) = self.try_complex_variable(out) {
            return Err(e);
        }
        self.skipws(true);
        self.compress();
        self.pop();
        Ok(self)
    }

    /// FILTER: `[ 'ext' ] NAME [ '(' argument-list ')' ]`.
    pub fn try_filter(&mut self, out: &mut TokenSink) -> Result<&mut Self, ParseError> {
        if self.failed == 0 && self.source.has_next() {
            self.push();
            self.source.mark();
            if !self.try_token_ws("ext").ok() {
                self.back(1);
            }
            self.try_name(&mut TokenSink::new());
            if self.ok() {
                self.try_argument_list(&mut TokenSink::new())?;
                let text = self.source.take_from_mark();
                out.put(&text);
            } else {
                self.source.unmark();
                self.failed += 1;
            }
            self.compress();
            self.pop();
        } else {
            self.failed += 1;
        }
        Ok(self)
    }

    /// Template-argument list `<ID, ID, ...>` after a name inside an
    /// identifier.
    fn try_template_call_list(&mut self) -> Result<&mut Self, ParseError> {
        if self.try_token("<").ok() {
            let mut tmp = TokenSink::new();
            loop {
                self.try_identifier(&mut TokenSink::new())?
                    .skipws(false)
                    .try_one_of(&[",", ">"], &mut tmp);
                if !self.ok() || tmp.value() == ">" {
                    break;
                }
            }
            if tmp.value() != ">" {
                return Err(self.raise("expected <identifier list>"));
            }
        } else {
            self.back(1);
        }
        Ok(self)
    }

    /// IDENTIFIER: `NAME ( <id-list> )? ( :: NAME ( <id-list> )? )*`.
    pub fn try_identifier(&mut self, out: &mut TokenSink) -> Result<&mut Self, ParseError> {
        if self.failed == 0 && self.source.has_next() {
            self.push();
            self.source.mark();

            self.try_name(&mut TokenSink::new());
            if self.ok() {
                self.try_template_call_list()?;
                loop {
                    self.try_token("::").try_name(&mut TokenSink::new());
                    if !self.ok() {
                        break;
                    }
                    self.try_template_call_list()?;
                    if !self.ok() {
                        break;
                    }
                }
                self.back(2);

                let text = self.source.take_from_mark();
                out.put(&text);
            } else {
                self.source.unmark();
            }
            self.compress();
            self.pop();
        } else {
            self.failed += 1;
        }
        Ok(self)
    }

    pub fn try_identifier_ws(&mut self, out: &mut TokenSink) -> Result<&mut Self, ParseError> {
        self.push();
        if let Err(e) = self.try_identifier(out) {
            return Err(e);
        }
        self.skipws(true);
        self.compress();
        self.pop();
        Ok(self)
    }

    /// PARAMETER LIST: `( IDENTIFIER [const] [&] NAME, ... )`. Emits
    /// `param_end`, `is_ref`, `is_const`, `name`, `type` details per
    /// parameter, in push order.
    pub fn try_param_list(&mut self, out: &mut TokenSink) -> Result<&mut Self, ParseError> {
        if self.failed == 0 && self.source.has_next() {
            self.push();
            self.source.mark();
            if self.try_token("(").ok() {
                while self.ok() {
                    let mut is_const = false;
                    let mut is_ref = false;
                    let mut name = TokenSink::new();
                    let mut ty = TokenSink::new();
                    self.skipws(false);
                    if self.try_token(")").ok() {
                        break;
                    }
                    if self.back(1).try_identifier_ws(&mut ty)?.ok() {
                        if self.try_token("const").ok() {
                            is_const = true;
                            self.skipws(false);
                        } else {
                            self.back(1);
                        }
                        if self.try_token("&").ok() {
                            is_ref = true;
                            self.skipws(false);
                        } else {
                            self.back(1);
                        }

                        if self.try_name(&mut name).ok() {
                            // keep param_end first, it is used as terminator
                            out.add_detail("param_end", "");
                            out.add_detail("is_ref", if is_ref { "ref" } else { "" });
                            out.add_detail("is_const", if is_const { "const" } else { "" });
                            out.add_detail("name", name.value());
                            out.add_detail("type", ty.value());
                        } else {
                            return Err(self.raise("expected NAME"));
                        }
                        if self.skipws(false).try_token(",").ok() {
                            // next parameter follows
                        } else if self.back(1).try_token(")").ok() {
                            self.back(1); // the next iteration consumes it and breaks
                        } else {
                            return Err(self.raise("expected ',' or ')'"));
                        }
                    } else {
                        return Err(self.raise("expected IDENTIFIER"));
                    }
                }
            } else {
                return Err(self.raise("expected '('"));
            }

            self.compress();
            self.pop();
            let text = self.source.take_from_mark();
            out.put(&text);
        } else {
            self.failed += 1;
        }
        Ok(self)
    }

    /// ARGUMENT LIST: `( ( VARIABLE | STRING | NUMBER ), ... )`, parentheses
    /// optional as a whole. Emits `argument_variable` / `argument_string` /
    /// `argument_number` details.
    pub fn try_argument_list(&mut self, out: &mut TokenSink) -> Result<&mut Self, ParseError> {
        if self.failed == 0 && self.source.has_next() {
            self.push();
            self.source.mark();

            if self.try_token("(").ok() {
                if !self.skipws(false).try_token(")").ok() {
                    self.back(2);
                    loop {
                        let mut tmp = TokenSink::new();
                        self.skipws(false);
                        if self.try_variable(&mut tmp)?.ok() {
                            out.add_detail("argument_variable", tmp.value());
                        } else if self.back(1).try_string(&mut tmp)?.ok() {
                            out.add_detail("argument_string", tmp.value());
                        } else if self.back(1).try_number(&mut tmp).ok() {
                            out.add_detail("argument_number", tmp.value());
                        } else {
                            return Err(self.raise("expected ')', string, number or variable"));
                        }

                        if self.try_token(")").ok() {
                            break;
                        }
                        if !self.back(1).skipws(false).try_token(",").ok() {
                            return Err(self.raise("expected ','"));
                        }
                    }
                }
            } else {
                self.back(1);
            }

            self.compress();
            self.pop();
            let text = self.source.take_from_mark();
            out.put(&text);
        } else {
            self.failed += 1;
        }
        Ok(self)
    }

    /// Balanced-parenthesis span, honoring nested brackets and both string
    /// literal styles. The matched text includes the outer parentheses.
    pub fn try_parenthesis_expression(&mut self, out: &mut TokenSink) -> &mut Self {
        if self.failed == 0 && self.source.has_next() && self.source.current() == b'(' {
            self.push();
            self.source.mark();
            let mut bracket_count = 1i32;
            let mut escaped = false;
            let mut string = false;
            let mut string2 = false;
            self.source.step();
            let mut c = self.source.current_or_nul();
            while self.source.has_next() && bracket_count > 0 {
                if !string && !string2 && c == b'(' {
                    bracket_count += 1;
                } else if !string && !string2 && c == b')' {
                    bracket_count -= 1;
                } else if (string || string2) && escaped && c == b'\\' {
                    escaped = false;
                } else if (string || string2) && !escaped && c == b'\\' {
                    escaped = true;
                } else if !string && !string2 && c == b'"' {
                    string = true;
                } else if string && !escaped && c == b'"' {
                    string = false;
                } else if !string && !string2 && c == b'\'' {
                    string2 = true;
                } else if string2 && !escaped && c == b'\'' {
                    string2 = false;
                } else {
                    escaped = false;
                }
                c = self.source.step_get();
            }
            if bracket_count == 0 {
                let text = self.source.take_from_mark();
                out.put(&text);
            } else {
                let mark = self.source.get_mark();
                self.source.move_to(mark);
                self.source.unmark();
                self.failed += 1;
            }
            self.compress();
            self.pop();
        } else {
            self.failed += 1;
        }
        self
    }

    /// Advance to just past the next occurrence of `token`; the skipped
    /// prefix is reported through `out`.
    pub fn skip_to(&mut self, token: &str, out: &mut TokenSink) -> &mut Self {
        if self.failed == 0 && self.source.has_next() {
            match self.source.find_on_right(token) {
                None => self.failed += 1,
                Some(r) => {
                    self.stack.push(self.source.index());
                    let text = self.source.right_context_to(r).to_string();
                    out.put(&text);
                    self.source.move_to(r + token.len());
                }
            }
        } else {
            self.failed += 1;
        }
        self
    }

    /// Zero or more whitespace bytes; with `require`, consuming none is a
    /// failure.
    pub fn skipws(&mut self, require: bool) -> &mut Self {
        if self.failed == 0 && self.source.has_next() {
            self.source.mark();
            while self.source.has_next() && is_space(self.source.current()) {
                self.source.step();
            }
            self.stack.push(self.source.get_mark());
            let text = self.source.take_from_mark();
            if require && text.is_empty() {
                self.failed += 1;
            }
        } else {
            self.failed += 1;
        }
        self
    }

    /// Optional whitespace, a comma, optional whitespace.
    pub fn try_comma(&mut self) -> &mut Self {
        if self.failed == 0 && self.source.has_next() {
            self.push();
            self.skipws(false);
            self.try_token(",");
            self.skipws(false);
            if self.failed != 0 {
                self.back(3);
                self.failed += 1;
            }
            self.compress();
            self.pop();
        } else {
            self.failed += 1;
        }
        self
    }

    /// Capture everything remaining.
    pub fn skip_to_end(&mut self, out: &mut TokenSink) -> &mut Self {
        if self.failed == 0 {
            self.stack.push(self.source.index());
            let text = self.source.right_until_end().to_string();
            out.put(&text);
            let len = self.source.len();
            self.source.move_to(len);
        } else {
            self.failed += 1;
        }
        self
    }

    /// Undo the last `n` operations: failed ones are forgotten first, then
    /// index-stack entries are popped with the buffer restored to each saved
    /// index.
    pub fn back(&mut self, n: usize) -> &mut Self {
        if n > self.failed + self.stack.len() {
            panic!("bug: attempt to clear more operations than stack size + failed");
        }

        if n >= self.failed {
            let mut n = n - self.failed;
            self.failed = 0;
            while n > 0 {
                let index = self.stack.pop().expect("bug: empty index stack in back()");
                self.source.move_to(index);
                n -= 1;
            }
        } else {
            self.failed -= n;
        }
        self
    }

    /// Save the `(index, fail)` state.
    pub fn push(&mut self) {
        self.saved.push((self.source.index(), self.failed));
    }

    /// Collapse all index-stack entries added since the last save into at
    /// most one, preserving either "advanced" or "failed" but nothing in
    /// between.
    pub fn compress(&mut self) {
        let &(index, failed) = self.saved.last().expect("bug: empty state stack in compress");

        while self.stack.last().map_or(false, |&entry| entry > index) {
            self.stack.pop();
        }

        // leave exactly one thing: a fail or a stack entry
        if self.failed > failed && self.failed - failed > 1 {
            self.failed = failed + 1;
        } else if self.stack.last().map_or(true, |&entry| entry < index) {
            self.stack.push(index);
        }
    }

    /// Restore the last saved state.
    pub fn reset(&mut self) -> &mut Self {
        let &(index, failed) = self.saved.last().expect("bug: reset with empty state stack");
        self.source.move_to(index);
        self.failed = failed;
        self
    }

    /// Forget the last saved state.
    pub fn pop(&mut self) {
        self.saved.pop().expect("bug: empty state stack in pop");
    }

    /// Build a parse error with a 70-character window around the current
    /// position.
    pub fn raise(&self, msg: &str) -> ParseError {
        const CONTEXT: usize = 70;
        let left = self.source.left_context(CONTEXT);
        let right = self.source.right_context(CONTEXT);
        let pos = self.position();
        ParseError::new(
            format!(
                "Parse error at line {}:{}, file offset {} near '\n{}<<HERE>>{}': {}",
                pos.file,
                pos.line,
                self.source.index(),
                left,
                right,
                msg
            ),
            Some(pos),
        )
    }

    /// Build a parse error for a position recorded earlier, reseeking the
    /// buffer so the context windows show the right source.
    pub fn raise_at(&mut self, pos: &Position, msg: &str) -> ParseError {
        const CONTEXT: usize = 70;
        let orig = self.source.index();
        self.source.seek_line(pos);
        let left = self.source.left_context(CONTEXT).to_string();
        let right = self.source.right_context(CONTEXT).to_string();
        self.source.move_to(orig);
        ParseError::new(
            format!(
                "Error at file {}:{} near '\n{}<<HERE>>{}': {}",
                pos.file, pos.line, left, right, msg
            ),
            Some(pos.clone()),
        )
    }
}
