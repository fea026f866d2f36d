//! Parser front end for the CppCMS skin templating language.
//!
//! The pipeline is: input files are concatenated into a
//! [`source::SourceBuffer`] with a per-file line map; the
//! [`scanner::Scanner`] runs backtracking token recognizers over it; the
//! [`TemplateParser`] drives the scanner at directive granularity and builds
//! the [`node::Ast`]. Code emission lives in a separate crate that walks the
//! finished tree.

#![deny(unreachable_pub)]
#![deny(elided_lifetimes_in_paths)]

use std::fmt;

pub mod expr;
pub mod node;
pub mod scanner;
pub mod source;

#[cfg(test)]
mod tests;

use expr::{
    CallList, CallPrefix, Cpp, Filter, Identifier, Literal, Name, Number, Operand, OutputMode,
    Param, ParamList, StringLit, Variable,
};
use node::{
    Ast, AstError, Cache, ChainOp, CondChain, CondKind, CppCode, Csrf, FmtFunction, FmtVerb,
    Foreach, Form, IfNode, Include, Ngt, NodeId, NodeKind, PartRole, Render, TextNode, Using,
    UsingOption, VariableEmit, ROOT,
};
use scanner::{is_whitespace_string, Scanner, TokenSink};
use source::Position;

pub use source::SourceFile;

/// A parse or semantic error, carrying the rendered message (with source
/// context windows) and the originating position when one is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    message: String,
    position: Option<Position>,
}

impl ParseError {
    pub fn new(message: String, position: Option<Position>) -> Self {
        Self { message, position }
    }

    pub fn plain(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

impl std::error::Error for ParseError {}

/// Directive-level parser: repeatedly finds the next `<%`, emits the
/// intervening text, and dispatches on the directive leader, constructing
/// the AST as it goes.
pub struct TemplateParser {
    p: Scanner,
    ast: Ast,
    current: NodeId,
}

impl TemplateParser {
    pub fn new(files: Vec<SourceFile>) -> Self {
        Self {
            p: Scanner::new(files),
            ast: Ast::new(),
            current: ROOT,
        }
    }

    pub fn ast(&self) -> &Ast {
        &self.ast
    }

    /// Renders an error raised after parsing (during emission) with source
    /// context for the recorded position.
    pub fn render_error_at(&mut self, pos: &Position, msg: &str) -> ParseError {
        self.p.raise_at(pos, msg)
    }

    fn structural(&self, msg: &str) -> ParseError {
        let mut path = String::from(if self.ast.sysname(self.current) == "root" {
            "skin"
        } else {
            self.ast.sysname(self.current)
        });
        let mut node = self.ast.parent(self.current);
        while let Some(id) = node {
            if self.ast.sysname(id) == "root" {
                path.push_str(" / skin");
            } else {
                path.push_str(" / ");
                path.push_str(self.ast.sysname(id));
            }
            node = self.ast.parent(id);
        }
        self.p.raise(&format!(
            "{msg}\ncurrent object stack: {path}\nmaybe you forgot about <% end %>?"
        ))
    }

    fn ast_err(&self, err: AstError) -> ParseError {
        match err {
            AstError::Cast(msg) => self.structural(&msg),
            AstError::Message(msg) => self.p.raise(&msg),
        }
    }

    fn make_variable(&self, repr: &str) -> Result<Variable, ParseError> {
        Variable::parse(repr).map_err(|e| self.p.raise(&e))
    }

    fn make_filter(&self, repr: &str) -> Result<Filter, ParseError> {
        Filter::parse(repr).map_err(|e| self.p.raise(&e))
    }

    pub fn parse(&mut self) -> Result<(), ParseError> {
        while !self.p.finished() && self.p.ok() {
            self.p.push();
            let mut tmp = TokenSink::new();
            if self.p.reset().skip_to("<%", &mut tmp).ok() {
                let html = tmp.value().to_string();
                if html.contains("%>") {
                    self.p
                        .back(1)
                        .skip_to("%>", &mut TokenSink::new())
                        .back(1);
                    return Err(self.p.raise("unexpected %>"));
                }
                self.add_html(&html)?;

                self.p.push();
                if self.p.try_token("=").skipws(false).ok() {
                    if !self.try_variable_expression()? {
                        return Err(self.p.raise("expected variable expression"));
                    }
                } else if self.p.reset().skipws(false).ok() {
                    if !self.try_flow_expression()?
                        && !self.try_global_expression()?
                        && !self.try_render_expression()?
                    {
                        // compat
                        if !self.try_variable_expression()? {
                            return Err(self.p.raise(
                                "expected c++, global, render or flow expression or \
                                 (deprecated) variable expression",
                            ));
                        }
                        let pos = self.p.position();
                        tracing::warn!(
                            "do not use deprecated variable syntax <% var %> at {}",
                            pos
                        );
                    }
                } else {
                    return Err(self.p.raise(
                        "expected c++, global, render or flow expression or \
                         (deprecated) variable expression",
                    ));
                }
                self.p.pop();
            } else if self.p.reset().skip_to("%>", &mut TokenSink::new()).ok() {
                self.p.reset();
                return Err(self.p.raise("found unexpected %>"));
            } else if self.p.reset().skip_to_end(&mut tmp).ok() {
                let html = tmp.value().to_string();
                self.add_html(&html)?;
            } else {
                self.p.reset();
                return Err(self.p.raise("expected <%=, <% or EOF"));
            }
            if !self.p.ok() {
                return Err(self.p.raise("syntax error"));
            }
            self.p.pop();
        }
        Ok(())
    }

    fn add_html(&mut self, html: &str) -> Result<(), ParseError> {
        if html.is_empty()
            || (!self.ast.accepts_children(self.current) && is_whitespace_string(html))
        {
            // whitespace between directives outside templates is dropped
            return Ok(());
        }

        let value = match self.ast.mode() {
            Some(OutputMode::Html) => Literal::html(html),
            Some(OutputMode::Xhtml) => Literal::xhtml(html),
            _ => Literal::text(html),
        };
        let pos = self.p.position();
        self.current = self
            .ast
            .add_child(
                self.current,
                pos,
                false,
                NodeKind::Text(TextNode { value }),
            )
            .map_err(|e| self.ast_err(e))?;
        Ok(())
    }

    fn add_cpp(&mut self, code: Cpp) -> Result<(), ParseError> {
        let pos = self.p.position();
        if self.ast.is_root(self.current) {
            self.ast.add_root_cpp(code, pos);
        } else {
            self.current = self
                .ast
                .add_child(
                    self.current,
                    pos,
                    false,
                    NodeKind::CppCode(CppCode { code }),
                )
                .map_err(|e| self.ast_err(e))?;
        }
        Ok(())
    }

    fn try_flow_expression(&mut self) -> Result<bool, ParseError> {
        self.p.push();
        let mut verb_sink = TokenSink::new();
        if self
            .p
            .try_one_of(&["if", "elif"], &mut verb_sink)
            .skipws(true)
            .ok()
        {
            self.parse_if(verb_sink.value().to_string())?;
        } else if self
            .p
            .reset()
            .try_token_ws("else")
            .try_close_expression()
            .ok()
        {
            if self.ast.is_condition(self.current) {
                self.current = self
                    .ast
                    .parent(self.current)
                    .expect("bug: condition without parent");
            } else {
                return Err(self.p.raise("unexpected else found"));
            }
            let pos = self.p.position();
            self.current = self
                .ast
                .add_condition(self.current, pos, CondKind::Else, None, None, false)
                .map_err(|e| self.ast_err(e))?;
        } else if self.p.reset().try_token_ws("foreach").ok() {
            self.parse_foreach()?;
        } else if self
            .p
            .reset()
            .try_token_ws("item")
            .try_close_expression()
            .ok()
        {
            // current is a foreach part, usually the prefix
            let foreach = self
                .ast
                .enclosing_foreach(self.current)
                .map_err(|e| self.ast_err(e))?;
            let pos = self.p.position();
            self.current = self.ast.foreach_part(foreach, PartRole::Item, pos);
        } else if self
            .p
            .reset()
            .try_token_ws("empty")
            .try_close_expression()
            .ok()
        {
            let foreach = self
                .ast
                .enclosing_foreach(self.current)
                .map_err(|e| self.ast_err(e))?;
            let pos = self.p.position();
            self.current = self.ast.foreach_part(foreach, PartRole::Empty, pos);
        } else if self
            .p
            .reset()
            .try_token_ws("separator")
            .try_close_expression()
            .ok()
        {
            let foreach = self
                .ast
                .enclosing_foreach(self.current)
                .map_err(|e| self.ast_err(e))?;
            let pos = self.p.position();
            self.current = self.ast.foreach_part(foreach, PartRole::Separator, pos);
        } else if self.p.reset().try_token("end").ok() {
            let mut what = TokenSink::new();
            if !self.p.skipws(true).try_name(&mut what).ok() {
                self.p.back(2);
            }
            if !self.p.try_close_expression().ok() {
                return Err(self
                    .p
                    .raise(&format!("expected %> after end {}", what.value())));
            }
            let pos = self.p.position();
            self.current = self
                .ast
                .end(self.current, what.value(), pos)
                .map_err(|e| self.ast_err(e))?;
        } else if self.p.reset().try_token_ws("cache").ok() {
            self.parse_cache()?;
        } else if self.p.reset().try_token_ws("trigger").ok() {
            let mut tmp = TokenSink::new();
            let key = if self.p.try_variable(&mut tmp)?.ok() {
                Operand::Var(Box::new(self.make_variable(tmp.value())?))
            } else if self.p.back(1).try_string(&mut tmp)?.ok() {
                Operand::Str(StringLit::new(tmp.value()))
            } else {
                return Err(self.p.raise("expected STRING or VARIABLE"));
            };

            let pos = self.p.position();
            self.current = self
                .ast
                .add_cache_trigger(self.current, pos, key)
                .map_err(|e| self.ast_err(e))?;
            if !self.p.skipws(false).try_close_expression().ok() {
                return Err(self.p.raise("expected %>"));
            }
        } else {
            self.p.reset();
            return Ok(false);
        }
        self.p.pop();
        Ok(true)
    }

    /// `( 'if' | 'elif' ) [ 'not' ] [ 'empty' ] ( VARIABLE | 'rtl' ) |
    /// ( CPP-EXPR )`, optionally chained by `and`/`or` (the cpp form does
    /// not chain).
    fn parse_if(&mut self, verb: String) -> Result<(), ParseError> {
        let mut tmp = TokenSink::new();
        let mut cond: Option<Cpp> = None;
        let mut variable: Option<Variable> = None;
        let mut kind = CondKind::Regular;
        let mut negate = false;
        if self.p.try_token_ws("not").ok() {
            negate = true;
        } else {
            self.p.back(1);
        }
        if self
            .p
            .try_token_ws("empty")
            .try_variable_ws(&mut tmp)?
            .ok()
        {
            variable = Some(self.make_variable(tmp.value())?);
            kind = CondKind::Empty;
        } else if self.p.back(2).try_variable_ws(&mut tmp)?.ok() {
            variable = Some(self.make_variable(tmp.value())?);
            kind = CondKind::Regular;
        } else {
            let mut cpp_found = false;
            if self.p.back(1).try_token("(").ok() {
                self.p.back(1);
                cpp_found = self
                    .p
                    .try_parenthesis_expression(&mut tmp)
                    .skipws(false)
                    .ok();
            }
            if !cpp_found {
                return Err(self
                    .p
                    .raise("expected [not] [empty] ([variable]|rtl) or ( c++ expr )"));
            }
            let parenthesed = tmp.value();
            cond = Some(Cpp::new(&parenthesed[1..parenthesed.len() - 1]));
            kind = CondKind::Cpp;
        }

        let mut next: Vec<CondChain> = Vec::new();
        if kind != CondKind::Cpp {
            loop {
                let mut op_sink = TokenSink::new();
                if !self
                    .p
                    .skipws(false)
                    .try_one_of(&["or", "and"], &mut op_sink)
                    .ok()
                {
                    break;
                }
                let op = if op_sink.value() == "and" {
                    ChainOp::And
                } else {
                    ChainOp::Or
                };
                let mut link_negate = false;
                let mut link_kind = CondKind::Regular;

                self.p.skipws(false);

                if self.p.try_token_ws("not").ok() {
                    link_negate = true;
                } else {
                    self.p.back(1);
                }

                if self.p.try_token_ws("empty").ok() {
                    link_kind = CondKind::Empty;
                } else {
                    self.p.back(1);
                }

                let mut var_sink = TokenSink::new();
                if self.p.try_variable_ws(&mut var_sink)?.ok() {
                    let variable = self.make_variable(var_sink.value())?;
                    if link_kind == CondKind::Regular && variable.repr() == "rtl" {
                        next.push(CondChain {
                            op,
                            kind: CondKind::Rtl,
                            negate: link_negate,
                            variable: None,
                        });
                    } else {
                        next.push(CondChain {
                            op,
                            kind: link_kind,
                            negate: link_negate,
                            variable: Some(variable),
                        });
                    }
                } else {
                    return Err(self.p.raise("expected VARIABLE"));
                }
            }
            self.p.back(2);
        }
        if !self.p.skipws(false).try_close_expression().ok() {
            return Err(self.p.raise("expected %>"));
        }

        let pos = self.p.position();
        if verb == "if" {
            self.current = self
                .ast
                .add_child(
                    self.current,
                    pos.clone(),
                    true,
                    NodeKind::If(IfNode::default()),
                )
                .map_err(|e| self.ast_err(e))?;
        } else if self.ast.is_condition(self.current) {
            self.current = self
                .ast
                .parent(self.current)
                .expect("bug: condition without parent");
        } else {
            return Err(self.p.raise("unexpected elif found"));
        }

        let rtl = kind == CondKind::Regular
            && variable.as_ref().map_or(false, |v| v.repr() == "rtl");
        self.current = if kind == CondKind::Cpp {
            self.ast
                .add_condition(self.current, pos, CondKind::Cpp, None, cond, negate)
        } else if rtl {
            self.ast
                .add_condition(self.current, pos, CondKind::Rtl, None, None, negate)
        } else {
            self.ast
                .add_condition(self.current, pos, kind, variable, None, negate)
        }
        .map_err(|e| self.ast_err(e))?;

        for link in next {
            self.ast
                .add_condition_chain(self.current, link)
                .map_err(|e| self.ast_err(e))?;
        }
        Ok(())
    }

    /// `'foreach' NAME [ 'as' IDENTIFIER ] [ 'rowid' NAME [ 'from' NUMBER ] ]
    /// [ 'reverse' ] 'in' VARIABLE`.
    fn parse_foreach(&mut self) -> Result<(), ParseError> {
        let mut tmp = TokenSink::new();
        if !self.p.try_name_ws(&mut tmp).ok() {
            return Err(self.p.raise("expected NAME"));
        }
        let item_name = Name::new(tmp.value());
        let mut as_id: Option<Identifier> = None;
        let mut rowid: Option<Name> = None;
        let mut reverse = false;
        let mut from = 0i64;

        let mut t = TokenSink::new();
        if self.p.try_token_ws("as").try_identifier_ws(&mut t)?.ok() {
            as_id = Some(Identifier::new(t.value()));
        } else {
            self.p.back(2);
        }
        let mut t = TokenSink::new();
        if self.p.try_token_ws("rowid").try_name_ws(&mut t).ok() {
            rowid = Some(Name::new(t.value()));
        } else {
            self.p.back(2);
        }

        let mut t = TokenSink::new();
        if self.p.try_token_ws("from").try_number_ws(&mut t).ok() {
            from = Number::new(t.value()).integer().map_err(|e| self.p.raise(&e))?;
        } else {
            self.p.back(2);
        }

        if self.p.try_token_ws("reverse").ok() {
            reverse = true;
        } else {
            self.p.back(1);
        }

        let mut t = TokenSink::new();
        if !self
            .p
            .try_token_ws("in")
            .try_variable_ws(&mut t)?
            .try_close_expression()
            .ok()
        {
            return Err(self.p.raise("expected in VARIABLE %>"));
        }
        let array = self.make_variable(t.value())?;

        let pos = self.p.position();
        let foreach = self
            .ast
            .add_child(
                self.current,
                pos.clone(),
                true,
                NodeKind::Foreach(Foreach {
                    item: item_name,
                    as_id,
                    rowid,
                    from,
                    array,
                    reverse,
                    prefix: None,
                    item_part: None,
                    suffix: None,
                    separator: None,
                    empty: None,
                }),
            )
            .map_err(|e| self.ast_err(e))?;
        self.current = self.ast.foreach_part(foreach, PartRole::Prefix, pos);
        Ok(())
    }

    /// `'cache' ( VARIABLE | STRING ) [ 'for' NUMBER ] [ 'on' 'miss'
    /// VARIABLE ] [ 'no' 'triggers' ] [ 'no' 'recording' ]`.
    fn parse_cache(&mut self) -> Result<(), ParseError> {
        let mut tmp = TokenSink::new();
        let key = if self.p.try_variable_ws(&mut tmp)?.ok() {
            Operand::Var(Box::new(self.make_variable(tmp.value())?))
        } else if self.p.back(1).try_string_ws(&mut tmp)?.ok() {
            Operand::Str(StringLit::new(tmp.value()))
        } else {
            return Err(self.p.raise("expected VARIABLE or STRING"));
        };

        let mut duration = -1i64;
        let mut miss: Option<Variable> = None;
        let mut no_triggers = false;
        let mut no_recording = false;

        let mut t = TokenSink::new();
        if self.p.try_token_ws("for").try_number_ws(&mut t).ok() {
            duration = Number::new(t.value()).integer().map_err(|e| self.p.raise(&e))?;
        } else {
            self.p.back(2);
        }

        let mut t = TokenSink::new();
        if self
            .p
            .try_token_ws("on")
            .try_token_ws("miss")
            .try_variable_ws(&mut t)?
            .ok()
        {
            miss = Some(self.make_variable(t.value())?);
        } else {
            self.p.back(3);
        }

        if self.p.try_token_ws("no").try_token_ws("triggers").ok() {
            no_triggers = true;
        } else {
            self.p.back(2);
        }

        if self.p.try_token_ws("no").try_token_ws("recording").ok() {
            no_recording = true;
        } else {
            self.p.back(2);
        }

        if !self.p.skipws(false).try_close_expression().ok() {
            return Err(self.p.raise("expected %>"));
        }

        let pos = self.p.position();
        self.current = self
            .ast
            .add_child(
                self.current,
                pos.clone(),
                true,
                NodeKind::Cache(Cache {
                    key,
                    miss,
                    duration,
                    recording: !no_recording,
                    triggers: !no_triggers,
                    trigger_list: Vec::new(),
                    endpos: pos,
                    children: Vec::new(),
                }),
            )
            .map_err(|e| self.ast_err(e))?;
        Ok(())
    }

    fn try_global_expression(&mut self) -> Result<bool, ParseError> {
        self.p.push();
        let mut mode_sink = TokenSink::new();
        if self.p.try_token_ws("skin").ok() {
            let skin_name;
            self.p.push();
            if self.p.try_close_expression().ok() {
                skin_name = "__default__".to_string();
            } else {
                let mut t = TokenSink::new();
                if self
                    .p
                    .reset()
                    .try_name_ws(&mut t)
                    .try_close_expression()
                    .ok()
                {
                    skin_name = t.value().to_string();
                } else {
                    self.p.reset();
                    return Err(self.p.raise("expected %> or skin name"));
                }
            }
            self.p.pop();

            let pos = self.p.position();
            self.current = self
                .ast
                .add_skin(self.current, Name::new(&skin_name), pos)
                .map_err(|e| self.ast_err(e))?;
        } else if self.p.reset().try_token_ws("view").ok() {
            self.p.push();
            let mut view_name = TokenSink::new();
            let mut data_name = TokenSink::new();
            let mut parent_name = TokenSink::new();
            if self
                .p
                .try_name_ws(&mut view_name)
                .try_token_ws("uses")
                .try_identifier_ws(&mut data_name)?
                .ok()
            {
                self.p.push();
                if !self
                    .p
                    .try_token_ws("extends")
                    .try_name(&mut parent_name)
                    .ok()
                {
                    self.p.reset();
                }
                self.p.pop();
            } else {
                self.p.reset();
                return Err(self.p.raise("expected view NAME uses IDENTIFIER [extends NAME]"));
            }
            if self.p.try_close_expression().ok() {
                let master = if parent_name.value().is_empty() {
                    None
                } else {
                    Some(Name::new(parent_name.value()))
                };
                let pos = self.p.position();
                self.current = self
                    .ast
                    .add_view(
                        self.current,
                        Name::new(view_name.value()),
                        pos,
                        Identifier::new(data_name.value()),
                        master,
                    )
                    .map_err(|e| self.ast_err(e))?;
            } else {
                self.p.reset();
                return Err(self.p.raise("expected %> after view definition"));
            }
            self.p.pop();
        } else if self.p.reset().try_token_ws("template").ok() {
            self.parse_template()?;
        } else if self.p.reset().try_token_ws("c++").ok() {
            let mut tmp = TokenSink::new();
            if !self.p.skip_to("%>", &mut tmp).ok() {
                return Err(self.p.raise("expected cppcode %>"));
            }
            let code = Cpp::new(tmp.value());
            self.add_cpp(code)?;
        } else if self
            .p
            .reset()
            .try_one_of(&["html", "xhtml", "text"], &mut mode_sink)
            .skipws(false)
            .try_close_expression()
            .ok()
        {
            let mode = OutputMode::parse(mode_sink.value()).expect("bug: unknown output mode");
            let pos = self.p.position();
            self.current = self
                .ast
                .set_mode(self.current, mode, pos)
                .map_err(|e| self.ast_err(e))?;
        } else {
            self.p.reset();
            return Ok(false);
        }
        self.p.pop();
        Ok(true)
    }

    /// `'template' NAME [ '<' ID ( ',' ID )* '>' ] '(' PARAMLIST ')'`.
    fn parse_template(&mut self) -> Result<(), ParseError> {
        let mut function_name = TokenSink::new();
        let mut argsink = TokenSink::new();
        let mut template_args: Vec<Identifier> = Vec::new();
        if !self.p.try_name(&mut function_name).ok() {
            return Err(self.p.raise("expected NAME(params...) %>"));
        }
        if self.p.try_token("<").ok() {
            let mut token = TokenSink::new();
            loop {
                let mut id = TokenSink::new();
                if !self
                    .p
                    .skipws(false)
                    .try_identifier(&mut id)?
                    .skipws(false)
                    .try_one_of(&[",", ">"], &mut token)
                    .ok()
                {
                    break;
                }
                template_args.push(Identifier::new(id.value()));
                if token.value() == ">" {
                    break;
                }
            }
            if token.value() != ">" {
                return Err(self.p.raise("expected <arg1, arg2, ...>"));
            }
        } else {
            self.p.back(1);
        }

        if !self
            .p
            .try_param_list(&mut argsink)?
            .try_close_expression()
            .ok()
        {
            return Err(self.p.raise("expected NAME(params...) %>"));
        }

        let mut params: Vec<Param> = Vec::new();
        let mut name = String::new();
        let mut ty = String::new();
        let mut is_const = String::new();
        let mut is_ref = String::new();
        while let Some(detail) = argsink.pop_detail() {
            match detail.what {
                "name" => name = detail.item,
                "type" => ty = detail.item,
                "is_const" => is_const = detail.item,
                "is_ref" => is_ref = detail.item,
                "param_end" => params.push(Param {
                    ty: Identifier::new(&ty),
                    is_const: is_const == "const",
                    is_ref: is_ref == "ref",
                    name: Name::new(&name),
                }),
                other => panic!("bug: unexpected param detail {other}"),
            }
        }

        let pos = self.p.position();
        self.current = self
            .ast
            .add_template(
                self.current,
                Name::new(function_name.value()),
                pos,
                template_args,
                ParamList::new(argsink.value(), params),
            )
            .map_err(|e| self.ast_err(e))?;
        Ok(())
    }

    /// `'using' CVAR ( ',' CVAR )*` after a formatting directive; empty when
    /// the keyword is absent.
    fn parse_using_options(&mut self) -> Result<Vec<UsingOption>, ParseError> {
        if self.p.try_token_ws("using").ok() {
            let mut filter_sink = TokenSink::new();
            loop {
                if !self
                    .p
                    .skipws(false)
                    .try_complex_variable(&mut filter_sink)?
                    .ok()
                {
                    break;
                }
                if !self.p.skipws(false).try_token(",").ok() {
                    self.p.back(2);
                    break;
                }
            }
            if !self.p.ok() {
                // found ',' but the next complex variable is missing
                self.p.back(2);
                return Err(self.p.raise("expected complex variable"));
            }

            let mut details = Vec::new();
            while let Some(detail) = filter_sink.pop_detail() {
                details.push(detail);
            }
            let mut options = Vec::new();
            let mut filters: Vec<String> = Vec::new();
            for detail in details.iter().rev() {
                match detail.what {
                    "complex_variable_name" => {
                        let mut parsed = Vec::with_capacity(filters.len());
                        for filter in &filters {
                            parsed.push(self.make_filter(filter)?);
                        }
                        options.push(UsingOption {
                            variable: self.make_variable(&detail.item)?,
                            filters: parsed,
                            pos: self.p.position(),
                        });
                        filters.clear();
                    }
                    "complex_variable" => filters.push(detail.item.clone()),
                    _ => {}
                }
            }
            Ok(options)
        } else {
            self.p.back(1);
            Ok(Vec::new())
        }
    }

    fn try_render_expression(&mut self) -> Result<bool, ParseError> {
        self.p.push();
        let mut verb_sink = TokenSink::new();
        if self
            .p
            .try_one_of(&["gt", "format", "rformat"], &mut verb_sink)
            .ok()
        {
            let verb = match verb_sink.value() {
                "gt" => FmtVerb::Gt,
                "format" => FmtVerb::Format,
                _ => FmtVerb::Rformat,
            };
            let mut tmp = TokenSink::new();
            if !self.p.skipws(false).try_string(&mut tmp)?.ok() {
                return Err(self.p.raise("expected STRING"));
            }
            let fmt = StringLit::new(tmp.value());
            self.p.skipws(false);
            let options = self.parse_using_options()?;
            if !self.p.skipws(false).try_close_expression().ok() {
                return Err(self.p.raise("expected %> after gt expression"));
            }

            let pos = self.p.position();
            self.current = self
                .ast
                .add_child(
                    self.current,
                    pos,
                    false,
                    NodeKind::FmtFunction(FmtFunction { verb, fmt, options }),
                )
                .map_err(|e| self.ast_err(e))?;
        } else if self.p.reset().try_token_ws("ngt").ok() {
            let mut t1 = TokenSink::new();
            let mut t2 = TokenSink::new();
            let mut t3 = TokenSink::new();
            if !self
                .p
                .try_string(&mut t1)?
                .try_comma()
                .try_string(&mut t2)?
                .try_comma()
                .try_variable_ws(&mut t3)?
                .ok()
            {
                return Err(self.p.raise("expected STRING, STRING, VARIABLE"));
            }
            let singular = StringLit::new(t1.value());
            let plural = StringLit::new(t2.value());
            let variable = self.make_variable(t3.value())?;
            let options = self.parse_using_options()?;
            if !self.p.skipws(false).try_close_expression().ok() {
                return Err(self.p.raise("expected %> after gt expression"));
            }

            let pos = self.p.position();
            self.current = self
                .ast
                .add_child(
                    self.current,
                    pos,
                    false,
                    NodeKind::Ngt(Ngt {
                        singular,
                        plural,
                        variable,
                        options,
                    }),
                )
                .map_err(|e| self.ast_err(e))?;
        } else if self.p.reset().try_token_ws("url").ok() {
            let mut tmp = TokenSink::new();
            if !self.p.try_string_ws(&mut tmp)?.ok() {
                return Err(self.p.raise("expected STRING"));
            }
            let url = StringLit::new(tmp.value());
            let options = self.parse_using_options()?;
            if !self.p.skipws(false).try_close_expression().ok() {
                return Err(self.p.raise("expected %> after gt expression"));
            }

            let pos = self.p.position();
            self.current = self
                .ast
                .add_child(
                    self.current,
                    pos,
                    false,
                    NodeKind::FmtFunction(FmtFunction {
                        verb: FmtVerb::Url,
                        fmt: url,
                        options,
                    }),
                )
                .map_err(|e| self.ast_err(e))?;
        } else if self.p.reset().try_token_ws("include").ok() {
            self.parse_include()?;
        } else if self.p.reset().try_token_ws("using").ok() {
            self.parse_using()?;
        } else if self.p.reset().try_token_ws("form").ok() {
            let mut style_sink = TokenSink::new();
            let mut var_sink = TokenSink::new();
            if !self
                .p
                .try_name_ws(&mut style_sink)
                .try_variable_ws(&mut var_sink)?
                .try_close_expression()
                .ok()
            {
                return Err(self.p.raise("expected form STYLE VARIABLE %>"));
            }

            let style = Name::new(style_sink.value());
            let variable = self.make_variable(var_sink.value())?;
            let pos = self.p.position();
            if style.repr() == "end" {
                self.current = self
                    .ast
                    .end(self.current, "form", pos)
                    .map_err(|e| self.ast_err(e))?;
            } else {
                let block = Form::is_block_style(&style);
                self.current = self
                    .ast
                    .add_child(
                        self.current,
                        pos.clone(),
                        block,
                        NodeKind::Form(Form {
                            style,
                            variable,
                            endpos: pos,
                            children: Vec::new(),
                        }),
                    )
                    .map_err(|e| self.ast_err(e))?;
            }
        } else if self.p.reset().try_token_ws("csrf").ok() {
            let mut tmp = TokenSink::new();
            let mut style: Option<Name> = None;
            if self.p.try_name_ws(&mut tmp).try_close_expression().ok() {
                style = Some(Name::new(tmp.value()));
            } else if !self.p.back(2).try_close_expression().ok() {
                return Err(self.p.raise("expected csrf style(type) or %>"));
            }
            let pos = self.p.position();
            self.current = self
                .ast
                .add_child(self.current, pos, false, NodeKind::Csrf(Csrf { style }))
                .map_err(|e| self.ast_err(e))?;
        } else if self.p.reset().try_token_ws("render").ok() {
            self.parse_render()?;
        } else {
            self.p.reset();
            return Ok(false);
        }
        self.p.pop();
        Ok(true)
    }

    /// `'include' ID [ '(' ARGS ')' ] [ 'from' ID | 'using' ID [ 'with'
    /// VAR ] ]`.
    fn parse_include(&mut self) -> Result<(), ParseError> {
        let mut expr_sink = TokenSink::new();
        if !self.p.try_identifier(&mut expr_sink)?.ok() {
            return Err(self.p.raise("expected IDENTIFIER"));
        }

        self.p.skipws(false);
        let mut alist = TokenSink::new();
        self.p.try_argument_list(&mut alist)?; // cannot fail mid-input

        let mut from: Option<Identifier> = None;
        let mut using_view: Option<Identifier> = None;
        let mut with: Option<Variable> = None;
        let mut t = TokenSink::new();
        if self
            .p
            .skipws(true)
            .try_token_ws("from")
            .try_identifier_ws(&mut t)?
            .ok()
        {
            from = Some(Identifier::new(t.value()));
        } else if self
            .p
            .back(2)
            .try_token_ws("using")
            .try_identifier_ws(&mut t)?
            .ok()
        {
            using_view = Some(Identifier::new(t.value()));
            let mut w = TokenSink::new();
            if self
                .p
                .try_token_ws("with")
                .try_variable_ws(&mut w)?
                .ok()
            {
                with = Some(self.make_variable(w.value())?);
            } else {
                self.p.back(2);
            }
        } else {
            self.p.back(3);
        }
        if !self.p.skipws(false).try_close_expression().ok() {
            return Err(self.p.raise("expected %> after gt expression"));
        }

        let call_text = format!("{}{}", expr_sink.value(), alist.value());
        let prefix = if let Some(from) = &from {
            CallPrefix::Fixed(format!("{}.", from.repr()))
        } else if using_view.is_some() {
            CallPrefix::Fixed("_using.".to_string())
        } else {
            CallPrefix::Empty
        };
        let call = CallList::parse(&call_text, prefix).map_err(|e| self.p.raise(&e))?;

        let pos = self.p.position();
        self.current = self
            .ast
            .add_child(
                self.current,
                pos,
                false,
                NodeKind::Include(Include {
                    call,
                    from,
                    using_view,
                    with,
                }),
            )
            .map_err(|e| self.ast_err(e))?;
        Ok(())
    }

    /// `'using' IDENTIFIER [ 'with' VARIABLE ] 'as' IDENTIFIER`.
    fn parse_using(&mut self) -> Result<(), ParseError> {
        let mut t = TokenSink::new();
        if !self.p.try_identifier_ws(&mut t)?.ok() {
            return Err(self.p.raise("expected IDENTIFIER"));
        }
        let id = Identifier::new(t.value());
        let mut with: Option<Variable> = None;
        let mut w = TokenSink::new();
        if self
            .p
            .try_token_ws("with")
            .try_variable_ws(&mut w)?
            .ok()
        {
            with = Some(self.make_variable(w.value())?);
        } else {
            self.p.back(2);
        }
        let mut a = TokenSink::new();
        let as_id;
        if self
            .p
            .try_token_ws("as")
            .try_identifier_ws(&mut a)?
            .ok()
        {
            as_id = Identifier::new(a.value());
        } else {
            self.p.back(2);
            return Err(self.p.raise("expected 'as' IDENTIFIER"));
        }
        if !self.p.skipws(false).try_close_expression().ok() {
            return Err(self.p.raise("expected %> after gt expression"));
        }

        let pos = self.p.position();
        self.current = self
            .ast
            .add_child(
                self.current,
                pos.clone(),
                true,
                NodeKind::Using(Using {
                    id,
                    with,
                    as_id,
                    endpos: pos,
                    children: Vec::new(),
                }),
            )
            .map_err(|e| self.ast_err(e))?;
        Ok(())
    }

    /// `'render' [ ( VARIABLE | STRING ) ',' ] ( VARIABLE | STRING )
    /// [ 'with' VARIABLE ]`.
    fn parse_render(&mut self) -> Result<(), ParseError> {
        let mut tmp = TokenSink::new();
        let mut skin: Option<Operand> = None;
        let mut view = if self.p.try_variable(&mut tmp)?.ok() {
            Operand::Var(Box::new(self.make_variable(tmp.value())?))
        } else if self.p.back(1).try_string(&mut tmp)?.ok() {
            Operand::Str(StringLit::new(tmp.value()))
        } else {
            return Err(self.p.raise("expected STRING or VARIABLE"));
        };

        let mut t = TokenSink::new();
        if self.p.try_comma().try_variable_ws(&mut t)?.ok() {
            skin = Some(view);
            view = Operand::Var(Box::new(self.make_variable(t.value())?));
        } else if self.p.back(1).try_string_ws(&mut t)?.ok() {
            skin = Some(view);
            view = Operand::Str(StringLit::new(t.value()));
        } else {
            self.p.back(2).skipws(false);
        }

        let mut with: Option<Variable> = None;
        let mut w = TokenSink::new();
        if self
            .p
            .try_token_ws("with")
            .try_variable_ws(&mut w)?
            .ok()
        {
            with = Some(self.make_variable(w.value())?);
        } else {
            self.p.back(2);
        }

        if !self.p.try_close_expression().ok() {
            return Err(self.p.raise("expected %>"));
        }

        let pos = self.p.position();
        self.current = self
            .ast
            .add_child(
                self.current,
                pos,
                false,
                NodeKind::Render(Render { skin, view, with }),
            )
            .map_err(|e| self.ast_err(e))?;
        Ok(())
    }

    /// `VARIABLE ( '|' FILTER )* '%>'`, the body of `<%= ... %>` and the
    /// deprecated bare-variable directive.
    fn try_variable_expression(&mut self) -> Result<bool, ParseError> {
        self.p.push();
        let mut sink = TokenSink::new();
        if self
            .p
            .try_complex_variable(&mut sink)?
            .skipws(false)
            .try_close_expression()
            .ok()
        {
            let name_detail = sink.pop_detail().expect("bug: complex variable details empty");
            let variable = self.make_variable(&name_detail.item)?;
            let mut filters = Vec::new();
            while sink
                .top_detail()
                .map_or(false, |d| d.what == "complex_variable")
            {
                let detail = sink.pop_detail().expect("checked");
                filters.push(self.make_filter(&detail.item)?);
            }
            // details pop newest-first; restore source order
            filters.reverse();

            let pos = self.p.position();
            self.current = self
                .ast
                .add_child(
                    self.current,
                    pos,
                    false,
                    NodeKind::VariableEmit(VariableEmit { variable, filters }),
                )
                .map_err(|e| self.ast_err(e))?;
        } else {
            self.p.reset();
            return Ok(false);
        }
        self.p.pop();
        Ok(true)
    }
}
