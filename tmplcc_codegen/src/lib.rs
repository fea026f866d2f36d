//! C++ code emission for parsed CppCMS skin templates.
//!
//! The generator walks the parser's AST and produces host-language source:
//! skin namespaces wrapping view classes, one member function per template,
//! a registration block, and `#line` pragmas pointing every construct back
//! at its template source line. All state is carried in an explicit
//! [`Context`] threaded through emission; nothing is process-global.

#![deny(unreachable_pub)]
#![deny(elided_lifetimes_in_paths)]

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use tmplcc_parser::source::Position;

pub mod config;
mod generator;

#[cfg(test)]
mod tests;

pub use config::{Config, ConfigError};
pub use generator::generate;

/// An emission failure. `AtLine` carries the offending node's position so
/// the caller can re-render it with source context; `Plain` has no useful
/// position; `Logic` signals an internal inconsistency and maps to the
/// logic-error exit class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    AtLine(Position, String),
    Plain(String),
    Logic(String),
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtLine(pos, msg) => write!(f, "{pos}: {msg}"),
            Self::Plain(msg) => msg.fmt(f),
            Self::Logic(msg) => write!(f, "logic error(bug): {msg}"),
        }
    }
}

impl std::error::Error for EmitError {}

/// A view registered during emission, for the loader block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub name: String,
    pub data: String,
}

/// Mutable emitter state, threaded explicitly through every write.
#[derive(Debug)]
pub struct Context {
    /// Skin name to rename `__default__` to (the `-s` switch).
    pub skin: Option<String>,
    /// Prefix applied to non-scope variable heads.
    pub variable_prefix: String,
    /// `html`, `xhtml` or `text`; decided by the parsed tree, the
    /// configuration, or the `html` default, in that order.
    pub output_mode: String,
    /// The skin currently being emitted.
    pub current_skin: String,
    /// Views collected per skin while emitting, for the loader block.
    pub skins: BTreeMap<String, Vec<ViewEntry>>,
    includes: Vec<String>,
    scope_variables: HashSet<String>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            skin: None,
            variable_prefix: "content.".to_string(),
            output_mode: "html".to_string(),
            current_skin: String::new(),
            skins: BTreeMap::new(),
            includes: Vec::new(),
            scope_variables: HashSet::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut ctx = Self::new();
        ctx.variable_prefix = config.variable_prefix.clone();
        ctx.skin = config.skin.clone();
        if let Some(mode) = &config.output_mode {
            ctx.output_mode = mode.clone();
        }
        ctx
    }

    /// Binds a local name for a scope's duration; rebinding an already-bound
    /// name is rejected.
    pub fn add_scope_variable(&mut self, name: &str) -> Result<(), EmitError> {
        if !self.scope_variables.insert(name.to_string()) {
            return Err(EmitError::Plain(format!(
                "duplicate local scope variable: {name}"
            )));
        }
        Ok(())
    }

    pub fn remove_scope_variable(&mut self, name: &str) {
        if !self.scope_variables.remove(name) {
            panic!("bug: tried to remove variable {name} which is not in local scope");
        }
    }

    pub fn check_scope_variable(&self, name: &str) -> bool {
        self.scope_variables.contains(name)
    }

    /// Requests an `#include` line, keeping first-request order.
    pub fn add_include(&mut self, include: &str) {
        if !self.includes.iter().any(|i| i == include) {
            self.includes.push(include.to_string());
        }
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }
}
