//! Compiler for the CppCMS server-side HTML templating language.
//!
//! Templates are compiled into C++ source defining view classes and their
//! member-function templates, suitable for linking into the CppCMS runtime.
//! The heavy lifting lives in [`tmplcc_parser`] (backtracking scanner,
//! expression parser, directive AST) and [`tmplcc_codegen`] (C++ emission);
//! this crate ties them together behind [`compile`].
//!
//! ```
//! use tmplcc::{compile, Options, SourceFile};
//!
//! let sources = vec![SourceFile::new(
//!     "hello.tmpl",
//!     "<% skin hello %><% view page uses data::page %>\
//!      <% template render() %>Hello<% end template %>\
//!      <% end view %><% end skin %>",
//! )];
//! let code = compile(sources, &Options::default()).unwrap();
//! assert!(code.contains("namespace hello {"));
//! ```
//!
//! File I/O, argument parsing and process exit belong to the driver; this
//! library deals in named in-memory sources and classified errors with
//! [`Error::exit_code`].

#![deny(unreachable_pub)]
#![deny(elided_lifetimes_in_paths)]

use std::fmt;

pub use tmplcc_codegen::{generate, Config, ConfigError, Context, EmitError};
pub use tmplcc_parser::source::{Position, SourceFile};
pub use tmplcc_parser::{ParseError, TemplateParser};

/// What to produce: host-language code, the AST dump, or a parse/semantic
/// check with no output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Code,
    Ast,
    Parse,
}

/// Compilation options. `skin` renames the `__default__` skin (the `-s`
/// switch) and takes precedence over the configuration file's value.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub mode: Mode,
    pub skin: Option<String>,
    pub config: Config,
}

/// A classified compilation failure. `Parse` covers syntactic and semantic
/// errors (exit code 3); `Logic` covers internal inconsistencies (exit code
/// 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Parse(ParseError),
    Logic(String),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse(_) => 3,
            Self::Logic(_) => 2,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => e.fmt(f),
            Self::Logic(msg) => write!(f, "logic error(bug): {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Logic(_) => None,
        }
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

/// Compiles template sources according to `options`. Returns the generated
/// C++ source for [`Mode::Code`], the tree dump for [`Mode::Ast`], and an
/// empty string for [`Mode::Parse`] (which still runs emission so semantic
/// errors surface).
pub fn compile(sources: Vec<SourceFile>, options: &Options) -> Result<String, Error> {
    let mut parser = TemplateParser::new(sources);
    parser.parse().map_err(Error::Parse)?;
    match options.mode {
        Mode::Ast => Ok(parser.ast().dump()),
        Mode::Parse => {
            emit(&mut parser, options)?;
            Ok(String::new())
        }
        Mode::Code => emit(&mut parser, options),
    }
}

fn emit(parser: &mut TemplateParser, options: &Options) -> Result<String, Error> {
    let mut ctx = Context::from_config(&options.config);
    if let Some(skin) = &options.skin {
        ctx.skin = Some(skin.clone());
    }
    // a mode directive in the source wins over the configured default
    if let Some(mode) = parser.ast().mode() {
        ctx.output_mode = mode.as_str().to_string();
    }

    match generate(parser.ast(), &mut ctx) {
        Ok(output) => Ok(output),
        Err(EmitError::AtLine(pos, msg)) => {
            Err(Error::Parse(parser.render_error_at(&pos, &msg)))
        }
        Err(EmitError::Plain(msg)) => Err(Error::Parse(ParseError::plain(msg))),
        Err(EmitError::Logic(msg)) => Err(Error::Logic(msg)),
    }
}
