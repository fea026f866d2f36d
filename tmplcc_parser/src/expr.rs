use std::fmt;

/// Output mode for literal content between directives; selects how the text
/// is escape-compressed into string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Html,
    Xhtml,
    Text,
}

impl OutputMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "html" => Some(Self::Html),
            "xhtml" => Some(Self::Xhtml),
            "text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Xhtml => "xhtml",
            Self::Text => "text",
        }
    }
}

fn trim(input: &str) -> &str {
    input.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\x0b')
}

/// Decodes the C-style escape set: `\a \b \f \n \r \t \v \\ \' \" \?`,
/// `\xHH` and octal `\ooo`, returning the raw bytes the literal denotes.
/// An unknown escape passes through verbatim.
pub fn decode_escaped_string(input: &str) -> Result<Vec<u8>, String> {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let current = bytes[i];
        if escaped {
            escaped = false;
            match current {
                b'\'' | b'?' | b'\\' => result.push(current),
                b'"' => result.extend_from_slice(b"\\\""),
                b'a' => result.push(0x07),
                b'b' => result.push(0x08),
                b'f' => result.push(0x0c),
                b'n' => result.push(b'\n'),
                b'r' => result.push(b'\r'),
                b't' => result.push(b'\t'),
                b'v' => result.push(0x0b),
                b'x' => {
                    if i + 2 >= bytes.len() {
                        return Err(format!("Invalid escape sequence: {}", &input[i - 1..]));
                    }
                    let hi = (bytes[i + 1] as char).to_digit(16);
                    let lo = (bytes[i + 2] as char).to_digit(16);
                    match (hi, lo) {
                        (Some(hi), Some(lo)) => result.push((hi * 16 + lo) as u8),
                        _ => {
                            return Err(format!(
                                "Invalid escape sequence: {}",
                                &input[i - 1..i + 3]
                            ))
                        }
                    }
                    i += 2;
                }
                b'0'..=b'7' => {
                    if i + 3 >= bytes.len() {
                        return Err(format!("Invalid escape sequence: {}", &input[i - 1..]));
                    }
                    let (o1, o2, o3) = (bytes[i + 1], bytes[i + 2], bytes[i + 3]);
                    if (b'0'..=b'7').contains(&o2) && (b'0'..=b'7').contains(&o3) {
                        let value = (o1 as i32 - 0x30) * 64 + (o2 as i32 - 0x30) * 8
                            + (o3 as i32 - 0x30);
                        result.push(value as u8);
                        i += 3;
                    } else {
                        return Err(format!("Invalid escape sequence: {}", &input[i - 1..i + 4]));
                    }
                }
                _ => {
                    result.push(b'\\');
                    result.push(current);
                }
            }
        } else if current == b'\\' {
            escaped = true;
        } else {
            result.push(current);
        }
        i += 1;
    }
    if escaped {
        result.push(b'\\');
    }
    Ok(result)
}

fn escape_control(c: u8) -> Option<u8> {
    match c {
        0x07 => Some(b'a'),
        0x08 => Some(b'b'),
        0x0c => Some(b'f'),
        b'\n' => Some(b'n'),
        b'\r' => Some(b'r'),
        b'\t' => Some(b't'),
        0x0b => Some(b'v'),
        _ => None,
    }
}

/// Escape-encodes raw text so it can be embedded into a host-language string
/// literal.
pub fn compress_html(input: &str) -> String {
    let mut result = Vec::with_capacity(input.len());
    for &c in input.as_bytes() {
        if c == b'"' {
            result.extend_from_slice(b"\\\"");
        } else if c == b'\\' {
            result.extend_from_slice(b"\\\\");
        } else if let Some(t) = escape_control(c) {
            result.push(b'\\');
            result.push(t);
        } else {
            result.push(c);
        }
    }
    String::from_utf8_lossy(&result).into_owned()
}

/// Canonicalizes a raw double-quoted literal (escapes included, as scanned)
/// into a host-language-compatible double-quoted form.
fn compress_string(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = vec![b'"'];
    let mut i = 1;
    while i + 1 < bytes.len() {
        let c = bytes[i];
        if c == b'\\' && bytes[i + 1] == b'"' {
            result.extend_from_slice(b"\\\"");
            i += 1;
        } else if c == b'\\' {
            result.extend_from_slice(b"\\\\");
        } else if let Some(t) = escape_control(c) {
            result.push(b'\\');
            result.push(t);
        } else {
            result.push(c);
        }
        i += 1;
    }
    result.push(b'"');
    String::from_utf8_lossy(&result).into_owned()
}

/// NAME: `[A-Za-z_][A-Za-z0-9_]*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Name {
    pub value: String,
}

impl Name {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
        }
    }

    pub fn repr(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[name:{}]", self.value)
    }
}

/// IDENTIFIER: names joined by `::`, each optionally parameterized by a
/// template-argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub value: String,
}

impl Identifier {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
        }
    }

    pub fn repr(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[id:{}]", self.value)
    }
}

/// Opaque host-language source retained verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpp {
    pub value: String,
}

impl Cpp {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
        }
    }

    pub fn repr(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Cpp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[cpp:{}]", self.value)
    }
}

/// Literal output between directives, stored escape-compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub kind: OutputMode,
    pub value: String,
}

impl Literal {
    pub fn text(raw: &str) -> Self {
        Self {
            kind: OutputMode::Text,
            value: compress_html(raw),
        }
    }

    pub fn html(raw: &str) -> Self {
        Self {
            kind: OutputMode::Html,
            value: compress_html(raw),
        }
    }

    pub fn xhtml(raw: &str) -> Self {
        Self {
            kind: OutputMode::Xhtml,
            value: compress_html(raw),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:\"{}\"]", self.kind.as_str(), self.value)
    }
}

/// Number literal in decimal or hexadecimal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Number {
    pub value: String,
}

impl Number {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
        }
    }

    pub fn repr(&self) -> &str {
        &self.value
    }

    pub fn integer(&self) -> Result<i64, String> {
        let (negative, digits) = match self.value.as_bytes().first() {
            Some(b'-') => (true, &self.value[1..]),
            Some(b'+') => (false, &self.value[1..]),
            _ => (false, self.value.as_str()),
        };
        let parsed = if let Some(hex) = digits.strip_prefix("0x") {
            i64::from_str_radix(hex, 16)
        } else {
            digits.parse::<i64>()
        };
        match parsed {
            Ok(n) => Ok(if negative { -n } else { n }),
            Err(_) => Err(format!("bad numeric literal: {}", self.value)),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[number:{}]", self.value)
    }
}

/// Double-quoted string literal; `value` is the canonical escaped form used
/// for emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringLit {
    pub value: String,
}

impl StringLit {
    /// `raw` is the literal as scanned, quotes included.
    pub fn new(raw: &str) -> Self {
        Self {
            value: compress_string(raw),
        }
    }

    pub fn repr(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for StringLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[string:{}]", self.value)
    }
}

/// A (string | number | variable) operand, as found in argument lists,
/// subscripts, cache keys and render targets.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Str(StringLit),
    Num(Number),
    Var(Box<Variable>),
}

impl Operand {
    /// Classifies a raw expression the way the original compiler does:
    /// leading quote means string, `0x` or sign/digit/dot-only means number,
    /// anything else is a variable. Empty input means no operand.
    pub fn recognize(input: &str) -> Result<Option<Self>, String> {
        let trimmed = trim(input);
        if trimmed.is_empty() {
            return Ok(None);
        }
        let bytes = trimmed.as_bytes();
        if bytes[0] == b'"' {
            Ok(Some(Self::Str(StringLit::new(trimmed))))
        } else if trimmed.len() >= 3 && trimmed.starts_with("0x") {
            Ok(Some(Self::Num(Number::new(trimmed))))
        } else if bytes
            .iter()
            .all(|&c| c == b'-' || c == b'.' || c == b'+' || c.is_ascii_digit())
        {
            Ok(Some(Self::Num(Number::new(trimmed))))
        } else {
            Ok(Some(Self::Var(Box::new(Variable::parse(trimmed)?))))
        }
    }

    pub fn repr(&self) -> &str {
        match self {
            Self::Str(s) => s.repr(),
            Self::Num(n) => n.repr(),
            Self::Var(v) => v.repr(),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => s.fmt(f),
            Self::Num(n) => n.fmt(f),
            Self::Var(v) => v.fmt(f),
        }
    }
}

/// One link of a variable's part chain: a name, its call arguments if it is
/// a function call, and the separator joining it to the next part.
#[derive(Debug, Clone, PartialEq)]
pub struct VariablePart {
    pub name: String,
    pub arguments: Vec<Operand>,
    pub separator: &'static str,
    pub is_function: bool,
}

/// VARIABLE: optional leading `*`, then a chain of parts separated by `.` or
/// `->`.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub repr: String,
    pub is_deref: bool,
    pub parts: Vec<VariablePart>,
}

impl Variable {
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut pos = 0;
        let var = Self::parse_at(input, &mut pos, true)?;
        Ok(var)
    }

    fn parse_at(input: &str, i: &mut usize, consume_all: bool) -> Result<Self, String> {
        let bytes = input.as_bytes();
        let start = *i;
        let skip_space = |i: &mut usize| {
            while *i < bytes.len() && bytes[*i].is_ascii_whitespace() {
                *i += 1;
            }
        };
        skip_space(i);

        let is_deref = if *i < bytes.len() && bytes[*i] == b'*' {
            *i += 1;
            true
        } else {
            false
        };
        skip_space(i);

        let mut parts = Vec::new();
        let mut name = String::new();
        let mut arguments = Vec::new();
        let mut is_function = false;
        while *i < bytes.len() {
            let c = bytes[*i];
            if c == b'.' {
                parts.push(VariablePart {
                    name: std::mem::take(&mut name),
                    arguments: std::mem::take(&mut arguments),
                    separator: ".",
                    is_function,
                });
                is_function = false;
            } else if c == b'-' && *i + 1 < bytes.len() && bytes[*i + 1] == b'>' {
                *i += 1;
                parts.push(VariablePart {
                    name: std::mem::take(&mut name),
                    arguments: std::mem::take(&mut arguments),
                    separator: "->",
                    is_function,
                });
                is_function = false;
            } else if c == b'(' {
                arguments = Self::parse_arguments(input, i)?;
                *i -= 1;
                is_function = true;
            } else if c.is_ascii_whitespace() {
                break;
            } else if c == b',' || c == b')' {
                break;
            } else {
                name.push(c as char);
            }
            *i += 1;
        }

        if !name.is_empty() {
            parts.push(VariablePart {
                name,
                arguments,
                separator: "",
                is_function,
            });
        }

        let end = *i;
        skip_space(i);

        if consume_all && *i != input.len() {
            return Err(format!(
                "Parse error at variable expression, characters left: {}",
                &input[*i..]
            ));
        }
        Ok(Self {
            repr: input[start..end].trim().to_string(),
            is_deref,
            parts,
        })
    }

    fn parse_arguments(input: &str, i: &mut usize) -> Result<Vec<Operand>, String> {
        let bytes = input.as_bytes();
        *i += 1;
        while *i < bytes.len() && bytes[*i].is_ascii_whitespace() {
            *i += 1;
        }
        let mut arguments = Vec::new();
        let mut separated = true;
        while *i < bytes.len() {
            let c = bytes[*i];
            let next = bytes.get(*i + 1).copied();
            if separated && c == b'"' {
                arguments.push(Self::parse_string(input, i)?);
                *i -= 1;
                separated = false;
            } else if separated
                && ((c == b'-' && next.map_or(false, |n| n.is_ascii_digit()))
                    || c.is_ascii_digit())
            {
                arguments.push(Self::parse_number(input, i));
                *i -= 1;
                separated = false;
            } else if c.is_ascii_whitespace() {
                // skip
            } else if c == b',' {
                separated = true;
            } else if c == b')' {
                break;
            } else if separated {
                let var = Self::parse_at(input, i, false)?;
                *i -= 1;
                arguments.push(Operand::Var(Box::new(var)));
                separated = false;
            } else {
                return Err(format!(
                    "argument is neither string, variable or number: {}",
                    &input[*i..]
                ));
            }
            *i += 1;
        }
        if *i < bytes.len() && bytes[*i] == b')' {
            *i += 1;
            Ok(arguments)
        } else {
            Err("unterminated argument list".to_string())
        }
    }

    fn parse_string(input: &str, i: &mut usize) -> Result<Operand, String> {
        let bytes = input.as_bytes();
        let start = *i;
        let mut escaped = false;
        *i += 1;
        while *i < bytes.len() {
            let c = bytes[*i];
            if c == b'"' && !escaped {
                break;
            } else if c == b'\\' && !escaped {
                escaped = true;
            } else {
                escaped = false;
            }
            *i += 1;
        }
        if *i < bytes.len() && bytes[*i] == b'"' {
            *i += 1;
            Ok(Operand::Str(StringLit::new(&input[start..*i])))
        } else {
            Err("unterminated string".to_string())
        }
    }

    fn parse_number(input: &str, i: &mut usize) -> Operand {
        let bytes = input.as_bytes();
        let start = *i;
        let mut oct = false;
        let mut hex = false;
        let mut dot = false;
        if bytes[*i] == b'-' || bytes[*i] == b'+' {
            *i += 1;
        }
        if *i + 2 < bytes.len() && bytes[*i] == b'0' && bytes[*i + 1] == b'x' {
            *i += 2;
            hex = true;
        } else if bytes[*i] == b'0' {
            oct = true;
        }
        while *i < bytes.len() {
            let c = bytes[*i];
            if (b'0'..=b'7').contains(&c)
                || (!oct && (b'8'..=b'9').contains(&c))
                || (hex && (b'a'..=b'f').contains(&c))
                || (hex && (b'A'..=b'F').contains(&c))
            {
                // digit
            } else if !dot && c == b'.' {
                dot = true;
            } else {
                break;
            }
            *i += 1;
        }
        Operand::Num(Number::new(&input[start..*i]))
    }

    pub fn repr(&self) -> &str {
        &self.repr
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[variable:{}]", self.repr)
    }
}

/// The prefix applied to a call list's head at emission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPrefix {
    /// Head emitted as-is.
    Empty,
    /// A fixed prefix, e.g. `base.` or `cppcms::filters::`.
    Fixed(String),
    /// The emitter's configured variable prefix (used by `ext` filters).
    ContentScoped,
}

/// A function head with a parenthesized argument list, plus the prefix to
/// apply at emission.
#[derive(Debug, Clone, PartialEq)]
pub struct CallList {
    pub head: String,
    pub arguments: Vec<Operand>,
    pub prefix: CallPrefix,
}

impl CallList {
    pub fn parse(call: &str, prefix: CallPrefix) -> Result<Self, String> {
        let Some(open) = call.find('(') else {
            return Ok(Self {
                head: call.to_string(),
                arguments: Vec::new(),
                prefix,
            });
        };
        let head = call[..open].to_string();
        let mut arguments = Vec::new();

        // split the body on top-level commas, honoring (), [], <> and strings
        let bytes = call.as_bytes();
        let end = call.len();
        let (mut parens, mut brackets, mut angles) = (0i32, 0i32, 0i32);
        let mut string = false;
        let mut escaped = false;
        let mut next = open + 1;
        for i in open + 1..end.saturating_sub(1) {
            let c = bytes[i];
            if parens == 0 && brackets == 0 && angles == 0 && !string && c == b',' {
                if let Some(op) = Operand::recognize(&call[next..i])? {
                    arguments.push(op);
                }
                next = i + 1;
            } else if c == b'(' && !string {
                parens += 1;
            } else if c == b')' && !string {
                parens -= 1;
            } else if c == b'[' && !string {
                brackets += 1;
            } else if c == b']' && !string {
                brackets -= 1;
            } else if c == b'<' && !string {
                angles += 1;
            } else if c == b'>' && !string {
                angles -= 1;
            } else if c == b'"' && !string {
                string = true;
            } else if c == b'"' && string && !escaped {
                string = false;
            } else if c == b'\\' && string && !escaped {
                escaped = true;
            } else {
                escaped = false;
            }
        }
        if let Some(op) = Operand::recognize(&call[next..end - 1])? {
            arguments.push(op);
        }
        Ok(Self {
            head,
            arguments,
            prefix,
        })
    }

    pub fn repr(&self) -> String {
        let args: Vec<&str> = self.arguments.iter().map(|a| a.repr()).collect();
        format!("{}({})", self.head, args.join(","))
    }
}

impl fmt::Display for CallList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[calllist:{}]", self.repr())
    }
}

/// FILTER: a call list with an `ext` flag. An `ext` filter takes its input
/// as a positional argument and resolves inside the content scope; a
/// non-`ext` filter lives in the fixed runtime filter namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub call: CallList,
    pub ext: bool,
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self, String> {
        let (body, ext) = match input.strip_prefix("ext ") {
            Some(rest) => (rest, true),
            None => (input, false),
        };
        let prefix = if ext {
            CallPrefix::ContentScoped
        } else {
            CallPrefix::Fixed("cppcms::filters::".to_string())
        };
        Ok(Self {
            call: CallList::parse(body, prefix)?,
            ext,
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[filter:{}]", self.call.repr())
    }
}

/// One declared template parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: Identifier,
    pub is_const: bool,
    pub is_ref: bool,
    pub name: Name,
}

/// PARAMETER LIST: the raw parenthesized declaration text plus the decoded
/// parameters (used for the emitter's scope-variable set).
#[derive(Debug, Clone, PartialEq)]
pub struct ParamList {
    pub repr: String,
    pub params: Vec<Param>,
}

impl ParamList {
    pub fn new(raw: &str, params: Vec<Param>) -> Self {
        Self {
            repr: trim(raw).to_string(),
            params,
        }
    }

    pub fn repr(&self) -> &str {
        &self.repr
    }
}

impl fmt::Display for ParamList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[paramlist:{}]", self.repr)
    }
}
