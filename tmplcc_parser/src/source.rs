use std::fmt;
use std::rc::Rc;

/// A named template source held in memory. Reading files from disk is the
/// driver's job; the compiler itself never touches the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// A `(file, line)` pair. Lines are 1-based and relative to the file the
/// byte index falls into, not to the concatenated buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub file: Rc<str>,
    pub line: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// One input file's range inside the concatenated buffer. Ranges are
/// contiguous and non-overlapping; every file ends with a newline.
#[derive(Debug, Clone)]
struct FileIndex {
    name: Rc<str>,
    begin: usize,
    end: usize,
    line_begin: usize,
    #[allow(dead_code)]
    line_end: usize,
}

/// The concatenated input, with byte index and global line tracking and a
/// stack of marks used by the scanner to capture recognizer spans.
#[derive(Debug)]
pub struct SourceBuffer {
    input: String,
    files: Vec<FileIndex>,
    index: usize,
    line: usize,
    marks: Vec<usize>,
}

impl SourceBuffer {
    pub fn new(sources: Vec<SourceFile>) -> Self {
        let mut input = String::new();
        let mut files = Vec::with_capacity(sources.len());
        let mut all_lines = 0;
        for source in sources {
            let mut part = source.contents;
            if !part.ends_with('\n') {
                part.push('\n');
            }
            let lines = part.bytes().filter(|&b| b == b'\n').count();
            files.push(FileIndex {
                name: source.name.into(),
                begin: input.len(),
                end: input.len() + part.len(),
                line_begin: all_lines,
                line_end: all_lines + lines,
            });
            all_lines += lines;
            input.push_str(&part);
        }
        Self {
            input,
            files,
            index: 0,
            line: 1,
            marks: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn has_next(&self) -> bool {
        self.index < self.input.len()
    }

    /// The byte at the current index. Must not be called at end of input.
    pub fn current(&self) -> u8 {
        self.input.as_bytes()[self.index]
    }

    /// The byte at the current index, or NUL at end of input.
    pub fn current_or_nul(&self) -> u8 {
        *self.input.as_bytes().get(self.index).unwrap_or(&0)
    }

    /// Advance one byte.
    pub fn step(&mut self) {
        self.move_by(1);
    }

    /// Advance one byte and return the byte at the new index (NUL at end).
    pub fn step_get(&mut self) -> u8 {
        self.move_by(1);
        self.current_or_nul()
    }

    /// Relative move, keeping the line counter in sync in either direction.
    /// Moves outside `[0, len]` are programming errors.
    pub fn move_by(&mut self, offset: isize) {
        let target = self.index as isize + offset;
        if target < 0 {
            panic!("bug: move_by(): offset too small");
        }
        if target as usize > self.input.len() {
            panic!("bug: move_by(): offset too big");
        }
        let target = target as usize;
        let bytes = self.input.as_bytes();
        if target >= self.index {
            for &b in &bytes[self.index..target] {
                if b == b'\n' {
                    self.line += 1;
                }
            }
        } else {
            for &b in &bytes[target..self.index] {
                if b == b'\n' {
                    self.line -= 1;
                }
            }
        }
        self.index = target;
    }

    pub fn move_to(&mut self, pos: usize) {
        self.move_by(pos as isize - self.index as isize);
    }

    /// `[begin, end)` slice; `end` past the buffer is clamped.
    pub fn slice(&self, begin: usize, end: usize) -> &str {
        let end = end.min(self.input.len());
        &self.input[begin..end]
    }

    pub fn substr(&self, begin: usize, len: usize) -> &str {
        self.slice(begin, begin + len)
    }

    pub fn compare(&self, begin: usize, token: &str) -> bool {
        begin + token.len() <= self.input.len()
            && &self.input.as_bytes()[begin..begin + token.len()] == token.as_bytes()
    }

    pub fn compare_head(&self, token: &str) -> bool {
        self.compare(self.index, token)
    }

    /// First occurrence of `token` at or after the current index.
    pub fn find_on_right(&self, token: &str) -> Option<usize> {
        self.input[self.index..].find(token).map(|p| p + self.index)
    }

    pub fn right_until_end(&self) -> &str {
        &self.input[self.index..]
    }

    pub fn right_context_to(&self, end: usize) -> &str {
        self.slice(self.index, end)
    }

    pub fn left_context_from(&self, begin: usize) -> &str {
        self.slice(begin, self.index)
    }

    /// Up to `len` bytes right of the current index, including the current
    /// byte, snapped to a character boundary.
    pub fn right_context(&self, len: usize) -> &str {
        let mut end = (self.index + len).min(self.input.len());
        while !self.input.is_char_boundary(end) {
            end -= 1;
        }
        &self.input[self.index..end]
    }

    /// Up to `len` bytes left of the current index, excluding the current
    /// byte, snapped to a character boundary.
    pub fn left_context(&self, len: usize) -> &str {
        let mut begin = self.index.saturating_sub(len);
        while !self.input.is_char_boundary(begin) {
            begin += 1;
        }
        &self.input[begin..self.index]
    }

    pub fn mark(&mut self) {
        self.marks.push(self.index);
    }

    pub fn unmark(&mut self) {
        self.marks.pop().expect("bug: unmark without mark");
    }

    pub fn get_mark(&self) -> usize {
        *self.marks.last().expect("bug: get_mark without mark")
    }

    /// The text between the innermost mark and the current index; pops the
    /// mark.
    pub fn take_from_mark(&mut self) -> String {
        let mark = self.marks.pop().expect("bug: take_from_mark without mark");
        self.left_context_from(mark).to_string()
    }

    /// The `(file, line)` of the current index. The boundary case
    /// `index == end` of the last file maps to the last file.
    pub fn position(&self) -> Position {
        for fi in &self.files {
            if self.index >= fi.begin && self.index < fi.end {
                return Position {
                    file: Rc::clone(&fi.name),
                    line: self.line - fi.line_begin,
                };
            }
        }
        if let Some(last) = self.files.last() {
            if self.index == last.end {
                return Position {
                    file: Rc::clone(&last.name),
                    line: self.line - last.line_begin,
                };
            }
        }
        panic!("bug: file index not found for byte {}", self.index);
    }

    /// Reseek to the start of a previously recorded line so that errors
    /// raised after parsing can still be rendered with source context.
    pub fn seek_line(&mut self, pos: &Position) {
        let Some(fi) = self.files.iter().find(|fi| *fi.name == *pos.file) else {
            return;
        };
        let target = fi.line_begin + pos.line;
        let mut index = fi.begin;
        let mut line = fi.line_begin + 1;
        let bytes = self.input.as_bytes();
        while line < target && index < fi.end {
            if bytes[index] == b'\n' {
                line += 1;
            }
            index += 1;
        }
        self.index = index;
        self.line = line;
    }
}
