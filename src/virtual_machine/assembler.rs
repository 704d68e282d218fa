//! Assembly language scanner and image builder.
//!
//! Converts human-readable assembly source into a binary [`Image`]. Source is
//! scanned into lexemes by a character state machine, encoded in one pass with
//! zero placeholders for label references, and patched once every label is
//! known.
//!
//! # Syntax
//!
//! ```text
//! msg: "Hi\n"              ; data: quoted bytes, no terminator added
//! table: <short>[1, 2, 'c']
//! #def LIMIT 10
//! #include "lib.asm"
//! _CODE_:                  ; execution starts here
//! loop: MOV EAX LIMIT      ; immediate sized by the register family
//!       CMP EAX EBX
//!       JLE loop
//! ```
//!
//! - Instructions and registers are uppercase (e.g. `MOV`, `EAX`, `AL`)
//! - Operands are separated by whitespace or commas and must sit on the
//!   same line as their instruction
//! - Comments start with `;`
//! - `name:` defines a label at the current offset
//! - Numeric literals are unsigned decimal; `'c'` is a character literal
//! - Identifiers in numeric positions refer to labels or `#def` constants

use crate::virtual_machine::errors::{AsmError, AsmErrorKind};
use crate::virtual_machine::isa::{Instruction, Register, Shape, Width};
use crate::virtual_machine::program::Image;
use crate::warn;
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;
use std::vec::IntoIter;

const COMMENT_CHAR: char = ';';
const LABEL_SUFFIX: char = ':';
const DIRECTIVE_CHAR: char = '#';
const ESCAPE_CHAR: char = '\\';
const SOURCE_NAME: &str = "<source>";

/// Label marking the first executable byte of the image.
pub const CODE_LABEL: &str = "_CODE_";

/// Formats a compiler-style diagnostic for an assembly failure.
///
/// `source` is the text of `err.file`, when available, and is used to quote
/// the offending line.
pub fn render_diagnostic(err: &AsmError, source: Option<&str>) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {}", err.kind);
    let _ = writeln!(diag, " --> {}:{}:{}", err.file, err.line, err.column);

    if let Some(source) = source
        && err.line > 0
        && let Some(raw_line) = source.lines().nth(err.line - 1)
    {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(err.column.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", err.line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

/// Operand value as written in the source.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    /// Mnemonic, register, number or identifier.
    Word(String),
    /// Character literal.
    Char(u32),
}

#[derive(Debug, Clone, PartialEq)]
struct Operand {
    value: Value,
    line: usize,
    column: usize,
}

impl Operand {
    fn text(&self) -> String {
        match &self.value {
            Value::Word(word) => word.clone(),
            Value::Char(c) => format!("'{}'", char::from_u32(*c).unwrap_or('?')),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayKind {
    Byte,
    Short,
    Int,
    Float,
}

impl ArrayKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "byte" => Some(ArrayKind::Byte),
            "short" => Some(ArrayKind::Short),
            "int" => Some(ArrayKind::Int),
            "float" => Some(ArrayKind::Float),
            _ => None,
        }
    }

    /// Integer width of the elements, `None` for floats.
    fn width(self) -> Option<Width> {
        match self {
            ArrayKind::Byte => Some(Width::Byte),
            ArrayKind::Short => Some(Width::Short),
            ArrayKind::Int => Some(Width::Int),
            ArrayKind::Float => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Value(Value),
    Label(String),
    Data(Vec<u8>),
    Array {
        kind: ArrayKind,
        elements: Vec<Operand>,
    },
    /// Directive text after `#`, comment stripped.
    Directive(String),
    Newline,
}

#[derive(Debug, Clone, PartialEq)]
struct Lexeme {
    token: Token,
    /// 1-based line number.
    line: usize,
    /// 1-based column in the line.
    column: usize,
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            ',' | COMMENT_CHAR | LABEL_SUFFIX | '"' | '{' | '[' | ']'
        )
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Character named by `\c`, shared by strings, data blocks and character
/// literals.
fn unescape(c: char) -> Option<char> {
    match c {
        'n' => Some('\n'),
        't' => Some('\t'),
        '0' => Some('\0'),
        '\\' | '"' | '\'' | '{' | '}' => Some(c),
        _ => None,
    }
}

fn push_char(bytes: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

/// Character-level state machine turning one source unit into lexemes.
struct Scanner<'a> {
    chars: Peekable<Chars<'a>>,
    file: &'a str,
    line: usize,
    column: usize,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str, file: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            file,
            line: 1,
            column: 1,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, line: usize, column: usize, kind: AsmErrorKind) -> AsmError {
        AsmError::new(self.file, line, column, kind)
    }

    fn scan(mut self) -> Result<Vec<Lexeme>, AsmError> {
        let mut out = Vec::new();

        while let Some(c) = self.peek() {
            let (line, column) = (self.line, self.column);
            let token = match c {
                '\n' => {
                    self.bump();
                    Token::Newline
                }
                c if c.is_whitespace() || c == ',' => {
                    self.bump();
                    continue;
                }
                COMMENT_CHAR => {
                    self.skip_line();
                    continue;
                }
                '"' | '{' => {
                    self.bump();
                    let close = if c == '"' { '"' } else { '}' };
                    Token::Data(self.quoted(close, line, column)?)
                }
                '\'' => {
                    self.bump();
                    Token::Value(Value::Char(self.char_literal(line, column)?))
                }
                '<' => {
                    self.bump();
                    self.array(line, column)?
                }
                DIRECTIVE_CHAR => {
                    self.bump();
                    Token::Directive(self.directive())
                }
                LABEL_SUFFIX | '[' | ']' | '}' => {
                    return Err(self.error(
                        line,
                        column,
                        AsmErrorKind::InvalidLabelName(c.to_string()),
                    ));
                }
                _ => {
                    let word = self.word();
                    if self.peek() == Some(LABEL_SUFFIX) {
                        self.bump();
                        Token::Label(word)
                    } else {
                        Token::Value(Value::Word(word))
                    }
                }
            };
            out.push(Lexeme {
                token,
                line,
                column,
            });
        }

        Ok(out)
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek()
            && c != '\n'
        {
            self.bump();
        }
    }

    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek()
            && !is_delimiter(c)
        {
            word.push(c);
            self.bump();
        }
        word
    }

    /// Reads the body of a `"..."` string or `{...}` block; the opening
    /// delimiter has been consumed.
    fn quoted(&mut self, close: char, line: usize, column: usize) -> Result<Vec<u8>, AsmError> {
        let unterminated = || {
            if close == '"' {
                AsmErrorKind::UnterminatedString
            } else {
                AsmErrorKind::UnterminatedDataBlock
            }
        };
        let mut bytes = Vec::new();
        loop {
            let (l, c) = (self.line, self.column);
            match self.bump() {
                None => return Err(self.error(line, column, unterminated())),
                Some('\n') if close == '"' => {
                    return Err(self.error(line, column, unterminated()));
                }
                Some(ch) if ch == close => return Ok(bytes),
                Some(ESCAPE_CHAR) => {
                    let ch = self.escape(l, c, unterminated())?;
                    push_char(&mut bytes, ch);
                }
                Some(ch) => push_char(&mut bytes, ch),
            }
        }
    }

    fn escape(
        &mut self,
        line: usize,
        column: usize,
        unterminated: AsmErrorKind,
    ) -> Result<char, AsmError> {
        match self.bump() {
            Some(c) => unescape(c)
                .ok_or_else(|| self.error(line, column, AsmErrorKind::UnknownEscape(c))),
            None => Err(self.error(line, column, unterminated)),
        }
    }

    /// Reads `c'` or `c` after an opening quote.
    fn char_literal(&mut self, line: usize, column: usize) -> Result<u32, AsmError> {
        let (l, c) = (self.line, self.column);
        let value = match self.bump() {
            None | Some('\n') => {
                return Err(self.error(line, column, AsmErrorKind::UnterminatedChar));
            }
            Some('\'') => return Err(self.error(line, column, AsmErrorKind::EmptyChar)),
            Some(ESCAPE_CHAR) => self.escape(l, c, AsmErrorKind::UnterminatedChar)?,
            Some(ch) => ch,
        };
        if self.peek() == Some('\'') {
            self.bump();
        }
        if let Some(next) = self.peek()
            && !is_delimiter(next)
        {
            return Err(self.error(line, column, AsmErrorKind::UnterminatedChar));
        }
        Ok(value as u32)
    }

    /// Reads `type>[e1, e2, ...]` after an opening `<`.
    fn array(&mut self, line: usize, column: usize) -> Result<Token, AsmError> {
        let malformed =
            |this: &Self, reason: String| this.error(line, column, AsmErrorKind::MalformedArray(reason));

        let mut name = String::new();
        loop {
            match self.bump() {
                Some('>') => break,
                Some(c) if c.is_ascii_alphanumeric() => name.push(c),
                _ => return Err(malformed(self, "expected `<type>`".to_string())),
            }
        }
        let kind = ArrayKind::from_name(&name)
            .ok_or_else(|| malformed(self, format!("unknown element type `{name}`")))?;

        while let Some(c) = self.peek()
            && c.is_whitespace()
            && c != '\n'
        {
            self.bump();
        }
        if self.bump() != Some('[') {
            return Err(malformed(self, format!("expected `[` after `<{name}>`")));
        }

        let mut elements = Vec::new();
        loop {
            let (l, c) = (self.line, self.column);
            match self.peek() {
                None => return Err(malformed(self, "missing closing `]`".to_string())),
                Some(']') => {
                    self.bump();
                    break;
                }
                Some(ch) if ch.is_whitespace() || ch == ',' => {
                    self.bump();
                }
                Some(COMMENT_CHAR) => self.skip_line(),
                Some('\'') => {
                    self.bump();
                    let value = Value::Char(self.char_literal(l, c)?);
                    elements.push(Operand {
                        value,
                        line: l,
                        column: c,
                    });
                }
                Some(ch) => {
                    let word = self.word();
                    if word.is_empty() {
                        return Err(self.error(
                            l,
                            c,
                            AsmErrorKind::MalformedArray(format!("unexpected `{ch}`")),
                        ));
                    }
                    elements.push(Operand {
                        value: Value::Word(word),
                        line: l,
                        column: c,
                    });
                }
            }
        }

        Ok(Token::Array { kind, elements })
    }

    fn directive(&mut self) -> String {
        let mut text = String::new();
        let mut in_string = false;
        while let Some(c) = self.peek()
            && c != '\n'
        {
            if c == COMMENT_CHAR && !in_string {
                self.skip_line();
                break;
            }
            self.bump();
            text.push(c);
            match c {
                '"' => in_string = !in_string,
                '\'' if !in_string => self.copy_char_literal(&mut text),
                _ => {}
            }
        }
        text.trim().to_string()
    }

    /// Copies the rest of a character literal into `text` verbatim, so a
    /// quoted `;` or `"` is not taken as a comment or string.
    fn copy_char_literal(&mut self, text: &mut String) {
        let mut take = |this: &mut Self| match this.peek() {
            Some(c) if c != '\n' => {
                this.bump();
                text.push(c);
                Some(c)
            }
            _ => None,
        };
        if take(self) == Some(ESCAPE_CHAR) {
            take(self);
        }
        if self.peek() == Some('\'') {
            self.bump();
            text.push('\'');
        }
    }
}

/// Label reference awaiting resolution.
#[derive(Debug)]
struct Patch {
    label: String,
    /// Offset of the placeholder in the output.
    at: usize,
    width: Width,
    file: String,
    line: usize,
    column: usize,
}

/// Source position of a directive, used to blame include failures.
#[derive(Debug, Clone, Copy)]
struct Site<'a> {
    file: &'a str,
    line: usize,
    column: usize,
}

impl Site<'_> {
    fn error(&self, kind: AsmErrorKind) -> AsmError {
        AsmError::new(self.file, self.line, self.column, kind)
    }
}

/// Assembly session shared by a root file and everything it includes.
///
/// Holds the output buffer, the label table, the pending patches and the
/// `#def` constants. Feed it sources with [`Assembler::assemble_str`] or
/// [`Assembler::assemble_file`], then call [`Assembler::finish`].
#[derive(Debug, Default)]
pub struct Assembler {
    out: Vec<u8>,
    labels: HashMap<String, u32>,
    defines: HashMap<String, u32>,
    patches: Vec<Patch>,
    include_stack: Vec<PathBuf>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current output offset, the address the next byte will get.
    pub fn offset(&self) -> u32 {
        self.out.len() as u32
    }

    /// Offset of a defined label.
    pub fn label(&self, name: &str) -> Option<u32> {
        self.labels.get(name).copied()
    }

    /// Assembles in-memory source. Includes resolve against the working
    /// directory.
    pub fn assemble_str(&mut self, source: &str, name: &str) -> Result<(), AsmError> {
        self.unit(source, name, Path::new("."))
    }

    /// Assembles a file. Includes resolve against the file's directory.
    pub fn assemble_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), AsmError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        self.include(
            path,
            Site {
                file: &name,
                line: 0,
                column: 0,
            },
        )
    }

    /// Resolves every label reference and produces the image.
    ///
    /// Execution starts at the `_CODE_` label, or at offset 0 without one.
    pub fn finish(self) -> Result<Image, AsmError> {
        let Assembler {
            mut out,
            labels,
            patches,
            ..
        } = self;

        for patch in patches {
            let at = |kind| AsmError::new(patch.file.as_str(), patch.line, patch.column, kind);
            let offset = *labels
                .get(&patch.label)
                .ok_or_else(|| at(AsmErrorKind::UnresolvedLabel(patch.label.clone())))?;
            if offset > patch.width.max_label() {
                return Err(at(AsmErrorKind::LabelOutOfRange {
                    label: patch.label.clone(),
                    offset,
                    width: patch.width.name(),
                }));
            }
            patch.width.write_le(offset, &mut out[patch.at..]);
        }

        let code_start = labels.get(CODE_LABEL).copied().unwrap_or(0);
        Ok(Image::new(code_start, out))
    }

    fn include(&mut self, path: &Path, site: Site<'_>) -> Result<(), AsmError> {
        let display = path.display().to_string();
        let unreadable = |e: std::io::Error| {
            site.error(AsmErrorKind::Include {
                path: display.clone(),
                reason: e.to_string(),
            })
        };

        let canonical = fs::canonicalize(path).map_err(unreadable)?;
        if self.include_stack.contains(&canonical) {
            return Err(site.error(AsmErrorKind::IncludeCycle(display.clone())));
        }
        let source = fs::read_to_string(&canonical).map_err(unreadable)?;
        let base = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        self.include_stack.push(canonical);
        let result = self.unit(&source, &display, &base);
        self.include_stack.pop();
        result
    }

    fn unit(&mut self, source: &str, file: &str, base: &Path) -> Result<(), AsmError> {
        let lexemes = Scanner::new(source, file).scan()?;
        let mut stream = lexemes.into_iter().peekable();

        while let Some(lexeme) = stream.next() {
            let (line, column) = (lexeme.line, lexeme.column);
            let at = |kind| AsmError::new(file, line, column, kind);
            match lexeme.token {
                Token::Newline => {}
                Token::Label(name) => self.define_label(name).map_err(at)?,
                Token::Data(bytes) => {
                    self.check_data_placement(file, line);
                    self.emit(&bytes).map_err(at)?;
                }
                Token::Array { kind, elements } => {
                    self.check_data_placement(file, line);
                    self.array(kind, &elements, file)?;
                }
                Token::Directive(text) => self.directive(&text, Site { file, line, column }, base)?,
                Token::Value(Value::Word(mnemonic)) => {
                    self.instruction(&mnemonic, line, column, &mut stream, file)?;
                }
                Token::Value(Value::Char(c)) => {
                    let text = format!("'{}'", char::from_u32(c).unwrap_or('?'));
                    return Err(at(AsmErrorKind::InvalidInstructionName(text)));
                }
            }
        }

        Ok(())
    }

    fn check_data_placement(&self, file: &str, line: usize) {
        if self.labels.contains_key(CODE_LABEL) {
            warn!("{file}:{line}: data placed after `{CODE_LABEL}` lies in the code region");
        }
    }

    fn instruction(
        &mut self,
        mnemonic: &str,
        line: usize,
        column: usize,
        stream: &mut Peekable<IntoIter<Lexeme>>,
        file: &str,
    ) -> Result<(), AsmError> {
        let at = |kind| AsmError::new(file, line, column, kind);
        let instr = Instruction::from_mnemonic(mnemonic)
            .ok_or_else(|| at(AsmErrorKind::InvalidInstructionName(mnemonic.to_string())))?;
        let shape = instr.shape();

        let mut operands = Vec::with_capacity(shape.operand_count());
        for _ in 0..shape.operand_count() {
            match stream.next_if(|l| l.line == line && matches!(l.token, Token::Value(_))) {
                Some(Lexeme {
                    token: Token::Value(value),
                    line,
                    column,
                }) => operands.push(Operand {
                    value,
                    line,
                    column,
                }),
                _ => {
                    return Err(at(AsmErrorKind::MissingOperand {
                        instruction: instr.mnemonic(),
                        expected: shape.operand_count(),
                    }));
                }
            }
        }

        self.emit(&[instr as u8]).map_err(at)?;
        match shape {
            Shape::Nullary => {}
            Shape::Service => self.value(&operands[0], Width::Byte, file)?,
            Shape::Target => self.value(&operands[0], Width::Int, file)?,
            Shape::Reg => {
                let reg = register(&operands[0], file)?;
                self.emit(&[reg as u8]).map_err(at)?;
            }
            Shape::RegImm => {
                let reg = register(&operands[0], file)?;
                self.emit(&[reg as u8]).map_err(at)?;
                self.value(&operands[1], reg.width(), file)?;
            }
            Shape::RegReg => {
                let first = register(&operands[0], file)?;
                let second = register(&operands[1], file)?;
                if first.width() != second.width() {
                    return Err(AsmError::new(
                        file,
                        operands[1].line,
                        operands[1].column,
                        AsmErrorKind::RegisterSizeMismatch {
                            instruction: instr.mnemonic(),
                            first: first.name(),
                            first_width: first.width().name(),
                            second: second.name(),
                            second_width: second.width().name(),
                        },
                    ));
                }
                self.emit(&[first as u8, second as u8]).map_err(at)?;
            }
        }

        Ok(())
    }

    /// Emits a numeric operand: a literal, a `#def` constant, or a label
    /// placeholder to be patched by [`Assembler::finish`].
    fn value(&mut self, operand: &Operand, width: Width, file: &str) -> Result<(), AsmError> {
        let at = |kind| AsmError::new(file, operand.line, operand.column, kind);
        let value = match &operand.value {
            Value::Char(c) => *c as u64,
            Value::Word(text) if text.starts_with(|c: char| c.is_ascii_digit()) => {
                parse_literal(text).map_err(at)?
            }
            Value::Word(name) if is_identifier(name) => match self.defines.get(name) {
                Some(value) => *value as u64,
                None => {
                    self.patches
                        .try_reserve(1)
                        .map_err(|_| at(AsmErrorKind::OutOfMemory("patch table")))?;
                    self.patches.push(Patch {
                        label: name.clone(),
                        at: self.out.len(),
                        width,
                        file: file.to_string(),
                        line: operand.line,
                        column: operand.column,
                    });
                    return self.emit_width(0, width).map_err(at);
                }
            },
            Value::Word(text) => return Err(at(AsmErrorKind::InvalidNumber(text.clone()))),
        };

        if value > width.max_literal() {
            return Err(at(AsmErrorKind::ValueOutOfRange {
                token: operand.text(),
                width: width.name(),
            }));
        }
        self.emit_width(value as u32, width).map_err(at)
    }

    fn array(&mut self, kind: ArrayKind, elements: &[Operand], file: &str) -> Result<(), AsmError> {
        for element in elements {
            match kind.width() {
                Some(width) => self.value(element, width, file)?,
                None => {
                    let at = |kind| AsmError::new(file, element.line, element.column, kind);
                    let value = parse_float(element)
                        .ok_or_else(|| at(AsmErrorKind::InvalidNumber(element.text())))?;
                    self.emit(&value.to_le_bytes()).map_err(at)?;
                }
            }
        }
        Ok(())
    }

    fn directive(&mut self, text: &str, site: Site<'_>, base: &Path) -> Result<(), AsmError> {
        let (name, rest) = text
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((text, ""));
        let malformed = |reason: String| site.error(AsmErrorKind::MalformedDirective(reason));

        match name {
            "include" => {
                let path = rest
                    .strip_prefix('"')
                    .and_then(|r| r.strip_suffix('"'))
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| malformed("expected `#include \"path\"`".to_string()))?;
                self.include(&base.join(path), site)
            }
            "def" => {
                let Some((key, value)) = rest
                    .split_once(char::is_whitespace)
                    .map(|(key, value)| (key, value.trim()))
                else {
                    return Err(malformed("expected `#def NAME value`".to_string()));
                };
                if !is_identifier(key) {
                    return Err(malformed(format!("invalid constant name `{key}`")));
                }
                if self.defines.contains_key(key) {
                    return Err(malformed(format!("`{key}` is already defined")));
                }
                let value = parse_define_value(value).map_err(|kind| site.error(kind))?;
                self.defines.insert(key.to_string(), value);
                Ok(())
            }
            _ => Err(malformed(format!("unknown directive `#{name}`"))),
        }
    }

    fn define_label(&mut self, name: String) -> Result<(), AsmErrorKind> {
        if !is_identifier(&name) {
            return Err(AsmErrorKind::InvalidLabelName(name));
        }
        if self.labels.contains_key(&name) {
            return Err(AsmErrorKind::DuplicateLabel(name));
        }
        self.labels
            .try_reserve(1)
            .map_err(|_| AsmErrorKind::OutOfMemory("label table"))?;
        let offset = self.offset();
        self.labels.insert(name, offset);
        Ok(())
    }

    fn emit_width(&mut self, value: u32, width: Width) -> Result<(), AsmErrorKind> {
        let mut buf = [0u8; 4];
        width.write_le(value, &mut buf);
        self.emit(&buf[..width.size()])
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<(), AsmErrorKind> {
        if self.out.len() + bytes.len() > u32::MAX as usize {
            return Err(AsmErrorKind::ImageTooLarge);
        }
        self.out
            .try_reserve(bytes.len())
            .map_err(|_| AsmErrorKind::OutOfMemory("output buffer"))?;
        self.out.extend_from_slice(bytes);
        Ok(())
    }
}

fn register(operand: &Operand, file: &str) -> Result<Register, AsmError> {
    match &operand.value {
        Value::Word(name) => Register::from_name(name),
        Value::Char(_) => None,
    }
    .ok_or_else(|| {
        AsmError::new(
            file,
            operand.line,
            operand.column,
            AsmErrorKind::InvalidRegister(operand.text()),
        )
    })
}

/// Parses an unsigned decimal literal. Values beyond `u64` saturate so the
/// caller's range check reports them.
fn parse_literal(text: &str) -> Result<u64, AsmErrorKind> {
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AsmErrorKind::InvalidNumber(text.to_string()));
    }
    Ok(text.parse::<u64>().unwrap_or(u64::MAX))
}

fn parse_float(operand: &Operand) -> Option<f32> {
    match &operand.value {
        Value::Word(text) => {
            let digits = text.strip_prefix('-').unwrap_or(text);
            let well_formed = digits.bytes().any(|b| b.is_ascii_digit())
                && digits.bytes().all(|b| b.is_ascii_digit() || b == b'.')
                && digits.bytes().filter(|b| *b == b'.').count() <= 1;
            if !well_formed {
                return None;
            }
            text.parse::<f32>().ok().filter(|v| v.is_finite())
        }
        Value::Char(_) => None,
    }
}

/// Parses a `#def` value: a decimal number or a character literal with the
/// same escapes as inline literals.
fn parse_define_value(text: &str) -> Result<u32, AsmErrorKind> {
    let Some(quoted) = text.strip_prefix('\'') else {
        let value = parse_literal(text)?;
        if value > Width::Int.max_literal() {
            return Err(AsmErrorKind::ValueOutOfRange {
                token: text.to_string(),
                width: Width::Int.name(),
            });
        }
        return Ok(value as u32);
    };

    let mut chars = quoted.chars();
    let value = match chars.next() {
        None => return Err(AsmErrorKind::UnterminatedChar),
        Some('\'') => return Err(AsmErrorKind::EmptyChar),
        Some(ESCAPE_CHAR) => {
            let c = chars.next().ok_or(AsmErrorKind::UnterminatedChar)?;
            unescape(c).ok_or(AsmErrorKind::UnknownEscape(c))?
        }
        Some(c) => c,
    };
    match chars.as_str() {
        "" | "'" => Ok(value as u32),
        rest => Err(AsmErrorKind::InvalidNumber(format!("'{rest}"))),
    }
}

/// Assemble a full source string into an image.
///
/// `#include` paths resolve against the working directory.
pub fn assemble_source(source: impl AsRef<str>) -> Result<Image, AsmError> {
    let mut asm = Assembler::new();
    asm.assemble_str(source.as_ref(), SOURCE_NAME)?;
    asm.finish()
}

/// Convenience: assemble directly from file path
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Image, AsmError> {
    let mut asm = Assembler::new();
    asm.assemble_file(path)?;
    asm.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn kind_of(source: &str) -> AsmErrorKind {
        assemble_source(source).unwrap_err().kind
    }

    #[test]
    fn assemble_empty_source() {
        let image = assemble_source("").unwrap();
        assert!(image.body.is_empty());
        assert_eq!(image.code_start, 0);
    }

    #[test]
    fn assemble_comments_and_blank_lines() {
        let source = format!(
            r#"
            {COMMENT_CHAR} this is a comment

            {COMMENT_CHAR} another comment
        "#
        );
        let image = assemble_source(source).unwrap();
        assert!(image.body.is_empty());
    }

    #[test]
    fn assemble_print_and_exit() {
        let image = assemble_source("MOV EAX 5 ; load\nINT 2\nINT 1").unwrap();
        assert_eq!(image.code_start, 0);
        assert_eq!(
            image.body,
            vec![
                Instruction::Mov as u8,
                Register::Eax as u8,
                5,
                0,
                0,
                0,
                Instruction::Int as u8,
                2,
                Instruction::Int as u8,
                1,
            ]
        );
    }

    #[test]
    fn immediate_width_follows_register_family() {
        assert_eq!(assemble_source("MOV AL 1").unwrap().body, vec![2, 10, 1]);
        assert_eq!(assemble_source("MOV AX 1").unwrap().body, vec![2, 18, 1, 0]);
        assert_eq!(
            assemble_source("MOV EAX 1").unwrap().body,
            vec![2, 0, 1, 0, 0, 0]
        );
        assert_eq!(
            assemble_source("INC DH, 3").unwrap().body,
            vec![Instruction::Inc as u8, Register::Dh as u8, 3]
        );
    }

    #[test]
    fn forward_reference_is_patched() {
        let image = assemble_source("JMP loop\nNOP\nloop: NOP\nJMP loop").unwrap();
        assert_eq!(image.body, vec![9, 6, 0, 0, 0, 0, 0, 9, 6, 0, 0, 0]);
    }

    #[test]
    fn several_statements_share_a_line() {
        let image = assemble_source("a: b: MOV AL 1 INC AL 2 RET").unwrap();
        assert_eq!(image.body, vec![2, 10, 1, 5, 10, 2, 18]);
    }

    #[test]
    fn operands_must_share_the_opcode_line() {
        let err = assemble_source("NOP\nMOV EAX\n5").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 1);
        assert_eq!(
            err.kind,
            AsmErrorKind::MissingOperand {
                instruction: "MOV",
                expected: 2
            }
        );
        assert!(matches!(kind_of("INT"), AsmErrorKind::MissingOperand { .. }));
    }

    #[test]
    fn literal_range_matches_width() {
        assert!(assemble_source("MOV AL 255").is_ok());
        assert!(matches!(
            kind_of("MOV AL 256"),
            AsmErrorKind::ValueOutOfRange { width: "byte", .. }
        ));
        assert!(assemble_source("MOV AX 65535").is_ok());
        assert!(matches!(
            kind_of("MOV AX 65536"),
            AsmErrorKind::ValueOutOfRange { width: "short", .. }
        ));
        assert!(assemble_source("MOV EAX 4294967295").is_ok());
        assert!(matches!(
            kind_of("MOV EAX 99999999999999999999999"),
            AsmErrorKind::ValueOutOfRange { width: "int", .. }
        ));
        assert!(matches!(kind_of("INT 256"), AsmErrorKind::ValueOutOfRange { .. }));
    }

    #[test]
    fn malformed_numbers() {
        assert_eq!(
            kind_of("MOV EAX 12ab"),
            AsmErrorKind::InvalidNumber("12ab".to_string())
        );
        assert_eq!(
            kind_of("MOV EAX -1"),
            AsmErrorKind::InvalidNumber("-1".to_string())
        );
    }

    #[test]
    fn register_size_mismatch() {
        let err = assemble_source("CPY EAX AL").unwrap_err();
        assert_eq!((err.line, err.column), (1, 9));
        assert!(matches!(
            err.kind,
            AsmErrorKind::RegisterSizeMismatch {
                instruction: "CPY",
                first: "EAX",
                second: "AL",
                ..
            }
        ));
        assert!(assemble_source("CMP AH BL").is_ok());
    }

    #[test]
    fn unknown_names() {
        let err = assemble_source("NOP\n  mov EAX 1").unwrap_err();
        assert_eq!((err.line, err.column), (2, 3));
        assert_eq!(
            err.kind,
            AsmErrorKind::InvalidInstructionName("mov".to_string())
        );
        assert_eq!(
            kind_of("PUSH EXX"),
            AsmErrorKind::InvalidRegister("EXX".to_string())
        );
        assert_eq!(
            kind_of("PUSH 'a'"),
            AsmErrorKind::InvalidRegister("'a'".to_string())
        );
    }

    #[test]
    fn string_data_and_code_start() {
        let image = assemble_source(
            "msg: \"Hi\\n\"\n_CODE_:\nMOV ESI msg\nFETCH AL\nINT 3\nINT 1",
        )
        .unwrap();
        assert_eq!(image.code_start, 3);
        assert_eq!(image.data(), b"Hi\n");
        assert_eq!(&image.code()[..6], &[2, Register::Esi as u8, 0, 0, 0, 0]);
    }

    #[test]
    fn data_block_escapes() {
        let image = assemble_source(r"{a\}b\t\0}").unwrap();
        assert_eq!(image.body, vec![b'a', b'}', b'b', b'\t', 0]);
        let image = assemble_source("{line one\nline two}").unwrap();
        assert_eq!(image.body, b"line one\nline two".to_vec());
    }

    #[test]
    fn unterminated_literals() {
        assert_eq!(kind_of("{abc"), AsmErrorKind::UnterminatedDataBlock);
        assert_eq!(kind_of("\"abc\nNOP"), AsmErrorKind::UnterminatedString);
        assert_eq!(kind_of("MOV AL '"), AsmErrorKind::UnterminatedChar);
        assert_eq!(kind_of("MOV AL 'ab'"), AsmErrorKind::UnterminatedChar);
    }

    #[test]
    fn empty_char_literal() {
        assert_eq!(kind_of("MOV AL ''"), AsmErrorKind::EmptyChar);
        assert_eq!(kind_of("<byte>[1, '']"), AsmErrorKind::EmptyChar);
        assert_eq!(assemble_source(r"MOV AL '\''").unwrap().body, vec![2, 10, 39]);
    }

    #[test]
    fn unknown_escape_is_reported_at_backslash() {
        let err = assemble_source(r#"NOP "a\q""#).unwrap_err();
        assert_eq!(err.kind, AsmErrorKind::UnknownEscape('q'));
        assert_eq!((err.line, err.column), (1, 7));
    }

    #[test]
    fn character_literals() {
        assert_eq!(assemble_source("MOV AL 'A'").unwrap().body, vec![2, 10, 65]);
        assert_eq!(assemble_source("MOV AL 'A").unwrap().body, vec![2, 10, 65]);
        assert_eq!(
            assemble_source(r"MOV AL '\n'").unwrap().body,
            vec![2, 10, 10]
        );
    }

    #[test]
    fn typed_arrays() {
        assert_eq!(
            assemble_source("<byte>[1, 2, 'c']").unwrap().body,
            vec![1, 2, 99]
        );
        assert_eq!(
            assemble_source("<short>[1 258]").unwrap().body,
            vec![1, 0, 2, 1]
        );
        assert_eq!(
            assemble_source("<int>[end]\nend:").unwrap().body,
            vec![4, 0, 0, 0]
        );
        assert_eq!(
            assemble_source("<float>[1.5,\n -2]").unwrap().body,
            [1.5f32.to_le_bytes(), (-2.0f32).to_le_bytes()].concat()
        );
    }

    #[test]
    fn malformed_arrays() {
        assert!(matches!(kind_of("<word>[1]"), AsmErrorKind::MalformedArray(_)));
        assert!(matches!(kind_of("<byte>1"), AsmErrorKind::MalformedArray(_)));
        assert!(matches!(kind_of("<byte>[1, 2"), AsmErrorKind::MalformedArray(_)));
        assert!(matches!(kind_of("<byte>[300]"), AsmErrorKind::ValueOutOfRange { .. }));
        assert!(matches!(kind_of("<float>[x]"), AsmErrorKind::InvalidNumber(_)));
    }

    #[test]
    fn duplicate_label_error() {
        let err = assemble_source("a: NOP\na: NOP").unwrap_err();
        assert_eq!(err.kind, AsmErrorKind::DuplicateLabel("a".to_string()));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn undefined_label_error() {
        let err = assemble_source("NOP\nJMP nowhere").unwrap_err();
        assert_eq!(err.kind, AsmErrorKind::UnresolvedLabel("nowhere".to_string()));
        assert_eq!((err.line, err.column), (2, 5));
    }

    #[test]
    fn invalid_label_names() {
        assert_eq!(
            kind_of("1abc: NOP"),
            AsmErrorKind::InvalidLabelName("1abc".to_string())
        );
        assert!(matches!(kind_of(": NOP"), AsmErrorKind::InvalidLabelName(_)));
    }

    #[test]
    fn narrow_label_reference_range() {
        assert_eq!(assemble_source("INT x\nx:").unwrap().body, vec![1, 2]);

        let source = format!("{}far: INT far", "NOP\n".repeat(128));
        let err = assemble_source(source).unwrap_err();
        assert_eq!(
            err.kind,
            AsmErrorKind::LabelOutOfRange {
                label: "far".to_string(),
                offset: 128,
                width: "byte"
            }
        );
        assert_eq!(err.line, 129);
    }

    #[test]
    fn short_label_reference_range() {
        // MOV AX takes 4 bytes, so `far` lands at 4 + pad.
        let padded = |pad: usize| format!("MOV AX far\n<byte>[{}]\nfar: NOP", "0 ".repeat(pad));

        let image = assemble_source(padded(32763)).unwrap();
        assert_eq!(&image.body[..4], &[2, 18, 0xFF, 0x7F]);

        let err = assemble_source(padded(32764)).unwrap_err();
        assert_eq!(
            err.kind,
            AsmErrorKind::LabelOutOfRange {
                label: "far".to_string(),
                offset: 32768,
                width: "short"
            }
        );
        assert_eq!((err.line, err.column), (1, 8));
    }

    #[test]
    fn constant_definitions() {
        let image = assemble_source("#def LIMIT 10 ; ten\n#def LETTER 'A'\nMOV EAX LIMIT\nMOV AL LETTER").unwrap();
        assert_eq!(image.body, vec![2, 0, 10, 0, 0, 0, 2, 10, 65]);
        assert!(matches!(kind_of("#def LIMIT"), AsmErrorKind::MalformedDirective(_)));
        assert!(matches!(
            kind_of("#def A 1\n#def A 2"),
            AsmErrorKind::MalformedDirective(_)
        ));
        assert!(matches!(kind_of("#macro X"), AsmErrorKind::MalformedDirective(_)));
        assert!(matches!(kind_of("#def A x1"), AsmErrorKind::InvalidNumber(_)));
    }

    #[test]
    fn constant_char_values_follow_literal_rules() {
        let image = assemble_source("#def NL '\\n'\nMOV AL NL").unwrap();
        assert_eq!(image.body, vec![2, 10, 10]);

        let image = assemble_source("#def SEMI ';' ; trailing comment\nMOV AL SEMI").unwrap();
        assert_eq!(image.body, vec![2, 10, b';']);

        let image = assemble_source("#def SP ' '\n#def QUOTE '\\''\nMOV AL SP\nMOV BL QUOTE").unwrap();
        assert_eq!(image.body, vec![2, 10, b' ', 2, 12, b'\'']);

        assert_eq!(kind_of("#def E ''"), AsmErrorKind::EmptyChar);
        assert_eq!(kind_of("#def E '\\q'"), AsmErrorKind::UnknownEscape('q'));
        assert!(matches!(
            kind_of("#def BIG 4294967296"),
            AsmErrorKind::ValueOutOfRange { width: "int", .. }
        ));
    }

    #[test]
    fn data_after_code_still_assembles() {
        let image = assemble_source("_CODE_:\nINT 1\n\"x\"").unwrap();
        assert_eq!(image.body, vec![1, 1, b'x']);
        assert_eq!(image.code_start, 0);
    }

    #[test]
    fn include_shares_labels_and_offsets() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("lib.asm"), "helper: RET\n").unwrap();
        let main = dir.path().join("main.asm");
        fs::write(
            &main,
            "#include \"lib.asm\" ; helpers\n_CODE_:\nCALL helper\nINT 1\n",
        )
        .unwrap();

        let image = assemble_file(&main).unwrap();
        assert_eq!(image.code_start, 1);
        assert_eq!(image.body, vec![18, 17, 0, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn include_cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.asm"), "#include \"b.asm\"\n").unwrap();
        fs::write(dir.path().join("b.asm"), "NOP\n#include \"a.asm\"\n").unwrap();

        let err = assemble_file(dir.path().join("a.asm")).unwrap_err();
        assert!(matches!(err.kind, AsmErrorKind::IncludeCycle(_)));
        assert_eq!(err.line, 2);
        assert!(err.file.ends_with("b.asm"));
    }

    #[test]
    fn missing_include_blames_directive() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.asm");
        fs::write(&main, "NOP\n  #include \"missing.asm\"\n").unwrap();

        let err = assemble_file(&main).unwrap_err();
        assert!(matches!(err.kind, AsmErrorKind::Include { .. }));
        assert_eq!((err.line, err.column), (2, 3));
    }

    #[test]
    fn errors_in_included_files_name_that_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.asm"), "NOP\nBOGUS\n").unwrap();
        let main = dir.path().join("main.asm");
        fs::write(&main, "#include \"bad.asm\"\n").unwrap();

        let err = assemble_file(&main).unwrap_err();
        assert!(err.file.ends_with("bad.asm"));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn session_accumulates_sources() {
        let mut asm = Assembler::new();
        asm.assemble_str("start: NOP", "one").unwrap();
        assert_eq!(asm.offset(), 1);
        asm.assemble_str("JMP start", "two").unwrap();
        assert_eq!(asm.label("start"), Some(0));
        let image = asm.finish().unwrap();
        assert_eq!(image.body, vec![0, 9, 0, 0, 0, 0]);
    }

    #[test]
    fn diagnostic_points_at_column() {
        let source = "NOP\nMOV EAX 12ab\n";
        let err = assemble_source(source).unwrap_err();
        let diag = render_diagnostic(&err, Some(source));
        assert!(diag.contains("error: malformed number `12ab`"));
        assert!(diag.contains(" --> <source>:2:9"));
        assert!(diag.contains("   2 | MOV EAX 12ab"));
        assert!(diag.contains("  |         ^"));

        let bare = render_diagnostic(&err, None);
        assert!(!bare.contains('^'));
    }
}
