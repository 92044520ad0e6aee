//! Locating and extracting caller-authored functions from script files.
//!
//! A remotely callable function is a `function NAME(...) { ... }` declaration
//! in a script saved on disk, or a `static NAME(...)` method of a `class`
//! block. Extraction yields de-indented lines with decorator (`@...`) and
//! comment (`//...`) lines removed.

use super::lexer::{block_end, block_end_at, body_brace, indentation, line_depths, mask_non_code};
use crate::error::{Result, RpcError};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static CLASS_MEMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(static\s+)?(?:async\s+)?\*?\s*([A-Za-z_$][\w$]*)\s*\(")
        .expect("class member regex must compile")
});

static STATIC_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)static\s+(async\s+)?(\*?)\s*").expect("static prefix regex must compile")
});

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_$][\w$]*").expect("identifier regex must compile"));

/// String statements that are directives rather than docstrings.
const DIRECTIVES: &[&str] = &["use strict", "use asm"];

/// Characters that continue an expression onto the next line.
const CONTINUATIONS: &[char] = &[
    '.', '[', '(', '+', '-', '*', '/', '%', ',', '?', ':', '=', '&', '|', '<', '>', '`',
];

/// Words that look like `name(` inside a class body but are not members.
const NON_MEMBER_KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "function", "return", "super", "with",
];

/// How a function is declared in its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionKind {
    /// A top-level `function NAME(...)` declaration.
    Free,
    /// A `static NAME(...)` method of a class.
    StaticMethod { class: String },
}

/// A caller-local function, identified by its file and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFunction {
    name: String,
    file: PathBuf,
    kind: FunctionKind,
}

/// A range of text in [`FunctionSource::lines`]: (line, byte column) of the
/// first character, and of the position just past the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSpan {
    pub start: (usize, usize),
    pub end: (usize, usize),
}

/// The extracted text of a function, ready to be rewritten for shipping.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSource {
    /// De-indented lines, decorators and comment lines removed. Static
    /// methods are rewritten into plain function declarations.
    pub lines: Vec<String>,
    /// 1-based line number of the declaration in its file.
    pub def_line: usize,
    /// Index into `lines` of the line holding the body's opening brace.
    pub body_open: usize,
    /// Byte column of that brace in `lines[body_open]`.
    pub body_brace: usize,
    /// Indentation of the first statement in the body.
    pub body_indent: String,
    /// Contents of a leading string-literal statement, if any.
    pub docstring: Option<String>,
    /// Where that statement sits, including its terminating `;`.
    pub docstring_span: Option<TextSpan>,
    /// Parameter names in declaration order.
    pub params: Vec<String>,
}

impl ScriptFunction {
    /// A top-level function declared in `file`.
    pub fn new(file: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            kind: FunctionKind::Free,
        }
    }

    /// A static method of `class` declared in `file`.
    pub fn static_method(
        file: impl Into<PathBuf>,
        class: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            kind: FunctionKind::StaticMethod {
                class: class.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }

    /// Qualified name used in messages (`Class.method` for static methods).
    pub fn qualified_name(&self) -> String {
        match &self.kind {
            FunctionKind::Free => self.name.clone(),
            FunctionKind::StaticMethod { class } => format!("{}.{}", class, self.name),
        }
    }

    /// `"<file>, line <n>"` pointing at the local definition.
    pub fn locator(&self) -> Result<String> {
        let source = self.extract()?;
        Ok(format!("{}, line {}", self.file.display(), source.def_line))
    }

    /// Read the defining file and extract this function's source.
    pub fn extract(&self) -> Result<FunctionSource> {
        let text = std::fs::read_to_string(&self.file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RpcError::FileNotSavedOnDisk {
                    function: self.qualified_name(),
                    path: self.file.clone(),
                }
            } else {
                RpcError::io_with_path(e, &self.file)
            }
        })?;
        self.extract_from(&text)
    }

    /// Extract this function's source from the given file contents.
    pub fn extract_from(&self, text: &str) -> Result<FunctionSource> {
        let masked = mask_non_code(text);
        let lines: Vec<&str> = text.lines().collect();
        let masked_lines: Vec<&str> = masked.lines().collect();

        let (start, end) = self.locate(&lines, &masked_lines).ok_or_else(|| {
            RpcError::FunctionNotFound {
                function: self.qualified_name(),
                path: self.file.clone(),
            }
        })?;

        let base_indent = indentation(lines[start]).len();
        let mut kept = Vec::new();
        let mut kept_masked = Vec::new();
        for index in start..=end {
            let line = lines[index];
            let trimmed = line.trim_start();
            if index != start && (trimmed.starts_with('@') || trimmed.starts_with("//")) {
                continue;
            }
            kept.push(dedent(line, base_indent).trim_end().to_string());
            kept_masked.push(dedent(masked_lines[index], base_indent).trim_end().to_string());
        }

        if let FunctionKind::StaticMethod { .. } = self.kind {
            kept[0] = STATIC_PREFIX
                .replace(&kept[0], "${1}${2}function${3} ")
                .into_owned();
            kept_masked[0] = STATIC_PREFIX
                .replace(&kept_masked[0], "${1}${2}function${3} ")
                .into_owned();
        }

        let (body_open, brace) = body_brace(&kept_masked, 0).ok_or_else(|| {
            RpcError::FunctionNotFound {
                function: self.qualified_name(),
                path: self.file.clone(),
            }
        })?;
        let body_indent = kept
            .iter()
            .skip(body_open + 1)
            .zip(kept_masked.iter().skip(body_open + 1))
            .find(|(_, masked)| !masked.trim().is_empty() && masked.trim() != "}")
            .map(|(line, _)| indentation(line).to_string())
            .filter(|indent| !indent.is_empty())
            .unwrap_or_else(|| "    ".to_string());

        let (docstring, docstring_span) = match find_docstring(&kept, body_open, brace) {
            Some((text, span)) => (Some(text), Some(span)),
            None => (None, None),
        };

        Ok(FunctionSource {
            params: parse_params(&kept_masked.join("\n")),
            docstring,
            docstring_span,
            lines: kept,
            def_line: start + 1,
            body_open,
            body_brace: brace,
            body_indent,
        })
    }

    /// Find the declaration's first and last line.
    fn locate(&self, lines: &[&str], masked_lines: &[&str]) -> Option<(usize, usize)> {
        let name = regex::escape(&self.name);
        match &self.kind {
            FunctionKind::Free => {
                let pattern = Regex::new(&format!(
                    r"^\s*(?:async\s+)?function\s*\*?\s*{}\s*\(",
                    name
                ))
                .ok()?;
                let depths = line_depths(&masked_lines.join("\n"));
                let start = (0..lines.len()).find(|&i| {
                    depths.get(i) == Some(&0) && pattern.is_match(masked_lines[i])
                })?;
                let (line, column) = body_brace(masked_lines, start)?;
                Some((start, block_end_at(masked_lines, line, column)?))
            }
            FunctionKind::StaticMethod { class } => {
                let (class_start, class_end) = locate_class(class, lines, masked_lines)?;
                let pattern =
                    Regex::new(&format!(r"^\s*static\s+(?:async\s+)?\*?\s*{}\s*\(", name)).ok()?;
                let start = (class_start + 1..class_end).find(|&i| {
                    member_depth(masked_lines, class_start, i) == 1
                        && pattern.is_match(masked_lines[i])
                })?;
                let (line, column) = body_brace(masked_lines, start)?;
                Some((start, block_end_at(masked_lines, line, column)?))
            }
        }
    }
}

impl fmt::Display for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.qualified_name(), self.file.display())
    }
}

/// One callable member of a script class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMember {
    pub name: String,
    pub is_static: bool,
    /// 1-based line number in the defining file.
    pub line: usize,
}

/// A `class NAME { ... }` block in a script file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptClass {
    name: String,
    file: PathBuf,
    members: Vec<ClassMember>,
}

impl ScriptClass {
    /// Read `file` and collect the callable members of class `name`.
    pub fn load(file: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self> {
        let file = file.into();
        let name = name.into();
        let text = std::fs::read_to_string(&file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RpcError::FileNotSavedOnDisk {
                    function: name.clone(),
                    path: file.clone(),
                }
            } else {
                RpcError::io_with_path(e, &file)
            }
        })?;
        Self::parse(file, name, &text)
    }

    /// Collect the callable members of class `name` from file contents.
    pub fn parse(file: PathBuf, name: String, text: &str) -> Result<Self> {
        let masked = mask_non_code(text);
        let lines: Vec<&str> = text.lines().collect();
        let masked_lines: Vec<&str> = masked.lines().collect();

        let (class_start, class_end) =
            locate_class(&name, &lines, &masked_lines).ok_or_else(|| RpcError::FunctionNotFound {
                function: name.clone(),
                path: file.clone(),
            })?;

        let members = (class_start + 1..class_end)
            .filter(|&i| member_depth(&masked_lines, class_start, i) == 1)
            .filter_map(|i| {
                let captures = CLASS_MEMBER.captures(masked_lines[i])?;
                let member = captures.get(2)?.as_str();
                if NON_MEMBER_KEYWORDS.contains(&member) {
                    return None;
                }
                Some(ClassMember {
                    name: member.to_string(),
                    is_static: captures.get(1).is_some(),
                    line: i + 1,
                })
            })
            .collect();

        Ok(Self {
            name,
            file,
            members,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn members(&self) -> &[ClassMember] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&ClassMember> {
        self.members.iter().find(|m| m.name == name)
    }

    /// The function reference for one of this class's static methods.
    pub fn function(&self, member: &ClassMember) -> ScriptFunction {
        ScriptFunction::static_method(&self.file, &self.name, &member.name)
    }
}

fn locate_class(name: &str, lines: &[&str], masked_lines: &[&str]) -> Option<(usize, usize)> {
    let pattern = Regex::new(&format!(r"^\s*class\s+{}\b", regex::escape(name))).ok()?;
    let depths = line_depths(&masked_lines.join("\n"));
    let start = (0..lines.len())
        .find(|&i| depths.get(i) == Some(&0) && pattern.is_match(masked_lines[i]))?;
    Some((start, block_end(masked_lines, start)?))
}

/// Brace depth at the start of line `index`, relative to the class line.
fn member_depth(masked_lines: &[&str], class_start: usize, index: usize) -> i32 {
    masked_lines[class_start..index]
        .iter()
        .map(|line| super::lexer::brace_delta(line))
        .sum()
}

fn dedent(line: &str, amount: usize) -> &str {
    let indent = indentation(line).len().min(amount);
    &line[indent..]
}

/// Parameter names from the first parenthesised list of a masked declaration.
fn parse_params(masked: &str) -> Vec<String> {
    let Some(open) = masked.find('(') else {
        return Vec::new();
    };
    let mut depth = 0;
    let mut close = None;
    for (offset, c) in masked[open..].char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + offset);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        return Vec::new();
    };

    let mut names = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for c in masked[open + 1..close].chars().chain(std::iter::once(',')) {
        match c {
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                let param = current.trim().trim_start_matches("...");
                let binding = param.split('=').next().unwrap_or("").trim();
                if binding.starts_with('{') || binding.starts_with('[') {
                    names.extend(IDENTIFIER.find_iter(binding).map(|m| m.as_str().to_string()));
                } else if let Some(m) = IDENTIFIER.find(binding) {
                    names.push(m.as_str().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    names
}

/// The string literal statement that opens the function body, if any.
///
/// Only a bare literal counts: it must end the statement (`;`, line end or
/// the closing brace) and hold no template interpolation. Directives such as
/// `"use strict"` are left alone.
fn find_docstring(lines: &[String], body_open: usize, brace: usize) -> Option<(String, TextSpan)> {
    let (line, column) = next_token(lines, body_open, brace + 1)?;
    let quote = lines[line][column..]
        .chars()
        .next()
        .filter(|c| matches!(c, '"' | '\'' | '`'))?;

    let mut contents = String::new();
    let mut current = line;
    let mut from = column + 1;
    let (close_line, close_column) = loop {
        let text = &lines[current];
        let mut chars = text[from..].char_indices().peekable();
        let mut closed = None;
        while let Some((offset, c)) = chars.next() {
            if c == '\\' {
                contents.push(c);
                if let Some((_, escaped)) = chars.next() {
                    contents.push(escaped);
                }
            } else if c == quote {
                closed = Some(from + offset + c.len_utf8());
                break;
            } else if quote == '`' && c == '$' && chars.peek().is_some_and(|(_, n)| *n == '{') {
                return None;
            } else {
                contents.push(c);
            }
        }
        if let Some(end) = closed {
            break (current, end);
        }
        if quote != '`' || current + 1 >= lines.len() {
            return None;
        }
        contents.push('\n');
        current += 1;
        from = 0;
    };

    if DIRECTIVES.contains(&contents.as_str()) {
        return None;
    }

    let after = &lines[close_line][close_column..];
    let trimmed = after.trim_start();
    let end = if trimmed.starts_with(';') {
        (close_line, close_column + (after.len() - trimmed.len()) + 1)
    } else if trimmed.starts_with('}') {
        (close_line, close_column)
    } else if trimmed.is_empty() {
        let continues = next_token(lines, close_line + 1, 0)
            .and_then(|(l, c)| lines[l][c..].chars().next())
            .is_some_and(|c| CONTINUATIONS.contains(&c));
        if continues {
            return None;
        }
        (close_line, close_column)
    } else {
        return None;
    };

    Some((
        contents,
        TextSpan {
            start: (line, column),
            end,
        },
    ))
}

/// Position of the first non-whitespace character at or after `column` of
/// `line`.
fn next_token(lines: &[String], line: usize, column: usize) -> Option<(usize, usize)> {
    lines.iter().enumerate().skip(line).find_map(|(index, text)| {
        let from = if index == line { column.min(text.len()) } else { 0 };
        let rest = text.get(from..)?;
        let skipped = rest.len() - rest.trim_start().len();
        (skipped < rest.len()).then_some((index, from + skipped))
    })
}
