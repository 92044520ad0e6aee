//! Minimal lexical scanning of script source.
//!
//! The bridge never parses scripts fully. It only needs to know which
//! characters are code (as opposed to string literals and comments) so it can
//! match braces and collect identifiers. Regex literals are treated as code.

/// Replace the contents of string literals and comments with spaces.
///
/// Line breaks are preserved and every character is blanked with as many
/// bytes as it occupies, so byte offsets in the masked text match the input.
/// The expressions inside template `${...}` interpolations stay code.
pub fn mask_non_code(source: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Str(char),
        LineComment,
        BlockComment,
    }

    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut state = State::Code;
    // Brace depth inside each open template interpolation, innermost last.
    let mut interpolations: Vec<usize> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            State::Code => match c {
                '"' | '\'' | '`' => {
                    state = State::Str(c);
                    out.push(' ');
                }
                '/' if next == Some('/') => {
                    state = State::LineComment;
                    out.push_str("  ");
                    i += 1;
                }
                '/' if next == Some('*') => {
                    state = State::BlockComment;
                    out.push_str("  ");
                    i += 1;
                }
                '{' if !interpolations.is_empty() => {
                    if let Some(depth) = interpolations.last_mut() {
                        *depth += 1;
                    }
                    out.push(c);
                }
                '}' if interpolations.last() == Some(&0) => {
                    interpolations.pop();
                    state = State::Str('`');
                    out.push(' ');
                }
                '}' if !interpolations.is_empty() => {
                    if let Some(depth) = interpolations.last_mut() {
                        *depth -= 1;
                    }
                    out.push(c);
                }
                _ => out.push(c),
            },
            State::Str(quote) => {
                if c == '\\' {
                    out.push(' ');
                    if let Some(escaped) = next {
                        blank(&mut out, escaped);
                        i += 1;
                    }
                } else if c == quote {
                    state = State::Code;
                    out.push(' ');
                } else if quote == '`' && c == '$' && next == Some('{') {
                    interpolations.push(0);
                    state = State::Code;
                    out.push_str("  ");
                    i += 1;
                } else if c == '\n' {
                    // Unterminated single-line strings end at the line break.
                    if quote != '`' {
                        state = State::Code;
                    }
                    out.push('\n');
                } else {
                    blank(&mut out, c);
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                    out.push('\n');
                } else {
                    blank(&mut out, c);
                }
            }
            State::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = State::Code;
                    out.push_str("  ");
                    i += 1;
                } else {
                    blank(&mut out, c);
                }
            }
        }
        i += 1;
    }

    out
}

/// Push `c` blanked to spaces, keeping line breaks and byte width.
fn blank(out: &mut String, c: char) {
    if c == '\n' {
        out.push('\n');
    } else {
        out.extend(std::iter::repeat(' ').take(c.len_utf8()));
    }
}

/// Brace depth at the start of every line of `masked`.
pub fn line_depths(masked: &str) -> Vec<i32> {
    let mut depth = 0;
    masked
        .lines()
        .map(|line| {
            let start = depth;
            depth += brace_delta(line);
            start
        })
        .collect()
}

/// Net change in brace depth across one masked line.
pub fn brace_delta(masked_line: &str) -> i32 {
    masked_line.chars().fold(0, |acc, c| match c {
        '{' => acc + 1,
        '}' => acc - 1,
        _ => acc,
    })
}

/// Index of the line that closes the block opened at or after `start`.
///
/// Returns `None` when the braces never balance.
pub fn block_end<S: AsRef<str>>(masked_lines: &[S], start: usize) -> Option<usize> {
    let (line, column) = masked_lines
        .iter()
        .enumerate()
        .skip(start)
        .find_map(|(index, text)| text.as_ref().find('{').map(|column| (index, column)))?;
    block_end_at(masked_lines, line, column)
}

/// Index of the line holding the `}` that matches the `{` at `line`, `column`.
pub fn block_end_at<S: AsRef<str>>(masked_lines: &[S], line: usize, column: usize) -> Option<usize> {
    let mut depth = 0;
    for (index, text) in masked_lines.iter().enumerate().skip(line) {
        let text = text.as_ref();
        let from = if index == line { column } else { 0 };
        for c in text.get(from..)?.chars() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(index);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Position (line, byte column) of the `{` opening a function body whose
/// declaration starts at `start`.
///
/// The parameter list is skipped first, so destructured parameters and
/// object defaults are never mistaken for the body.
pub fn body_brace<S: AsRef<str>>(masked_lines: &[S], start: usize) -> Option<(usize, usize)> {
    let mut depth = 0;
    let mut params_closed = false;
    for (index, text) in masked_lines.iter().enumerate().skip(start) {
        for (column, c) in text.as_ref().char_indices() {
            match c {
                '(' if !params_closed => depth += 1,
                ')' if !params_closed => {
                    depth -= 1;
                    if depth == 0 {
                        params_closed = true;
                    }
                }
                '{' if params_closed => return Some((index, column)),
                _ => {}
            }
        }
    }
    None
}

/// Leading whitespace of a line.
pub fn indentation(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_strings_and_comments() {
        let masked = mask_non_code("let a = \"{x}\"; // }\nb({ c: '}' });");
        assert_eq!(masked.lines().count(), 2);
        assert_eq!(brace_delta(masked.lines().next().unwrap()), 0);
        assert_eq!(brace_delta(masked.lines().nth(1).unwrap()), 0);
        assert!(masked.contains("let a ="));
        assert!(!masked.contains('x'));
    }

    #[test]
    fn test_template_literal_spans_lines() {
        let masked = mask_non_code("const t = `a\n{\n`;\nx");
        let lines: Vec<&str> = masked.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1].trim(), "");
        assert_eq!(lines[3], "x");
    }

    #[test]
    fn test_block_comment_masked() {
        let masked = mask_non_code("a /* { */ b");
        assert_eq!(masked.chars().count(), "a /* { */ b".chars().count());
        assert_eq!(brace_delta(&masked), 0);
    }

    #[test]
    fn test_block_end_and_depths() {
        let source = "function f() {\n  if (x) {\n    y();\n  }\n}\nconst z = 1;";
        let masked = mask_non_code(source);
        let lines: Vec<&str> = masked.lines().collect();
        assert_eq!(block_end(&lines, 0), Some(4));
        assert_eq!(line_depths(&masked), vec![0, 1, 2, 2, 1, 0]);
    }

    #[test]
    fn test_block_end_unbalanced() {
        let masked = mask_non_code("function f() {\n  return 1;\n");
        let lines: Vec<&str> = masked.lines().collect();
        assert_eq!(block_end(&lines, 0), None);
    }

    #[test]
    fn test_template_interpolation_stays_code() {
        let masked = mask_non_code("return `size ${unit(n, { big: true })} of \"${name}\"`;");
        assert!(masked.contains("unit(n, { big: true })"));
        assert!(masked.contains("name"));
        assert!(!masked.contains("size"));
        assert!(!masked.contains(" of "));
        assert_eq!(brace_delta(&masked), 0);
    }

    #[test]
    fn test_nested_template_interpolation() {
        let source = "`a ${`b ${inner} c`} d` + outer";
        let masked = mask_non_code(source);
        assert!(masked.contains("inner"));
        assert!(masked.ends_with("+ outer"));
        assert!(!masked.contains('a'));
        assert!(!masked.contains('d'));
    }

    #[test]
    fn test_masking_keeps_byte_offsets() {
        let source = "const s = \"héllo\"; f({})";
        let masked = mask_non_code(source);
        assert_eq!(masked.len(), source.len());
        assert_eq!(masked.find('{'), source.find('{'));
    }

    #[test]
    fn test_body_brace_skips_destructured_params() {
        let source = "function place({ x, y }, opts = {}) {\n    return x + y;\n}";
        let masked = mask_non_code(source);
        let lines: Vec<&str> = masked.lines().collect();
        assert_eq!(body_brace(&lines, 0), Some((0, 36)));
        assert_eq!(block_end_at(&lines, 0, 36), Some(2));

        let split = "function place(\n    { x, y }\n) {\n    return x;\n}";
        let masked = mask_non_code(split);
        let lines: Vec<&str> = masked.lines().collect();
        assert_eq!(body_brace(&lines, 0), Some((2, 2)));
        assert_eq!(block_end_at(&lines, 2, 2), Some(4));
    }

    #[test]
    fn test_indentation() {
        assert_eq!(indentation("    return 1;"), "    ");
        assert_eq!(indentation("x"), "");
    }
}
