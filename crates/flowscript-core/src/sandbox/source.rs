//! Recovers the text of `fn` definitions and closure literals from script
//! source.
//!
//! The engine keeps compiled functions but not the text they came from, and
//! the text is what gets persisted. The scanner is string- and
//! comment-aware. Named definitions are only looked for at top level;
//! closure literals anywhere.

/// One top-level `fn` definition as written, `private` included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionText {
    pub name: String,
    pub arity: usize,
    pub text: String,
}

/// One closure literal (`|a, b| body`) and its byte span in the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureText {
    pub start: usize,
    pub end: usize,
    /// Declared parameters; captured variables are not listed.
    pub params: Vec<String>,
    pub text: String,
}

/// Result of scanning a script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    pub functions: Vec<FunctionText>,
    /// Closure literals in source order, nested ones included.
    pub closures: Vec<ClosureText>,
    /// Anything other than definitions, whitespace and comments at top level.
    pub has_statements: bool,
}

impl Scan {
    pub fn find(&self, name: &str, arity: usize) -> Option<&FunctionText> {
        self.functions
            .iter()
            .find(|f| f.name == name && f.arity == arity)
    }

    /// The closure literal that makes up the whole of `script`, if any.
    pub fn sole_closure(&self, script: &str) -> Option<&ClosureText> {
        let start = script.len() - script.trim_start().len();
        let end = script.trim_end().len();
        if !self.functions.is_empty() {
            return None;
        }
        self.closures
            .iter()
            .find(|closure| closure.start == start && closure.end == end)
    }
}

/// `script` with everything outside `closure` blanked to spaces. Line and
/// column positions of the literal are unchanged, so the engine names the
/// anonymous function it compiles to exactly as it did in `script`.
pub fn isolate(script: &str, closure: &ClosureText) -> String {
    script
        .char_indices()
        .map(|(i, c)| {
            if (closure.start..closure.end).contains(&i) || c == '\n' || c == '\r' {
                c
            } else {
                ' '
            }
        })
        .collect()
}

pub fn scan(script: &str) -> Scan {
    let bytes = script.as_bytes();
    let mut result = Scan::default();
    let mut pos = 0;
    let mut depth = 0usize;

    while pos < bytes.len() {
        if let Some((next, is_comment)) = skip_literal(bytes, pos) {
            if !is_comment {
                result.has_statements = true;
            }
            pos = next;
            continue;
        }
        let byte = bytes[pos];
        if depth == 0 {
            let fn_at = if is_keyword_at(bytes, pos, b"private") {
                skip_whitespace(bytes, pos + b"private".len())
            } else {
                pos
            };
            if is_keyword_at(bytes, fn_at, b"fn") {
                if let Some((name, arity, end)) = definition_at(bytes, fn_at) {
                    result.functions.push(FunctionText {
                        name,
                        arity,
                        text: script[pos..end].to_string(),
                    });
                    pos = end;
                    continue;
                }
            }
        }
        match byte {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        if !byte.is_ascii_whitespace() {
            result.has_statements = true;
        }
        pos += 1;
    }
    result.closures = closures(script);
    result
}

/// Words after which `|` opens a closure rather than a bitwise or.
const EXPRESSION_KEYWORDS: &[&str] = &["return", "throw", "in"];

fn closures(script: &str) -> Vec<ClosureText> {
    let bytes = script.as_bytes();
    let mut found = Vec::new();
    let mut pos = 0;
    // Whether the previous token ends an operand.
    let mut operand = false;

    while pos < bytes.len() {
        if let Some((next, is_comment)) = skip_literal(bytes, pos) {
            operand |= !is_comment;
            pos = next;
            continue;
        }
        let byte = bytes[pos];
        if byte.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        if is_ident(byte) {
            let start = pos;
            while pos < bytes.len() && is_ident(bytes[pos]) {
                pos += 1;
            }
            operand = !EXPRESSION_KEYWORDS.contains(&&script[start..pos]);
            continue;
        }
        if byte == b'|' && !operand {
            if let Some((closure, body)) = closure_at(script, pos) {
                found.push(closure);
                pos = body;
                continue;
            }
        }
        if byte == b'|' && bytes.get(pos + 1) == Some(&b'|') {
            pos += 2;
            operand = false;
            continue;
        }
        operand = matches!(byte, b')' | b']');
        pos += 1;
    }
    found
}

/// Parse a closure literal whose opening `|` is at `pos`. Returns the literal
/// and the offset its body starts at.
fn closure_at(script: &str, pos: usize) -> Option<(ClosureText, usize)> {
    let bytes = script.as_bytes();
    let (params, after) = if bytes.get(pos + 1) == Some(&b'|') {
        (Vec::new(), pos + 2)
    } else {
        let close = pos + 1 + bytes[pos + 1..].iter().position(|&b| b == b'|')?;
        let list = &script[pos + 1..close];
        if !list
            .bytes()
            .all(|b| is_ident(b) || b == b',' || b.is_ascii_whitespace())
        {
            return None;
        }
        let params: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if params.iter().any(|p| p.starts_with(|c: char| c.is_ascii_digit())) {
            return None;
        }
        (params, close + 1)
    };

    let body = skip_whitespace(bytes, after);
    let end = if bytes.get(body) == Some(&b'{') {
        block_end(bytes, body)?
    } else {
        expression_end(bytes, body)
    };
    if end <= body {
        return None;
    }
    Some((
        ClosureText {
            start: pos,
            end,
            params,
            text: script[pos..end].to_string(),
        },
        body,
    ))
}

/// End of an expression body: the first unbalanced closer, `;` or `,`.
/// Trailing whitespace and comments are not included.
fn expression_end(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    let mut last = start;
    while i < bytes.len() {
        if let Some((next, is_comment)) = skip_literal(bytes, i) {
            if !is_comment {
                last = next;
            }
            i = next;
            continue;
        }
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' | b';' | b',' if depth == 0 => break,
            b')' | b']' | b'}' => depth -= 1,
            _ => {}
        }
        if !bytes[i].is_ascii_whitespace() {
            last = i + 1;
        }
        i += 1;
    }
    last
}

fn is_ident(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn is_keyword_at(bytes: &[u8], pos: usize, keyword: &[u8]) -> bool {
    bytes[pos..].starts_with(keyword)
        && (pos == 0 || !is_ident(bytes[pos - 1]))
        && bytes
            .get(pos + keyword.len())
            .is_some_and(|b| b.is_ascii_whitespace())
}

/// Skip a string, character literal or comment starting at `pos`.
/// Returns the position after it and whether it was a comment.
fn skip_literal(bytes: &[u8], pos: usize) -> Option<(usize, bool)> {
    match bytes[pos] {
        b'"' => Some((skip_quoted(bytes, pos, b'"', true), false)),
        b'\'' => Some((skip_quoted(bytes, pos, b'\'', true), false)),
        b'`' => Some((skip_quoted(bytes, pos, b'`', false), false)),
        b'/' if bytes.get(pos + 1) == Some(&b'/') => Some((skip_line(bytes, pos), true)),
        b'/' if bytes.get(pos + 1) == Some(&b'*') => Some((skip_block_comment(bytes, pos), true)),
        _ => None,
    }
}

fn skip_quoted(bytes: &[u8], pos: usize, quote: u8, escapes: bool) -> usize {
    let mut i = pos + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if escapes => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_line(bytes: &[u8], pos: usize) -> usize {
    bytes[pos..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |offset| pos + offset)
}

// Block comments nest.
fn skip_block_comment(bytes: &[u8], pos: usize) -> usize {
    let mut depth = 0usize;
    let mut i = pos;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_whitespace(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// Parse `fn name(params) { body }` at `pos`: name, arity and end offset.
fn definition_at(bytes: &[u8], pos: usize) -> Option<(String, usize, usize)> {
    let name_start = skip_whitespace(bytes, pos + 2);
    let mut i = name_start;
    while i < bytes.len() && is_ident(bytes[i]) {
        i += 1;
    }
    if i == name_start {
        return None;
    }
    let name = std::str::from_utf8(&bytes[name_start..i]).ok()?.to_string();

    i = skip_whitespace(bytes, i);
    if bytes.get(i) != Some(&b'(') {
        return None;
    }
    let close = i + bytes[i..].iter().position(|&b| b == b')')?;
    let params = std::str::from_utf8(&bytes[i + 1..close]).ok()?;
    let arity = params.split(',').filter(|p| !p.trim().is_empty()).count();

    i = skip_whitespace(bytes, close + 1);
    if bytes.get(i) != Some(&b'{') {
        return None;
    }
    Some((name, arity, block_end(bytes, i)?))
}

/// Offset just past the `}` matching the `{` at `open`.
fn block_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        if let Some((next, _)) = skip_literal(bytes, i) {
            i = next;
            continue;
        }
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_definitions_among_statements() {
        let script = r#"
            let x = 5;
            fn greet(n) { return "hi " + n; }
            fn add(a, b) {
                let m = #{ total: a + b };
                m.total
            }
            greet("a");
        "#;
        let scan = scan(script);
        assert!(scan.has_statements);
        assert_eq!(scan.functions.len(), 2);
        assert_eq!(
            scan.find("greet", 1).unwrap().text,
            r#"fn greet(n) { return "hi " + n; }"#
        );
        assert!(scan.find("add", 2).unwrap().text.ends_with('}'));
        assert!(scan.find("add", 1).is_none());
    }

    #[test]
    fn test_braces_in_strings_and_comments_are_ignored() {
        let script = r#"fn tricky(s) {
            // closing } in a comment
            /* and { in /* a nested */ block */
            let t = "}" + '{' + `}`;
            t + s
        }"#;
        let scan = scan(script);
        assert_eq!(scan.functions.len(), 1);
        assert_eq!(scan.functions[0].text, script);
        assert!(!scan.has_statements);
    }

    #[test]
    fn test_fn_inside_identifier_or_string_is_not_a_definition() {
        let scan = scan(r#"let my_fn = 1; let s = "fn fake() { }"; let f = Fn("x");"#);
        assert!(scan.functions.is_empty());
        assert!(scan.has_statements);
    }

    #[test]
    fn test_overloads_are_distinguished_by_arity() {
        let scan = scan("fn f() { 0 }\n\nfn f(a) { a }\n");
        assert_eq!(scan.functions.len(), 2);
        assert_eq!(scan.find("f", 0).unwrap().text, "fn f() { 0 }");
        assert_eq!(scan.find("f", 1).unwrap().text, "fn f(a) { a }");
        assert!(!scan.has_statements);
    }

    #[test]
    fn test_private_keyword_is_part_of_definition() {
        let scan = scan("private fn hidden(a) { a }\nfn open() { 1 }");
        assert_eq!(scan.find("hidden", 1).unwrap().text, "private fn hidden(a) { a }");
        assert_eq!(scan.find("open", 0).unwrap().text, "fn open() { 1 }");
        assert!(!scan.has_statements);
    }

    #[test]
    fn test_closure_literals_are_found() {
        let script = r#"
            let greet = |n| "hi " + n;
            let pick = |a, b| { if a > b { a } else { b } };
            let none = || 42;
            let masked = flags | 4;
            let either = ready || late;
            list.map(|x| x * 2).filter(|x| x > 2);
        "#;
        let scan = scan(script);
        let texts: Vec<&str> = scan.closures.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                r#"|n| "hi " + n"#,
                "|a, b| { if a > b { a } else { b } }",
                "|| 42",
                "|x| x * 2",
                "|x| x > 2",
            ]
        );
        assert_eq!(scan.closures[1].params, vec!["a", "b"]);
        assert!(scan.closures[2].params.is_empty());
    }

    #[test]
    fn test_nested_closures_and_closures_in_functions() {
        let script = "fn adder(n) { |x| x + n }\nlet curry = |a| |b| a + b;";
        let scan = scan(script);
        let texts: Vec<&str> = scan.closures.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["|x| x + n", "|a| |b| a + b", "|b| a + b"]);
    }

    #[test]
    fn test_sole_closure() {
        let source = "  |n| n + 1\n";
        let scan = scan(source);
        assert_eq!(scan.sole_closure(source).unwrap().text, "|n| n + 1");

        let source = "|n| n + 1; launch()";
        assert!(scan_sole(source).is_none());
        let source = "fn f() { 1 }";
        assert!(scan_sole(source).is_none());
    }

    fn scan_sole(source: &str) -> Option<ClosureText> {
        scan(source).sole_closure(source).cloned()
    }

    #[test]
    fn test_isolate_keeps_positions() {
        let script = "let a = 1;\nlet f = |x| x + a; // done";
        let scan = scan(script);
        let isolated = isolate(script, &scan.closures[0]);
        assert_eq!(isolated.len(), script.len());
        assert_eq!(isolated.trim(), "|x| x + a");
        assert_eq!(isolated.find('|'), script.find('|'));
        assert_eq!(isolated.matches('\n').count(), 1);
    }

    #[test]
    fn test_only_comments_is_not_statements() {
        let scan = scan("// nothing\n/* here */\n");
        assert!(!scan.has_statements);
        assert!(scan.functions.is_empty());
    }
}
