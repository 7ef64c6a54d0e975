//! Quasi-JSON normalisation and repair
//!
//! LLM output often carries array and object literals that are almost JSON:
//! single quotes, bare keys, bare list items, trailing commas, or a block cut
//! off before its closing brackets. These helpers coax them into something
//! `serde_json` accepts.

use serde_json::Value;

/// Closes unterminated strings, arrays and objects in the order they were opened.
pub fn repair_json(json_str: &str) -> String {
    let trimmed = json_str.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }

    let mut result = trimmed.to_string();
    let mut open: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in trimmed.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => open.push('}'),
            '[' if !in_string => open.push(']'),
            '}' | ']' if !in_string => {
                open.pop();
            }
            _ => {}
        }
    }

    if escape_next {
        result.pop();
    }
    if in_string {
        result.push('"');
    }
    strip_trailing_comma(&mut result);

    while let Some(closer) = open.pop() {
        result.push(closer);
    }

    result
}

/// Attempts to parse JSON, with fallback to repair and retry
pub fn parse_json_with_repair(json_str: &str) -> Result<Value, String> {
    if let Ok(value) = serde_json::from_str::<Value>(json_str) {
        return Ok(value);
    }

    let repaired = repair_json(json_str);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => {
            tracing::debug!(
                "[JSON-REPAIR] Repaired JSON: {} -> {} chars",
                json_str.len(),
                repaired.len()
            );
            Ok(value)
        }
        Err(e) => Err(format!(
            "Failed to parse JSON even after repair: {} (original: {} chars, repaired: {} chars)",
            e,
            json_str.len(),
            repaired.len()
        )),
    }
}

/// Parses strict JSON first, then the normalised quasi-JSON form.
pub fn parse_quasi_json(input: &str) -> Result<Value, String> {
    if let Ok(value) = serde_json::from_str::<Value>(input.trim()) {
        return Ok(value);
    }
    parse_json_with_repair(&normalize_quasi_json(input))
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    Array,
    Object { expect_key: bool },
}

/// Rewrites quasi-JSON into JSON: quotes bare keys and items, converts
/// single-quoted strings and drops trailing commas. Unbalanced input is left
/// for [`repair_json`].
pub fn normalize_quasi_json(input: &str) -> String {
    let chars: Vec<char> = input.trim().chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut stack: Vec<Frame> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                let (text, next) = read_quoted(&chars, i);
                out.push_str(&quote(&text));
                i = next;
                continue;
            }
            '[' => {
                stack.push(Frame::Array);
                out.push('[');
            }
            '{' => {
                stack.push(Frame::Object { expect_key: true });
                out.push('{');
            }
            ']' | '}' => {
                strip_trailing_comma(&mut out);
                stack.pop();
                out.push(c);
            }
            ',' => {
                out.push(',');
                if let Some(Frame::Object { expect_key }) = stack.last_mut() {
                    *expect_key = true;
                }
            }
            ':' => {
                out.push(':');
                if let Some(Frame::Object { expect_key }) = stack.last_mut() {
                    *expect_key = false;
                }
            }
            c if c.is_whitespace() => out.push(c),
            _ => {
                let in_key = matches!(stack.last(), Some(Frame::Object { expect_key: true }));
                let start = i;
                while i < chars.len() {
                    let d = chars[i];
                    if matches!(d, ',' | ']' | '}' | '[' | '{') || (in_key && d == ':') {
                        break;
                    }
                    i += 1;
                }
                let token: String = chars[start..i].iter().collect();
                let token = token.trim();
                if !in_key && is_json_literal(token) {
                    out.push_str(token);
                } else {
                    out.push_str(&quote(token));
                }
                continue;
            }
        }
        i += 1;
    }

    out
}

fn is_json_literal(token: &str) -> bool {
    matches!(token, "true" | "false" | "null")
        || serde_json::from_str::<serde_json::Number>(token).is_ok()
}

fn quote(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

fn strip_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    }
}

/// Reads a quoted string starting at `start` (which holds the quote char).
/// Returns the unescaped text and the index just past the closing quote.
fn read_quoted(chars: &[char], start: usize) -> (String, usize) {
    let q = chars[start];
    let mut text = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        if c == q {
            return (text, i + 1);
        }
        if c == '\\' && i + 1 < chars.len() {
            let e = chars[i + 1];
            i += 2;
            match e {
                'n' => text.push('\n'),
                't' => text.push('\t'),
                'r' => text.push('\r'),
                '"' | '\'' | '\\' | '/' => text.push(e),
                'u' => {
                    let hex: String = chars[i..(i + 4).min(chars.len())].iter().collect();
                    match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                        Some(decoded) if hex.len() == 4 => {
                            text.push(decoded);
                            i += 4;
                        }
                        _ => text.push_str("\\u"),
                    }
                }
                other => {
                    text.push('\\');
                    text.push(other);
                }
            }
            continue;
        }
        text.push(c);
        i += 1;
    }

    (text, chars.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_repair_closes_in_open_order() {
        let repaired = repair_json(r#"[{"path": "a.rs", "diff": "x"#);
        assert_eq!(repaired, r#"[{"path": "a.rs", "diff": "x"}]"#);
        assert!(serde_json::from_str::<Value>(&repaired).is_ok());
    }

    #[test]
    fn test_repair_drops_dangling_comma() {
        let repaired = repair_json(r#"["a", "b","#);
        assert_eq!(serde_json::from_str::<Value>(&repaired).unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn test_parse_json_with_repair_empty() {
        assert_eq!(parse_json_with_repair("").unwrap(), json!({}));
    }

    #[test]
    fn test_normalize_bare_items() {
        let v = parse_quasi_json("[src/main.rs, Cargo.toml, 'docs/read me.md']").unwrap();
        assert_eq!(v, json!(["src/main.rs", "Cargo.toml", "docs/read me.md"]));
    }

    #[test]
    fn test_normalize_bare_keys_and_trailing_commas() {
        let v = parse_quasi_json("[{path: src/lib.rs, diff: '+fn a() {}',},]").unwrap();
        assert_eq!(v, json!([{ "path": "src/lib.rs", "diff": "+fn a() {}" }]));
    }

    #[test]
    fn test_normalize_keeps_literals() {
        let v = parse_quasi_json("{count: 3, ok: true, none: null}").unwrap();
        assert_eq!(v, json!({ "count": 3, "ok": true, "none": null }));
    }

    #[test]
    fn test_normalize_escapes_inner_quotes() {
        let v = parse_quasi_json(r#"['say "hi"', 'it\'s']"#).unwrap();
        assert_eq!(v, json!(["say \"hi\"", "it's"]));
    }

    #[test]
    fn test_normalize_then_repair_truncated() {
        let v = parse_quasi_json("[{path: a.rs, diff: '@@ -1 +1 @@'").unwrap();
        assert_eq!(v, json!([{ "path": "a.rs", "diff": "@@ -1 +1 @@" }]));
    }

    #[test]
    fn test_strict_json_passthrough() {
        let v = parse_quasi_json(r#"["a\nb"]"#).unwrap();
        assert_eq!(v, json!(["a\nb"]));
    }
}
