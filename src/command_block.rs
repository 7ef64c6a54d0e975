//! Command blocks embedded in LLM output.
//!
//! A model may answer with a delimited region asking the client to send more
//! files (`request_files`) or to apply edits (`write_diffs`):
//!
//! ```text
//! <commands>
//! request_files: [src/main.rs, "Cargo.toml"]
//! write_diffs: [{path: src/lib.rs, diff: "@@ -1 +1 @@\n-a\n+b"}]
//! </commands>
//! ```
//!
//! A fenced block opened with ```` ```commands ```` is accepted as well, and the
//! body may also be a single JSON object. Parsing is best effort: problems are
//! reported as warnings on the block instead of failing the relay.

use crate::constants::{COMMAND_CLOSE_FENCE, COMMAND_CLOSE_TAG, COMMAND_OPEN_FENCE, COMMAND_OPEN_TAG};
use crate::json_repair::parse_quasi_json;
use crate::str_utils::floor_char_boundary;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

lazy_static! {
    static ref BLOCK_REGEX: Regex = Regex::new(
        r"(?s)<commands>(?P<tag>.*?)</commands>|```commands[ \t]*\r?\n(?P<fence>.*?)```"
    )
    .expect("Invalid command block regex");
    static ref OPEN_REGEX: Regex =
        Regex::new(r"<commands>|```commands").expect("Invalid command open regex");
    static ref KEY_REGEX: Regex = Regex::new(
        r"(?m)^[ \t]*(?P<key>request_files|write_diffs|requestFiles|writeDiffs)[ \t]*[:=][ \t]*"
    )
    .expect("Invalid command key regex");
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteDiff {
    pub path: String,
    pub diff: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandBlock {
    pub request_files: Vec<String>,
    pub write_diffs: Vec<WriteDiff>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl CommandBlock {
    pub fn is_empty(&self) -> bool {
        self.request_files.is_empty() && self.write_diffs.is_empty() && self.warnings.is_empty()
    }

    pub fn has_commands(&self) -> bool {
        !self.request_files.is_empty() || !self.write_diffs.is_empty()
    }

    fn push_file(&mut self, path: &str) {
        let path = path.trim();
        if path.is_empty() {
            return;
        }
        if !self.request_files.iter().any(|p| p == path) {
            self.request_files.push(path.to_string());
        }
    }

    fn push_diff(&mut self, diff: WriteDiff) {
        if !self.write_diffs.contains(&diff) {
            self.write_diffs.push(diff);
        }
    }

    /// Folds `other` into `self`, keeping first-seen order and dropping duplicates.
    pub fn absorb(&mut self, other: CommandBlock) {
        for path in &other.request_files {
            self.push_file(path);
        }
        for diff in other.write_diffs {
            self.push_diff(diff);
        }
        self.warnings.extend(other.warnings);
    }
}

/// Every command block in a finished reply, in order of appearance. A block
/// left open at the end is parsed best effort and carries a warning.
pub fn extract_command_blocks(text: &str) -> Vec<CommandBlock> {
    let mut scanner = CommandScanner::new();
    let mut blocks = scanner.push(text);
    blocks.extend(scanner.finish());
    blocks
}

pub fn merge(blocks: Vec<CommandBlock>) -> Option<CommandBlock> {
    let mut merged = CommandBlock::default();
    for block in blocks {
        merged.absorb(block);
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

/// Removes command blocks, leaving the prose around them. A block that never
/// closes runs to the end of the text.
pub fn strip_command_blocks(text: &str) -> String {
    let stripped = BLOCK_REGEX.replace_all(text, "");
    let prose = match OPEN_REGEX.find(&stripped) {
        Some(open) => &stripped[..open.start()],
        None => &stripped[..],
    };
    prose.trim().to_string()
}

pub fn parse_block_body(body: &str) -> CommandBlock {
    let mut block = CommandBlock::default();
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return block;
    }

    if trimmed.starts_with('{') {
        match parse_quasi_json(trimmed) {
            Ok(Value::Object(map)) => {
                let mut recognised = false;
                for (key, value) in map {
                    match key.as_str() {
                        "request_files" | "requestFiles" => {
                            recognised = true;
                            collect_files(&mut block, value);
                        }
                        "write_diffs" | "writeDiffs" => {
                            recognised = true;
                            collect_diffs(&mut block, value);
                        }
                        other => block
                            .warnings
                            .push(format!("Ignoring unknown command '{}'", other)),
                    }
                }
                if !recognised {
                    block
                        .warnings
                        .push("Command block contains no recognised commands".to_string());
                }
                return block;
            }
            Ok(_) => {
                block
                    .warnings
                    .push("Command block object did not parse to an object".to_string());
                return block;
            }
            Err(e) => {
                tracing::debug!("Command block object unparseable, trying keyed lines: {}", e);
            }
        }
    }

    let mut recognised = false;
    for caps in KEY_REGEX.captures_iter(trimmed) {
        let (Some(key), Some(whole)) = (caps.name("key"), caps.get(0)) else {
            continue;
        };
        recognised = true;
        let rest = &trimmed[whole.end()..];
        let literal = if rest.starts_with('[') {
            let (slice, complete) = balanced_literal(rest);
            if !complete {
                block
                    .warnings
                    .push(format!("Unterminated array for '{}'", key.as_str()));
            }
            slice.to_string()
        } else {
            // A single unbracketed value on the rest of the line.
            let line = rest.lines().next().unwrap_or_default();
            format!("[{}]", line.trim())
        };

        match parse_quasi_json(&literal) {
            Ok(value) => match key.as_str() {
                "request_files" | "requestFiles" => collect_files(&mut block, value),
                _ => collect_diffs(&mut block, value),
            },
            Err(e) => block
                .warnings
                .push(format!("Could not parse '{}': {}", key.as_str(), e)),
        }
    }

    if !recognised {
        block
            .warnings
            .push("Command block contains no recognised commands".to_string());
    }
    block
}

/// Returns the bracketed literal at the start of `s` and whether it closed.
fn balanced_literal(s: &str) -> (&str, bool) {
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut escape_next = false;

    for (idx, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if let Some(q) = quote {
            match ch {
                '\\' => escape_next = true,
                c if c == q => quote = None,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return (&s[..idx + ch.len_utf8()], true);
                }
            }
            _ => {}
        }
    }
    (s, false)
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn collect_files(block: &mut CommandBlock, value: Value) {
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    for item in items {
        let path = match &item {
            Value::Object(map) => map.get("path").or_else(|| map.get("file")).and_then(value_as_text),
            other => value_as_text(other),
        };
        match path {
            Some(p) => block.push_file(&p),
            None => block
                .warnings
                .push(format!("Ignoring request_files entry {}", item)),
        }
    }
}

fn collect_diffs(block: &mut CommandBlock, value: Value) {
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    for (idx, item) in items.into_iter().enumerate() {
        let (path, diff) = match &item {
            Value::Object(map) => (
                map.get("path").or_else(|| map.get("file")).and_then(value_as_text),
                map.get("diff").or_else(|| map.get("content")).and_then(value_as_text),
            ),
            Value::Array(pair) if pair.len() == 2 => {
                (value_as_text(&pair[0]), value_as_text(&pair[1]))
            }
            _ => (None, None),
        };
        match (path, diff) {
            (Some(path), Some(diff)) if !path.trim().is_empty() => block.push_diff(WriteDiff {
                path: path.trim().to_string(),
                diff,
            }),
            (Some(path), None) if !path.trim().is_empty() => block
                .warnings
                .push(format!("write_diffs entry {} for '{}' has no diff", idx, path.trim())),
            _ => block
                .warnings
                .push(format!("write_diffs entry {} has no path", idx)),
        }
    }
}

/// Finds command blocks in streamed text as soon as they close.
#[derive(Debug, Default)]
pub struct CommandScanner {
    buffer: String,
    scan_from: usize,
    found: usize,
}

impl CommandScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks_found(&self) -> usize {
        self.found
    }

    pub fn push(&mut self, delta: &str) -> Vec<CommandBlock> {
        self.buffer.push_str(delta);
        let mut blocks = Vec::new();

        while let Some(caps) = BLOCK_REGEX.captures(&self.buffer[self.scan_from..]) {
            let Some(whole) = caps.get(0) else {
                break;
            };
            let body = caps
                .name("tag")
                .or_else(|| caps.name("fence"))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let block = parse_block_body(body);
            self.scan_from += whole.end();
            if !block.is_empty() {
                self.found += 1;
                blocks.push(block);
            }
        }

        match OPEN_REGEX.find(&self.buffer[self.scan_from..]) {
            // Hold position at an opened block until it closes.
            Some(open) => self.scan_from += open.start(),
            None => {
                let longest = COMMAND_OPEN_TAG.len().max(COMMAND_OPEN_FENCE.len());
                let keep = self.buffer.len().saturating_sub(longest - 1);
                self.scan_from = self.scan_from.max(floor_char_boundary(&self.buffer, keep));
            }
        }

        blocks
    }

    /// Reports a block that was opened but never closed.
    pub fn finish(&mut self) -> Option<CommandBlock> {
        let pending = &self.buffer[self.scan_from..];
        let open = OPEN_REGEX.find(pending)?;
        let body_start = open.end();
        let mut body = &pending[body_start..];
        if pending[open.start()..].starts_with(COMMAND_OPEN_FENCE) {
            body = body.trim_start_matches([' ', '\t']);
            body = body.strip_prefix('\n').unwrap_or(body);
        }
        let mut block = parse_block_body(body);
        block.warnings.push(format!(
            "Unterminated command block (missing '{}' or '{}')",
            COMMAND_CLOSE_TAG, COMMAND_CLOSE_FENCE
        ));
        self.scan_from = self.buffer.len();
        self.found += 1;
        Some(block)
    }
}
