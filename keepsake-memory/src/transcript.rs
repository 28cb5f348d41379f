//! Conversation transcript reading
//!
//! Transcripts are JSONL, one entry per line. An entry carries its role
//! either at the top level or inside `message`, and its content as a plain
//! string or as a list of content blocks (`text`, `tool_use`, `tool_result`).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::Path;

use serde_json::Value;
use tracing::warn;

use crate::error::Result;

/// Role of a transcript turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    /// Zero-based line index in the transcript
    pub line: usize,
    pub role: Role,
    /// Concatenated text blocks
    pub text: String,
    /// Files named in tool invocations
    pub tool_files: Vec<String>,
}

const FILE_KEYS: [&str; 3] = ["file_path", "path", "notebook_path"];

fn parse_role(entry: &Value) -> Option<Role> {
    let role = entry
        .pointer("/message/role")
        .or_else(|| entry.get("role"))
        .or_else(|| entry.get("type"))
        .and_then(Value::as_str)?;
    match role {
        "user" | "human" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        _ => None,
    }
}

fn collect_blocks(content: &Value, text: &mut Vec<String>, files: &mut Vec<String>) {
    match content {
        Value::String(s) => text.push(s.clone()),
        Value::Array(blocks) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(s) = block.get("text").and_then(Value::as_str) {
                            text.push(s.to_string());
                        }
                    }
                    Some("tool_use") => {
                        if let Some(input) = block.get("input") {
                            for key in FILE_KEYS {
                                if let Some(path) = input.get(key).and_then(Value::as_str) {
                                    if !files.iter().any(|f| f == path) {
                                        files.push(path.to_string());
                                    }
                                }
                            }
                        }
                    }
                    // Tool output and hidden reasoning are not conversation
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// Parse one transcript line. Entries that are not user or assistant turns
/// yield `None`; so do lines that are not valid JSON.
pub fn parse_line(line: usize, raw: &str) -> Option<Turn> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let entry: Value = match serde_json::from_str(raw) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(line, error = %e, "skipping corrupt transcript line");
            return None;
        }
    };

    let role = parse_role(&entry)?;
    let content = entry
        .pointer("/message/content")
        .or_else(|| entry.get("content"))?;

    let mut text = Vec::new();
    let mut tool_files = Vec::new();
    collect_blocks(content, &mut text, &mut tool_files);

    Some(Turn {
        line,
        role,
        text: text.join("\n").trim().to_string(),
        tool_files,
    })
}

/// Number of lines in the transcript; a missing file has none
pub fn count_lines(path: &Path) -> Result<usize> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        line?;
        count += 1;
    }
    Ok(count)
}

/// Turns on the lines in `range`
pub fn read_slice(path: &Path, range: Range<usize>) -> Result<Vec<Turn>> {
    if range.is_empty() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);

    let mut turns = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        if index >= range.end {
            break;
        }
        let line = line?;
        if index < range.start {
            continue;
        }
        if let Some(turn) = parse_line(index, &line) {
            turns.push(turn);
        }
    }
    Ok(turns)
}

/// Text of the first non-empty user turn, which frames the whole session
pub fn first_user_message(path: &Path) -> Result<Option<String>> {
    let reader = BufReader::new(File::open(path)?);
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(turn) = parse_line(index, &line) {
            if turn.role == Role::User && !turn.text.is_empty() {
                return Ok(Some(turn.text));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_transcript(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn parses_string_and_block_content() {
        let user = parse_line(0, r#"{"type":"user","message":{"role":"user","content":"fix the build"}}"#)
            .unwrap();
        assert_eq!(user.role, Role::User);
        assert_eq!(user.text, "fix the build");

        let assistant = parse_line(
            1,
            r#"{"type":"assistant","message":{"role":"assistant","content":[
                {"type":"thinking","thinking":"hmm"},
                {"type":"text","text":"Editing the manifest."},
                {"type":"tool_use","name":"Edit","input":{"file_path":"Cargo.toml"}},
                {"type":"tool_use","name":"Read","input":{"path":"src/lib.rs"}}
            ]}}"#,
        )
        .unwrap();
        assert_eq!(assistant.text, "Editing the manifest.");
        assert_eq!(assistant.tool_files, vec!["Cargo.toml", "src/lib.rs"]);
    }

    #[test]
    fn skips_corrupt_and_non_turn_lines() {
        assert!(parse_line(0, "{oops").is_none());
        assert!(parse_line(0, r#"{"type":"summary","summary":"x"}"#).is_none());
        assert!(parse_line(0, "   ").is_none());
    }

    #[test]
    fn reads_only_the_requested_slice() {
        let file = write_transcript(&[
            r#"{"role":"user","content":"first question about caching"}"#,
            r#"{"role":"assistant","content":"answer one"}"#,
            "not json",
            r#"{"role":"user","content":"second"}"#,
            r#"{"role":"assistant","content":"answer two"}"#,
        ]);

        assert_eq!(count_lines(file.path()).unwrap(), 5);

        let turns = read_slice(file.path(), 1..4).unwrap();
        let lines: Vec<_> = turns.iter().map(|t| t.line).collect();
        assert_eq!(lines, vec![1, 3]);

        assert_eq!(
            first_user_message(file.path()).unwrap().as_deref(),
            Some("first question about caching")
        );
    }

    #[test]
    fn missing_transcript_has_no_lines() {
        assert_eq!(count_lines(Path::new("/nonexistent/transcript.jsonl")).unwrap(), 0);
    }
}
