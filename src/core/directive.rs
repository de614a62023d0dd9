//! Directive parsing for model output.
//!
//! Model replies are prose with fenced blocks mixed in. Blocks tagged
//! `file`, `edit`, `delete`, `request`, or `tool` are directives:
//!
//! ````text
//! ```edit
//! path: src/lib.rs
//! <<<<<<< SEARCH
//! old
//! =======
//! new
//! >>>>>>> REPLACE
//! ```
//! ````
//!
//! Parsing is two-stage: [`parse_blocks`] splits fences out of the text,
//! then [`parse_directives`] turns each tagged block into a typed
//! [`Directive`]. A bad block yields an `Err` entry and never hides the
//! blocks around it.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::infra::{
    io::normalize_newlines,
    paths::{InvalidPath, normalize_rel_path},
};

/// Fence delimiter.
pub const FENCE: &str = "```";

static PATH_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^path:\s*(.+)$").expect("valid path header regex"));

/// One fenced block as it appeared in the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FencedBlock {
    /// Lowercased, trimmed text after the opening fence
    pub lang: String,
    /// Content between the fences, LF-normalized and trimmed
    pub body: String,
}

/// Tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Typed directive; exhaustively matched by every consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Directive {
    /// Create or overwrite `path` with `content` verbatim
    WriteFile { path: String, content: String },
    /// Apply SEARCH/REPLACE triples in `body` to `path`
    ApplyEdit { path: String, body: String },
    /// Remove `path`
    DeleteFile { path: String },
    /// Ask for file contents before continuing
    RequestFiles { paths: Vec<String> },
    /// Call a named tool
    ToolCall(ToolCall),
}

/// Discriminant of [`Directive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    WriteFile,
    ApplyEdit,
    DeleteFile,
    RequestFiles,
    ToolCall,
}

impl DirectiveKind {
    /// Fence tag for this kind.
    pub fn tag(self) -> &'static str {
        match self {
            DirectiveKind::WriteFile => "file",
            DirectiveKind::ApplyEdit => "edit",
            DirectiveKind::DeleteFile => "delete",
            DirectiveKind::RequestFiles => "request",
            DirectiveKind::ToolCall => "tool",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "file" => Some(DirectiveKind::WriteFile),
            "edit" => Some(DirectiveKind::ApplyEdit),
            "delete" => Some(DirectiveKind::DeleteFile),
            "request" => Some(DirectiveKind::RequestFiles),
            "tool" => Some(DirectiveKind::ToolCall),
            _ => None,
        }
    }
}

impl std::fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

impl Directive {
    pub fn kind(&self) -> DirectiveKind {
        match self {
            Directive::WriteFile { .. } => DirectiveKind::WriteFile,
            Directive::ApplyEdit { .. } => DirectiveKind::ApplyEdit,
            Directive::DeleteFile { .. } => DirectiveKind::DeleteFile,
            Directive::RequestFiles { .. } => DirectiveKind::RequestFiles,
            Directive::ToolCall(_) => DirectiveKind::ToolCall,
        }
    }

    /// Target path for file-mutating directives.
    pub fn path(&self) -> Option<&str> {
        match self {
            Directive::WriteFile { path, .. }
            | Directive::ApplyEdit { path, .. }
            | Directive::DeleteFile { path } => Some(path),
            Directive::RequestFiles { .. } | Directive::ToolCall(_) => None,
        }
    }
}

/// Per-block parse failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("`{kind}` block has no `path:` header")]
    MissingPath { kind: DirectiveKind },

    #[error("`{kind}` block has an invalid path: {source}")]
    InvalidPath {
        kind: DirectiveKind,
        #[source]
        source: InvalidPath,
    },

    #[error("`request` block lists no valid paths")]
    EmptyRequest,
}

/// Header path plus everything after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPayload {
    pub path: String,
    pub payload: String,
}

/// Split `text` into fenced blocks in document order.
///
/// An opening fence whose tag line or closing fence never arrives is
/// dropped along with everything after it; the text may be a stream cut
/// mid-generation.
pub fn parse_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];
        let Some(nl) = after_open.find('\n') else {
            break;
        };
        let lang = after_open[..nl].trim().to_lowercase();
        let after_tag = &after_open[nl + 1..];

        let Some(close) = after_tag.find(FENCE) else {
            break;
        };
        let body = normalize_newlines(&after_tag[..close]).trim().to_string();
        blocks.push(FencedBlock { lang, body });

        rest = &after_tag[close + FENCE.len()..];
    }

    blocks
}

/// Read the `path:` header of a `file`/`edit`/`delete` body.
pub fn parse_path_directive(kind: DirectiveKind, body: &str) -> Result<PathPayload, ParseError> {
    let mut lines = body.split('\n');

    let header = lines
        .by_ref()
        .find(|l| !l.trim().is_empty())
        .ok_or(ParseError::MissingPath { kind })?;

    let raw = PATH_HEADER
        .captures(header.trim())
        .and_then(|c| c.get(1))
        .map(|m| strip_quotes(m.as_str().trim()))
        .ok_or(ParseError::MissingPath { kind })?;

    let path =
        normalize_rel_path(raw).map_err(|source| ParseError::InvalidPath { kind, source })?;
    let payload = lines.collect::<Vec<_>>().join("\n");

    Ok(PathPayload { path, payload })
}

/// Read the `- <path>` list of a `request` body.
pub fn parse_request_paths(body: &str) -> Result<Vec<String>, ParseError> {
    let mut paths = Vec::new();
    let mut first_error = None;

    for line in body.lines().map(str::trim) {
        if line.is_empty() || line.eq_ignore_ascii_case("paths:") {
            continue;
        }
        let Some(item) = line.strip_prefix('-') else {
            continue;
        };
        let raw = strip_quotes(item.trim());
        match normalize_rel_path(raw) {
            Ok(p) => {
                if !paths.contains(&p) {
                    paths.push(p);
                }
            }
            Err(e) => {
                warn!(path = raw, error = %e, "skipping requested path");
                first_error.get_or_insert(e);
            }
        }
    }

    if paths.is_empty() {
        return Err(match first_error {
            Some(source) => ParseError::InvalidPath {
                kind: DirectiveKind::RequestFiles,
                source,
            },
            None => ParseError::EmptyRequest,
        });
    }
    Ok(paths)
}

/// Decode a `tool` body. Malformed input yields `None`.
pub fn parse_tool_call(body: &str) -> Option<ToolCall> {
    match serde_json::from_str::<ToolCall>(body) {
        Ok(call) if !call.name.trim().is_empty() && call.args.is_object() => Some(call),
        Ok(call) => {
            debug!(name = %call.name, "tool call without name or object args");
            None
        }
        Err(e) => {
            debug!(error = %e, "malformed tool block");
            None
        }
    }
}

/// Full pipeline: fences → typed directives, one entry per directive block.
///
/// Blocks with other tags (`rust`, `json`, ...) are ignored. Malformed
/// `tool` blocks are skipped without an entry.
pub fn parse_directives(text: &str) -> Vec<Result<Directive, ParseError>> {
    let mut out = Vec::new();

    for block in parse_blocks(text) {
        let Some(kind) = DirectiveKind::from_tag(&block.lang) else {
            continue;
        };

        let parsed = match kind {
            DirectiveKind::WriteFile => parse_path_directive(kind, &block.body)
                .map(|pp| Directive::WriteFile { path: pp.path, content: pp.payload }),
            DirectiveKind::ApplyEdit => parse_path_directive(kind, &block.body)
                .map(|pp| Directive::ApplyEdit { path: pp.path, body: pp.payload }),
            DirectiveKind::DeleteFile => {
                parse_path_directive(kind, &block.body).map(|pp| Directive::DeleteFile { path: pp.path })
            }
            DirectiveKind::RequestFiles => {
                parse_request_paths(&block.body).map(|paths| Directive::RequestFiles { paths })
            }
            DirectiveKind::ToolCall => match parse_tool_call(&block.body) {
                Some(call) => Ok(Directive::ToolCall(call)),
                None => continue,
            },
        };

        if let Err(e) = &parsed {
            debug!(error = %e, "directive rejected");
        }
        out.push(parsed);
    }

    out
}

/// Strip one layer of matching quotes or backticks.
fn strip_quotes(s: &str) -> &str {
    for q in ['"', '\'', '`'] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_in_document_order() {
        let text = "intro\n```File \nA\n```\nmiddle\n```rust\nfn x() {}\n```\nend";
        let blocks = parse_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].lang, "file");
        assert_eq!(blocks[0].body, "A");
        assert_eq!(blocks[1].lang, "rust");
        assert_eq!(blocks[1].body, "fn x() {}");
    }

    #[test]
    fn unterminated_trailing_fence_is_dropped() {
        let text = "```file\npath: a\nx\n```\n```edit\npath: b\n<<<<<<< SEARCH";
        let blocks = parse_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].lang, "file");

        // Opening marker with no newline at all
        assert!(parse_blocks("```file").is_empty());
    }

    #[test]
    fn crlf_bodies_are_normalized() {
        let blocks = parse_blocks("```file\r\npath: a.txt\r\none\r\ntwo\r\n```");
        assert_eq!(blocks[0].body, "path: a.txt\none\ntwo");
    }

    #[test]
    fn path_header_with_quotes_and_blank_lines() {
        let pp = parse_path_directive(DirectiveKind::WriteFile, "\n  \nPath: \"src/x.ts\"\nbody")
            .unwrap();
        assert_eq!(pp.path, "src/x.ts");
        assert_eq!(pp.payload, "body");
    }

    #[test]
    fn missing_and_invalid_paths_are_typed_errors() {
        assert_eq!(
            parse_path_directive(DirectiveKind::DeleteFile, "src/x.ts"),
            Err(ParseError::MissingPath { kind: DirectiveKind::DeleteFile })
        );
        assert!(matches!(
            parse_path_directive(DirectiveKind::WriteFile, "path: ../etc/passwd\nx"),
            Err(ParseError::InvalidPath { source: InvalidPath::ParentTraversal(_), .. })
        ));
    }

    #[test]
    fn bad_directive_does_not_hide_siblings() {
        let text = "\
```file
path: /abs/x
nope
```
```file
path: src/ok.rs
fn ok() {}
```
```delete
path: old.txt
```";
        let parsed = parse_directives(text);
        assert_eq!(parsed.len(), 3);
        assert!(parsed[0].is_err());
        assert_eq!(
            parsed[1],
            Ok(Directive::WriteFile {
                path: "src/ok.rs".into(),
                content: "fn ok() {}".into()
            })
        );
        assert_eq!(parsed[2], Ok(Directive::DeleteFile { path: "old.txt".into() }));
    }

    #[test]
    fn request_block_lists_paths() {
        let d = parse_directives("```request\npaths:\n- src/a.rs\n- ./src/a.rs\n- /bad\n- b.md\n```");
        assert_eq!(
            d,
            vec![Ok(Directive::RequestFiles {
                paths: vec!["src/a.rs".into(), "b.md".into()]
            })]
        );
        assert_eq!(parse_request_paths("paths:\n"), Err(ParseError::EmptyRequest));
    }

    #[test]
    fn tool_blocks_decode_or_vanish() {
        let text = "```tool\n{\"name\": \"search\", \"args\": {\"q\": \"foo\"}}\n```\n```tool\n{not json\n```";
        let d = parse_directives(text);
        assert_eq!(d.len(), 1);
        match &d[0] {
            Ok(Directive::ToolCall(call)) => {
                assert_eq!(call.name, "search");
                assert_eq!(call.args["q"], "foo");
            }
            other => panic!("expected tool call, got {other:?}"),
        }

        assert!(parse_tool_call("{\"name\": \"x\", \"args\": [1]}").is_none());
        assert_eq!(parse_tool_call("{\"name\": \"x\"}").unwrap().args, empty_args());
    }

    #[test]
    fn file_block_keeps_content_verbatim() {
        let d = parse_directives("```file\npath: src/x.ts\nexport const x = 1;\n```");
        assert_eq!(
            d,
            vec![Ok(Directive::WriteFile {
                path: "src/x.ts".into(),
                content: "export const x = 1;".into()
            })]
        );
    }
}
