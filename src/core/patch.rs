//! SEARCH/REPLACE patch engine.
//!
//! An edit body holds one or more triples:
//!
//! ```text
//! <<<<<<< SEARCH
//! exact text currently in the file
//! =======
//! replacement text
//! >>>>>>> REPLACE
//! ```
//!
//! Triples apply in order, each against the text left by the previous
//! one. Every SEARCH must occur exactly once; an ambiguous anchor fails
//! the whole edit instead of guessing.

use memchr::memmem;
use miette::Diagnostic;

use crate::infra::io::normalize_newlines;

pub const SEARCH_MARKER: &str = "<<<<<<< SEARCH";
pub const SEPARATOR_MARKER: &str = "=======";
pub const REPLACE_MARKER: &str = ">>>>>>> REPLACE";

/// One anchor-and-replacement pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReplace {
    pub search: String,
    pub replace: String,
}

/// Successful application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub updated: String,
    pub applied_count: usize,
}

/// Why an edit body could not be applied. `block` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Diagnostic)]
pub enum PatchError {
    #[error("block {block}: SEARCH section has no `=======` separator")]
    #[diagnostic(
        code(patch::missing_separator),
        help("put a line containing only `=======` between the SEARCH and REPLACE text")
    )]
    MissingSeparator { block: usize },

    #[error("block {block}: REPLACE section has no `>>>>>>> REPLACE` terminator")]
    #[diagnostic(
        code(patch::missing_terminator),
        help("close every block with a line containing only `>>>>>>> REPLACE`")
    )]
    MissingTerminator { block: usize },

    #[error("edit contains no SEARCH/REPLACE blocks")]
    #[diagnostic(
        code(patch::no_blocks),
        help("start each block with a line containing only `<<<<<<< SEARCH`")
    )]
    NoBlocks,

    #[error("block {block}: SEARCH text not found")]
    #[diagnostic(
        code(patch::search_not_found),
        help("copy the SEARCH text exactly from the current file, including indentation")
    )]
    SearchNotFound { block: usize },

    #[error("block {block}: SEARCH text matches {occurrences} times")]
    #[diagnostic(
        code(patch::search_not_unique),
        help("add surrounding lines to the SEARCH text until it matches only once")
    )]
    SearchNotUnique { block: usize, occurrences: usize },
}

impl PatchError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            PatchError::MissingSeparator { .. } => "missing-separator",
            PatchError::MissingTerminator { .. } => "missing-terminator",
            PatchError::NoBlocks => "no-blocks",
            PatchError::SearchNotFound { .. } => "search-not-found",
            PatchError::SearchNotUnique { .. } => "search-not-unique",
        }
    }
}

#[derive(Clone, Copy)]
enum Section {
    Outside,
    Search,
    Replace,
}

/// Split an edit body into its triples.
///
/// Lines outside blocks are ignored. Inside REPLACE a bare `=======` is
/// ordinary content; inside SEARCH it is the separator.
pub fn parse_edit_blocks(edit_body: &str) -> Result<Vec<SearchReplace>, PatchError> {
    let body = normalize_newlines(edit_body);
    let mut blocks = Vec::new();
    let mut section = Section::Outside;
    let mut search: Vec<&str> = Vec::new();
    let mut replace: Vec<&str> = Vec::new();

    for line in body.split('\n') {
        let marker = line.trim();
        let block = blocks.len() + 1;

        match section {
            Section::Outside => {
                if marker == SEARCH_MARKER {
                    section = Section::Search;
                }
            }
            Section::Search => {
                if marker == SEPARATOR_MARKER {
                    section = Section::Replace;
                } else if marker == REPLACE_MARKER || marker == SEARCH_MARKER {
                    return Err(PatchError::MissingSeparator { block });
                } else {
                    search.push(line);
                }
            }
            Section::Replace => {
                if marker == REPLACE_MARKER {
                    blocks.push(SearchReplace {
                        search: search.join("\n"),
                        replace: replace.join("\n"),
                    });
                    search.clear();
                    replace.clear();
                    section = Section::Outside;
                } else if marker == SEARCH_MARKER {
                    return Err(PatchError::MissingTerminator { block });
                } else {
                    replace.push(line);
                }
            }
        }
    }

    let block = blocks.len() + 1;
    match section {
        Section::Search => Err(PatchError::MissingSeparator { block }),
        Section::Replace => Err(PatchError::MissingTerminator { block }),
        Section::Outside if blocks.is_empty() => Err(PatchError::NoBlocks),
        Section::Outside => Ok(blocks),
    }
}

/// Apply every triple of `edit_body` to `original`.
///
/// `original` is LF-normalized before matching; the result is LF text.
/// Pure: on error nothing is produced, on success the caller decides what
/// to do with the new text.
pub fn apply_edits(original: &str, edit_body: &str) -> Result<PatchOutcome, PatchError> {
    let blocks = parse_edit_blocks(edit_body)?;
    let mut text = normalize_newlines(original);

    for (i, sr) in blocks.iter().enumerate() {
        let block = i + 1;
        let at = find_unique(&text, &sr.search, block)?;

        let mut next = String::with_capacity(text.len() + sr.replace.len());
        next.push_str(&text[..at]);
        next.push_str(&sr.replace);
        next.push_str(&text[at + sr.search.len()..]);
        text = next;
    }

    Ok(PatchOutcome {
        updated: text,
        applied_count: blocks.len(),
    })
}

/// Byte offset of the only occurrence of `needle` (overlaps count).
///
/// An empty needle is unique only in an empty haystack.
fn find_unique(hay: &str, needle: &str, block: usize) -> Result<usize, PatchError> {
    let finder = memmem::Finder::new(needle.as_bytes());
    let first = finder
        .find(hay.as_bytes())
        .ok_or(PatchError::SearchNotFound { block })?;

    if first < hay.len() && finder.find(&hay.as_bytes()[first + 1..]).is_some() {
        return Err(PatchError::SearchNotUnique {
            block,
            occurrences: count_overlapping(hay, &finder),
        });
    }
    Ok(first)
}

fn count_overlapping(hay: &str, finder: &memmem::Finder<'_>) -> usize {
    let bytes = hay.as_bytes();
    let mut count = 0;
    let mut from = 0;
    while from <= bytes.len() {
        match finder.find(&bytes[from..]) {
            Some(i) => {
                count += 1;
                from += i + 1;
            }
            None => break,
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(search: &str, replace: &str) -> String {
        format!("{SEARCH_MARKER}\n{search}\n{SEPARATOR_MARKER}\n{replace}\n{REPLACE_MARKER}\n")
    }

    #[test]
    fn replaces_single_line() {
        let out = apply_edits("a\nb\nc\n", &edit("b", "B")).unwrap();
        assert_eq!(out.updated, "a\nB\nc\n");
        assert_eq!(out.applied_count, 1);
    }

    #[test]
    fn blocks_chain_against_running_text() {
        let body = format!("{}{}", edit("one", "two"), edit("two", "three"));
        let out = apply_edits("one\n", &body).unwrap();
        assert_eq!(out.updated, "three\n");
        assert_eq!(out.applied_count, 2);
    }

    #[test]
    fn reapplying_fails_with_not_found() {
        let body = edit("fn old()", "fn new()");
        let first = apply_edits("fn old() {}\n", &body).unwrap();
        assert_eq!(
            apply_edits(&first.updated, &body),
            Err(PatchError::SearchNotFound { block: 1 })
        );
    }

    #[test]
    fn ambiguous_anchor_is_rejected() {
        let err = apply_edits("x = 1\nx = 1\n", &edit("x = 1", "x = 2")).unwrap_err();
        assert_eq!(err.reason(), "search-not-unique");
        assert_eq!(err, PatchError::SearchNotUnique { block: 1, occurrences: 2 });
    }

    #[test]
    fn overlapping_occurrences_count_as_ambiguous() {
        let err = apply_edits("aaa", &edit("aa", "b")).unwrap_err();
        assert_eq!(err.reason(), "search-not-unique");
    }

    #[test]
    fn later_block_failure_reports_its_index() {
        let body = format!("{}{}", edit("a", "b"), edit("zzz", "y"));
        assert_eq!(
            apply_edits("a\n", &body),
            Err(PatchError::SearchNotFound { block: 2 })
        );
    }

    #[test]
    fn malformed_bodies_have_specific_reasons() {
        assert_eq!(parse_edit_blocks("just prose"), Err(PatchError::NoBlocks));
        assert_eq!(
            parse_edit_blocks("<<<<<<< SEARCH\nx\n"),
            Err(PatchError::MissingSeparator { block: 1 })
        );
        assert_eq!(
            parse_edit_blocks("<<<<<<< SEARCH\nx\n>>>>>>> REPLACE"),
            Err(PatchError::MissingSeparator { block: 1 })
        );
        assert_eq!(
            parse_edit_blocks("<<<<<<< SEARCH\nx\n=======\ny\n"),
            Err(PatchError::MissingTerminator { block: 1 })
        );
        let body = format!("{}<<<<<<< SEARCH\nq\n=======\n<<<<<<< SEARCH\n", edit("a", "b"));
        assert_eq!(
            parse_edit_blocks(&body),
            Err(PatchError::MissingTerminator { block: 2 })
        );
    }

    #[test]
    fn crlf_original_is_normalized() {
        let out = apply_edits("a\r\nb\r\n", "<<<<<<< SEARCH\r\na\nb\r\n=======\r\nc\r\n>>>>>>> REPLACE").unwrap();
        assert_eq!(out.updated, "c\n");
    }

    #[test]
    fn separator_inside_replace_is_content() {
        let out = apply_edits("Title\n", &edit("Title", "Title\n=======")).unwrap();
        assert_eq!(out.updated, "Title\n=======\n");
    }

    #[test]
    fn empty_search_only_matches_empty_file() {
        let out = apply_edits("", &edit("", "fresh")).unwrap();
        assert_eq!(out.updated, "fresh");
        assert_eq!(
            apply_edits("x", &edit("", "fresh")).unwrap_err().reason(),
            "search-not-unique"
        );
    }

    #[test]
    fn multiline_search_with_indentation() {
        let original = "fn a() {\n    1\n}\n\nfn b() {\n    1\n}\n";
        let body = edit("fn b() {\n    1", "fn b() {\n    2");
        let out = apply_edits(original, &body).unwrap();
        assert_eq!(out.updated, "fn a() {\n    1\n}\n\nfn b() {\n    2\n}\n");
    }
}
