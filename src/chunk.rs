//! Heading-aware note chunker.
//!
//! Splits a note body into [`Chunk`]s no longer than `max_tokens` (measured
//! at roughly four bytes per token) with `overlap_tokens` of shared text
//! between consecutive pieces of the same section.
//!
//! Sections are delimited by ATX headings and carry their heading path
//! (`Project > Setup`). A section that fits the limit becomes one chunk.
//! Longer sections are cut at the last paragraph break, then sentence end,
//! then whitespace inside the window, and only then at an arbitrary char
//! boundary. Frontmatter is never chunked.
//!
//! Journal notes that hold several entries, each opened by a `---` rule and
//! an inline `Date:`/`Title:`/`People:`/`Group:` block, are split per entry
//! first. The entry's metadata becomes the first heading path element
//! (`2024-01-02 | People: Ana > Morning`) and never appears in chunk text.
//!
//! Chunking is deterministic: the same text and configuration always yield
//! the same spans, which makes replace-by-note-path re-syncs safe.

use crate::config::ChunkingConfig;
use crate::models::{Chunk, Note};
use crate::scanner::split_frontmatter;

/// Approximate bytes-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Split a note into chunks with contiguous ordinals starting at 0.
///
/// Always returns at least one chunk. A note without chunkable body text is
/// represented by a synthetic chunk holding its title; that chunk's span is
/// the empty range `0..0` since the title is not a slice of the note body.
pub fn chunk_note(note: &Note, config: &ChunkingConfig) -> Vec<Chunk> {
    let max_chars = config.max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap = config.overlap_tokens * CHARS_PER_TOKEN;
    let text = note.text.as_str();
    let (_, body_start) = split_frontmatter(text);

    let mut chunks = Vec::new();
    for entry in split_entries(text, body_start) {
        for section in split_sections(text, entry.start, entry.end) {
            let heading_path: Vec<String> =
                entry.context.iter().cloned().chain(section.heading_path).collect();
            for (start, end) in split_span(text, section.start, section.end, max_chars, overlap) {
                chunks.push(Chunk {
                    note_path: note.path.clone(),
                    ordinal: chunks.len(),
                    text: text[start..end].to_string(),
                    span_start: start,
                    span_end: end,
                    heading_path: heading_path.clone(),
                    folder: note.folder.clone(),
                    title: note.title.clone(),
                });
            }
        }
    }

    if chunks.is_empty() {
        chunks.push(Chunk {
            note_path: note.path.clone(),
            ordinal: 0,
            text: note.title.clone(),
            span_start: 0,
            span_end: 0,
            heading_path: Vec::new(),
            folder: note.folder.clone(),
            title: note.title.clone(),
        });
    }

    chunks
}

/// Metadata keys rendered into an entry's context, in display order.
const ENTRY_KEYS: &[&str] = &["Date", "Title", "People", "Group"];

#[derive(Debug, PartialEq)]
struct Entry {
    context: Option<String>,
    start: usize,
    end: usize,
}

/// Split the body into journal entries. Text before the first delimiter is
/// an entry of its own whose context, if any, comes from the frontmatter.
fn split_entries(text: &str, body_start: usize) -> Vec<Entry> {
    let mut lines = Vec::new();
    let mut offset = body_start;
    for line in text[body_start..].split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }

    let mut entries = Vec::new();
    let mut current = Entry {
        context: entry_context(text[..body_start].lines()),
        start: body_start,
        end: text.len(),
    };
    let mut in_fence = false;
    let mut i = 0;
    while i < lines.len() {
        let (line_start, line) = lines[i];
        let trimmed = line.trim();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        } else if !in_fence && is_rule(trimmed) {
            if let Some((context, consumed)) = entry_header(&lines[i + 1..]) {
                current.end = line_start;
                entries.push(current);
                i += 1 + consumed;
                let start = lines.get(i).map_or(text.len(), |(offset, _)| *offset);
                current = Entry {
                    context: Some(context),
                    start,
                    end: text.len(),
                };
                continue;
            }
        }
        i += 1;
    }
    entries.push(current);
    entries
}

/// Recognize the metadata block after a rule, returning its context and the
/// number of lines it spans, including an optional closing rule.
fn entry_header(lines: &[(usize, &str)]) -> Option<(String, usize)> {
    let count = lines
        .iter()
        .take_while(|(_, line)| metadata_line(line).is_some())
        .count();
    if count == 0 {
        return None;
    }
    let context = entry_context(lines[..count].iter().map(|(_, line)| *line))?;
    let closed = lines
        .get(count)
        .is_some_and(|(_, line)| is_rule(line.trim()));
    Some((context, count + usize::from(closed)))
}

/// Render `Date | Title | People: .. | Group: ..` from metadata lines; `None`
/// when none of the known keys is present.
fn entry_context<'a>(lines: impl Iterator<Item = &'a str>) -> Option<String> {
    let fields: Vec<(&str, &str)> = lines.filter_map(metadata_line).collect();
    let parts: Vec<String> = ENTRY_KEYS
        .iter()
        .filter_map(|key| {
            let (_, value) = fields.iter().find(|(k, v)| k == key && !v.is_empty())?;
            Some(match *key {
                "People" | "Group" => format!("{}: {}", key, value),
                _ => value.to_string(),
            })
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

/// Parse `Key: value` where the key is an identifier.
fn metadata_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.trim().split_once(':')?;
    let mut chars = key.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some((key, value.trim()))
}

fn is_rule(line: &str) -> bool {
    line.len() >= 3 && line.bytes().all(|b| b == b'-')
}

#[derive(Debug, PartialEq)]
struct Section {
    heading_path: Vec<String>,
    start: usize,
    end: usize,
}

fn split_sections(text: &str, start: usize, end: usize) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut section_start = start;
    let mut offset = start;
    let mut in_fence = false;

    for line in text[start..end].split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let content = line.trim_end();
        let fence = content.trim_start();
        if fence.starts_with("```") || fence.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        if let Some((level, title)) = parse_heading(content) {
            push_section(&mut sections, text, &stack, section_start, line_start);
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, title));
            section_start = offset;
        }
    }
    push_section(&mut sections, text, &stack, section_start, end);

    sections
}

fn push_section(
    sections: &mut Vec<Section>,
    text: &str,
    stack: &[(usize, String)],
    start: usize,
    end: usize,
) {
    if start >= end || text[start..end].trim().is_empty() {
        return;
    }
    sections.push(Section {
        heading_path: stack.iter().map(|(_, t)| t.clone()).collect(),
        start,
        end,
    });
}

/// Parse `## Title ##` into `(2, "Title")`.
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let level = line.bytes().take_while(|b| *b == b'#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim_end();
    if title.is_empty() {
        return None;
    }
    Some((level, title.to_string()))
}

/// Split `text[start..end]` into trimmed, possibly overlapping windows of at
/// most `max_chars` bytes.
fn split_span(
    text: &str,
    start: usize,
    end: usize,
    max_chars: usize,
    overlap: usize,
) -> Vec<(usize, usize)> {
    let (start, end) = trim_span(text, start, end);
    if start >= end {
        return Vec::new();
    }
    if end - start <= max_chars {
        return vec![(start, end)];
    }

    let mut pieces = Vec::new();
    let mut pos = start;
    loop {
        let limit = floor_char_boundary(text, (pos + max_chars).min(end));
        let cut = if limit >= end {
            end
        } else {
            find_break(text, pos, limit)
        };

        let (s, e) = trim_span(text, pos, cut);
        if s < e {
            pieces.push((s, e));
        }
        if cut >= end {
            break;
        }

        let mut next = ceil_char_boundary(text, cut.saturating_sub(overlap).max(pos + 1));
        // Start the overlap on a word boundary when one is available
        if let Some(ws) = text[next..cut].find(char::is_whitespace) {
            next += ws;
        }
        let (next_start, _) = trim_span(text, next, end);
        if next_start >= end {
            break;
        }
        pos = next_start.max(pos + 1);
        pos = ceil_char_boundary(text, pos);
    }

    pieces
}

/// Pick a cut point in `(pos, limit]`, preferring structural boundaries in
/// the second half of the window.
fn find_break(text: &str, pos: usize, limit: usize) -> usize {
    let window = &text[pos..limit];
    let half = (limit - pos) / 2;

    if let Some(idx) = window.rfind("\n\n") {
        if idx >= half {
            return pos + idx + 2;
        }
    }

    let sentence_end = [". ", "! ", "? ", ".\n", "!\n", "?\n"]
        .iter()
        .filter_map(|p| window.rfind(p))
        .max();
    if let Some(idx) = sentence_end {
        if idx >= half {
            return pos + idx + 1;
        }
    }

    match window.rfind(['\n', ' ', '\t']) {
        Some(idx) if idx > 0 => pos + idx + 1,
        _ => limit,
    }
}

fn trim_span(text: &str, start: usize, end: usize) -> (usize, usize) {
    let slice = &text[start..end];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    if leading == slice.len() {
        return (end, end);
    }
    (start + leading, end - trailing)
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
