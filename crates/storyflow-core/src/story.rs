//! Story documents on disk.
//!
//! A story document is markdown with one `## Status` section whose first
//! non-empty line is the document status. Everything else belongs to the
//! agents. Only the status updater may call [`replace_status`].

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{FlowError, Result};
use crate::status::DocumentStatus;

static HEADING_RE: OnceLock<Regex> = OnceLock::new();
static INLINE_RE: OnceLock<Regex> = OnceLock::new();

fn heading_re() -> &'static Regex {
    HEADING_RE.get_or_init(|| Regex::new(r"^\s{0,3}(#{1,6})\s+(.*?)\s*#*\s*$").unwrap())
}

fn inline_re() -> &'static Regex {
    INLINE_RE.get_or_init(|| Regex::new(r"(?i)^\s*[*_]*status[*_]*\s*:\s*(.+)$").unwrap())
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let caps = heading_re().captures(line)?;
    let level = caps.get(1)?.as_str().len();
    let title = caps.get(2)?.as_str();
    Some((level, title))
}

fn is_status_heading(line: &str) -> bool {
    heading(line).is_some_and(|(_, title)| {
        title
            .trim_matches(|c: char| c == '*' || c == ':' || c.is_whitespace())
            .eq_ignore_ascii_case("status")
    })
}

/// Line range of the body of the Status section, `heading + 1 .. next
/// heading of the same or higher level`.
fn status_section(lines: &[&str]) -> Option<(usize, usize, usize)> {
    let start = lines.iter().position(|l| is_status_heading(l))?;
    let level = heading(lines[start]).map_or(2, |(lvl, _)| lvl);
    let end = lines[start + 1..]
        .iter()
        .position(|l| heading(l).is_some_and(|(lvl, _)| lvl <= level))
        .map_or(lines.len(), |offset| start + 1 + offset);
    Some((start, start + 1, end))
}

/// Raw text of the Status section, or of an inline `Status: ...` line when
/// the document has no section.
pub fn status_text(doc: &str) -> Option<String> {
    let lines: Vec<&str> = doc.lines().collect();
    if let Some((_, body, end)) = status_section(&lines) {
        return lines[body..end]
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .map(str::to_string);
    }
    lines
        .iter()
        .find_map(|l| inline_re().captures(l))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// The document status, if the Status text is one of the canonical values.
pub fn parse_status(doc: &str) -> Option<DocumentStatus> {
    status_text(doc).and_then(|t| DocumentStatus::parse(&t))
}

pub fn read_status(path: &Path) -> Result<Option<DocumentStatus>> {
    let doc = read(path)?;
    Ok(parse_status(&doc))
}

pub fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FlowError::StoryNotFound(path.display().to_string()),
        _ => FlowError::Io(e),
    })
}

/// Return `doc` with its Status section set to `status`. A document without
/// a section gets one after its title.
pub fn replace_status(doc: &str, status: DocumentStatus) -> String {
    let lines: Vec<&str> = doc.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);
    match status_section(&lines) {
        Some((head, body, end)) => {
            out.extend(lines[..=head].iter().map(|l| l.to_string()));
            out.push(status.as_str().to_string());
            // Keep notes under the status line, drop the old value.
            let rest: Vec<&str> = lines[body..end]
                .iter()
                .copied()
                .skip_while(|l| l.trim().is_empty())
                .skip(1)
                .collect();
            if rest.iter().all(|l| l.trim().is_empty()) {
                if end < lines.len() {
                    out.push(String::new());
                }
            } else {
                out.extend(rest.iter().map(|l| l.to_string()));
            }
            out.extend(lines[end..].iter().map(|l| l.to_string()));
        }
        None => {
            let title = lines
                .iter()
                .position(|l| heading(l).is_some_and(|(lvl, _)| lvl == 1));
            let insert_at = title.map_or(0, |i| i + 1);
            out.extend(lines[..insert_at].iter().map(|l| l.to_string()));
            if insert_at > 0 {
                out.push(String::new());
            }
            out.push("## Status".to_string());
            out.push(status.as_str().to_string());
            out.push(String::new());
            let tail = lines[insert_at..]
                .iter()
                .skip_while(|l| l.trim().is_empty());
            out.extend(tail.map(|l| l.to_string()));
        }
    }
    let mut text = out.join("\n");
    if doc.ends_with('\n') || doc.is_empty() {
        text.push('\n');
    }
    text
}

/// Skeleton document for a planned story the Scrum-Master did not write.
pub fn skeleton(story_id: &str, title: &str, epic_id: &str) -> String {
    format!(
        "# Story {story_id}: {title}\n\
         \n\
         ## Status\n\
         {status}\n\
         \n\
         ## Story\n\
         Part of epic `{epic_id}`.\n\
         \n\
         ## Acceptance Criteria\n\
         \n\
         ## Tasks\n\
         \n\
         ## Dev Notes\n\
         \n\
         ## QA Results\n",
        status = DocumentStatus::Draft.as_str(),
    )
}
