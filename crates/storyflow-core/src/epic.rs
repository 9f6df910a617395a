//! Epic files: markdown listing the stories of one unit of delivery.
//!
//! Stories are taken from links to `.md` files when the epic has any,
//! otherwise from `## Story <id>: <title>` headings, which are mapped to
//! `<stories_dir>/<id>.<slug>.md`.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{FlowError, Result};
use crate::paths;

static STORY_HEADING_RE: OnceLock<Regex> = OnceLock::new();
static LINK_RE: OnceLock<Regex> = OnceLock::new();
static TITLE_RE: OnceLock<Regex> = OnceLock::new();
static ID_PREFIX_RE: OnceLock<Regex> = OnceLock::new();

fn story_heading_re() -> &'static Regex {
    STORY_HEADING_RE.get_or_init(|| {
        Regex::new(r"(?i)^\s{0,3}#{2,4}\s+story\s+([0-9]+(?:\.[0-9]+)*)\s*[:.\-]?\s*(.*?)\s*$")
            .unwrap()
    })
}

fn link_re() -> &'static Regex {
    LINK_RE.get_or_init(|| Regex::new(r"\[([^\]]*)\]\(([^)\s]+\.md)\)").unwrap())
}

fn title_re() -> &'static Regex {
    TITLE_RE.get_or_init(|| Regex::new(r"^\s{0,3}#\s+(.+?)\s*$").unwrap())
}

fn id_prefix_re() -> &'static Regex {
    ID_PREFIX_RE.get_or_init(|| Regex::new(r"^([0-9]+(?:\.[0-9]+)*)").unwrap())
}

/// One story listed by an epic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpicStory {
    /// Dotted story number, or the file stem for links without one.
    pub id: String,
    pub title: String,
    /// Document path relative to the project root when it lies inside it.
    pub path: PathBuf,
}

impl EpicStory {
    /// Key used for this story in the state store.
    pub fn key(&self) -> String {
        self.path.to_string_lossy().replace('\\', "/")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Epic {
    /// File stem of the epic document.
    pub id: String,
    pub title: String,
    pub path: PathBuf,
    pub stories: Vec<EpicStory>,
}

impl Epic {
    /// Read and parse the epic at `epic_path`. `stories_dir` is relative to
    /// `root` unless absolute.
    pub fn load(root: &Path, epic_path: &Path, stories_dir: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(epic_path).map_err(|e| FlowError::EpicParse {
            path: epic_path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(root, epic_path, stories_dir, &text)
    }

    pub fn parse(root: &Path, epic_path: &Path, stories_dir: &Path, text: &str) -> Result<Self> {
        let id = epic_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FlowError::EpicParse {
                path: epic_path.display().to_string(),
                reason: "epic path has no file name".into(),
            })?;
        let title = text
            .lines()
            .find_map(|l| title_re().captures(l))
            .and_then(|c| c.get(1))
            .map_or_else(|| id.clone(), |m| m.as_str().to_string());

        let epic_dir = epic_path.parent().unwrap_or(Path::new(""));
        let mut stories = from_links(root, epic_dir, epic_path, text);
        if stories.is_empty() {
            stories = from_headings(root, stories_dir, text);
        }
        if stories.is_empty() {
            return Err(FlowError::EpicParse {
                path: epic_path.display().to_string(),
                reason: "no stories found (expected story links or '## Story <id>: <title>' headings)"
                    .into(),
            });
        }
        tracing::debug!(epic = %id, stories = stories.len(), "epic parsed");
        Ok(Self {
            id,
            title,
            path: epic_path.to_path_buf(),
            stories,
        })
    }

    pub fn story_keys(&self) -> Vec<String> {
        self.stories.iter().map(EpicStory::key).collect()
    }
}

fn from_links(root: &Path, epic_dir: &Path, epic_path: &Path, text: &str) -> Vec<EpicStory> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for caps in link_re().captures_iter(text) {
        let label = caps.get(1).map_or("", |m| m.as_str()).trim();
        let target = caps.get(2).map_or("", |m| m.as_str());
        if target.contains("://") {
            continue;
        }
        let resolved = normalize(&epic_dir.join(target));
        if resolved == normalize(epic_path) {
            continue;
        }
        let path = relative_to(root, &resolved);
        if !seen.insert(path.clone()) {
            continue;
        }
        let stem = resolved
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = id_prefix_re()
            .captures(&stem)
            .and_then(|c| c.get(1))
            .map_or_else(|| stem.clone(), |m| m.as_str().to_string());
        let title = if label.is_empty() { stem } else { label.to_string() };
        out.push(EpicStory { id, title, path });
    }
    out
}

fn from_headings(root: &Path, stories_dir: &Path, text: &str) -> Vec<EpicStory> {
    let dir = relative_to(root, &paths::resolve(root, stories_dir));
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(caps) = story_heading_re().captures(line) else {
            continue;
        };
        let id = caps.get(1).map_or("", |m| m.as_str()).to_string();
        if !seen.insert(id.clone()) {
            continue;
        }
        let title = caps.get(2).map_or("", |m| m.as_str()).to_string();
        let slug = paths::slugify(&title);
        let file = if slug.is_empty() {
            format!("{id}.md")
        } else {
            format!("{id}.{slug}.md")
        };
        out.push(EpicStory {
            path: dir.join(file),
            id,
            title,
        });
    }
    out
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn relative_to(root: &Path, path: &Path) -> PathBuf {
    let root = normalize(root);
    let path = normalize(path);
    match path.strip_prefix(&root) {
        Ok(rel) if !root.as_os_str().is_empty() => rel.to_path_buf(),
        _ => path,
    }
}
