use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const STORYFLOW_DIR: &str = ".storyflow";
pub const CONFIG_FILE: &str = ".storyflow/config.yaml";
pub const DEFAULT_DB_FILE: &str = ".storyflow/stories.db";
pub const DEFAULT_LOG_DIR: &str = ".storyflow/logs";
pub const DEFAULT_STORIES_DIR: &str = "docs/stories";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn storyflow_dir(root: &Path) -> PathBuf {
    root.join(STORYFLOW_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve a configured path against the project root. Absolute paths are
/// returned unchanged.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

/// Turn a story title into a filename-safe slug.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
