use std::path::{Path, PathBuf};

use storyflow_core::paths::STORYFLOW_DIR;

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `STORYFLOW_ROOT` env var (passed in as `explicit`)
/// 2. Nearest ancestor of the cwd holding `.storyflow/`
/// 3. Nearest ancestor of the cwd holding `.git/`
/// 4. The cwd itself
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd, STORYFLOW_DIR)
        .or_else(|| find_upward(&cwd, ".git"))
        .unwrap_or(cwd)
}

fn find_upward(start: &Path, marker: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(marker).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_root(Some(dir.path())), dir.path());
    }

    #[test]
    fn marker_found_from_nested_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".storyflow")).unwrap();
        let nested = dir.path().join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(
            find_upward(&nested, STORYFLOW_DIR).as_deref(),
            Some(dir.path())
        );
    }

    #[test]
    fn no_marker_gives_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(find_upward(dir.path(), "no-such-marker-dir"), None);
    }
}
