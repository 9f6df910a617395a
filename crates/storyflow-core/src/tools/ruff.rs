use std::path::Path;

use serde::Deserialize;

use super::{relative_file, Issue};

#[derive(Debug, Deserialize)]
struct Diagnostic {
    filename: String,
    #[serde(default)]
    code: Option<String>,
    message: String,
    #[serde(default)]
    location: Option<Location>,
}

#[derive(Debug, Deserialize)]
struct Location {
    row: u32,
    column: u32,
}

/// Parse `ruff check --output-format json`. Empty output means no findings.
pub(super) fn parse(stdout: &str, root: &Path) -> serde_json::Result<Vec<Issue>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let diagnostics: Vec<Diagnostic> = serde_json::from_str(stdout)?;
    Ok(diagnostics
        .into_iter()
        .map(|d| {
            let (line, column) = d.location.map_or((0, 0), |l| (l.row, l.column));
            Issue {
                file: relative_file(&d.filename, root),
                line,
                column,
                code: d.code,
                severity: "error".to_string(),
                message: d.message,
            }
        })
        .collect())
}
