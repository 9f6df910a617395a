use std::path::Path;

use serde::Deserialize;

use super::{relative_file, Issue};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    #[serde(default)]
    general_diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Deserialize)]
struct Diagnostic {
    file: String,
    severity: String,
    message: String,
    #[serde(default)]
    rule: Option<String>,
    #[serde(default)]
    range: Option<Range>,
}

#[derive(Debug, Deserialize)]
struct Range {
    start: Position,
}

#[derive(Debug, Deserialize)]
struct Position {
    line: u32,
    character: u32,
}

/// Parse `basedpyright --outputjson`. Informational diagnostics are
/// dropped; positions are converted to 1-based. The checker always prints a
/// report, so empty output is an error.
pub(super) fn parse(stdout: &str, root: &Path) -> serde_json::Result<Vec<Issue>> {
    let report: Report = serde_json::from_str(stdout)?;
    Ok(report
        .general_diagnostics
        .into_iter()
        .filter(|d| d.severity == "error" || d.severity == "warning")
        .map(|d| {
            let (line, column) = d
                .range
                .map_or((0, 0), |r| (r.start.line + 1, r.start.character + 1));
            Issue {
                file: relative_file(&d.file, root),
                line,
                column,
                code: d.rule,
                severity: d.severity,
                message: d.message,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pyright_json() {
        let out = r#"{
          "version": "1.20.0",
          "generalDiagnostics": [
            {"file": "/proj/src/app.py", "severity": "error",
             "message": "\"foo\" is not defined", "rule": "reportUndefinedVariable",
             "range": {"start": {"line": 4, "character": 0}, "end": {"line": 4, "character": 3}}},
            {"file": "/proj/src/app.py", "severity": "information", "message": "note"},
            {"file": "/proj/src/b.py", "severity": "warning", "message": "unused"}
          ],
          "summary": {"filesAnalyzed": 2, "errorCount": 1, "warningCount": 1}
        }"#;
        let issues = parse(out, Path::new("/proj")).unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].file, "src/app.py");
        assert_eq!((issues[0].line, issues[0].column), (5, 1));
        assert_eq!(issues[0].code.as_deref(), Some("reportUndefinedVariable"));
        assert_eq!(issues[1].severity, "warning");
        assert_eq!(issues[1].line, 0);
    }

    #[test]
    fn empty_output_is_rejected() {
        assert!(parse("", Path::new("/")).is_err());
        assert!(parse(r#"{"generalDiagnostics": []}"#, Path::new("/")).unwrap().is_empty());
    }
}
