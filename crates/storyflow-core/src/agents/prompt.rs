//! Prompt builders for each agent. Wording is deliberately plain; the
//! contract that matters is the reply format each one asks for.

use std::path::Path;

use crate::epic::Epic;
use crate::status::DocumentStatus;
use crate::tools::{Issue, TestCase};

pub fn scrum_master(epic: &Epic, epic_text: &str, missing: &[&Path]) -> String {
    let mut p = format!(
        "You are the Scrum Master for epic `{}` ({}).\n\n\
         Epic document:\n\n{epic_text}\n\n\
         Draft a story document for each of these files, following the epic. \
         Each document must contain a `## Status` section whose value is `Draft`.\n",
        epic.id, epic.title
    );
    for path in missing {
        p.push_str(&format!("- {}\n", path.display()));
    }
    p.push_str("\nDo not modify any other file.");
    p
}

pub fn state_parser(story: &Path) -> String {
    let options: Vec<&str> = DocumentStatus::all().iter().map(|s| s.as_str()).collect();
    format!(
        "Read the story document at {} and report the value of its Status section.\n\
         Reply with exactly one of: {}.\n\
         Do not modify the file.",
        story.display(),
        options.join(", ")
    )
}

pub fn developer(story: &Path, feedback: Option<&str>) -> String {
    let mut p = format!(
        "You are the Developer. Implement the story at {}.\n\
         Complete every task and acceptance criterion, write tests, and keep the \
         Dev Notes section current. Do not edit the Status section.\n",
        story.display()
    );
    if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
        p.push_str("\nQA feedback from the previous review:\n\n");
        p.push_str(feedback);
        p.push('\n');
    }
    p
}

pub fn qa(story: &Path) -> String {
    format!(
        "You are QA. Review the implementation of the story at {}.\n\
         Check every acceptance criterion and run the tests. Record your findings \
         in the QA Results section. Do not edit the Status section.\n\
         End your reply with a line `VERDICT: PASS` or `VERDICT: FAIL`, followed \
         by the issues the developer must fix when failing.",
        story.display()
    )
}

pub fn status_update(story: &Path, status: DocumentStatus) -> String {
    format!(
        "Set the Status section of the story document at {} to exactly `{}`.\n\
         Change nothing else in the file.",
        story.display(),
        status.as_str()
    )
}

pub fn quality_fix(tool: &str, file: &str, issues: &[Issue]) -> String {
    let mut p = format!("Fix the following {tool} findings in {file}. Change only what is needed.\n\n");
    for issue in issues {
        p.push_str(&format!("- {issue}\n"));
    }
    p
}

pub fn test_fix(file: &str, failures: &[&TestCase]) -> String {
    let mut p = format!(
        "The tests in {file} are failing. Fix the code under test or the tests, \
         whichever is wrong.\n\n"
    );
    for case in failures {
        p.push_str(&format!("### {} ({})\n", case.nodeid, case.outcome));
        if let Some(detail) = case.detail() {
            p.push_str("```\n");
            p.push_str(detail);
            p.push_str("\n```\n");
        }
    }
    p
}

/// Instructions emitted instead of a fix when a test keeps failing.
pub fn debug_instructions(nodeid: &str, consecutive: u32, detail: Option<&str>) -> String {
    let mut p = format!(
        "Test {nodeid} has failed {consecutive} times in a row; automated fixes are not converging.\n\
         Debug it interactively:\n\
         1. Run `pytest {nodeid} -x -vv --pdb` and inspect the failing assertion.\n\
         2. Check fixtures and external services the test depends on.\n\
         3. Fix the root cause, then re-run the test phase.\n"
    );
    if let Some(detail) = detail {
        p.push_str("\nLast failure:\n");
        p.push_str(detail);
        p.push('\n');
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn developer_prompt_includes_feedback_only_when_present() {
        let story = Path::new("docs/stories/1.1.md");
        assert!(!developer(story, None).contains("QA feedback"));
        assert!(!developer(story, Some("  ")).contains("QA feedback"));
        assert!(developer(story, Some("missing tests")).contains("missing tests"));
    }

    #[test]
    fn state_parser_lists_canonical_statuses() {
        let p = state_parser(Path::new("s.md"));
        assert!(p.contains("Ready for Review"));
        assert!(p.contains("Ready for Done"));
    }
}
