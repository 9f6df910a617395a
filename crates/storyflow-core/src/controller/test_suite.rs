use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::pause;
use crate::agents::{prompt, FixRequest, Fixer};
use crate::runlog::{events, RunLog};
use crate::tools::{TestCase, TestReport, TestRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestSuiteOutcome {
    AllGreen,
    /// Cycle budget spent with tests still failing.
    Exhausted,
    /// The runner produced no report.
    RunnerFailed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestSuiteReport {
    pub outcome: TestSuiteOutcome,
    pub runs: u32,
    pub fixes_requested: u32,
    /// Node ids still failing after the last run.
    pub failing: Vec<String>,
    /// Tests that crossed the debug threshold.
    pub debug_requested: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Re-runs the test suite and asks for fixes file by file, for up to
/// `max_cycles × retries_per_cycle` runs.
///
/// A test that keeps failing is tracked across runs; once its consecutive
/// failures reach `debug_threshold` it gets debugging instructions in the
/// run log instead of more automated fix attempts.
pub struct TestSuiteController {
    runner: Arc<dyn TestRunner>,
    fixer: Arc<dyn Fixer>,
    log: Arc<RunLog>,
    cancel: CancellationToken,
    max_cycles: u32,
    retries_per_cycle: u32,
    debug_threshold: u32,
    delay: Duration,
}

impl TestSuiteController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Arc<dyn TestRunner>,
        fixer: Arc<dyn Fixer>,
        log: Arc<RunLog>,
        cancel: CancellationToken,
        max_cycles: u32,
        retries_per_cycle: u32,
        debug_threshold: u32,
        delay: Duration,
    ) -> Self {
        Self {
            runner,
            fixer,
            log,
            cancel,
            max_cycles,
            retries_per_cycle,
            debug_threshold,
            delay,
        }
    }

    pub async fn run(&self) -> TestSuiteReport {
        let mut report = TestSuiteReport {
            outcome: TestSuiteOutcome::Exhausted,
            runs: 0,
            fixes_requested: 0,
            failing: Vec::new(),
            debug_requested: Vec::new(),
            error: None,
        };
        let mut consecutive: HashMap<String, u32> = HashMap::new();
        let mut debugged: HashSet<String> = HashSet::new();
        let total = self.max_cycles.saturating_mul(self.retries_per_cycle);

        for cycle in 1..=self.max_cycles {
            for attempt in 1..=self.retries_per_cycle {
                if self.cancel.is_cancelled() {
                    report.outcome = TestSuiteOutcome::Cancelled;
                    return self.finish(report);
                }
                let result = self.runner.run_tests().await;
                report.runs += 1;
                if !result.success() {
                    report.outcome = TestSuiteOutcome::RunnerFailed;
                    report.error = Some(result.summary());
                    return self.finish(report);
                }
                let Some(tests) = result.into_target() else {
                    report.outcome = TestSuiteOutcome::RunnerFailed;
                    return self.finish(report);
                };

                track_failures(&mut consecutive, &tests);
                report.failing = tests
                    .failures()
                    .iter()
                    .map(|t| t.nodeid.clone())
                    .collect();
                tracing::info!(
                    cycle,
                    attempt,
                    passed = tests.summary.passed,
                    failing = report.failing.len(),
                    "test run"
                );
                if tests.all_green() {
                    report.outcome = TestSuiteOutcome::AllGreen;
                    return self.finish(report);
                }
                if report.failing.is_empty() {
                    // pytest crashed without naming anything to fix.
                    report.outcome = TestSuiteOutcome::RunnerFailed;
                    report.error = Some(format!(
                        "pytest exited with code {:?} without reporting failures",
                        tests.exitcode
                    ));
                    return self.finish(report);
                }

                let mut fixable = Vec::new();
                for case in tests.failures() {
                    let count = consecutive.get(&case.nodeid).copied().unwrap_or(0);
                    if count >= self.debug_threshold {
                        if debugged.insert(case.nodeid.clone()) {
                            self.request_debug(case, count);
                            report.debug_requested.push(case.nodeid.clone());
                        }
                    } else {
                        fixable.push(case);
                    }
                }

                // The last run of the budget is only measured.
                if report.runs == total {
                    break;
                }
                if !self.fix(&fixable, &mut report).await {
                    report.outcome = TestSuiteOutcome::Cancelled;
                    return self.finish(report);
                }
            }
        }
        tracing::warn!(failing = report.failing.len(), "test cycle budget exhausted");
        self.finish(report)
    }

    /// Ask for one fix per test file. Returns `false` when cancelled.
    async fn fix(&self, failures: &[&TestCase], report: &mut TestSuiteReport) -> bool {
        let mut by_file: BTreeMap<&str, Vec<&TestCase>> = BTreeMap::new();
        for &case in failures {
            by_file.entry(case.file()).or_default().push(case);
        }
        for (file, cases) in by_file {
            if !pause(self.delay, &self.cancel).await {
                return false;
            }
            report.fixes_requested += 1;
            let fixed = self
                .fixer
                .fix(FixRequest {
                    label: "fix:tests".to_string(),
                    prompt: prompt::test_fix(file, &cases),
                })
                .await;
            if !fixed {
                tracing::warn!(file, "test fix call did not complete");
            }
        }
        true
    }

    fn request_debug(&self, case: &TestCase, consecutive: u32) {
        tracing::warn!(test = %case.nodeid, consecutive, "test keeps failing, debugging needed");
        self.log.record(
            events::DEBUG_INSTRUCTIONS,
            prompt::debug_instructions(&case.nodeid, consecutive, case.detail()),
        );
    }

    fn finish(&self, report: TestSuiteReport) -> TestSuiteReport {
        self.log.record(
            events::TESTS,
            format!(
                "{:?} after {} run(s), {} fix request(s), {} failing",
                report.outcome,
                report.runs,
                report.fixes_requested,
                report.failing.len()
            ),
        );
        report
    }
}

/// Bump the counter of every failing test and reset the rest.
fn track_failures(consecutive: &mut HashMap<String, u32>, report: &TestReport) {
    let failing: HashSet<&str> = report
        .failures()
        .into_iter()
        .map(|t| t.nodeid.as_str())
        .collect();
    consecutive.retain(|id, _| failing.contains(id.as_str()));
    for id in failing {
        *consecutive.entry(id.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testkit::{Kit, Script};
    use crate::sdk::{ExecuteOptions, MessageSource, SdkExecutor, SdkResult, TargetPredicate};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn report(failing: &[&str], passing: &[&str]) -> TestReport {
        let tests: Vec<serde_json::Value> = failing
            .iter()
            .map(|id| serde_json::json!({"nodeid": id, "outcome": "failed", "longrepr": "boom"}))
            .chain(
                passing
                    .iter()
                    .map(|id| serde_json::json!({"nodeid": id, "outcome": "passed"})),
            )
            .collect();
        serde_json::from_value(serde_json::json!({
            "summary": {
                "passed": passing.len(),
                "failed": failing.len(),
                "total": failing.len() + passing.len()
            },
            "tests": tests,
        }))
        .unwrap()
    }

    /// Replays scripted reports; the last one repeats.
    struct ScriptedRunner {
        reports: Mutex<Vec<TestReport>>,
        executor: SdkExecutor,
    }

    impl ScriptedRunner {
        fn new(reports: Vec<TestReport>) -> Arc<Self> {
            Arc::new(Self {
                reports: Mutex::new(reports),
                executor: SdkExecutor::default(),
            })
        }
    }

    #[async_trait]
    impl TestRunner for ScriptedRunner {
        async fn run_tests(&self) -> SdkResult<TestReport> {
            let next = {
                let mut reports = self.reports.lock().unwrap();
                if reports.len() > 1 {
                    reports.remove(0)
                } else {
                    reports[0].clone()
                }
            };
            self.executor
                .execute(
                    MessageSource::scalar(async move { Ok(next) }),
                    TargetPredicate::any(),
                    ExecuteOptions::new("tool:pytest", Duration::from_secs(5)),
                )
                .await
        }
    }

    fn controller(kit: &Kit, runner: Arc<dyn TestRunner>, threshold: u32) -> TestSuiteController {
        let ctx = kit.context();
        TestSuiteController::new(
            runner,
            kit.fixer.clone(),
            ctx.log,
            ctx.cancel,
            3,
            2,
            threshold,
            Duration::ZERO,
        )
    }

    #[test]
    fn counters_reset_when_a_test_passes() {
        let mut counts = HashMap::new();
        track_failures(&mut counts, &report(&["t.py::a", "t.py::b"], &[]));
        track_failures(&mut counts, &report(&["t.py::a"], &["t.py::b"]));
        assert_eq!(counts.get("t.py::a"), Some(&2));
        assert_eq!(counts.get("t.py::b"), None);
    }

    #[tokio::test]
    async fn green_suite_needs_one_run() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let runner = ScriptedRunner::new(vec![report(&[], &["t.py::a"])]);
        let result = controller(&kit, runner, 5).run().await;
        assert_eq!(result.outcome, TestSuiteOutcome::AllGreen);
        assert_eq!(result.runs, 1);
        assert_eq!(result.fixes_requested, 0);
    }

    #[tokio::test]
    async fn fixes_grouped_by_file_until_green() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let runner = ScriptedRunner::new(vec![
            report(&["tests/test_a.py::x", "tests/test_a.py::y", "tests/test_b.py::z"], &[]),
            report(&[], &["tests/test_a.py::x"]),
        ]);
        let result = controller(&kit, runner, 5).run().await;
        assert_eq!(result.outcome, TestSuiteOutcome::AllGreen);
        assert_eq!(result.runs, 2);
        assert_eq!(result.fixes_requested, 2);
        assert_eq!(kit.fixer.labels(), vec!["fix:tests", "fix:tests"]);
    }

    #[tokio::test]
    async fn persistent_failure_triggers_debug_instructions_once() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let runner = ScriptedRunner::new(vec![report(&["tests/test_a.py::stuck"], &[])]);
        let result = controller(&kit, runner, 3).run().await;
        assert_eq!(result.outcome, TestSuiteOutcome::Exhausted);
        assert_eq!(result.runs, 6);
        assert_eq!(result.debug_requested, vec!["tests/test_a.py::stuck"]);
        // fixes only before the threshold: after runs 1 and 2
        assert_eq!(result.fixes_requested, 2);
        let log = kit.log_text();
        assert_eq!(log.matches("[debug_instructions]").count(), 1);
        assert!(log.contains("pytest tests/test_a.py::stuck"));
    }

    #[tokio::test]
    async fn runner_failure_stops_the_loop() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let runner = crate::tools::PytestRunner::new(
            kit.root(),
            std::path::Path::new("tests"),
            SdkExecutor::default(),
            Duration::from_secs(5),
        )
        .with_program("storyflow-no-such-pytest");
        let result = controller(&kit, Arc::new(runner), 5).run().await;
        assert_eq!(result.outcome, TestSuiteOutcome::RunnerFailed);
        assert_eq!(result.runs, 1);
        assert!(result.error.unwrap().contains("not found on PATH"));
    }

    #[cfg(unix)]
    fn pytest_script(kit: &Kit, report_json: &str, exit: i32) -> Arc<dyn TestRunner> {
        let body = format!(
            r#"for arg in "$@"; do
  case "$arg" in --json-report-file=*) out="${{arg#--json-report-file=}}" ;; esac
done
cat > "$out" <<'JSON'
{report_json}
JSON
exit {exit}"#
        );
        let program = crate::tools::fake_program(kit.root(), "pytest", &body);
        Arc::new(
            crate::tools::PytestRunner::new(
                kit.root(),
                std::path::Path::new("tests"),
                SdkExecutor::default(),
                Duration::from_secs(10),
            )
            .with_program(program.display().to_string()),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn import_error_is_fixed_not_green() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let runner = pytest_script(
            &kit,
            r#"{"exitcode": 2, "summary": {"collected": 0, "total": 0},
 "collectors": [{"nodeid": "tests/test_api.py", "outcome": "failed", "result": [],
                 "longrepr": "ImportError: cannot import name 'app'"}],
 "tests": []}"#,
            2,
        );
        let result = controller(&kit, runner, 5).run().await;
        assert_ne!(result.outcome, TestSuiteOutcome::AllGreen);
        assert_eq!(result.outcome, TestSuiteOutcome::Exhausted);
        assert_eq!(result.runs, 6);
        assert_eq!(result.failing, vec!["tests/test_api.py"]);
        assert!(result.fixes_requested >= 1);
        assert!(kit.fixer.labels().iter().all(|l| l == "fix:tests"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crash_without_failures_stops_the_loop() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let runner = pytest_script(&kit, r#"{"exitcode": 3, "summary": {"total": 0}, "tests": []}"#, 3);
        let result = controller(&kit, runner, 5).run().await;
        assert_eq!(result.outcome, TestSuiteOutcome::RunnerFailed);
        assert_eq!(result.runs, 1);
        assert!(result.error.unwrap().contains("Some(3)"));
        assert!(kit.fixer.labels().is_empty());
    }
}
