use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::pause;
use crate::agents::{prompt, FixRequest, Fixer};
use crate::runlog::{events, RunLog};
use crate::tools::QualityTool;

/// How one tool fared in the gate.
#[derive(Debug, Clone, Serialize)]
pub struct ToolGateResult {
    pub tool: String,
    pub cycles: u32,
    pub fixes_requested: u32,
    /// Issues left after the last run, `None` when the tool never ran.
    pub remaining_issues: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolGateResult {
    pub fn is_clean(&self) -> bool {
        self.remaining_issues == Some(0)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityReport {
    pub tools: Vec<ToolGateResult>,
    pub cancelled: bool,
}

impl QualityReport {
    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.tools.iter().all(ToolGateResult::is_clean)
    }
}

/// Runs each tool, asks the fixer to repair every file with findings, and
/// re-runs until the tool is clean or `max_cycles` fix rounds are spent.
///
/// Fix calls are strictly sequential and each one is preceded by the
/// configured delay.
pub struct QualityGate {
    tools: Vec<Arc<dyn QualityTool>>,
    fixer: Arc<dyn Fixer>,
    log: Arc<RunLog>,
    cancel: CancellationToken,
    max_cycles: u32,
    delay: Duration,
}

impl QualityGate {
    pub fn new(
        tools: Vec<Arc<dyn QualityTool>>,
        fixer: Arc<dyn Fixer>,
        log: Arc<RunLog>,
        cancel: CancellationToken,
        max_cycles: u32,
        delay: Duration,
    ) -> Self {
        Self {
            tools,
            fixer,
            log,
            cancel,
            max_cycles,
            delay,
        }
    }

    pub async fn run(&self) -> QualityReport {
        let mut report = QualityReport::default();
        for tool in &self.tools {
            let result = self.run_tool(tool.as_ref()).await;
            self.log.record(
                events::QUALITY,
                format!(
                    "{}: {} cycle(s), {} fix request(s), remaining {}",
                    result.tool,
                    result.cycles,
                    result.fixes_requested,
                    result
                        .remaining_issues
                        .map_or_else(|| "unknown".to_string(), |n| n.to_string()),
                ),
            );
            report.tools.push(result);
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
        }
        report
    }

    async fn run_tool(&self, tool: &dyn QualityTool) -> ToolGateResult {
        let mut result = ToolGateResult {
            tool: tool.name().to_string(),
            cycles: 0,
            fixes_requested: 0,
            remaining_issues: None,
            error: None,
        };

        for cycle in 1..=self.max_cycles.saturating_add(1) {
            if self.cancel.is_cancelled() {
                return result;
            }
            let checked = tool.check().await;
            if !checked.success() {
                tracing::warn!(tool = %result.tool, summary = %checked.summary(), "quality tool did not run");
                result.error = Some(checked.summary());
                return result;
            }
            let Some(run) = checked.into_target() else {
                return result;
            };
            result.remaining_issues = Some(run.issues.len());
            if run.issues.is_empty() {
                tracing::info!(tool = %result.tool, cycle, "quality gate clean");
                return result;
            }
            if cycle > self.max_cycles {
                break;
            }
            result.cycles = cycle;
            tracing::info!(
                tool = %result.tool,
                cycle,
                issues = run.issues.len(),
                "requesting fixes"
            );
            for (file, issues) in run.by_file() {
                if !pause(self.delay, &self.cancel).await {
                    return result;
                }
                result.fixes_requested += 1;
                let fixed = self
                    .fixer
                    .fix(FixRequest {
                        label: format!("fix:{}", result.tool),
                        prompt: prompt::quality_fix(&result.tool, &file, &issues),
                    })
                    .await;
                if !fixed {
                    tracing::warn!(tool = %result.tool, file = %file, "fix call did not complete");
                }
            }
        }
        tracing::warn!(
            tool = %result.tool,
            remaining = ?result.remaining_issues,
            "quality cycle budget exhausted"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testkit::{Kit, Script};
    use crate::sdk::{ExecuteOptions, MessageSource, SdkExecutor, SdkResult, TargetPredicate};
    use crate::tools::{Issue, ToolRun};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Reports a scripted number of issues per run, spread over two files.
    struct ScriptedTool {
        counts: Mutex<Vec<usize>>,
        executor: SdkExecutor,
    }

    impl ScriptedTool {
        fn new(counts: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                counts: Mutex::new(counts),
                executor: SdkExecutor::default(),
            })
        }
    }

    #[async_trait]
    impl QualityTool for ScriptedTool {
        fn name(&self) -> &str {
            "ruff"
        }

        async fn check(&self) -> SdkResult<ToolRun> {
            let n = {
                let mut counts = self.counts.lock().unwrap();
                if counts.len() > 1 {
                    counts.remove(0)
                } else {
                    counts[0]
                }
            };
            let issues = (0..n)
                .map(|i| Issue {
                    file: if i % 2 == 0 { "src/a.py" } else { "src/b.py" }.to_string(),
                    line: i as u32 + 1,
                    column: 1,
                    code: Some("F401".into()),
                    severity: "error".into(),
                    message: "unused import".into(),
                })
                .collect();
            let run = ToolRun {
                tool: "ruff".into(),
                exit_code: Some(if n == 0 { 0 } else { 1 }),
                issues,
            };
            self.executor
                .execute(
                    MessageSource::scalar(async move { Ok(run) }),
                    TargetPredicate::any(),
                    ExecuteOptions::new("tool:ruff", Duration::from_secs(5)),
                )
                .await
        }
    }

    fn gate(kit: &Kit, tool: Arc<dyn QualityTool>, delay: Duration) -> QualityGate {
        let ctx = kit.context();
        QualityGate::new(vec![tool], kit.fixer.clone(), ctx.log, ctx.cancel, 3, delay)
    }

    #[tokio::test]
    async fn clean_tool_needs_no_fixes() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let report = gate(&kit, ScriptedTool::new(vec![0]), Duration::ZERO).run().await;
        assert!(report.is_clean());
        assert_eq!(report.tools[0].fixes_requested, 0);
        assert!(kit.fixer.labels().is_empty());
    }

    #[tokio::test]
    async fn fixes_each_file_until_clean() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let report = gate(&kit, ScriptedTool::new(vec![3, 1, 0]), Duration::ZERO)
            .run()
            .await;
        assert!(report.is_clean());
        let result = &report.tools[0];
        assert_eq!(result.cycles, 2);
        // two files in the first cycle, one in the second
        assert_eq!(result.fixes_requested, 3);
        assert_eq!(kit.fixer.labels(), vec!["fix:ruff"; 3]);
        assert!(kit.log_text().contains("[quality] ruff"));
    }

    #[tokio::test]
    async fn stops_after_cycle_budget() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let report = gate(&kit, ScriptedTool::new(vec![1]), Duration::ZERO).run().await;
        let result = &report.tools[0];
        assert!(!report.is_clean());
        assert_eq!(result.cycles, 3);
        assert_eq!(result.fixes_requested, 3);
        assert_eq!(result.remaining_issues, Some(1));
    }

    #[tokio::test]
    async fn every_fix_waits_for_the_delay() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let delay = Duration::from_millis(40);
        let start = std::time::Instant::now();
        gate(&kit, ScriptedTool::new(vec![2, 0]), delay).run().await;
        let requests = kit.fixer.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].0 - start >= delay);
        assert!(requests[1].0 - requests[0].0 >= delay);
    }

    #[tokio::test]
    async fn missing_tool_is_reported_not_fixed() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let tool = crate::tools::CommandTool::new(
            crate::config::QualityToolKind::Basedpyright,
            kit.root(),
            std::path::Path::new("src"),
            SdkExecutor::default(),
            Duration::from_secs(5),
        )
        .with_program("storyflow-no-such-checker");
        let report = gate(&kit, Arc::new(tool), Duration::ZERO).run().await;
        assert!(!report.is_clean());
        assert_eq!(report.tools[0].remaining_issues, None);
        assert!(report.tools[0].error.is_some());
        assert!(kit.fixer.labels().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashed_tool_leaves_the_gate_unclean() {
        let kit = Kit::new(Script::always(true), Script::always(true));
        let program = crate::tools::fake_program(
            kit.root(),
            "ruff",
            "echo 'ruff failed: invalid pyproject.toml' >&2\nexit 2",
        );
        let tool = crate::tools::CommandTool::new(
            crate::config::QualityToolKind::Ruff,
            kit.root(),
            std::path::Path::new("src"),
            SdkExecutor::default(),
            Duration::from_secs(10),
        )
        .with_program(program.display().to_string());
        let report = gate(&kit, Arc::new(tool), Duration::ZERO).run().await;
        assert!(!report.is_clean());
        assert_eq!(report.tools[0].remaining_issues, None);
        assert!(report.tools[0]
            .error
            .as_deref()
            .unwrap()
            .contains("invalid pyproject.toml"));
        assert!(kit.fixer.labels().is_empty());
    }
}
