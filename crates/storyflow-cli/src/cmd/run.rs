use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use storyflow_core::config::Config;
use storyflow_core::driver::{EpicDriver, EpicReport};
use storyflow_core::FlowError;
use storyflow_core::sdk::SdkExecutor;
use tokio_util::sync::CancellationToken;

use crate::output::{print_json, print_table};

pub struct RunArgs {
    pub epic: PathBuf,
    pub dry_run: bool,
    pub skip_quality: bool,
    pub skip_tests: bool,
    pub max_rounds: Option<u32>,
    pub max_quality_cycles: Option<u32>,
    pub max_test_cycles: Option<u32>,
}

pub fn run(root: &Path, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let config = Arc::new(apply_overrides(&config, &args));
    config
        .ensure_valid()
        .context("invalid command-line overrides")?;
    let store = super::open_store(root, &config)?;

    let report = super::block_on(async {
        let executor = SdkExecutor::default();
        abort_on_ctrl_c(executor.root_token().clone());
        let agents = super::agents(root, &config, &executor, args.dry_run);
        let mut driver = EpicDriver::new(root, Arc::clone(&config), agents, store, executor);
        if args.skip_quality {
            driver = driver.with_quality_tools(Vec::new());
        }
        if args.skip_tests {
            driver = driver.with_test_runner(None);
        }
        driver.run(&args.epic).await
    })?
    .with_context(|| format!("epic run failed for {}", args.epic.display()))?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    if report.cancelled {
        return Err(FlowError::Cancelled.into());
    }
    if !report.all_completed() {
        anyhow::bail!(
            "{} of {} stories did not complete",
            report.stories.len() - report.completed(),
            report.stories.len()
        );
    }
    Ok(())
}

fn apply_overrides(config: &Config, args: &RunArgs) -> Config {
    let mut config = config.clone();
    if let Some(rounds) = args.max_rounds {
        config.workflow.max_rounds = rounds;
    }
    if let Some(cycles) = args.max_quality_cycles {
        config.quality.max_cycles = cycles;
    }
    if let Some(cycles) = args.max_test_cycles {
        config.tests.max_cycles = cycles;
    }
    config
}

/// Cancel `token` on the first Ctrl-C. In-flight agent calls end with a
/// cancelled result and no new story starts.
fn abort_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    eprintln!("interrupt received, stopping after in-flight calls");
                    token.cancel();
                }
            }
        }
    });
}

fn print_report(report: &EpicReport) {
    println!("{} [{}]", report.title, report.epic_id);
    println!();
    let rows = report
        .stories
        .iter()
        .map(|s| {
            vec![
                s.story.clone(),
                format!("{:?}", s.outcome),
                s.rounds.to_string(),
                s.developer_calls.to_string(),
                s.qa_calls.to_string(),
                s.final_status
                    .map(|st| st.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(
        &["STORY", "OUTCOME", "ROUNDS", "DEV", "QA", "DOCUMENT STATUS"],
        rows,
    );
    println!();
    println!(
        "{}/{} stories completed ({} retry pass(es))",
        report.completed(),
        report.stories.len(),
        report.retry_passes
    );
    if let Some(quality) = &report.quality {
        let verdict = if quality.is_clean() { "clean" } else { "issues remain" };
        println!("Quality gate: {verdict}");
    }
    if let Some(tests) = &report.tests {
        println!(
            "Tests: {:?} after {} run(s), {} failing",
            tests.outcome,
            tests.runs,
            tests.failing.len()
        );
    }
    println!(
        "Agent calls: {} | run log: {}",
        report.sdk.total_calls,
        report.log_path.display()
    );
}
