pub mod config;
pub mod db;
pub mod run;
pub mod status;
pub mod sync;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use storyflow_core::agents::{
    AgentContext, AgentTransport, Agents, ClaudeCliTransport, DryRunTransport,
};
use storyflow_core::config::Config;
use storyflow_core::paths;
use storyflow_core::sdk::SdkExecutor;
use storyflow_core::store::StateStore;

/// Load and validate the project config.
pub(crate) fn load_config(root: &Path) -> anyhow::Result<Arc<Config>> {
    let config = Config::load(root).context("failed to load config")?;
    config.ensure_valid().context("invalid config")?;
    Ok(Arc::new(config))
}

pub(crate) fn open_store(root: &Path, config: &Config) -> anyhow::Result<StateStore> {
    let path = paths::resolve(root, &config.store.db_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    StateStore::open(&path, &config.store)
        .with_context(|| format!("cannot open state store at {}", path.display()))
}

/// Claude-backed agents, answered locally when `dry_run` is set.
pub(crate) fn agents(
    root: &Path,
    config: &Arc<Config>,
    executor: &SdkExecutor,
    dry_run: bool,
) -> Agents {
    let transport: Arc<dyn AgentTransport> = if dry_run {
        Arc::new(DryRunTransport::default())
    } else {
        Arc::new(ClaudeCliTransport)
    };
    Agents::claude(Arc::new(AgentContext::new(
        root.to_path_buf(),
        Arc::clone(config),
        executor.clone(),
        transport,
    )))
}

/// Drive `fut` to completion on a fresh multi-threaded runtime.
pub(crate) fn block_on<F: Future>(fut: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    Ok(rt.block_on(fut))
}
