use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use storyflow_core::epic::Epic;
use storyflow_core::paths;
use storyflow_core::sdk::SdkExecutor;
use storyflow_core::sync::StatusSynchronizer;

use crate::output::{print_json, print_table};

/// Push the store's view of every story of an epic into the documents.
pub fn run(root: &Path, epic_path: &Path, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let epic = Epic::load(
        root,
        &paths::resolve(root, epic_path),
        &config.paths.stories_dir,
    )
    .with_context(|| format!("cannot load epic {}", epic_path.display()))?;
    let store = super::open_store(root, &config)?;

    let report = super::block_on(async {
        let executor = SdkExecutor::default();
        let agents = super::agents(root, &config, &executor, dry_run);
        StatusSynchronizer::new(store, Arc::clone(&agents.writer), root)
            .sync(&epic.id, &epic.story_keys())
            .await
    })?
    .context("status sync failed")?;

    if json {
        print_json(&report)?;
    } else {
        let rows = report
            .entries
            .iter()
            .map(|e| {
                vec![
                    e.story.clone(),
                    e.processing_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    e.document_status.to_string(),
                    if e.written { "yes" } else { "no" }.to_string(),
                ]
            })
            .collect();
        print_table(&["STORY", "STORE", "DOCUMENT", "WRITTEN"], rows);
    }

    let failed = report.failed().count();
    if failed > 0 {
        anyhow::bail!("{failed} story document(s) could not be updated");
    }
    Ok(())
}
