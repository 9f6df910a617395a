use std::path::Path;

use anyhow::Context;
use storyflow_core::status::ProcessingStatus;
use storyflow_core::store::StoryRecord;

use crate::output::{print_json, print_table};

pub fn run(root: &Path, epic: Option<&str>, status: Option<&str>, json: bool) -> anyhow::Result<()> {
    let status = status
        .map(|s| s.parse::<ProcessingStatus>())
        .transpose()
        .context("invalid --status")?;
    let config = super::load_config(root)?;
    let store = super::open_store(root, &config)?;

    let records = super::block_on(async {
        match status {
            Some(status) => store.get_stories_by_status(status).await,
            None => store.get_all_stories().await,
        }
    })?
    .context("failed to read the state store")?;
    let records: Vec<StoryRecord> = records
        .into_iter()
        .filter(|r| epic.map_or(true, |e| r.epic_id == e))
        .collect();

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No story records.");
        return Ok(());
    }
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.epic_id.clone(),
                r.story_path.clone(),
                r.status.to_string(),
                r.phase.clone().unwrap_or_else(|| "-".to_string()),
                r.iteration.to_string(),
                r.updated_at.clone(),
                r.error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        &["EPIC", "STORY", "STATUS", "PHASE", "ITER", "UPDATED", "ERROR"],
        rows,
    );
    Ok(())
}
