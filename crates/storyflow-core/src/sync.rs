//! Status synchronizer: the one path from store records to the Status
//! sections of story documents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::agents::StatusWriter;
use crate::error::Result;
use crate::status::{DocumentStatus, ProcessingStatus};
use crate::store::StateStore;

#[derive(Debug, Clone, Serialize)]
pub struct SyncEntry {
    pub story: String,
    /// `None` when the store has no record for the story.
    pub processing_status: Option<ProcessingStatus>,
    pub document_status: DocumentStatus,
    pub written: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub entries: Vec<SyncEntry>,
}

impl SyncReport {
    pub fn all_written(&self) -> bool {
        self.entries.iter().all(|e| e.written)
    }

    pub fn failed(&self) -> impl Iterator<Item = &SyncEntry> {
        self.entries.iter().filter(|e| !e.written)
    }
}

#[derive(Clone)]
pub struct StatusSynchronizer {
    store: StateStore,
    writer: Arc<dyn StatusWriter>,
    root: PathBuf,
}

impl StatusSynchronizer {
    pub fn new(store: StateStore, writer: Arc<dyn StatusWriter>, root: &Path) -> Self {
        Self {
            store,
            writer,
            root: root.to_path_buf(),
        }
    }

    /// Write the derived document status of every listed story of `epic_id`.
    /// Stories without a record get "Ready for Development".
    pub async fn sync(&self, epic_id: &str, story_ids: &[String]) -> Result<SyncReport> {
        let records = self.store.get_stories_by_ids(epic_id, story_ids).await?;
        let mut report = SyncReport::default();
        for id in story_ids {
            let processing = records
                .iter()
                .find(|r| &r.story_path == id)
                .map(|r| r.status);
            let document_status = match processing {
                Some(p) => p.document_status(),
                None => {
                    tracing::warn!(
                        epic = epic_id,
                        story = %id,
                        "no store record, defaulting to Ready for Development"
                    );
                    DocumentStatus::ReadyForDevelopment
                }
            };
            let written = self
                .writer
                .write_status(&self.root.join(id), document_status)
                .await;
            if !written {
                tracing::warn!(story = %id, status = %document_status, "status sync failed");
            }
            report.entries.push(SyncEntry {
                story: id.clone(),
                processing_status: processing,
                document_status,
                written,
            });
        }
        Ok(report)
    }
}
