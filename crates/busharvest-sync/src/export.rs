use std::sync::Arc;

use busharvest_core::TransformedSet;
use busharvest_storage::{ExportError, SnapshotSink, StoredSnapshot};
use tracing::info;

pub const SNAPSHOT_KEY: &str = "scraped_data.json";
pub const SNAPSHOT_CONTENT_TYPE: &str = "application/json";

/// Writes the run's transformed set to one fixed object key.
#[derive(Clone)]
pub struct SnapshotExporter {
    sink: Arc<dyn SnapshotSink>,
    key: String,
}

impl SnapshotExporter {
    pub fn new(sink: Arc<dyn SnapshotSink>) -> Self {
        Self {
            sink,
            key: SNAPSHOT_KEY.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn render(set: &TransformedSet) -> Result<Vec<u8>, ExportError> {
        let mut body = serde_json::to_vec_pretty(set)?;
        body.push(b'\n');
        Ok(body)
    }

    pub async fn export(&self, set: &TransformedSet) -> Result<StoredSnapshot, ExportError> {
        let body = Self::render(set)?;
        let stored = self.sink.put(&self.key, body, SNAPSHOT_CONTENT_TYPE).await?;
        info!(
            key = %stored.key,
            sha256 = %stored.sha256,
            bytes = stored.byte_size,
            buses = set.buses.len(),
            "snapshot exported"
        );
        Ok(stored)
    }
}
