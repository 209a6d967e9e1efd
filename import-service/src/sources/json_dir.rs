use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use statistics_client::domain::MeterPoint;

use crate::pipeline::{Envelope, FetchWindow, ImportError, PayloadSource};
use crate::transform::RawMeterPayload;

/// Reads one JSON payload document per meter from `<dir>/<meter id>.json`.
///
/// Whatever fetches the data upstream drops the files here; the fetch window
/// is not applied, the whole document is returned every cycle.
pub struct JsonDirSource {
    dir: PathBuf,
}

impl JsonDirSource {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, meter_id: &str) -> PathBuf {
        self.dir.join(format!("{meter_id}.json"))
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[async_trait::async_trait]
impl PayloadSource for JsonDirSource {
    async fn fetch(
        &self,
        meter: &MeterPoint,
        window: FetchWindow,
    ) -> Result<Envelope<RawMeterPayload>, ImportError> {
        let path = self.path_for(&meter.id);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ImportError::Fetch(format!("failed to read {}: {e}", path.display())))?;

        let payload = RawMeterPayload::from_json_str(&contents)?;
        tracing::debug!(
            meter_id = %meter.id,
            path = %path.display(),
            window_start = %window.start,
            "loaded payload document"
        );

        Ok(Envelope {
            payload,
            received_at: modified_at(&path).await.unwrap_or_else(SystemTime::now),
        })
    }
}
