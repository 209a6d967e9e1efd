use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};

use statistics_client::domain::{Field, StatisticsRecord, StreamId, StreamMetadata};
use time::OffsetDateTime;

use crate::pipeline::{ImportError, SinkCapabilities, StatisticsSink, WriteMode};

#[derive(Default)]
struct Store {
    rows: HashMap<StreamId, BTreeMap<OffsetDateTime, StatisticsRecord>>,
    metadata: HashMap<StreamId, StreamMetadata>,
}

/// Statistics kept in process memory. Used by tests and dry runs.
pub struct MemoryStatisticsSink {
    store: Mutex<Store>,
    capabilities: SinkCapabilities,
    reject_writes: AtomicBool,
    reject_metadata: AtomicBool,
    writes: AtomicUsize,
}

impl Default for MemoryStatisticsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStatisticsSink {
    pub fn new() -> Self {
        Self::with_capabilities(SinkCapabilities::FULL)
    }

    /// A sink whose schema cannot store some optional fields; they are
    /// dropped from rows and metadata on write.
    pub fn with_capabilities(capabilities: SinkCapabilities) -> Self {
        Self {
            store: Mutex::new(Store::default()),
            capabilities,
            reject_writes: AtomicBool::new(false),
            reject_metadata: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>, ImportError> {
        self.store
            .lock()
            .map_err(|_| ImportError::Storage("memory sink lock poisoned".to_string()))
    }

    fn stored_fields(&self) -> Vec<Field> {
        [Field::State, Field::Mean, Field::Sum]
            .into_iter()
            .filter(|f| self.capabilities.supports(*f))
            .collect()
    }

    /// Insert rows as they are, bypassing every check.
    pub fn seed(&self, stream: &StreamId, rows: Vec<StatisticsRecord>) {
        if let Ok(mut store) = self.store.lock() {
            let entry = store.rows.entry(stream.clone()).or_default();
            for r in rows {
                entry.insert(r.start, r);
            }
        }
    }

    pub fn seed_metadata(&self, stream: &StreamId, metadata: StreamMetadata) {
        if let Ok(mut store) = self.store.lock() {
            store.metadata.insert(stream.clone(), metadata);
        }
    }

    /// All rows of a stream, oldest first.
    pub fn rows(&self, stream: &StreamId) -> Vec<StatisticsRecord> {
        self.store
            .lock()
            .map(|store| {
                store
                    .rows
                    .get(stream)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn metadata_of(&self, stream: &StreamId) -> Option<StreamMetadata> {
        self.store.lock().ok()?.metadata.get(stream).cloned()
    }

    /// Make every subsequent row write fail with a storage error.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub fn reject_metadata(&self, reject: bool) {
        self.reject_metadata.store(reject, Ordering::SeqCst);
    }

    /// Number of accepted row writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StatisticsSink for MemoryStatisticsSink {
    fn capabilities(&self) -> SinkCapabilities {
        self.capabilities
    }

    async fn get_last_records(
        &self,
        stream: &StreamId,
        fields: &[Field],
        limit: usize,
    ) -> Result<Vec<StatisticsRecord>, ImportError> {
        let store = self.lock()?;
        Ok(store
            .rows
            .get(stream)
            .map(|rows| {
                rows.values()
                    .rev()
                    .take(limit)
                    .map(|r| r.clone().restricted_to(fields))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_metadata(&self, stream: &StreamId) -> Result<Option<StreamMetadata>, ImportError> {
        Ok(self.lock()?.metadata.get(stream).cloned())
    }

    async fn set_metadata(&self, stream: &StreamId, metadata: &StreamMetadata) -> Result<(), ImportError> {
        if self.reject_metadata.load(Ordering::SeqCst) {
            return Err(ImportError::Storage(format!("metadata update rejected for {stream}")));
        }
        let stored = StreamMetadata {
            has_mean: metadata.has_mean && self.capabilities.has_mean,
            has_sum: metadata.has_sum && self.capabilities.has_sum,
            ..metadata.clone()
        };
        self.lock()?.metadata.insert(stream.clone(), stored);
        Ok(())
    }

    async fn write(
        &self,
        stream: &StreamId,
        records: &[StatisticsRecord],
        mode: WriteMode,
    ) -> Result<(), ImportError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(ImportError::Storage(format!("write rejected for {stream}")));
        }
        let fields = self.stored_fields();
        let mut store = self.lock()?;
        let rows = store.rows.entry(stream.clone()).or_default();

        match mode {
            WriteMode::Append => {
                let mut last = rows.keys().next_back().copied();
                for r in records {
                    if matches!(last, Some(prev) if r.start <= prev) {
                        return Err(ImportError::Storage(format!(
                            "append to {stream} at {} does not come after the stored tail",
                            r.start
                        )));
                    }
                    last = Some(r.start);
                }
            }
            WriteMode::OverwriteTail { from } => {
                rows.retain(|start, _| *start < from);
            }
        }

        for r in records {
            rows.insert(r.start, r.clone().restricted_to(&fields));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
