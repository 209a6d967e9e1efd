use statistics_client::domain::{check_sequence, MeterPoint, StreamId, StreamMetadata};

use crate::pipeline::{ImportError, StatisticsSink};
use crate::reconcile::backfill::{sum_decreases, WritePlan};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: usize,
    pub repaired: usize,
    pub digest: String,
}

/// Keeps stream metadata in line with the rows about to be written, then
/// writes them.
pub struct Writer<'a, K: ?Sized> {
    sink: &'a K,
    unit: &'a str,
}

impl<'a, K> Writer<'a, K>
where
    K: StatisticsSink + ?Sized,
{
    pub fn new(sink: &'a K, unit: &'a str) -> Self {
        Self { sink, unit }
    }

    /// Metadata for `plan`'s stream, with flags the sink cannot store cleared.
    pub fn desired_metadata(&self, meter: &MeterPoint, plan: &WritePlan) -> StreamMetadata {
        let caps = self.sink.capabilities();
        let point_cumulative = plan.kind.is_point_cumulative();
        StreamMetadata {
            name: meter.stream_name(plan.kind),
            unit: self.unit.to_string(),
            has_mean: point_cumulative && caps.has_mean,
            has_sum: point_cumulative && caps.has_sum,
        }
    }

    /// Skips the update when the stored metadata already matches. Failures
    /// are logged; the rows are still written.
    pub async fn sync_metadata(&self, stream: &StreamId, desired: &StreamMetadata) {
        match self.sink.get_metadata(stream).await {
            Ok(Some(current)) if &current == desired => return,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, statistic_id = %stream, "failed to read stream metadata");
            }
        }
        match self.sink.set_metadata(stream, desired).await {
            Ok(()) => tracing::info!(
                statistic_id = %stream,
                has_mean = desired.has_mean,
                has_sum = desired.has_sum,
                "stream metadata updated"
            ),
            Err(e) => tracing::warn!(error = %e, statistic_id = %stream, "failed to update stream metadata"),
        }
    }

    /// `previous_sum` is the stored sum the plan continues from, if any.
    pub async fn write(
        &self,
        meter: &MeterPoint,
        stream: &StreamId,
        plan: &WritePlan,
        previous_sum: Option<f64>,
    ) -> Result<WriteOutcome, ImportError> {
        let digest = plan.digest();
        if plan.is_empty() {
            return Ok(WriteOutcome {
                written: 0,
                repaired: 0,
                digest,
            });
        }

        check_sequence(plan.kind, &plan.records).map_err(|e| ImportError::Validation(e.to_string()))?;

        let decreases = sum_decreases(previous_sum, &plan.records);
        if decreases > 0 {
            tracing::warn!(
                meter_id = %meter.id,
                statistic_id = %stream,
                decreases,
                "sum decreased between rows, passing through unchanged"
            );
            metrics::counter!("statistics_sum_decrease_observed_total").increment(decreases as u64);
        }

        let desired = self.desired_metadata(meter, plan);
        self.sync_metadata(stream, &desired).await;

        self.sink.write(stream, &plan.records, plan.mode).await?;

        metrics::counter!("import_records_written_total").increment(plan.records.len() as u64);
        if plan.repaired > 0 {
            metrics::counter!("import_backfill_rows_repaired_total").increment(plan.repaired as u64);
        }
        tracing::debug!(
            statistic_id = %stream,
            written = plan.records.len(),
            repaired = plan.repaired,
            mode = ?plan.mode,
            %digest,
            "write plan applied"
        );

        Ok(WriteOutcome {
            written: plan.records.len(),
            repaired: plan.repaired,
            digest,
        })
    }
}
