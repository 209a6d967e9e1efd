pub mod backfill;
pub mod validity;

use statistics_client::domain::StatisticsRecord;

pub use backfill::{BackfillEngine, WritePlan};
pub use validity::{Assessment, ValidityChecker, Verdict};

fn hash_f64(hasher: &mut blake3::Hasher, v: f64) {
    hasher.update(&v.to_bits().to_le_bytes());
}

fn hash_opt_f64(hasher: &mut blake3::Hasher, v: Option<f64>) {
    match v {
        Some(x) => {
            hasher.update(&[1]);
            hash_f64(hasher, x);
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

/// blake3 digest over the exact row contents, order included.
pub fn fingerprint(records: &[StatisticsRecord]) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&(records.len() as u64).to_le_bytes());
    for r in records {
        h.update(&r.start.unix_timestamp_nanos().to_le_bytes());
        hash_f64(&mut h, r.state);
        hash_opt_f64(&mut h, r.mean);
        hash_opt_f64(&mut h, r.sum);
    }
    h.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn fingerprint_tells_missing_fields_apart() {
        let full = StatisticsRecord::point_cumulative(datetime!(2025-01-01 00:00 UTC), 1.0);
        let bare = StatisticsRecord::state_only(datetime!(2025-01-01 00:00 UTC), 1.0);
        assert_ne!(fingerprint(&[full.clone()]), fingerprint(&[bare]));
        assert_eq!(fingerprint(&[full.clone()]), fingerprint(&[full]));
        assert_eq!(fingerprint(&[]).len(), 64);
    }
}
