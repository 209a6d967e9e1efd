//! Statistic-id key assignment for meters.
//!
//! By default a meter's key is its lowercased id. With alias keys enabled,
//! meters with an alias use the slugified alias instead, falling back to
//! longer keys when two meters would otherwise share one.

use std::collections::{BTreeMap, BTreeSet};

/// Lowercase ASCII slug: alphanumerics kept, every other run of characters
/// collapsed to a single `_`, no leading or trailing `_`.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_sep = false;
    for ch in s.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Trim aliases, drop blank ones and ones for meters not in `allowed`.
pub fn normalize_aliases(
    aliases: &BTreeMap<String, String>,
    allowed: Option<&BTreeSet<String>>,
) -> BTreeMap<String, String> {
    aliases
        .iter()
        .filter(|(id, _)| allowed.map_or(true, |a| a.contains(*id)))
        .filter_map(|(id, alias)| {
            let alias = alias.trim();
            (!alias.is_empty()).then(|| (id.clone(), alias.to_string()))
        })
        .collect()
}

/// Assign alias-based keys to the meters that have a usable alias.
///
/// Keys of meters without alias are reserved first so an alias can never take
/// over another meter's default key.
pub fn build_alias_keys(
    meter_ids: &[String],
    aliases: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let alias_slugs: BTreeMap<&str, String> = meter_ids
        .iter()
        .filter_map(|id| {
            let slug = slugify(aliases.get(id)?);
            (!slug.is_empty()).then(|| (id.as_str(), slug))
        })
        .collect();

    let mut used: BTreeSet<String> = meter_ids
        .iter()
        .filter(|id| !alias_slugs.contains_key(id.as_str()))
        .map(|id| id.to_lowercase())
        .collect();

    let mut resolved = BTreeMap::new();
    for id in meter_ids {
        let Some(alias_slug) = alias_slugs.get(id.as_str()) else {
            continue;
        };

        let mut candidate = alias_slug.clone();
        if used.contains(&candidate) {
            let lower = id.to_lowercase();
            // Last six characters, not bytes: ids may carry non-ASCII.
            let tail_start = lower.char_indices().rev().nth(5).map_or(0, |(i, _)| i);
            candidate = format!("{alias_slug}_{}", &lower[tail_start..]);
            if used.contains(&candidate) {
                candidate = format!("{alias_slug}_{lower}");
            }
            if used.contains(&candidate) {
                let mut index = 2;
                while used.contains(&format!("{candidate}_{index}")) {
                    index += 1;
                }
                candidate = format!("{candidate}_{index}");
            }
            tracing::warn!(
                meter_id = %id,
                alias_key = %alias_slug,
                key = %candidate,
                "alias-based statistic key collides with an existing key, using fallback"
            );
        }

        used.insert(candidate.clone());
        resolved.insert(id.clone(), candidate);
    }

    resolved
}

/// The key to use in statistic ids for `meter_id`.
pub fn statistic_key(meter_id: &str, alias_keys: &BTreeMap<String, String>) -> String {
    alias_keys
        .get(meter_id)
        .cloned()
        .unwrap_or_else(|| meter_id.to_lowercase())
}
