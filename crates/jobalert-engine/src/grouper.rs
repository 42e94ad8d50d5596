use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use jobalert_core::{hour_bucket, NotificationGroup, NotificationHistoryEntry};
use uuid::Uuid;

const GROUP_NAMESPACE: Uuid = Uuid::from_u128(0x6a0b_3c2e_51d4_4f7a_9e18_c0d2_7b45_a913);

/// Deterministic id for the group of `user_id` within `run_id`. Each run gets fresh group ids.
pub fn group_id(run_id: Uuid, user_id: &str, bucket: DateTime<Utc>) -> Uuid {
    let name = format!("{run_id}|{user_id}|{}", bucket.timestamp());
    Uuid::new_v5(&GROUP_NAMESPACE, name.as_bytes())
}

/// Folds one user's admitted entries into a single group. `None` when nothing was admitted.
pub fn build_group(
    run_id: Uuid,
    user_id: &str,
    mut entries: Vec<NotificationHistoryEntry>,
    now: DateTime<Utc>,
) -> Option<NotificationGroup> {
    if entries.is_empty() {
        return None;
    }
    entries.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.job_id.cmp(&b.job_id)));

    let mut keywords: BTreeMap<String, String> = BTreeMap::new();
    for keyword in entries.iter().flat_map(|e| e.matched_keywords.iter()) {
        keywords
            .entry(keyword.to_lowercase())
            .or_insert_with(|| keyword.clone());
    }
    let job_count = entries
        .iter()
        .map(|e| e.job_id)
        .collect::<HashSet<_>>()
        .len();

    let bucket = hour_bucket(now);
    Some(NotificationGroup {
        id: group_id(run_id, user_id, bucket),
        run_id,
        user_id: user_id.to_string(),
        hour_bucket: bucket,
        matched_keywords: keywords.into_values().collect(),
        job_count,
        entries,
        created_at: now,
    })
}
