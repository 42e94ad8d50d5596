use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use jobalert_core::{JobMatch, JobPosting, KeywordSubscription};

#[derive(Debug, Clone)]
struct CompiledKeyword {
    device_id: String,
    keyword: String,
    needle: String,
}

/// Keywords of all active subscriptions, trimmed and lowercased once per run.
#[derive(Debug, Clone, Default)]
pub struct KeywordMatcher {
    keywords: Vec<CompiledKeyword>,
}

impl KeywordMatcher {
    pub fn new(subscriptions: &[KeywordSubscription]) -> Self {
        let keywords = subscriptions
            .iter()
            .filter(|s| s.is_active)
            .filter_map(|s| {
                let keyword = s.keyword.trim();
                (!keyword.is_empty()).then(|| CompiledKeyword {
                    device_id: s.device_id.clone(),
                    keyword: keyword.to_string(),
                    needle: keyword.to_lowercase(),
                })
            })
            .collect();
        Self { keywords }
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// One [`JobMatch`] per device with at least one keyword found in the posting's
    /// title or company. Devices come out in id order.
    pub fn match_posting(&self, posting: &JobPosting, matched_at: DateTime<Utc>) -> Vec<JobMatch> {
        let title = posting.title.to_lowercase();
        let company = posting.company.to_lowercase();

        let mut per_device: BTreeMap<&str, Vec<&CompiledKeyword>> = BTreeMap::new();
        for kw in &self.keywords {
            if !(title.contains(&kw.needle) || company.contains(&kw.needle)) {
                continue;
            }
            let hits = per_device.entry(kw.device_id.as_str()).or_default();
            if !hits.iter().any(|seen| seen.needle == kw.needle) {
                hits.push(kw);
            }
        }

        if per_device.is_empty() {
            return Vec::new();
        }
        let unique_key = posting.unique_key();
        per_device
            .into_iter()
            .map(|(device_id, hits)| JobMatch {
                device_id: device_id.to_string(),
                job_id: posting.id,
                job_unique_key: unique_key.clone(),
                job_title: posting.title.clone(),
                job_company: posting.company.clone(),
                job_source: posting.source.clone(),
                matched_keywords: hits.into_iter().map(|kw| kw.keyword.clone()).collect(),
                matched_at,
            })
            .collect()
    }
}

pub fn match_posting(
    posting: &JobPosting,
    subscriptions: &[KeywordSubscription],
    matched_at: DateTime<Utc>,
) -> Vec<JobMatch> {
    KeywordMatcher::new(subscriptions).match_posting(posting, matched_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn posting(id: i64, title: &str, company: &str) -> JobPosting {
        JobPosting {
            id,
            title: title.to_string(),
            company: company.to_string(),
            location: None,
            source: "linkedin".to_string(),
            posted_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    fn sub(id: i64, device: &str, keyword: &str) -> KeywordSubscription {
        KeywordSubscription {
            id,
            device_id: device.to_string(),
            keyword: keyword.to_string(),
            is_active: true,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn matches_title_case_insensitively() {
        let matches = match_posting(
            &posting(1, "Senior AI Engineer", "TechCorp"),
            &[sub(1, "D1", "ai")],
            now(),
        );
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].device_id, "D1");
        assert_eq!(matches[0].job_id, 1);
        assert_eq!(matches[0].matched_keywords, vec!["ai"]);
        assert_eq!(
            matches[0].job_unique_key,
            jobalert_core::job_unique_key("TechCorp", "Senior AI Engineer")
        );
    }

    #[test]
    fn matches_company_as_well_as_title() {
        let matches = match_posting(
            &posting(2, "Backend Developer", "OpenAI"),
            &[sub(1, "D1", "openai")],
            now(),
        );
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn keywords_are_trimmed_and_blank_ones_never_match() {
        let p = posting(3, "Rust Engineer", "Acme");
        let subs = [sub(1, "D1", "  rust  "), sub(2, "D2", "   "), sub(3, "D3", "")];
        let matches = match_posting(&p, &subs, now());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched_keywords, vec!["rust"]);
    }

    #[test]
    fn keywords_are_merged_per_device_in_first_seen_order() {
        let p = posting(4, "ML Engineer, AI Platform", "DataCo");
        let subs = [
            sub(1, "D1", "ML"),
            sub(2, "D1", "AI"),
            sub(3, "D1", "ai"),
            sub(4, "D2", "platform"),
            sub(5, "D1", "golang"),
        ];
        let matches = match_posting(&p, &subs, now());
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].device_id, "D1");
        assert_eq!(matches[0].matched_keywords, vec!["ML", "AI"]);
        assert_eq!(matches[1].device_id, "D2");
        assert_eq!(matches[1].matched_keywords, vec!["platform"]);
    }

    #[test]
    fn inactive_subscriptions_are_ignored() {
        let mut inactive = sub(1, "D1", "AI");
        inactive.is_active = false;
        assert!(match_posting(&posting(5, "AI Engineer", "X"), &[inactive], now()).is_empty());
    }

    #[test]
    fn no_keywords_means_no_matches() {
        let matcher = KeywordMatcher::new(&[]);
        assert!(matcher.is_empty());
        assert!(matcher
            .match_posting(&posting(6, "Anything", "Anyone"), now())
            .is_empty());
    }
}
