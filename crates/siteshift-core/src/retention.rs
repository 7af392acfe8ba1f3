//! Backup retention policy.
//!
//! A policy is a composite of independently evaluated rules: max-count,
//! max-age, max-total-size, and granular daily/weekly/monthly keepers.
//! An artifact is retained iff every configured rule allows it; when any
//! granular keeper claims an artifact it is retained regardless of the
//! other granular groups.

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use siteshift_types::Artifact;

/// Age thresholds partitioning artifacts into granular buckets.
const DAILY_BUCKET_MAX_DAYS: i64 = 30;
const WEEKLY_BUCKET_MAX_DAYS: i64 = 90;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    /// Keep only the newest N artifacts by creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
    /// Delete artifacts older than this many days.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
    /// Cap aggregate size, evicting oldest first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_bytes: Option<u64>,
    /// Keep the newest artifact per day for the newest N days
    /// (artifacts up to 30 days old).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_daily: Option<usize>,
    /// Keep the newest artifact per ISO week for the newest N weeks
    /// (artifacts 31-90 days old).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<usize>,
    /// Keep the newest artifact per calendar month for the newest N
    /// months (artifacts older than 90 days).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<usize>,
}

impl RetentionPolicy {
    /// Policy with no rules: retains everything.
    pub fn keep_everything() -> Self {
        RetentionPolicy::default()
    }

    pub fn with_max_count(count: usize) -> Self {
        RetentionPolicy {
            max_count: Some(count),
            ..Default::default()
        }
    }

    fn has_granular_rules(&self) -> bool {
        self.keep_daily.is_some() || self.keep_weekly.is_some() || self.keep_monthly.is_some()
    }

    /// Decide whether `artifact` survives this policy given the full
    /// artifact population it competes with.
    pub fn should_retain(&self, artifact: &Artifact, all: &[Artifact]) -> bool {
        let now = Utc::now();

        if let Some(max_age) = self.max_age_days {
            let age_days = (now - artifact.created_at).num_days();
            if age_days > max_age as i64 {
                return false;
            }
        }

        if let Some(max_count) = self.max_count {
            let mut sorted: Vec<&Artifact> = all.iter().collect();
            sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let keep: Vec<&str> = sorted
                .iter()
                .take(max_count)
                .map(|a| a.id.as_str())
                .collect();
            if !keep.contains(&artifact.id.as_str()) {
                return false;
            }
        }

        if let Some(cap) = self.max_total_bytes {
            let mut sorted: Vec<&Artifact> = all.iter().collect();
            sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let mut cumulative: u64 = 0;
            for candidate in sorted {
                cumulative = cumulative.saturating_add(candidate.size);
                if candidate.id == artifact.id {
                    if cumulative > cap {
                        return false;
                    }
                    break;
                }
            }
        }

        if self.has_granular_rules() {
            return self.granular_keeps(artifact, all);
        }

        true
    }

    /// Whether any configured granular keeper claims `artifact`.
    fn granular_keeps(&self, artifact: &Artifact, all: &[Artifact]) -> bool {
        let now = Utc::now();

        let bucket_of = |a: &Artifact| {
            let age = (now - a.created_at).num_days();
            if age <= DAILY_BUCKET_MAX_DAYS {
                Bucket::Daily
            } else if age <= WEEKLY_BUCKET_MAX_DAYS {
                Bucket::Weekly
            } else {
                Bucket::Monthly
            }
        };

        let bucket = bucket_of(artifact);
        let (keep, group_key): (Option<usize>, fn(&Artifact) -> String) = match bucket {
            Bucket::Daily => (self.keep_daily, |a| {
                a.created_at.format("%Y-%m-%d").to_string()
            }),
            Bucket::Weekly => (self.keep_weekly, |a| {
                let iso = a.created_at.iso_week();
                format!("{}-W{:02}", iso.year(), iso.week())
            }),
            Bucket::Monthly => (self.keep_monthly, |a| {
                a.created_at.format("%Y-%m").to_string()
            }),
        };

        let Some(keep) = keep else {
            return false;
        };

        // Newest artifact per calendar group, then the newest `keep`
        // groups retained.
        let mut groups: std::collections::BTreeMap<String, &Artifact> =
            std::collections::BTreeMap::new();
        for candidate in all.iter().filter(|a| bucket_of(a) == bucket) {
            let key = group_key(candidate);
            groups
                .entry(key)
                .and_modify(|existing| {
                    if candidate.created_at > existing.created_at {
                        *existing = candidate;
                    }
                })
                .or_insert(candidate);
        }

        let mut keepers: Vec<&Artifact> = groups.into_values().collect();
        keepers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        keepers
            .iter()
            .take(keep)
            .any(|kept| kept.id == artifact.id)
    }

    /// Partition `all` into (retained, evicted) under this policy.
    pub fn evaluate<'a>(&self, all: &'a [Artifact]) -> (Vec<&'a Artifact>, Vec<&'a Artifact>) {
        let mut retained = Vec::new();
        let mut evicted = Vec::new();
        for artifact in all {
            if self.should_retain(artifact, all) {
                retained.push(artifact);
            } else {
                evicted.push(artifact);
            }
        }
        (retained, evicted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Daily,
    Weekly,
    Monthly,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use siteshift_types::ArtifactKind;
    use std::collections::BTreeMap;

    fn artifact(id: &str, age_days: i64, size: u64) -> Artifact {
        Artifact {
            id: id.to_string(),
            kind: ArtifactKind::FileArchive,
            source_system: "web".to_string(),
            location: format!("/backups/{id}.tar.gz").into(),
            size,
            checksum: None,
            created_at: Utc::now() - TimeDelta::days(age_days),
            sequence: 0,
            expires_at: None,
            compression_used: true,
            encryption_used: false,
            verified: false,
            verification_date: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_empty_policy_retains_everything() {
        let policy = RetentionPolicy::keep_everything();
        let all: Vec<Artifact> = (0..5).map(|i| artifact(&format!("a{i}"), i, 100)).collect();
        let (retained, evicted) = policy.evaluate(&all);
        assert_eq!(retained.len(), 5);
        assert!(evicted.is_empty());
    }

    #[test]
    fn test_max_count_zero_retains_nothing() {
        let policy = RetentionPolicy::with_max_count(0);
        let all: Vec<Artifact> = (0..3).map(|i| artifact(&format!("a{i}"), i, 100)).collect();
        let (retained, evicted) = policy.evaluate(&all);
        assert!(retained.is_empty());
        assert_eq!(evicted.len(), 3);
    }

    #[test]
    fn test_max_count_keeps_newest() {
        let policy = RetentionPolicy::with_max_count(10);
        let all: Vec<Artifact> = (0..15)
            .map(|i| artifact(&format!("a{i}"), i * 8, 100))
            .collect();
        let (retained, evicted) = policy.evaluate(&all);
        assert_eq!(retained.len(), 10);
        assert_eq!(evicted.len(), 5);
        // Every evicted artifact is older than every retained one.
        let newest_evicted = evicted.iter().map(|a| a.created_at).max().unwrap();
        let oldest_retained = retained.iter().map(|a| a.created_at).min().unwrap();
        assert!(newest_evicted < oldest_retained);
    }

    #[test]
    fn test_max_age_evicts_old_artifacts() {
        let policy = RetentionPolicy {
            max_age_days: Some(30),
            ..Default::default()
        };
        let all = vec![artifact("new", 5, 100), artifact("old", 45, 100)];
        let (retained, evicted) = policy.evaluate(&all);
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].id, "new");
        assert_eq!(evicted[0].id, "old");
    }

    #[test]
    fn test_max_total_bytes_evicts_oldest_first() {
        let policy = RetentionPolicy {
            max_total_bytes: Some(250),
            ..Default::default()
        };
        let all = vec![
            artifact("a", 1, 100),
            artifact("b", 2, 100),
            artifact("c", 3, 100),
        ];
        let (retained, evicted) = policy.evaluate(&all);
        let retained_ids: Vec<&str> = retained.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(retained_ids, vec!["a", "b"]);
        assert_eq!(evicted[0].id, "c");
    }

    #[test]
    fn test_granular_daily_keeps_newest_per_day() {
        let policy = RetentionPolicy {
            keep_daily: Some(2),
            ..Default::default()
        };
        // Two artifacts on the same day plus one on each of two older days.
        let mut same_day_old = artifact("same_day_old", 1, 100);
        same_day_old.created_at -= TimeDelta::hours(3);
        let all = vec![
            artifact("day1", 1, 100),
            same_day_old,
            artifact("day2", 2, 100),
            artifact("day3", 3, 100),
        ];
        // Newest per day: day1, day2, day3; keep the newest two days.
        assert!(policy.should_retain(&all[0], &all));
        assert!(!policy.should_retain(&all[1], &all));
        assert!(policy.should_retain(&all[2], &all));
        assert!(!policy.should_retain(&all[3], &all));
    }

    #[test]
    fn test_granular_bucket_without_keeper_evicts() {
        // Only keep_daily configured: a 100-day-old artifact falls into
        // the monthly bucket, which has no keeper.
        let policy = RetentionPolicy {
            keep_daily: Some(5),
            ..Default::default()
        };
        let all = vec![artifact("recent", 2, 100), artifact("ancient", 100, 100)];
        assert!(policy.should_retain(&all[0], &all));
        assert!(!policy.should_retain(&all[1], &all));
    }

    #[test]
    fn test_granular_monthly_groups_by_month() {
        let policy = RetentionPolicy {
            keep_monthly: Some(1),
            ..Default::default()
        };
        let all = vec![artifact("m1", 100, 100), artifact("m2", 160, 100)];
        // Different months; only the newest month's keeper survives.
        assert!(policy.should_retain(&all[0], &all));
        assert!(!policy.should_retain(&all[1], &all));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// max_count retains at most that many artifacts.
            #[test]
            fn max_count_bound_holds(count in 0usize..20, population in 1usize..40) {
                let policy = RetentionPolicy::with_max_count(count);
                let all: Vec<Artifact> = (0..population)
                    .map(|i| artifact(&format!("p{i}"), i as i64, 10))
                    .collect();
                let (retained, _) = policy.evaluate(&all);
                prop_assert!(retained.len() <= count);
            }

            /// The retained set under max_total_bytes never exceeds the cap
            /// (single artifacts larger than the cap are always evicted).
            #[test]
            fn size_cap_holds(cap in 50u64..5_000, population in 1usize..30) {
                let policy = RetentionPolicy {
                    max_total_bytes: Some(cap),
                    ..Default::default()
                };
                let all: Vec<Artifact> = (0..population)
                    .map(|i| artifact(&format!("s{i}"), i as i64, 100))
                    .collect();
                let (retained, _) = policy.evaluate(&all);
                let total: u64 = retained.iter().map(|a| a.size).sum();
                prop_assert!(total <= cap);
            }
        }
    }
}
