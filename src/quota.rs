//! Monthly quota buckets: check, deduct, refund.

use crate::config::AppConfig;
use crate::types::{now_ms, QuotaSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Rolling reset period. Advanced lazily on the first touch past `reset_at`.
const PERIOD_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// The metered buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    AutoExplain,
    LearningInteractions,
    Extractions,
}

impl Bucket {
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::AutoExplain => "autoExplain",
            Bucket::LearningInteractions => "learningInteractions",
            Bucket::Extractions => "extractions",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Row {
    used: u32,
    reset_at_ms: i64,
}

/// Per-(user, bucket) counters. All mutation happens under one lock, so
/// concurrent deducts on the same bucket serialize.
pub struct QuotaService {
    rows: Mutex<HashMap<(String, Bucket), Row>>,
    auto_explain_limit: u32,
    learning_interactions_limit: u32,
    extractions_limit: u32,
}

impl QuotaService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            auto_explain_limit: config.auto_explain_limit,
            learning_interactions_limit: config.learning_interactions_limit,
            extractions_limit: config.extractions_limit,
        }
    }

    fn limit(&self, bucket: Bucket) -> u32 {
        match bucket {
            Bucket::AutoExplain => self.auto_explain_limit,
            Bucket::LearningInteractions => self.learning_interactions_limit,
            Bucket::Extractions => self.extractions_limit,
        }
    }

    fn row_mut<'a>(
        rows: &'a mut HashMap<(String, Bucket), Row>,
        user_id: &str,
        bucket: Bucket,
    ) -> &'a mut Row {
        let now = now_ms();
        let row = rows
            .entry((user_id.to_string(), bucket))
            .or_insert(Row { used: 0, reset_at_ms: now + PERIOD_MS });
        if now >= row.reset_at_ms {
            row.used = 0;
            // Advance past now even after long dormancy
            while row.reset_at_ms <= now {
                row.reset_at_ms += PERIOD_MS;
            }
        }
        row
    }

    /// Non-mutating view (apart from the lazy reset).
    pub fn check(&self, user_id: &str, bucket: Bucket) -> QuotaSnapshot {
        let mut rows = self.rows.lock();
        let limit = self.limit(bucket);
        let row = Self::row_mut(&mut rows, user_id, bucket);
        QuotaSnapshot {
            used: row.used,
            limit,
            reset_at_ms: row.reset_at_ms,
        }
    }

    /// Deduct `n` units if the bucket has room; the counter only moves
    /// forward until the reset boundary.
    pub fn deduct(&self, user_id: &str, bucket: Bucket, n: u32) -> Result<QuotaSnapshot, QuotaSnapshot> {
        let mut rows = self.rows.lock();
        let limit = self.limit(bucket);
        let row = Self::row_mut(&mut rows, user_id, bucket);
        if row.used + n > limit {
            return Err(QuotaSnapshot {
                used: row.used,
                limit,
                reset_at_ms: row.reset_at_ms,
            });
        }
        row.used += n;
        debug!(
            "quota deduct user={} bucket={} used={}/{}",
            user_id,
            bucket.name(),
            row.used,
            limit
        );
        Ok(QuotaSnapshot {
            used: row.used,
            limit,
            reset_at_ms: row.reset_at_ms,
        })
    }

    /// Return `n` units after a terminal failure. Never drops below zero.
    pub fn refund(&self, user_id: &str, bucket: Bucket, n: u32) -> QuotaSnapshot {
        let mut rows = self.rows.lock();
        let limit = self.limit(bucket);
        let row = Self::row_mut(&mut rows, user_id, bucket);
        row.used = row.used.saturating_sub(n);
        debug!(
            "quota refund user={} bucket={} used={}/{}",
            user_id,
            bucket.name(),
            row.used,
            limit
        );
        QuotaSnapshot {
            used: row.used,
            limit,
            reset_at_ms: row.reset_at_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> QuotaService {
        QuotaService::new(&AppConfig::default())
    }

    #[test]
    fn deduct_is_monotonic_until_limit() {
        let quota = service();
        for i in 1..=5 {
            let snap = quota.deduct("user-1", Bucket::AutoExplain, 1).unwrap();
            assert_eq!(snap.used, i);
        }
        let snap = quota.check("user-1", Bucket::AutoExplain);
        assert_eq!(snap.used, 5);
        assert_eq!(snap.limit, 300);
    }

    #[test]
    fn deduct_rejects_at_limit() {
        let quota = QuotaService::new(&AppConfig {
            extractions_limit: 2,
            ..AppConfig::default()
        });
        quota.deduct("user-1", Bucket::Extractions, 2).unwrap();
        let denied = quota.deduct("user-1", Bucket::Extractions, 1).unwrap_err();
        assert_eq!(denied.used, 2);
        assert_eq!(denied.limit, 2);
    }

    #[test]
    fn refund_never_goes_negative() {
        let quota = service();
        quota.deduct("user-1", Bucket::AutoExplain, 2).unwrap();
        let snap = quota.refund("user-1", Bucket::AutoExplain, 5);
        assert_eq!(snap.used, 0);
    }

    #[test]
    fn buckets_are_independent_per_user() {
        let quota = service();
        quota.deduct("user-1", Bucket::AutoExplain, 3).unwrap();
        assert_eq!(quota.check("user-2", Bucket::AutoExplain).used, 0);
        assert_eq!(quota.check("user-1", Bucket::Extractions).used, 0);
    }
}
