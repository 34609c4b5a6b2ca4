use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, SecurityError};

/// Named admission rule: `requests` tokens refill per `window_ms`, at most `burst` held.
///
/// Thresholds are signed so that a bad rule can be registered and is only rejected
/// when it is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    pub name: String,
    pub requests: i64,
    pub window_ms: i64,
    pub burst: i64,
}

impl RateLimitRule {
    pub fn new(name: impl Into<String>, requests: i64, window_ms: i64, burst: i64) -> Self {
        Self {
            name: name.into(),
            requests,
            window_ms,
            burst,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.requests <= 0 || self.window_ms <= 0 || self.burst <= 0 {
            return Err(SecurityError::Validation(format!(
                "rate limit rule '{}' needs positive requests, windowMs and burst",
                self.name
            )));
        }
        Ok(())
    }

    fn tokens_for(&self, elapsed_ms: f64) -> f64 {
        elapsed_ms * self.requests as f64 / self.window_ms as f64
    }

    fn ms_for(&self, tokens: f64) -> f64 {
        tokens * self.window_ms as f64 / self.requests as f64
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// When the bucket is full again.
    pub reset_time: DateTime<Utc>,
    /// Seconds until the next token, only set on denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, rule: &RateLimitRule, now: Instant) {
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.tokens = (self.tokens + rule.tokens_for(elapsed_ms)).min(rule.burst as f64);
        self.last_refill = now;
    }
}

type BucketKey = (String, String);

/// Token-bucket limiter keyed by (caller key, rule name).
///
/// Buckets refill lazily on access. The bucket map is only write-locked to insert
/// or sweep; the check-and-decrement runs under the bucket's own lock.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    rules: Arc<RwLock<HashMap<String, RateLimitRule>>>,
    buckets: Arc<RwLock<HashMap<BucketKey, Arc<Mutex<Bucket>>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = RateLimitRule>) -> Self {
        let rules = rules.into_iter().map(|r| (r.name.clone(), r)).collect();
        Self {
            rules: Arc::new(RwLock::new(rules)),
            buckets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add or replace a rule. Existing buckets for the rule keep their tokens.
    pub async fn register_rule(&self, rule: RateLimitRule) {
        self.rules.write().await.insert(rule.name.clone(), rule);
    }

    pub async fn remove_rule(&self, name: &str) -> bool {
        let removed = self.rules.write().await.remove(name).is_some();
        if removed {
            self.buckets.write().await.retain(|(_, rule), _| rule != name);
        }
        removed
    }

    pub async fn has_rule(&self, name: &str) -> bool {
        self.rules.read().await.contains_key(name)
    }

    async fn bucket(&self, key: &str, rule: &RateLimitRule) -> Arc<Mutex<Bucket>> {
        let id = (key.to_string(), rule.name.clone());
        if let Some(bucket) = self.buckets.read().await.get(&id) {
            return bucket.clone();
        }
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    tokens: rule.burst as f64,
                    last_refill: Instant::now(),
                }))
            })
            .clone()
    }

    /// Atomically refill, test and consume one token.
    pub async fn check(&self, key: &str, rule_name: &str) -> Result<RateLimitDecision> {
        let rule = self
            .rules
            .read()
            .await
            .get(rule_name)
            .cloned()
            .ok_or_else(|| SecurityError::RuleNotFound(rule_name.to_string()))?;
        rule.validate()?;

        let bucket = self.bucket(key, &rule).await;
        let mut bucket = bucket.lock().await;
        bucket.refill(&rule, Instant::now());

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        let to_full_ms = rule.ms_for(rule.burst as f64 - bucket.tokens).ceil() as i64;
        let retry_after = if allowed {
            None
        } else {
            let wait_ms = rule.ms_for(1.0 - bucket.tokens);
            Some(((wait_ms / 1000.0).ceil() as u64).max(1))
        };

        if !allowed {
            debug!(key, rule = rule_name, retry_after, "rate limit denied");
        }

        Ok(RateLimitDecision {
            allowed,
            remaining: bucket.tokens.floor().max(0.0) as u64,
            reset_time: Utc::now() + chrono::Duration::milliseconds(to_full_ms.max(0)),
            retry_after,
        })
    }

    /// Like `check`, but a denial is an error.
    pub async fn enforce(&self, key: &str, rule_name: &str) -> Result<RateLimitDecision> {
        let decision = self.check(key, rule_name).await?;
        if !decision.allowed {
            return Err(SecurityError::RateLimitExceeded {
                retry_after_secs: decision.retry_after.unwrap_or(1),
            });
        }
        Ok(decision)
    }

    /// Forget the bucket for (key, rule), restoring full burst.
    pub async fn reset(&self, key: &str, rule_name: &str) {
        self.buckets
            .write()
            .await
            .remove(&(key.to_string(), rule_name.to_string()));
    }

    /// Evict buckets that have refilled completely (indistinguishable from a fresh
    /// bucket) or whose rule is gone. Returns the number evicted.
    pub async fn sweep_idle(&self) -> usize {
        let rules = self.rules.read().await.clone();
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|(_, rule_name), bucket| {
            let Some(rule) = rules.get(rule_name) else {
                return false;
            };
            if rule.validate().is_err() {
                return false;
            }
            match bucket.try_lock() {
                Ok(mut b) => {
                    b.refill(rule, now);
                    b.tokens < rule.burst as f64
                }
                Err(_) => true,
            }
        });
        before - buckets.len()
    }

    pub async fn tracked_buckets(&self) -> usize {
        self.buckets.read().await.len()
    }
}
