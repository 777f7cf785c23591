//! Per-user command admission (leaky bucket over a shared counter store).

use std::{sync::Arc, time::Duration};

use chrono::Utc;

use crate::{
    domain::UserId,
    ports::{AdmissionState, AdmissionStore},
    Result,
};

/// Compare-and-set retries allowed on top of `capacity` for one decision.
///
/// A failed CAS means another caller admitted a command for the same user, so
/// at most `capacity` retries can be lost to real contention before the bucket
/// is full and the decision becomes a plain denial.
const EXTRA_CAS_ATTEMPTS: u64 = 32;

/// What the gate answers when the counter store cannot be consulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureMode {
    /// Admit the command; rate limiting is best-effort.
    FailOpen,
    /// Deny the command until the store is reachable again.
    FailClosed,
}

#[derive(Clone, Copy, Debug)]
pub struct AdmissionConfig {
    /// Burst size in commands.
    pub capacity: u32,
    /// One unit drains from the bucket per interval (`leak_rate = 1 / interval`).
    pub leak_interval: Duration,
    pub failure_mode: FailureMode,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            leak_interval: Duration::from_secs(1),
            failure_mode: FailureMode::FailClosed,
        }
    }
}

pub struct AdmissionGate {
    store: Arc<dyn AdmissionStore>,
    cfg: AdmissionConfig,
    key_prefix: String,
}

impl AdmissionGate {
    pub fn new(
        store: Arc<dyn AdmissionStore>,
        cfg: AdmissionConfig,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cfg,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn config(&self) -> AdmissionConfig {
        self.cfg
    }

    pub fn key_for(&self, user_id: UserId) -> String {
        format!("{}cmd_rate_limit:{user_id}", self.key_prefix)
    }

    /// Whether `user_id` may run one more command right now.
    pub async fn try_admit(&self, user_id: UserId) -> bool {
        self.try_admit_at(user_id, Utc::now().timestamp_millis())
            .await
    }

    /// [`try_admit`](Self::try_admit) with an explicit wall-clock time (unix ms).
    pub async fn try_admit_at(&self, user_id: UserId, now_ms: i64) -> bool {
        let key = self.key_for(user_id);
        match self.decide(&key, now_ms).await {
            Ok(allowed) => {
                tracing::debug!(%user_id, allowed, "User {user_id} is allowed: {allowed}");
                allowed
            }
            Err(e) => {
                let allowed = self.cfg.failure_mode == FailureMode::FailOpen;
                tracing::warn!(
                    %user_id,
                    allowed,
                    error = %e,
                    "Admission store unavailable, applying {:?}",
                    self.cfg.failure_mode
                );
                allowed
            }
        }
    }

    async fn decide(&self, key: &str, now_ms: i64) -> Result<bool> {
        let capacity = f64::from(self.cfg.capacity);

        let attempts = u64::from(self.cfg.capacity) + EXTRA_CAS_ATTEMPTS;

        for _ in 0..attempts {
            let (expected, state) = match self.store.load(key).await? {
                Some(v) => (Some(v.version), v.value),
                None => (
                    None,
                    AdmissionState {
                        last_update_ms: now_ms,
                        level: 0.0,
                    },
                ),
            };

            let level = drained_level(state, now_ms, self.cfg.leak_interval);
            if level + 1.0 > capacity {
                return Ok(false);
            }

            let next = AdmissionState {
                last_update_ms: now_ms.max(state.last_update_ms),
                level: (level + 1.0).min(capacity),
            };
            if self
                .store
                .compare_and_set(key, expected, next, self.bucket_ttl())
                .await?
            {
                return Ok(true);
            }
        }

        // Contention, not a store failure: never admit without taking a unit.
        tracing::warn!(key, attempts, "Admission still contended after all retries, denying");
        Ok(false)
    }

    /// How long an untouched bucket needs to drain completely, plus one interval.
    fn bucket_ttl(&self) -> Duration {
        self.cfg
            .leak_interval
            .saturating_mul(self.cfg.capacity.saturating_add(1))
    }
}

fn drained_level(state: AdmissionState, now_ms: i64, leak_interval: Duration) -> f64 {
    let elapsed_ms = now_ms.saturating_sub(state.last_update_ms).max(0) as f64;
    let interval_ms = (leak_interval.as_secs_f64() * 1000.0).max(1e-6);
    (state.level - elapsed_ms / interval_ms).max(0.0)
}
