//! Worker pools.
//!
//! A pool is a bounded set of workers stamped from one template, governed
//! by a scaling policy. Pools own no worker objects; workers live in the
//! manager's registry and are referenced by id.

pub mod autoscaler;
pub mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{PoolId, WorkerId};
use crate::provider::WorkerTemplate;

/// Default auto-scaler cooldown between actions on one pool.
pub const DEFAULT_COOLDOWN_SECS: u64 = 120;

/// Bounds and thresholds governing a pool's size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    /// Minimum number of workers.
    pub min: u32,
    /// Maximum number of workers.
    pub max: u32,
    /// Utilization above which the auto-scaler proposes growth.
    pub scale_up_threshold: f64,
    /// Utilization below which the auto-scaler may propose shrinking.
    pub scale_down_threshold: f64,
    /// Seconds to wait between scaling actions on this pool.
    pub cooldown_seconds: u64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown_seconds: DEFAULT_COOLDOWN_SECS,
        }
    }
}

impl ScalingPolicy {
    /// Returns the configuration problems with this policy, if any.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.min > self.max {
            issues.push(format!("min ({}) must be <= max ({})", self.min, self.max));
        }
        if !(0.0..=1.0).contains(&self.scale_up_threshold) {
            issues.push("scale_up_threshold must be within [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.scale_down_threshold) {
            issues.push("scale_down_threshold must be within [0, 1]".to_string());
        }
        if self.scale_down_threshold > self.scale_up_threshold {
            issues.push("scale_down_threshold must not exceed scale_up_threshold".to_string());
        }
        issues
    }

    /// Clamps a proposed size into `[min, max]`.
    pub fn clamp(&self, size: u32) -> u32 {
        size.clamp(self.min, self.max)
    }
}

/// Lifecycle status of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Serving capacity.
    Active,
    /// A scale-up is in progress.
    ScalingUp,
    /// A scale-down is in progress.
    ScalingDown,
    /// No new jobs; existing workers finish and drain.
    Draining,
    /// Deleted; members destroyed.
    Terminated,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolStatus::Active => write!(f, "active"),
            PoolStatus::ScalingUp => write!(f, "scaling_up"),
            PoolStatus::ScalingDown => write!(f, "scaling_down"),
            PoolStatus::Draining => write!(f, "draining"),
            PoolStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Operator-facing pool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    /// Pool name (DNS-1123).
    pub name: String,
    /// Which provider materializes this pool's workers.
    pub provider: String,
    /// Template shared by every member.
    pub template: WorkerTemplate,
    /// Scaling bounds and thresholds.
    #[serde(default)]
    pub policy: ScalingPolicy,
}

/// A worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    /// Unique identifier.
    pub id: PoolId,
    /// Pool name.
    pub name: String,
    /// Provider backing this pool.
    pub provider: String,
    /// Member template.
    pub template: WorkerTemplate,
    /// Scaling policy.
    pub policy: ScalingPolicy,
    /// Lifecycle status.
    pub status: PoolStatus,
    /// Live members.
    pub current_size: u32,
    /// Target size the manager converges toward.
    pub desired_size: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the last scaling action finished (cooldown anchor).
    pub last_scaled_at: Option<DateTime<Utc>>,
}

impl Pool {
    /// Returns whether the pool can take on another worker.
    pub fn can_grow(&self) -> bool {
        self.status == PoolStatus::Active && self.current_size < self.policy.max
    }
}

/// Point-in-time metrics for one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    /// The pool.
    pub pool_id: PoolId,
    /// Its name.
    pub name: String,
    /// Live members.
    pub current_size: u32,
    /// Target size.
    pub desired_size: u32,
    /// Members that can take a job now.
    pub ready: u32,
    /// Members executing jobs.
    pub busy: u32,
    /// busy / (ready + busy), zero when empty.
    pub utilization: f64,
}

/// Aggregate metrics across every pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OverallMetrics {
    /// Number of pools.
    pub pools: usize,
    /// Workers across all pools.
    pub total_workers: u32,
    /// Available workers across all pools.
    pub ready_workers: u32,
    /// Busy workers across all pools.
    pub busy_workers: u32,
}

/// A pool lifecycle event. Every event carries the emission timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEvent {
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: PoolEventKind,
}

/// Kinds of pool events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEventKind {
    PoolCreated {
        pool_id: PoolId,
        name: String,
    },
    PoolDeleted {
        pool_id: PoolId,
    },
    PoolScaled {
        pool_id: PoolId,
        from: u32,
        to: u32,
        reason: String,
    },
    WorkerAdded {
        pool_id: PoolId,
        worker_id: WorkerId,
    },
    WorkerRemoved {
        pool_id: PoolId,
        worker_id: WorkerId,
        reason: String,
        new_size: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_validation() {
        assert!(ScalingPolicy::default().issues().is_empty());

        let inverted = ScalingPolicy {
            min: 5,
            max: 2,
            ..Default::default()
        };
        assert!(!inverted.issues().is_empty());

        let crossed = ScalingPolicy {
            scale_up_threshold: 0.3,
            scale_down_threshold: 0.8,
            ..Default::default()
        };
        assert!(!crossed.issues().is_empty());

        let out_of_range = ScalingPolicy {
            scale_up_threshold: 1.5,
            ..Default::default()
        };
        assert!(!out_of_range.issues().is_empty());
    }

    #[test]
    fn test_policy_clamp() {
        let policy = ScalingPolicy {
            min: 2,
            max: 6,
            ..Default::default()
        };
        assert_eq!(policy.clamp(0), 2);
        assert_eq!(policy.clamp(4), 4);
        assert_eq!(policy.clamp(10), 6);
    }

    #[test]
    fn test_can_grow() {
        let pool = Pool {
            id: PoolId::generate(),
            name: "p".to_string(),
            provider: "mock".to_string(),
            template: WorkerTemplate::new("p", "img"),
            policy: ScalingPolicy {
                min: 1,
                max: 2,
                ..Default::default()
            },
            status: PoolStatus::Active,
            current_size: 1,
            desired_size: 1,
            created_at: Utc::now(),
            last_scaled_at: None,
        };
        assert!(pool.can_grow());

        let full = Pool {
            current_size: 2,
            ..pool.clone()
        };
        assert!(!full.can_grow());

        let draining = Pool {
            status: PoolStatus::Draining,
            ..pool
        };
        assert!(!draining.can_grow());
    }
}
