//! Auto-scaler.
//!
//! Evaluates every pool on a fixed cadence from three inputs: matching
//! queue pressure, worker utilization, and cluster availability. The scaler
//! only proposes; the coordinator hands accepted proposals to the pool
//! manager for execution.
//!
//! Scale-down is deliberately cautious: it needs confidence of at least
//! 0.8, built from an empty queue plus utilization that stayed below the
//! pool's threshold across the recent evaluation window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::job::PoolId;
use crate::monitor::ResourceSnapshot;
use crate::pool::{Pool, PoolMetrics};
use crate::queue::JobQueue;

use super::manager::PoolManager;

/// Default evaluation cadence.
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(30);

/// Confidence required before a scale-down proposal is made.
pub const SCALE_DOWN_CONFIDENCE: f64 = 0.8;

/// How many recent utilization observations feed the confidence model.
const UTILIZATION_WINDOW: usize = 10;

/// What the scaler proposes for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
    /// Not enough history to judge; treated as maintain.
    InsufficientData,
}

/// Inputs the decision was made from, kept for operators.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EvaluationInputs {
    /// busy / (ready + busy) at evaluation time.
    pub utilization: f64,
    /// Queued jobs this pool's template could serve.
    pub matching_backlog: usize,
    /// Workers able to take a job now.
    pub available_workers: u32,
    /// Cluster CPU still available, in millicores.
    pub available_cpu_millis: u64,
}

/// One pool's evaluation result.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    /// The evaluated pool.
    pub pool_id: PoolId,
    /// Members at evaluation time.
    pub current_size: u32,
    /// Proposed size.
    pub recommended: u32,
    /// Proposed action.
    pub action: ScalingAction,
    /// Why.
    pub reason: String,
    /// How sure the scaler is, in `[0, 1]`.
    pub confidence: f64,
    /// The inputs behind the decision.
    pub inputs: EvaluationInputs,
}

/// Periodic pool evaluator.
pub struct AutoScaler {
    utilization_history: Mutex<HashMap<PoolId, VecDeque<f64>>>,
}

impl Default for AutoScaler {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoScaler {
    /// Creates a scaler with empty history.
    pub fn new() -> Self {
        Self {
            utilization_history: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluates every pool the manager owns.
    pub async fn evaluate_all(
        &self,
        manager: &PoolManager,
        queue: &JobQueue,
        snapshot: ResourceSnapshot,
    ) -> Vec<Evaluation> {
        let mut evaluations = Vec::new();
        for pool in manager.list_pools().await {
            let Some(metrics) = manager.pool_metrics(pool.id).await else {
                continue;
            };
            let backlog = queue.pending_matching(&pool.template.capabilities);
            evaluations.push(self.evaluate_pool(&pool, &metrics, backlog, snapshot));
        }
        // Drop history for pools that no longer exist.
        {
            let live: std::collections::HashSet<PoolId> =
                evaluations.iter().map(|e| e.pool_id).collect();
            let mut history = self
                .utilization_history
                .lock()
                .expect("scaler history lock poisoned");
            history.retain(|pool_id, _| live.contains(pool_id));
        }
        evaluations
    }

    /// Evaluates a single pool.
    pub fn evaluate_pool(
        &self,
        pool: &Pool,
        metrics: &PoolMetrics,
        matching_backlog: usize,
        snapshot: ResourceSnapshot,
    ) -> Evaluation {
        let inputs = EvaluationInputs {
            utilization: metrics.utilization,
            matching_backlog,
            available_workers: metrics.ready,
            available_cpu_millis: snapshot.availability.available_cpu_millis,
        };

        let low_fraction = self.record_utilization(
            pool.id,
            metrics.utilization,
            pool.policy.scale_down_threshold,
        );

        let evaluation = |action, recommended, reason: String, confidence| Evaluation {
            pool_id: pool.id,
            current_size: pool.current_size,
            recommended,
            action,
            reason,
            confidence,
            inputs,
        };

        // A cooling-down pool holds position regardless of pressure.
        if let Some(last) = pool.last_scaled_at {
            let elapsed = (Utc::now() - last).num_seconds().max(0) as u64;
            if elapsed < pool.policy.cooldown_seconds {
                return evaluation(
                    ScalingAction::Maintain,
                    pool.current_size,
                    format!(
                        "cooldown: {elapsed}s since last scale, policy requires {}s",
                        pool.policy.cooldown_seconds
                    ),
                    1.0,
                );
            }
        }

        // Registered members tell us nothing until they start reporting.
        if pool.current_size > 0 && metrics.ready + metrics.busy == 0 {
            return evaluation(
                ScalingAction::InsufficientData,
                pool.current_size,
                "no workers have registered yet".to_string(),
                0.0,
            );
        }

        // Backlog with nothing free wants growth.
        if matching_backlog > 0 && metrics.ready == 0 {
            let recommended = pool
                .policy
                .clamp(pool.current_size.saturating_add(matching_backlog as u32));
            if recommended > pool.current_size {
                return evaluation(
                    ScalingAction::ScaleUp,
                    recommended,
                    format!("{matching_backlog} matching jobs queued with no available workers"),
                    0.9,
                );
            }
        }

        // High utilization wants growth even without a backlog.
        if metrics.utilization > pool.policy.scale_up_threshold {
            let recommended = pool.policy.clamp(pool.current_size + 1);
            if recommended > pool.current_size {
                return evaluation(
                    ScalingAction::ScaleUp,
                    recommended,
                    format!(
                        "utilization {:.2} above threshold {:.2}",
                        metrics.utilization, pool.policy.scale_up_threshold
                    ),
                    0.7,
                );
            }
        }

        // Sustained idleness with an empty queue may shrink, carefully.
        if metrics.utilization < pool.policy.scale_down_threshold
            && pool.current_size > pool.policy.min
        {
            let confidence = scale_down_confidence(matching_backlog, low_fraction);
            if confidence >= SCALE_DOWN_CONFIDENCE {
                return evaluation(
                    ScalingAction::ScaleDown,
                    pool.policy.clamp(pool.current_size - 1),
                    format!(
                        "utilization {:.2} below threshold {:.2} across recent window",
                        metrics.utilization, pool.policy.scale_down_threshold
                    ),
                    confidence,
                );
            }
            return evaluation(
                ScalingAction::Maintain,
                pool.current_size,
                format!("low utilization but confidence {confidence:.2} below threshold"),
                confidence,
            );
        }

        evaluation(
            ScalingAction::Maintain,
            pool.current_size,
            "within thresholds".to_string(),
            1.0,
        )
    }

    /// Records one utilization observation and returns the fraction of the
    /// window that sat below the pool's scale-down threshold.
    fn record_utilization(&self, pool_id: PoolId, utilization: f64, threshold: f64) -> f64 {
        let mut history = self
            .utilization_history
            .lock()
            .expect("scaler history lock poisoned");
        let window = history.entry(pool_id).or_default();
        if window.len() == UTILIZATION_WINDOW {
            window.pop_front();
        }
        window.push_back(utilization);

        let low = window.iter().filter(|&&u| u < threshold).count();
        low as f64 / window.len() as f64
    }
}

/// Confidence that shrinking is safe: half from queue emptiness, half from
/// how consistently utilization stayed low.
fn scale_down_confidence(matching_backlog: usize, low_fraction: f64) -> f64 {
    let queue_component = if matching_backlog == 0 { 0.5 } else { 0.0 };
    queue_component + 0.5 * low_fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::PoolId;
    use crate::pool::{PoolStatus, ScalingPolicy};
    use crate::provider::{ResourceAvailability, WorkerTemplate};

    fn pool(current: u32, min: u32, max: u32) -> Pool {
        Pool {
            id: PoolId::generate(),
            name: "p".to_string(),
            provider: "mock".to_string(),
            template: WorkerTemplate::new("p", "img"),
            policy: ScalingPolicy {
                min,
                max,
                ..Default::default()
            },
            status: PoolStatus::Active,
            current_size: current,
            desired_size: current,
            created_at: Utc::now(),
            last_scaled_at: None,
        }
    }

    fn metrics(pool: &Pool, ready: u32, busy: u32) -> PoolMetrics {
        let denominator = ready + busy;
        PoolMetrics {
            pool_id: pool.id,
            name: pool.name.clone(),
            current_size: pool.current_size,
            desired_size: pool.desired_size,
            ready,
            busy,
            utilization: if denominator == 0 {
                0.0
            } else {
                busy as f64 / denominator as f64
            },
        }
    }

    fn snapshot() -> ResourceSnapshot {
        ResourceSnapshot {
            availability: ResourceAvailability {
                total_cpu_millis: 16_000,
                available_cpu_millis: 8_000,
                total_memory_bytes: 64 << 30,
                available_memory_bytes: 32 << 30,
                node_count: 4,
            },
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn test_backlog_drives_scale_up_to_max() {
        let scaler = AutoScaler::new();
        let pool = pool(1, 1, 5);
        let metrics = metrics(&pool, 0, 1);

        let evaluation = scaler.evaluate_pool(&pool, &metrics, 10, snapshot());
        assert_eq!(evaluation.action, ScalingAction::ScaleUp);
        assert_eq!(evaluation.recommended, 5);
        assert!(evaluation.confidence >= 0.9);
    }

    #[test]
    fn test_high_utilization_scales_up_one_step() {
        let scaler = AutoScaler::new();
        let pool = pool(4, 1, 10);
        let metrics = metrics(&pool, 0, 4);

        let evaluation = scaler.evaluate_pool(&pool, &metrics, 0, snapshot());
        assert_eq!(evaluation.action, ScalingAction::ScaleUp);
        assert_eq!(evaluation.recommended, 5);
    }

    #[test]
    fn test_scale_down_needs_sustained_low_utilization() {
        let scaler = AutoScaler::new();
        let pool = pool(4, 1, 10);
        let idle = metrics(&pool, 4, 0);

        // Seed the window with a busy sample so the low fraction starts at 1/2.
        let busy = metrics(&pool, 0, 4);
        scaler.evaluate_pool(&pool, &busy, 0, snapshot());
        let evaluation = scaler.evaluate_pool(&pool, &idle, 0, snapshot());
        // One of two observations low: confidence 0.5 + 0.25 = 0.75 < 0.8.
        assert_eq!(evaluation.action, ScalingAction::Maintain);

        // Sustained idleness pushes the fraction up.
        let mut last = None;
        for _ in 0..6 {
            last = Some(scaler.evaluate_pool(&pool, &idle, 0, snapshot()));
        }
        let evaluation = last.unwrap();
        assert_eq!(evaluation.action, ScalingAction::ScaleDown);
        assert_eq!(evaluation.recommended, 3);
        assert!(evaluation.confidence >= SCALE_DOWN_CONFIDENCE);
    }

    #[test]
    fn test_no_scale_down_with_backlog() {
        let scaler = AutoScaler::new();
        let pool = pool(4, 1, 10);
        let idle = metrics(&pool, 4, 0);

        for _ in 0..10 {
            scaler.evaluate_pool(&pool, &idle, 0, snapshot());
        }
        // Queue pressure appeared: available workers exist, so no scale-up,
        // but the queue component drops out of the confidence too.
        let evaluation = scaler.evaluate_pool(&pool, &idle, 3, snapshot());
        assert_ne!(evaluation.action, ScalingAction::ScaleDown);
    }

    #[test]
    fn test_never_below_min() {
        let scaler = AutoScaler::new();
        let pool = pool(1, 1, 5);
        let idle = metrics(&pool, 1, 0);

        for _ in 0..10 {
            let evaluation = scaler.evaluate_pool(&pool, &idle, 0, snapshot());
            assert_ne!(evaluation.action, ScalingAction::ScaleDown);
        }
    }

    #[test]
    fn test_cooldown_holds_position() {
        let scaler = AutoScaler::new();
        let mut pool = pool(1, 1, 5);
        pool.last_scaled_at = Some(Utc::now());
        let metrics = metrics(&pool, 0, 1);

        let evaluation = scaler.evaluate_pool(&pool, &metrics, 10, snapshot());
        assert_eq!(evaluation.action, ScalingAction::Maintain);
        assert!(evaluation.reason.contains("cooldown"));
    }

    #[test]
    fn test_unregistered_members_give_insufficient_data() {
        let scaler = AutoScaler::new();
        let pool = pool(2, 1, 5);
        let metrics = metrics(&pool, 0, 0);

        let evaluation = scaler.evaluate_pool(&pool, &metrics, 0, snapshot());
        assert_eq!(evaluation.action, ScalingAction::InsufficientData);
    }
}
