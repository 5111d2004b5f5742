use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Spacing of retries after a failed attempt. Accepts both the object form
/// `{"type": "exponential", "delay": 100}` and the explicit schedule form
/// `[100, 500, 5000]`; a schedule shorter than the retry count repeats its
/// last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackoffPlan {
    Schedule(Vec<u64>),
    Curve { r#type: BackoffKind, delay: u64 },
}

impl BackoffPlan {
    pub fn fixed(delay: Duration) -> BackoffPlan {
        BackoffPlan::Curve {
            r#type: BackoffKind::Fixed,
            delay: delay.as_millis() as u64,
        }
    }

    pub fn exponential(delay: Duration) -> BackoffPlan {
        BackoffPlan::Curve {
            r#type: BackoffKind::Exponential,
            delay: delay.as_millis() as u64,
        }
    }

    /// Delay before the next attempt, given how many attempts have already
    /// failed (1 after the first failure).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let failures = failures.max(1);
        let ms = match self {
            BackoffPlan::Schedule(schedule) => schedule
                .get((failures - 1) as usize)
                .or_else(|| schedule.last())
                .copied()
                .unwrap_or(0),
            BackoffPlan::Curve {
                r#type: BackoffKind::Fixed,
                delay,
            } => *delay,
            BackoffPlan::Curve {
                r#type: BackoffKind::Exponential,
                delay,
            } => delay.saturating_mul(1u64 << (failures - 1).min(32)),
        };
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_curve() {
        let plan = BackoffPlan::fixed(Duration::from_millis(100));
        assert_eq!(plan.delay_for(1), Duration::from_millis(100));
        assert_eq!(plan.delay_for(5), Duration::from_millis(100));
    }

    #[test]
    fn exponential_curve() {
        let plan = BackoffPlan::exponential(Duration::from_millis(100));
        assert_eq!(plan.delay_for(1), Duration::from_millis(100));
        assert_eq!(plan.delay_for(2), Duration::from_millis(200));
        assert_eq!(plan.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn explicit_schedule_repeats_last() {
        let plan = BackoffPlan::Schedule(vec![50, 500]);
        assert_eq!(plan.delay_for(1), Duration::from_millis(50));
        assert_eq!(plan.delay_for(2), Duration::from_millis(500));
        assert_eq!(plan.delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn deserializes_both_forms() {
        let object: BackoffPlan =
            serde_json::from_str(r##"{"type":"exponential","delay":100}"##).unwrap();
        assert_eq!(object, BackoffPlan::exponential(Duration::from_millis(100)));

        let array: BackoffPlan = serde_json::from_str("[100,200,300]").unwrap();
        assert_eq!(array, BackoffPlan::Schedule(vec![100, 200, 300]));
    }
}
