//! 确定性评分
//!
//! final_ci_score = 100 + speed_factor - regression_penalty；fix_efficiency 只报告，不计入总分。
//! 所有输入都来自收尾时的 Run，无重跑、无外部调用，持久化记录本身即可复算。

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const BASE_SCORE: i64 = 100;
pub const SPEED_BONUS: i64 = 10;
pub const SPEED_LIMIT: Duration = Duration::from_secs(300);
pub const COMMIT_ALLOWANCE: u32 = 20;
pub const PENALTY_PER_COMMIT: i64 = 2;
pub const COMPUTATION_METHOD: &str = "deterministic";

/// 结果记录中的 scoring 块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scoring {
    pub base_score: i64,
    pub speed_factor: i64,
    pub fix_efficiency: f64,
    pub regression_penalty: i64,
    pub final_ci_score: i64,
    pub computation_method: String,
}

/// 评分输入
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    pub elapsed: Duration,
    pub commit_count: u32,
    pub fixes_resolved: u32,
    pub total_failures: u32,
}

pub fn fix_efficiency(fixes_resolved: u32, total_failures: u32) -> f64 {
    f64::from(fixes_resolved) / f64::from(total_failures.max(1))
}

pub fn score(inputs: &ScoreInputs) -> Scoring {
    let speed_factor = if inputs.elapsed < SPEED_LIMIT { SPEED_BONUS } else { 0 };
    let regression_penalty =
        PENALTY_PER_COMMIT * i64::from(inputs.commit_count.saturating_sub(COMMIT_ALLOWANCE));
    Scoring {
        base_score: BASE_SCORE,
        speed_factor,
        fix_efficiency: fix_efficiency(inputs.fixes_resolved, inputs.total_failures),
        regression_penalty,
        final_ci_score: BASE_SCORE + speed_factor - regression_penalty.abs(),
        computation_method: COMPUTATION_METHOD.to_string(),
    }
}

/// 仅凭 scoring 块与记录中的计数复算
pub fn rescore(scoring: &Scoring, total_fixes: u32, total_failures: u32) -> Scoring {
    Scoring {
        base_score: scoring.base_score,
        speed_factor: scoring.speed_factor,
        fix_efficiency: fix_efficiency(total_fixes, total_failures),
        regression_penalty: scoring.regression_penalty,
        final_ci_score: scoring.base_score + scoring.speed_factor - scoring.regression_penalty.abs(),
        computation_method: COMPUTATION_METHOD.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fast_small_run() {
        let s = score(&ScoreInputs {
            elapsed: Duration::from_secs(240),
            commit_count: 3,
            fixes_resolved: 1,
            total_failures: 1,
        });
        assert_eq!(s.speed_factor, 10);
        assert_eq!(s.regression_penalty, 0);
        assert_eq!(s.final_ci_score, 110);
        assert_eq!(s.computation_method, "deterministic");
    }

    #[test]
    fn test_slow_run_with_many_commits() {
        let s = score(&ScoreInputs {
            elapsed: Duration::from_secs(300),
            commit_count: 25,
            fixes_resolved: 2,
            total_failures: 5,
        });
        assert_eq!(s.speed_factor, 0);
        assert_eq!(s.regression_penalty, 10);
        assert_eq!(s.final_ci_score, 90);
        assert!((s.fix_efficiency - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_fix_efficiency_not_weighted() {
        // 效率不同、其余相同时总分一致
        let inputs = ScoreInputs {
            elapsed: Duration::from_secs(10),
            commit_count: 0,
            fixes_resolved: 0,
            total_failures: 4,
        };
        let a = score(&inputs);
        let b = score(&ScoreInputs {
            fixes_resolved: 4,
            ..inputs
        });
        assert_ne!(a.fix_efficiency, b.fix_efficiency);
        assert_eq!(a.final_ci_score, b.final_ci_score);
        assert_eq!(fix_efficiency(0, 0), 0.0);
    }

    proptest! {
        #[test]
        fn prop_rescore_is_identity(secs in 0u64..1000, commits in 0u32..60, fixed in 0u32..20, extra in 0u32..20) {
            let total = fixed + extra;
            let s = score(&ScoreInputs {
                elapsed: Duration::from_secs(secs),
                commit_count: commits,
                fixes_resolved: fixed,
                total_failures: total,
            });
            let json = serde_json::to_string(&s).unwrap();
            let back: Scoring = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(rescore(&back, fixed, total), s.clone());
            prop_assert!(s.final_ci_score <= BASE_SCORE + SPEED_BONUS);
        }
    }
}
