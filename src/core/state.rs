//! 运行状态机与对外状态投影
//!
//! 内部状态比 ci_status 多（CONVERGED / RETRY / EXHAUSTED / SCORING），这些状态不单独对外，
//! 投影时保留上一个对外可见的状态。

use crate::heal::CiStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Pending,
    Analyzing,
    Fixing,
    Validating,
    Converged,
    Retry,
    Exhausted,
    Scoring,
    Passed,
    Partial,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Passed | RunState::Partial | RunState::Failed)
    }

    /// 合法迁移表
    ///
    /// 除正常路径外：ANALYZING 可直接进入 SCORING（零失败）或 EXHAUSTED（剩余失败全部不可修复）；
    /// VALIDATING 可回到 FIXING 处理同一轮的下一个失败；任何非终态都可进入 SCORING
    /// （基础设施故障或取消时提前收尾）。
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Pending, Analyzing) => true,
            (Analyzing, Fixing) | (Analyzing, Exhausted) => true,
            (Fixing, Validating) => true,
            (Validating, Fixing)
            | (Validating, Converged)
            | (Validating, Retry)
            | (Validating, Exhausted) => true,
            (Retry, Analyzing) => true,
            (Converged, Scoring) | (Exhausted, Scoring) => true,
            (Scoring, Passed) | (Scoring, Partial) | (Scoring, Failed) => true,
            (Scoring, Scoring) => false,
            (from, Scoring) => !from.is_terminal(),
            _ => false,
        }
    }

    /// 对外可见的 ci_status；内部过渡状态返回 None
    pub fn ci_status(&self) -> Option<CiStatus> {
        match self {
            RunState::Pending => Some(CiStatus::Pending),
            RunState::Analyzing => Some(CiStatus::Analyzing),
            RunState::Fixing => Some(CiStatus::Fixing),
            RunState::Validating => Some(CiStatus::Validating),
            RunState::Passed => Some(CiStatus::Passed),
            RunState::Partial => Some(CiStatus::Partial),
            RunState::Failed => Some(CiStatus::Failed),
            RunState::Converged | RunState::Retry | RunState::Exhausted | RunState::Scoring => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Analyzing => "ANALYZING",
            RunState::Fixing => "FIXING",
            RunState::Validating => "VALIDATING",
            RunState::Converged => "CONVERGED",
            RunState::Retry => "RETRY",
            RunState::Exhausted => "EXHAUSTED",
            RunState::Scoring => "SCORING",
            RunState::Passed => "PASSED",
            RunState::Partial => "PARTIAL",
            RunState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunState::*;

    #[test]
    fn test_main_path_is_legal() {
        let path = [Pending, Analyzing, Fixing, Validating, Retry, Analyzing, Fixing, Validating, Converged, Scoring, Passed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Analyzing.can_transition_to(Scoring));
        assert!(Validating.can_transition_to(Exhausted));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Pending.can_transition_to(Fixing));
        assert!(!Retry.can_transition_to(Fixing));
        assert!(!Converged.can_transition_to(Passed));
        assert!(!Passed.can_transition_to(Scoring));
        assert!(!Failed.can_transition_to(Analyzing));
        assert!(!Scoring.can_transition_to(Analyzing));
        assert!(!Scoring.can_transition_to(Scoring));
    }

    #[test]
    fn test_projection() {
        assert_eq!(Retry.ci_status(), None);
        assert_eq!(Scoring.ci_status(), None);
        assert_eq!(Fixing.ci_status(), Some(CiStatus::Fixing));
        assert_eq!(Partial.ci_status(), Some(CiStatus::Partial));
        assert!(Failed.is_terminal());
        assert!(!Exhausted.is_terminal());
    }
}
