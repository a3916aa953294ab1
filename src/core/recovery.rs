//! 错误恢复引擎
//!
//! 根据 HealError 类型返回 RecoveryAction，供主循环决定是升级、跳过、重问、记录回滚还是终止。

use crate::core::{HealError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作；re_asked 表示本失败在本轮是否已经重问过一次
    pub fn handle(&self, err: &HealError, re_asked: bool) -> RecoveryAction {
        match err {
            HealError::ClassificationAmbiguous(_) => RecoveryAction::Escalate,
            HealError::ReasoningUnavailable(e) => {
                RecoveryAction::SkipThisIteration(format!("reasoning unavailable: {e}"))
            }
            HealError::PatchMalformed(msg) if !re_asked => RecoveryAction::ReAsk(format!(
                "The previous diff was rejected: {msg}. \
                Reply with exactly one unified diff (--- a/<path>, +++ b/<path>, @@ hunks) \
                that applies cleanly and keeps the file syntactically valid."
            )),
            HealError::PatchMalformed(msg) => {
                RecoveryAction::SkipThisIteration(format!("patch malformed after re-ask: {msg}"))
            }
            HealError::RegressionDetected(msg) => RecoveryAction::RecordRejected(msg.clone()),
            HealError::InfrastructureFault(msg) => RecoveryAction::AbortRun(msg.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;

    #[test]
    fn test_recovery_ambiguous_escalates() {
        let engine = RecoveryEngine::new();
        let err = HealError::ClassificationAmbiguous("weird output".to_string());
        assert_eq!(engine.handle(&err, false), RecoveryAction::Escalate);
    }

    #[test]
    fn test_recovery_rate_limit_skips() {
        let engine = RecoveryEngine::new();
        let err = HealError::ReasoningUnavailable(LlmError::RateLimited {
            retry_after_ms: Some(1000),
        });
        match engine.handle(&err, false) {
            RecoveryAction::SkipThisIteration(msg) => assert!(msg.contains("rate")),
            other => panic!("Expected SkipThisIteration, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_malformed_reasks_once() {
        let engine = RecoveryEngine::new();
        let err = HealError::malformed("hunk does not apply");
        match engine.handle(&err, false) {
            RecoveryAction::ReAsk(msg) => assert!(msg.contains("hunk does not apply")),
            other => panic!("Expected ReAsk, got {other:?}"),
        }
        assert!(matches!(
            engine.handle(&err, true),
            RecoveryAction::SkipThisIteration(_)
        ));
    }

    #[test]
    fn test_recovery_regression_records_rejected() {
        let engine = RecoveryEngine::new();
        let err = HealError::RegressionDetected("test_add newly fails".to_string());
        assert!(matches!(
            engine.handle(&err, false),
            RecoveryAction::RecordRejected(_)
        ));
    }

    #[test]
    fn test_recovery_infrastructure_aborts() {
        let engine = RecoveryEngine::new();
        let err = HealError::infrastructure("repo unreadable");
        assert!(err.is_fatal());
        assert!(matches!(engine.handle(&err, false), RecoveryAction::AbortRun(_)));
    }
}
