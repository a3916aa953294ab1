//! 修复流程错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 HealError 决定 Escalate / SkipThisIteration / ReAsk / RecordRejected / AbortRun。
//! 只有 InfrastructureFault 会让一次 Run 提前结束，其余错误都在主循环内被吸收。

use thiserror::Error;

use crate::llm::LlmError;

/// 修复流程中可能出现的错误（分类、推理、补丁、验证、基础设施）
#[derive(Error, Debug)]
pub enum HealError {
    /// 快速签名全部未命中，需要升级到推理分类（从不致命）
    #[error("Classification ambiguous: {0}")]
    ClassificationAmbiguous(String),

    /// 推理服务失败、超时或限流（软失败，不额外消耗重试）
    #[error("Reasoning unavailable: {0}")]
    ReasoningUnavailable(#[from] LlmError),

    /// 补丁无法解析、无法应用或语法校验失败
    #[error("Patch malformed: {0}")]
    PatchMalformed(String),

    /// 验证阶段发现回归或目标失败仍在，已回滚
    #[error("Regression detected: {0}")]
    RegressionDetected(String),

    /// 仓库不可读、沙箱不可达等，唯一会提前结束 Run 的错误
    #[error("Infrastructure fault: {0}")]
    InfrastructureFault(String),
}

impl HealError {
    pub fn infrastructure(msg: impl Into<String>) -> Self {
        HealError::InfrastructureFault(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        HealError::PatchMalformed(msg.into())
    }

    /// 是否为需要终止整个 Run 的错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, HealError::InfrastructureFault(_))
    }
}

impl From<std::io::Error> for HealError {
    fn from(e: std::io::Error) -> Self {
        HealError::InfrastructureFault(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 升级到推理辅助分类
    Escalate,
    /// 本轮跳过该失败，记录时间线事件，留待下一轮
    SkipThisIteration(String),
    /// 用同一解释重新请求一次补丁
    ReAsk(String),
    /// 记录 tests_passed=false 的 Fix，失败保持未解决
    RecordRejected(String),
    /// 终止整个 Run，状态置为 FAILED
    AbortRun(String),
}
