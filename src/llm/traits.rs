//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / 主备路由 / Mock）实现 LlmClient：单次非流式 complete。
//! 调用方自行给出 temperature 与 seed，保证同一 Run 内的可复现参数。

use async_trait::async_trait;
use thiserror::Error;

/// 推理服务错误；任何一种都按软失败处理
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("request timed out")]
    Timeout,

    #[error("api error: {0}")]
    Api(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl LlmError {
    /// 限流与超时会触发切换到备用模型
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::Timeout)
    }
}

/// 一次补全请求：system 指令、用户上下文与采样参数
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub seed: i64,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 当前实际使用的模型名（写入 llm_usage）
    fn model_name(&self) -> String;

    /// 非流式完成，返回首条回复文本
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    /// 累计 token 用量 (prompt, completion)；不统计的后端返回 0
    fn token_usage(&self) -> (u64, u64) {
        (0, 0)
    }
}
