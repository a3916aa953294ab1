//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / 主备路由 / Mock）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

use std::sync::Arc;

use crate::config::AppConfig;

pub use deepseek::create_deepseek_client;
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use router::FallbackRouter;
pub use traits::{CompletionRequest, LlmClient, LlmError};

fn create_single(provider: &str, model: &str, base_url: Option<&str>) -> Arc<dyn LlmClient> {
    match provider {
        "deepseek" => Arc::new(create_deepseek_client(Some(model))),
        "openai" => Arc::new(OpenAiClient::new(base_url, model, None)),
        "mock" => Arc::new(MockLlmClient::named(model)),
        other => {
            tracing::warn!(provider = %other, "unknown LLM provider, using mock client");
            Arc::new(MockLlmClient::named(model))
        }
    }
}

/// 按配置创建主备路由客户端：provider 决定后端，fallback_model 可选
pub fn create_llm_from_config(cfg: &AppConfig) -> FallbackRouter {
    let provider = cfg.llm.provider.to_lowercase();
    if provider != "mock"
        && std::env::var("OPENAI_API_KEY").is_err()
        && std::env::var("DEEPSEEK_API_KEY").is_err()
    {
        tracing::warn!("no API key found in environment, reasoning calls will soft-fail");
    }
    let base_url = cfg.llm.base_url.as_deref();
    let primary = create_single(&provider, &cfg.llm.model, base_url);
    let fallback = cfg
        .llm
        .fallback_model
        .as_deref()
        .map(|m| create_single(&provider, m, base_url));
    FallbackRouter::new(primary, fallback)
}
