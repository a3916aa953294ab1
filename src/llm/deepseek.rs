//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: 默认 deepseek-chat，可通过 llm.model 指定其他模型

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 创建 DeepSeek 客户端
///
/// - 优先使用环境变量 `DEEPSEEK_API_KEY`，其次 `OPENAI_API_KEY`
/// - 未指定模型时使用 `deepseek-chat`
pub fn create_deepseek_client(model: Option<&str>) -> OpenAiClient {
    let api_key = std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_else(|| "sk-placeholder".to_string());

    let model = model.unwrap_or(DEEPSEEK_CHAT);

    OpenAiClient::new(Some(DEEPSEEK_BASE_URL), model, Some(api_key.as_str()))
}
