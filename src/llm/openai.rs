//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{CompletionRequest, LlmClient, LlmError};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时组装 system + user 两条消息并取首条 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }

    fn to_openai_messages(
        &self,
        request: &CompletionRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(request.system.clone())
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(request.prompt.clone())
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;
        Ok(vec![
            ChatCompletionRequestMessage::System(system),
            ChatCompletionRequestMessage::User(user),
        ])
    }
}

/// 将 SDK 错误文本映射为 LlmError；限流与超时单独区分以便切换备用模型
pub(crate) fn classify_api_error(message: &str) -> LlmError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("quota") {
        LlmError::RateLimited {
            retry_after_ms: None,
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LlmError::Timeout
    } else {
        LlmError::Api(message.to_string())
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model_name(&self) -> String {
        self.model.clone()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(request)?)
            .temperature(request.temperature)
            .seed(request.seed)
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(body)
            .await
            .map_err(|e| classify_api_error(&e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::Api("empty completion".to_string()))
    }

    fn token_usage(&self) -> (u64, u64) {
        self.usage.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_accumulates() {
        let client = OpenAiClient::new(Some("http://localhost:1"), "gpt-test", Some("sk-test"));
        client.usage.add(120, 30);
        client.usage.add(80, 20);
        assert_eq!(client.token_usage(), (200, 50));
    }

    #[test]
    fn test_classify_api_error() {
        assert!(matches!(
            classify_api_error("HTTP 429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_api_error("You exceeded your current quota"),
            LlmError::RateLimited { .. }
        ));
        assert_eq!(classify_api_error("operation timed out"), LlmError::Timeout);
        assert!(matches!(classify_api_error("invalid model"), LlmError::Api(_)));
    }
}
