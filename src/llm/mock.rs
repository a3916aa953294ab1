//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预先排好的回复；队列为空时返回 Unavailable，便于走软失败路径。
//! 记录收到的每个请求，测试可断言 temperature / seed 等参数。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{CompletionRequest, LlmClient, LlmError};

/// 脚本化 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    name: String,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    seen: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn push_ok(&self, text: impl Into<String>) {
        if let Ok(mut q) = self.script.lock() {
            q.push_back(Ok(text.into()));
        }
    }

    pub fn push_err(&self, err: LlmError) {
        if let Ok(mut q) = self.script.lock() {
            q.push_back(Err(err));
        }
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model_name(&self) -> String {
        self.name.clone()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Err(LlmError::Unavailable("mock script exhausted".to_string())))
    }
}
