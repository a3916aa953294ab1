//! 主备模型路由
//!
//! 默认走主模型；主模型限流或超时后永久切换到备用模型（本 Run 内不再切回），
//! 并记录 fallback_triggered 供结果记录的 llm_usage 使用。没有备用模型时直接把错误交给调用方软失败。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{CompletionRequest, LlmClient, LlmError};

/// 主备路由客户端
pub struct FallbackRouter {
    primary: Arc<dyn LlmClient>,
    fallback: Option<Arc<dyn LlmClient>>,
    switched: AtomicBool,
}

impl FallbackRouter {
    pub fn new(primary: Arc<dyn LlmClient>, fallback: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            primary,
            fallback,
            switched: AtomicBool::new(false),
        }
    }

    pub fn primary_model(&self) -> String {
        self.primary.model_name()
    }

    pub fn fallback_model(&self) -> Option<String> {
        self.fallback.as_ref().map(|f| f.model_name())
    }

    /// 是否已经切换到备用模型
    pub fn fallback_triggered(&self) -> bool {
        self.switched.load(Ordering::SeqCst)
    }

    /// 回到主模型；每个 Run 开始时调用
    pub fn reset(&self) {
        self.switched.store(false, Ordering::SeqCst);
    }

    fn active(&self) -> &Arc<dyn LlmClient> {
        match (&self.fallback, self.fallback_triggered()) {
            (Some(fallback), true) => fallback,
            _ => &self.primary,
        }
    }
}

#[async_trait]
impl LlmClient for FallbackRouter {
    fn model_name(&self) -> String {
        self.active().model_name()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        if self.fallback_triggered() {
            return self.active().complete(request).await;
        }
        match self.primary.complete(request).await {
            Ok(text) => Ok(text),
            Err(e) if e.triggers_fallback() => {
                let Some(fallback) = &self.fallback else {
                    return Err(e);
                };
                self.switched.store(true, Ordering::SeqCst);
                tracing::warn!(
                    primary = %self.primary.model_name(),
                    fallback = %fallback.model_name(),
                    error = %e,
                    "primary model unavailable, switching to fallback"
                );
                fallback.complete(request).await
            }
            Err(e) => Err(e),
        }
    }

    fn token_usage(&self) -> (u64, u64) {
        let (p, c) = self.primary.token_usage();
        let (fp, fc) = self.fallback.as_ref().map(|f| f.token_usage()).unwrap_or_default();
        (p + fp, c + fc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "sys".to_string(),
            prompt: "fix it".to_string(),
            temperature: 0.2,
            seed: 42,
        }
    }

    #[tokio::test]
    async fn test_router_switches_on_rate_limit() {
        let primary = Arc::new(MockLlmClient::named("primary"));
        primary.push_err(LlmError::RateLimited {
            retry_after_ms: None,
        });
        let fallback = Arc::new(MockLlmClient::named("backup"));
        fallback.push_ok("from backup");
        fallback.push_ok("second from backup");

        let router = FallbackRouter::new(primary.clone(), Some(fallback.clone()));
        assert!(!router.fallback_triggered());
        assert_eq!(router.complete(&request()).await.unwrap(), "from backup");
        assert!(router.fallback_triggered());
        assert_eq!(router.model_name(), "backup");

        // 切换后不再访问主模型
        assert_eq!(
            router.complete(&request()).await.unwrap(),
            "second from backup"
        );
        assert_eq!(primary.requests().len(), 1);
        assert_eq!(fallback.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_returns_to_primary() {
        let primary = Arc::new(MockLlmClient::named("primary"));
        primary.push_err(LlmError::Timeout);
        primary.push_ok("primary again");
        let fallback = Arc::new(MockLlmClient::named("backup"));
        fallback.push_ok("from backup");

        let router = FallbackRouter::new(primary.clone(), Some(fallback));
        assert_eq!(router.complete(&request()).await.unwrap(), "from backup");
        assert!(router.fallback_triggered());

        router.reset();
        assert!(!router.fallback_triggered());
        assert_eq!(router.model_name(), "primary");
        assert_eq!(router.complete(&request()).await.unwrap(), "primary again");
        assert_eq!(primary.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_router_without_fallback_propagates() {
        let primary = Arc::new(MockLlmClient::named("primary"));
        primary.push_err(LlmError::Timeout);
        let router = FallbackRouter::new(primary, None);
        assert_eq!(router.complete(&request()).await, Err(LlmError::Timeout));
        assert!(!router.fallback_triggered());
        assert_eq!(router.fallback_model(), None);
    }

    #[tokio::test]
    async fn test_router_api_error_does_not_switch() {
        let primary = Arc::new(MockLlmClient::named("primary"));
        primary.push_err(LlmError::Api("bad request".to_string()));
        let fallback = Arc::new(MockLlmClient::named("backup"));
        let router = FallbackRouter::new(primary, Some(fallback.clone()));
        assert!(router.complete(&request()).await.is_err());
        assert!(!router.fallback_triggered());
        assert!(fallback.requests().is_empty());
    }
}
