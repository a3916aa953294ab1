//! 根因解析
//!
//! 每个失败每轮只发起一次推理调用，使用固定 seed 与本轮温度；服务报错、限流或超时都软失败为 Unavailable。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::heal::prompts;
use crate::heal::types::{Failure, RootCause};
use crate::llm::{CompletionRequest, LlmClient, LlmError};
use crate::observability;
use crate::workspace::Snapshot;

/// 根因解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Explained(RootCause),
    /// 没有可用解释（软失败，本轮跳过该失败）
    Unavailable(LlmError),
}

#[derive(Debug, Deserialize)]
struct RootCauseReply {
    explanation: String,
    #[serde(default)]
    implicated_files: Vec<String>,
    #[serde(default)]
    root_cause_line: Option<u32>,
}

pub struct RootCauseResolver {
    llm: Arc<dyn LlmClient>,
    seed: i64,
    timeout: Duration,
    window_lines: usize,
    max_chars: usize,
}

impl RootCauseResolver {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        seed: i64,
        timeout: Duration,
        window_lines: usize,
        max_chars: usize,
    ) -> Self {
        Self {
            llm,
            seed,
            timeout,
            window_lines,
            max_chars,
        }
    }

    /// 为失败取源码窗口并请求根因解释
    pub async fn resolve(
        &self,
        snapshot: &Snapshot,
        failure: &Failure,
        temperature: f32,
    ) -> ResolveOutcome {
        let context = snapshot
            .source_window(&failure.file_path, failure.line, self.window_lines)
            .unwrap_or_else(|_| "(source not available)".to_string());
        let request = CompletionRequest {
            system: prompts::ROOT_CAUSE_SYSTEM.to_string(),
            prompt: prompts::root_cause_prompt(failure, &context, self.max_chars),
            temperature,
            seed: self.seed,
        };

        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.llm.complete(&request)).await {
            Ok(r) => r,
            Err(_) => Err(LlmError::Timeout),
        };
        let outcome = if result.is_ok() { "ok" } else { "error" };
        observability::audit(
            "reasoning_audit",
            "root_cause",
            outcome,
            start.elapsed().as_millis() as u64,
        );

        match result {
            Ok(text) => ResolveOutcome::Explained(parse_root_cause(&text, failure)),
            Err(e) => {
                tracing::warn!(fingerprint = %failure.fingerprint.short(), error = %e, "root cause unavailable");
                ResolveOutcome::Unavailable(e)
            }
        }
    }
}

/// 解析回复：优先 JSON（允许包在代码块或前后有文字），否则整段文本作为解释
pub fn parse_root_cause(text: &str, failure: &Failure) -> RootCause {
    let parsed = extract_json_object(text)
        .and_then(|json| serde_json::from_str::<RootCauseReply>(json).ok());
    let mut cause = match parsed {
        Some(reply) => RootCause {
            explanation: reply.explanation,
            implicated_files: reply.implicated_files,
            line: reply.root_cause_line,
        },
        None => RootCause {
            explanation: text.trim().to_string(),
            implicated_files: Vec::new(),
            line: None,
        },
    };
    if cause.implicated_files.is_empty() {
        cause.implicated_files.push(failure.file_path.clone());
    }
    if cause.line.is_none() {
        cause.line = failure.line;
    }
    cause
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heal::types::FailureKind;
    use crate::llm::MockLlmClient;

    fn failure() -> Failure {
        Failure::new(FailureKind::Runtime, "app/a.py", Some(3), "ZeroDivisionError")
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = "Here you go:\n```json\n{\"explanation\": \"divides by zero when n=0\", \"implicated_files\": [\"app/a.py\", \"app/b.py\"], \"root_cause_line\": 7}\n```";
        let cause = parse_root_cause(text, &failure());
        assert_eq!(cause.explanation, "divides by zero when n=0");
        assert_eq!(cause.implicated_files.len(), 2);
        assert_eq!(cause.line, Some(7));
    }

    #[test]
    fn test_parse_plain_text_falls_back() {
        let cause = parse_root_cause("n is zero", &failure());
        assert_eq!(cause.explanation, "n is zero");
        assert_eq!(cause.implicated_files, vec!["app/a.py".to_string()]);
        assert_eq!(cause.line, Some(3));
    }

    #[tokio::test]
    async fn test_resolve_soft_fails_on_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let snap = Snapshot::open(dir.path()).unwrap();
        let llm = Arc::new(MockLlmClient::new());
        llm.push_err(LlmError::RateLimited {
            retry_after_ms: Some(500),
        });
        let resolver = RootCauseResolver::new(llm.clone(), 42, Duration::from_secs(1), 15, 12000);
        let outcome = resolver.resolve(&snap, &failure(), 0.2).await;
        assert!(matches!(
            outcome,
            ResolveOutcome::Unavailable(LlmError::RateLimited { .. })
        ));
        // 恰好一次调用，且带固定 seed 与温度
        let reqs = llm.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].seed, 42);
        assert!((reqs[0].temperature - 0.2).abs() < f32::EPSILON);
        assert!(reqs[0].prompt.contains("(source not available)"));
    }

    #[tokio::test]
    async fn test_resolve_includes_source_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/a.py"), "def f(n):\n    x = 1\n    return 10 / n\n").unwrap();
        let snap = Snapshot::open(dir.path()).unwrap();
        let llm = Arc::new(MockLlmClient::new());
        llm.push_ok(r#"{"explanation": "no guard for n == 0"}"#);
        let resolver = RootCauseResolver::new(llm.clone(), 42, Duration::from_secs(1), 15, 12000);
        match resolver.resolve(&snap, &failure(), 0.15).await {
            ResolveOutcome::Explained(cause) => {
                assert_eq!(cause.explanation, "no guard for n == 0");
                assert_eq!(cause.implicated_files, vec!["app/a.py".to_string()]);
            }
            other => panic!("Expected Explained, got {other:?}"),
        }
        assert!(llm.requests()[0].prompt.contains("return 10 / n"));
    }
}
