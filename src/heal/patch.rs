//! 补丁生成
//!
//! 请求推理服务给出 unified diff，解析后在内存中应用并做单文件语法校验，
//! 不合格的候选不会进入验证器。同一根因每轮最多重问一次。

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{HealError, RecoveryAction, RecoveryEngine};
use crate::heal::diff::{apply_diff, extract_diff, parse_unified_diff};
use crate::heal::prompts;
use crate::heal::syntax::{check_syntax, is_supported};
use crate::heal::types::{CandidatePatch, Failure, RootCause};
use crate::llm::{CompletionRequest, LlmClient, LlmError};
use crate::observability;
use crate::workspace::Snapshot;

pub struct PatchGenerator {
    llm: Arc<dyn LlmClient>,
    recovery: RecoveryEngine,
    seed: i64,
    timeout: Duration,
    max_lines: usize,
    max_chars: usize,
}

impl PatchGenerator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        seed: i64,
        timeout: Duration,
        max_lines: usize,
        max_chars: usize,
    ) -> Self {
        Self {
            llm,
            recovery: RecoveryEngine::new(),
            seed,
            timeout,
            max_lines,
            max_chars,
        }
    }

    /// 生成一个通过语法校验的候选补丁；格式错误时按恢复策略重问一次
    pub async fn propose(
        &self,
        snapshot: &Snapshot,
        failure: &Failure,
        cause: &RootCause,
        temperature: f32,
    ) -> Result<CandidatePatch, HealError> {
        let mut feedback: Option<String> = None;
        loop {
            match self
                .attempt(snapshot, failure, cause, temperature, feedback.as_deref())
                .await
            {
                Ok(candidate) => return Ok(candidate),
                Err(e) => match self.recovery.handle(&e, feedback.is_some()) {
                    RecoveryAction::ReAsk(msg) => {
                        tracing::info!(fingerprint = %failure.fingerprint.short(), error = %e, "re-asking for patch");
                        feedback = Some(msg);
                    }
                    _ => return Err(e),
                },
            }
        }
    }

    async fn attempt(
        &self,
        snapshot: &Snapshot,
        failure: &Failure,
        cause: &RootCause,
        temperature: f32,
        feedback: Option<&str>,
    ) -> Result<CandidatePatch, HealError> {
        let file = primary_file(snapshot, failure, cause)
            .ok_or_else(|| HealError::malformed("no implicated file exists in the repository"))?;
        let source = snapshot
            .read(&file)
            .map_err(|e| HealError::malformed(format!("cannot read {file}: {e}")))?;

        let request = CompletionRequest {
            system: prompts::PATCH_SYSTEM.to_string(),
            prompt: prompts::patch_prompt(failure, cause, &file, &source, self.max_chars, feedback),
            temperature,
            seed: self.seed,
        };
        let start = Instant::now();
        let reply = match tokio::time::timeout(self.timeout, self.llm.complete(&request)).await {
            Ok(r) => r,
            Err(_) => Err(LlmError::Timeout),
        };
        observability::audit(
            "reasoning_audit",
            "patch",
            if reply.is_ok() { "ok" } else { "error" },
            start.elapsed().as_millis() as u64,
        );
        let reply = reply?;

        self.build_candidate(snapshot, &reply)
    }

    /// 从回复构造候选：取 diff、解析、检查大小、内存应用、语法校验
    pub fn build_candidate(
        &self,
        snapshot: &Snapshot,
        reply: &str,
    ) -> Result<CandidatePatch, HealError> {
        let diff_text = extract_diff(reply).map_err(|e| HealError::malformed(e.to_string()))?;
        let diff = parse_unified_diff(&diff_text).map_err(|e| HealError::malformed(e.to_string()))?;

        let changed = diff.changed_lines();
        if changed > self.max_lines {
            return Err(HealError::malformed(format!(
                "diff changes {changed} lines, limit is {}",
                self.max_lines
            )));
        }

        let file_path = snapshot.relativize(diff.target_path());
        snapshot
            .resolve(&file_path)
            .map_err(|e| HealError::malformed(e.to_string()))?;
        let original = snapshot
            .read(&file_path)
            .map_err(|e| HealError::malformed(format!("cannot read {file_path}: {e}")))?;
        let patched = apply_diff(&original, &diff).map_err(|e| HealError::malformed(e.to_string()))?;
        if patched == original {
            return Err(HealError::malformed("diff makes no change"));
        }
        if !is_supported(&file_path) {
            tracing::debug!(file = %file_path, "no grammar for file, syntax check skipped");
        }
        check_syntax(&file_path, &patched).map_err(HealError::PatchMalformed)?;

        Ok(CandidatePatch {
            file_path,
            diff: diff_text,
            original,
            patched,
        })
    }
}

/// 选取要修改的文件：根因给出的第一个存在的文件，否则失败所在文件
fn primary_file(snapshot: &Snapshot, failure: &Failure, cause: &RootCause) -> Option<String> {
    cause
        .implicated_files
        .iter()
        .map(|f| snapshot.relativize(f))
        .chain(std::iter::once(snapshot.relativize(&failure.file_path)))
        .find(|f| snapshot.exists(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heal::types::FailureKind;
    use crate::llm::MockLlmClient;

    const GOOD: &str = "```diff
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
-def add(a, b)
+def add(a, b):
     return a + b
```";

    const BROKEN: &str = "```diff
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
-def add(a, b)
+def add(a, b:
     return a + b
```";

    fn setup() -> (tempfile::TempDir, Snapshot, Failure, RootCause) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calc.py"), "def add(a, b)\n    return a + b\n").unwrap();
        let snap = Snapshot::open(dir.path()).unwrap();
        let failure = Failure::new(FailureKind::Syntax, "calc.py", Some(1), "SyntaxError: expected ':'");
        let cause = RootCause {
            explanation: "missing colon".to_string(),
            implicated_files: vec!["calc.py".to_string()],
            line: Some(1),
        };
        (dir, snap, failure, cause)
    }

    #[tokio::test]
    async fn test_propose_valid_patch() {
        let (_dir, snap, failure, cause) = setup();
        let llm = Arc::new(MockLlmClient::new());
        llm.push_ok(GOOD);
        let gen = PatchGenerator::new(llm, 42, Duration::from_secs(1), 50, 12000);
        let candidate = gen.propose(&snap, &failure, &cause, 0.2).await.unwrap();
        assert_eq!(candidate.file_path, "calc.py");
        assert_eq!(candidate.patched, "def add(a, b):\n    return a + b\n");
        // 只在内存中应用，磁盘未变
        assert_eq!(snap.read("calc.py").unwrap(), "def add(a, b)\n    return a + b\n");
    }

    #[tokio::test]
    async fn test_broken_diff_reasks_once() {
        let (_dir, snap, failure, cause) = setup();
        let llm = Arc::new(MockLlmClient::new());
        llm.push_ok(BROKEN);
        llm.push_ok(GOOD);
        let gen = PatchGenerator::new(llm.clone(), 42, Duration::from_secs(1), 50, 12000);
        assert!(gen.propose(&snap, &failure, &cause, 0.2).await.is_ok());
        let reqs = llm.requests();
        assert_eq!(reqs.len(), 2);
        assert!(reqs[1].prompt.contains("does not parse"));
    }

    #[tokio::test]
    async fn test_second_malformed_gives_up() {
        let (_dir, snap, failure, cause) = setup();
        let llm = Arc::new(MockLlmClient::new());
        llm.push_ok(BROKEN);
        llm.push_ok("no diff here");
        llm.push_ok(GOOD);
        let gen = PatchGenerator::new(llm.clone(), 42, Duration::from_secs(1), 50, 12000);
        let err = gen.propose(&snap, &failure, &cause, 0.2).await.unwrap_err();
        assert!(matches!(err, HealError::PatchMalformed(_)));
        assert_eq!(llm.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_reasoning_unavailable_is_not_reasked() {
        let (_dir, snap, failure, cause) = setup();
        let llm = Arc::new(MockLlmClient::new());
        llm.push_err(LlmError::Timeout);
        let gen = PatchGenerator::new(llm.clone(), 42, Duration::from_secs(1), 50, 12000);
        let err = gen.propose(&snap, &failure, &cause, 0.2).await.unwrap_err();
        assert!(matches!(err, HealError::ReasoningUnavailable(LlmError::Timeout)));
        assert_eq!(llm.requests().len(), 1);
    }

    #[test]
    fn test_size_cap() {
        let (_dir, snap, _failure, _cause) = setup();
        let gen = PatchGenerator::new(Arc::new(MockLlmClient::new()), 42, Duration::from_secs(1), 1, 12000);
        let err = gen.build_candidate(&snap, GOOD).unwrap_err();
        assert!(err.to_string().contains("limit is 1"));
    }
}
