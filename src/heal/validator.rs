//! 补丁验证：原子落盘、重跑测试、接受或回滚
//!
//! 接受条件：目标失败的指纹不再出现，且基线中通过的测试没有一个变为失败（或消失）。
//! 新暴露出的既有缺陷不阻止接受（语法修复后尤其常见），只是重新入队。
//! 拒绝时把文件恢复为补丁前的原始字节。
//! 打上补丁后测试运行超时同样回滚，但只算软失败，不记为回归。

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::HealError;
use crate::heal::classifier::FailureClassifier;
use crate::heal::commit::commit_message;
use crate::heal::types::{CandidatePatch, Failure, Fix};
use crate::runner::{TestReport, TestRunner};
use crate::sandbox::SandboxError;
use crate::workspace::{atomic_write, Snapshot};

/// 当前工作树状态：最近一次测试报告及其分类结果
#[derive(Debug, Clone, Default)]
pub struct Baseline {
    pub report: TestReport,
    pub failures: Vec<Failure>,
}

impl Baseline {
    pub fn contains(&self, failure: &Failure) -> bool {
        self.failures.iter().any(|f| f.fingerprint == failure.fingerprint)
    }
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Accepted {
        fix: Fix,
        /// 补丁应用后的新基线
        baseline: Baseline,
        /// 补丁前不存在、补丁后出现的失败
        exposed: Vec<Failure>,
        /// 语法类修复暴露了此前被遮蔽的失败
        syntax_masked: bool,
    },
    Rejected {
        fix: Fix,
        reason: String,
    },
    /// 补丁已撤回但没有结论（测试运行超时），本轮跳过
    Inconclusive { reason: String },
}

pub struct Validator {
    runner: Arc<dyn TestRunner>,
    classifier: Arc<FailureClassifier>,
    commit_prefix: String,
}

impl Validator {
    pub fn new(
        runner: Arc<dyn TestRunner>,
        classifier: Arc<FailureClassifier>,
        commit_prefix: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            classifier,
            commit_prefix: commit_prefix.into(),
        }
    }

    pub async fn validate(
        &self,
        snapshot: &Snapshot,
        failure: &Failure,
        candidate: &CandidatePatch,
        baseline: &Baseline,
        iteration: u32,
        temperature: f32,
    ) -> Result<Verdict, HealError> {
        let target = snapshot
            .resolve(&candidate.file_path)
            .map_err(|e| HealError::malformed(e.to_string()))?;
        let original_bytes = std::fs::read(&target)?;

        atomic_write(&target, candidate.patched.as_bytes())?;

        let report = match self.runner.run(snapshot).await {
            Ok(report) => report,
            Err(SandboxError::Timeout(secs)) => {
                self.restore(&target, &original_bytes)?;
                tracing::warn!(
                    file = %candidate.file_path,
                    fingerprint = %failure.fingerprint.short(),
                    secs,
                    "test run timed out, patch withdrawn"
                );
                return Ok(Verdict::Inconclusive {
                    reason: format!("test run timed out after {secs}s with the patch applied"),
                });
            }
            Err(e) => {
                self.restore(&target, &original_bytes)?;
                return Err(e.into());
            }
        };

        let failures = self.classifier.classify_report(&report, temperature).await;
        let target_gone = !failures.iter().any(|f| f.fingerprint == failure.fingerprint);
        let regressions = regressions(&baseline.report, &report);

        if target_gone && regressions.is_empty() {
            let exposed: Vec<Failure> = failures
                .iter()
                .filter(|f| !baseline.contains(f))
                .cloned()
                .collect();
            let syntax_masked = failure.kind.is_syntactic() && !exposed.is_empty();
            tracing::info!(
                file = %candidate.file_path,
                fingerprint = %failure.fingerprint.short(),
                exposed = exposed.len(),
                syntax_masked,
                "patch accepted"
            );
            return Ok(Verdict::Accepted {
                fix: self.make_fix(failure, candidate, true, iteration),
                baseline: Baseline { report, failures },
                exposed,
                syntax_masked,
            });
        }

        self.restore(&target, &original_bytes)?;
        let reason = if regressions.is_empty() {
            "targeted failure still present after patch".to_string()
        } else {
            format!("previously passing tests now fail: {}", regressions.join(", "))
        };
        tracing::info!(
            file = %candidate.file_path,
            fingerprint = %failure.fingerprint.short(),
            reason = %reason,
            "patch rolled back"
        );
        Ok(Verdict::Rejected {
            fix: self.make_fix(failure, candidate, false, iteration),
            reason,
        })
    }

    fn restore(&self, target: &std::path::Path, original: &[u8]) -> Result<(), HealError> {
        atomic_write(target, original).map_err(|e| {
            HealError::infrastructure(format!("rollback of {} failed: {e}", target.display()))
        })
    }

    fn make_fix(
        &self,
        failure: &Failure,
        candidate: &CandidatePatch,
        tests_passed: bool,
        iteration: u32,
    ) -> Fix {
        let (start, original_snippet, patched_snippet) =
            changed_region(&candidate.original, &candidate.patched);
        Fix {
            fingerprint: failure.fingerprint.clone(),
            kind: failure.kind,
            file_path: candidate.file_path.clone(),
            line_number: failure.line.or(Some(start)),
            original_snippet,
            patched_snippet,
            tests_passed,
            commit_message: commit_message(&self.commit_prefix, failure.kind, &candidate.file_path),
            iteration,
        }
    }
}

/// 基线中通过、现在未通过（失败或消失）的测试
fn regressions(before: &TestReport, after: &TestReport) -> Vec<String> {
    let now: BTreeSet<&str> = after.passing();
    before
        .passing()
        .into_iter()
        .filter(|name| !now.contains(name))
        .map(str::to_string)
        .collect()
}

/// 原文与补丁后内容的最小差异区间：(起始行号, 原片段, 新片段)
fn changed_region(original: &str, patched: &str) -> (u32, String, String) {
    let old: Vec<&str> = original.lines().collect();
    let new: Vec<&str> = patched.lines().collect();
    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();
    (
        prefix as u32 + 1,
        old[prefix..old.len() - suffix].join("\n"),
        new[prefix..new.len() - suffix].join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heal::types::FailureKind;
    use crate::llm::MockLlmClient;
    use crate::runner::{Diagnostic, TestCase};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// 依次返回预设报告的测试执行器
    struct ScriptedRunner(Mutex<Vec<Result<TestReport, SandboxError>>>);

    #[async_trait]
    impl TestRunner for ScriptedRunner {
        async fn run(&self, _snapshot: &Snapshot) -> Result<TestReport, SandboxError> {
            self.0.lock().unwrap().remove(0)
        }
    }

    fn report(passing: &[&str], diags: &[&str]) -> TestReport {
        TestReport {
            exit_code: if diags.is_empty() { 0 } else { 1 },
            cases: passing
                .iter()
                .map(|n| TestCase {
                    name: n.to_string(),
                    passed: true,
                })
                .collect(),
            diagnostics: diags.iter().map(|d| Diagnostic::new(*d).at("calc.py", Some(1))).collect(),
            raw_output: String::new(),
        }
    }

    fn setup(
        runs: Vec<Result<TestReport, SandboxError>>,
    ) -> (tempfile::TempDir, Snapshot, Validator) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calc.py"), "def add(a, b)\n    return a + b\n").unwrap();
        let snap = Snapshot::open(dir.path()).unwrap();
        let classifier = Arc::new(FailureClassifier::new(
            Arc::new(MockLlmClient::new()),
            42,
            Duration::from_secs(1),
        ));
        let validator = Validator::new(Arc::new(ScriptedRunner(Mutex::new(runs))), classifier, "[AI-AGENT]");
        (dir, snap, validator)
    }

    fn candidate() -> CandidatePatch {
        CandidatePatch {
            file_path: "calc.py".to_string(),
            diff: String::new(),
            original: "def add(a, b)\n    return a + b\n".to_string(),
            patched: "def add(a, b):\n    return a + b\n".to_string(),
        }
    }

    fn syntax_failure() -> Failure {
        Failure::new(FailureKind::Syntax, "calc.py", Some(1), "SyntaxError: expected ':'")
    }

    fn baseline() -> Baseline {
        Baseline {
            report: report(&["test_other"], &["SyntaxError: expected ':'"]),
            failures: vec![syntax_failure()],
        }
    }

    #[tokio::test]
    async fn test_accept_with_syntax_masking() {
        let after = report(&["test_other", "test_add"], &["AssertionError: assert 3 == 4"]);
        let (_dir, snap, validator) = setup(vec![Ok(after)]);
        let verdict = validator
            .validate(&snap, &syntax_failure(), &candidate(), &baseline(), 1, 0.2)
            .await
            .unwrap();
        match verdict {
            Verdict::Accepted { fix, exposed, syntax_masked, .. } => {
                assert!(fix.tests_passed);
                assert_eq!(fix.commit_message, "[AI-AGENT] Fix SYNTAX in calc.py");
                assert_eq!(fix.original_snippet, "def add(a, b)");
                assert_eq!(fix.patched_snippet, "def add(a, b):");
                assert_eq!(exposed.len(), 1);
                assert!(syntax_masked);
            }
            other => panic!("Expected Accepted, got {other:?}"),
        }
        assert_eq!(snap.read("calc.py").unwrap(), candidate().patched);
    }

    #[tokio::test]
    async fn test_regression_rolls_back_exactly() {
        // 目标消失，但 test_other 变为失败
        let after = report(&[], &[]);
        let (_dir, snap, validator) = setup(vec![Ok(after)]);
        let verdict = validator
            .validate(&snap, &syntax_failure(), &candidate(), &baseline(), 2, 0.2)
            .await
            .unwrap();
        match verdict {
            Verdict::Rejected { fix, reason } => {
                assert!(!fix.tests_passed);
                assert_eq!(fix.iteration, 2);
                assert!(reason.contains("test_other"));
            }
            other => panic!("Expected Rejected, got {other:?}"),
        }
        assert_eq!(snap.read("calc.py").unwrap(), candidate().original);
    }

    #[tokio::test]
    async fn test_target_still_present_rejected() {
        let after = report(&["test_other"], &["SyntaxError: expected ':'"]);
        let (_dir, snap, validator) = setup(vec![Ok(after)]);
        let verdict = validator
            .validate(&snap, &syntax_failure(), &candidate(), &baseline(), 1, 0.2)
            .await
            .unwrap();
        assert!(matches!(verdict, Verdict::Rejected { .. }));
        assert_eq!(snap.read("calc.py").unwrap(), candidate().original);
    }

    #[tokio::test]
    async fn test_unchanged_escalated_diagnostic_is_not_accepted() {
        // 快速签名不认识的诊断：基线分类走推理，补丁后同一诊断原样出现
        let text = "result differs from expectation";
        let llm = Arc::new(MockLlmClient::new());
        llm.push_ok("RUNTIME");
        let classifier = Arc::new(FailureClassifier::new(llm.clone(), 42, Duration::from_secs(1)));
        let before = report(&["test_other"], &[text]);
        let failures = classifier.classify_report(&before, 0.2).await;
        assert_eq!(failures[0].kind, FailureKind::Runtime);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calc.py"), candidate().original).unwrap();
        let snap = Snapshot::open(dir.path()).unwrap();
        let runner = ScriptedRunner(Mutex::new(vec![Ok(report(&["test_other"], &[text]))]));
        let validator = Validator::new(Arc::new(runner), classifier, "[AI-AGENT]");
        let baseline = Baseline {
            report: before,
            failures: failures.clone(),
        };

        let verdict = validator
            .validate(&snap, &failures[0], &candidate(), &baseline, 1, 0.05)
            .await
            .unwrap();
        match verdict {
            Verdict::Rejected { reason, .. } => assert!(reason.contains("still present")),
            other => panic!("Expected Rejected, got {other:?}"),
        }
        assert_eq!(snap.read("calc.py").unwrap(), candidate().original);
        assert_eq!(llm.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_withdraws_patch_without_verdict() {
        let (_dir, snap, validator) = setup(vec![Err(SandboxError::Timeout(120))]);
        let verdict = validator
            .validate(&snap, &syntax_failure(), &candidate(), &baseline(), 1, 0.2)
            .await
            .unwrap();
        match verdict {
            Verdict::Inconclusive { reason } => assert!(reason.contains("timed out after 120s")),
            other => panic!("Expected Inconclusive, got {other:?}"),
        }
        assert_eq!(snap.read("calc.py").unwrap(), candidate().original);
    }

    #[tokio::test]
    async fn test_runner_fault_rolls_back_then_fails() {
        let (_dir, snap, validator) =
            setup(vec![Err(SandboxError::Spawn("python: not found".to_string()))]);
        let err = validator
            .validate(&snap, &syntax_failure(), &candidate(), &baseline(), 1, 0.2)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(snap.read("calc.py").unwrap(), candidate().original);
    }

    #[test]
    fn test_changed_region() {
        let (line, old, new) = changed_region("a\nb\nc\nd\n", "a\nB\nC\nd\n");
        assert_eq!(line, 2);
        assert_eq!(old, "b\nc");
        assert_eq!(new, "B\nC");
        let (line, old, new) = changed_region("a\n", "a\nb\n");
        assert_eq!((line, old.as_str(), new.as_str()), (2, "", "b"));
    }
}
