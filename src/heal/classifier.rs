//! 失败分类器
//!
//! 两级分类：
//! 1. 快速签名：对诊断文本做确定性正则匹配（无外部调用、无随机），命中多个种类时按 FailureKind 优先级取最前者；
//! 2. 全部未命中时返回 ClassificationAmbiguous，升级为一次推理分类，回复无法解析或服务不可用时记为 LOGIC。
//!
//! 升级结果按 (文件, 归一化诊断) 在分类器内记忆：同一诊断在一次 Run 内始终得到同一种类和同一指纹。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;

use crate::core::HealError;
use crate::heal::prompts;
use crate::heal::types::{normalize_diagnostic, Failure, FailureKind};
use crate::llm::{CompletionRequest, LlmClient};
use crate::runner::{Diagnostic, TestReport};

/// 快速签名表（Python / JS / TS / Java / Rust / 通用 lint）
const SIGNATURES: &[(FailureKind, &str)] = &[
    // 语法
    (FailureKind::Syntax, r"SyntaxError"),
    (FailureKind::Syntax, r"Unexpected token"),
    (FailureKind::Syntax, r"Cannot use import statement outside a module"),
    (FailureKind::Syntax, r"\.java:\d+: error: (?:';' expected|class, interface|illegal start|reached end of file)"),
    (FailureKind::Syntax, r"\[ERROR\].+\.java:\[\d+,\d+\]"),
    (FailureKind::Syntax, r"error: expected .+, found"),
    (FailureKind::Syntax, r"error: (?:this file contains an )?unclosed delimiter"),
    // 缩进
    (FailureKind::Indentation, r"IndentationError"),
    (FailureKind::Indentation, r"TabError"),
    (FailureKind::Indentation, r"(?i)unexpected indent|unindent does not match"),
    // 导入
    (FailureKind::Import, r"ModuleNotFoundError"),
    (FailureKind::Import, r"ImportError"),
    (FailureKind::Import, r"cannot import name"),
    (FailureKind::Import, r#"Cannot find module ['"]"#),
    (FailureKind::Import, r"Module not found: "),
    (FailureKind::Import, r"ERR_MODULE_NOT_FOUND"),
    (FailureKind::Import, r"cannot find symbol"),
    (FailureKind::Import, r"(?:ClassNotFoundException|NoClassDefFoundError)"),
    (FailureKind::Import, r"error\[E0432\]|error\[E0433\]|unresolved import"),
    // 类型
    (FailureKind::TypeError, r"TypeError"),
    (FailureKind::TypeError, r"is not a function"),
    (FailureKind::TypeError, r"Cannot (?:read|set) propert(?:y|ies) of (?:null|undefined)"),
    (FailureKind::TypeError, r"\bTS\d{4}\b"),
    (FailureKind::TypeError, r"ClassCastException|NullPointerException"),
    (FailureKind::TypeError, r"incompatible types"),
    (FailureKind::TypeError, r"error\[E0308\]|mismatched types"),
    // 运行时
    (FailureKind::Runtime, r"\b(?:RuntimeError|ValueError|AttributeError|KeyError|IndexError|NameError|ZeroDivisionError|RecursionError)\b"),
    (FailureKind::Runtime, r"ReferenceError: .+ is not defined"),
    (FailureKind::Runtime, r"RangeError"),
    (FailureKind::Runtime, r"UnhandledPromiseRejection"),
    (FailureKind::Runtime, r"Exception in thread .+: "),
    (FailureKind::Runtime, r"StackOverflowError|OutOfMemoryError|ArrayIndexOutOfBoundsException"),
    (FailureKind::Runtime, r"panicked at .+(?:unwrap|index out of bounds|divide by zero|overflow)"),
    // lint
    (FailureKind::Linting, r"(?m)^.+?:\d+:\d+: [A-Z]+\d+:? .+$"),
    (FailureKind::Linting, r"\b(?:no-unused-vars|no-undef|no-console|prefer-const|eqeqeq)\b"),
    (FailureKind::Linting, r"\b(?:W0611|W0612|C0114|C0116|E501|F401|F841)\b"),
    // 依赖
    (FailureKind::Dependency, r"pkg_resources\.DistributionNotFound"),
    (FailureKind::Dependency, r"Could not find a version that satisfies the requirement"),
    (FailureKind::Dependency, r"npm ERR! code ERESOLVE|peer dep(?:endency)? conflict"),
    (FailureKind::Dependency, r"failed to select a version for|no matching package named"),
    // 测试断言
    (FailureKind::TestFailure, r"AssertionError|AssertionFailedError"),
    (FailureKind::TestFailure, r"(?m)^E?\s*assert\s"),
    (FailureKind::TestFailure, r"Expected .+ to (?:equal|be|match|contain) .+"),
    (FailureKind::TestFailure, r"expect\(.+?\)\..+? failed|expect\(received\)"),
    (FailureKind::TestFailure, r"assertion `left == right` failed|assertion failed"),
    (FailureKind::TestFailure, r"FAILED: "),
];

/// 文件 + 行号定位（取最后一次匹配，通常是离错误最近的调用帧）
const LOCATIONS: &[&str] = &[
    r#"File ["'](.+?)["'], line (\d+)"#,
    r"(?m)^([^\s:][^:\n]*\.[A-Za-z]+):(\d+):",
    r"at .+\((.+\.java):(\d+)\)",
    r"at .+\((.+\.(?:js|ts|jsx|tsx|mjs|cjs)):(\d+):",
    r"panicked at ([^:\s]+\.rs):(\d+):",
    r"--> ([^:\s]+\.rs):(\d+):",
];

fn signatures() -> &'static [(FailureKind, Regex)] {
    static COMPILED: OnceLock<Vec<(FailureKind, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        SIGNATURES
            .iter()
            .filter_map(|(kind, pat)| Regex::new(pat).ok().map(|r| (*kind, r)))
            .collect()
    })
}

fn locations() -> &'static [Regex] {
    static COMPILED: OnceLock<Vec<Regex>> = OnceLock::new();
    COMPILED.get_or_init(|| LOCATIONS.iter().filter_map(|p| Regex::new(p).ok()).collect())
}

/// 快速分类：确定性、无外部调用；全部未命中返回 ClassificationAmbiguous
pub fn fast_classify(text: &str) -> Result<FailureKind, HealError> {
    signatures()
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(kind, _)| *kind)
        .min_by_key(FailureKind::priority)
        .ok_or_else(|| {
            let first = text.lines().next().unwrap_or_default();
            HealError::ClassificationAmbiguous(first.chars().take(120).collect())
        })
}

/// 从诊断文本中提取 (文件, 行号)
pub fn locate(text: &str) -> Option<(String, u32)> {
    for re in locations() {
        if let Some(c) = re.captures_iter(text).last() {
            if let Ok(line) = c[2].parse() {
                return Some((c[1].trim().to_string(), line));
            }
        }
    }
    None
}

/// 分类器：持有推理客户端，仅用于快速签名未命中的升级分类
///
/// 每个 Run 使用自己的实例，升级记忆随 Run 结束丢弃。
pub struct FailureClassifier {
    llm: Arc<dyn LlmClient>,
    seed: i64,
    timeout: Duration,
    escalated: Mutex<HashMap<(String, String), FailureKind>>,
}

impl FailureClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, seed: i64, timeout: Duration) -> Self {
        Self {
            llm,
            seed,
            timeout,
            escalated: Mutex::new(HashMap::new()),
        }
    }

    /// 分类单条诊断并生成 Failure（含指纹）
    pub async fn classify(&self, diag: &Diagnostic, temperature: f32) -> Failure {
        let (file, line) = match (diag.lint_rule.is_some(), locate(&diag.text)) {
            (false, Some((file, line))) => (file, Some(line)),
            _ => (
                diag.file_path.clone().unwrap_or_else(|| "<unknown>".to_string()),
                diag.line,
            ),
        };

        let kind = if diag.lint_rule.is_some() {
            FailureKind::Linting
        } else {
            match fast_classify(&diag.text) {
                Ok(kind) => kind,
                Err(e) => {
                    let key = (file.clone(), normalize_diagnostic(&diag.text));
                    match self.remembered(&key) {
                        Some(kind) => kind,
                        None => {
                            tracing::debug!(error = %e, "no fast signature matched, escalating");
                            let kind = self.escalate(diag, temperature).await;
                            self.remember(key, kind)
                        }
                    }
                }
            }
        };

        Failure::new(kind, file, line, diag.text.clone()).with_test(diag.test_name.clone())
    }

    fn remembered(&self, key: &(String, String)) -> Option<FailureKind> {
        self.escalated.lock().ok().and_then(|m| m.get(key).copied())
    }

    /// 记下升级结果；已有记录时以先到者为准
    fn remember(&self, key: (String, String), kind: FailureKind) -> FailureKind {
        match self.escalated.lock() {
            Ok(mut m) => *m.entry(key).or_insert(kind),
            Err(_) => kind,
        }
    }

    /// 分类整份报告；同一指纹只保留一次
    pub async fn classify_report(&self, report: &TestReport, temperature: f32) -> Vec<Failure> {
        let mut out: Vec<Failure> = Vec::new();
        for diag in &report.diagnostics {
            let failure = self.classify(diag, temperature).await;
            if !out.iter().any(|f| f.fingerprint == failure.fingerprint) {
                out.push(failure);
            }
        }
        out
    }

    async fn escalate(&self, diag: &Diagnostic, temperature: f32) -> FailureKind {
        let request = CompletionRequest {
            system: prompts::CLASSIFY_SYSTEM.to_string(),
            prompt: prompts::classify_prompt(&diag.text),
            temperature,
            seed: self.seed,
        };
        let reply = match tokio::time::timeout(self.timeout, self.llm.complete(&request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "escalated classification unavailable, using LOGIC");
                return FailureKind::Logic;
            }
            Err(_) => {
                tracing::warn!("escalated classification timed out, using LOGIC");
                return FailureKind::Logic;
            }
        };
        reply
            .split_whitespace()
            .find_map(|w| FailureKind::parse_label(w.trim_matches(|c: char| !c.is_alphanumeric() && c != '_')))
            .unwrap_or(FailureKind::Logic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_all_signatures_compile() {
        assert_eq!(signatures().len(), SIGNATURES.len());
        assert_eq!(locations().len(), LOCATIONS.len());
    }

    #[test]
    fn test_fast_tier_kinds() {
        let cases = [
            ("SyntaxError: invalid syntax", FailureKind::Syntax),
            ("IndentationError: unexpected indent", FailureKind::Indentation),
            ("ModuleNotFoundError: No module named 'numpy'", FailureKind::Import),
            ("Error: Cannot find module 'lodash'", FailureKind::Import),
            ("TypeError: unsupported operand type(s) for +: 'int' and 'str'", FailureKind::TypeError),
            ("src/a.ts(3,7): error TS2322: Type 'string' is not assignable", FailureKind::TypeError),
            ("ZeroDivisionError: division by zero", FailureKind::Runtime),
            ("app.py:3:80: E501 line too long (90 > 79 characters)", FailureKind::Linting),
            ("pkg_resources.DistributionNotFound: The 'foo' distribution was not found", FailureKind::Dependency),
            ("E       assert 4 == 2", FailureKind::TestFailure),
            ("error[E0308]: mismatched types", FailureKind::TypeError),
        ];
        for (text, expected) in cases {
            assert_eq!(fast_classify(text).unwrap(), expected, "{text}");
        }
    }

    #[test]
    fn test_tie_resolves_by_priority() {
        // 同时命中 SYNTAX 与 INDENTATION
        let text = "IndentationError: expected an indented block\nSyntaxError: invalid syntax";
        assert_eq!(fast_classify(text).unwrap(), FailureKind::Syntax);
        // 同时命中 IMPORT 与 TEST_FAILURE
        let text = "AssertionError\nImportError: cannot import name 'x'";
        assert_eq!(fast_classify(text).unwrap(), FailureKind::Import);
    }

    #[test]
    fn test_unmatched_is_ambiguous() {
        assert!(matches!(
            fast_classify("the output is just wrong somehow"),
            Err(HealError::ClassificationAmbiguous(_))
        ));
    }

    #[test]
    fn test_locate_prefers_last_frame() {
        let text = "  File \"tests/test_a.py\", line 10, in test_x\n  File \"app/a.py\", line 4, in f\nValueError";
        assert_eq!(locate(text), Some(("app/a.py".to_string(), 4)));
        assert_eq!(
            locate("tests/test_calc.py:7: AssertionError"),
            Some(("tests/test_calc.py".to_string(), 7))
        );
        assert_eq!(locate("nothing here"), None);
    }

    #[tokio::test]
    async fn test_fast_tier_makes_no_llm_call() {
        let llm = Arc::new(MockLlmClient::new());
        let classifier = FailureClassifier::new(llm.clone(), 42, Duration::from_secs(1));
        let diag = Diagnostic::new("  File \"app/a.py\", line 3\nSyntaxError: expected ':'");
        let f1 = classifier.classify(&diag, 0.2).await;
        let f2 = classifier.classify(&diag, 0.2).await;
        assert_eq!(f1.kind, FailureKind::Syntax);
        assert_eq!(f1.file_path, "app/a.py");
        assert_eq!(f1.line, Some(3));
        assert_eq!(f1.fingerprint, f2.fingerprint);
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_escalation_uses_label_or_logic() {
        let llm = Arc::new(MockLlmClient::new());
        llm.push_ok("RUNTIME");
        let classifier = FailureClassifier::new(llm.clone(), 42, Duration::from_secs(1));
        let diag = Diagnostic::new("result differs from expectation").at("app/a.py", Some(2));
        assert_eq!(classifier.classify(&diag, 0.2).await.kind, FailureKind::Runtime);
        assert_eq!(llm.requests()[0].seed, 42);

        // 脚本耗尽 -> Unavailable -> LOGIC
        let other = Diagnostic::new("output drifted from the golden file").at("app/b.py", Some(5));
        let f = classifier.classify(&other, 0.2).await;
        assert_eq!(f.kind, FailureKind::Logic);
        assert_eq!(f.file_path, "app/b.py");
    }

    #[tokio::test]
    async fn test_escalated_kind_is_remembered_per_diagnostic() {
        let llm = Arc::new(MockLlmClient::new());
        llm.push_ok("RUNTIME");
        llm.push_ok("TYPE_ERROR");
        let classifier = FailureClassifier::new(llm.clone(), 42, Duration::from_secs(1));
        let diag = Diagnostic::new("result differs from expectation").at("app/a.py", Some(2));

        let first = classifier.classify(&diag, 0.2).await;
        // 温度变化、模型给出不同标签都不影响已记住的种类
        let again = classifier.classify(&diag, 0.05).await;
        assert_eq!(first.kind, FailureKind::Runtime);
        assert_eq!(again.fingerprint, first.fingerprint);
        assert_eq!(llm.requests().len(), 1);

        // 同一文本出现在另一个文件里单独升级
        let elsewhere = Diagnostic::new("result differs from expectation").at("app/c.py", Some(2));
        assert_eq!(classifier.classify(&elsewhere, 0.2).await.kind, FailureKind::TypeError);
        assert_eq!(llm.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_lint_rule_short_circuits() {
        let llm = Arc::new(MockLlmClient::new());
        let classifier = FailureClassifier::new(llm, 42, Duration::from_secs(1));
        let mut diag = Diagnostic::new("E501: line too long").at("app/a.py", Some(9));
        diag.lint_rule = Some("E501".to_string());
        let f = classifier.classify(&diag, 0.2).await;
        assert_eq!(f.kind, FailureKind::Linting);
        assert_eq!(f.line, Some(9));
    }
}
