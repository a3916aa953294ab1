//! 失败、修复、时间线等核心数据类型
//!
//! FailureKind 的声明顺序即快速分类的平局优先级（结构上越确定越靠前）。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 失败种类（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Syntax,
    Indentation,
    Import,
    TypeError,
    Runtime,
    Linting,
    Dependency,
    TestFailure,
    Logic,
}

impl FailureKind {
    pub const ALL: [FailureKind; 9] = [
        FailureKind::Syntax,
        FailureKind::Indentation,
        FailureKind::Import,
        FailureKind::TypeError,
        FailureKind::Runtime,
        FailureKind::Linting,
        FailureKind::Dependency,
        FailureKind::TestFailure,
        FailureKind::Logic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Syntax => "SYNTAX",
            FailureKind::Indentation => "INDENTATION",
            FailureKind::Import => "IMPORT",
            FailureKind::TypeError => "TYPE_ERROR",
            FailureKind::Runtime => "RUNTIME",
            FailureKind::Linting => "LINTING",
            FailureKind::Dependency => "DEPENDENCY",
            FailureKind::TestFailure => "TEST_FAILURE",
            FailureKind::Logic => "LOGIC",
        }
    }

    /// 解析标签（大小写与空格/连字符不敏感），用于推理分类的回复
    pub fn parse_label(label: &str) -> Option<Self> {
        let norm: String = label
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        Self::ALL.into_iter().find(|k| k.as_str() == norm)
    }

    /// 平局优先级：数值越小越优先
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            FailureKind::Syntax | FailureKind::Indentation => Severity::Critical,
            FailureKind::Import | FailureKind::Dependency | FailureKind::TypeError => {
                Severity::High
            }
            FailureKind::Runtime | FailureKind::TestFailure | FailureKind::Logic => {
                Severity::Medium
            }
            FailureKind::Linting => Severity::Low,
        }
    }

    /// 语法类修复享有「语法遮蔽」豁免
    pub fn is_syntactic(&self) -> bool {
        matches!(self, FailureKind::Syntax | FailureKind::Indentation)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 严重程度；声明顺序即处理顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

/// 失败指纹：sha256(kind | file | 归一化诊断文本) 的十六进制
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(kind: FailureKind, file_path: &str, diagnostic: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(file_path.as_bytes());
        hasher.update(b"|");
        hasher.update(normalize_diagnostic(diagnostic).as_bytes());
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 日志里用的短形式
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 去掉诊断中随运行变化的部分：内存地址、数字、多余空白
pub fn normalize_diagnostic(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '0' && matches!(chars.peek(), Some('x') | Some('X')) {
            chars.next();
            while matches!(chars.peek(), Some(h) if h.is_ascii_hexdigit()) {
                chars.next();
            }
            out.push('#');
        } else if c.is_ascii_digit() {
            while matches!(chars.peek(), Some(d) if d.is_ascii_digit()) {
                chars.next();
            }
            out.push('#');
        } else {
            out.push(c);
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 一个被检测到的失败
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub severity: Severity,
    pub file_path: String,
    pub line: Option<u32>,
    pub diagnostic: String,
    pub test_name: Option<String>,
    pub fingerprint: Fingerprint,
}

impl Failure {
    pub fn new(
        kind: FailureKind,
        file_path: impl Into<String>,
        line: Option<u32>,
        diagnostic: impl Into<String>,
    ) -> Self {
        let file_path = file_path.into();
        let diagnostic = diagnostic.into();
        Self {
            kind,
            severity: kind.default_severity(),
            fingerprint: Fingerprint::compute(kind, &file_path, &diagnostic),
            file_path,
            line,
            diagnostic,
            test_name: None,
        }
    }

    pub fn with_test(mut self, name: Option<String>) -> Self {
        self.test_name = name;
        self
    }

    /// 处理顺序键：严重程度、种类优先级、路径、行号
    pub fn order_key(&self) -> (Severity, u8, &str, u32) {
        (
            self.severity,
            self.kind.priority(),
            self.file_path.as_str(),
            self.line.unwrap_or(0),
        )
    }
}

/// 对某个失败的一次修复尝试结果
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub fingerprint: Fingerprint,
    pub kind: FailureKind,
    pub file_path: String,
    pub line_number: Option<u32>,
    pub original_snippet: String,
    pub patched_snippet: String,
    pub tests_passed: bool,
    pub commit_message: String,
    pub iteration: u32,
}

/// 根因解释
#[derive(Debug, Clone, PartialEq)]
pub struct RootCause {
    pub explanation: String,
    pub implicated_files: Vec<String>,
    pub line: Option<u32>,
}

/// 候选补丁：diff 文本与应用后的完整文件内容
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePatch {
    pub file_path: String,
    pub diff: String,
    pub original: String,
    pub patched: String,
}

/// 时间线事件类别（不写入结果记录，仅供内部统计）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RunAccepted,
    IterationStarted,
    Classified,
    Attempt,
    Accepted,
    Rejected,
    Skipped,
    Committed,
    Converged,
    Exhausted,
    Cancelled,
    Infrastructure,
    Finalized,
}

/// 时间线事件：追加写入，按发出顺序全序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimelineEvent {
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub max_retries: u32,
    #[serde(skip)]
    pub kind: Option<EventKind>,
}
