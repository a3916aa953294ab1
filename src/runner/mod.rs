//! 测试执行协作方
//!
//! TestRunner 接收快照，返回结构化的通过/失败列表与失败诊断；SandboxTestRunner 通过沙箱执行配置的测试命令。

pub mod parser;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::sandbox::{Sandbox, SandboxError};
use crate::workspace::Snapshot;

pub use parser::parse_report;

/// 单条失败诊断（原始文本 + 运行器已知的位置信息）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostic {
    pub text: String,
    pub file_path: Option<String>,
    pub line: Option<u32>,
    pub test_name: Option<String>,
    /// lint 规则编号（如 E501），有值即可直接判为 LINTING
    pub lint_rule: Option<String>,
}

impl Diagnostic {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn at(mut self, file: &str, line: Option<u32>) -> Self {
        self.file_path = Some(file.to_string());
        self.line = line;
        self
    }

    pub fn for_test(mut self, name: &str) -> Self {
        self.test_name = Some(name.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub passed: bool,
}

/// 一次测试运行的结构化结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestReport {
    pub exit_code: i32,
    pub cases: Vec<TestCase>,
    pub diagnostics: Vec<Diagnostic>,
    pub raw_output: String,
}

impl TestReport {
    /// 通过的测试名集合（用于回归判断）
    pub fn passing(&self) -> BTreeSet<&str> {
        self.cases
            .iter()
            .filter(|c| c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// 测试执行协作方
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, snapshot: &Snapshot) -> Result<TestReport, SandboxError>;
}

/// 通过沙箱执行测试命令并解析输出
pub struct SandboxTestRunner {
    sandbox: Arc<dyn Sandbox>,
    command: Vec<String>,
}

impl SandboxTestRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, command: Vec<String>) -> Self {
        Self { sandbox, command }
    }
}

#[async_trait]
impl TestRunner for SandboxTestRunner {
    async fn run(&self, snapshot: &Snapshot) -> Result<TestReport, SandboxError> {
        let output = self.sandbox.execute(snapshot, &self.command).await?;
        // 去掉快照根前缀，诊断里的路径统一为仓库相对路径，指纹不随工作区位置变化
        let root_prefix = format!("{}/", snapshot.root().display());
        let combined = output.combined().replace(&root_prefix, "");
        let report = parse_report(output.exit_code, &combined);
        tracing::debug!(
            exit_code = report.exit_code,
            cases = report.cases.len(),
            diagnostics = report.diagnostics.len(),
            "test report parsed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecOutput;

    struct FixedSandbox(ExecOutput);

    #[async_trait]
    impl Sandbox for FixedSandbox {
        async fn execute(
            &self,
            _snapshot: &Snapshot,
            _command: &[String],
        ) -> Result<ExecOutput, SandboxError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_runner_strips_snapshot_root() {
        let dir = tempfile::tempdir().unwrap();
        let snap = Snapshot::open(dir.path()).unwrap();
        let stdout = format!(
            "FAILED tests/test_a.py::test_x - ValueError: bad\n  File \"{}/app/a.py\", line 4\n",
            snap.root().display()
        );
        let sandbox = Arc::new(FixedSandbox(ExecOutput {
            exit_code: 1,
            stdout,
            stderr: String::new(),
        }));
        let runner = SandboxTestRunner::new(sandbox, vec!["python".into()]);
        let report = runner.run(&snap).await.unwrap();
        assert!(report.raw_output.contains("File \"app/a.py\", line 4"));
        assert_eq!(report.diagnostics.len(), 1);
    }
}
