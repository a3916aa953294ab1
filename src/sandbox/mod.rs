//! 沙箱执行器：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 python、npm、cargo）；禁止 rm -rf、wget、chmod 777 等子串；
//! 直接 spawn 进程（不经 shell），工作目录固定为快照根，带超时与 tracing 审计。

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::core::HealError;
use crate::observability;
use crate::workspace::Snapshot;

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "git push",
    ":(){ :|:& };:", // fork bomb
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("command rejected: {0}")]
    Forbidden(String),

    #[error("command timed out after {0}s")]
    Timeout(u64),

    #[error("failed to spawn: {0}")]
    Spawn(String),
}

impl From<SandboxError> for HealError {
    fn from(e: SandboxError) -> Self {
        HealError::InfrastructureFault(e.to_string())
    }
}

/// 命令执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout 与 stderr 合并，供报告解析
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// 沙箱协作方：在快照中执行一条命令，调用之间不共享状态
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(&self, snapshot: &Snapshot, command: &[String])
        -> Result<ExecOutput, SandboxError>;
}

/// 本地进程沙箱
pub struct LocalSandbox {
    allowed_commands: HashSet<String>,
    timeout_secs: u64,
}

impl LocalSandbox {
    pub fn new(allowed_commands: Vec<String>, timeout_secs: u64) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            timeout_secs,
        }
    }

    fn is_allowed(&self, command: &[String]) -> Result<(), SandboxError> {
        let raw_lower = command.join(" ").to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(SandboxError::Forbidden(format!("forbidden pattern: {forbidden}")));
            }
        }
        let name = command
            .first()
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        if name.is_empty() {
            return Err(SandboxError::Forbidden("empty command".to_string()));
        }
        if self.allowed_commands.contains(&name) {
            return Ok(());
        }
        Err(SandboxError::Forbidden(format!(
            "command '{name}' not in allowlist"
        )))
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn execute(
        &self,
        snapshot: &Snapshot,
        command: &[String],
    ) -> Result<ExecOutput, SandboxError> {
        self.is_allowed(command)?;
        let start = Instant::now();
        let Some((program, args)) = command.split_first() else {
            return Err(SandboxError::Forbidden("empty command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(snapshot.root())
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .kill_on_drop(true);

        let result = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output()).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match &result {
            Ok(Ok(o)) if o.status.success() => "ok",
            Ok(Ok(_)) => "nonzero",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        observability::audit("sandbox_audit", &command.join(" "), outcome, duration_ms);

        let output = result
            .map_err(|_| SandboxError::Timeout(self.timeout_secs))?
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
