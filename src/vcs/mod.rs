//! 版本控制协作方
//!
//! Committer 在派生分支上提交一个提交单元；GitCommitter 调用 git CLI（checkout -B / add / commit）。
//! 推送不在此处处理。

use async_trait::async_trait;
use tokio::process::Command;

use crate::heal::CommitUnit;
use crate::workspace::Snapshot;

/// 固定的提交作者
pub const COMMIT_AUTHOR: &str = "AI-Healing-Agent <ai-healing-agent@users.noreply.local>";

#[async_trait]
pub trait Committer: Send + Sync {
    /// 切到（或创建）目标分支；每个 Run 调用一次
    async fn prepare_branch(&self, snapshot: &Snapshot, branch: &str) -> Result<(), String>;

    /// 提交一个单元，返回提交标识
    async fn commit(&self, snapshot: &Snapshot, unit: &CommitUnit) -> Result<String, String>;
}

#[derive(Debug, Default)]
pub struct GitCommitter;

impl GitCommitter {
    async fn git(snapshot: &Snapshot, args: &[&str]) -> Result<String, String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(snapshot.root())
            .output()
            .await
            .map_err(|e| format!("Failed to run git {}: {}", args.first().unwrap_or(&""), e))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

#[async_trait]
impl Committer for GitCommitter {
    async fn prepare_branch(&self, snapshot: &Snapshot, branch: &str) -> Result<(), String> {
        Self::git(snapshot, &["checkout", "-B", branch]).await.map(|_| ())
    }

    async fn commit(&self, snapshot: &Snapshot, unit: &CommitUnit) -> Result<String, String> {
        let mut add: Vec<&str> = vec!["add", "--"];
        add.extend(unit.files.iter().map(String::as_str));
        Self::git(snapshot, &add).await?;

        Self::git(
            snapshot,
            &[
                "-c",
                "user.name=AI-Healing-Agent",
                "-c",
                "user.email=ai-healing-agent@users.noreply.local",
                "commit",
                "--author",
                COMMIT_AUTHOR,
                "-m",
                &unit.message,
            ],
        )
        .await?;
        Self::git(snapshot, &["rev-parse", "--short", "HEAD"]).await
    }
}
