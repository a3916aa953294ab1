//! Healer - 自主 CI 修复引擎
//!
//! 入口：解析参数、加载配置、初始化日志，组装推理/沙箱/测试/提交协作方并执行一次 Run。
//! 退出码：PASSED 为 0，PARTIAL 为 2，FAILED 为 1。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use healer::config::{load_config, AppConfig};
use healer::heal::CiStatus;
use healer::llm::create_llm_from_config;
use healer::runner::SandboxTestRunner;
use healer::sandbox::LocalSandbox;
use healer::vcs::GitCommitter;
use healer::{observability, HealingLoop, RunRequest};

#[derive(Parser, Debug)]
#[command(name = "healer", version, about = "Heal a failing repository and emit a scored result record")]
struct Args {
    /// 本地仓库路径
    #[arg(long)]
    repo: PathBuf,

    /// 仓库 URL（写入结果记录）
    #[arg(long)]
    repo_url: String,

    #[arg(long)]
    team: String,

    #[arg(long)]
    leader: String,

    /// 不指定时生成 UUID
    #[arg(long)]
    run_id: Option<String>,

    #[arg(long)]
    config: Option<PathBuf>,

    /// 覆盖 healing.max_retries
    #[arg(long)]
    max_retries: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 日志：默认 info，可通过 RUST_LOG 覆盖
    observability::init();

    let mut cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    if let Some(n) = args.max_retries {
        cfg.healing.max_retries = n;
    }

    let router = create_llm_from_config(&cfg);
    let sandbox = Arc::new(LocalSandbox::new(
        cfg.sandbox.allowed_commands.clone(),
        cfg.runner.timeout_secs,
    ));
    let runner = Arc::new(SandboxTestRunner::new(sandbox, cfg.runner.command.clone()));

    let auto_commit = cfg.healing.auto_commit;
    let mut healing = HealingLoop::new(cfg, router, runner);
    if auto_commit {
        healing = healing.with_committer(Arc::new(GitCommitter));
    }

    // Ctrl-C 只设置取消标记，循环在迭代边界收尾
    let cancel = healing.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Cancellation requested, finishing at the next iteration boundary");
            cancel.cancel();
        }
    });

    let request = RunRequest {
        repo_path: args.repo,
        repo_url: args.repo_url,
        team: args.team,
        leader: args.leader,
        run_id: args
            .run_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    };
    let run_id = request.run_id.clone();

    let record = healing
        .run(request)
        .await
        .with_context(|| format!("Failed to write the final result record for run {run_id}"))?;

    println!(
        "{}",
        serde_json::to_string_pretty(&record).context("Failed to render result record")?
    );

    let code = match record.ci_status {
        CiStatus::Passed => 0,
        CiStatus::Partial => 2,
        _ => 1,
    };
    std::process::exit(code);
}
