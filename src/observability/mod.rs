//! 可观测性：tracing 订阅器初始化（EnvFilter 默认 info，可用 RUST_LOG 覆盖）

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

/// 协作方调用的审计事件（沙箱命令、推理调用），输出一行 JSON
pub fn audit(kind: &str, name: &str, outcome: &str, duration_ms: u64) {
    let audit = serde_json::json!({
        "event": kind,
        "name": name,
        "outcome": outcome,
        "duration_ms": duration_ms,
    });
    tracing::info!(audit = %audit, "audit");
}
