//! Healer - 自主 CI 修复引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、运行模型、状态机、修复主循环
//! - **heal**: 分类、根因、补丁、验证、提交分组、评分、结果记录
//! - **llm**: 推理客户端抽象与实现（OpenAI 兼容 / DeepSeek / 主备路由 / Mock）
//! - **observability**: 日志初始化与审计事件
//! - **runner**: 测试执行与报告解析
//! - **sandbox**: 受限命令执行
//! - **vcs**: 派生分支上的提交
//! - **workspace**: 仓库快照与隔离工作区

pub mod config;
pub mod core;
pub mod heal;
pub mod llm;
pub mod observability;
pub mod runner;
pub mod sandbox;
pub mod vcs;
pub mod workspace;

pub use crate::core::{HealingLoop, RunRequest};
