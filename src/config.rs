//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HEALER__*` 覆盖（双下划线表示嵌套，如 `HEALER__HEALING__MAX_RETRIES=3`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub healing: HealingSection,
    pub runner: RunnerSection,
    pub sandbox: SandboxSection,
}

/// [app] 段：结果目录与工作区根目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 结果记录输出目录（每个 Run 一个 <run_id>.json）
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// 每个 Run 的隔离工作区根目录
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            workspace_root: default_workspace_root(),
        }
    }
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("workspace")
}

/// [llm] 段：后端、主备模型、采样参数与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// 主模型限流或超时后切换的备用模型
    pub fallback_model: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            fallback_model: None,
            base_url: None,
            temperature: default_temperature(),
            seed: default_seed(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_seed() -> i64 {
    42
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次推理调用超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [healing] 段：重试预算、不可修复阈值、提交前缀、补丁与上下文上限
#[derive(Debug, Clone, Deserialize)]
pub struct HealingSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 同一指纹出现次数超过该值即标记为本 Run 不可修复
    #[serde(default = "default_unfixable_after_repeats")]
    pub unfixable_after_repeats: u32,
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,
    /// 单个补丁允许改动的最大行数（增 + 删）
    #[serde(default = "default_patch_max_lines")]
    pub patch_max_lines: usize,
    /// 失败行上下各取多少行源码作为上下文
    #[serde(default = "default_context_window_lines")]
    pub context_window_lines: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// 是否在派生分支上执行 git commit
    #[serde(default)]
    pub auto_commit: bool,
}

impl Default for HealingSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            unfixable_after_repeats: default_unfixable_after_repeats(),
            commit_prefix: default_commit_prefix(),
            patch_max_lines: default_patch_max_lines(),
            context_window_lines: default_context_window_lines(),
            max_context_chars: default_max_context_chars(),
            auto_commit: false,
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_unfixable_after_repeats() -> u32 {
    2
}

fn default_commit_prefix() -> String {
    "[AI-AGENT]".to_string()
}

fn default_patch_max_lines() -> usize {
    50
}

fn default_context_window_lines() -> usize {
    15
}

fn default_max_context_chars() -> usize {
    12000
}

/// [runner] 段：测试命令与超时
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    #[serde(default = "default_runner_command")]
    pub command: Vec<String>,
    #[serde(default = "default_runner_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            timeout_secs: default_runner_timeout_secs(),
        }
    }
}

fn default_runner_command() -> Vec<String> {
    ["python", "-m", "pytest", "-rA", "-q"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_runner_timeout_secs() -> u64 {
    120
}

/// [sandbox] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "python".into(),
        "python3".into(),
        "pytest".into(),
        "npm".into(),
        "node".into(),
        "cargo".into(),
        "go".into(),
        "mvn".into(),
        "git".into(),
    ]
}

/// 从 config 目录加载配置，环境变量 HEALER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HEALER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HEALER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
