//! 仓库快照与隔离工作区
//!
//! 每个阶段都显式接收 Snapshot（仓库根路径），不持有隐藏的可变文件系统状态。
//! prepare 把源仓库复制到 workspace_root/<run_id>，不同 Run 从不共享工作树。

use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::core::HealError;

/// 复制时跳过的目录（构建产物、依赖缓存）
const SKIP_DIRS: &[&str] = &["target", "node_modules", "__pycache__", ".venv", ".pytest_cache"];

/// 仓库快照句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    root: PathBuf,
}

impl Snapshot {
    /// 打开已存在的仓库目录；目录不存在或不可读视为基础设施故障
    pub fn open(root: impl AsRef<Path>) -> Result<Self, HealError> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| {
            HealError::infrastructure(format!("repository {} unreadable: {e}", root.display()))
        })?;
        std::fs::read_dir(&root).map_err(|e| {
            HealError::infrastructure(format!("repository {} unreadable: {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析仓库内相对路径；拒绝绝对路径越界与 `..` 逃逸
    pub fn resolve(&self, rel: &str) -> io::Result<PathBuf> {
        let rel = self.relativize(rel);
        let path = Path::new(&rel);
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path '{rel}' is outside the repository"),
            ));
        }
        Ok(self.root.join(path))
    }

    /// 把绝对路径（位于快照内）转成相对路径；其余原样返回
    pub fn relativize(&self, path: &str) -> String {
        let p = Path::new(path);
        match p.strip_prefix(&self.root) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => path.trim_start_matches("./").to_string(),
        }
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.resolve(rel).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn read(&self, rel: &str) -> io::Result<String> {
        std::fs::read_to_string(self.resolve(rel)?)
    }

    /// 以 line 为中心截取 ±radius 行（带行号）；line 为空时取文件开头
    pub fn source_window(&self, rel: &str, line: Option<u32>, radius: usize) -> io::Result<String> {
        let content = self.read(rel)?;
        let lines: Vec<&str> = content.lines().collect();
        let center = line.map(|l| l.saturating_sub(1) as usize).unwrap_or(0);
        let start = center.saturating_sub(radius);
        let end = (center + radius + 1).min(lines.len());
        Ok(lines
            .iter()
            .enumerate()
            .take(end)
            .skip(start)
            .map(|(i, l)| format!("{:>5} | {}", i + 1, l))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// 原子替换：先完整写入同目录临时文件，再 rename 到目标路径，读者不会看到写了一半的文件
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    // 临时文件默认 0600，沿用目标文件原有权限
    if let Ok(meta) = std::fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions())?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// 将源仓库复制到 workspace_root/<run_id> 并返回其快照
pub fn prepare(source: &Path, workspace_root: &Path, run_id: &str) -> Result<Snapshot, HealError> {
    let source = Snapshot::open(source)?;
    let target = workspace_root.join(run_id);
    if target.exists() {
        return Err(HealError::infrastructure(format!(
            "workspace {} already in use",
            target.display()
        )));
    }
    std::fs::create_dir_all(&target)?;
    // 工作区根位于源仓库内时不能把自己也复制进去
    let own_root = workspace_root.canonicalize()?;

    let walker = WalkDir::new(source.root())
        .into_iter()
        .filter_entry(|e| {
            if e.path() == own_root {
                return false;
            }
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .map(|n| SKIP_DIRS.contains(&n))
                    .unwrap_or(false))
        });

    let mut copied = 0usize;
    for entry in walker {
        let entry = entry.map_err(|e| HealError::infrastructure(format!("walk failed: {e}")))?;
        let rel = match entry.path().strip_prefix(source.root()) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &dest)?;
            copied += 1;
        }
    }
    tracing::info!(run_id = %run_id, files = copied, workspace = %target.display(), "workspace prepared");
    Snapshot::open(&target)
}
