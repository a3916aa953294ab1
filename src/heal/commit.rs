//! 提交优化
//!
//! 分支名 `{TEAM}_{LEADER}_AI_FIX` 每个 Run 只计算一次；
//! 只有 tests_passed=true 的修复参与分组，按目录聚合成最少的、可独立回滚的提交单元。

use std::collections::BTreeMap;

use crate::heal::types::{FailureKind, Fix};

const BRANCH_SUFFIX: &str = "AI_FIX";

/// 归一化单个名字片段：大写，空白转下划线，去掉 [A-Z0-9_] 以外的字符，合并重复下划线
fn normalize_part(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        let c = if c.is_whitespace() || c == '-' { '_' } else { c.to_ascii_uppercase() };
        let keep = c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_';
        if keep && !(c == '_' && out.ends_with('_')) {
            out.push(c);
        }
    }
    out.trim_matches('_').to_string()
}

/// 派生分支名；对已归一化的输入幂等
pub fn derive_branch_name(team: &str, leader: &str) -> String {
    let suffix = format!("_{BRANCH_SUFFIX}");
    let leader = normalize_part(leader);
    let leader = if leader == BRANCH_SUFFIX {
        String::new()
    } else {
        leader
            .strip_suffix(&suffix)
            .map(str::to_string)
            .unwrap_or(leader)
    };
    let parts: Vec<String> = [normalize_part(team), leader]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        return BRANCH_SUFFIX.to_string();
    }
    format!("{}_{BRANCH_SUFFIX}", parts.join("_"))
}

/// 提交信息：固定前缀 + 失败种类 + 文件路径
pub fn commit_message(prefix: &str, kind: FailureKind, path: &str) -> String {
    format!("{prefix} Fix {kind} in {path}")
}

/// 一个提交单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitUnit {
    pub message: String,
    pub files: Vec<String>,
}

/// 把本轮接受的修复按目录分组；未通过测试的修复永远不会出现在结果中
pub fn plan_commits(prefix: &str, fixes: &[Fix]) -> Vec<CommitUnit> {
    let mut groups: BTreeMap<String, Vec<&Fix>> = BTreeMap::new();
    for fix in fixes.iter().filter(|f| f.tests_passed) {
        groups.entry(parent_dir(&fix.file_path)).or_default().push(fix);
    }

    groups
        .into_iter()
        .map(|(dir, group)| {
            let mut files: Vec<String> = group.iter().map(|f| f.file_path.clone()).collect();
            files.sort();
            files.dedup();
            let message = if group.len() == 1 {
                group[0].commit_message.clone()
            } else {
                let mut kinds: Vec<FailureKind> = group.iter().map(|f| f.kind).collect();
                kinds.sort();
                kinds.dedup();
                let kinds: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
                let scope = if dir.is_empty() { "." } else { dir.as_str() };
                format!("{prefix} Fix {} in {scope}", kinds.join(", "))
            };
            CommitUnit { message, files }
        })
        .collect()
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}
