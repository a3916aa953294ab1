//! Unified diff 解析与内存内应用
//!
//! 只处理单文件 diff。应用时校验上下文/删除行与原文一致；
//! 行号偏差时在附近搜索匹配位置（推理服务给出的行号常有偏移）。

use thiserror::Error;

/// 行号偏差时向上下搜索的最大行数
const FUZZ_LINES: usize = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("no diff found in reply")]
    Missing,

    #[error("could not find file paths in diff")]
    NoPaths,

    #[error("no hunks found in diff")]
    NoHunks,

    #[error("invalid hunk header: {0}")]
    BadHeader(String),

    #[error("hunk {index} does not apply near line {line}")]
    Mismatch { index: usize, line: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// (新增行数, 删除行数)
    pub fn summary(&self) -> (usize, usize) {
        let adds = self.lines.iter().filter(|l| matches!(l, DiffLine::Add(_))).count();
        let removes = self.lines.iter().filter(|l| matches!(l, DiffLine::Remove(_))).count();
        (adds, removes)
    }

    fn old_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Remove(s) => Some(s.as_str()),
                DiffLine::Add(_) => None,
            })
            .collect()
    }

    fn new_side(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Add(s) => Some(s.clone()),
                DiffLine::Remove(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<DiffHunk>,
}

impl UnifiedDiff {
    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }

    /// 改动行数（增 + 删），用于补丁大小上限
    pub fn changed_lines(&self) -> usize {
        let (a, r) = self.stats();
        a + r
    }

    /// 目标文件路径（新文件路径优先，/dev/null 时退回旧路径）
    pub fn target_path(&self) -> &str {
        if self.new_path == "/dev/null" {
            &self.old_path
        } else {
            &self.new_path
        }
    }
}

/// 从推理回复中取出 diff 文本：优先 ```diff / ```patch 代码块，其次任意代码块，最后整段回复
pub fn extract_diff(reply: &str) -> Result<String, DiffError> {
    let mut blocks: Vec<(String, String)> = Vec::new();
    let mut rest = reply;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(nl) = after.find('\n') else { break };
        let lang = after[..nl].trim().to_lowercase();
        let body = &after[nl + 1..];
        let Some(close) = body.find("```") else { break };
        blocks.push((lang, body[..close].to_string()));
        rest = &body[close + 3..];
    }
    let chosen = blocks
        .iter()
        .find(|(lang, _)| lang == "diff" || lang == "patch")
        .or_else(|| blocks.iter().find(|(_, body)| body.contains("@@")))
        .map(|(_, body)| body.clone())
        .unwrap_or_else(|| reply.to_string());
    if chosen.contains("@@") && chosen.contains("+++") {
        Ok(chosen)
    } else {
        Err(DiffError::Missing)
    }
}

pub fn parse_unified_diff(diff: &str) -> Result<UnifiedDiff, DiffError> {
    let lines: Vec<&str> = diff.lines().collect();

    let mut old_path = String::new();
    let mut new_path = String::new();
    let mut start_idx = 0;

    for (i, line) in lines.iter().enumerate() {
        if let Some(rest) = line.strip_prefix("--- ") {
            old_path = clean_path(rest, "a/");
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            new_path = clean_path(rest, "b/");
            start_idx = i + 1;
            break;
        }
    }

    if old_path.is_empty() || new_path.is_empty() {
        return Err(DiffError::NoPaths);
    }

    let mut hunks = Vec::new();
    let mut i = start_idx;
    while i < lines.len() {
        if lines[i].starts_with("@@") {
            hunks.push(parse_hunk(&lines, &mut i)?);
        } else if lines[i].starts_with("--- ") && !hunks.is_empty() {
            // 第二个文件的 diff，只处理第一个
            break;
        } else {
            i += 1;
        }
    }

    if hunks.is_empty() {
        return Err(DiffError::NoHunks);
    }

    Ok(UnifiedDiff {
        old_path,
        new_path,
        hunks,
    })
}

fn clean_path(raw: &str, prefix: &str) -> String {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    raw.strip_prefix(prefix).unwrap_or(raw).to_string()
}

fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk, DiffError> {
    let header = lines[*idx];
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" {
        return Err(DiffError::BadHeader(header.to_string()));
    }

    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'), header)?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'), header)?;

    *idx += 1;
    let mut diff_lines = Vec::new();
    let (mut old_left, mut new_left) = (old_count, new_count);
    while *idx < lines.len() {
        let line = lines[*idx];
        if line.starts_with("@@") || line.starts_with("diff ") {
            break;
        }
        // 头部计数未用完时 "--- " 是被删除的 "-- " 行，用完后才是下一个文件头
        if old_left == 0 && new_left == 0 && line.starts_with("--- ") {
            break;
        }
        if let Some(s) = line.strip_prefix('+') {
            new_left = new_left.saturating_sub(1);
            diff_lines.push(DiffLine::Add(s.to_string()));
        } else if let Some(s) = line.strip_prefix('-') {
            old_left = old_left.saturating_sub(1);
            diff_lines.push(DiffLine::Remove(s.to_string()));
        } else if let Some(s) = line.strip_prefix(' ') {
            old_left = old_left.saturating_sub(1);
            new_left = new_left.saturating_sub(1);
            diff_lines.push(DiffLine::Context(s.to_string()));
        } else if line.is_empty() {
            old_left = old_left.saturating_sub(1);
            new_left = new_left.saturating_sub(1);
            diff_lines.push(DiffLine::Context(String::new()));
        }
        // "\ No newline at end of file" 等行忽略
        *idx += 1;
    }

    // 末尾空行多半是回复格式带出来的，不当作上下文
    while matches!(diff_lines.last(), Some(DiffLine::Context(s)) if s.is_empty()) {
        diff_lines.pop();
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

fn parse_range(s: &str, header: &str) -> Result<(usize, usize), DiffError> {
    let bad = || DiffError::BadHeader(header.to_string());
    match s.split_once(',') {
        Some((start, count)) => Ok((
            start.parse().map_err(|_| bad())?,
            count.parse().map_err(|_| bad())?,
        )),
        None => Ok((s.parse().map_err(|_| bad())?, 1)),
    }
}

/// 在内存中把 diff 应用到原文；保留原文的换行符风格（LF / CRLF）与末尾换行
pub fn apply_diff(original: &str, diff: &UnifiedDiff) -> Result<String, DiffError> {
    let eol = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();

    // 倒序应用，前面的行号不受影响
    for (index, hunk) in diff.hunks.iter().enumerate().rev() {
        let old = hunk.old_side();
        let expected = hunk.old_start.saturating_sub(1);
        let at = find_hunk(&lines, &old, expected).ok_or(DiffError::Mismatch {
            index,
            line: hunk.old_start,
        })?;
        lines.splice(at..at + old.len(), hunk.new_side());
    }

    let mut out = lines.join(eol);
    if original.ends_with('\n') || original.is_empty() {
        out.push_str(eol);
    }
    Ok(out)
}

/// 在 expected 附近寻找 old 片段的位置（忽略行尾空白）
fn find_hunk(lines: &[String], old: &[&str], expected: usize) -> Option<usize> {
    let matches_at = |pos: usize| {
        pos + old.len() <= lines.len()
            && old
                .iter()
                .zip(&lines[pos..pos + old.len()])
                .all(|(a, b)| a.trim_end() == b.trim_end())
    };
    if old.is_empty() {
        return (expected <= lines.len()).then_some(expected);
    }
    (0..=FUZZ_LINES).find_map(|delta| {
        [expected.checked_add(delta), expected.checked_sub(delta)]
            .into_iter()
            .flatten()
            .find(|&pos| matches_at(pos))
    })
}
