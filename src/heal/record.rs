//! 结果记录与存储
//!
//! 每个 Run 一个 JSON 对象（results_dir/<run_id>.json），schema 封闭：读回时拒绝未知字段。
//! 写入走临时文件 + rename，读者看不到半写状态；终态记录写入后不可再被覆盖。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::heal::scoring::{self, Scoring};
use crate::heal::types::{FailureKind, Fix, TimelineEvent};
use crate::workspace::atomic_write;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record io: {0}")]
    Io(#[from] std::io::Error),

    #[error("record schema: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("record for run {0} is already terminal")]
    Sealed(String),

    #[error("record invariant violated: {0}")]
    Invalid(String),
}

/// 对外可见的 CI 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CiStatus {
    Pending,
    Analyzing,
    Fixing,
    Validating,
    Passed,
    Partial,
    Failed,
}

impl CiStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CiStatus::Passed | CiStatus::Partial | CiStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixEntry {
    pub file_path: String,
    pub error_type: FailureKind,
    pub line_number: Option<u32>,
    pub original_snippet: String,
    pub patched_snippet: String,
    pub tests_passed: bool,
    pub commit_message: String,
}

impl From<&Fix> for FixEntry {
    fn from(fix: &Fix) -> Self {
        Self {
            file_path: fix.file_path.clone(),
            error_type: fix.kind,
            line_number: fix.line_number,
            original_snippet: fix.original_snippet.clone(),
            patched_snippet: fix.patched_snippet.clone(),
            tests_passed: fix.tests_passed,
            commit_message: fix.commit_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmUsage {
    pub primary_model: String,
    pub fallback_model: Option<String>,
    pub fallback_triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultRecord {
    pub repo_url: String,
    pub branch_name: String,
    pub run_id: String,
    pub total_failures: u32,
    pub total_fixes: u32,
    pub ci_status: CiStatus,
    pub fixes: Vec<FixEntry>,
    pub ci_timeline: Vec<TimelineEvent>,
    /// 终态之前为 null
    pub scoring: Option<Scoring>,
    pub llm_usage: LlmUsage,
}

impl ResultRecord {
    /// 记录层面的不变量检查
    pub fn check(&self) -> Result<(), RecordError> {
        if self.total_fixes > self.total_failures {
            return Err(RecordError::Invalid(format!(
                "total_fixes {} exceeds total_failures {}",
                self.total_fixes, self.total_failures
            )));
        }
        let accepted = self.fixes.iter().filter(|f| f.tests_passed).count() as u32;
        if accepted != self.total_fixes {
            return Err(RecordError::Invalid(format!(
                "{accepted} accepted fixes listed, total_fixes is {}",
                self.total_fixes
            )));
        }
        if self.ci_status.is_terminal() != self.scoring.is_some() {
            return Err(RecordError::Invalid(
                "scoring must be present exactly when the status is terminal".to_string(),
            ));
        }
        Ok(())
    }

    /// 仅凭记录复算评分
    pub fn rescore(&self) -> Result<Scoring, RecordError> {
        let scoring = self
            .scoring
            .as_ref()
            .ok_or_else(|| RecordError::Invalid("record has no scoring block".to_string()))?;
        Ok(scoring::rescore(scoring, self.total_fixes, self.total_failures))
    }
}

/// 结果记录目录
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    /// 原子写入；写前做往返校验，已是终态的记录拒绝覆盖
    pub fn write(&self, record: &ResultRecord) -> Result<PathBuf, RecordError> {
        record.check()?;
        let body = serde_json::to_string_pretty(record)?;
        let back: ResultRecord = serde_json::from_str(&body)?;
        back.check()?;

        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record.run_id);
        if path.exists() {
            let existing = Self::read_path(&path)?;
            if existing.ci_status.is_terminal() {
                return Err(RecordError::Sealed(record.run_id.clone()));
            }
        }
        atomic_write(&path, body.as_bytes())?;
        tracing::debug!(run_id = %record.run_id, status = ?record.ci_status, "result record written");
        Ok(path)
    }

    pub fn read(&self, run_id: &str) -> Result<ResultRecord, RecordError> {
        Self::read_path(&self.path_for(run_id))
    }

    /// 读取并按封闭 schema 校验
    pub fn read_path(path: &Path) -> Result<ResultRecord, RecordError> {
        let body = std::fs::read_to_string(path)?;
        let record: ResultRecord = serde_json::from_str(&body)?;
        record.check()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heal::scoring::{score, ScoreInputs};
    use chrono::Utc;
    use std::time::Duration;

    fn record(status: CiStatus) -> ResultRecord {
        ResultRecord {
            repo_url: "https://example.com/acme/app".to_string(),
            branch_name: "RIFT_HARSH_AI_FIX".to_string(),
            run_id: "run-1".to_string(),
            total_failures: 1,
            total_fixes: 1,
            ci_status: status,
            fixes: vec![FixEntry {
                file_path: "calc.py".to_string(),
                error_type: FailureKind::Syntax,
                line_number: Some(1),
                original_snippet: "def add(a, b)".to_string(),
                patched_snippet: "def add(a, b):".to_string(),
                tests_passed: true,
                commit_message: "[AI-AGENT] Fix SYNTAX in calc.py".to_string(),
            }],
            ci_timeline: vec![TimelineEvent {
                description: "Iteration 1 started".to_string(),
                timestamp: Utc::now(),
                iteration: 1,
                max_retries: 5,
                kind: None,
            }],
            scoring: status.is_terminal().then(|| {
                score(&ScoreInputs {
                    elapsed: Duration::from_secs(30),
                    commit_count: 1,
                    fixes_resolved: 1,
                    total_failures: 1,
                })
            }),
            llm_usage: LlmUsage {
                primary_model: "gpt-4o-mini".to_string(),
                fallback_model: None,
                fallback_triggered: false,
            },
        }
    }

    #[test]
    fn test_wire_format() {
        let v = serde_json::to_value(record(CiStatus::Analyzing)).unwrap();
        let obj = v.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(|k| k.as_str()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "branch_name", "ci_status", "ci_timeline", "fixes", "llm_usage", "repo_url",
                "run_id", "scoring", "total_failures", "total_fixes"
            ]
        );
        assert_eq!(obj["ci_status"], "ANALYZING");
        assert!(obj["scoring"].is_null());
        assert_eq!(obj["fixes"][0]["error_type"], "SYNTAX");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let mut v = serde_json::to_value(record(CiStatus::Passed)).unwrap();
        v["extra"] = serde_json::json!(1);
        assert!(serde_json::from_value::<ResultRecord>(v.clone()).is_err());

        let mut v = serde_json::to_value(record(CiStatus::Passed)).unwrap();
        v["scoring"]["bonus"] = serde_json::json!(5);
        assert!(serde_json::from_value::<ResultRecord>(v).is_err());
    }

    #[test]
    fn test_store_roundtrip_and_seal() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store.write(&record(CiStatus::Analyzing)).unwrap();
        assert_eq!(store.read("run-1").unwrap().ci_status, CiStatus::Analyzing);

        let terminal = record(CiStatus::Passed);
        store.write(&terminal).unwrap();
        let back = store.read("run-1").unwrap();
        assert_eq!(back, terminal);
        assert_eq!(back.rescore().unwrap().final_ci_score, 110);

        assert!(matches!(
            store.write(&record(CiStatus::Failed)),
            Err(RecordError::Sealed(_))
        ));
    }

    #[test]
    fn test_invariants_enforced() {
        let mut r = record(CiStatus::Passed);
        r.total_failures = 0;
        assert!(matches!(r.check(), Err(RecordError::Invalid(_))));

        let mut r = record(CiStatus::Analyzing);
        r.scoring = record(CiStatus::Passed).scoring;
        assert!(r.check().is_err());
    }
}
