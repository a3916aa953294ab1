//! Run 模型与失败台账
//!
//! Run 只由编排循环修改；台账按指纹去重跟踪每个失败的出现次数、解决情况与修复尝试，
//! 是 total_failures / total_fixes / fixes 三个字段的唯一来源。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::core::{HealError, RunState};
use crate::heal::{
    derive_branch_name, CiStatus, EventKind, Failure, Fingerprint, Fix, FixEntry, LlmUsage,
    ResultRecord, Scoring, TimelineEvent,
};

pub const TEMPERATURE_DECAY: f32 = 0.75;
pub const TEMPERATURE_FLOOR: f32 = 0.05;

/// 一次修复请求
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub repo_path: PathBuf,
    pub repo_url: String,
    pub team: String,
    pub leader: String,
    pub run_id: String,
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// 最近一次看到的实例
    pub failure: Failure,
    /// 在多少轮分析中出现过
    pub sightings: u32,
    pub last_seen: u32,
    pub resolved: bool,
    pub unfixable: bool,
    pub accepted: Option<Fix>,
    pub rejected: Option<Fix>,
}

impl LedgerEntry {
    /// 报告用的修复：已接受的优先，否则最近一次被拒绝的尝试
    pub fn reported_fix(&self) -> Option<&Fix> {
        self.accepted.as_ref().or(self.rejected.as_ref())
    }
}

/// 指纹台账：保持首次发现顺序
#[derive(Debug, Default)]
pub struct FailureLedger {
    entries: Vec<LedgerEntry>,
    index: HashMap<Fingerprint, usize>,
    unfixable_after: u32,
}

impl FailureLedger {
    pub fn new(unfixable_after: u32) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            unfixable_after,
        }
    }

    fn register(&mut self, failure: &Failure) -> usize {
        if let Some(&i) = self.index.get(&failure.fingerprint) {
            self.entries[i].failure = failure.clone();
            return i;
        }
        self.entries.push(LedgerEntry {
            failure: failure.clone(),
            sightings: 0,
            last_seen: 0,
            resolved: false,
            unfixable: false,
            accepted: None,
            rejected: None,
        });
        let i = self.entries.len() - 1;
        self.index.insert(failure.fingerprint.clone(), i);
        i
    }

    /// 按当前失败集合更新解决状态：不在集合中的即视为已解决
    pub fn settle(&mut self, current: &[Failure]) {
        for failure in current {
            self.register(failure);
        }
        for entry in &mut self.entries {
            entry.resolved = !current.iter().any(|f| f.fingerprint == entry.failure.fingerprint);
        }
    }

    /// 一轮分析：每个仍存在的失败计一次出现；返回本轮新标记为不可修复的失败
    pub fn observe(&mut self, current: &[Failure], iteration: u32) -> Vec<Failure> {
        self.settle(current);
        let mut newly_unfixable = Vec::new();
        for failure in current {
            let i = self.register(failure);
            let entry = &mut self.entries[i];
            if entry.last_seen != iteration {
                entry.last_seen = iteration;
                entry.sightings += 1;
            }
            if !entry.unfixable && entry.sightings > self.unfixable_after {
                entry.unfixable = true;
                newly_unfixable.push(entry.failure.clone());
            }
        }
        newly_unfixable
    }

    /// 本轮要尝试的失败：排除不可修复者，按严重程度与种类优先级排序
    pub fn actionable(&self, current: &[Failure]) -> Vec<Failure> {
        let mut out: Vec<Failure> = current
            .iter()
            .filter(|f| !self.is_unfixable(&f.fingerprint))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        out
    }

    pub fn is_unfixable(&self, fingerprint: &Fingerprint) -> bool {
        self.index
            .get(fingerprint)
            .map(|&i| self.entries[i].unfixable)
            .unwrap_or(false)
    }

    pub fn record_fix(&mut self, fix: Fix) {
        let Some(&i) = self.index.get(&fix.fingerprint) else {
            tracing::warn!(fingerprint = %fix.fingerprint.short(), "fix for unknown failure ignored");
            return;
        };
        let entry = &mut self.entries[i];
        if fix.tests_passed {
            entry.accepted = Some(fix);
        } else {
            entry.rejected = Some(fix);
        }
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn total_failures(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn total_fixes(&self) -> u32 {
        self.entries.iter().filter(|e| e.accepted.is_some()).count() as u32
    }

    pub fn unresolved(&self) -> usize {
        self.entries.iter().filter(|e| !e.resolved).count()
    }

    /// 未解决且仍可尝试的失败数
    pub fn actionable_unresolved(&self) -> usize {
        self.entries.iter().filter(|e| !e.resolved && !e.unfixable).count()
    }

    pub fn fix_entries(&self) -> Vec<FixEntry> {
        self.entries
            .iter()
            .filter_map(LedgerEntry::reported_fix)
            .map(FixEntry::from)
            .collect()
    }
}

/// 一次修复运行
#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub repo_url: String,
    pub branch_name: String,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub max_retries: u32,
    pub iteration: u32,
    pub temperature: f32,
    pub commit_count: u32,
    pub ledger: FailureLedger,
    pub timeline: Vec<TimelineEvent>,
    pub scoring: Option<Scoring>,
    /// 基础设施故障导致的提前结束
    pub aborted: bool,
    pub cancelled: bool,
    state: RunState,
    visible: CiStatus,
}

impl Run {
    pub fn new(request: &RunRequest, max_retries: u32, unfixable_after: u32, temperature: f32) -> Self {
        Self {
            id: request.run_id.clone(),
            repo_url: request.repo_url.clone(),
            // 分支名只在创建时计算一次
            branch_name: derive_branch_name(&request.team, &request.leader),
            started_at: Utc::now(),
            started: Instant::now(),
            max_retries: max_retries.max(1),
            iteration: 0,
            temperature,
            commit_count: 0,
            ledger: FailureLedger::new(unfixable_after),
            timeline: Vec::new(),
            scoring: None,
            aborted: false,
            cancelled: false,
            state: RunState::Pending,
            visible: CiStatus::Pending,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn ci_status(&self) -> CiStatus {
        self.visible
    }

    /// 迁移状态；返回对外状态是否变化
    pub fn transition(&mut self, next: RunState) -> Result<bool, HealError> {
        if !self.state.can_transition_to(next) {
            return Err(HealError::infrastructure(format!(
                "illegal state transition {} -> {}",
                self.state, next
            )));
        }
        tracing::debug!(run_id = %self.id, from = %self.state, to = %next, "state transition");
        self.state = next;
        match next.ci_status() {
            Some(status) if status != self.visible => {
                self.visible = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn event(&mut self, kind: EventKind, description: impl Into<String>) {
        let description = description.into();
        tracing::info!(run_id = %self.id, iteration = self.iteration, "{}", description);
        self.timeline.push(TimelineEvent {
            description,
            timestamp: Utc::now(),
            iteration: self.iteration,
            max_retries: self.max_retries,
            kind: Some(kind),
        });
    }

    pub fn decay_temperature(&mut self) {
        self.temperature = (self.temperature * TEMPERATURE_DECAY).max(TEMPERATURE_FLOOR);
    }

    /// SCORING 之后的终态
    pub fn terminal_state(&self) -> RunState {
        if self.aborted {
            RunState::Failed
        } else if self.ledger.unresolved() == 0 && !self.cancelled {
            RunState::Passed
        } else if self.ledger.total_fixes() > 0 {
            RunState::Partial
        } else {
            RunState::Failed
        }
    }

    pub fn to_record(&self, llm_usage: LlmUsage) -> ResultRecord {
        ResultRecord {
            repo_url: self.repo_url.clone(),
            branch_name: self.branch_name.clone(),
            run_id: self.id.clone(),
            total_failures: self.ledger.total_failures(),
            total_fixes: self.ledger.total_fixes(),
            ci_status: self.visible,
            fixes: self.ledger.fix_entries(),
            ci_timeline: self.timeline.clone(),
            scoring: if self.visible.is_terminal() {
                self.scoring.clone()
            } else {
                None
            },
            llm_usage,
        }
    }
}
