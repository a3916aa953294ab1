//! 修复流水线各阶段：分类、根因、补丁、验证、提交分组、评分、结果记录

pub mod classifier;
pub mod commit;
pub mod diff;
pub mod patch;
pub mod prompts;
pub mod record;
pub mod root_cause;
pub mod scoring;
pub mod syntax;
pub mod types;
pub mod validator;

pub use classifier::{fast_classify, FailureClassifier};
pub use commit::{commit_message, derive_branch_name, plan_commits, CommitUnit};
pub use patch::PatchGenerator;
pub use record::{CiStatus, FixEntry, LlmUsage, RecordError, RecordStore, ResultRecord};
pub use root_cause::{ResolveOutcome, RootCauseResolver};
pub use scoring::{score, ScoreInputs, Scoring};
pub use types::{
    CandidatePatch, EventKind, Failure, FailureKind, Fingerprint, Fix, RootCause, Severity,
    TimelineEvent,
};
pub use validator::{Baseline, Validator, Verdict};
