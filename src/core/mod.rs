//! 核心编排层：错误与恢复、运行模型、状态机、主控循环

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod run;
pub mod state;

pub use error::{HealError, RecoveryAction};
pub use orchestrator::HealingLoop;
pub use recovery::RecoveryEngine;
pub use run::{FailureLedger, LedgerEntry, Run, RunRequest};
pub use state::RunState;
