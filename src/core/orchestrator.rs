//! 修复编排器：主控循环
//!
//! 负责：准备隔离工作区、按配置组装分类器/根因/补丁/验证各阶段，
//! 并按状态机驱动 ANALYZING → FIXING → VALIDATING 的有界重试，最后评分并写出结果记录。
//!
//! 阶段严格串行：验证会改写工作树，同一 Run 内不存在并发验证。
//! 除 InfrastructureFault 外，所有阶段错误都在循环内被吸收为时间线事件。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::run::{Run, RunRequest};
use crate::core::{HealError, RecoveryAction, RecoveryEngine, RunState};
use crate::heal::{
    plan_commits, score, Baseline, CommitUnit, EventKind, Failure, FailureClassifier, Fix,
    LlmUsage, PatchGenerator, RecordError, RecordStore, ResolveOutcome, ResultRecord,
    RootCauseResolver, ScoreInputs, Validator, Verdict,
};
use crate::llm::{FallbackRouter, LlmClient};
use crate::runner::TestRunner;
use crate::vcs::Committer;
use crate::workspace::{self, Snapshot};

/// 一次 Run 内使用的各阶段
struct Stages {
    classifier: Arc<FailureClassifier>,
    resolver: RootCauseResolver,
    generator: PatchGenerator,
    validator: Validator,
}

/// 修复主循环；一个实例可以依次执行多个 Run，不同 Run 使用不同工作区和各自的分类记忆
pub struct HealingLoop {
    cfg: AppConfig,
    router: Arc<FallbackRouter>,
    runner: Arc<dyn TestRunner>,
    committer: Option<Arc<dyn Committer>>,
    store: RecordStore,
    recovery: RecoveryEngine,
    cancel: CancellationToken,
}

impl HealingLoop {
    pub fn new(cfg: AppConfig, router: FallbackRouter, runner: Arc<dyn TestRunner>) -> Self {
        let store = RecordStore::new(cfg.app.results_dir.clone());
        Self {
            cfg,
            router: Arc::new(router),
            runner,
            committer: None,
            store,
            recovery: RecoveryEngine::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// 在派生分支上实际提交（auto_commit 打开时由入口设置）
    pub fn with_committer(mut self, committer: Arc<dyn Committer>) -> Self {
        self.committer = Some(committer);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// 执行一次完整的 Run；无论结果如何都会写出终态记录
    ///
    /// 只有终态记录写入失败才返回错误。
    pub async fn run(&self, request: RunRequest) -> Result<ResultRecord, RecordError> {
        // 备用模型的切换只在单个 Run 内有效
        self.router.reset();
        let (prompt_before, completion_before) = self.router.token_usage();
        let mut run = Run::new(
            &request,
            self.cfg.healing.max_retries,
            self.cfg.healing.unfixable_after_repeats,
            self.cfg.llm.temperature,
        );
        tracing::info!(
            run_id = %run.id,
            repo = %run.repo_url,
            branch = %run.branch_name,
            started_at = %run.started_at,
            "run accepted"
        );
        run.event(
            EventKind::RunAccepted,
            format!(
                "Run accepted for {} on branch {} (retry budget {})",
                run.repo_url, run.branch_name, run.max_retries
            ),
        );
        self.publish(&run);

        if let Err(e) = self.drive(&mut run, &request).await {
            tracing::error!(run_id = %run.id, state = %run.state(), error = %e, "run aborted");
            run.aborted = true;
            run.event(
                EventKind::Infrastructure,
                format!("Run aborted by infrastructure fault: {e}"),
            );
        }
        let record = self.finalize(&mut run);

        let (prompt_after, completion_after) = self.router.token_usage();
        tracing::info!(
            run_id = %run.id,
            prompt_tokens = prompt_after.saturating_sub(prompt_before),
            completion_tokens = completion_after.saturating_sub(completion_before),
            fallback_triggered = self.router.fallback_triggered(),
            "reasoning usage"
        );
        record
    }

    fn stages(&self) -> Stages {
        let llm: Arc<dyn LlmClient> = self.router.clone();
        let timeout = Duration::from_secs(self.cfg.llm.timeouts.request);
        let seed = self.cfg.llm.seed;
        let healing = &self.cfg.healing;
        let classifier = Arc::new(FailureClassifier::new(llm.clone(), seed, timeout));
        Stages {
            resolver: RootCauseResolver::new(
                llm.clone(),
                seed,
                timeout,
                healing.context_window_lines,
                healing.max_context_chars,
            ),
            generator: PatchGenerator::new(
                llm,
                seed,
                timeout,
                healing.patch_max_lines,
                healing.max_context_chars,
            ),
            validator: Validator::new(
                self.runner.clone(),
                classifier.clone(),
                healing.commit_prefix.clone(),
            ),
            classifier,
        }
    }

    /// 迭代主体；返回的错误只会是 InfrastructureFault
    async fn drive(&self, run: &mut Run, request: &RunRequest) -> Result<(), HealError> {
        let snapshot = workspace::prepare(&request.repo_path, &self.cfg.app.workspace_root, &run.id)?;
        let stages = self.stages();

        if let Some(committer) = &self.committer {
            if let Err(e) = committer.prepare_branch(&snapshot, &run.branch_name).await {
                run.event(
                    EventKind::Committed,
                    format!("Branch {} could not be prepared: {e}", run.branch_name),
                );
            }
        }

        self.advance(run, RunState::Analyzing)?;
        let report = self.runner.run(&snapshot).await?;
        let failures = stages.classifier.classify_report(&report, run.temperature).await;
        let mut baseline = Baseline { report, failures };

        if baseline.failures.is_empty() {
            run.event(EventKind::Classified, "Analysis found no failures");
            return Ok(());
        }

        loop {
            run.iteration += 1;
            let newly_unfixable = run.ledger.observe(&baseline.failures, run.iteration);
            run.event(
                EventKind::IterationStarted,
                format!(
                    "Iteration {}/{} started: {} failure(s) detected",
                    run.iteration,
                    run.max_retries,
                    baseline.failures.len()
                ),
            );
            for failure in &newly_unfixable {
                run.event(
                    EventKind::Skipped,
                    format!(
                        "{} in {} keeps recurring, marked unfixable for this run",
                        failure.kind,
                        describe_location(failure)
                    ),
                );
            }

            let targets = run.ledger.actionable(&baseline.failures);
            if targets.is_empty() {
                self.advance(run, RunState::Exhausted)?;
                run.event(
                    EventKind::Exhausted,
                    format!(
                        "EXHAUSTED: {} unresolved failure(s) are unfixable in this run",
                        baseline.failures.len()
                    ),
                );
                return Ok(());
            }

            let mut accepted: Vec<Fix> = Vec::new();
            for failure in targets {
                // 本轮前面的补丁可能已顺带解决它
                if !baseline.contains(&failure) {
                    continue;
                }
                self.advance(run, RunState::Fixing)?;
                if let Some(fix) = self
                    .attempt(run, &stages, &snapshot, &failure, &mut baseline)
                    .await?
                {
                    accepted.push(fix);
                }
            }

            self.commit(run, &snapshot, plan_commits(&self.cfg.healing.commit_prefix, &accepted))
                .await;

            // 迭代边界：收敛 / 取消 / 预算耗尽 / 重试
            if baseline.failures.is_empty() {
                self.advance(run, RunState::Converged)?;
                run.event(
                    EventKind::Converged,
                    format!("CONVERGED: all failures resolved after {} iteration(s)", run.iteration),
                );
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                run.cancelled = true;
                run.event(
                    EventKind::Cancelled,
                    format!(
                        "Run cancelled after iteration {} with {} unresolved failure(s)",
                        run.iteration,
                        baseline.failures.len()
                    ),
                );
                return Ok(());
            }
            if run.iteration >= run.max_retries {
                self.advance(run, RunState::Exhausted)?;
                run.event(
                    EventKind::Exhausted,
                    format!(
                        "EXHAUSTED: retry budget of {} consumed with {} unresolved failure(s)",
                        run.max_retries,
                        baseline.failures.len()
                    ),
                );
                return Ok(());
            }

            self.advance(run, RunState::Retry)?;
            run.decay_temperature();
            tracing::info!(
                run_id = %run.id,
                unresolved = baseline.failures.len(),
                actionable = run.ledger.actionable_unresolved(),
                temperature = run.temperature,
                "retrying"
            );
            self.advance(run, RunState::Analyzing)?;
        }
    }

    /// 对单个失败执行 根因 → 补丁 → 验证；返回被接受的修复
    async fn attempt(
        &self,
        run: &mut Run,
        stages: &Stages,
        snapshot: &Snapshot,
        failure: &Failure,
        baseline: &mut Baseline,
    ) -> Result<Option<Fix>, HealError> {
        run.event(
            EventKind::Attempt,
            format!("Attempting {} in {}", failure.kind, describe_location(failure)),
        );

        let cause = match stages.resolver.resolve(snapshot, failure, run.temperature).await {
            ResolveOutcome::Explained(cause) => cause,
            ResolveOutcome::Unavailable(e) => {
                self.advance(run, RunState::Validating)?;
                self.absorb(run, failure, HealError::ReasoningUnavailable(e))?;
                return Ok(None);
            }
        };

        let candidate = match stages
            .generator
            .propose(snapshot, failure, &cause, run.temperature)
            .await
        {
            Ok(candidate) => candidate,
            Err(e) => {
                self.advance(run, RunState::Validating)?;
                self.absorb(run, failure, e)?;
                return Ok(None);
            }
        };

        self.advance(run, RunState::Validating)?;
        let verdict = match stages
            .validator
            .validate(snapshot, failure, &candidate, baseline, run.iteration, run.temperature)
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                self.absorb(run, failure, e)?;
                return Ok(None);
            }
        };

        match verdict {
            Verdict::Accepted {
                fix,
                baseline: next,
                exposed,
                syntax_masked,
            } => {
                *baseline = next;
                run.ledger.record_fix(fix.clone());
                run.ledger.settle(&baseline.failures);
                run.event(
                    EventKind::Accepted,
                    format!(
                        "Fix accepted for {} in {}: {}",
                        fix.kind,
                        describe_location(failure),
                        fix.commit_message
                    ),
                );
                if syntax_masked {
                    run.event(
                        EventKind::Classified,
                        format!(
                            "Syntax fix in {} exposed {} hidden failure(s), queued for the next iteration",
                            fix.file_path,
                            exposed.len()
                        ),
                    );
                } else if !exposed.is_empty() {
                    run.event(
                        EventKind::Classified,
                        format!("{} new failure(s) surfaced after the fix", exposed.len()),
                    );
                }
                Ok(Some(fix))
            }
            Verdict::Rejected { fix, reason } => {
                run.ledger.record_fix(fix);
                self.absorb(run, failure, HealError::RegressionDetected(reason))?;
                Ok(None)
            }
            Verdict::Inconclusive { reason } => {
                run.event(
                    EventKind::Skipped,
                    format!(
                        "Skipped {} in {} this iteration: {reason}, patch withdrawn",
                        failure.kind,
                        describe_location(failure)
                    ),
                );
                Ok(None)
            }
        }
    }

    /// 按恢复策略吸收阶段错误；只有 AbortRun 会继续向上传播
    fn absorb(&self, run: &mut Run, failure: &Failure, err: HealError) -> Result<(), HealError> {
        let location = describe_location(failure);
        match self.recovery.handle(&err, true) {
            RecoveryAction::AbortRun(_) => return Err(err),
            RecoveryAction::RecordRejected(reason) => run.event(
                EventKind::Rejected,
                format!("Patch for {} in {location} rolled back: {reason}", failure.kind),
            ),
            RecoveryAction::SkipThisIteration(reason) | RecoveryAction::ReAsk(reason) => run.event(
                EventKind::Skipped,
                format!("Skipped {} in {location} this iteration: {reason}", failure.kind),
            ),
            RecoveryAction::Escalate => run.event(
                EventKind::Skipped,
                format!("Skipped {} in {location} this iteration: {err}", failure.kind),
            ),
        }
        Ok(())
    }

    /// 记录提交单元；配置了提交方时实际提交，失败只记事件
    async fn commit(&self, run: &mut Run, snapshot: &Snapshot, units: Vec<CommitUnit>) {
        run.commit_count += units.len() as u32;
        for unit in units {
            let outcome = match &self.committer {
                Some(committer) => Some(committer.commit(snapshot, &unit).await),
                None => None,
            };
            let description = match outcome {
                Some(Ok(id)) => format!("Committed {id} on {}: {}", run.branch_name, unit.message),
                Some(Err(e)) => format!("Commit failed for \"{}\": {e}", unit.message),
                None => format!("Commit planned: {} ({} file(s))", unit.message, unit.files.len()),
            };
            run.event(EventKind::Committed, description);
        }
    }

    /// 评分（恰好一次）并写出终态记录
    fn finalize(&self, run: &mut Run) -> Result<ResultRecord, RecordError> {
        if let Err(e) = run.transition(RunState::Scoring) {
            tracing::error!(run_id = %run.id, error = %e, "cannot enter scoring");
            run.aborted = true;
        }
        let scoring = score(&ScoreInputs {
            elapsed: run.started.elapsed(),
            commit_count: run.commit_count,
            fixes_resolved: run.ledger.total_fixes(),
            total_failures: run.ledger.total_failures(),
        });
        run.scoring = Some(scoring);

        let terminal = run.terminal_state();
        if let Err(e) = run.transition(terminal) {
            tracing::error!(run_id = %run.id, error = %e, "cannot enter terminal state");
        }
        let final_score = run.scoring.as_ref().map(|s| s.final_ci_score).unwrap_or_default();
        run.event(
            EventKind::Finalized,
            format!(
                "Run finished {}: {}/{} failure(s) fixed, {} commit(s), score {}",
                terminal,
                run.ledger.total_fixes(),
                run.ledger.total_failures(),
                run.commit_count,
                final_score
            ),
        );

        let record = run.to_record(self.usage());
        let path = self.store.write(&record)?;
        tracing::info!(
            run_id = %run.id,
            status = %terminal,
            score = final_score,
            path = %path.display(),
            "result record finalized"
        );
        Ok(record)
    }

    /// 迁移状态；对外状态变化时写出中间记录
    fn advance(&self, run: &mut Run, next: RunState) -> Result<(), HealError> {
        if run.transition(next)? {
            self.publish(run);
        }
        Ok(())
    }

    /// 中间记录写入失败不影响 Run
    fn publish(&self, run: &Run) {
        if let Err(e) = self.store.write(&run.to_record(self.usage())) {
            tracing::warn!(run_id = %run.id, error = %e, "intermediate result record not written");
        }
    }

    fn usage(&self) -> LlmUsage {
        LlmUsage {
            primary_model: self.router.primary_model(),
            fallback_model: self.router.fallback_model(),
            fallback_triggered: self.router.fallback_triggered(),
        }
    }
}

fn describe_location(failure: &Failure) -> String {
    match failure.line {
        Some(line) => format!("{}:{}", failure.file_path, line),
        None => failure.file_path.clone(),
    }
}
