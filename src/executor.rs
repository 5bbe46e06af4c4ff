use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::commands::{QualityResult, RepoCommands};
use crate::error::{Error, Result};
use crate::monitor::RemediationTask;

/// Attempt bound for one remediation cycle.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Stash label prefix so autosaved work is recognizable in `git stash list`.
pub const STASH_LABEL_PREFIX: &str = "patrol-autosave";

/// Exclusive, temporary ownership of the shared working copy for one task.
/// Must be restored before the working copy is safe for any other use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub original_branch: Option<String>,
    pub stash_created: bool,
}

/// Aggregate of the three quality gates: AND over `passed`, concatenation
/// over `errors`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityGateResult {
    pub passed: bool,
    pub errors: Vec<String>,
}

impl QualityGateResult {
    pub fn aggregate(tests: QualityResult, typecheck: QualityResult, lint: QualityResult) -> Self {
        let passed = tests.passed && typecheck.passed && lint.passed;
        let mut errors = Vec::new();
        errors.extend(tests.errors);
        errors.extend(typecheck.errors);
        errors.extend(lint.errors);
        Self { passed, errors }
    }
}

/// What happened to one task. Gate failures are reported here as data, not
/// raised as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub gates: QualityGateResult,
    pub pushed: bool,
    pub commit_sha: Option<String>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn commit_message(task: &RemediationTask) -> String {
    // Truncate by characters, not bytes; comment bodies are arbitrary
    // reviewer text and a byte cut could land inside a multi-byte character.
    let trimmed = task.comment_body.trim();
    let mut summary: String = trimmed.chars().take(200).collect();
    if summary.len() < trimmed.len() {
        summary.push_str("...");
    }
    format!(
        "fix: address review comment {comment_id} on PR #{pr}\n\n\
         {summary}\n\n\
         Path: {path}:{line}\n\
         Suggested-Agent: {agent}\n\
         Automated-By: patrol",
        comment_id = task.comment_id,
        pr = task.pr_number,
        path = task.path,
        line = task.line,
        agent = task.suggested_agent,
    )
}

/// Drives one supervised fix cycle (checkout, quality gates, commit, push)
/// against the single shared working copy, with explicit save/restore of the
/// caller's prior git state. Correctness depends on at most one task running
/// at a time.
pub struct RemediationExecutor {
    commands: Arc<RepoCommands>,
    max_attempts: u32,
    needs_escalation: AtomicBool,
}

impl RemediationExecutor {
    pub fn new(commands: Arc<RepoCommands>) -> Self {
        Self::with_max_attempts(commands, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(commands: Arc<RepoCommands>, max_attempts: u32) -> Self {
        Self {
            commands,
            max_attempts,
            needs_escalation: AtomicBool::new(false),
        }
    }

    /// Sticky flag set once retries are exhausted. Polled by an external
    /// supervisor that decides whether to alert a human.
    pub fn needs_escalation(&self) -> bool {
        self.needs_escalation.load(Ordering::SeqCst)
    }

    /// Run one task. The saved context is restored whether the cycle
    /// succeeded or failed: the working copy is never left on a feature
    /// branch or with a dangling stash.
    pub async fn execute(&self, task: &RemediationTask) -> Result<TaskOutcome> {
        info!(
            pr = task.pr_number,
            comment_id = %task.comment_id,
            branch = %task.branch,
            "executing remediation task"
        );

        let ctx = self.save_context().await?;
        let result = self
            .execute_with_retry(|| self.attempt(task), self.max_attempts)
            .await;
        let restore = self.restore_context(&ctx).await;

        let outcome = match result {
            Ok(outcome) => Ok(outcome),
            // Exhausted attempts on failing gates: escalation is already
            // flagged; surface the gate result as data.
            Err(Error::QualityGates(errors)) => Ok(TaskOutcome {
                gates: QualityGateResult {
                    passed: false,
                    errors,
                },
                pushed: false,
                commit_sha: None,
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = restore {
            warn!(error = %e, "failed to restore working copy state");
            if outcome.is_ok() {
                return Err(e);
            }
        }
        outcome
    }

    /// Retry wrapper for any step. Permanent failures re-raise immediately
    /// without consuming a retry; exhausting the attempt bound sets the
    /// sticky escalation flag and surfaces the last error.
    pub async fn execute_with_retry<T, Fut>(
        &self,
        mut op: impl FnMut() -> Fut,
        max_attempts: u32,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut last: Option<Error> = None;
        for attempt in 1..=max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "remediation step failed");
                    last = Some(e);
                }
            }
        }
        self.needs_escalation.store(true, Ordering::SeqCst);
        warn!(max_attempts, "retries exhausted, flagging for escalation");
        Err(last.unwrap_or_else(|| Error::Command("no attempts were made".to_string())))
    }

    async fn attempt(&self, task: &RemediationTask) -> Result<TaskOutcome> {
        self.commands.checkout_branch(&task.branch).await?;
        self.commands.pull_latest(&task.branch).await?;

        // The three gates are independent read-only checks; run them
        // concurrently and aggregate.
        let (tests, typecheck, lint) = tokio::join!(
            self.commands.run_tests(),
            self.commands.run_type_check(),
            self.commands.run_lint()
        );
        let gates = QualityGateResult::aggregate(tests?, typecheck?, lint?);
        if !gates.passed {
            return Err(Error::QualityGates(gates.errors));
        }

        self.commands.stage_changes().await?;
        self.commands.create_commit(&commit_message(task)).await?;
        self.commands.push_to_branch(&task.branch).await?;
        let commit_sha = self.commands.commit_sha().await.ok();

        info!(
            pr = task.pr_number,
            sha = commit_sha.as_deref().unwrap_or("unknown"),
            "pushed remediation commit"
        );
        Ok(TaskOutcome {
            gates,
            pushed: true,
            commit_sha,
        })
    }

    async fn save_context(&self) -> Result<ExecutionContext> {
        let original_branch = self.commands.current_branch().await.ok();
        let mut stash_created = false;
        if self.commands.is_dirty().await? {
            let label = format!("{STASH_LABEL_PREFIX}-{}", now_secs());
            self.commands.stash_save(&label).await?;
            stash_created = true;
        }
        Ok(ExecutionContext {
            original_branch,
            stash_created,
        })
    }

    async fn restore_context(&self, ctx: &ExecutionContext) -> Result<()> {
        if let Some(branch) = &ctx.original_branch {
            self.commands.checkout_branch(branch).await?;
        }
        if ctx.stash_created {
            self.commands.stash_pop().await?;
        }
        Ok(())
    }
}
