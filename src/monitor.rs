use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::{AgentMetadata, AgentStatus, BackgroundAgent};
use crate::commands::{PullRequest, RepoCommands, ReviewComment};
use crate::error::Result;
use crate::state::StateStore;

/// Remediation tasks beyond this bound evict the oldest entry: under
/// sustained overload the queue favors recency over completeness.
pub const QUEUE_CAPACITY: usize = 100;

/// Comment bodies longer than this, counted in characters, are
/// non-actionable regardless of content.
pub const MAX_COMMENT_LEN: usize = 10_000;

fn exceeds_length_bound(body: &str) -> bool {
    // Cheap byte-length check first; only count characters when the body is
    // long enough for the answer to possibly be yes.
    body.len() > MAX_COMMENT_LEN && body.chars().count() > MAX_COMMENT_LEN
}

/// Checked first; any match means not actionable, even if a change-request
/// phrase appears later. Approvals are not reclassified as work items merely
/// because they contain incidental politeness words.
const APPROVAL_PHRASES: &[&str] = &["lgtm", "looks good", "approved", "\u{1F44D}", ":+1:"];

const CHANGE_REQUEST_PHRASES: &[&str] = &[
    "fix", "please", "could you", "should", "refactor", "change", "update",
];

const ACK_REPLY: &str =
    "Queued for automated remediation. A fix will be pushed to this branch shortly.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NotActionable,
    Actionable,
}

/// Classify a review comment body. Deterministic keyword rules, applied in a
/// fixed order: length denial, then approval phrases, then change-request
/// phrases, then a not-actionable default.
pub fn classify_comment(body: &str) -> Classification {
    if exceeds_length_bound(body) {
        return Classification::NotActionable;
    }
    let lower = body.to_lowercase();
    if APPROVAL_PHRASES.iter().any(|p| lower.contains(p)) {
        return Classification::NotActionable;
    }
    if CHANGE_REQUEST_PHRASES.iter().any(|p| lower.contains(p)) {
        return Classification::Actionable;
    }
    Classification::NotActionable
}

/// Pick the specialist agent for an actionable comment via an independent
/// keyword scan over the body.
pub fn suggested_agent(body: &str) -> &'static str {
    let lower = body.to_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    if matches(&["typescript", "type"]) {
        "typescript-pro"
    } else if matches(&["test", "coverage", "mock"]) {
        "test-engineer"
    } else if matches(&["performance", "optimize", "slow"]) {
        "performance-engineer"
    } else if matches(&["security", "vulnerability", "xss"]) {
        "security-auditor"
    } else if matches(&["refactor", "clean up", "cleanup", "simplify"]) {
        "refactoring-expert"
    } else {
        "debugger"
    }
}

/// One queued unit of remediation work for an actionable comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationTask {
    pub pr_number: u64,
    pub branch: String,
    pub path: String,
    pub line: u64,
    pub comment_id: String,
    pub comment_body: String,
    pub suggested_agent: String,
}

/// A `pull_request_review` event delivered by an external webhook receiver.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewEvent {
    #[serde(default)]
    pub action: Option<String>,
    pub pull_request: EventPullRequest,
    pub review: EventReview,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPullRequest {
    pub number: u64,
    pub head: EventHead,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventHead {
    #[serde(rename = "ref")]
    pub branch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventReview {
    pub id: u64,
    pub state: String,
    #[serde(default)]
    pub body: Option<String>,
}

/// Background agent that watches pull request review comments, classifies
/// them, acknowledges actionable ones, and queues remediation tasks.
pub struct ReviewMonitor {
    commands: Arc<RepoCommands>,
    store: Mutex<StateStore>,
    queue: Mutex<VecDeque<RemediationTask>>,
    running: AtomicBool,
}

impl ReviewMonitor {
    pub const NAME: &'static str = "pr-review-monitor";

    pub fn new(commands: Arc<RepoCommands>, store: StateStore) -> Self {
        Self {
            commands,
            store: Mutex::new(store),
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Append a task, evicting the oldest entry past the capacity bound.
    /// Returns the evicted task, if any.
    pub(crate) fn enqueue(&self, task: RemediationTask) -> Option<RemediationTask> {
        let mut queue = self.queue.lock().expect("task queue lock poisoned");
        let evicted = if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(task);
        if let Some(old) = &evicted {
            warn!(
                comment_id = %old.comment_id,
                "task queue full, evicted oldest task"
            );
        }
        evicted
    }

    /// Snapshot copy of the queued tasks, oldest first.
    pub fn queued_tasks(&self) -> Vec<RemediationTask> {
        self.queue
            .lock()
            .expect("task queue lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Pop the oldest queued task.
    pub fn dequeue_task(&self) -> Option<RemediationTask> {
        self.queue
            .lock()
            .expect("task queue lock poisoned")
            .pop_front()
    }

    pub fn clear_queue(&self) {
        self.queue.lock().expect("task queue lock poisoned").clear();
    }

    /// One polling pass: list open PRs, fetch all their review comments
    /// concurrently, then classify sequentially in listing order.
    pub async fn poll_once(&self) -> Result<()> {
        let prs = self.commands.list_open_prs().await?;
        debug!(count = prs.len(), "listed open pull requests");

        let fetches = prs.iter().map(|pr| {
            let commands = Arc::clone(&self.commands);
            let pr = pr.clone();
            async move {
                let comments = commands.review_comments(pr.number).await;
                (pr, comments)
            }
        });
        let results = futures::future::join_all(fetches).await;

        let mut queued = 0usize;
        for (pr, result) in results {
            let comments = match result {
                Ok(comments) => comments,
                Err(e) => {
                    warn!(pr = pr.number, error = %e, "failed to fetch review comments");
                    self.with_store(|s| s.increment_stat("fetch_errors"));
                    continue;
                }
            };
            for comment in comments {
                if self.handle_comment(&pr, &comment).await? {
                    queued += 1;
                }
            }
        }

        {
            let mut store = self.store.lock().expect("state lock poisoned");
            store.update_last_poll_time();
            store.set_last_error(None);
            store.save()?;
        }

        if queued > 0 {
            info!(queued, "queued remediation tasks");
        }
        Ok(())
    }

    /// Returns true if the comment was queued for remediation.
    async fn handle_comment(&self, pr: &PullRequest, comment: &ReviewComment) -> Result<bool> {
        if self.with_store(|s| s.is_processed(&comment.id)) {
            return Ok(false);
        }

        match classify_comment(&comment.body) {
            Classification::NotActionable => {
                self.with_store(|s| {
                    s.add_processed_comment(&comment.id);
                    s.increment_stat("ignored");
                });
                Ok(false)
            }
            Classification::Actionable => {
                if let Err(e) = self
                    .commands
                    .reply_to_comment(pr.number, &comment.id, ACK_REPLY)
                    .await
                {
                    // Rate limits abort the poll so the caller backs off; any
                    // other reply failure leaves the comment unprocessed for
                    // the next poll.
                    if e.is_rate_limited() {
                        return Err(e);
                    }
                    warn!(comment_id = %comment.id, error = %e, "failed to acknowledge comment");
                    self.with_store(|s| s.increment_stat("reply_errors"));
                    return Ok(false);
                }

                let task = RemediationTask {
                    pr_number: pr.number,
                    branch: pr.branch.clone(),
                    path: comment.path.clone(),
                    line: comment.line,
                    comment_id: comment.id.clone(),
                    comment_body: comment.body.clone(),
                    suggested_agent: suggested_agent(&comment.body).to_string(),
                };
                info!(
                    pr = pr.number,
                    comment_id = %comment.id,
                    agent = %task.suggested_agent,
                    "queueing remediation task"
                );
                let evicted = self.enqueue(task);

                self.with_store(|s| {
                    if evicted.is_some() {
                        s.increment_stat("evicted");
                    }
                    s.add_processed_comment(&comment.id);
                    s.increment_stat("queued");
                });
                Ok(true)
            }
        }
    }

    /// Handle a single externally-delivered review event. Only a review with
    /// state `changes_requested` enqueues work; approvals and plain comments
    /// are ignored. Returns true if a task was queued.
    pub async fn process_webhook(&self, event: &ReviewEvent) -> Result<bool> {
        if !event.review.state.eq_ignore_ascii_case("changes_requested") {
            debug!(state = %event.review.state, "ignoring review event");
            return Ok(false);
        }

        let dedup_id = format!("review-{}", event.review.id);
        if self.with_store(|s| s.is_processed(&dedup_id)) {
            return Ok(false);
        }

        let body = event.review.body.clone().unwrap_or_default();
        if exceeds_length_bound(&body) {
            self.with_store(|s| {
                s.add_processed_comment(&dedup_id);
                s.increment_stat("ignored");
            });
            return Ok(false);
        }

        let task = RemediationTask {
            pr_number: event.pull_request.number,
            branch: event.pull_request.head.branch.clone(),
            // Review-level events carry no file position.
            path: String::new(),
            line: 0,
            comment_id: dedup_id.clone(),
            comment_body: body.clone(),
            suggested_agent: suggested_agent(&body).to_string(),
        };
        info!(
            pr = event.pull_request.number,
            review = event.review.id,
            "queueing remediation task from webhook"
        );
        let evicted = self.enqueue(task);

        {
            let mut store = self.store.lock().expect("state lock poisoned");
            if evicted.is_some() {
                store.increment_stat("evicted");
            }
            store.add_processed_comment(&dedup_id);
            store.increment_stat("queued");
            store.save()?;
        }
        Ok(true)
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut StateStore) -> T) -> T {
        let mut store = self.store.lock().expect("state lock poisoned");
        f(&mut store)
    }
}

#[async_trait]
impl BackgroundAgent for ReviewMonitor {
    fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            name: Self::NAME.to_string(),
            description: "Watches PR review comments and queues remediation tasks".to_string(),
        }
    }

    async fn initialize(&self) -> Result<()> {
        self.with_store(StateStore::load);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(agent = Self::NAME, "started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.with_store(StateStore::save)?;
        info!(agent = Self::NAME, "stopped");
        Ok(())
    }

    async fn poll(&self) -> Result<()> {
        match self.poll_once().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.with_store(|s| {
                    s.set_last_error(Some(e.to_string()));
                    if let Err(save_err) = s.save() {
                        warn!(error = %save_err, "failed to persist poll error");
                    }
                });
                Err(e)
            }
        }
    }

    async fn status(&self) -> AgentStatus {
        let (last_poll_time, last_error, stats) = self.with_store(|s| {
            (
                s.last_poll_time(),
                s.last_error().map(str::to_string),
                s.stats().clone(),
            )
        });
        AgentStatus {
            running: self.running.load(Ordering::SeqCst),
            detail: serde_json::json!({
                "queued": self.queued_tasks().len(),
                "last_poll_time": last_poll_time,
                "last_error": last_error,
                "stats": stats,
            }),
        }
    }
}
