use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Branches that must never be pushed to directly.
pub const PROTECTED_BRANCHES: &[&str] = &["main", "master"];

pub fn is_protected_branch(branch: &str) -> bool {
    PROTECTED_BRANCHES.contains(&branch)
}

/// Validate that a branch name is safe: matches `^[a-zA-Z0-9/_.-]+$` and does
/// not start with `refs/`. Rejected names never reach a subprocess.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("branch name must not be empty".to_string()));
    }
    if name.starts_with("refs/") {
        return Err(Error::Validation(format!(
            "branch name must not start with 'refs/': {name}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '.' || c == '-')
    {
        return Err(Error::Validation(format!(
            "branch name contains invalid characters (allowed: a-zA-Z0-9/_.-): {name}"
        )));
    }
    Ok(())
}

/// Validate a review comment identifier (`^[a-zA-Z0-9_-]+$`).
pub fn validate_comment_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation("comment id must not be empty".to_string()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Validation(format!(
            "comment id contains invalid characters (allowed: a-zA-Z0-9_-): {id}"
        )));
    }
    Ok(())
}

/// Validate a pull request number (must be positive).
pub fn validate_pr_number(number: u64) -> Result<()> {
    if number == 0 {
        return Err(Error::Validation("pr number must be positive".to_string()));
    }
    Ok(())
}

fn is_rate_limit(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("secondary rate")
        || lower.contains("abuse detection")
        || lower.contains("http 429")
        || lower.contains("status: 429")
}

/// One subprocess invocation: program, argv, and optional stdin document.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

/// Captured output from a completed subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over subprocess execution for testability. The real
/// implementation is [`ProcessClient`]; tests script responses instead.
#[async_trait]
pub trait CommandClient: Send + Sync {
    /// Run the command to completion. `Err` means the process could not be
    /// spawned or waited on; a nonzero exit is reported in the output.
    async fn output(&self, spec: CommandSpec) -> Result<CommandOutput>;
}

/// Real subprocess client running commands in a fixed working directory.
pub struct ProcessClient {
    working_dir: PathBuf,
}

impl ProcessClient {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl CommandClient for ProcessClient {
    async fn output(&self, spec: CommandSpec) -> Result<CommandOutput> {
        debug!(program = %spec.program, args = ?spec.args, "running command");

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&self.working_dir)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", spec.program)))?;

        if let Some(input) = &spec.stdin {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::Process("child stdin is not piped".to_string()))?;
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| Error::Process(format!("failed to write stdin: {e}")))?;
            // Close stdin so the child sees EOF.
            drop(stdin);
        }

        let out = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Process(format!("wait error: {e}")))?;

        Ok(CommandOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }
}

/// An open pull request snapshot from the hosting service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub branch: String,
}

/// A single review comment on a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewComment {
    pub id: String,
    pub body: String,
    pub path: String,
    pub line: u64,
}

/// Repository owner/name, resolved once via `gh repo view`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoIdentity {
    pub owner: String,
    pub name: String,
}

/// Result of one quality gate (tests, type-check, or lint). A failing gate is
/// data, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityResult {
    pub passed: bool,
    pub errors: Vec<String>,
}

/// The three external quality-gate commands, as shell strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCommands {
    pub test: String,
    pub typecheck: String,
    pub lint: String,
}

impl Default for GateCommands {
    fn default() -> Self {
        Self {
            test: "npm test".to_string(),
            typecheck: "npm run typecheck".to_string(),
            lint: "npm run lint".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhPr {
    number: u64,
    title: String,
    #[serde(rename = "headRefName")]
    head_ref_name: String,
}

#[derive(Debug, Deserialize)]
struct GhReviewComment {
    id: u64,
    body: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    line: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RepoView {
    name: String,
    owner: RepoViewOwner,
}

#[derive(Debug, Deserialize)]
struct RepoViewOwner {
    login: String,
}

/// Typed wrapper over the `git` and `gh` command-line tools plus the three
/// quality-gate commands. All identifier inputs are validated before any
/// subprocess is invoked.
pub struct RepoCommands {
    client: Arc<dyn CommandClient>,
    gates: GateCommands,
    repo: OnceCell<RepoIdentity>,
}

impl RepoCommands {
    pub fn new(client: Arc<dyn CommandClient>, gates: GateCommands) -> Self {
        Self {
            client,
            gates,
            repo: OnceCell::new(),
        }
    }

    async fn run(&self, program: &str, args: Vec<String>, stdin: Option<String>) -> Result<String> {
        let display = args.first().cloned().unwrap_or_default();
        let out = self
            .client
            .output(CommandSpec {
                program: program.to_string(),
                args,
                stdin,
            })
            .await?;

        if out.success() {
            return Ok(out.stdout);
        }

        let detail = if out.stderr.trim().is_empty() {
            out.stdout.trim().to_string()
        } else {
            out.stderr.trim().to_string()
        };

        if is_rate_limit(&detail) {
            Err(Error::RateLimited(detail))
        } else {
            Err(Error::Command(format!("{program} {display}: {detail}")))
        }
    }

    /// List open pull requests with their head branch.
    pub async fn list_open_prs(&self) -> Result<Vec<PullRequest>> {
        let json = self
            .run(
                "gh",
                to_args(&[
                    "pr",
                    "list",
                    "--state",
                    "open",
                    "--json",
                    "number,title,headRefName",
                    "--limit",
                    "100",
                ]),
                None,
            )
            .await?;

        let prs: Vec<GhPr> = serde_json::from_str(&json)
            .map_err(|e| Error::Command(format!("failed to parse pr list: {e}")))?;

        let prs: Vec<PullRequest> = prs
            .into_iter()
            .map(|pr| PullRequest {
                number: pr.number,
                title: pr.title,
                branch: pr.head_ref_name,
            })
            .collect();

        debug!(count = prs.len(), "fetched open pull requests");
        Ok(prs)
    }

    /// Fetch the review comments for one pull request.
    pub async fn review_comments(&self, pr_number: u64) -> Result<Vec<ReviewComment>> {
        validate_pr_number(pr_number)?;
        let repo = self.resolve_repo_identity().await?;

        let json = self
            .run(
                "gh",
                to_args(&[
                    "api",
                    &format!(
                        "repos/{}/{}/pulls/{pr_number}/comments",
                        repo.owner, repo.name
                    ),
                ]),
                None,
            )
            .await?;

        let comments: Vec<GhReviewComment> = serde_json::from_str(&json)
            .map_err(|e| Error::Command(format!("failed to parse review comments: {e}")))?;

        Ok(comments
            .into_iter()
            .map(|c| ReviewComment {
                id: c.id.to_string(),
                body: c.body,
                path: c.path.unwrap_or_default(),
                line: c.line.unwrap_or(0),
            })
            .collect())
    }

    /// Reply to a review comment. The body is sent as a JSON document on
    /// stdin, never interpolated into the command line, so arbitrary comment
    /// text cannot break out of the argument.
    pub async fn reply_to_comment(&self, pr_number: u64, comment_id: &str, body: &str) -> Result<()> {
        validate_pr_number(pr_number)?;
        validate_comment_id(comment_id)?;
        let repo = self.resolve_repo_identity().await?;

        let payload = serde_json::json!({ "body": body }).to_string();
        self.run(
            "gh",
            to_args(&[
                "api",
                &format!(
                    "repos/{}/{}/pulls/{pr_number}/comments/{comment_id}/replies",
                    repo.owner, repo.name
                ),
                "--method",
                "POST",
                "--input",
                "-",
            ]),
            Some(payload),
        )
        .await?;
        Ok(())
    }

    /// Resolve repository owner/name. Memoized after the first success.
    pub async fn resolve_repo_identity(&self) -> Result<RepoIdentity> {
        self.repo
            .get_or_try_init(|| async {
                let json = self
                    .run("gh", to_args(&["repo", "view", "--json", "owner,name"]), None)
                    .await?;
                let info: RepoView = serde_json::from_str(&json)
                    .map_err(|e| Error::Command(format!("failed to parse repo identity: {e}")))?;
                Ok(RepoIdentity {
                    owner: info.owner.login,
                    name: info.name,
                })
            })
            .await
            .cloned()
    }

    /// Check out a branch. On a "branch not found locally" signal, performs
    /// exactly one remote fetch and retries the checkout once.
    pub async fn checkout_branch(&self, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        match self.run("git", to_args(&["checkout", branch]), None).await {
            Ok(_) => Ok(()),
            Err(Error::Command(msg))
                if msg.contains("did not match any file") || msg.contains("pathspec") =>
            {
                debug!(branch, "branch not found locally, fetching and retrying");
                self.fetch_branch(branch).await?;
                self.run("git", to_args(&["checkout", branch]), None)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn fetch_branch(&self, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        self.run("git", to_args(&["fetch", "origin", branch]), None)
            .await
            .map(|_| ())
    }

    pub async fn pull_latest(&self, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        self.run("git", to_args(&["pull", "--ff-only", "origin", branch]), None)
            .await
            .map(|_| ())
    }

    pub async fn current_branch(&self) -> Result<String> {
        let out = self
            .run("git", to_args(&["rev-parse", "--abbrev-ref", "HEAD"]), None)
            .await?;
        Ok(out.trim().to_string())
    }

    pub async fn is_dirty(&self) -> Result<bool> {
        let out = self
            .run("git", to_args(&["status", "--porcelain"]), None)
            .await?;
        Ok(!out.trim().is_empty())
    }

    pub async fn stash_save(&self, label: &str) -> Result<()> {
        self.run("git", to_args(&["stash", "push", "-u", "-m", label]), None)
            .await
            .map(|_| ())
    }

    pub async fn stash_pop(&self) -> Result<()> {
        self.run("git", to_args(&["stash", "pop"]), None)
            .await
            .map(|_| ())
    }

    pub async fn run_tests(&self) -> Result<QualityResult> {
        self.run_gate("tests", &self.gates.test).await
    }

    pub async fn run_type_check(&self) -> Result<QualityResult> {
        self.run_gate("typecheck", &self.gates.typecheck).await
    }

    pub async fn run_lint(&self) -> Result<QualityResult> {
        self.run_gate("lint", &self.gates.lint).await
    }

    async fn run_gate(&self, name: &str, command: &str) -> Result<QualityResult> {
        let words = shell_words::split(command)
            .map_err(|e| Error::Validation(format!("invalid {name} command '{command}': {e}")))?;
        let Some((program, args)) = words.split_first() else {
            return Err(Error::Validation(format!("{name} command is empty")));
        };

        let out = self
            .client
            .output(CommandSpec {
                program: program.clone(),
                args: args.to_vec(),
                stdin: None,
            })
            .await?;

        if out.success() {
            return Ok(QualityResult {
                passed: true,
                errors: Vec::new(),
            });
        }

        let source = if out.stderr.trim().is_empty() {
            &out.stdout
        } else {
            &out.stderr
        };
        let errors: Vec<String> = source
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| format!("{name}: {l}"))
            .collect();

        Ok(QualityResult {
            passed: false,
            errors: if errors.is_empty() {
                vec![format!("{name}: exited with code {}", out.exit_code)]
            } else {
                errors
            },
        })
    }

    pub async fn stage_changes(&self) -> Result<()> {
        self.run("git", to_args(&["add", "-A"]), None)
            .await
            .map(|_| ())
    }

    /// Create a commit. The message is written to a private temporary file
    /// referenced with `-F`; the file is removed when the guard drops, whether
    /// the commit succeeded or not.
    pub async fn create_commit(&self, message: &str) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| Error::Process(format!("failed to create commit message file: {e}")))?;
        file.write_all(message.as_bytes())
            .map_err(|e| Error::Process(format!("failed to write commit message: {e}")))?;
        file.flush()
            .map_err(|e| Error::Process(format!("failed to flush commit message: {e}")))?;

        let path = file.path().to_string_lossy().to_string();
        let result = self
            .run("git", to_args(&["commit", "-F", &path]), None)
            .await;
        // `file` drops here, removing the temp file regardless of outcome.
        result.map(|_| ())
    }

    /// Push a branch to origin. Protected branches are refused outright,
    /// before any subprocess runs; this is a hard invariant, not a retryable
    /// failure.
    pub async fn push_to_branch(&self, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        if is_protected_branch(branch) {
            return Err(Error::Permanent(format!(
                "refusing to push to protected branch '{branch}'"
            )));
        }
        info!(branch, "pushing to origin");
        self.run("git", to_args(&["push", "origin", branch]), None)
            .await
            .map(|_| ())
    }

    pub async fn commit_sha(&self) -> Result<String> {
        let out = self.run("git", to_args(&["rev-parse", "HEAD"]), None).await?;
        Ok(out.trim().to_string())
    }
}

fn to_args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedClient;

    fn commands(client: Arc<ScriptedClient>) -> RepoCommands {
        RepoCommands::new(client, GateCommands::default())
    }

    #[test]
    fn validate_branch_name_accepts_safe_names() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("feature/fix-null-check").is_ok());
        assert!(validate_branch_name("v1.2.3").is_ok());
    }

    #[test]
    fn validate_branch_name_rejects_unsafe_names() {
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("refs/heads/main").is_err());
        assert!(validate_branch_name("branch; rm -rf /").is_err());
        assert!(validate_branch_name("branch`id`").is_err());
    }

    #[test]
    fn validate_comment_id_rejects_injection() {
        assert!(validate_comment_id("123456").is_ok());
        assert!(validate_comment_id("abc_DEF-9").is_ok());
        assert!(validate_comment_id("").is_err());
        assert!(validate_comment_id("1;ls").is_err());
        assert!(validate_comment_id("1 2").is_err());
    }

    #[test]
    fn validate_pr_number_rejects_zero() {
        assert!(validate_pr_number(0).is_err());
        assert!(validate_pr_number(7).is_ok());
    }

    #[tokio::test]
    async fn push_to_protected_branch_never_invokes_git() {
        let client = Arc::new(ScriptedClient::new());
        let cmds = commands(client.clone());

        for branch in ["main", "master"] {
            let err = cmds.push_to_branch(branch).await.unwrap_err();
            assert!(err.is_permanent(), "push to {branch} must be permanent");
        }
        assert!(client.calls().is_empty(), "no command may be issued");
    }

    #[tokio::test]
    async fn push_to_feature_branch_runs_git_push() {
        let client = Arc::new(ScriptedClient::new());
        let cmds = commands(client.clone());
        cmds.push_to_branch("fix/null-check").await.unwrap();
        assert!(client.was_called("git push origin fix/null-check"));
    }

    #[tokio::test]
    async fn invalid_branch_fails_before_any_command() {
        let client = Arc::new(ScriptedClient::new());
        let cmds = commands(client.clone());
        let err = cmds.checkout_branch("bad branch").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_stderr_raises_distinct_error() {
        let client = Arc::new(ScriptedClient::new());
        client.err_exit("gh pr list", 1, "API rate limit exceeded for user");
        let cmds = commands(client);
        let err = cmds.list_open_prs().await.unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn checkout_fetches_once_and_retries_on_missing_branch() {
        let client = Arc::new(ScriptedClient::new());
        client.err_exit(
            "git checkout feature/x",
            1,
            "error: pathspec 'feature/x' did not match any file(s) known to git",
        );
        // Second checkout attempt (after the fetch) succeeds by default.
        let cmds = commands(client.clone());
        cmds.checkout_branch("feature/x").await.unwrap();

        assert_eq!(client.count_calls("git checkout feature/x"), 2);
        assert_eq!(client.count_calls("git fetch origin feature/x"), 1);
    }

    #[tokio::test]
    async fn checkout_surfaces_other_failures_without_fetch() {
        let client = Arc::new(ScriptedClient::new());
        client.err_exit("git checkout feature/x", 1, "fatal: index locked");
        client.err_exit("git checkout feature/x", 1, "fatal: index locked");
        let cmds = commands(client.clone());
        assert!(cmds.checkout_branch("feature/x").await.is_err());
        assert_eq!(client.count_calls("git fetch"), 0);
    }

    #[tokio::test]
    async fn reply_sends_body_on_stdin_as_json() {
        let client = Arc::new(ScriptedClient::new());
        client.ok(
            "gh repo view",
            r#"{"name":"repo","owner":{"login":"owner"}}"#,
        );
        let cmds = commands(client.clone());

        let body = "tricky `body` with \"quotes\"\nand newlines";
        cmds.reply_to_comment(5, "991", body).await.unwrap();

        let reply_call = client
            .calls()
            .into_iter()
            .find(|c| c.args.iter().any(|a| a.contains("/replies")))
            .expect("reply call issued");
        let stdin = reply_call.stdin.expect("body sent via stdin");
        let parsed: serde_json::Value = serde_json::from_str(&stdin).unwrap();
        assert_eq!(parsed["body"], body);
        // The raw body never appears in argv.
        assert!(reply_call.args.iter().all(|a| !a.contains("tricky")));
    }

    #[tokio::test]
    async fn repo_identity_is_memoized() {
        let client = Arc::new(ScriptedClient::new());
        client.ok(
            "gh repo view",
            r#"{"name":"repo","owner":{"login":"owner"}}"#,
        );
        let cmds = commands(client.clone());

        let first = cmds.resolve_repo_identity().await.unwrap();
        let second = cmds.resolve_repo_identity().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.count_calls("gh repo view"), 1);
    }

    #[tokio::test]
    async fn list_open_prs_parses_head_ref() {
        let client = Arc::new(ScriptedClient::new());
        client.ok(
            "gh pr list",
            r#"[{"number":12,"title":"Fix parser","headRefName":"fix/parser"}]"#,
        );
        let cmds = commands(client);
        let prs = cmds.list_open_prs().await.unwrap();
        assert_eq!(
            prs,
            vec![PullRequest {
                number: 12,
                title: "Fix parser".to_string(),
                branch: "fix/parser".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn review_comments_maps_ids_to_strings() {
        let client = Arc::new(ScriptedClient::new());
        client.ok(
            "gh repo view",
            r#"{"name":"repo","owner":{"login":"owner"}}"#,
        );
        client.ok(
            "gh api repos/owner/repo/pulls/3/comments",
            r#"[{"id":42,"body":"please fix","path":"src/a.ts","line":10},
                {"id":43,"body":"top-level note","path":null,"line":null}]"#,
        );
        let cmds = commands(client);
        let comments = cmds.review_comments(3).await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].id, "42");
        assert_eq!(comments[0].line, 10);
        assert_eq!(comments[1].path, "");
        assert_eq!(comments[1].line, 0);
    }

    #[tokio::test]
    async fn failing_gate_returns_data_not_error() {
        let client = Arc::new(ScriptedClient::new());
        client.err_exit("npm test", 1, "2 tests failed\n");
        let cmds = commands(client);
        let result = cmds.run_tests().await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.errors, vec!["tests: 2 tests failed"]);
    }

    #[tokio::test]
    async fn passing_gate_has_no_errors() {
        let client = Arc::new(ScriptedClient::new());
        let cmds = commands(client);
        let result = cmds.run_lint().await.unwrap();
        assert!(result.passed);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn commit_message_goes_through_temp_file_and_is_removed() {
        let client = Arc::new(ScriptedClient::new());
        let cmds = commands(client.clone());
        cmds.create_commit("fix: address review feedback\n\ndetails")
            .await
            .unwrap();

        let commit_call = client
            .calls()
            .into_iter()
            .find(|c| c.args.first().map(String::as_str) == Some("commit"))
            .expect("commit call issued");
        assert_eq!(
            commit_call.commit_file.as_deref(),
            Some("fix: address review feedback\n\ndetails")
        );
        let path_arg = commit_call.args.last().unwrap().clone();
        assert!(
            !std::path::Path::new(&path_arg).exists(),
            "temp message file must be removed"
        );
    }

    #[tokio::test]
    async fn commit_temp_file_removed_even_when_commit_fails() {
        let client = Arc::new(ScriptedClient::new());
        client.err_exit("git commit", 1, "nothing to commit");
        let cmds = commands(client.clone());
        assert!(cmds.create_commit("msg").await.is_err());

        let commit_call = client
            .calls()
            .into_iter()
            .find(|c| c.args.first().map(String::as_str) == Some("commit"))
            .unwrap();
        let path_arg = commit_call.args.last().unwrap().clone();
        assert!(!std::path::Path::new(&path_arg).exists());
    }
}
