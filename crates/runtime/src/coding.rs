//! Coding-task delegation: hand a repository task to the reasoning engine in
//! the sandbox, with per-repo continuity.
//!
//! A repo's previous session is continued when a fast-model classifier says
//! the new task builds on it and the state is fresh (< 24 h by default);
//! otherwise work starts on a new branch.  After the engine finishes, a
//! commit gate keeps prompting while the tree is dirty or commits are
//! unpushed — a repeated state hash breaks the loop so two stuck rounds
//! cannot become an infinite one.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use minder_config::CodingConfig;
use minder_engine::{EngineError, Part, extract_text};
use minder_memory::{CodingTaskState, Store, with_retry};
use minder_sandbox::Sandbox;
use minder_tools::{Tool, ToolOutput, ToolSpec, schema_for};

use crate::coordinator::Engine;
use crate::github::{GithubApp, authed_clone_url, mint_installation_token};

/// Rounds of commit-gate follow-up prompts before giving up.
const MAX_GATE_ROUNDS: usize = 5;

#[derive(Debug, PartialEq, Eq)]
enum Strategy {
    /// Fresh branch, fresh session.
    New { branch: String },
    /// Resume the recorded branch and session.
    Continue { branch: String, session_id: Option<String> },
}

/// Staleness rule: no state, or state older than `stale_hours`, always means
/// a new branch.  `None` means the caller must ask the classifier.
fn decide_by_staleness(
    state: Option<&CodingTaskState>,
    now: i64,
    stale_hours: i64,
    branch_prefix: &str,
    task: &str,
) -> Option<Strategy> {
    match state {
        None => Some(Strategy::New {
            branch: mint_branch(branch_prefix, task),
        }),
        Some(s) if now - s.last_timestamp > stale_hours * 3_600_000 => Some(Strategy::New {
            branch: mint_branch(branch_prefix, task),
        }),
        Some(_) => None,
    }
}

/// `outie/<slug>-<hex6>`.
fn mint_branch(prefix: &str, task: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{prefix}/{}-{suffix:06x}", slugify(task))
}

fn slugify(task: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in task.chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() { "task".to_string() } else { slug }
}

/// Parse the classifier's strict-JSON verdict.  Anything unparseable is
/// `None` and the caller falls back to a new branch.
fn parse_classification(raw: &str, prefix: &str, task: &str) -> Option<Strategy> {
    #[derive(Deserialize)]
    struct Verdict {
        action: String,
        branch: Option<String>,
    }

    // The model sometimes wraps JSON in a code fence; take the outermost
    // braces.
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    let verdict: Verdict = serde_json::from_str(raw.get(start..=end)?).ok()?;
    match verdict.action.as_str() {
        "continue" => Some(Strategy::Continue {
            branch: String::new(),
            session_id: None,
        }),
        "new" => Some(Strategy::New {
            branch: verdict.branch.unwrap_or_else(|| mint_branch(prefix, task)),
        }),
        _ => None,
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RunCodingTaskArgs {
    /// HTTPS clone URL of the repository.
    repo_url: String,
    /// What to build or fix.
    task: String,
}

pub struct RunCodingTaskTool {
    pub store: Arc<Store>,
    pub engine: Arc<dyn Engine>,
    pub sandbox: Arc<dyn Sandbox>,
    pub coding: CodingConfig,
    pub fast_model: String,
    pub model: String,
    pub workdir: String,
    pub github: Option<GithubApp>,
}

#[async_trait]
impl Tool for RunCodingTaskTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_coding_task".to_string(),
            description: "Delegate a coding task on a git repository to the sandboxed coding \
                          engine. Related follow-up tasks continue on the same branch."
                .to_string(),
            input_schema: schema_for::<RunCodingTaskArgs>(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolOutput> {
        let args: RunCodingTaskArgs = serde_json::from_value(args.clone())?;
        let now = chrono::Utc::now().timestamp_millis();

        let state = self.store.get_coding_task_state(&args.repo_url)?;
        let strategy = match decide_by_staleness(
            state.as_ref(),
            now,
            self.coding.stale_hours,
            &self.coding.branch_prefix,
            &args.task,
        ) {
            Some(strategy) => strategy,
            None => {
                let prev = state.as_ref().expect("classifier path requires state");
                self.classify(prev, &args.task).await
            }
        };
        let (branch, resume_session) = match &strategy {
            Strategy::New { branch } => (branch.clone(), None),
            Strategy::Continue { session_id, .. } => {
                let prev = state.as_ref().expect("continue requires state");
                (
                    prev.branch.clone(),
                    session_id.clone().or_else(|| prev.session_id.clone()),
                )
            }
        };
        info!(repo = %args.repo_url, %branch, resuming = resume_session.is_some(), "coding task starting");

        // Installation token: fatal for the call when GitHub is configured
        // but the mint fails; without credentials public clones still work.
        let token = match &self.github {
            Some(app) => match mint_installation_token(app).await {
                Ok(token) => Some(token),
                Err(err) => return Ok(ToolOutput::error(format!("GitHub token: {err}"))),
            },
            None => None,
        };

        let repo_dir = self.prepare_checkout(&args.repo_url, &branch, &strategy, token.as_deref()).await?;

        // Session create / resume, downgrading a vanished session to a new one.
        let mut session_id = match resume_session {
            Some(id) => id,
            None => self.engine.create(&format!("coding: {}", slugify(&args.task)), &repo_dir).await?,
        };
        let prompt = format!(
            "Work in the repository at {repo_dir} on branch {branch}.\nTask: {}\n\
             When the task is complete, commit your changes and push the branch.",
            args.task
        );
        let parts = match self
            .engine
            .prompt(&session_id, &repo_dir, &self.model, vec![Part::text(prompt.clone())])
            .await
        {
            Ok(parts) => parts,
            Err(EngineError::SessionMissing) => {
                warn!(session = %session_id, "stale coding session — starting fresh");
                session_id = self
                    .engine
                    .create(&format!("coding: {}", slugify(&args.task)), &repo_dir)
                    .await?;
                self.engine
                    .prompt(&session_id, &repo_dir, &self.model, vec![Part::text(prompt)])
                    .await?
            }
            Err(err) => return Err(err.into()),
        };
        let mut transcript = extract_text(&parts);

        transcript.push_str(&self.commit_gate(&session_id, &repo_dir).await);

        let store = self.store.clone();
        let new_state = CodingTaskState {
            repo_url: args.repo_url.clone(),
            branch: branch.clone(),
            session_id: Some(session_id),
            last_task: args.task.clone(),
            last_timestamp: now,
        };
        with_retry(move || store.save_coding_task_state(&new_state)).await?;

        Ok(ToolOutput::text(format!(
            "Task dispatched on branch {branch}.\n{transcript}"
        )))
    }
}

impl RunCodingTaskTool {
    /// Ask the fast model whether the new task continues the previous one.
    /// Any failure (engine down, malformed JSON) falls back to a new branch.
    async fn classify(&self, prev: &CodingTaskState, task: &str) -> Strategy {
        let prompt = format!(
            "A repository has an in-progress coding session.\n\
             Previous task: {}\nBranch: {}\nNew task: {}\n\
             Is the new task a continuation of the previous one?\n\
             Reply with strict JSON only, no prose: {{\"action\":\"continue\"}} or \
             {{\"action\":\"new\",\"branch\":\"{}/<short-slug>\"}}",
            prev.last_task, prev.branch, task, self.coding.branch_prefix,
        );

        let fallback = Strategy::New {
            branch: mint_branch(&self.coding.branch_prefix, task),
        };
        let Ok(session) = self.engine.create("coding-classifier", &self.workdir).await else {
            return fallback;
        };
        let Ok(parts) = self
            .engine
            .prompt(&session, &self.workdir, &self.fast_model, vec![Part::text(prompt)])
            .await
        else {
            return fallback;
        };
        match parse_classification(&extract_text(&parts), &self.coding.branch_prefix, task) {
            Some(Strategy::Continue { .. }) => Strategy::Continue {
                branch: prev.branch.clone(),
                session_id: prev.session_id.clone(),
            },
            Some(new) => new,
            None => fallback,
        }
    }

    /// Shallow-clone or fetch, then put the checkout on `branch`.  Returns
    /// the repo directory inside the sandbox.
    async fn prepare_checkout(
        &self,
        repo_url: &str,
        branch: &str,
        strategy: &Strategy,
        token: Option<&str>,
    ) -> Result<String> {
        let name = repo_url
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .unwrap_or("repo");
        let repo_dir = format!("{}/{}", self.workdir.trim_end_matches('/'), slugify(name));
        let clone_url = match token {
            Some(token) => authed_clone_url(repo_url, token),
            None => repo_url.to_string(),
        };
        let env: HashMap<String, String> = HashMap::new();

        let exists = self
            .sandbox
            .exec(&format!("test -d {repo_dir}/.git"), &env)
            .await?
            .success();
        if exists {
            let fetch = self
                .sandbox
                .exec(&format!("git -C {repo_dir} fetch --depth 50 origin"), &env)
                .await?;
            if !fetch.success() {
                warn!(stderr = %fetch.stderr, "fetch failed — continuing with the local clone");
            }
        } else {
            let clone = self
                .sandbox
                .exec(&format!("git clone --depth 50 {clone_url} {repo_dir}"), &env)
                .await?;
            if !clone.success() {
                anyhow::bail!("clone failed: {}", clone.stderr.trim());
            }
        }

        match strategy {
            Strategy::New { .. } => {
                let created = self
                    .sandbox
                    .exec(
                        &format!("git -C {repo_dir} checkout -b {branch} origin/HEAD"),
                        &env,
                    )
                    .await?;
                if !created.success() {
                    // Branch from wherever we are rather than failing the task.
                    warn!(stderr = %created.stderr, "branch from origin/HEAD failed — branching from current HEAD");
                    let fallback = self
                        .sandbox
                        .exec(&format!("git -C {repo_dir} checkout -b {branch}"), &env)
                        .await?;
                    if !fallback.success() {
                        anyhow::bail!("branch create failed: {}", fallback.stderr.trim());
                    }
                }
            }
            Strategy::Continue { .. } => {
                let checkout = self
                    .sandbox
                    .exec(&format!("git -C {repo_dir} checkout {branch}"), &env)
                    .await?;
                if !checkout.success() {
                    anyhow::bail!("checkout of {branch} failed: {}", checkout.stderr.trim());
                }
            }
        }
        Ok(repo_dir)
    }

    /// Keep prompting while the tree is dirty or commits are unpushed.  The
    /// same state hash twice in a row means the engine is stuck — stop.
    async fn commit_gate(&self, session_id: &str, repo_dir: &str) -> String {
        let env: HashMap<String, String> = HashMap::new();
        let mut previous_hash: Option<String> = None;
        let mut log = String::new();

        for round in 0..MAX_GATE_ROUNDS {
            let Ok(state) = self.git_state(repo_dir, &env).await else {
                return log;
            };
            if state.is_empty() {
                if round > 0 {
                    log.push_str("\n(commit gate: tree clean, all commits pushed)");
                }
                return log;
            }

            let hash = format!("{:x}", Sha256::digest(state.as_bytes()));
            if previous_hash.as_deref() == Some(hash.as_str()) {
                warn!(session = %session_id, "commit gate made no progress twice — giving up");
                log.push_str("\n(commit gate: no progress, giving up)");
                return log;
            }
            previous_hash = Some(hash);

            let follow_up = format!(
                "The session cannot end yet — the repository still has uncommitted changes or \
                 unpushed commits:\n{state}\nCommit and push them now."
            );
            match self
                .engine
                .prompt(session_id, repo_dir, &self.model, vec![Part::text(follow_up)])
                .await
            {
                Ok(parts) => {
                    let text = extract_text(&parts);
                    if !text.is_empty() {
                        log.push('\n');
                        log.push_str(&text);
                    }
                }
                Err(err) => {
                    warn!(%err, "commit-gate follow-up failed");
                    return log;
                }
            }
        }
        log.push_str("\n(commit gate: round limit reached)");
        log
    }

    /// Dirty-tree plus unpushed-commit description; empty when clean.
    async fn git_state(&self, repo_dir: &str, env: &HashMap<String, String>) -> Result<String> {
        let status = self
            .sandbox
            .exec(&format!("git -C {repo_dir} status --porcelain"), env)
            .await?;
        let unpushed = self
            .sandbox
            .exec(
                &format!("git -C {repo_dir} log --branches --not --remotes --oneline"),
                env,
            )
            .await?;
        let mut state = String::new();
        if !status.stdout.trim().is_empty() {
            state.push_str("uncommitted:\n");
            state.push_str(status.stdout.trim());
        }
        if !unpushed.stdout.trim().is_empty() {
            if !state.is_empty() {
                state.push('\n');
            }
            state.push_str("unpushed:\n");
            state.push_str(unpushed.stdout.trim());
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_flattens_to_kebab_case() {
        assert_eq!(slugify("Add logging"), "add-logging");
        assert_eq!(slugify("Fix #42: crash on empty input!"), "fix-42-crash-on-empty-input");
        assert_eq!(slugify("   "), "task");
    }

    #[test]
    fn minted_branch_has_prefix_slug_and_hex6() {
        let branch = mint_branch("outie", "Add logging");
        let rest = branch.strip_prefix("outie/add-logging-").unwrap();
        assert_eq!(rest.len(), 6);
        assert!(rest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn staleness_forces_new_branch() {
        let state = CodingTaskState {
            repo_url: "r".to_string(),
            branch: "outie/old-abc123".to_string(),
            session_id: Some("s".to_string()),
            last_task: "old".to_string(),
            last_timestamp: 0,
        };
        let now = 48 * 3_600_000;
        let decided = decide_by_staleness(Some(&state), now, 24, "outie", "new work");
        assert!(matches!(decided, Some(Strategy::New { .. })));
    }

    #[test]
    fn fresh_state_defers_to_the_classifier() {
        let state = CodingTaskState {
            repo_url: "r".to_string(),
            branch: "outie/old-abc123".to_string(),
            session_id: Some("s".to_string()),
            last_task: "old".to_string(),
            last_timestamp: 1_000_000,
        };
        let now = 1_000_000 + 30 * 60_000; // 30 minutes later
        assert!(decide_by_staleness(Some(&state), now, 24, "outie", "more work").is_none());
    }

    #[test]
    fn absent_state_is_always_new() {
        assert!(matches!(
            decide_by_staleness(None, 0, 24, "outie", "t"),
            Some(Strategy::New { .. })
        ));
    }

    #[test]
    fn classification_parses_strict_json() {
        assert!(matches!(
            parse_classification(r#"{"action":"continue"}"#, "outie", "t"),
            Some(Strategy::Continue { .. })
        ));
        match parse_classification(r#"{"action":"new","branch":"outie/rework"}"#, "outie", "t") {
            Some(Strategy::New { branch }) => assert_eq!(branch, "outie/rework"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classification_survives_code_fences() {
        let fenced = "```json\n{\"action\":\"continue\"}\n```";
        assert!(matches!(
            parse_classification(fenced, "outie", "t"),
            Some(Strategy::Continue { .. })
        ));
    }

    #[test]
    fn garbage_classification_is_none() {
        assert!(parse_classification("definitely a continuation!", "outie", "t").is_none());
        assert!(parse_classification(r#"{"action":"maybe"}"#, "outie", "t").is_none());
    }
}
