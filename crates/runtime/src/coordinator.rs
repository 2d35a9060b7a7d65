//! The session coordinator: at most one reasoning session is active per
//! orchestrator instance, and a newer trigger preempts the one in flight.
//!
//! The coordinator is a single logical actor — one task owns all mutable
//! state and drives a `select!` over the trigger queue and the in-flight
//! engine call.  A trigger arriving mid-call aborts the engine session
//! (best-effort); if the abort lands, the next trigger reuses the session id
//! so the engine sees the interrupted turn's output followed by the new
//! input.  `is_processing` drops back to false on every exit path because
//! the join point is the only way out of a flight.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use minder_config::AppConfig;
use minder_engine::{EngineClient, EngineError, Part, extract_text};
use minder_mcp::service::McpService;
use minder_mcp::uplink::Uplink;
use minder_memory::{Message, Role, Store, TriggerKind, with_retry};
use minder_sandbox::{Sandbox, wait_ready};
use minder_tools::{ChatSink, UrlAllowList};

use crate::Trigger;
use crate::context::{self, EnvelopeInputs};

/// Placeholder delivered to chat when the engine cannot answer.
pub const NO_RESPONSE: &str = "[No response]";

/// The slice of the engine's session API the coordinator drives.  The HTTP
/// client implements it; tests substitute a scripted double.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn create(&self, title: &str, directory: &str) -> Result<String, EngineError>;
    async fn prompt(
        &self,
        session_id: &str,
        directory: &str,
        model: &str,
        parts: Vec<Part>,
    ) -> Result<Vec<Part>, EngineError>;
    async fn abort(&self, session_id: &str) -> Result<(), EngineError>;
}

#[async_trait]
impl Engine for EngineClient {
    async fn create(&self, title: &str, directory: &str) -> Result<String, EngineError> {
        self.session_create(title, directory).await
    }
    async fn prompt(
        &self,
        session_id: &str,
        directory: &str,
        model: &str,
        parts: Vec<Part>,
    ) -> Result<Vec<Part>, EngineError> {
        self.session_prompt(session_id, directory, model, parts).await
    }
    async fn abort(&self, session_id: &str) -> Result<(), EngineError> {
        self.session_abort(session_id).await
    }
}

pub struct Coordinator {
    store: Arc<Store>,
    engine: Arc<dyn Engine>,
    sandbox: Arc<dyn Sandbox>,
    service: Arc<McpService>,
    sink: Arc<dyn ChatSink>,
    allow_list: UrlAllowList,
    config: AppConfig,
    timezone: Tz,
    /// Secrets exported into sandbox commands (API keys, installation token).
    pub sandbox_env: HashMap<String, String>,

    current_session_id: Option<String>,
    /// Set when a preemption abort landed: the next trigger continues the
    /// same engine session instead of creating a fresh one.
    reuse_session: bool,
    is_processing: Arc<AtomicBool>,
    uplink: Option<Uplink>,
}

struct InFlight {
    flight_id: u64,
    session_id: String,
    trigger: Trigger,
    /// Set when a preemption abort landed on this flight: its eventual
    /// result is persisted but not delivered (the newer trigger owns the
    /// conversation now).
    aborted: bool,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        engine: Arc<dyn Engine>,
        sandbox: Arc<dyn Sandbox>,
        service: Arc<McpService>,
        sink: Arc<dyn ChatSink>,
        allow_list: UrlAllowList,
        config: AppConfig,
    ) -> Self {
        let timezone: Tz = config.agent.timezone.parse().unwrap_or_else(|_| {
            warn!(tz = %config.agent.timezone, "unrecognised timezone — falling back to UTC");
            chrono_tz::UTC
        });
        Self {
            store,
            engine,
            sandbox,
            service,
            sink,
            allow_list,
            config,
            timezone,
            sandbox_env: HashMap::new(),
            current_session_id: None,
            reuse_session: false,
            is_processing: Arc::new(AtomicBool::new(false)),
            uplink: None,
        }
    }

    /// Shared view of the processing flag (observability and tests).
    pub fn processing_flag(&self) -> Arc<AtomicBool> {
        self.is_processing.clone()
    }

    /// Drive triggers until the channel closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Trigger>) {
        let mut in_flight: Option<InFlight> = None;
        let mut pending: VecDeque<Trigger> = VecDeque::new();
        // Finished engine calls come home on this channel; the spawned call
        // task is the only sender for its flight id.
        let (done_tx, mut done_rx) =
            mpsc::channel::<(u64, Result<Vec<Part>, EngineError>)>(4);
        let mut next_flight_id: u64 = 0;

        loop {
            tokio::select! {
                maybe_trigger = rx.recv() => {
                    let Some(trigger) = maybe_trigger else { break };
                    if let Some(flight) = in_flight.as_mut() {
                        // Preemption: best-effort abort; the new trigger waits
                        // for the (now short) flight to come home.
                        let aborted = self.engine.abort(&flight.session_id).await.is_ok();
                        if aborted {
                            info!(session = %flight.session_id, "in-flight session aborted for newer trigger");
                            self.reuse_session = true;
                            flight.aborted = true;
                        } else {
                            warn!(session = %flight.session_id, "abort failed — a fresh session will be created");
                        }
                        enqueue_coalescing(&mut pending, trigger);
                    } else {
                        next_flight_id += 1;
                        self.begin(trigger, next_flight_id, &done_tx, &mut in_flight).await;
                    }
                }
                Some((flight_id, outcome)) = done_rx.recv() => {
                    let Some(flight) = in_flight.take_if(|f| f.flight_id == flight_id) else {
                        continue;
                    };
                    self.finish(flight, outcome).await;
                    while in_flight.is_none() {
                        let Some(next) = pending.pop_front() else { break };
                        next_flight_id += 1;
                        self.begin(next, next_flight_id, &done_tx, &mut in_flight).await;
                    }
                }
            }
        }
    }

    async fn begin(
        &mut self,
        trigger: Trigger,
        flight_id: u64,
        done_tx: &mpsc::Sender<(u64, Result<Vec<Part>, EngineError>)>,
        in_flight: &mut Option<InFlight>,
    ) {
        match self.start(&trigger, flight_id, done_tx.clone()).await {
            Ok(flight) => {
                self.is_processing.store(true, Ordering::SeqCst);
                *in_flight = Some(flight);
            }
            Err(err) => {
                error!(%err, "failed to start reasoning turn");
                self.is_processing.store(false, Ordering::SeqCst);
                if let Trigger::Message { chat_id, .. } = &trigger {
                    let _ = self.sink.send(NO_RESPONSE, *chat_id).await;
                }
            }
        }
    }

    /// Steps 1–6 of the invocation protocol: assemble prompts, persist the
    /// user message, ready the sandbox, ensure the uplink, pick the session,
    /// and launch the engine call.
    async fn start(
        &mut self,
        trigger: &Trigger,
        flight_id: u64,
        done_tx: mpsc::Sender<(u64, Result<Vec<Part>, EngineError>)>,
    ) -> anyhow::Result<InFlight> {
        let system = context::system_prompt(self.store.as_ref())?;
        let (envelope, stats) = context::dynamic_envelope(&EnvelopeInputs {
            store: self.store.as_ref(),
            compact_threshold: self.config.memory.compact_threshold,
            timezone: self.timezone,
            user_persona: "user",
            now: Utc::now(),
        })?;
        let mut dynamic = format!("{envelope}\n\n{}", context::trigger_tail(trigger));
        if stats.needs_compaction {
            dynamic.push_str(context::compaction_notice());
        }

        // The user's words are durable before the engine ever runs.
        if let Trigger::Message { text, source, .. } = trigger {
            self.allow_list.allow_from_text(text);
            let message = Message {
                id: Uuid::new_v4(),
                role: Role::User,
                content: text.clone(),
                timestamp: Utc::now().timestamp_millis(),
                trigger: TriggerKind::Message,
                source: Some(*source),
            };
            let store = self.store.clone();
            with_retry(move || store.append_message(&message)).await?;
        }

        self.sandbox.wake().await?;
        wait_ready(
            self.sandbox.as_ref(),
            self.config.sandbox.ready_attempts,
            Duration::from_secs(self.config.sandbox.ready_interval_secs),
        )
        .await?;
        if !self.sandbox_env.is_empty() {
            self.sandbox.install_env(self.sandbox_env.clone()).await?;
        }
        self.ensure_uplink().await;

        let session_id = match (&self.current_session_id, self.reuse_session) {
            (Some(id), true) => {
                info!(session = %id, "reusing interrupted session");
                id.clone()
            }
            _ => {
                let id = self
                    .engine
                    .create(&self.config.agent.name, &self.config.sandbox.workdir)
                    .await?;
                self.current_session_id = Some(id.clone());
                id
            }
        };
        self.reuse_session = false;

        let engine = self.engine.clone();
        let directory = self.config.sandbox.workdir.clone();
        let model = self.config.engine.model.clone();
        let sid = session_id.clone();
        let parts = vec![Part::text(system), Part::text(dynamic)];
        tokio::spawn(async move {
            let outcome = engine.prompt(&sid, &directory, &model, parts).await;
            let _ = done_tx.send((flight_id, outcome)).await;
        });

        Ok(InFlight {
            flight_id,
            session_id,
            trigger: trigger.clone(),
            aborted: false,
        })
    }

    /// Steps 7–10: collect the reply, persist the assistant message, deliver
    /// to the trigger's surface, release the processing flag.
    async fn finish(&mut self, flight: InFlight, outcome: Result<Vec<Part>, EngineError>) {
        // Cleared first: every path out of a flight goes through here.
        self.is_processing.store(false, Ordering::SeqCst);

        let response = match outcome {
            Ok(parts) => extract_text(&parts),
            Err(err) => {
                warn!(session = %flight.session_id, %err, "engine call failed");
                if let (false, Trigger::Message { chat_id, .. }) = (flight.aborted, &flight.trigger)
                {
                    let _ = self.sink.send(NO_RESPONSE, *chat_id).await;
                }
                return;
            }
        };

        if !response.is_empty() {
            let message = Message {
                id: Uuid::new_v4(),
                role: Role::Assistant,
                content: response.clone(),
                timestamp: Utc::now().timestamp_millis(),
                trigger: flight.trigger.kind(),
                source: None,
            };
            let store = self.store.clone();
            if let Err(err) = with_retry(move || store.append_message(&message)).await {
                error!(%err, "failed to persist assistant message");
            }
        }

        if flight.aborted {
            // The superseding trigger owns the conversation; the interrupted
            // turn's output is persisted (above) but not delivered.
            return;
        }

        match &flight.trigger {
            Trigger::Message { chat_id, .. } => {
                let text = if response.is_empty() {
                    NO_RESPONSE
                } else {
                    response.as_str()
                };
                if let Err(err) = self.sink.send(text, *chat_id).await {
                    error!(%err, "outbound delivery failed");
                }
            }
            // Alarm and ambient replies are log-only; visibility requires the
            // engine to have called send_telegram itself.
            Trigger::Alarm { .. } | Trigger::Ambient => {
                info!(kind = ?flight.trigger.kind(), reply_len = response.len(), "turn finished (log-only)");
            }
        }
    }

    async fn ensure_uplink(&mut self) {
        if self.uplink.as_ref().is_some_and(|u| u.is_alive()) {
            return;
        }
        let url = self.sandbox.uplink_url();
        match Uplink::connect(&url, self.service.clone()).await {
            Ok(uplink) => self.uplink = Some(uplink),
            Err(err) => {
                warn!(%url, %err, "mcp uplink unavailable — engine tool calls will fail until it returns");
                self.uplink = None;
            }
        }
    }
}

/// Queue a trigger, merging with the newest queued one where the coalescing
/// rules allow (same kind and source; user text concatenates).
fn enqueue_coalescing(pending: &mut VecDeque<Trigger>, trigger: Trigger) {
    match pending.pop_back() {
        None => pending.push_back(trigger),
        Some(back) => match back.coalesce(trigger) {
            Ok(merged) => pending.push_back(merged),
            Err((old, new)) => {
                pending.push_back(old);
                pending.push_back(new);
            }
        },
    }
}
