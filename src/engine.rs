//! Session engine.
//!
//! Runs one conversational turn against a session:
//!
//! ```text
//!  lock session ─▶ (rewrite query) ─▶ retrieve ─▶ build source map
//!                                                      │
//!        no usable sources ◀───────────────────────────┤
//!        → fixed answer, session untouched             ▼
//!                                         generate (complete | stream)
//!                                                      │
//!        provider error / deadline ◀───────────────────┤
//!        → fixed answer, session untouched             ▼
//!                                   resolve citations ─▶ append turn ─▶ reply
//! ```
//!
//! Nothing is written to the session until the full answer has been
//! generated and resolved, so a failed, timed-out, or cancelled turn leaves
//! the log exactly as it was. Every finished turn is handed to the
//! [`TurnLogger`] on a spawned task; [`SessionEngine::flush_logs`] waits for
//! the pending writes before a process exits.

use anyhow::{anyhow, bail};
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::citations::{resolve_citations, CitationPolicy};
use crate::config::{BusyPolicy, Config, HistoryConfig};
use crate::error::TurnError;
use crate::llm::OpenAiChatModel;
use crate::models::{CitedSource, GenerationSettings, Message, TurnStatus};
use crate::prompts::{
    context_message, query_rewrite_request, system_prompt, DEFAULT_SYSTEM_PROMPT,
    GENERATION_ERROR_ANSWER, NO_INFORMATION_ANSWER,
};
use crate::retrieval::create_retriever;
use crate::session::{acquire, Session, SessionStore};
use crate::source_map::{build_source_map, SourceContext, DEFAULT_MAX_SOURCES};
use crate::summarize::ModelSummarizer;
use crate::traits::{ChatDelta, ChatModel, ChatRequest, Retriever, TurnLogger, TurnRecord};
use crate::turn_log::{create_turn_logger, NoopTurnLogger};
use crate::window::{CompactionOutcome, CompactionPolicy, WindowPolicy};

/// Per-engine turn settings.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Hits requested from the retriever.
    pub top_k: usize,
    /// Hits that may become sources.
    pub max_sources: usize,
    pub settings: GenerationSettings,
    pub system_prompt: String,
    /// Prepended to every query inside the context message.
    pub custom_prompt: Option<String>,
    pub query_rewrite: bool,
    pub busy: BusyPolicy,
    /// Deadline for the generation call.
    pub turn_timeout: Option<Duration>,
    /// Sessions unused this long are evicted by the idle sweeper.
    pub idle_timeout: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            max_sources: DEFAULT_MAX_SOURCES,
            settings: GenerationSettings::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            custom_prompt: None,
            query_rewrite: false,
            busy: BusyPolicy::Wait,
            turn_timeout: None,
            idle_timeout: None,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            max_sources: config.retrieval.max_sources,
            settings: config.generation.settings(),
            system_prompt: system_prompt(&config.prompt),
            custom_prompt: config.prompt.custom_prompt.clone(),
            query_rewrite: config.prompt.query_rewrite,
            busy: config.sessions.busy,
            turn_timeout: config.sessions.turn_timeout_secs.map(Duration::from_secs),
            idle_timeout: config
                .sessions
                .idle_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

/// Result of one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    /// Answer with citation markers renumbered to match `sources`.
    pub answer: String,
    pub sources: Vec<CitedSource>,
    /// Older history was compacted while committing this turn.
    pub history_trimmed: bool,
    pub status: TurnStatus,
    #[serde(skip)]
    pub compaction: CompactionOutcome,
}

impl TurnReply {
    fn fixed(answer: &str, status: TurnStatus) -> Self {
        Self {
            answer: answer.to_string(),
            sources: Vec::new(),
            history_trimmed: false,
            status,
            compaction: CompactionOutcome::default(),
        }
    }
}

/// Event of a streaming turn.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Raw model text as it arrives. Markers are not yet renumbered.
    Delta(String),
    /// Terminal event carrying the resolved reply.
    Done(TurnReply),
}

pub type TurnEventStream = BoxStream<'static, TurnEvent>;

/// A turn whose request is ready to send.
struct PreparedTurn {
    query: String,
    context: SourceContext,
    user: Message,
    request: ChatRequest,
}

enum Preparation {
    Ready(PreparedTurn),
    NoContext(SourceContext),
}

struct Inner {
    retriever: Arc<dyn Retriever>,
    model: Arc<dyn ChatModel>,
    window: WindowPolicy,
    citations: CitationPolicy,
    logger: Arc<dyn TurnLogger>,
    options: EngineOptions,
    sessions: SessionStore,
    /// In-flight turn-log writes.
    pending_logs: Mutex<JoinSet<()>>,
}

/// Orchestrates turns over a store of sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<Inner>,
}

/// Builder for [`SessionEngine`].
pub struct EngineBuilder {
    retriever: Arc<dyn Retriever>,
    model: Arc<dyn ChatModel>,
    window: Option<WindowPolicy>,
    citations: CitationPolicy,
    logger: Arc<dyn TurnLogger>,
    options: EngineOptions,
}

impl EngineBuilder {
    pub fn window(mut self, window: WindowPolicy) -> Self {
        self.window = Some(window);
        self
    }

    pub fn citations(mut self, citations: CitationPolicy) -> Self {
        self.citations = citations;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn TurnLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Summarizing window over the engine's own model unless one was set.
    pub fn build(self) -> SessionEngine {
        let window = self
            .window
            .unwrap_or_else(|| window_policy(&HistoryConfig::default(), self.model.clone()));
        SessionEngine {
            inner: Arc::new(Inner {
                retriever: self.retriever,
                model: self.model,
                window,
                citations: self.citations,
                logger: self.logger,
                options: self.options,
                sessions: SessionStore::new(),
                pending_logs: Mutex::new(JoinSet::new()),
            }),
        }
    }
}

/// Window policy described by `[history]`, summarizing with `model`.
pub fn window_policy(config: &HistoryConfig, model: Arc<dyn ChatModel>) -> WindowPolicy {
    let summarization = &config.summarization;
    if !summarization.enabled {
        return WindowPolicy::truncating(config.max_turns);
    }
    WindowPolicy {
        max_turns: config.max_turns,
        compaction: CompactionPolicy::Summarize {
            summarizer: Arc::new(ModelSummarizer::new(model, summarization)),
            timeout: Some(Duration::from_secs(summarization.timeout_secs)),
        },
    }
}

impl SessionEngine {
    pub fn builder(retriever: Arc<dyn Retriever>, model: Arc<dyn ChatModel>) -> EngineBuilder {
        EngineBuilder {
            retriever,
            model,
            window: None,
            citations: CitationPolicy::default(),
            logger: Arc::new(NoopTurnLogger),
            options: EngineOptions::default(),
        }
    }

    /// Engine configured from `config` around the given collaborators.
    pub fn with_collaborators(
        config: &Config,
        retriever: Arc<dyn Retriever>,
        model: Arc<dyn ChatModel>,
        logger: Arc<dyn TurnLogger>,
    ) -> Self {
        Self::builder(retriever, model.clone())
            .window(window_policy(&config.history, model))
            .citations(config.citations.policy())
            .logger(logger)
            .options(EngineOptions::from_config(config))
            .build()
    }

    /// Engine with every collaborator built from `config`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let model: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::from_config(&config.generation)?);
        let retriever = create_retriever(&config.retrieval)?;
        let logger = create_turn_logger(config).await?;
        tracing::info!(
            model = model.name(),
            retriever = retriever.name(),
            max_turns = config.history.max_turns,
            summarization = config.history.summarization.enabled,
            "session engine ready"
        );
        Ok(Self::with_collaborators(config, retriever, model, logger))
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Run one turn and return the resolved answer.
    pub async fn start_turn(&self, session_id: &str, query: &str) -> Result<TurnReply, TurnError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(TurnError::EmptyQuery);
        }

        let mut session = self.lock_session(session_id).await?;

        let turn = match self.prepare(&session, query).await {
            Preparation::Ready(turn) => turn,
            Preparation::NoContext(context) => {
                return Ok(self.no_context(session_id, query, context));
            }
        };

        match self.generate(&turn.request).await {
            Ok(raw) => Ok(self.commit(&mut session, turn, &raw).await),
            Err(e) => Ok(self.generation_failed(session_id, turn, e)),
        }
    }

    /// Run one turn, streaming model output as it arrives.
    ///
    /// The session lock is taken before this returns, so busy and empty-query
    /// errors surface here. The stream ends with exactly one
    /// [`TurnEvent::Done`]. Dropping the stream earlier cancels the turn and
    /// leaves the session untouched.
    pub async fn stream_turn(
        &self,
        session_id: &str,
        query: &str,
    ) -> Result<TurnEventStream, TurnError> {
        let query = query.trim().to_string();
        if query.is_empty() {
            return Err(TurnError::EmptyQuery);
        }

        let mut session = self.lock_session(session_id).await?;
        let engine = self.clone();
        let session_id = session_id.to_string();

        let stream = async_stream::stream! {
            let turn = match engine.prepare(&session, &query).await {
                Preparation::Ready(turn) => turn,
                Preparation::NoContext(context) => {
                    yield TurnEvent::Done(engine.no_context(&session_id, &query, context));
                    return;
                }
            };

            let deadline = engine.inner.options.turn_timeout.map(|t| Instant::now() + t);
            let mut chunks = match within(deadline, engine.inner.model.stream(&turn.request)).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    yield TurnEvent::Done(engine.generation_failed(&session_id, turn, e));
                    return;
                }
            };

            let mut raw = String::new();
            loop {
                match within(deadline, async { chunks.next().await.transpose() }).await {
                    Ok(Some(ChatDelta::Text(text))) => {
                        raw.push_str(&text);
                        yield TurnEvent::Delta(text);
                    }
                    Ok(Some(ChatDelta::Finished { finish_reason })) => {
                        tracing::debug!(?finish_reason, chars = raw.len(), "stream finished");
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield TurnEvent::Done(engine.generation_failed(&session_id, turn, e));
                        return;
                    }
                }
            }

            if raw.trim().is_empty() {
                let e = anyhow!("model returned an empty answer");
                yield TurnEvent::Done(engine.generation_failed(&session_id, turn, e));
                return;
            }

            let reply = engine.commit(&mut session, turn, &raw).await;
            yield TurnEvent::Done(reply);
        };

        Ok(stream.boxed())
    }

    /// Drop the history of a session. With `preserve_system` the system
    /// message stays; otherwise it is reinstalled by the next turn.
    pub async fn clear_session(
        &self,
        session_id: &str,
        preserve_system: bool,
    ) -> Result<(), TurnError> {
        let handle = self
            .inner
            .sessions
            .get(session_id)
            .ok_or_else(|| TurnError::UnknownSession(session_id.to_string()))?;
        let mut session = acquire(session_id, handle, self.inner.options.busy).await?;
        if session.evicted {
            return Err(TurnError::UnknownSession(session_id.to_string()));
        }
        session.touch();
        session.window.clear(preserve_system);
        tracing::info!(session = session_id, preserve_system, "cleared session");
        Ok(())
    }

    /// Snapshot of a session's message log.
    pub async fn history(&self, session_id: &str) -> Result<Vec<Message>, TurnError> {
        let handle = self
            .inner
            .sessions
            .get(session_id)
            .ok_or_else(|| TurnError::UnknownSession(session_id.to_string()))?;
        let session = handle.lock().await;
        if session.evicted {
            return Err(TurnError::UnknownSession(session_id.to_string()));
        }
        Ok(session.window.messages().to_vec())
    }

    /// Ids of all known sessions.
    pub fn sessions(&self) -> Vec<String> {
        self.inner.sessions.ids()
    }

    /// Evict sessions unused for at least `max_idle`; returns their ids.
    pub fn evict_idle_sessions(&self, max_idle: Duration) -> Vec<String> {
        self.inner.sessions.evict_idle(max_idle)
    }

    /// Spawn a task that evicts idle sessions every half `idle_timeout`.
    /// Returns `None` when no idle timeout is configured.
    pub fn spawn_idle_sweeper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let idle = self.inner.options.idle_timeout?;
        let period = (idle / 2).max(Duration::from_secs(1));
        let engine = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = engine.evict_idle_sessions(idle);
                if !evicted.is_empty() {
                    tracing::debug!(
                        count = evicted.len(),
                        remaining = engine.inner.sessions.len(),
                        "idle sweep"
                    );
                }
            }
        }))
    }

    // ============ turn steps ============

    /// Lock session `id` for a turn, creating it if needed. Retries when the
    /// handle was evicted between lookup and lock.
    async fn lock_session(&self, id: &str) -> Result<OwnedMutexGuard<Session>, TurnError> {
        loop {
            let handle = self
                .inner
                .sessions
                .get_or_create(id, &self.inner.options.system_prompt);
            let mut session = acquire(id, handle, self.inner.options.busy).await?;
            if session.evicted {
                continue;
            }
            session.touch();
            return Ok(session);
        }
    }

    async fn prepare(&self, session: &Session, query: &str) -> Preparation {
        let opts = &self.inner.options;

        let search_query = if opts.query_rewrite && session.window.turn_count() > 0 {
            self.rewrite_query(session.window.messages(), query).await
        } else {
            query.to_string()
        };

        let hits = match self.inner.retriever.search(&search_query, opts.top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retriever = self.inner.retriever.name(),
                    "retrieval failed, continuing without context"
                );
                Vec::new()
            }
        };

        let context = build_source_map(&hits, opts.max_sources);
        if context.is_empty() {
            return Preparation::NoContext(context);
        }

        let user = Message::user(context_message(
            &context.context,
            query,
            opts.custom_prompt.as_deref(),
        ));

        // The system message may be missing after a full clear; it is put
        // back in the log only when the turn commits.
        let mut messages = Vec::with_capacity(session.window.len() + 2);
        if !session.window.has_system() {
            messages.push(Message::system(opts.system_prompt.as_str()));
        }
        messages.extend(session.window.messages().iter().cloned());
        messages.push(user.clone());

        Preparation::Ready(PreparedTurn {
            query: query.to_string(),
            context,
            user,
            request: ChatRequest::new(&messages, opts.settings),
        })
    }

    async fn rewrite_query(&self, history: &[Message], query: &str) -> String {
        let request = ChatRequest::new(
            &[Message::user(query_rewrite_request(history, query))],
            GenerationSettings {
                temperature: 0.2,
                max_tokens: 100,
                top_p: 1.0,
                presence_penalty: 0.0,
                frequency_penalty: 0.0,
            },
        );
        match self.inner.model.complete(&request).await {
            Ok(text) => {
                let rewritten = text.trim().trim_matches('"').trim();
                if rewritten.is_empty() {
                    query.to_string()
                } else {
                    tracing::debug!(original = query, rewritten, "rewrote search query");
                    rewritten.to_string()
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "query rewrite failed, searching with the raw query");
                query.to_string()
            }
        }
    }

    async fn generate(&self, request: &ChatRequest) -> anyhow::Result<String> {
        let deadline = self.inner.options.turn_timeout.map(|t| Instant::now() + t);
        let text = within(deadline, self.inner.model.complete(request)).await?;
        if text.trim().is_empty() {
            bail!("model returned an empty answer");
        }
        Ok(text)
    }

    async fn commit(&self, session: &mut Session, turn: PreparedTurn, raw: &str) -> TurnReply {
        let resolution = resolve_citations(raw, &turn.context.sources, self.inner.citations);

        if session.window.ensure_system(&self.inner.options.system_prompt) {
            tracing::info!(session = %session.id, "restored system message");
        }
        let compaction = session
            .window
            .append_turn(
                turn.user,
                Message::assistant(resolution.answer.as_str()),
                &self.inner.window,
            )
            .await;
        session.turns += 1;

        tracing::info!(
            session = %session.id,
            turn = session.turns,
            sources = resolution.sources.len(),
            attribution = ?resolution.attribution,
            history = session.window.len(),
            compacted = compaction.compacted,
            "turn committed"
        );

        let reply = TurnReply {
            answer: resolution.answer,
            sources: resolution.sources,
            history_trimmed: compaction.compacted,
            status: TurnStatus::Answered,
            compaction,
        };
        self.dispatch_log(&session.id, &turn.query, &turn.context.context, &reply);
        reply
    }

    fn no_context(&self, session_id: &str, query: &str, context: SourceContext) -> TurnReply {
        tracing::info!(session = session_id, "no usable sources, skipping generation");
        let reply = TurnReply::fixed(NO_INFORMATION_ANSWER, TurnStatus::NoContext);
        self.dispatch_log(session_id, query, &context.context, &reply);
        reply
    }

    fn generation_failed(
        &self,
        session_id: &str,
        turn: PreparedTurn,
        error: anyhow::Error,
    ) -> TurnReply {
        tracing::warn!(
            session = session_id,
            model = self.inner.model.name(),
            error = %error,
            "generation failed, session left unchanged"
        );
        let reply = TurnReply::fixed(GENERATION_ERROR_ANSWER, TurnStatus::GenerationFailed);
        self.dispatch_log(session_id, &turn.query, &turn.context.context, &reply);
        reply
    }

    fn dispatch_log(&self, session_id: &str, query: &str, context: &str, reply: &TurnReply) {
        let record = TurnRecord {
            session_id: session_id.to_string(),
            query: query.to_string(),
            answer: reply.answer.clone(),
            sources: reply.sources.clone(),
            context: context.to_string(),
            status: reply.status,
            history_trimmed: reply.history_trimmed,
            created_at: Utc::now(),
        };
        let logger = self.inner.logger.clone();
        let mut pending = self
            .inner
            .pending_logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // reap finished writes so a long-running server does not accumulate them
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            if let Err(e) = logger.log(&record).await {
                tracing::warn!(error = %e, session = %record.session_id, "failed to log turn");
            }
        });
    }

    /// Wait for every turn-log write dispatched so far.
    pub async fn flush_logs(&self) {
        let mut pending = std::mem::take(
            &mut *self
                .inner
                .pending_logs
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let count = pending.len();
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "turn-log task failed");
            }
        }
        if count > 0 {
            tracing::debug!(count, "flushed turn log");
        }
    }
}

/// Await `fut`, failing once `deadline` has passed.
async fn within<T>(
    deadline: Option<Instant>,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| anyhow!("generation deadline exceeded"))?,
        None => fut.await,
    }
}
