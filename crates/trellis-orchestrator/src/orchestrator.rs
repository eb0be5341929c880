//! Generation orchestrator
//!
//! Runs one streaming generation per node:
//! - pre-flight (model id, project, node, single-flight) fails synchronously
//! - the run streams deltas into the workspace mirror, the stream channel and
//!   the realtime broadcaster, then adds a best-effort summary and persists
//! - cancellation is cooperative; a cancelled run persists nothing and sends
//!   no `done` frame
//! - failures end in `error` status with a bare `done` frame
//!
//! Cancellation and settling race through [`StreamSession::claim`]: only a run
//! that claimed its session writes a result or an error to storage, and a
//! claimed session can no longer be cancelled.

use crate::broadcast::{streaming_payload, Broadcaster, NoopBroadcaster, NODE_STREAMING};
use crate::config::GenerationConfig;
use crate::error::{OrchestratorError, Result};
use crate::llm::{collect_text, qualify_model_id, ModelHandle, ProviderRegistry, StreamEvent, StreamRequest};
use crate::persistence::{InMemoryPersistence, NodeUpdate, PersistedStatus, Persistence, ProjectId};
use crate::stream::{progress, StreamFrame, StreamId, StreamSession};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::Instrument;
use trellis_graph::{ChatMessage, GenerationOutput, GraphError, NodeId, NodeStatus, Workspace};

/// Workspace shared between the orchestrator and its callers
pub type SharedWorkspace = Arc<Mutex<Workspace>>;

const SUMMARY_TEMPERATURE: f32 = 0.3;

/// Per-request overrides of [`GenerationConfig`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    /// `provider:model`, or a bare name served by the default model's
    /// provider; defaults to the configured model
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerationOptions {
    #[inline]
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// How an awaited generation ended
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Completed {
        summary: Option<String>,
        tokens: Option<u32>,
    },
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
struct LiveStream {
    session: Arc<StreamSession>,
    /// Receiver opened at registration, handed to the first `get_stream` caller
    first: Mutex<Option<broadcast::Receiver<StreamFrame>>>,
}

#[derive(Debug)]
struct Inner {
    workspace: SharedWorkspace,
    providers: Arc<ProviderRegistry>,
    persistence: Arc<dyn Persistence>,
    broadcaster: Arc<dyn Broadcaster>,
    project_id: ProjectId,
    config: GenerationConfig,
    streams: DashMap<StreamId, LiveStream>,
    by_node: DashMap<NodeId, StreamId>,
}

/// Everything a spawned run needs
#[derive(Debug)]
struct Run {
    session: Arc<StreamSession>,
    handle: ModelHandle,
    system: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

/// Streaming generation over a shared workspace
///
/// Cheap to clone; clones share the stream registry.
#[derive(Debug, Clone)]
pub struct GenerationOrchestrator {
    inner: Arc<Inner>,
}

/// Builder for [`GenerationOrchestrator`]
#[derive(Debug)]
pub struct OrchestratorBuilder {
    project_id: ProjectId,
    workspace: Option<SharedWorkspace>,
    providers: Option<Arc<ProviderRegistry>>,
    persistence: Option<Arc<dyn Persistence>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    config: GenerationConfig,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn workspace(mut self, workspace: SharedWorkspace) -> Self {
        self.workspace = Some(workspace);
        self
    }

    #[must_use]
    pub fn providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    #[must_use]
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    #[must_use]
    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    #[must_use]
    pub fn config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    /// Fill unset collaborators with defaults: an empty workspace, the echo
    /// provider, in-memory persistence and no broadcasting
    #[must_use]
    pub fn build(self) -> GenerationOrchestrator {
        GenerationOrchestrator {
            inner: Arc::new(Inner {
                workspace: self.workspace.unwrap_or_default(),
                providers: self
                    .providers
                    .unwrap_or_else(|| Arc::new(ProviderRegistry::with_echo())),
                persistence: self
                    .persistence
                    .unwrap_or_else(|| Arc::new(InMemoryPersistence::new())),
                broadcaster: self.broadcaster.unwrap_or_else(|| Arc::new(NoopBroadcaster)),
                project_id: self.project_id,
                config: self.config,
                streams: DashMap::new(),
                by_node: DashMap::new(),
            }),
        }
    }
}

impl GenerationOrchestrator {
    #[must_use]
    pub fn builder(project_id: impl Into<ProjectId>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            project_id: project_id.into(),
            workspace: None,
            providers: None,
            persistence: None,
            broadcaster: None,
            config: GenerationConfig::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn workspace(&self) -> &SharedWorkspace {
        &self.inner.workspace
    }

    #[inline]
    #[must_use]
    pub fn project_id(&self) -> &ProjectId {
        &self.inner.project_id
    }

    #[inline]
    #[must_use]
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.inner.persistence
    }

    #[inline]
    #[must_use]
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.inner.providers
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &GenerationConfig {
        &self.inner.config
    }

    /// Start generating `node_id` in the background
    ///
    /// # Errors
    /// - `OrchestratorError::InvalidModelId` / `ProviderUnavailable` for the model
    /// - `OrchestratorError::ProjectNotFound`
    /// - `OrchestratorError::Graph(NodeNotFound)`
    /// - `OrchestratorError::AlreadyGenerating` while a stream for the node is live
    /// - `OrchestratorError::Persistence` if the generating status cannot be stored
    pub async fn start_generation(&self, node_id: &NodeId, options: GenerationOptions) -> Result<StreamId> {
        let (run, receiver) = self.prepare(node_id, options).await?;
        let stream_id = run.session.id();
        if let Some(live) = self.inner.streams.get(&stream_id) {
            *live.first.lock() = Some(receiver);
        }
        self.spawn(run);
        Ok(stream_id)
    }

    /// Start a generation and wait for its terminal frame
    ///
    /// # Errors
    /// Pre-flight errors as for [`Self::start_generation`]; run failures are
    /// reported as [`GenerationOutcome::Failed`].
    pub async fn generate_and_wait(&self, node_id: &NodeId, options: GenerationOptions) -> Result<GenerationOutcome> {
        let (run, mut receiver) = self.prepare(node_id, options).await?;
        self.spawn(run);

        loop {
            match receiver.recv().await {
                Ok(frame) if frame.is_done() => return Ok(self.outcome_of(node_id, frame)),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(GenerationOutcome::Cancelled),
            }
        }
    }

    fn outcome_of(&self, node_id: &NodeId, frame: StreamFrame) -> GenerationOutcome {
        let workspace = self.inner.workspace.lock();
        match workspace.node(node_id) {
            Some(node) if node.status == NodeStatus::Error => GenerationOutcome::Failed(
                node.orchestration.generation.last_error.clone().unwrap_or_default(),
            ),
            _ => GenerationOutcome::Completed {
                summary: frame.summary,
                tokens: frame.tokens,
            },
        }
    }

    /// Abort the live stream for `node_id`
    ///
    /// Restores the pre-run response, returns the node to `idle` and closes the
    /// stream channel. Returns `false` if nothing was generating, or if the run
    /// is already persisting its result.
    pub async fn cancel(&self, node_id: &NodeId) -> bool {
        let Some(session) = self.live_session(node_id) else {
            return false;
        };
        if !session.abort() {
            tracing::debug!(node_id = %node_id, "cancel arrived while the run was settling");
            return false;
        }
        let stream_id = session.id();
        {
            let mut workspace = self.inner.workspace.lock();
            workspace.cancel_generation(node_id);
            self.release(&session);
        }
        drop(session);

        if let Err(err) = self
            .inner
            .persistence
            .update_node(node_id, NodeUpdate::status(PersistedStatus::Idle))
            .await
        {
            tracing::warn!(node_id = %node_id, error = %err, "failed to persist cancelled status");
        }
        tracing::info!(node_id = %node_id, stream_id = %stream_id, "generation cancelled");
        true
    }

    /// Subscribe to a live stream
    ///
    /// The first caller receives every frame since registration; later callers
    /// see frames from the moment they subscribe.
    #[must_use]
    pub fn get_stream(&self, stream_id: &StreamId) -> Option<broadcast::Receiver<StreamFrame>> {
        let live = self.inner.streams.get(stream_id)?;
        let first = live.first.lock().take();
        Some(first.unwrap_or_else(|| live.session.subscribe()))
    }

    fn live_session(&self, node_id: &NodeId) -> Option<Arc<StreamSession>> {
        let stream_id = *self.inner.by_node.get(node_id)?.value();
        let live = self.inner.streams.get(&stream_id)?;
        Some(Arc::clone(&live.session))
    }

    #[must_use]
    pub fn stream_for_node(&self, node_id: &NodeId) -> Option<StreamId> {
        self.inner.by_node.get(node_id).map(|entry| *entry.value())
    }

    #[must_use]
    pub fn is_generating(&self, node_id: &NodeId) -> bool {
        self.inner.by_node.contains_key(node_id)
    }

    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.inner.streams.len()
    }

    async fn prepare(
        &self,
        node_id: &NodeId,
        options: GenerationOptions,
    ) -> Result<(Run, broadcast::Receiver<StreamFrame>)> {
        let inner = &self.inner;
        let default_model = &inner.config.default_model;
        let model_id = options.model.map_or_else(
            || default_model.clone(),
            |model| qualify_model_id(&model, default_model),
        );
        let handle = inner.providers.get_model(&model_id)?;
        let project = inner
            .persistence
            .project(&inner.project_id)
            .await?
            .ok_or_else(|| OrchestratorError::ProjectNotFound(inner.project_id.to_string()))?;
        let temperature = options.temperature.unwrap_or(inner.config.temperature);
        let max_tokens = options.max_tokens.unwrap_or(inner.config.max_tokens);

        let (session, receiver) = {
            let mut workspace = inner.workspace.lock();
            if workspace.node(node_id).is_none() {
                return Err(GraphError::NodeNotFound(node_id.clone()).into());
            }
            let Entry::Vacant(slot) = inner.by_node.entry(node_id.clone()) else {
                return Err(OrchestratorError::AlreadyGenerating(node_id.clone()));
            };
            workspace.begin_generation(node_id, Some(&handle.id()), Some(temperature))?;

            let (session, receiver) = StreamSession::open(node_id.clone(), inner.config.stream_capacity);
            let session = Arc::new(session);
            slot.insert(session.id());
            inner.streams.insert(
                session.id(),
                LiveStream {
                    session: Arc::clone(&session),
                    first: Mutex::new(None),
                },
            );
            (session, receiver)
        };

        let update = NodeUpdate {
            status: Some(PersistedStatus::Generating),
            model: Some(handle.id()),
            temperature: Some(temperature),
            ..NodeUpdate::default()
        };
        if let Err(err) = inner.persistence.update_node(node_id, update).await {
            if session.claim() {
                self.release(&session);
                inner.workspace.lock().cancel_generation(node_id);
            }
            return Err(err);
        }
        if session.is_aborted() {
            // cancelled while the generating status was in flight
            if let Err(err) = inner
                .persistence
                .update_node(node_id, NodeUpdate::status(PersistedStatus::Idle))
                .await
            {
                tracing::warn!(node_id = %node_id, error = %err, "failed to persist cancelled status");
            }
        }

        tracing::info!(
            node_id = %node_id,
            stream_id = %session.id(),
            model = %handle.id(),
            "generation started"
        );
        let run = Run {
            session,
            handle,
            system: project.system_prompt,
            temperature,
            max_tokens,
        };
        Ok((run, receiver))
    }

    fn spawn(&self, run: Run) {
        let span = tracing::info_span!(
            "generation",
            node_id = %run.session.node_id(),
            stream_id = %run.session.id(),
            model = %run.handle.id(),
        );
        tokio::spawn(self.clone().run(run).instrument(span));
    }

    async fn run(self, run: Run) {
        match self.stream_and_summarize(&run).await {
            Ok(Some(output)) => self.finish(&run, output).await,
            Ok(None) => tracing::debug!("run stopped after cancellation"),
            Err(err) => self.fail(&run.session, &err).await,
        }
    }

    /// Stream and summarise; `None` once the run has been aborted
    async fn stream_and_summarize(&self, run: &Run) -> Result<Option<GenerationOutput>> {
        let session = &run.session;
        let node_id = session.node_id();
        let messages = {
            let workspace = self.inner.workspace.lock();
            workspace.build_context(node_id)?
        };

        let request = StreamRequest {
            model: run.handle.name.clone(),
            system: run.system.clone(),
            messages,
            temperature: run.temperature,
            max_output_tokens: run.max_tokens,
            abort: Some(session.signal()),
        };
        let mut stream = run.handle.model().stream_text(request).await?;
        let mut abort = session.signal();
        let mut response = String::new();
        let mut chunks = 0_u32;
        let mut usage = None;

        loop {
            let event = tokio::select! {
                biased;
                () = abort.aborted() => return Ok(None),
                event = stream.next() => event,
            };
            match event {
                None => break,
                Some(Err(err)) => return Err(err),
                Some(Ok(StreamEvent::Finish(u))) => usage = Some(u),
                Some(Ok(StreamEvent::Delta(delta))) => {
                    if session.is_aborted() {
                        return Ok(None);
                    }
                    chunks += 1;
                    response.push_str(&delta);
                    self.inner
                        .workspace
                        .lock()
                        .append_generation_chunk(node_id, &delta);
                    let frame = StreamFrame::chunk(delta, progress(chunks, run.max_tokens));
                    session.publish(frame.clone());
                    self.emit(node_id, &frame).await;
                }
            }
        }
        drop(stream);

        let summary = self.summarize(&run.handle, &response).await;
        if session.is_aborted() {
            return Ok(None);
        }
        let tokens = usage.map(|u| u.total_tokens);
        tracing::debug!(chunks, ?tokens, "generation streamed");

        Ok(Some(GenerationOutput {
            response,
            summary,
            tokens,
        }))
    }

    /// One-sentence summary; any failure yields `None`
    async fn summarize(&self, handle: &ModelHandle, response: &str) -> Option<String> {
        if response.trim().is_empty() {
            return None;
        }
        let handle = match &self.inner.config.summary_model {
            Some(id) => match self
                .inner
                .providers
                .get_model(&qualify_model_id(id, &self.inner.config.default_model))
            {
                Ok(handle) => handle,
                Err(err) => {
                    tracing::warn!(error = %err, "summary model unavailable");
                    return None;
                }
            },
            None => handle.clone(),
        };

        let request = StreamRequest {
            model: handle.name.clone(),
            system: None,
            messages: vec![ChatMessage::user(format!(
                "Summarize the following response in one sentence:\n\n{response}"
            ))],
            temperature: SUMMARY_TEMPERATURE,
            max_output_tokens: self.inner.config.summary_max_tokens,
            abort: None,
        };
        let collected = match handle.model().stream_text(request).await {
            Ok(stream) => collect_text(stream).await,
            Err(err) => Err(err),
        };
        match collected {
            Ok((text, _)) => Some(text.trim().to_string()).filter(|s| !s.is_empty()),
            Err(err) => {
                tracing::warn!(error = %err, "summary generation failed");
                None
            }
        }
    }

    async fn finish(&self, run: &Run, output: GenerationOutput) {
        let session = &run.session;
        let node_id = session.node_id();
        if !session.claim() {
            tracing::debug!("completed run discarded after cancellation");
            return;
        }

        let update = NodeUpdate {
            response: Some(output.response.clone()),
            summary: Some(output.summary.clone()),
            status: Some(PersistedStatus::Completed),
            model: Some(run.handle.id()),
            tokens: output.tokens,
            ..NodeUpdate::default()
        };
        if let Err(err) = self.inner.persistence.update_node(node_id, update).await {
            self.settle_failure(session, &err).await;
            return;
        }

        let frame = StreamFrame::done(output.summary.clone(), output.tokens);
        if let Err(err) = self.inner.workspace.lock().complete_generation(node_id, output) {
            tracing::warn!(error = %err, "generated node vanished before completion");
        }
        session.publish(frame.clone());
        self.emit(node_id, &frame).await;
        self.release(session);
        tracing::info!("generation completed");
    }

    async fn fail(&self, session: &Arc<StreamSession>, err: &OrchestratorError) {
        if !session.claim() {
            tracing::debug!(error = %err, "run error after cancellation ignored");
            return;
        }
        self.settle_failure(session, err).await;
    }

    /// Error status, stored error, bare `done`; the session is already claimed
    async fn settle_failure(&self, session: &Arc<StreamSession>, err: &OrchestratorError) {
        let node_id = session.node_id();
        let message = err.to_string();
        tracing::error!(error = %message, "generation failed");

        self.inner
            .workspace
            .lock()
            .fail_generation(node_id, message.clone());
        let update = NodeUpdate {
            status: Some(PersistedStatus::Error),
            last_error: Some(message),
            ..NodeUpdate::default()
        };
        if let Err(persist_err) = self.inner.persistence.update_node(node_id, update).await {
            tracing::warn!(error = %persist_err, "failed to persist error status");
        }

        let frame = StreamFrame::done(None, None);
        session.publish(frame.clone());
        self.emit(node_id, &frame).await;
        self.release(session);
    }

    async fn emit(&self, node_id: &NodeId, frame: &StreamFrame) {
        self.inner
            .broadcaster
            .emit_to_project(&self.inner.project_id, NODE_STREAMING, streaming_payload(node_id, frame))
            .await;
    }

    fn release(&self, session: &StreamSession) {
        let stream_id = session.id();
        self.inner.streams.remove(&stream_id);
        self.inner
            .by_node
            .remove_if(session.node_id(), |_, current| *current == stream_id);
    }
}
