//! Language model seam
//!
//! Models are addressed as `provider:model` (or `provider/model`). Providers
//! register one [`LanguageModel`] each; resolving an id whose provider is not
//! registered fails fast instead of substituting another provider.

use crate::error::{OrchestratorError, Result};
use crate::stream::AbortSignal;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use trellis_graph::{ChatMessage, ChatRole};

/// Token accounting reported at the end of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub total_tokens: u32,
}

/// Item of a model stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text fragment
    Delta(String),
    /// Stream finished with usage figures
    Finish(Usage),
}

/// Lazy, finite, non-restartable sequence of model events
pub type TextStream = BoxStream<'static, Result<StreamEvent>>;

/// Everything a model needs for one streaming call
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Model name without the provider prefix
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub abort: Option<AbortSignal>,
}

/// A streaming text model
#[async_trait]
pub trait LanguageModel: Send + Sync + Debug {
    /// Open a stream of text deltas
    ///
    /// # Errors
    /// `OrchestratorError::Generation` if the call cannot be started.
    async fn stream_text(&self, request: StreamRequest) -> Result<TextStream>;
}

/// Resolved model id
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub provider: String,
    pub name: String,
    model: Arc<dyn LanguageModel>,
}

impl ModelHandle {
    /// Canonical `provider:model` id
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.provider, self.name)
    }

    #[must_use]
    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }
}

/// Split `provider:model` / `provider/model`
///
/// # Errors
/// `OrchestratorError::InvalidModelId` when either half is empty or missing.
pub fn parse_model_id(id: &str) -> Result<(&str, &str)> {
    let (provider, name) = id
        .split_once(':')
        .or_else(|| id.split_once('/'))
        .ok_or_else(|| OrchestratorError::InvalidModelId(id.to_string()))?;
    let (provider, name) = (provider.trim(), name.trim());
    if provider.is_empty() || name.is_empty() {
        return Err(OrchestratorError::InvalidModelId(id.to_string()));
    }
    Ok((provider, name))
}

/// Qualify a bare model name with the provider of `default_model`
///
/// Ids that already carry a `provider:` or `provider/` prefix are returned as
/// they are, as is everything when `default_model` is itself malformed.
#[must_use]
pub fn qualify_model_id(id: &str, default_model: &str) -> String {
    if id.contains(':') || id.contains('/') {
        return id.to_string();
    }
    match parse_model_id(default_model) {
        Ok((provider, _)) => format!("{provider}:{}", id.trim()),
        Err(_) => id.to_string(),
    }
}

/// Registered providers, keyed by prefix
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn LanguageModel>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `echo` provider
    #[must_use]
    pub fn with_echo() -> Self {
        let registry = Self::new();
        registry.register("echo", Arc::new(EchoModel::default()));
        registry
    }

    pub fn register(&self, provider: impl Into<String>, model: Arc<dyn LanguageModel>) {
        let provider = provider.into();
        tracing::debug!(%provider, "model provider registered");
        self.providers.insert(provider, model);
    }

    #[must_use]
    pub fn is_configured(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    /// Resolve a model id
    ///
    /// # Errors
    /// - `OrchestratorError::InvalidModelId` for malformed ids
    /// - `OrchestratorError::ProviderUnavailable` for unregistered providers
    pub fn get_model(&self, id: &str) -> Result<ModelHandle> {
        let (provider, name) = parse_model_id(id)?;
        let model = self
            .providers
            .get(provider)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OrchestratorError::ProviderUnavailable(provider.to_string()))?;
        Ok(ModelHandle {
            provider: provider.to_string(),
            name: name.to_string(),
            model,
        })
    }
}

/// Deterministic offline model: streams the last user message back word by word
#[derive(Debug, Clone, Default)]
pub struct EchoModel {
    /// Pause before each delta
    pub delay: Option<Duration>,
}

impl EchoModel {
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

#[async_trait]
impl LanguageModel for EchoModel {
    async fn stream_text(&self, request: StreamRequest) -> Result<TextStream> {
        let last = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let text = format!("Echo: {last}");

        let mut deltas: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();
        let limit = usize::try_from(request.max_output_tokens).unwrap_or(usize::MAX);
        deltas.truncate(limit);
        let tokens = u32::try_from(deltas.len()).unwrap_or(u32::MAX);

        let delay = self.delay;
        let events = stream::iter(deltas)
            .then(move |delta| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, OrchestratorError>(StreamEvent::Delta(delta))
            })
            .chain(stream::once(async move {
                Ok::<_, OrchestratorError>(StreamEvent::Finish(Usage { total_tokens: tokens }))
            }));
        Ok(events.boxed())
    }
}

/// Drain a stream into its text and usage
///
/// # Errors
/// The first error the stream yields.
pub async fn collect_text(mut stream: TextStream) -> Result<(String, Option<Usage>)> {
    let mut text = String::new();
    let mut usage = None;
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Delta(delta) => text.push_str(&delta),
            StreamEvent::Finish(u) => usage = Some(u),
        }
    }
    Ok((text, usage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn request(prompt: &str) -> StreamRequest {
        StreamRequest {
            model: "default".to_string(),
            system: None,
            messages: vec![ChatMessage::user(prompt)],
            temperature: 0.7,
            max_output_tokens: 64,
            abort: None,
        }
    }

    #[test]
    fn model_ids_parse_with_either_separator() {
        assert_eq!(parse_model_id("openai:gpt-4o").unwrap(), ("openai", "gpt-4o"));
        assert_eq!(parse_model_id("anthropic/claude").unwrap(), ("anthropic", "claude"));
        assert!(parse_model_id("bare").is_err());
        assert!(parse_model_id(":x").is_err());
    }

    #[test]
    fn bare_names_take_the_default_provider() {
        assert_eq!(qualify_model_id("m", "test:scripted"), "test:m");
        assert_eq!(qualify_model_id("openai:gpt-4o", "test:scripted"), "openai:gpt-4o");
        assert_eq!(qualify_model_id("anthropic/claude", "echo:default"), "anthropic/claude");
        assert_eq!(qualify_model_id("m", "broken"), "m");
        assert!(parse_model_id(&qualify_model_id("", "test:scripted")).is_err());
    }

    #[test]
    fn unknown_provider_is_unavailable() {
        let registry = ProviderRegistry::with_echo();
        let err = registry.get_model("openai:gpt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);

        let err = registry.get_model("nonsense").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let handle = registry.get_model("echo/default").unwrap();
        assert_eq!(handle.id(), "echo:default");
    }

    #[tokio::test]
    async fn echo_streams_words() {
        let stream = EchoModel::default().stream_text(request("hi there")).await.unwrap();
        let (text, usage) = collect_text(stream).await.unwrap();
        assert_eq!(text, "Echo: hi there");
        assert_eq!(usage, Some(Usage { total_tokens: 3 }));
    }
}
