//! Per-node streaming sessions
//!
//! A session pairs a broadcast channel of [`StreamFrame`]s with an abort
//! signal. The orchestrator's registry holds one `Arc<StreamSession>`, the
//! generation task holds another; the channel closes once both are gone.
//!
//! A session ends exactly once: either [`StreamSession::abort`] or
//! [`StreamSession::claim`] wins, never both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{broadcast, watch};
use trellis_graph::NodeId;
use uuid::Uuid;

/// Stream identifier handed back by `start_generation`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub Uuid);

impl StreamId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One JSON frame of the stream transport
///
/// Absent fields are omitted on the wire; the last frame carries `done: true`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
}

impl StreamFrame {
    #[must_use]
    pub fn chunk(text: impl Into<String>, progress: f64) -> Self {
        Self {
            chunk: Some(text.into()),
            progress: Some(progress),
            ..Self::default()
        }
    }

    /// Terminal frame; failures carry neither summary nor tokens
    #[must_use]
    pub fn done(summary: Option<String>, tokens: Option<u32>) -> Self {
        Self {
            done: true,
            summary,
            tokens,
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Heuristic progress: `min(0.99, chunks / ceil(max_tokens / 20))`
#[must_use]
pub fn progress(chunks: u32, max_tokens: u32) -> f64 {
    let expected = max_tokens.div_ceil(20).max(1);
    (f64::from(chunks) / f64::from(expected)).min(0.99)
}

/// Receiving half of a session's abort flag
#[derive(Debug, Clone)]
pub struct AbortSignal(watch::Receiver<bool>);

impl AbortSignal {
    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the session is aborted
    ///
    /// Never resolves if the session is dropped without aborting.
    pub async fn aborted(&mut self) {
        if self.0.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

const RUNNING: u8 = 0;
const ABORTED: u8 = 1;
const SETTLING: u8 = 2;

/// Live generation stream for one node
#[derive(Debug)]
pub struct StreamSession {
    id: StreamId,
    node_id: NodeId,
    frames: broadcast::Sender<StreamFrame>,
    abort: watch::Sender<bool>,
    phase: AtomicU8,
    created_at: DateTime<Utc>,
}

impl StreamSession {
    /// New session and a receiver subscribed before any frame is sent
    #[must_use]
    pub fn open(node_id: NodeId, capacity: usize) -> (Self, broadcast::Receiver<StreamFrame>) {
        let (frames, receiver) = broadcast::channel(capacity.max(1));
        let (abort, _) = watch::channel(false);
        let session = Self {
            id: StreamId::new(),
            node_id,
            frames,
            abort,
            phase: AtomicU8::new(RUNNING),
            created_at: Utc::now(),
        };
        (session, receiver)
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamFrame> {
        self.frames.subscribe()
    }

    /// Publish a frame; having no subscribers is fine
    pub fn publish(&self, frame: StreamFrame) {
        let _ = self.frames.send(frame);
    }

    /// Stop a running session; `false` if it was already aborted or claimed
    pub fn abort(&self) -> bool {
        let won = self
            .phase
            .compare_exchange(RUNNING, ABORTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.abort.send_replace(true);
        }
        won
    }

    /// Take the right to settle the run (persist its result or failure)
    ///
    /// `false` once the session has been aborted; after a successful claim
    /// [`Self::abort`] has no effect.
    pub fn claim(&self) -> bool {
        self.phase
            .compare_exchange(RUNNING, SETTLING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        AbortSignal(self.abort.subscribe())
    }
}
