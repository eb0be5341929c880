//! Streaming generation scenarios against scripted models

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::time::timeout;
use trellis_graph::{ChatRole, NodeId, NodeStatus, Point};
use trellis_orchestrator::{
    ErrorKind, GenerationConfig, GenerationOptions, GenerationOrchestrator, GenerationOutcome, InMemoryPersistence,
    NodeUpdate, OrchestratorError, PersistedNode, PersistedStatus, Persistence, Project, ProjectId, ProviderRegistry,
    Result, StreamFrame, NODE_STREAMING,
};
use trellis_test_utils::{Harness, ScriptedModel, TEST_PROVIDER};

const WAIT: Duration = Duration::from_secs(2);

async fn next_frame(rx: &mut tokio::sync::broadcast::Receiver<StreamFrame>) -> StreamFrame {
    timeout(WAIT, rx.recv()).await.expect("frame in time").expect("open stream")
}

#[tokio::test]
async fn test_linear_generation_scenario() {
    let h = Harness::new();
    let node = h.add_node("Say hello");
    let feed = h.model.push_script();
    h.model.push_reply(&["Greeting"], 1);

    let stream_id = h
        .orchestrator
        .start_generation(&node, GenerationOptions::default())
        .await
        .unwrap();
    let mut rx = h.orchestrator.get_stream(&stream_id).unwrap();
    assert_eq!(h.node(&node).status, NodeStatus::Loading);
    assert_eq!(h.persisted(&node).status, PersistedStatus::Generating);
    assert_eq!(h.orchestrator.stream_for_node(&node), Some(stream_id));

    feed.chunk("He");
    let first = next_frame(&mut rx).await;
    assert_eq!(first.chunk.as_deref(), Some("He"));
    assert!((first.progress.unwrap() - 1.0 / 103.0).abs() < 1e-9);

    feed.chunk("llo");
    let second = next_frame(&mut rx).await;
    assert_eq!(second.chunk.as_deref(), Some("llo"));
    assert!(second.progress.unwrap() > first.progress.unwrap());
    assert_eq!(h.node(&node).response, "Hello");

    feed.finish(2);
    drop(feed);
    let done = next_frame(&mut rx).await;
    assert_eq!(done, StreamFrame::done(Some("Greeting".to_string()), Some(2)));

    let local = h.node(&node);
    assert_eq!(local.status, NodeStatus::Idle);
    assert_eq!(local.response, "Hello");
    assert_eq!(local.summary.as_deref(), Some("Greeting"));
    assert_eq!(local.orchestration.generation.tokens, Some(2));

    let stored = h.persisted(&node);
    assert_eq!(stored.response, "Hello");
    assert_eq!(stored.summary.as_deref(), Some("Greeting"));
    assert_eq!(stored.status, PersistedStatus::Completed);
    assert_eq!(stored.tokens, Some(2));
    assert_eq!(stored.model.as_deref(), Some("test:scripted"));

    h.settle().await;
    assert!(h.orchestrator.get_stream(&stream_id).is_none());

    let mirrored = h.broadcaster.frames_for(&node);
    assert_eq!(mirrored.len(), 3);
    assert!(mirrored[2].is_done());
    assert!(h.broadcaster.events().iter().all(|e| e.event == NODE_STREAMING && e.project == h.project));
}

#[tokio::test]
async fn test_cancellation_scenario() {
    let h = Harness::new();
    let node = h.add_node("Long answer please");
    h.orchestrator
        .workspace()
        .lock()
        .update_node_response(&node, "previous answer");
    h.mirror(&node);

    let feed = h.model.push_script();
    let stream_id = h
        .orchestrator
        .start_generation(&node, GenerationOptions::default())
        .await
        .unwrap();
    let mut rx = h.orchestrator.get_stream(&stream_id).unwrap();

    feed.chunk("partial");
    assert_eq!(next_frame(&mut rx).await.chunk.as_deref(), Some("partial"));

    assert!(h.orchestrator.cancel(&node).await);
    assert!(!h.orchestrator.cancel(&node).await);

    let local = h.node(&node);
    assert_eq!(local.status, NodeStatus::Idle);
    assert_eq!(local.response, "previous answer");
    assert!(h.orchestrator.get_stream(&stream_id).is_none());
    assert!(h.orchestrator.stream_for_node(&node).is_none());

    // channel closes without a done frame
    let closed = timeout(WAIT, rx.recv()).await.expect("close in time");
    assert!(matches!(closed, Err(RecvError::Closed)));

    feed.chunk("late");
    feed.finish(3);
    drop(feed);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stored = h.persisted(&node);
    assert_eq!(stored.response, "previous answer");
    assert_eq!(stored.status, PersistedStatus::Idle);
    assert!(h.broadcaster.frames_for(&node).iter().all(|f| !f.is_done()));
    assert_eq!(h.node(&node).response, "previous answer");
}

#[tokio::test]
async fn test_stream_failure_sets_error_status() {
    let h = Harness::new();
    let node = h.add_node("Explode");
    h.model.push_stream_error(&["par"], "upstream reset");

    let outcome = h
        .orchestrator
        .generate_and_wait(&node, GenerationOptions::default())
        .await
        .unwrap();
    let GenerationOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("upstream reset"));

    let local = h.node(&node);
    assert_eq!(local.status, NodeStatus::Error);
    assert_eq!(local.response, "");
    assert!(local
        .orchestration
        .generation
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("upstream reset")));

    let stored = h.persisted(&node);
    assert_eq!(stored.status, PersistedStatus::Error);
    assert!(stored.last_error.is_some());

    h.settle().await;
    let frames = h.broadcaster.frames_for(&node);
    assert_eq!(frames.last(), Some(&StreamFrame::done(None, None)));
}

#[tokio::test]
async fn test_refused_call_fails_run_not_start() {
    let h = Harness::new();
    let node = h.add_node("Refuse me");
    h.model.push_refusal("quota exceeded");

    let outcome = h
        .orchestrator
        .generate_and_wait(&node, GenerationOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, GenerationOutcome::Failed(ref m) if m.contains("quota exceeded")));
    assert_eq!(h.node(&node).status, NodeStatus::Error);
}

#[tokio::test]
async fn test_second_start_is_rejected_while_generating() {
    let h = Harness::new();
    let node = h.add_node("Only once");
    let feed = h.model.push_script();

    let stream_id = h
        .orchestrator
        .start_generation(&node, GenerationOptions::default())
        .await
        .unwrap();
    let err = h
        .orchestrator
        .start_generation(&node, GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyGenerating(ref id) if id == &node));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.orchestrator.active_streams(), 1);

    let mut rx = h.orchestrator.get_stream(&stream_id).unwrap();
    feed.chunk("one");
    feed.finish(1);
    drop(feed);

    // no summary script queued: the summary call fails and is swallowed
    let mut last = next_frame(&mut rx).await;
    while !last.is_done() {
        last = next_frame(&mut rx).await;
    }
    assert_eq!(last, StreamFrame::done(None, Some(1)));
    assert_eq!(h.node(&node).status, NodeStatus::Idle);
    assert_eq!(h.node(&node).summary, None);
}

#[tokio::test]
async fn test_unconfigured_provider_is_not_substituted() {
    let h = Harness::new();
    let node = h.add_node("Which model?");

    let err = h
        .orchestrator
        .start_generation(&node, GenerationOptions::default().with_model("openai:gpt-4o"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);

    let err = h
        .orchestrator
        .start_generation(&node, GenerationOptions::default().with_model("test:"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(h.model.requests().is_empty());
    assert_eq!(h.node(&node).status, NodeStatus::Idle);
    assert_eq!(h.persisted(&node).status, PersistedStatus::Idle);
}

#[tokio::test]
async fn test_request_carries_context_and_options() {
    let h = Harness::new();
    h.persistence
        .insert_project(Project::new(h.project.0.clone(), "Test project").with_system_prompt("Be brief."));
    let parent = h.add_node("What is a cache?");
    h.orchestrator
        .workspace()
        .lock()
        .update_node_response(&parent, "A fast store.");
    let child = h.add_child(&parent, "Name an eviction policy");
    h.model.push_reply(&["LRU"], 1);
    h.model.push_reply(&["Names LRU."], 1);

    let options = GenerationOptions::default().with_temperature(0.2).with_max_tokens(100);
    let outcome = h.orchestrator.generate_and_wait(&child, options).await.unwrap();
    assert_eq!(
        outcome,
        GenerationOutcome::Completed {
            summary: Some("Names LRU.".to_string()),
            tokens: Some(1),
        }
    );

    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    let main = &requests[0];
    assert_eq!(main.model, "scripted");
    assert_eq!(main.system.as_deref(), Some("Be brief."));
    assert!((main.temperature - 0.2).abs() < f32::EPSILON);
    assert_eq!(main.max_output_tokens, 100);
    let last = main.messages.last().unwrap();
    assert_eq!(last.role, ChatRole::User);
    assert_eq!(last.content, "Name an eviction policy");
    assert!(main.messages.iter().any(|m| m.content.contains("A fast store.")));

    let summary = &requests[1];
    assert!(summary.messages[0].content.contains("LRU"));
    assert_eq!(summary.max_output_tokens, 60);

    let stored = h.persisted(&child);
    assert_eq!(stored.temperature, Some(0.2));
}

#[tokio::test]
async fn test_concurrent_generations_on_distinct_nodes() {
    let h = Harness::new();
    let a = h.add_node("a");
    let b = h.add_node("b");

    let feed_a = h.model.push_script();
    let sa = h.orchestrator.start_generation(&a, GenerationOptions::default()).await.unwrap();
    wait_for_requests(&h, 1).await;
    let feed_b = h.model.push_script();
    let sb = h.orchestrator.start_generation(&b, GenerationOptions::default()).await.unwrap();
    wait_for_requests(&h, 2).await;

    assert_ne!(sa, sb);
    assert_eq!(h.orchestrator.active_streams(), 2);

    assert!(h.orchestrator.cancel(&a).await);
    feed_b.chunk("B");
    drop(feed_b);
    drop(feed_a);
    h.settle().await;

    assert_eq!(h.node(&a).status, NodeStatus::Idle);
    assert_eq!(h.node(&b).response, "B");
    assert_eq!(h.node(&b).status, NodeStatus::Idle);
}

async fn wait_for_requests(h: &Harness, count: usize) {
    timeout(WAIT, async {
        while h.model.requests().len() < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("model called in time");
}

#[tokio::test]
async fn test_dedicated_summary_model() {
    let mut config = GenerationConfig::default();
    config.summary_model = Some("echo:tiny".to_string());
    let h = Harness::with_config(config);
    let node = h.add_node("Hi");
    h.model.push_reply(&["Hello there"], 2);

    let outcome = h
        .orchestrator
        .generate_and_wait(&node, GenerationOptions::default())
        .await
        .unwrap();
    let GenerationOutcome::Completed { summary, .. } = outcome else {
        panic!("expected completion");
    };
    assert!(summary.unwrap().starts_with("Echo: Summarize"));
    assert_eq!(h.model.requests().len(), 1);
}

#[tokio::test]
async fn test_bare_model_name_uses_default_provider() {
    let h = Harness::new();
    let node = h.add_node("Say hello");
    h.model.push_reply(&["He", "llo"], 2);
    h.model.push_reply(&["Greeting"], 1);

    let outcome = h
        .orchestrator
        .generate_and_wait(&node, GenerationOptions::default().with_model("m"))
        .await
        .unwrap();
    assert!(matches!(outcome, GenerationOutcome::Completed { .. }));
    assert_eq!(h.model.requests()[0].model, "m");
    assert_eq!(h.node(&node).response, "Hello");
    assert_eq!(h.persisted(&node).model.as_deref(), Some("test:m"));
}

#[tokio::test]
async fn test_cancel_during_summary_persists_nothing() {
    let h = Harness::new();
    let node = h.add_node("Explain caching");
    h.orchestrator
        .workspace()
        .lock()
        .update_node_response(&node, "OLD");
    h.mirror(&node);

    h.model.push_reply(&["NEW"], 1);
    let summary_feed = h.model.push_script();
    let stream_id = h
        .orchestrator
        .start_generation(&node, GenerationOptions::default())
        .await
        .unwrap();
    let mut rx = h.orchestrator.get_stream(&stream_id).unwrap();
    wait_for_requests(&h, 2).await;

    assert!(h.orchestrator.cancel(&node).await);
    summary_feed.chunk("A summary.");
    summary_feed.finish(1);
    drop(summary_feed);
    h.settle().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let local = h.node(&node);
    assert_eq!(local.status, NodeStatus::Idle);
    assert_eq!(local.response, "OLD");
    assert_eq!(local.summary, None);
    let stored = h.persisted(&node);
    assert_eq!(stored.status, PersistedStatus::Idle);
    assert_eq!(stored.response, "OLD");
    assert_eq!(stored.summary, None);

    assert_eq!(next_frame(&mut rx).await.chunk.as_deref(), Some("NEW"));
    let closed = timeout(WAIT, rx.recv()).await.expect("close in time");
    assert!(matches!(closed, Err(RecvError::Closed)));
}

/// Storage that holds the completed write until released
#[derive(Debug, Default)]
struct HeldCompletion {
    inner: InMemoryPersistence,
    reached: Notify,
    release: Notify,
}

#[async_trait]
impl Persistence for HeldCompletion {
    async fn project(&self, id: &ProjectId) -> Result<Option<Project>> {
        self.inner.project(id).await
    }

    async fn node(&self, id: &NodeId) -> Result<Option<PersistedNode>> {
        self.inner.node(id).await
    }

    async fn update_node(&self, id: &NodeId, update: NodeUpdate) -> Result<()> {
        if update.status == Some(PersistedStatus::Completed) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.update_node(id, update).await
    }

    async fn create_node_with_edges(&self, node: PersistedNode, parents: &[NodeId]) -> Result<()> {
        self.inner.create_node_with_edges(node, parents).await
    }
}

#[tokio::test]
async fn test_cancel_during_completed_write_keeps_storage_consistent() {
    let project = ProjectId::from("held");
    let storage = Arc::new(HeldCompletion::default());
    storage.inner.insert_project(Project::new(project.0.clone(), "Held"));
    let model = Arc::new(ScriptedModel::new());
    let providers = ProviderRegistry::new();
    providers.register(TEST_PROVIDER, model.clone());
    let mut config = GenerationConfig::default();
    config.default_model = format!("{TEST_PROVIDER}:scripted");
    let orchestrator = GenerationOrchestrator::builder(project.clone())
        .providers(Arc::new(providers))
        .persistence(storage.clone())
        .config(config)
        .build();

    let node = {
        let mut workspace = orchestrator.workspace().lock();
        let id = workspace.add_node_with_prompt(Point::default(), "Explain caching");
        workspace.update_node_response(&id, "OLD");
        storage
            .inner
            .upsert_node(PersistedNode::from_node(&project, workspace.node(&id).unwrap()));
        id
    };
    model.push_reply(&["NEW"], 1);
    model.push_reply(&["Short."], 1);

    let stream_id = orchestrator
        .start_generation(&node, GenerationOptions::default())
        .await
        .unwrap();
    let mut rx = orchestrator.get_stream(&stream_id).unwrap();
    timeout(WAIT, storage.reached.notified()).await.expect("completed write reached");

    // the run is already settling; cancelling now must not split the two sides
    assert!(!orchestrator.cancel(&node).await);
    assert!(orchestrator.is_generating(&node));
    storage.release.notify_one();

    let mut last = next_frame(&mut rx).await;
    while !last.is_done() {
        last = next_frame(&mut rx).await;
    }
    assert_eq!(last, StreamFrame::done(Some("Short.".to_string()), Some(1)));

    let local = orchestrator.workspace().lock().node(&node).cloned().unwrap();
    let stored = storage.inner.node_snapshot(&node).unwrap();
    assert_eq!(local.status, NodeStatus::Idle);
    assert_eq!(local.response, "NEW");
    assert_eq!(stored.status, PersistedStatus::Completed);
    assert_eq!(stored.response, local.response);
    assert_eq!(stored.summary, local.summary);
}
