//! End-to-end walkthrough on the offline echo model

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use trellis_graph::{NodeId, Point, Workspace};
use trellis_orchestrator::{
    Command, CommandDispatcher, CommandOutcome, EchoModel, EngineConfig, GenerationOptions, GenerationOrchestrator,
    InMemoryPersistence, PersistedNode, Project, ProjectId, ProviderRegistry,
};

const PROJECT: &str = "demo";

fn mirror(persistence: &InMemoryPersistence, workspace: &Workspace, id: &NodeId) {
    if let Some(node) = workspace.node(id) {
        persistence.upsert_node(PersistedNode::from_node(&ProjectId::from(PROJECT), node));
    }
}

fn print_line(value: &serde_json::Value) {
    println!("{value}");
}

/// Build a small graph, stream a generation, cascade and derive a plan
pub(crate) async fn run_demo(config: EngineConfig, delay: Duration) -> Result<()> {
    let persistence = Arc::new(InMemoryPersistence::new());
    persistence.insert_project(
        Project::new(PROJECT, "Demo project").with_system_prompt("You are a concise engineering assistant."),
    );
    let providers = ProviderRegistry::new();
    providers.register("echo", Arc::new(EchoModel::with_delay(delay)));

    let orchestrator = GenerationOrchestrator::builder(PROJECT)
        .workspace(Arc::new(Workspace::new(config.graph_config()).into()))
        .providers(Arc::new(providers))
        .persistence(persistence.clone())
        .config(config.generation.clone())
        .build();

    let (root, child) = {
        let mut ws = orchestrator.workspace().lock();
        ws.set_project_name("Demo project");
        let root = ws.add_node_with_prompt(Point::new(0.0, 0.0), "Design a key-value cache");
        let child = ws
            .create_child_node(&root, "Which eviction policy fits best?", None)
            .context("root vanished while building the demo graph")?;
        mirror(&persistence, &ws, &root);
        mirror(&persistence, &ws, &child);
        (root, child)
    };

    // 1. stream the root
    let stream_id = orchestrator
        .start_generation(&root, GenerationOptions::default())
        .await?;
    let mut frames = orchestrator
        .get_stream(&stream_id)
        .context("stream closed before it could be read")?;
    while let Ok(frame) = frames.recv().await {
        print_line(&json!({ "stream": stream_id, "frame": frame }));
        if frame.is_done() {
            break;
        }
    }

    // 2. edit the root and regenerate everything downstream
    let edited = orchestrator
        .workspace()
        .lock()
        .update_node_prompt(&root, "Design a distributed key-value cache");
    tracing::info!(edited, "root prompt edited");
    let report = orchestrator
        .cascade_regenerate(&root, GenerationOptions::default())
        .await?;
    print_line(&json!({ "cascade": report }));

    // 3. curate a build scope and derive a plan through the command bus
    {
        let mut ws = orchestrator.workspace().lock();
        ws.start_build_session(&root)?;
        ws.set_build_deliverable("A design document for the cache")?;
    }
    let (bus, dispatcher) = CommandDispatcher::new(orchestrator.clone()).start();
    let outcome = bus
        .send(Command::BuildPlan {
            options: GenerationOptions::default(),
        })
        .await?;
    if let CommandOutcome::Started { node_id, stream_id } = outcome {
        if let Some(mut plan_frames) = orchestrator.get_stream(&stream_id) {
            while let Ok(frame) = plan_frames.recv().await {
                if frame.is_done() {
                    break;
                }
            }
        }
        let ws = orchestrator.workspace().lock();
        if let Some(plan) = ws.node(&node_id) {
            print_line(&json!({ "plan": plan }));
        }
    }
    bus.send(Command::Shutdown).await?;
    dispatcher.await?;

    let ws = orchestrator.workspace().lock();
    print_line(&json!({
        "project": ws.store().project_name(),
        "nodes": ws.store().node_count(),
        "edges": ws.store().edge_count(),
        "childStatus": ws.node(&child).map(|n| n.status),
    }));
    Ok(())
}
