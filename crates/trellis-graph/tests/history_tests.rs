use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use trellis_graph::{ManualClock, NodeStatus, Point, Workspace};

#[test]
fn test_history_is_capped_at_fifty() {
    let clock = Arc::new(ManualClock::new());
    let mut ws = Workspace::default().with_clock(clock.clone());

    for i in 0..60u32 {
        ws.add_node(Point::new(f64::from(i), 0.0));
        clock.advance(Duration::from_millis(800));
    }
    assert_eq!(ws.history().past_len(), 50);
    assert_eq!(ws.store().node_count(), 60);

    let before = ws.store().snapshot();
    assert!(ws.undo());
    assert_eq!(ws.store().node_count(), 59);
    assert!(ws.redo());
    assert_eq!(ws.store().snapshot(), before);
}

#[test]
fn test_rapid_adds_share_one_step() {
    let clock = Arc::new(ManualClock::new());
    let mut ws = Workspace::default().with_clock(clock.clone());

    ws.add_node(Point::default());
    clock.advance(Duration::from_millis(100));
    ws.add_node(Point::default());
    assert_eq!(ws.history().past_len(), 1);

    assert!(ws.undo());
    assert_eq!(ws.store().node_count(), 0);
}

#[test]
fn test_selection_and_project_name_are_versioned() {
    let clock = Arc::new(ManualClock::new());
    let mut ws = Workspace::default().with_clock(clock.clone());
    ws.set_project_name("before");
    let a = ws.add_node(Point::default());
    ws.select(&a);
    ws.set_project_name("after");

    assert!(ws.undo());
    assert_eq!(ws.store().project_name(), "before");
    assert!(ws.store().selected().is_empty());
}

#[test]
fn test_cascade_scenario() {
    let mut ws = Workspace::default();
    let r = ws.add_node_with_prompt(Point::default(), "root");
    let c1 = ws.create_child_node(&r, "c1", None).unwrap();
    let c2 = ws.create_child_node(&r, "c2", None).unwrap();
    let g = ws.create_child_node(&c1, "g", None).unwrap();
    ws.set_node_status(&c1, NodeStatus::Loading);

    ws.update_node_prompt(&r, "new");

    assert_eq!(ws.node(&c1).unwrap().status, NodeStatus::Loading);
    assert_eq!(ws.node(&c2).unwrap().status, NodeStatus::Stale);
    assert_eq!(ws.node(&g).unwrap().status, NodeStatus::Stale);

    let marked = ws.cascade_stale(&c1).unwrap();
    assert_eq!(marked, vec![g]);
}

#[test]
fn test_undo_after_delete_restores_links() {
    let clock = Arc::new(ManualClock::new());
    let mut ws = Workspace::default().with_clock(clock.clone());
    let p = ws.add_node(Point::default());
    clock.advance(Duration::from_secs(1));
    let c = ws.create_child_node(&p, "c", None).unwrap();
    clock.advance(Duration::from_secs(1));

    ws.delete_node(&p);
    assert!(ws.undo());

    assert_eq!(ws.node(&c).unwrap().parent_ids, vec![p]);
    ws.store().check_invariants().unwrap();
}
