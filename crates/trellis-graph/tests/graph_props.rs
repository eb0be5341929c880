use proptest::prelude::*;
use trellis_graph::{NodeId, Point, Workspace};

#[derive(Debug, Clone)]
enum Op {
    Add,
    Child(usize),
    Connect(usize, usize),
    RawEdge(usize, usize),
    DeleteNode(usize),
    DeleteEdge(usize),
    Prompt(usize, String),
    Undo,
    Redo,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Add),
        3 => (0..32usize).prop_map(Op::Child),
        3 => (0..32usize, 0..32usize).prop_map(|(a, b)| Op::Connect(a, b)),
        1 => (0..32usize, 0..32usize).prop_map(|(a, b)| Op::RawEdge(a, b)),
        1 => (0..32usize).prop_map(Op::DeleteNode),
        1 => (0..32usize).prop_map(Op::DeleteEdge),
        2 => (0..32usize, "[a-z ]{0,12}").prop_map(|(i, p)| Op::Prompt(i, p)),
        1 => Just(Op::Undo),
        1 => Just(Op::Redo),
    ]
}

fn pick(ws: &Workspace, index: usize) -> Option<NodeId> {
    let count = ws.store().node_count();
    if count == 0 {
        return None;
    }
    ws.store().nodes().nth(index % count).map(|n| n.id.clone())
}

fn apply(ws: &mut Workspace, op: Op) {
    match op {
        Op::Add => {
            ws.add_node(Point::default());
        }
        Op::Child(i) => {
            if let Some(parent) = pick(ws, i) {
                ws.create_child_node(&parent, "child", None);
            }
        }
        Op::Connect(a, b) => {
            if let (Some(s), Some(t)) = (pick(ws, a), pick(ws, b)) {
                let _ = ws.connect(&s, &t);
            }
        }
        Op::RawEdge(a, b) => {
            if let (Some(s), Some(t)) = (pick(ws, a), pick(ws, b)) {
                ws.add_edge(&s, &t);
            }
        }
        Op::DeleteNode(i) => {
            if let Some(id) = pick(ws, i) {
                ws.delete_node(&id);
            }
        }
        Op::DeleteEdge(i) => {
            let count = ws.store().edge_count();
            if count > 0 {
                let id = ws.store().edges().nth(i % count).map(|e| e.id.clone());
                if let Some(id) = id {
                    ws.delete_edge(&id);
                }
            }
        }
        Op::Prompt(i, prompt) => {
            if let Some(id) = pick(ws, i) {
                ws.update_node_prompt(&id, prompt);
            }
        }
        Op::Undo => {
            ws.undo();
        }
        Op::Redo => {
            ws.redo();
        }
    }
}

proptest! {
    #[test]
    fn prop_links_stay_bidirectional(ops in proptest::collection::vec(op(), 1..80)) {
        let mut ws = Workspace::default();
        for op in ops {
            apply(&mut ws, op);
            prop_assert!(ws.store().check_invariants().is_ok(), "{:?}", ws.store().check_invariants());
        }
    }

    #[test]
    fn prop_connect_never_creates_cycles(ops in proptest::collection::vec(op(), 1..60)) {
        let mut ws = Workspace::default();
        for op in ops.into_iter().filter(|o| !matches!(o, Op::RawEdge(..))) {
            apply(&mut ws, op);
        }
        for node in ws.store().nodes() {
            for child in &node.children_ids {
                prop_assert!(!ws.store().is_reachable(child, &node.id));
            }
        }
    }

    #[test]
    fn prop_build_include_exclude_disjoint(
        toggles in proptest::collection::vec((0..6usize, any::<bool>()), 0..60)
    ) {
        let mut ws = Workspace::default();
        let root = ws.add_node(Point::default());
        let mut ids = vec![root.clone()];
        for i in 0..5 {
            let parent = ids[i / 2].clone();
            ids.push(ws.create_child_node(&parent, "n", None).unwrap());
        }
        ws.start_build_session(&root).unwrap();

        for (index, include) in toggles {
            let id = &ids[index];
            if include {
                ws.toggle_build_include(id).unwrap();
            } else {
                ws.toggle_build_exclude(id).unwrap();
            }
            let session = ws.build_session().unwrap();
            prop_assert!(session.included().is_disjoint(session.excluded()));
        }
    }
}

#[test]
fn test_duplicate_edge_returns_none_once() {
    let mut ws = Workspace::default();
    let a = ws.add_node(Point::default());
    let b = ws.add_node(Point::default());

    assert!(ws.add_edge(&a, &b).is_some());
    assert!(ws.add_edge(&a, &b).is_none());
    assert_eq!(ws.node(&b).unwrap().parent_ids, vec![a.clone()]);
    assert_eq!(ws.node(&a).unwrap().children_ids, vec![b]);
}

#[test]
fn test_delete_integrity() {
    let mut ws = Workspace::default();
    let p = ws.add_node(Point::default());
    let x = ws.create_child_node(&p, "x", None).unwrap();
    let y = ws.create_child_node(&x, "y", None).unwrap();

    assert!(ws.delete_node(&x));
    assert!(ws.node(&p).unwrap().children_ids.is_empty());
    assert!(ws.node(&y).unwrap().parent_ids.is_empty());
    assert!(ws.store().edges().all(|e| e.source != x && e.target != x));
}
