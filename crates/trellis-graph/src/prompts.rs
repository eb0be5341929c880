//! Instruction templates for derived nodes

use crate::types::{NodeId, TodoItem};

/// Prompt for a plan node built from a curated scope
#[must_use]
pub fn plan_prompt(deliverable: &str) -> String {
    format!(
        "Create a detailed, step-by-step plan to produce the following deliverable:\n\n\
         {deliverable}\n\n\
         Use the connected context as source material. Break the work into ordered phases \
         with concrete tasks, call out open risks and decisions, and finish with acceptance \
         criteria."
    )
}

/// Prompt for the final deliverable derived from a plan
#[must_use]
pub fn artifact_prompt(deliverable: &str) -> String {
    format!(
        "Using the plan above and its source context, produce the deliverable:\n\n\
         {deliverable}\n\n\
         Follow the plan's structure and satisfy its acceptance criteria. Output only the \
         deliverable itself."
    )
}

/// Prompt for a todo list derived from a plan
#[must_use]
pub fn todo_prompt(deliverable: &str) -> String {
    format!(
        "Turn the plan above into an actionable todo list for:\n\n\
         {deliverable}\n\n\
         Write one task per line as a markdown checkbox (`- [ ] task`), ordered so that \
         every task only depends on tasks above it."
    )
}

/// Deterministic id for the nodes that backed a plan version
#[must_use]
pub fn scope_fingerprint<'a>(ids: impl IntoIterator<Item = &'a NodeId>) -> String {
    let mut sorted: Vec<&str> = ids.into_iter().map(NodeId::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join("|")
}

/// Parse markdown checkboxes out of a generated todo list
#[must_use]
pub fn parse_todo_items(text: &str) -> Vec<TodoItem> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let rest = line.strip_prefix("- ").or_else(|| line.strip_prefix("* "))?;
            let (done, task) = if let Some(t) = rest.strip_prefix("[ ]") {
                (false, t)
            } else if let Some(t) = rest.strip_prefix("[x]").or_else(|| rest.strip_prefix("[X]")) {
                (true, t)
            } else {
                return None;
            };
            let task = task.trim();
            (!task.is_empty()).then(|| (done, task.to_string()))
        })
        .enumerate()
        .map(|(i, (done, text))| TodoItem {
            id: format!("todo-{}", i + 1),
            text,
            done,
        })
        .collect()
}
