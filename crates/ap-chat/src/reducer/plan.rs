use serde_json::Value;

use super::Step;
use crate::events::{EntryState, EventKind, first_str, has_error, id_field, status_field};
use crate::state::{ChatState, PlanState, PlanTask};

const DESCRIPTION_KEYS: &[&str] = &["description", "title", "content", "name"];

fn parse_task(value: &Value) -> Option<PlanTask> {
    let task_id = id_field(value, "taskId").or_else(|| id_field(value, "id"))?;
    Some(PlanTask {
        task_id,
        description: first_str(value, DESCRIPTION_KEYS)
            .unwrap_or_default()
            .to_string(),
        status: status_field(value).unwrap_or_default(),
    })
}

fn task_array(event: &Value) -> Option<&Vec<Value>> {
    event
        .get("tasks")
        .and_then(Value::as_array)
        .or_else(|| event.get("plan").and_then(Value::as_array))
        .or_else(|| {
            event
                .get("plan")
                .and_then(|p| p.get("tasks"))
                .and_then(Value::as_array)
        })
}

/// Replaces the task list wholesale.
pub(super) fn update(state: &mut ChatState, step: &Step<'_>) {
    let tasks: Vec<PlanTask> = task_array(step.event)
        .map(|items| items.iter().filter_map(parse_task).collect())
        .unwrap_or_default();
    let prev = state.plan_state.take().unwrap_or_default();
    let last_task_id = tasks
        .iter()
        .find(|t| t.status == EntryState::Running)
        .map(|t| t.task_id.clone())
        .or_else(|| {
            prev.last_task_id
                .filter(|id| tasks.iter().any(|t| &t.task_id == id))
        });
    state.plan_state = Some(PlanState {
        plan_id: id_field(step.event, "planId").or(prev.plan_id),
        tasks,
        expanded: prev.expanded,
        last_task_id,
    });
}

/// Patches one task; unknown tasks are appended.
pub(super) fn patch_task(state: &mut ChatState, step: &Step<'_>, kind: &EventKind) {
    let event = step.event;
    let Some(task_id) = id_field(event, "taskId") else {
        tracing::debug!("Ignoring task event without taskId");
        return;
    };
    let status = match kind {
        EventKind::TaskStart => EntryState::Running,
        EventKind::TaskFail => EntryState::Failed,
        EventKind::TaskCancel => EntryState::Done,
        _ => status_field(event).unwrap_or(if has_error(event) {
            EntryState::Failed
        } else {
            EntryState::Done
        }),
    };
    let description = first_str(event, DESCRIPTION_KEYS);

    let plan = state.plan_state.get_or_insert_with(PlanState::default);
    match plan.tasks.iter_mut().find(|t| t.task_id == task_id) {
        Some(task) => {
            task.status = status;
            if let Some(description) = description {
                task.description = description.to_string();
            }
        }
        None => plan.tasks.push(PlanTask {
            task_id: task_id.clone(),
            description: description.unwrap_or_default().to_string(),
            status,
        }),
    }
    if *kind == EventKind::TaskStart {
        plan.last_task_id = Some(task_id);
    }
}
