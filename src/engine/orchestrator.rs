// Aviary Engine — Task Orchestrator
// Dependency-aware task mechanics for coordinated work: plan construction
// (cycles are a construction-time error), the ready set, BLOCKED
// propagation, terminal bookkeeping with expertise updates, and result
// assembly. The coordinator decides WHAT to do; this module keeps the DAG
// honest about WHEN.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::room_types::{Task, TaskStatus};
use crate::engine::store::MemoryStore;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// ── Plans ──────────────────────────────────────────────────────────────────

/// One task in a decomposition plan. Dependencies reference earlier plan
/// entries by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub domain: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    3
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPlan {
    pub tasks: Vec<PlannedTask>,
}

impl TaskPlan {
    /// Reject cycles and bad references before anything persists. A task
    /// may only depend on earlier plan entries, which makes forward
    /// references (and self-references) construction-time errors too.
    pub fn validate(&self) -> EngineResult<()> {
        let n = self.tasks.len();
        for (i, task) in self.tasks.iter().enumerate() {
            for &dep in &task.depends_on {
                if dep >= n {
                    return Err(EngineError::user(format!(
                        "plan task {} depends on missing task {}",
                        i, dep
                    )));
                }
                if dep >= i {
                    return Err(EngineError::user(format!(
                        "plan task {} depends on task {} which does not precede it",
                        i, dep
                    )));
                }
            }
        }
        if has_cycle(n, |i| self.tasks[i].depends_on.iter().copied()) {
            return Err(EngineError::user("task plan contains a dependency cycle"));
        }
        Ok(())
    }
}

/// Kahn's algorithm over index edges.
fn has_cycle<I>(n: usize, deps_of: impl Fn(usize) -> I) -> bool
where
    I: Iterator<Item = usize>,
{
    let mut indegree = vec![0usize; n];
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        for dep in deps_of(i) {
            indegree[i] += 1;
            dependents.entry(dep).or_default().push(i);
        }
    }
    let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0usize;
    while let Some(node) = queue.pop() {
        visited += 1;
        if let Some(children) = dependents.get(&node) {
            for &child in children {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    queue.push(child);
                }
            }
        }
    }
    visited != n
}

/// Materialize a validated plan into PENDING task rows with real ids.
pub fn create_plan(store: &MemoryStore, room_id: &str, plan: &TaskPlan) -> EngineResult<Vec<Task>> {
    plan.validate()?;
    let mut created: Vec<Task> = Vec::with_capacity(plan.tasks.len());
    for planned in &plan.tasks {
        let mut task = Task::new(room_id, &planned.title, &planned.domain);
        task.description = planned.description.clone();
        task.priority = planned.priority.clamp(1, 5);
        task.assigned_to = planned.assignee.clone();
        task.depends_on = planned
            .depends_on
            .iter()
            .map(|&idx| created[idx].id.clone())
            .collect::<BTreeSet<String>>();
        store.insert_task(&task)?;
        created.push(task);
    }
    info!("[orchestrator] Created {}-task plan for {}", created.len(), room_id);
    Ok(created)
}

// ── Scheduling ─────────────────────────────────────────────────────────────

/// Tasks eligible to start: PENDING or ASSIGNED with every dependency
/// COMPLETED. Sorted by priority then age.
pub fn ready_tasks(store: &MemoryStore, room_id: &str) -> EngineResult<Vec<Task>> {
    let tasks = store.room_tasks(room_id)?;
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut ready: Vec<Task> = tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Assigned))
        .filter(|t| {
            t.depends_on.iter().all(|dep| {
                by_id
                    .get(dep.as_str())
                    .map(|d| d.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
        })
        .cloned()
        .collect();
    ready.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.created_at.cmp(&b.created_at)));
    Ok(ready)
}

/// Reconcile BLOCKED side states:
/// - PENDING/ASSIGNED tasks whose dependency FAILED or was CANCELLED → BLOCKED
/// - BLOCKED tasks whose dependencies are now all COMPLETED → PENDING
pub fn reconcile_blocked(store: &MemoryStore, room_id: &str) -> EngineResult<usize> {
    let tasks = store.room_tasks(room_id)?;
    let status_of: HashMap<&str, TaskStatus> =
        tasks.iter().map(|t| (t.id.as_str(), t.status)).collect();
    let mut changed = 0usize;

    for task in &tasks {
        let dep_failed = task.depends_on.iter().any(|dep| {
            matches!(
                status_of.get(dep.as_str()),
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) | None
            )
        });
        let deps_done = task
            .depends_on
            .iter()
            .all(|dep| status_of.get(dep.as_str()) == Some(&TaskStatus::Completed));

        match task.status {
            TaskStatus::Pending | TaskStatus::Assigned if dep_failed => {
                store.transition_task(&task.id, TaskStatus::Blocked, None, None)?;
                changed += 1;
            }
            TaskStatus::Blocked if deps_done => {
                store.transition_task(&task.id, TaskStatus::Pending, None, None)?;
                changed += 1;
            }
            _ => {}
        }
    }
    if changed > 0 {
        info!("[orchestrator] Reconciled {} blocked/unblocked tasks in {}", changed, room_id);
    }
    Ok(changed)
}

// ── Termination ────────────────────────────────────────────────────────────

/// Bookkeeping when a task reaches a terminal state: expertise counters,
/// then BLOCKED propagation for failures.
pub fn on_task_terminated(store: &MemoryStore, task: &Task, success: bool) -> EngineResult<()> {
    if let Some(bot) = &task.assigned_to {
        store.record_expertise(bot, &task.domain, success)?;
    }
    if !success {
        let blocked = reconcile_blocked(store, &task.room_id)?;
        if blocked > 0 {
            warn!(
                "[orchestrator] Task '{}' failed; {} successors blocked",
                task.title, blocked
            );
        }
    }
    Ok(())
}

/// Pick a different bot for a failed task by expertise, excluding the one
/// that already failed. None means nobody else plausibly covers the domain.
pub fn alternate_bot(
    store: &MemoryStore,
    task: &Task,
    roster: &[String],
) -> EngineResult<Option<String>> {
    let failed_bot = task.assigned_to.clone().unwrap_or_default();
    let candidates: Vec<String> =
        roster.iter().filter(|b| **b != failed_bot).cloned().collect();
    if candidates.is_empty() {
        return Ok(None);
    }
    store.best_bot_for_domain(&task.domain, &candidates)
}

/// True when every task in the room has reached a terminal state.
pub fn all_terminal(store: &MemoryStore, room_id: &str) -> EngineResult<bool> {
    let tasks = store.room_tasks(room_id)?;
    Ok(!tasks.is_empty() && tasks.iter().all(|t| t.status.is_terminal()))
}

/// Delegate disagreement: a completed task whose result explicitly flags a
/// contradiction with another bot's output. The coordinator escalates
/// instead of presenting silently merged, conflicting answers.
pub fn detect_disagreement(store: &MemoryStore, room_id: &str) -> EngineResult<Option<String>> {
    let tasks = store.room_tasks(room_id)?;
    let completed: Vec<&Task> =
        tasks.iter().filter(|t| t.status == TaskStatus::Completed).collect();
    if completed.len() < 2 {
        return Ok(None);
    }
    for task in &completed {
        let Some(result) = &task.result else { continue };
        let lower = result.to_lowercase();
        if lower.contains("contradict") || lower.contains("i disagree") || lower.contains("conflicts with") {
            return Ok(Some(format!(
                "'{}' ({}) flags a contradiction with another bot's result",
                task.title,
                task.assigned_to.as_deref().unwrap_or("?")
            )));
        }
    }
    Ok(None)
}

/// Stitch completed task results into one presentation, in plan order,
/// with failures annotated.
pub fn assemble_results(store: &MemoryStore, room_id: &str) -> EngineResult<String> {
    let tasks = store.room_tasks(room_id)?;
    let mut out = String::new();
    for task in &tasks {
        match task.status {
            TaskStatus::Completed => {
                out.push_str(&format!(
                    "• {} — {}\n",
                    task.title,
                    task.result.as_deref().unwrap_or("done")
                ));
            }
            TaskStatus::Failed => {
                out.push_str(&format!(
                    "• {} — FAILED: {}\n",
                    task.title,
                    task.result.as_deref().unwrap_or("no detail")
                ));
            }
            TaskStatus::Cancelled => {
                out.push_str(&format!("• {} — cancelled\n", task.title));
            }
            _ => {}
        }
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(entries: &[(&str, &str, &[usize])]) -> TaskPlan {
        TaskPlan {
            tasks: entries
                .iter()
                .map(|(title, domain, deps)| PlannedTask {
                    title: title.to_string(),
                    description: String::new(),
                    domain: domain.to_string(),
                    assignee: None,
                    depends_on: deps.to_vec(),
                    priority: 3,
                })
                .collect(),
        }
    }

    #[test]
    fn cycles_are_construction_errors() {
        let bad = TaskPlan {
            tasks: vec![
                PlannedTask {
                    title: "a".into(),
                    description: String::new(),
                    domain: "x".into(),
                    assignee: None,
                    depends_on: vec![1],
                    priority: 3,
                },
                PlannedTask {
                    title: "b".into(),
                    description: String::new(),
                    domain: "x".into(),
                    assignee: None,
                    depends_on: vec![0],
                    priority: 3,
                },
            ],
        };
        assert!(bad.validate().is_err());
        assert!(plan(&[("a", "x", &[]), ("b", "x", &[0])]).validate().is_ok());
    }

    #[test]
    fn ready_set_respects_dependencies() {
        let store = MemoryStore::open_in_memory().unwrap();
        let created =
            create_plan(&store, "#p", &plan(&[("research", "research", &[]), ("pricing", "strategy", &[0])]))
                .unwrap();

        let ready = ready_tasks(&store, "#p").unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].title, "research");

        // Finish T1; T2 becomes ready.
        store.assign_task(&created[0].id, "researcher").unwrap();
        store.transition_task(&created[0].id, TaskStatus::InProgress, None, None).unwrap();
        store.transition_task(&created[0].id, TaskStatus::Completed, Some("done"), Some(0.9)).unwrap();
        let ready = ready_tasks(&store, "#p").unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].title, "pricing");
    }

    #[test]
    fn failure_blocks_successors() {
        let store = MemoryStore::open_in_memory().unwrap();
        let created =
            create_plan(&store, "#p", &plan(&[("gather", "research", &[]), ("write", "writing", &[0])]))
                .unwrap();
        store.assign_task(&created[0].id, "researcher").unwrap();
        store.transition_task(&created[0].id, TaskStatus::InProgress, None, None).unwrap();
        store.transition_task(&created[0].id, TaskStatus::Failed, Some("no sources"), None).unwrap();

        let failed = store.get_task(&created[0].id).unwrap().unwrap();
        on_task_terminated(&store, &failed, false).unwrap();

        let successor = store.get_task(&created[1].id).unwrap().unwrap();
        assert_eq!(successor.status, TaskStatus::Blocked);
        assert!(!all_terminal(&store, "#p").unwrap());
    }

    #[test]
    fn alternate_bot_excludes_the_failure() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.record_expertise("researcher", "research", true).unwrap();
        store.record_expertise("auditor", "research", true).unwrap();
        let mut task = Task::new("#p", "dig", "research");
        task.assigned_to = Some("researcher".into());
        let roster = vec!["researcher".to_string(), "auditor".to_string()];
        let alt = alternate_bot(&store, &task, &roster).unwrap();
        assert_eq!(alt.as_deref(), Some("auditor"));
    }

    #[test]
    fn disagreement_is_detected_across_completed_tasks() {
        let store = MemoryStore::open_in_memory().unwrap();
        let created =
            create_plan(&store, "#p", &plan(&[("claim", "research", &[]), ("check", "review", &[])])).unwrap();
        for (task, result) in created.iter().zip([
            "Competitor pricing averages $20/mo",
            "This contradicts the research task: public filings show $35/mo",
        ]) {
            store.assign_task(&task.id, "bot").unwrap();
            store.transition_task(&task.id, TaskStatus::InProgress, None, None).unwrap();
            store.transition_task(&task.id, TaskStatus::Completed, Some(result), None).unwrap();
        }
        let reason = detect_disagreement(&store, "#p").unwrap();
        assert!(reason.is_some());
        // A lone completed task can't disagree with anyone.
        let store2 = MemoryStore::open_in_memory().unwrap();
        let only = create_plan(&store2, "#q", &plan(&[("solo", "x", &[])])).unwrap();
        store2.assign_task(&only[0].id, "bot").unwrap();
        store2.transition_task(&only[0].id, TaskStatus::InProgress, None, None).unwrap();
        store2
            .transition_task(&only[0].id, TaskStatus::Completed, Some("this contradicts nothing"), None)
            .unwrap();
        assert!(detect_disagreement(&store2, "#q").unwrap().is_none());
    }

    #[test]
    fn assembled_results_annotate_failures() {
        let store = MemoryStore::open_in_memory().unwrap();
        let created =
            create_plan(&store, "#p", &plan(&[("one", "x", &[]), ("two", "x", &[])])).unwrap();
        for (task, ok) in created.iter().zip([true, false]) {
            store.assign_task(&task.id, "coder").unwrap();
            store.transition_task(&task.id, TaskStatus::InProgress, None, None).unwrap();
            let status = if ok { TaskStatus::Completed } else { TaskStatus::Failed };
            store.transition_task(&task.id, status, Some("detail"), None).unwrap();
        }
        let text = assemble_results(&store, "#p").unwrap();
        assert!(text.contains("one — detail"));
        assert!(text.contains("two — FAILED"));
    }
}
