// scripted.rs — Deterministic in-process kernel compiler
//
// Stands in for the real kernel compiler in tests, benchmarks and the replay
// binary. A `CompilePlan` says which ops fail, which are rejected at submit
// time and which cannot be built for dynamic shapes; `Delivery` controls how
// completions trickle back through `poll`.
//
// Preconditions: none.
// Postconditions: every accepted submission is delivered exactly once, on
//                 the worker handle it was submitted with.
// Failure modes: none; a poisoned lock is recovered.
// Side effects: none outside its own state.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::batch::{CompileMetadata, TaskOutcome};
use crate::compiler::{BuildCode, CompileRequest, KernelCompiler};
use crate::graph::Node;
use crate::id::{ScopeId, TaskId, WorkerHandle};
use crate::options::{CompileStrategy, SchedulerOptions};
use crate::slice::SLICE_NAME_SUFFIX;

// ── Plan ────────────────────────────────────────────────────────────────────

/// Build failure for every submission containing `node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailRule {
    /// Base node name (slice suffixes are ignored when matching).
    pub node: String,
    /// Only fail this slice index. `None` fails every entry point.
    #[serde(default)]
    pub slice: Option<u32>,
    /// How many submissions fail before the op starts compiling.
    #[serde(default = "one")]
    pub times: u32,
}

fn one() -> u32 {
    1
}

impl FailRule {
    pub fn once(node: impl Into<String>) -> Self {
        FailRule {
            node: node.into(),
            slice: None,
            times: 1,
        }
    }

    pub fn always(node: impl Into<String>) -> Self {
        FailRule {
            node: node.into(),
            slice: None,
            times: u32::MAX,
        }
    }

    pub fn on_slice(mut self, index: u32) -> Self {
        self.slice = Some(index);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delivery {
    /// Completions handed out per poll. 0 delivers everything at once.
    pub batch_size: usize,
    /// Deliver newest submissions first.
    pub reverse: bool,
    /// Empty polls answered between two non-empty ones.
    pub empty_polls: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilePlan {
    pub failures: Vec<FailRule>,
    /// Base node names refused at submit time.
    pub rejections: Vec<String>,
    /// Op types that cannot be built for dynamic shapes.
    pub dynamic_shape_unsupported: Vec<String>,
    pub delivery: Delivery,
}

// ── Submission log ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Entry {
    Normal,
    Slice(u32),
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionRecord {
    pub task_id: TaskId,
    pub scope_id: ScopeId,
    pub worker: WorkerHandle,
    pub strategy: CompileStrategy,
    pub entry: Entry,
    /// Names as the compiler saw them, slice suffix included.
    pub node_names: Vec<String>,
    /// Slice shape of each node's first input at submit time.
    pub slice_shapes: Vec<Option<Vec<i64>>>,
    pub code: BuildCodeRecord,
}

/// Serializable mirror of `BuildCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildCodeRecord {
    Accepted,
    Rejected,
    DynamicShapeUnsupported,
}

impl From<BuildCode> for BuildCodeRecord {
    fn from(code: BuildCode) -> Self {
        match code {
            BuildCode::Accepted => BuildCodeRecord::Accepted,
            BuildCode::Rejected => BuildCodeRecord::Rejected,
            BuildCode::DynamicShapeUnsupported => BuildCodeRecord::DynamicShapeUnsupported,
        }
    }
}

// ── Compiler ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct WorkerQueue {
    pending: VecDeque<TaskOutcome>,
    empty_polls_left: u32,
}

#[derive(Default)]
struct ScriptState {
    /// Failures still to hand out, indexed like `plan.failures`.
    failures_left: Vec<u32>,
    queues: BTreeMap<WorkerHandle, WorkerQueue>,
    submissions: Vec<SubmissionRecord>,
}

pub struct ScriptedCompiler {
    plan: CompilePlan,
    state: Mutex<ScriptState>,
}

impl ScriptedCompiler {
    pub fn new(plan: CompilePlan) -> Self {
        let state = ScriptState {
            failures_left: plan.failures.iter().map(|r| r.times).collect(),
            ..ScriptState::default()
        };
        ScriptedCompiler {
            plan,
            state: Mutex::new(state),
        }
    }

    pub fn plan(&self) -> &CompilePlan {
        &self.plan
    }

    /// Every submission seen so far, in call order.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.lock().submissions.clone()
    }

    /// Completions accepted but not yet polled, across all workers.
    pub fn undelivered(&self) -> usize {
        self.lock().queues.values().map(|q| q.pending.len()).sum()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, request: &CompileRequest<'_>, entry: Entry) -> BuildCode {
        let names: Vec<&str> = request.nodes.iter().map(|n| base_name(&n.name)).collect();
        let code = if names.iter().any(|n| self.plan.rejections.iter().any(|r| r == n)) {
            BuildCode::Rejected
        } else if request
            .nodes
            .iter()
            .any(|n| self.plan.dynamic_shape_unsupported.contains(&n.op_type))
        {
            BuildCode::DynamicShapeUnsupported
        } else {
            BuildCode::Accepted
        };

        let mut state = self.lock();
        if code == BuildCode::Accepted {
            let failed = self.consume_failure(&mut state, &names, entry);
            let outcome = if failed {
                TaskOutcome::failed(request.task_id)
            } else {
                TaskOutcome::succeeded(request.task_id, metadata(request, entry))
            };
            state
                .queues
                .entry(request.worker)
                .or_default()
                .pending
                .push_back(outcome);
        }
        state.submissions.push(SubmissionRecord {
            task_id: request.task_id,
            scope_id: request.scope_id,
            worker: request.worker,
            strategy: request.strategy,
            entry,
            node_names: request.nodes.iter().map(|n| n.name.clone()).collect(),
            slice_shapes: request.nodes.iter().map(first_slice_shape).collect(),
            code: code.into(),
        });
        code
    }

    fn consume_failure(&self, state: &mut ScriptState, names: &[&str], entry: Entry) -> bool {
        let mut failed = false;
        for (i, rule) in self.plan.failures.iter().enumerate() {
            let slice_matches = match (rule.slice, entry) {
                (None, _) => true,
                (Some(want), Entry::Slice(got)) => want == got,
                (Some(_), _) => false,
            };
            if !slice_matches || !names.contains(&rule.node.as_str()) {
                continue;
            }
            if let Some(left) = state.failures_left.get_mut(i) {
                if *left > 0 {
                    *left = left.saturating_sub(1);
                    failed = true;
                }
            }
        }
        failed
    }
}

impl KernelCompiler for ScriptedCompiler {
    fn submit(&self, request: &CompileRequest<'_>) -> BuildCode {
        self.handle(request, Entry::Normal)
    }

    fn submit_slice(&self, request: &CompileRequest<'_>, slice_index: u32) -> BuildCode {
        self.handle(request, Entry::Slice(slice_index))
    }

    fn submit_fuzzy(&self, request: &CompileRequest<'_>) -> BuildCode {
        self.handle(request, Entry::Fuzzy)
    }

    fn poll(&self, worker: WorkerHandle) -> Vec<TaskOutcome> {
        let delivery = &self.plan.delivery;
        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(&worker) else {
            return Vec::new();
        };
        if queue.pending.is_empty() {
            return Vec::new();
        }
        if queue.empty_polls_left > 0 {
            queue.empty_polls_left -= 1;
            return Vec::new();
        }
        queue.empty_polls_left = delivery.empty_polls;

        let n = match delivery.batch_size {
            0 => queue.pending.len(),
            n => n.min(queue.pending.len()),
        };
        (0..n)
            .filter_map(|_| {
                if delivery.reverse {
                    queue.pending.pop_back()
                } else {
                    queue.pending.pop_front()
                }
            })
            .collect()
    }
}

/// Node name with any slice suffix removed.
pub fn base_name(name: &str) -> &str {
    match name.find(SLICE_NAME_SUFFIX) {
        Some(at) => &name[..at],
        None => name,
    }
}

fn first_slice_shape(node: &&Node) -> Option<Vec<i64>> {
    node.inputs.first().and_then(|t| t.slice_shape.clone())
}

fn metadata(request: &CompileRequest<'_>, entry: Entry) -> CompileMetadata {
    let mut hasher = Sha256::new();
    for node in &request.nodes {
        hasher.update(node.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(node.op_type.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(request.strategy.as_str().as_bytes());
    let digest = hasher.finalize();
    let key: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();

    let entry_name = match entry {
        Entry::Normal => "normal".to_string(),
        Entry::Slice(i) => format!("slice_{i}"),
        Entry::Fuzzy => "fuzzy".to_string(),
    };
    let info = serde_json::json!({
        "entry": entry_name,
        "strategy": request.strategy.as_str(),
        "ops": request.nodes.iter().map(|n| n.op_type.as_str()).collect::<Vec<_>>(),
    });
    CompileMetadata {
        kernel_path: Some(format!("kernel_meta/{key}.o")),
        compile_info_json: Some(info.to_string()),
        compile_info_key: Some(key),
        extra: BTreeMap::new(),
    }
}

// ── Replay scenario ─────────────────────────────────────────────────────────

/// Everything the replay binary needs: a graph, how to compile it, and how
/// the scripted compiler should behave.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub options: SchedulerOptions,
    #[serde(default)]
    pub strategy: CompileStrategy,
    #[serde(default)]
    pub worker: Option<u64>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub plan: CompilePlan,
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    fn request<'a>(task: u64, worker: u64, nodes: &[&'a Node]) -> CompileRequest<'a> {
        CompileRequest {
            task_id: TaskId(task),
            scope_id: ScopeId(1),
            worker: WorkerHandle(worker),
            strategy: CompileStrategy::Default,
            nodes: nodes.to_vec(),
        }
    }

    #[test]
    fn fail_rule_is_consumed() {
        let node = Node::op("conv", "Conv2D");
        let compiler = ScriptedCompiler::new(CompilePlan {
            failures: vec![FailRule::once("conv")],
            ..CompilePlan::default()
        });
        compiler.submit(&request(1, 1, &[&node]));
        compiler.submit(&request(2, 1, &[&node]));
        let got = compiler.poll(WorkerHandle(1));
        assert_eq!(got.len(), 2);
        assert!(got[0].status == crate::batch::TaskStatus::Failed);
        assert!(got[1].status == crate::batch::TaskStatus::Succeeded);
    }

    #[test]
    fn completions_stay_on_their_worker() {
        let node = Node::op("add", "Add");
        let compiler = ScriptedCompiler::new(CompilePlan::default());
        compiler.submit(&request(1, 1, &[&node]));
        compiler.submit(&request(2, 2, &[&node]));
        let w1 = compiler.poll(WorkerHandle(1));
        assert_eq!(w1.iter().map(|o| o.task_id).collect::<Vec<_>>(), vec![TaskId(1)]);
        assert_eq!(compiler.undelivered(), 1);
        assert!(compiler.poll(WorkerHandle(1)).is_empty());
    }

    #[test]
    fn delivery_shapes_the_poll_stream() {
        let node = Node::op("add", "Add");
        let compiler = ScriptedCompiler::new(CompilePlan {
            delivery: Delivery {
                batch_size: 1,
                reverse: true,
                empty_polls: 1,
            },
            ..CompilePlan::default()
        });
        compiler.submit(&request(1, 1, &[&node]));
        compiler.submit(&request(2, 1, &[&node]));
        // First poll delivers; the counter only arms after a delivery.
        assert_eq!(compiler.poll(WorkerHandle(1))[0].task_id, TaskId(2));
        assert!(compiler.poll(WorkerHandle(1)).is_empty());
        assert_eq!(compiler.poll(WorkerHandle(1))[0].task_id, TaskId(1));
    }

    #[test]
    fn slice_suffix_is_ignored_when_matching() {
        assert_eq!(base_name(&format!("mm{SLICE_NAME_SUFFIX}3")), "mm");
        assert_eq!(base_name("mm"), "mm");
    }

    #[test]
    fn metadata_is_stable_for_the_same_request() {
        let node = Node::op("add", "Add");
        let a = metadata(&request(1, 1, &[&node]), Entry::Normal);
        let b = metadata(&request(9, 3, &[&node]), Entry::Normal);
        assert_eq!(a.kernel_path, b.kernel_path);
        assert_eq!(a.compile_info_key.as_deref().map(str::len), Some(16));
    }

    #[test]
    fn scenario_parses_with_defaults() {
        let scenario = Scenario::from_json(
            r#"{"nodes": [{"name": "a", "op_type": "Add", "scope_id": 3}],
                "plan": {"failures": [{"node": "a"}]}}"#,
        )
        .unwrap();
        assert_eq!(scenario.nodes.len(), 1);
        assert_eq!(scenario.plan.failures[0].times, 1);
        assert_eq!(scenario.strategy, CompileStrategy::Default);
    }
}
