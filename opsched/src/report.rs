// report.rs — Aggregate result of one scheduling call
//
// Collects everything the surrounding pipeline needs after a call: the
// terminal verdict, every op that ultimately failed, the ops handed back to
// the fusion passes, the demotions performed and the diagnostics raised.
//
// Preconditions: built by `OpCompileScheduler`; `finish` is called once.
// Postconditions: op lists are sorted by node id, so `Display` and the JSON
//                 form are stable for a given graph and delivery order.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::diag::{DiagLevel, Diagnostic, OpRef};
use crate::id::{ScopeId, WorkerHandle};
use crate::options::CompileStrategy;
use crate::retry::{Demotion, SuppressReason};
use crate::scheduler::SchedulerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Success,
    Failure,
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Success => write!(f, "success"),
            Terminal::Failure => write!(f, "failure"),
        }
    }
}

/// An op that did not compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedOp {
    pub op: OpRef,
    /// Scope the op was in when it last failed.
    pub scope: ScopeId,
    /// The op already went through its retry round.
    pub retried: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompileReport {
    pub worker: WorkerHandle,
    pub strategy: CompileStrategy,
    pub outcome: Terminal,
    pub rounds: u32,
    pub tasks_issued: usize,
    /// Tasks left with the compiler when the wait was skipped.
    pub unfinished: usize,
    pub compiled: Vec<OpRef>,
    pub failed: Vec<FailedOp>,
    pub l1_rollback: Vec<OpRef>,
    pub ub_rollback: Vec<OpRef>,
    pub demotions: Vec<Demotion>,
    pub suppressed: Option<SuppressReason>,
    pub transitions: Vec<SchedulerState>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileReport {
    pub fn new(worker: WorkerHandle, strategy: CompileStrategy) -> Self {
        CompileReport {
            worker,
            strategy,
            outcome: Terminal::Success,
            rounds: 0,
            tasks_issued: 0,
            unfinished: 0,
            compiled: Vec::new(),
            failed: Vec::new(),
            l1_rollback: Vec::new(),
            ub_rollback: Vec::new(),
            demotions: Vec::new(),
            suppressed: None,
            transitions: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Seal the report: fix the outcome and sort the op lists.
    pub fn finish(mut self) -> Self {
        self.outcome = if self.failed.is_empty() {
            Terminal::Success
        } else {
            Terminal::Failure
        };
        self.compiled.sort_by_key(|op| op.node);
        self.failed.sort_by_key(|f| f.op.node);
        self.l1_rollback.sort_by_key(|op| op.node);
        self.ub_rollback.sort_by_key(|op| op.node);
        self.transitions.push(SchedulerState::Terminal(self.outcome));
        self
    }

    /// No op ultimately failed. Rollback candidates do not count as failures.
    pub fn is_success(&self) -> bool {
        self.outcome == Terminal::Success
    }

    /// Some ops were handed back to a fusion pass instead of compiled.
    pub fn has_rollback(&self) -> bool {
        !self.l1_rollback.is_empty() || !self.ub_rollback.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.level == DiagLevel::Error)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// SHA-256 of the compact JSON form, as 64 hex characters.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Ok(bytes_to_hex(&hash))
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn names(ops: &[OpRef]) -> String {
    if ops.is_empty() {
        return "-".to_string();
    }
    ops.iter()
        .map(|op| op.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for CompileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} on {} ({}): {} round(s), {} task(s) issued",
            self.outcome,
            self.worker,
            self.strategy.as_str(),
            self.rounds,
            self.tasks_issued
        )?;
        if self.unfinished > 0 {
            writeln!(f, "unfinished: {}", self.unfinished)?;
        }
        let path: Vec<String> = self.transitions.iter().map(|s| s.to_string()).collect();
        writeln!(f, "path: {}", path.join(" > "))?;
        writeln!(f, "compiled: {}", names(&self.compiled))?;
        if self.failed.is_empty() {
            writeln!(f, "failed: -")?;
        } else {
            let failed: Vec<String> = self
                .failed
                .iter()
                .map(|op| {
                    let retried = if op.retried { ", retried" } else { "" };
                    format!("{} (scope {}{})", op.op.name, op.scope, retried)
                })
                .collect();
            writeln!(f, "failed: {}", failed.join(", "))?;
        }
        writeln!(f, "l1 rollback: {}", names(&self.l1_rollback))?;
        writeln!(f, "ub rollback: {}", names(&self.ub_rollback))?;
        for demotion in &self.demotions {
            let to: Vec<String> = demotion.to.iter().map(|s| s.to_string()).collect();
            writeln!(f, "demoted: {} -> {}", demotion.from, to.join(", "))?;
        }
        if let Some(reason) = self.suppressed {
            writeln!(f, "retry suppressed: {}", reason)?;
        }
        for diag in &self.diagnostics {
            writeln!(f, "{}", diag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::codes;
    use crate::id::NodeId;

    fn op(node: u32, name: &str) -> OpRef {
        OpRef {
            node: NodeId(node),
            name: name.into(),
            op_type: "Add".into(),
            subgraph_id: 0,
            scope_id: None,
            task_id: None,
            worker: None,
        }
    }

    #[test]
    fn finish_sorts_and_decides_outcome() {
        let mut report = CompileReport::new(WorkerHandle(1), CompileStrategy::Default);
        report.compiled = vec![op(2, "b"), op(0, "a")];
        report.failed = vec![FailedOp {
            op: op(1, "c"),
            scope: ScopeId(-2),
            retried: true,
        }];
        let report = report.finish();
        assert_eq!(report.outcome, Terminal::Failure);
        assert_eq!(names(&report.compiled), "a, b");
        assert_eq!(
            report.transitions.last(),
            Some(&SchedulerState::Terminal(Terminal::Failure))
        );
    }

    #[test]
    fn rollback_alone_is_not_a_failure() {
        let mut report = CompileReport::new(WorkerHandle(1), CompileStrategy::Default);
        report.ub_rollback = vec![op(0, "a")];
        let report = report.finish();
        assert!(report.is_success());
        assert!(report.has_rollback());
    }

    #[test]
    fn display_lists_every_section() {
        let mut report = CompileReport::new(WorkerHandle(4), CompileStrategy::NoTune);
        report.rounds = 1;
        report.tasks_issued = 2;
        report.compiled = vec![op(0, "a")];
        report.l1_rollback = vec![op(1, "b")];
        report.transitions = vec![SchedulerState::Batched, SchedulerState::AwaitingCompletion];
        report.diagnostics.push(
            Diagnostic::new(
                DiagLevel::Warning,
                "scope 3 failed to compile; handed back to L1 fusion",
            )
            .with_code(codes::W0102),
        );
        let text = report.finish().to_string();
        assert_eq!(
            text,
            "success on w4 (no_tune): 1 round(s), 2 task(s) issued\n\
             path: batched > awaiting_completion > terminal(success)\n\
             compiled: a\n\
             failed: -\n\
             l1 rollback: b\n\
             ub rollback: -\n\
             warning[W0102]: scope 3 failed to compile; handed back to L1 fusion\n"
        );
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let report = CompileReport::new(WorkerHandle(1), CompileStrategy::Default).finish();
        let a = report.fingerprint().unwrap();
        let b = report.clone().fingerprint().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
