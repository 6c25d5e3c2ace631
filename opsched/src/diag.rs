// diag.rs — Compile diagnostics
//
// Per-task compile failures and scheduler notices are reported as
// diagnostics rather than errors, so one bad operator never hides the
// results of every other operator in the same subgraph.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::Serialize;

use crate::graph::Node;
use crate::id::{NodeId, ScopeId, TaskId, WorkerHandle};

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0100`, `W0101`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// Kernel compiler reported a failed build for a task.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// Kernel compiler refused to accept a submission.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// Operator still failed after its retry round.
    pub const E0102: DiagCode = DiagCode("E0102");
    /// Retry suppressed; the original failure stands.
    pub const E0103: DiagCode = DiagCode("E0103");

    /// Op does not support dynamic shapes; flagged instead of compiled.
    pub const W0101: DiagCode = DiagCode("W0101");
    /// Scope handed back to the L1 fusion pass.
    pub const W0102: DiagCode = DiagCode("W0102");
    /// Scope handed back to the buffer fusion pass.
    pub const W0103: DiagCode = DiagCode("W0103");
    /// Fused scope de-fused into single-op scopes for retry.
    pub const W0104: DiagCode = DiagCode("W0104");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Operator reference ───────────────────────────────────────────────────

/// Identity of the operator a diagnostic is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpRef {
    pub node: NodeId,
    pub name: String,
    pub op_type: String,
    pub subgraph_id: u32,
    pub scope_id: Option<ScopeId>,
    pub task_id: Option<TaskId>,
    pub worker: Option<WorkerHandle>,
}

impl OpRef {
    pub fn of(node: &Node) -> Self {
        OpRef {
            node: node.id,
            name: node.name.clone(),
            op_type: node.op_type.clone(),
            subgraph_id: node.subgraph_id,
            scope_id: node.scope_id,
            task_id: None,
            worker: None,
        }
    }

    pub fn in_task(mut self, task: TaskId, worker: WorkerHandle) -> Self {
        self.task_id = Some(task);
        self.worker = Some(worker);
        self
    }
}

impl fmt::Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) in subgraph {}",
            self.name, self.op_type, self.subgraph_id
        )?;
        if let Some(task) = self.task_id {
            write!(f, ", task {}", task)?;
        }
        Ok(())
    }
}

// ── Diagnostic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub message: String,
    pub op: Option<OpRef>,
    pub hint: Option<String>,
    pub cause_chain: Vec<String>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            message: message.into(),
            op: None,
            hint: None,
            cause_chain: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_op(mut self, op: OpRef) -> Self {
        self.op = Some(op);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_cause(mut self, message: impl Into<String>) -> Self {
        self.cause_chain.push(message.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(op) = &self.op {
            write!(f, "\n  at: {}", op)?;
        }
        for cause in &self.cause_chain {
            write!(f, "\n  cause: {}", cause)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv_op() -> OpRef {
        OpRef {
            node: NodeId(0),
            name: "conv1".into(),
            op_type: "Conv2D".into(),
            subgraph_id: 2,
            scope_id: Some(ScopeId(5)),
            task_id: Some(TaskId(9)),
            worker: Some(WorkerHandle(1)),
        }
    }

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, "build failed");
        assert_eq!(format!("{d}"), "error: build failed");
    }

    #[test]
    fn display_with_code_and_op() {
        let d = Diagnostic::new(DiagLevel::Error, "build failed")
            .with_code(codes::E0100)
            .with_op(conv_op());
        assert_eq!(
            format!("{d}"),
            "error[E0100]: build failed\n  at: conv1 (Conv2D) in subgraph 2, task #9"
        );
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::new(DiagLevel::Warning, "scope de-fused")
            .with_code(codes::W0104)
            .with_hint("inspect fusion_failed_with_scope")
            .with_cause("task #3 failed");
        assert_eq!(d.code, Some(codes::W0104));
        assert_eq!(d.hint.as_deref(), Some("inspect fusion_failed_with_scope"));
        assert_eq!(d.cause_chain.len(), 1);
    }
}
