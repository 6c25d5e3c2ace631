// opsched — Operator compile scheduler
//
// Library root. Drives an external kernel compiler over the fused scopes of
// a compute graph: batching, dispatch, completion polling, outcome routing
// and the one-round de-fusion retry.

pub mod batch;
pub mod compiler;
pub mod diag;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod id;
pub mod options;
pub mod poll;
pub mod report;
pub mod retry;
pub mod route;
pub mod scheduler;
pub mod scope;
pub mod scripted;
pub mod slice;

pub use compiler::{BuildCode, CompileRequest, KernelCompiler};
pub use error::SchedulerError;
pub use options::{CompileStrategy, SchedulerOptions};
pub use report::{CompileReport, Terminal};
pub use scheduler::{OpCompileScheduler, SchedulerState};
