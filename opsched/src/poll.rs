// poll.rs — Completion polling
//
// Blocks the calling thread until every outstanding task of a batch has a
// terminal outcome. The compiler is polled with the batch's worker handle;
// an empty poll sleeps for the configured interval and tries again.
//
// Preconditions: the batch's tasks were submitted on the same worker handle.
// Postconditions: `batch.outstanding() == 0` and every issued task sits in
//                 exactly one of the succeeded/failed buckets.
// Failure modes: more completions than outstanding tasks, unknown or
//                duplicate task ids, or an exceeded opt-in deadline (fatal).
// Side effects: sleeps between empty polls.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::batch::{CompileBatch, TaskOutcome, TaskStatus};
use crate::compiler::KernelCompiler;
use crate::error::SchedulerError;
use crate::options::SchedulerOptions;

pub struct CompletionPoller<'c> {
    compiler: &'c dyn KernelCompiler,
    interval: Duration,
    deadline: Option<Duration>,
}

impl<'c> CompletionPoller<'c> {
    pub fn new(compiler: &'c dyn KernelCompiler, options: &SchedulerOptions) -> Self {
        CompletionPoller {
            compiler,
            interval: options.poll_interval(),
            deadline: options.deadline(),
        }
    }

    /// Wait for every outstanding task. Returns (succeeded, failed) bucket
    /// sizes.
    ///
    /// Without a deadline this waits as long as the compiler takes; a hung
    /// compiler hangs the caller.
    pub fn wait_all(&self, batch: &mut CompileBatch) -> Result<(usize, usize), SchedulerError> {
        let start = Instant::now();
        while batch.outstanding() > 0 {
            let completions = self.compiler.poll(batch.worker());
            if completions.is_empty() {
                if let Some(deadline) = self.deadline {
                    let waited = start.elapsed();
                    if waited >= deadline {
                        return Err(SchedulerError::WaitTimedOut {
                            worker: batch.worker(),
                            outstanding: batch.outstanding(),
                            waited_ms: waited.as_millis(),
                        });
                    }
                }
                thread::sleep(self.interval);
                continue;
            }
            accept(batch, completions)?;
        }
        Ok((batch.succeeded().len(), batch.failed().len()))
    }

    /// Take whatever has already completed without waiting.
    pub fn drain(&self, batch: &mut CompileBatch) -> Result<usize, SchedulerError> {
        if batch.outstanding() == 0 {
            return Ok(0);
        }
        let completions = self.compiler.poll(batch.worker());
        let n = completions.len();
        if n > 0 {
            accept(batch, completions)?;
        }
        Ok(n)
    }
}

fn accept(batch: &mut CompileBatch, completions: Vec<TaskOutcome>) -> Result<(), SchedulerError> {
    if completions.len() > batch.outstanding() {
        return Err(SchedulerError::CompletionOverflow {
            worker: batch.worker(),
            received: completions.len(),
            outstanding: batch.outstanding(),
        });
    }
    for outcome in completions {
        debug!(
            task_id = outcome.task_id.0,
            worker = batch.worker().0,
            succeeded = outcome.status == TaskStatus::Succeeded,
            "compile task completed"
        );
        batch.bucket(outcome)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use crate::batch::{CompileMetadata, CompileTask, TaskKind};
    use crate::compiler::{BuildCode, CompileRequest};
    use crate::id::{ScopeId, TaskId, WorkerHandle};
    use crate::options::CompileStrategy;

    /// Hands out pre-recorded poll results in order, then empty polls.
    struct CannedPolls {
        polls: RefCell<VecDeque<Vec<TaskOutcome>>>,
        calls: RefCell<usize>,
    }

    impl CannedPolls {
        fn new(polls: Vec<Vec<TaskOutcome>>) -> Self {
            CannedPolls {
                polls: RefCell::new(polls.into()),
                calls: RefCell::new(0),
            }
        }
    }

    impl KernelCompiler for CannedPolls {
        fn submit(&self, _: &CompileRequest<'_>) -> BuildCode {
            BuildCode::Accepted
        }
        fn submit_slice(&self, _: &CompileRequest<'_>, _: u32) -> BuildCode {
            BuildCode::Accepted
        }
        fn submit_fuzzy(&self, _: &CompileRequest<'_>) -> BuildCode {
            BuildCode::Accepted
        }
        fn poll(&self, _: WorkerHandle) -> Vec<TaskOutcome> {
            *self.calls.borrow_mut() += 1;
            self.polls.borrow_mut().pop_front().unwrap_or_default()
        }
    }

    fn batch_with(n: u64) -> CompileBatch {
        let mut batch = CompileBatch::new(WorkerHandle(7));
        for id in 1..=n {
            batch.register(CompileTask {
                task_id: TaskId(id),
                scope_id: ScopeId(id as i64),
                kind: TaskKind::Normal,
                strategy: CompileStrategy::Default,
            });
        }
        batch
    }

    fn ok(id: u64) -> TaskOutcome {
        TaskOutcome::succeeded(TaskId(id), CompileMetadata::default())
    }

    #[test]
    fn waits_through_empty_polls_and_buckets_out_of_order() {
        let compiler = CannedPolls::new(vec![
            vec![],
            vec![ok(3)],
            vec![],
            vec![TaskOutcome::failed(TaskId(1)), ok(2)],
        ]);
        let poller = CompletionPoller::new(&compiler, &SchedulerOptions::default());
        let mut batch = batch_with(3);
        let (ok_n, failed_n) = poller.wait_all(&mut batch).unwrap();
        assert_eq!((ok_n, failed_n), (2, 1));
        assert_eq!(batch.outstanding(), 0);
        assert_eq!(*compiler.calls.borrow(), 4);
    }

    #[test]
    fn more_completions_than_outstanding_is_fatal() {
        let compiler = CannedPolls::new(vec![vec![ok(1), ok(2)]]);
        let poller = CompletionPoller::new(&compiler, &SchedulerOptions::default());
        let mut batch = batch_with(1);
        let err = poller.wait_all(&mut batch).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::CompletionOverflow {
                received: 2,
                outstanding: 1,
                ..
            }
        ));
    }

    #[test]
    fn opt_in_deadline_gives_up() {
        let compiler = CannedPolls::new(vec![]);
        let options = SchedulerOptions {
            deadline_ms: Some(5),
            ..SchedulerOptions::default()
        };
        let poller = CompletionPoller::new(&compiler, &options);
        let mut batch = batch_with(2);
        let err = poller.wait_all(&mut batch).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::WaitTimedOut { outstanding: 2, .. }
        ));
    }

    #[test]
    fn empty_batch_never_polls() {
        let compiler = CannedPolls::new(vec![]);
        let poller = CompletionPoller::new(&compiler, &SchedulerOptions::default());
        let mut batch = batch_with(0);
        assert_eq!(poller.wait_all(&mut batch).unwrap(), (0, 0));
        assert_eq!(poller.drain(&mut batch).unwrap(), 0);
        assert_eq!(*compiler.calls.borrow(), 0);
    }

    #[test]
    fn drain_polls_once_without_waiting() {
        let compiler = CannedPolls::new(vec![vec![ok(1)]]);
        let poller = CompletionPoller::new(&compiler, &SchedulerOptions::default());
        let mut batch = batch_with(2);
        assert_eq!(poller.drain(&mut batch).unwrap(), 1);
        assert_eq!(batch.outstanding(), 1);
        assert_eq!(poller.drain(&mut batch).unwrap(), 0);
    }
}
