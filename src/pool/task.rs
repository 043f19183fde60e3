//! Task envelopes and the completion handles submitters hold.
//!
//! A submitted closure is erased into an [`Envelope`]: one queue element
//! type regardless of the closure's result type. The envelope owns the task
//! from submission until either a worker runs it or the pool cancels it;
//! both paths consume the envelope, so a task can never be run *and*
//! cancelled. The outcome travels over a bounded(1) channel to the
//! [`TaskHandle`] returned at submission.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

/// Failure outcomes a submitter can observe through its [`TaskHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Submission was refused because the pool is not accepting tasks.
    Rejected,
    /// The Discard policy dropped the task on a full queue.
    Discarded,
    /// The Overwrite policy displaced this task to make room for a newer one.
    Overwritten,
    /// A force-stop removed the task from the queue before it ran.
    Cancelled,
    /// The task panicked while running; carries the panic message.
    Panicked(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => write!(f, "task rejected: pool not accepting submissions"),
            Self::Discarded => write!(f, "task discarded: queue full"),
            Self::Overwritten => write!(f, "task overwritten by a newer submission"),
            Self::Cancelled => write!(f, "task cancelled before execution"),
            Self::Panicked(msg) => write!(f, "task panicked: {msg}"),
        }
    }
}

impl std::error::Error for TaskError {}

/// Outcome of a submitted task.
pub type TaskResult<R> = Result<R, TaskError>;

/// Handle through which a submitter observes a task's outcome.
///
/// The outcome is delivered exactly once. `wait` blocks until the task
/// completes, fails, or is cancelled; `wait_timeout` hands the handle back
/// on timeout so the caller can keep waiting.
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: chan::Receiver<TaskResult<R>>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task's outcome arrives.
    pub fn wait(self) -> TaskResult<R> {
        self.rx.recv().unwrap_or(Err(TaskError::Cancelled))
    }

    /// Blocks up to `timeout`; returns the handle back if nothing arrived.
    pub fn wait_timeout(self, timeout: Duration) -> Result<TaskResult<R>, TaskHandle<R>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(chan::RecvTimeoutError::Timeout) => Err(self),
            Err(chan::RecvTimeoutError::Disconnected) => Ok(Err(TaskError::Cancelled)),
        }
    }

    /// Non-blocking poll. `None` while the task is still in flight.
    pub fn try_wait(&self) -> Option<TaskResult<R>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(chan::TryRecvError::Empty) => None,
            Err(chan::TryRecvError::Disconnected) => Some(Err(TaskError::Cancelled)),
        }
    }
}

/// Type-erased task body.
///
/// `run` and `cancel` both consume the box: an envelope's task executes or
/// is cancelled, never both.
trait TaskCell {
    /// Executes the task, routing the outcome to the submitter if there is
    /// one. Returns `true` when the user closure completed without
    /// panicking.
    fn run(self: Box<Self>) -> bool;

    /// Resolves the submitter's handle with `err` without running the task.
    fn cancel(self: Box<Self>, err: TaskError);
}

/// Result-carrying cell produced by `submit`.
struct FutureCell<R, F> {
    f: F,
    tx: chan::Sender<TaskResult<R>>,
}

impl<R, F> TaskCell for FutureCell<R, F>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    fn run(self: Box<Self>) -> bool {
        let this = *self;
        match panic::catch_unwind(AssertUnwindSafe(this.f)) {
            Ok(value) => {
                // Receiver may have been dropped; the outcome is then moot.
                let _ = this.tx.send(Ok(value));
                true
            }
            Err(payload) => {
                let _ = this
                    .tx
                    .send(Err(TaskError::Panicked(panic_message(payload.as_ref()))));
                false
            }
        }
    }

    fn cancel(self: Box<Self>, err: TaskError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Fire-and-forget cell produced by `post`. No completion channel; the
/// worker records success/failure from `run`'s return value.
struct PostCell<F> {
    f: F,
}

impl<F> TaskCell for PostCell<F>
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) -> bool {
        panic::catch_unwind(AssertUnwindSafe(self.f)).is_ok()
    }

    fn cancel(self: Box<Self>, _err: TaskError) {
        // Nothing to resolve; the closure is dropped unrun.
    }
}

/// The queue element: an erased task plus submission bookkeeping.
pub(crate) struct Envelope {
    cell: Box<dyn TaskCell + Send>,
    submitted_at: Instant,
}

impl Envelope {
    /// Builds a result-carrying envelope and the handle observing it.
    pub(crate) fn future<R, F>(f: F) -> (Envelope, TaskHandle<R>)
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = chan::bounded(1);
        let envelope = Envelope {
            cell: Box::new(FutureCell { f, tx }),
            submitted_at: Instant::now(),
        };
        (envelope, TaskHandle { rx })
    }

    /// Builds a fire-and-forget envelope.
    pub(crate) fn post<F>(f: F) -> Envelope
    where
        F: FnOnce() + Send + 'static,
    {
        Envelope {
            cell: Box::new(PostCell { f }),
            submitted_at: Instant::now(),
        }
    }

    /// Executes the task. Returns `true` on success, `false` on panic.
    pub(crate) fn run(self) -> bool {
        self.cell.run()
    }

    /// Cancels the task, resolving any waiting handle with `err`.
    pub(crate) fn cancel(self, err: TaskError) {
        self.cell.cancel(err);
    }

    /// When the envelope was constructed.
    pub(crate) fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}

/// Best-effort extraction of a panic payload's message.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_envelope_delivers_value() {
        let (env, handle) = Envelope::future(|| 6 * 7);
        assert!(env.run());
        assert_eq!(handle.wait(), Ok(42));
    }

    #[test]
    fn panic_resolves_handle_and_reports_failure() {
        let (env, handle) = Envelope::future(|| -> u32 { panic!("boom") });
        assert!(!env.run());
        assert_eq!(handle.wait(), Err(TaskError::Panicked("boom".to_string())));
    }

    #[test]
    fn cancel_resolves_handle_without_running() {
        let (env, handle) = Envelope::future(|| 1u32);
        env.cancel(TaskError::Cancelled);
        assert_eq!(handle.wait(), Err(TaskError::Cancelled));
    }

    #[test]
    fn post_envelope_reports_success_and_panic() {
        let env = Envelope::post(|| {});
        assert!(env.run());

        let env = Envelope::post(|| panic!("post boom"));
        assert!(!env.run());
    }

    #[test]
    fn wait_timeout_returns_handle_while_pending() {
        let (env, handle) = Envelope::future(|| 5u32);
        let handle = handle
            .wait_timeout(Duration::from_millis(10))
            .expect_err("nothing resolved yet");
        assert!(env.run());
        assert_eq!(handle.wait(), Ok(5));
    }

    #[test]
    fn try_wait_polls_without_blocking() {
        let (env, handle) = Envelope::future(|| "done");
        assert!(handle.try_wait().is_none());
        assert!(env.run());
        assert_eq!(handle.try_wait(), Some(Ok("done")));
    }

    #[test]
    fn dropped_envelope_maps_to_cancelled() {
        let (env, handle) = Envelope::future(|| 0u8);
        drop(env);
        assert_eq!(handle.wait(), Err(TaskError::Cancelled));
    }

    #[test]
    fn submitted_at_is_monotonic() {
        let before = Instant::now();
        let (env, _handle) = Envelope::future(|| ());
        assert!(env.submitted_at() >= before);
    }
}
