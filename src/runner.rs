//! Execution contexts that run capture work one task at a time, in posting order.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Quit,
}

/// Posting side of an execution context.
///
/// Tasks posted through any clone run sequentially, in the order they were
/// posted. Delayed tasks join the queue when their timer fires.
#[derive(Clone)]
pub struct TaskRunner {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Message>,
    handle: Handle,
}

impl TaskRunner {
    /// Start a new sequence on a shared runtime.
    ///
    /// Tasks run on the runtime's blocking pool, so a slow capture call never
    /// occupies one of the runtime's async workers. The sequence ends when
    /// every clone of the runner has been dropped.
    pub fn sequenced(name: &str, handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let pool = handle.clone();
        let sequence: Arc<str> = Arc::from(name);
        let loop_name = Arc::clone(&sequence);

        handle.spawn(async move {
            while let Some(message) = rx.recv().await {
                let task = match message {
                    Message::Run(task) => task,
                    Message::Quit => break,
                };
                if let Err(e) = pool.spawn_blocking(task).await {
                    tracing::error!("Task on sequence {} failed: {}", loop_name, e);
                }
            }
            tracing::debug!("Sequence {} finished", loop_name);
        });

        Self {
            name: sequence,
            tx,
            handle: handle.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task. Returns false if the context has shut down.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Message::Run(Box::new(task))).is_ok()
    }

    /// Queue a task once `delay` has elapsed
    pub fn post_delayed<F>(&self, task: F, delay: Duration) -> DelayedTask
    where
        F: FnOnce() + Send + 'static,
    {
        if delay.is_zero() {
            self.post(task);
            return DelayedTask { timer: None };
        }

        let tx = self.tx.clone();
        let timer = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Message::Run(Box::new(task)));
        });

        DelayedTask {
            timer: Some(timer.abort_handle()),
        }
    }

    fn quit(&self) -> bool {
        self.tx.send(Message::Quit).is_ok()
    }
}

/// Handle to a timer armed by `TaskRunner::post_delayed`
#[derive(Debug)]
pub struct DelayedTask {
    timer: Option<AbortHandle>,
}

impl DelayedTask {
    /// Disarm the timer. A task that already reached the queue still runs.
    pub fn cancel(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

/// Dedicated OS thread owning a single-threaded runtime.
///
/// Dropping it queues a quit marker behind everything posted so far and
/// joins the thread, so work posted before the drop completes first.
pub struct CaptureThread {
    runner: TaskRunner,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureThread {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let runner = TaskRunner {
            name: Arc::from(name),
            tx,
            handle: runtime.handle().clone(),
        };

        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let task_thread = thread_name.clone();
                runtime.block_on(async move {
                    while let Some(message) = rx.recv().await {
                        match message {
                            Message::Run(task) => {
                                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                                    tracing::error!("Task on thread {} panicked", task_thread);
                                }
                            }
                            Message::Quit => break,
                        }
                    }
                });
                tracing::debug!("Capture thread {} exiting", thread_name);
            })?;

        tracing::debug!("Spawned capture thread {}", name);

        Ok(Self {
            runner,
            thread: Some(thread),
        })
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.runner.quit();

        let Some(thread) = self.thread.take() else {
            return;
        };
        // Joining from the thread itself would never return
        if thread.thread().id() == thread::current().id() {
            tracing::warn!("Capture thread {} dropped from itself, detaching", self.runner.name());
            return;
        }
        if thread.join().is_err() {
            tracing::error!("Capture thread {} panicked", self.runner.name());
        }
    }
}

/// Where a device runs its capture work: a thread it owns, or a sequence
/// on a runtime shared with other work.
pub enum ExecutionContext {
    OwnedThread(CaptureThread),
    Borrowed(TaskRunner),
}

impl ExecutionContext {
    pub fn runner(&self) -> &TaskRunner {
        match self {
            ExecutionContext::OwnedThread(thread) => thread.runner(),
            ExecutionContext::Borrowed(runner) => runner,
        }
    }

    pub fn owns_thread(&self) -> bool {
        matches!(self, ExecutionContext::OwnedThread(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_thread_runs_tasks_in_order() {
        let thread = CaptureThread::spawn("runner-order").unwrap();
        let (tx, rx) = std_mpsc::channel();

        for i in 0..10 {
            let tx = tx.clone();
            assert!(thread.runner().post(move || {
                tx.send((i, thread::current().name().map(str::to_string))).unwrap();
            }));
        }

        for i in 0..10 {
            let (n, name) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(n, i);
            assert_eq!(name.as_deref(), Some("runner-order"));
        }
    }

    #[test]
    fn test_delayed_task_waits() {
        let thread = CaptureThread::spawn("runner-delay").unwrap();
        let (tx, rx) = std_mpsc::channel();
        let posted = Instant::now();

        thread.runner().post_delayed(
            move || tx.send(Instant::now()).unwrap(),
            Duration::from_millis(50),
        );

        let ran = rx.recv_timeout(WAIT).unwrap();
        assert!(ran.duration_since(posted) >= Duration::from_millis(50));
    }

    #[test]
    fn test_cancelled_delayed_task_never_runs() {
        let thread = CaptureThread::spawn("runner-cancel").unwrap();
        let (tx, rx) = std_mpsc::channel::<()>();

        let delayed = thread
            .runner()
            .post_delayed(move || tx.send(()).unwrap(), Duration::from_millis(50));
        delayed.cancel();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_drop_runs_pending_tasks_first() {
        let (tx, rx) = std_mpsc::channel();
        {
            let thread = CaptureThread::spawn("runner-drop").unwrap();
            let runner = thread.runner().clone();
            runner.post(move || {
                thread::sleep(Duration::from_millis(50));
                tx.send("done").unwrap();
            });
        }
        // Drop joined the thread, so the task has already run
        assert_eq!(rx.try_recv(), Ok("done"));
    }

    #[test]
    fn test_post_after_shutdown_fails() {
        let thread = CaptureThread::spawn("runner-closed").unwrap();
        let runner = thread.runner().clone();
        drop(thread);
        assert!(!runner.post(|| {}));
    }

    #[test]
    fn test_panicking_task_does_not_kill_thread() {
        let thread = CaptureThread::spawn("runner-panic").unwrap();
        let (tx, rx) = std_mpsc::channel();

        thread.runner().post(|| panic!("boom"));
        thread.runner().post(move || tx.send(1).unwrap());

        assert_eq!(rx.recv_timeout(WAIT), Ok(1));
    }

    #[test]
    fn test_sequence_on_shared_runtime_is_serial() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let runner = TaskRunner::sequenced("shared-seq", runtime.handle());
        let (tx, rx) = std_mpsc::channel();
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for i in 0..5 {
            let tx = tx.clone();
            let active = Arc::clone(&active);
            runner.post(move || {
                let overlapping = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                tx.send((i, overlapping)).unwrap();
            });
        }

        for i in 0..5 {
            assert_eq!(rx.recv_timeout(WAIT), Ok((i, 0)));
        }
        assert_eq!(runner.name(), "shared-seq");
    }

    #[test]
    fn test_execution_context_modes() {
        let owned = ExecutionContext::OwnedThread(CaptureThread::spawn("ctx-owned").unwrap());
        assert!(owned.owns_thread());
        assert_eq!(owned.runner().name(), "ctx-owned");

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let borrowed =
            ExecutionContext::Borrowed(TaskRunner::sequenced("ctx-borrowed", runtime.handle()));
        assert!(!borrowed.owns_thread());
    }
}
