use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::queue::Queue;
use crate::sys;

/// How long the worker parks on its inbox fd when idle.
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

/// A unit of work on the runner. Returning `true` asks the runner to
/// schedule the installed select cycle after the task completes.
pub type Task = Box<dyn FnOnce(&EventRunner) -> bool + Send + 'static>;

type CycleHook = Arc<dyn Fn(&EventRunner) + Send + Sync + 'static>;

/// Single-threaded task loop owning one worker thread.
///
/// Tasks execute strictly in submission order. A task may submit further
/// tasks; they run after the current one completes. All selector I/O,
/// registration and session mutation funnels through this thread, which is
/// what lets the rest of the runtime stay lock-light.
pub struct EventRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    tasks: Queue<Task>,
    cycle: Mutex<Option<CycleHook>>,
    closed: AtomicBool,
    thread_id: Mutex<Option<ThreadId>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventRunner {
    pub fn new(name: &str) -> io::Result<EventRunner> {
        let runner = EventRunner {
            inner: Arc::new(RunnerInner {
                tasks: Queue::unbounded()?,
                cycle: Mutex::new(None),
                closed: AtomicBool::new(false),
                thread_id: Mutex::new(None),
                handle: Mutex::new(None),
            }),
        };

        let worker = runner.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker.run())?;

        *runner.inner.handle.lock().unwrap() = Some(handle);

        Ok(runner)
    }

    /// Submit a task. Refused once the runner is closed.
    pub fn add_event<F>(&self, task: F) -> io::Result<()>
    where
        F: FnOnce(&EventRunner) -> bool + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "event runner closed",
            ));
        }

        self.inner
            .tasks
            .push(Box::new(task))
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "event runner closed"))
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        *self.inner.thread_id.lock().unwrap()
    }

    pub fn on_runner_thread(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    /// Install the hook invoked when a task returns `true`. The selector
    /// registers its cycle-enqueue here.
    pub fn set_cycle<F>(&self, hook: F)
    where
        F: Fn(&EventRunner) + Send + Sync + 'static,
    {
        *self.inner.cycle.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn schedule_cycle(&self) {
        let hook = self.inner.cycle.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// The inbox queue; the selector registers its fd so a parked
    /// `epoll_wait` returns as soon as work arrives.
    pub(crate) fn tasks(&self) -> &Queue<Task> {
        &self.inner.tasks
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting tasks, drain the queue, join the worker. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.cycle.lock().unwrap().take();
        self.inner.tasks.close();
        let _ = self.inner.tasks.wake();

        let handle = self.inner.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if Some(thread::current().id()) != self.thread_id() {
                let _ = handle.join();
            }
        }
    }

    fn run(&self) {
        *self.inner.thread_id.lock().unwrap() = Some(thread::current().id());

        loop {
            match self.inner.tasks.pop() {
                Ok(task) => {
                    let again = task(self);
                    if again {
                        self.schedule_cycle();
                    }
                }
                Err(_) => {
                    if self.inner.closed.load(Ordering::Acquire) {
                        break;
                    }

                    if self.inner.tasks.settle() {
                        let _ =
                            sys::park_readable(self.inner.tasks.as_raw_fd(), PARK_TIMEOUT);
                    }
                }
            }
        }

        log::trace!("event runner worker exited");
    }
}

impl Clone for EventRunner {
    fn clone(&self) -> EventRunner {
        EventRunner {
            inner: self.inner.clone(),
        }
    }
}
