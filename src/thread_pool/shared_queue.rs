use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::Receiver;

use crate::observer::FailureObserver;
use crate::task::TrackedTask;
use crate::thread_pool::hooks;

pub(crate) enum Job {
    Tracked(TrackedTask),
    Untracked(Box<dyn FnOnce() + Send + 'static>),
}

impl Job {
    /// Drops the job without running it. Tracked jobs settle as cancelled.
    pub(crate) fn abandon(self) {
        if let Job::Untracked(_) = self {
            log::warn!("dropping untracked job that never ran");
        }
    }
}

pub(crate) enum ThreadPoolMessage {
    RunJob(Job),
    Shutdown,
}

#[derive(Debug, Default)]
pub(crate) struct PoolState {
    pub(crate) closed: AtomicBool,
    pub(crate) abandon_queued: AtomicBool,
    pub(crate) live_workers: AtomicUsize,
    pub(crate) failed_workers: AtomicUsize,
    pub(crate) abandoned: AtomicUsize,
    pub(crate) workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolState {
    pub(crate) fn abandon(&self, job: Job) {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
        job.abandon();
    }

    /// Takes one worker handle to join. Replacements started while joining
    /// are pushed before the worker they replace exits.
    pub(crate) fn next_worker(&self) -> Option<JoinHandle<()>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
    }
}

pub(crate) struct JobReceiver {
    pub(crate) receiver: Receiver<ThreadPoolMessage>,
    pub(crate) state: Arc<PoolState>,
    pub(crate) observer: FailureObserver,
    pub(crate) thread_name_prefix: String,
    pub(crate) stack_size: Option<usize>,
}

/// Starts worker `id` on the shared queue.
pub(crate) fn spawn_worker(job_receiver: &Arc<JobReceiver>, id: u32) -> io::Result<()> {
    let mut builder =
        thread::Builder::new().name(format!("{}-{}", job_receiver.thread_name_prefix, id));
    if let Some(stack_size) = job_receiver.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let state = &job_receiver.state;
    state.live_workers.fetch_add(1, Ordering::SeqCst);

    let worker_receiver = job_receiver.clone();
    match builder.spawn(move || run_jobs(worker_receiver, id)) {
        Ok(handle) => {
            state
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(handle);
            Ok(())
        }
        Err(e) => {
            state.live_workers.fetch_sub(1, Ordering::SeqCst);
            Err(e)
        }
    }
}

// Counts the worker out when it leaves and starts a replacement if it left
// because of a failure, including by unwinding.
struct LiveWorker {
    job_receiver: Arc<JobReceiver>,
    id: u32,
    failed: bool,
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        let state = &self.job_receiver.state;
        state.live_workers.fetch_sub(1, Ordering::SeqCst);

        let panicking = thread::panicking();
        if panicking {
            log::error!(
                "worker {} unwound outside its fault guard",
                thread::current().name().unwrap_or("<unnamed>")
            );
        }

        if self.failed || panicking {
            state.failed_workers.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = spawn_worker(&self.job_receiver, self.id) {
                log::error!("replacing worker {} failed, reason: {}", self.id, e);
            }
        }
    }
}

fn run_jobs(job_receiver: Arc<JobReceiver>, id: u32) {
    let mut live = LiveWorker {
        job_receiver,
        id,
        failed: false,
    };

    loop {
        let message = live.job_receiver.receiver.recv();
        match message {
            Ok(ThreadPoolMessage::RunJob(job)) => {
                let state = &live.job_receiver.state;
                if state.abandon_queued.load(Ordering::Acquire) {
                    state.abandon(job);
                    continue;
                }

                if !run_job(job, &live.job_receiver.observer) {
                    log::debug!(
                        "worker {} stopped after raising a failure",
                        thread::current().name().unwrap_or("<unnamed>")
                    );
                    live.failed = true;
                    break;
                }
            }
            Ok(ThreadPoolMessage::Shutdown) => break,
            Err(e) => {
                log::error!("job receiver has error: {}", e);
                break;
            }
        }
    }
}

/// Runs one job between the two hooks and routes a raised failure.
/// Returns false when a failure was raised.
fn run_job(job: Job, observer: &FailureObserver) -> bool {
    match job {
        Job::Tracked(task) => {
            let record = task.record();
            match hooks::fault_guard(move || task.run()) {
                Ok(()) => true,
                Err(failure) => {
                    record.deliver(failure);
                    false
                }
            }
        }
        Job::Untracked(f) => {
            let result = hooks::fault_guard(move || {
                f();
                Ok(())
            });
            match result {
                Ok(()) => true,
                Err(failure) => {
                    observer.observe(failure);
                    false
                }
            }
        }
    }
}
