use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::config::PoolConfig;
use crate::error::Result;
use crate::failure::PanicPayload;
use crate::observer::FailureObserver;
use crate::task::{self, CancelToken, TaskHandle};

pub(crate) mod hooks;
mod shared_queue;

use shared_queue::{Job, JobReceiver, PoolState, ThreadPoolMessage};

/// A fixed-size pool that surfaces every failure of its workers.
///
/// Items are taken from one unbounded FIFO queue by `threads` worker threads.
/// A failing item, a cancelled item, or a panic escaping a worker's frame
/// becomes a [`PropagatedFailure`](crate::PropagatedFailure) delivered either
/// through the item's [`TaskHandle`] or to the pool's [`FailureObserver`],
/// never both. The worker that raised it exits and a new worker with the
/// same name takes its place.
pub struct FailFastThreadPool {
    sender: Sender<ThreadPoolMessage>,
    receiver: Receiver<ThreadPoolMessage>,
    state: Arc<PoolState>,
    observer: FailureObserver,
    threads: u32,
    // read-held while enqueueing, write-held while closing
    gate: RwLock<()>,
    shutdown_lock: Mutex<()>,
}

impl FailFastThreadPool {
    pub fn new(threads: u32) -> Result<Self> {
        let config = PoolConfig::builder().threads(threads).build()?;
        Self::with_config(config)
    }

    pub fn with_config(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = unbounded::<ThreadPoolMessage>();
        let state = Arc::new(PoolState::default());
        let job_receiver = Arc::new(JobReceiver {
            receiver: receiver.clone(),
            state: state.clone(),
            observer: config.observer.clone(),
            thread_name_prefix: config.thread_name_prefix,
            stack_size: config.stack_size,
        });

        for id in 0..config.threads {
            if let Err(e) = shared_queue::spawn_worker(&job_receiver, id) {
                state.closed.store(true, Ordering::SeqCst);
                for _ in 0..id {
                    let _ = sender.send(ThreadPoolMessage::Shutdown);
                }
                log::error!("spawning worker {} failed, reason: {}", id, e);
                return Err(e.into());
            }
        }

        log::debug!("started {} workers", config.threads);

        Ok(FailFastThreadPool {
            sender,
            receiver,
            state,
            observer: config.observer,
            threads: config.threads,
            gate: RwLock::new(()),
            shutdown_lock: Mutex::new(()),
        })
    }

    /// Queues a tracked item and returns its handle.
    pub fn submit<T, F>(&self, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_cancellable(move |_| job())
    }

    /// Queues a tracked item that can observe its own cancellation.
    pub fn submit_cancellable<T, F>(&self, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> anyhow::Result<T> + Send + 'static,
    {
        let (task, handle) = task::tracked(job, self.observer.clone());
        self.enqueue(Job::Tracked(task));
        handle
    }

    /// Queues an untracked item. A panic in it surfaces as a thread fault on
    /// the observer.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Job::Untracked(Box::new(job)));
    }

    fn enqueue(&self, job: Job) {
        let rejected = {
            let _open = self.gate.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.state.closed.load(Ordering::Acquire) {
                log::warn!("pool is shut down, abandoning submitted job");
                Some(job)
            } else {
                // the pool holds a receiver, so the channel cannot be disconnected
                match self.sender.send(ThreadPoolMessage::RunJob(job)) {
                    Ok(()) => None,
                    Err(e) => match e.0 {
                        ThreadPoolMessage::RunJob(job) => Some(job),
                        ThreadPoolMessage::Shutdown => None,
                    },
                }
            }
        };

        // outside the gate: abandoning may call the observer, which may submit
        if let Some(job) = rejected {
            self.state.abandon(job);
        }
    }

    /// Stops accepting work and joins the workers.
    ///
    /// With `drain` queued items still run first; without it they are
    /// abandoned and tracked ones settle as cancelled. Concurrent calls wait
    /// for each other, so every caller returns after the workers are joined.
    /// Returns how many items the pool has abandoned in total.
    pub fn shutdown(&self, drain: bool) -> usize {
        let _serial = self
            .shutdown_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let first = {
            let _closing = self.gate.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            !self.state.closed.swap(true, Ordering::AcqRel)
        };

        if !drain {
            self.state.abandon_queued.store(true, Ordering::Release);
            self.abandon_queued();
        }

        // one message per worker slot; a replacement takes over its slot's message
        if first {
            for _ in 0..self.threads {
                let _ = self.sender.send(ThreadPoolMessage::Shutdown);
            }
        }

        while let Some(worker) = self.state.next_worker() {
            let name = worker.thread().name().unwrap_or("<unnamed>").to_string();
            if let Err(payload) = worker.join() {
                log::error!(
                    "worker {} panicked, reason: {}",
                    name,
                    PanicPayload::new(payload).message()
                );
            }
        }

        // whatever is left can no longer be serviced
        self.abandon_queued();

        self.state.abandoned.load(Ordering::SeqCst)
    }

    fn abandon_queued(&self) {
        for message in self.receiver.try_iter() {
            if let ThreadPoolMessage::RunJob(job) = message {
                self.state.abandon(job);
            }
        }
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }

    /// Workers currently taking items. Dips while a failed worker is
    /// being replaced and reaches zero after shutdown.
    pub fn live_workers(&self) -> usize {
        self.state.live_workers.load(Ordering::SeqCst)
    }

    /// How many workers exited because they raised a failure. Each one was
    /// replaced.
    pub fn failed_workers(&self) -> usize {
        self.state.failed_workers.load(Ordering::SeqCst)
    }

    /// Messages waiting in the queue.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl Drop for FailFastThreadPool {
    fn drop(&mut self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            for _ in 0..self.threads {
                let _ = self.sender.send(ThreadPoolMessage::Shutdown);
            }
        }
    }
}
