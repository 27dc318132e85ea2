//! A task queue bound to a single thread.
//!
//! Background work (OSG and WGS fetches) must not touch the reply from
//! whatever thread it happens to finish on. It posts a closure with
//! [`LoopBinder::postpone_invoke`] instead, and the owning thread runs it.
//!
//! Two ways to own a binder:
//!
//! - [`LoopBinder::spawn`] starts a dedicated thread that sleeps until tasks
//!   arrive and runs them until [`LoopBinder::shutdown`].
//! - [`LoopBinder::for_current_thread`] binds the calling thread, which then
//!   drains the queue with [`LoopBinder::run_pending`].

use crate::common::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{Arc, OnceLock},
    thread::{self, JoinHandle, ThreadId},
};

pub type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Queue {
    tasks: Vec<Task>,
    shutdown: bool,
}

pub struct LoopBinder {
    owner: OnceLock<ThreadId>,
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl LoopBinder {
    fn unbound() -> Self {
        Self {
            owner: OnceLock::new(),
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
        }
    }

    /// Binds a new queue to the calling thread.
    pub fn for_current_thread() -> Arc<Self> {
        let binder = Self::unbound();
        let _ = binder.owner.set(thread::current().id());
        Arc::new(binder)
    }

    /// Starts a named thread that owns the queue and runs posted tasks.
    pub fn spawn(name: &str) -> std::io::Result<(Arc<Self>, JoinHandle<()>)> {
        let binder = Arc::new(Self::unbound());
        let runner = Arc::clone(&binder);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let _ = runner.owner.set(thread::current().id());
                runner.run_until_shutdown();
            })?;
        Ok((binder, handle))
    }

    fn run_until_shutdown(&self) {
        loop {
            let tasks = {
                let mut queue = self.queue.lock();
                while queue.tasks.is_empty() && !queue.shutdown {
                    self.wakeup.wait(&mut queue);
                }
                if queue.tasks.is_empty() {
                    break;
                }
                core::mem::take(&mut queue.tasks)
            };
            for task in tasks {
                task();
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("Loop binder thread stopped");
    }

    /// Queues `task` for the owning thread. Any thread may call this.
    pub fn postpone_invoke(&self, task: Task) -> Result<()> {
        {
            let mut queue = self.queue.lock();
            if queue.shutdown {
                return Err(Error::ServiceShutdown);
            }
            queue.tasks.push(task);
        }
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn is_owning_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    /// Runs every queued task on the calling thread, which must be the owner.
    /// Returns how many tasks ran.
    pub fn run_pending(&self) -> Result<usize> {
        if !self.is_owning_thread() {
            return Err(Error::NotOwningThread);
        }
        let tasks = core::mem::take(&mut self.queue.lock().tasks);
        let ran = tasks.len();
        for task in tasks {
            task();
        }
        Ok(ran)
    }

    /// Refuses new tasks. A spawned owner runs what is already queued and
    /// then exits.
    pub fn shutdown(&self) {
        self.queue.lock().shutdown = true;
        self.wakeup.notify_all();
    }
}
