use crossbeam::channel::{bounded, Sender};
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The job queue was full or the pool is shutting down.
#[derive(Debug)]
pub(crate) struct Rejected;

/// Fixed set of worker threads fed through a bounded queue.
pub(crate) struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize, queue: usize) -> io::Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue);

        let workers = (0..threads)
            .map(|id| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("minicat-worker-{id}"))
                    .spawn(move || {
                        for job in receiver {
                            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                                error!(worker = id, "job panicked");
                            }
                        }
                        debug!(worker = id, "worker stopped");
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub(crate) fn execute<F>(&self, job: F) -> Result<(), Rejected>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(Rejected)?;
        sender.try_send(Box::new(job)).map_err(|_| Rejected)
    }
}

impl Drop for WorkerPool {
    /// Lets queued jobs finish, then joins every worker.
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
