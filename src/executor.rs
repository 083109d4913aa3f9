//! A fixed-size pool of worker threads used for the bounded-concurrency mapping stage.
//! Draining is cooperative: `join` stops new submissions, lets in-flight work finish and
//! waits for every worker to exit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use thiserror::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The error returned when work is submitted to a pool which has already been drained.
#[derive(Debug, Error)]
#[error("worker pool has been shut down")]
pub struct PoolShutdown;

pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Self {
        assert!(size > 0, "a worker pool needs at least one worker");
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|index| {
                let receiver = receiver.clone();
                let worker_name = format!("{}-{}", name, index);
                thread::Builder::new()
                    .name(worker_name.clone())
                    .spawn(move || worker_loop(&worker_name, &receiver))
                    .expect("could not spawn pool worker")
            })
            .collect();

        WorkerPool { name: name.to_string(), sender: Some(sender), workers }
    }

    /// Queues one task. Tasks run in submission order per worker, concurrently across workers.
    pub fn submit(&self, job: Job) -> Result<(), PoolShutdown> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|_| PoolShutdown),
            None => Err(PoolShutdown),
        }
    }

    /// Stops accepting new work and waits for every in-flight task and worker to finish.
    /// Idempotent.
    pub fn join(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("a worker of pool '{}' terminated abnormally", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_loop(name: &str, receiver: &Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let receiver = receiver.lock().expect("worker queue lock poisoned");
            receiver.recv()
        };
        match job {
            Ok(job) => {
                // A panicking task must not take the worker down with it; the fault is
                // contained here and observed by whoever waits on the task's output channel.
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("task on worker '{}' panicked", name);
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_submitted_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("test", 3);
        for _ in 0..20 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.join();
        assert_eq!(20, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn submit_after_join_fails() {
        let mut pool = WorkerPool::new("test", 1);
        pool.join();
        assert!(pool.submit(Box::new(|| {})).is_err());
    }

    #[test]
    fn a_panicking_task_does_not_kill_the_pool() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("test", 1);
        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        let counter_in_task = counter.clone();
        pool.submit(Box::new(move || {
            counter_in_task.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        pool.join();
        assert_eq!(1, counter.load(Ordering::SeqCst));
    }
}
