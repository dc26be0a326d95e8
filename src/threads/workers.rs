use log::{debug, error};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads fed by a bounded queue. Submitting
/// blocks while the queue is full.
pub struct WorkerPool {
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, queue_size: usize) -> std::io::Result<Self> {
        let (sender, receiver) = sync_channel::<Job>(queue_size);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size.max(1));
        for id in 0..size.max(1) {
            let receiver = receiver.clone();
            workers.push(thread::Builder::new().name(format!("worker-{}", id)).spawn(move || work(id, receiver))?);
        }

        Ok(WorkerPool { sender: Some(sender), workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job. Fails only once every worker is gone.
    pub fn execute<F>(&self, job: F) -> Result<(), String>
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.sender {
            Some(sender) => sender.send(Box::new(job)).map_err(|_| "worker pool is closed".to_string()),
            None => Err("worker pool is closed".to_string()),
        }
    }

    /// Closes the queue and waits until the queued jobs are done.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                error!("{} panicked", name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(id: usize, receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = receiver.lock().unwrap_or_else(PoisonError::into_inner).recv();
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
    debug!("Worker {} stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_every_job_before_join() {
        let pool = WorkerPool::new(4, 2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let done = done.clone();
            pool.execute(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.join();

        assert_eq!(done.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn at_least_one_worker() {
        assert_eq!(WorkerPool::new(0, 1).unwrap().size(), 1);
    }
}
