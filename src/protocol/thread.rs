use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, error};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads pulling jobs from a shared queue.
#[derive(Debug)]
pub struct ThreadPool {
    name: String,
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> Self {
        assert!(size > 0);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(name, i, Arc::clone(&receiver)));
        }

        Self {
            name: name.to_string(),
            workers,
            sender,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        match self.sender.as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    error!("{}: all workers are gone, job dropped", self.name);
                }
            }
            None => error!("{}: pool is shutting down, job dropped", self.name),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("{}: shutting down worker {}", self.name, worker.id);

            if worker.thread.join().is_err() {
                error!("{}: worker {} panicked", self.name, worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(name: &str, id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Self {
        let thread = thread::Builder::new()
            .name(format!("{name}-{id}"))
            .spawn(move || {
                loop {
                    let msg = match receiver.lock() {
                        Ok(receiver) => receiver.recv(),
                        Err(_) => break,
                    };
                    match msg {
                        Ok(job) => {
                            debug!("worker {id} running a job");
                            job();
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn worker thread");

        Self { id, thread }
    }
}
