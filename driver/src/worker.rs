//! A serial work queue on a dedicated thread.
//!
//! All driver state lives on the worker thread; other threads interact with
//! it only by posting jobs. Jobs run strictly one at a time, in posting
//! order, with deferred jobs interleaved when their deadline passes.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job<S> = Box<dyn FnOnce(&mut S, &Handle<S>) + Send>;

enum Message<S> {
    Run(Job<S>),
    RunAfter(Instant, Job<S>),
    Shutdown,
}

/// Posts jobs onto the queue. Cheap to clone, so jobs can capture one and
/// reschedule themselves.
pub(crate) struct Handle<S> {
    sender: Sender<Message<S>>,
}

impl<S> Clone for Handle<S> {
    fn clone(&self) -> Handle<S> {
        Handle {
            sender: self.sender.clone(),
        }
    }
}

impl<S> Handle<S> {
    /// Run `job` as soon as the worker is free.
    pub fn post(&self, job: impl FnOnce(&mut S, &Handle<S>) + Send + 'static) {
        let _ = self.sender.send(Message::Run(Box::new(job)));
    }

    /// Run `job` once `delay` has passed.
    pub fn post_after(&self, delay: Duration, job: impl FnOnce(&mut S, &Handle<S>) + Send + 'static) {
        let _ = self
            .sender
            .send(Message::RunAfter(Instant::now() + delay, Box::new(job)));
    }
}

/// The queue itself; dropping it shuts the worker down after the jobs
/// already posted have run.
pub(crate) struct WorkQueue<S> {
    handle: Handle<S>,
    thread: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> WorkQueue<S> {
    /// Spawn the worker thread, which takes ownership of `state`.
    pub fn spawn(name: &str, state: S) -> WorkQueue<S> {
        let (sender, receiver) = channel();
        let handle = Handle { sender };
        let job_handle = handle.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(state, receiver, job_handle))
            .expect("failed to spawn work queue thread");
        WorkQueue {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> &Handle<S> {
        &self.handle
    }

    /// Run `job` on the worker and block until it returns its result.
    pub fn call<R: Send + 'static>(
        &self,
        job: impl FnOnce(&mut S, &Handle<S>) -> R + Send + 'static,
    ) -> R {
        let (sender, receiver) = channel();
        self.handle.post(move |state, handle| {
            let _ = sender.send(job(state, handle));
        });
        receiver.recv().expect("work queue terminated")
    }

    /// Stop accepting work and join the worker thread. Jobs posted before
    /// the shutdown still run; deferred jobs that have not come due are
    /// discarded.
    pub fn shutdown(&mut self) {
        let _ = self.handle.sender.send(Message::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<S> Drop for WorkQueue<S> {
    fn drop(&mut self) {
        let _ = self.handle.sender.send(Message::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Deferred<S> {
    due: Instant,
    sequence: u64,
    job: Job<S>,
}

impl<S> PartialEq for Deferred<S> {
    fn eq(&self, other: &Deferred<S>) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl<S> Eq for Deferred<S> {}

impl<S> PartialOrd for Deferred<S> {
    fn partial_cmp(&self, other: &Deferred<S>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Deferred<S> {
    // Inverted so the earliest deadline sits on top of the max-heap, with
    // posting order as the tie-break.
    fn cmp(&self, other: &Deferred<S>) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then(other.sequence.cmp(&self.sequence))
    }
}

fn run<S>(mut state: S, receiver: Receiver<Message<S>>, handle: Handle<S>) {
    let mut deferred: BinaryHeap<Deferred<S>> = BinaryHeap::new();
    let mut sequence = 0;
    loop {
        // Run everything that has come due.
        let now = Instant::now();
        loop {
            match deferred.peek() {
                Some(entry) if entry.due <= now => {}
                _ => break,
            }
            if let Some(entry) = deferred.pop() {
                (entry.job)(&mut state, &handle);
            }
        }

        let message = match deferred.peek() {
            Some(entry) => {
                let timeout = entry.due.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(timeout) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match receiver.recv() {
                Ok(message) => message,
                Err(_) => return,
            },
        };

        match message {
            Message::Run(job) => job(&mut state, &handle),
            Message::RunAfter(due, job) => {
                deferred.push(Deferred {
                    due,
                    sequence,
                    job,
                });
                sequence += 1;
            }
            Message::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_run_in_posting_order() {
        let queue = WorkQueue::spawn("test", Vec::new());
        for value in 0..4 {
            queue.handle().post(move |state: &mut Vec<i32>, _| state.push(value));
        }
        let seen = queue.call(|state, _| state.clone());
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn call_returns_the_job_result() {
        let queue = WorkQueue::spawn("test", 21u32);
        let result = queue.call(|state, _| *state * 2);
        assert_eq!(result, 42);
    }

    #[test]
    fn deferred_jobs_fire_in_deadline_order() {
        let queue = WorkQueue::spawn("test", Vec::new());
        queue
            .handle()
            .post_after(Duration::from_millis(40), |state: &mut Vec<&str>, _| {
                state.push("late")
            });
        queue
            .handle()
            .post_after(Duration::from_millis(10), |state: &mut Vec<&str>, _| {
                state.push("early")
            });
        queue.handle().post(|state: &mut Vec<&str>, _| state.push("now"));
        thread::sleep(Duration::from_millis(80));
        let seen = queue.call(|state, _| state.clone());
        assert_eq!(seen, vec!["now", "early", "late"]);
    }

    #[test]
    fn jobs_can_reschedule_themselves() {
        let queue = WorkQueue::spawn("test", 0u32);
        queue.handle().post(|state, handle| {
            *state += 1;
            handle.post_after(Duration::from_millis(5), |state, _| *state += 10);
        });
        thread::sleep(Duration::from_millis(40));
        let value = queue.call(|state, _| *state);
        assert_eq!(value, 11);
    }

    #[test]
    fn shutdown_joins_the_worker() {
        let mut queue = WorkQueue::spawn("test", ());
        queue.handle().post(|_, _| {});
        queue.shutdown();
    }
}
