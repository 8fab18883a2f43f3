// src/runtime/task_queue.rs
//! Bounded MPMC task queue
//!
//! Producers never block: a full queue rejects the task immediately and
//! hands it back. Consumers either poll with [`TaskQueue::try_pop`] or park
//! on [`TaskQueue::pop`] until a producer signals.

use crate::runtime::task::Task;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Lock-free task queue
pub struct TaskQueue {
    /// Underlying bounded queue
    queue: ArrayQueue<Task>,

    /// Wakes a parked consumer after a push
    notify: Notify,

    push_count: AtomicU64,
    pop_count: AtomicU64,

    /// Rejected pushes (queue full)
    reject_count: AtomicU64,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` tasks (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            reject_count: AtomicU64::new(0),
        }
    }

    /// Push a task (non-blocking); returns it back when the queue is full
    pub fn push(&self, task: Task) -> Result<(), Task> {
        match self.queue.push(task) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
                Ok(())
            }
            Err(task) => {
                self.reject_count.fetch_add(1, Ordering::Relaxed);
                Err(task)
            }
        }
    }

    /// Try to pop a task (non-blocking)
    pub fn try_pop(&self) -> Option<Task> {
        let task = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }

    /// Wait until a task is available
    ///
    /// Cancel-safe: dropping the future never loses a task, and a wakeup it
    /// had already received is handed to the next waiter.
    pub async fn pop(&self) -> Task {
        loop {
            if let Some(task) = self.try_pop() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    /// Remove every queued task
    pub fn drain(&self) -> Vec<Task> {
        let mut drained = Vec::with_capacity(self.queue.len());
        while let Some(task) = self.try_pop() {
            drained.push(task);
        }
        drained
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            reject_count: self.reject_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub push_count: u64,
    pub pop_count: u64,
    pub reject_count: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }

    /// Rejected pushes as a percentage of all push attempts
    pub fn reject_rate(&self) -> f64 {
        let attempts = self.push_count + self.reject_count;
        if attempts == 0 {
            0.0
        } else {
            (self.reject_count as f64 / attempts as f64) * 100.0
        }
    }
}
