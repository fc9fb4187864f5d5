//! Foreign-thread task marshalling
//!
//! Any thread may append a one-shot task; only the engine thread drains.
//! The drain swaps the whole list out under the lock, so tasks enqueued by
//! a task that is itself executing land in the fresh list and run next
//! frame, never in the same drain.

use std::sync::Mutex;

use super::Engine;

/// A one-shot action marshalled onto the engine thread.
pub type Task = Box<dyn FnOnce(&mut Engine) + Send>;

/// The synchronized foreign-thread task queue.
pub struct TaskQueue {
    tasks: Mutex<Vec<Task>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a task from any thread.
    pub fn push(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
    }

    /// Swap the queue with an empty list and return the pending tasks in
    /// enqueue order. Engine thread only.
    pub(crate) fn drain(&self) -> Vec<Task> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_drain_preserves_order_and_empties() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            queue.push(Box::new(move |_| order.lock().unwrap().push(i)));
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 5);
        assert!(queue.drain().is_empty());

        let mut engine = Engine::new(4);
        for task in drained {
            task(&mut engine);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_push_from_foreign_thread() {
        let queue = Arc::new(TaskQueue::new());
        let count = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let count = Arc::clone(&count);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let count = Arc::clone(&count);
                        queue.push(Box::new(move |_| {
                            count.fetch_add(1, Ordering::SeqCst);
                        }));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut engine = Engine::new(4);
        for task in queue.drain() {
            task(&mut engine);
        }
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }
}
