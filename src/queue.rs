//! The two producer-facing queues: pending submissions and cancellations.
//!
//! Both are classic multi-producer/single-consumer, non-blocking queues.
//! `schedule` and `cancel` never wait on them; the worker thread is the
//! queues' only consumer.

use crossbeam_channel::{unbounded, Receiver, Sender};

/// A multi-producer, single-consumer, unbounded, non-blocking queue.
///
/// Producers call [`push`] from any thread; the worker thread is the only
/// caller of [`try_pop`].
///
/// [`push`]: #method.push
/// [`try_pop`]: #method.try_pop
pub(crate) struct MpscQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> MpscQueue<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Returns a cloneable sender handle producers can hold on to.
    pub(crate) fn sender(&self) -> Sender<T> {
        self.tx.clone()
    }

    /// Non-blocking pop; `None` if the queue is currently empty.
    pub(crate) fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_then_pop_preserves_order() {
        let queue: MpscQueue<i32> = MpscQueue::new();
        let tx = queue.sender();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();

        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn multiple_producers_all_land() {
        let queue: MpscQueue<i32> = MpscQueue::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tx = queue.sender();
                std::thread::spawn(move || tx.send(i).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Some(v) = queue.try_pop() {
            seen.push(v);
        }
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }
}
