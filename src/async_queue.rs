//! §4.3 — single-producer/many-push, single-consumer FIFO feeding prompts
//! into the structured provider.
//!
//! A plain closed `mpsc` channel would make `push` after `end` silently
//! vanish instead of failing, so end-of-stream is modeled as an explicit
//! sentinel in the channel item rather than by closing the sender.

use tokio::sync::mpsc;

use crate::error::{Result, SupervisorError};

enum Item<T> {
    Value(T),
    End,
}

pub struct AsyncQueue<T> {
    tx: mpsc::UnboundedSender<Item<T>>,
    ended: std::sync::atomic::AtomicBool,
}

pub struct AsyncQueueReceiver<T> {
    rx: mpsc::UnboundedReceiver<Item<T>>,
}

impl<T> AsyncQueue<T> {
    pub fn new() -> (Self, AsyncQueueReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx, ended: std::sync::atomic::AtomicBool::new(false) },
            AsyncQueueReceiver { rx },
        )
    }

    /// Fails with `QueueEnded` if `end()` was already called — a programming
    /// error, not a transient condition.
    pub fn push(&self, value: T) -> Result<()> {
        if self.ended.load(std::sync::atomic::Ordering::Acquire) {
            return Err(SupervisorError::QueueEnded);
        }
        self.tx.send(Item::Value(value)).map_err(|_| SupervisorError::QueueEnded)
    }

    /// Signals no more items; wakes every waiting consumer with end-of-stream.
    /// Idempotent.
    pub fn end(&self) {
        if !self.ended.swap(true, std::sync::atomic::Ordering::AcqRel) {
            let _ = self.tx.send(Item::End);
        }
    }
}

impl<T> AsyncQueueReceiver<T> {
    /// `None` means end-of-stream (either `end()` was called or every
    /// producer was dropped).
    pub async fn next(&mut self) -> Option<T> {
        match self.rx.recv().await {
            Some(Item::Value(v)) => Some(v),
            Some(Item::End) | None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_consume_in_order() {
        let (q, mut rx) = AsyncQueue::new();
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.end();
        assert_eq!(rx.next().await, Some(1));
        assert_eq!(rx.next().await, Some(2));
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn push_after_end_fails() {
        let (q, _rx) = AsyncQueue::new();
        q.end();
        assert!(matches!(q.push(1), Err(SupervisorError::QueueEnded)));
    }

    #[tokio::test]
    async fn end_wakes_waiting_consumer() {
        let (q, mut rx) = AsyncQueue::<i32>::new();
        let handle = tokio::spawn(async move { rx.next().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        q.end();
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let (q, mut rx) = AsyncQueue::<i32>::new();
        q.end();
        q.end();
        assert_eq!(rx.next().await, None);
    }
}
