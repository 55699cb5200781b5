//! Write coalescing: keep only the latest value per window.
//!
//! The first push after a flush opens a window of `interval`; later pushes
//! replace the pending value without extending the window, so a continuous
//! drag still writes at most once per interval.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct CoalescingQueue<T> {
    interval: Duration,
    pending: Option<T>,
    due_at: Option<Instant>,
    coalesced: u64,
}

impl<T> CoalescingQueue<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            due_at: None,
            coalesced: 0,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.pending.replace(value).is_some() {
            self.coalesced += 1;
        }
        if self.due_at.is_none() {
            self.due_at = Some(Instant::now() + self.interval);
        }
    }

    /// When the pending value should be written, if any.
    pub fn due_at(&self) -> Option<Instant> {
        self.due_at
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the pending value regardless of the window.
    pub fn flush(&mut self) -> Option<T> {
        self.due_at = None;
        self.pending.take()
    }

    /// Take the pending value only if its window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match self.due_at {
            Some(due) if due <= now => self.flush(),
            _ => None,
        }
    }

    /// Values replaced before they were written.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_keeps_latest_value() {
        let mut queue = CoalescingQueue::new(Duration::from_millis(250));
        for i in 0..10 {
            queue.push(i);
        }
        assert_eq!(queue.coalesced(), 9);
        assert_eq!(queue.flush(), Some(9));
        assert_eq!(queue.flush(), None);
        assert!(queue.due_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_does_not_slide() {
        let mut queue = CoalescingQueue::new(Duration::from_millis(250));
        queue.push(1);
        let due = queue.due_at().unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        queue.push(2);
        assert_eq!(queue.due_at(), Some(due));
        assert_eq!(queue.take_due(Instant::now()), None);

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(queue.take_due(Instant::now()), Some(2));
        assert!(!queue.has_pending());
    }
}
