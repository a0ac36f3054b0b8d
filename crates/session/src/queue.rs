//! Bounded audio frame queue
//!
//! External stimuli reach the session task only through this queue. On
//! overflow the oldest frame is dropped and counted; the newest audio is
//! always retained so barge-in detection stays current.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use colloquy_core::{observe, AudioFrame};

/// Drop-oldest bounded queue of audio frames.
pub struct FrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame, dropping the oldest when full.
    pub fn push(&self, frame: AudioFrame) {
        {
            let mut frames = self.frames.lock();
            if frames.len() == self.capacity {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                observe::inc_frames_dropped();
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.frames.lock().pop_front()
    }

    /// Wait for the next frame.
    pub async fn pop(&self) -> AudioFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Total frames dropped due to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: u64) -> AudioFrame {
        AudioFrame::new(vec![0.0; 160], 16000, ts)
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let queue = FrameQueue::new(3);
        for ts in 0..3 {
            queue.push(frame(ts));
        }
        assert_eq!(queue.dropped(), 0);

        // Fourth push evicts the oldest, counter moves by exactly one
        queue.push(frame(3));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop().unwrap().timestamp_ms, 1);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = std::sync::Arc::new(FrameQueue::new(8));
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.pop().await.timestamp_ms });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(frame(42));

        assert_eq!(handle.await.unwrap(), 42);
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(8);
        for ts in 0..5 {
            queue.push(frame(ts));
        }
        for ts in 0..5 {
            assert_eq!(queue.try_pop().unwrap().timestamp_ms, ts);
        }
        assert!(queue.is_empty());
    }
}
