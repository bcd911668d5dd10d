//! Tick clock, timers, and rate-limited work queues.
#![forbid(unsafe_code)]

use std::collections::VecDeque;

/// Monotonic server step counter. All scheduling in the engine is
/// expressed in ticks, never wall-clock time.
pub type Tick = u64;

/// Ticks per wall-clock second at the stock 50 ms tick period.
pub const TICK_SECOND: Tick = 20;
/// Ticks per wall-clock minute at the stock 50 ms tick period.
pub const TICK_MINUTE: Tick = TICK_SECOND * 60;

/// Fires after `length` ticks, either once or repeatedly.
#[derive(Debug, Clone)]
pub struct Timer {
    length: Tick,
    repeat: bool,
    elapsed: Tick,
    done: bool,
}

impl Timer {
    pub fn new(length: Tick, repeat: bool) -> Self {
        Self {
            length: length.max(1),
            repeat,
            elapsed: 0,
            done: false,
        }
    }

    /// Advance by `n` ticks. Returns true when the timer fires this call.
    /// A one-shot timer that has already fired never fires again until
    /// [`Timer::reset`].
    pub fn tick(&mut self, n: Tick) -> bool {
        if self.done {
            return false;
        }
        self.elapsed += n;
        if self.elapsed >= self.length {
            self.elapsed = 0;
            if !self.repeat {
                self.done = true;
            }
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.elapsed = 0;
        self.done = false;
    }

    #[inline]
    pub fn length(&self) -> Tick {
        self.length
    }

    /// Ticks remaining until the next firing.
    #[inline]
    pub fn remaining(&self) -> Tick {
        self.length - self.elapsed
    }
}

/// FIFO work queue drained at most `max` items per timer firing, so a
/// single tick never performs unbounded work on behalf of one queue.
///
/// An item is yielded at most once per enqueue; re-enqueueing is the
/// caller's responsibility.
#[derive(Debug)]
pub struct Queue<T> {
    items: VecDeque<T>,
    max: usize,
    timer: Timer,
}

impl<T> Queue<T> {
    pub fn new(interval: Tick, max: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max,
            timer: Timer::new(interval, true),
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn max_per_firing(&self) -> usize {
        self.max
    }

    /// Advance the queue's timer by one tick; when it fires, pop up to
    /// `max` items for the caller to handle. Off-interval ticks yield
    /// nothing.
    pub fn poll(&mut self) -> Vec<T> {
        if !self.timer.tick(1) {
            return Vec::new();
        }
        self.take_batch()
    }

    /// Drain everything regardless of the timer. Shutdown only.
    pub fn flush(&mut self) -> Vec<T> {
        self.timer.reset();
        self.items.drain(..).collect()
    }

    fn take_batch(&mut self) -> Vec<T> {
        let n = self.max.min(self.items.len());
        self.items.drain(..n).collect()
    }
}
