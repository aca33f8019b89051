// Signal abstractions over backend semaphores
//
// Counting signal: wait-for-value / signal-to-value, target only ever grows.
// One-shot signal: set once by a producer, consumed once by a waiter.

use std::fmt;

/// A counting signal and the last value work was submitted against
#[derive(Clone, Copy)]
pub struct CountingSignal<S> {
    handle: S,
    target: u64,
}

impl<S: Copy> CountingSignal<S> {
    pub fn new(handle: S) -> Self {
        Self { handle, target: 0 }
    }

    pub fn handle(&self) -> S {
        self.handle
    }

    /// Value the last submission will signal. Zero means nothing was ever submitted.
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Bump the target for a new submission and return it
    pub fn advance(&mut self) -> u64 {
        self.target += 1;
        self.target
    }

    /// Handle and value a host wait must reach to prove the last submission finished
    pub fn wait_point(&self) -> (S, u64) {
        (self.handle, self.target)
    }
}

impl<S: fmt::Debug> fmt::Debug for CountingSignal<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountingSignal({:?} @ {})", self.handle, self.target)
    }
}

/// A binary signal. `signal` hands out the handle for a producer and marks the
/// signal pending, `consume` hands it to the single waiter and clears it.
#[derive(Clone, Copy)]
pub struct OneShotSignal<S> {
    handle: S,
    pending: bool,
}

impl<S: Copy> OneShotSignal<S> {
    pub fn new(handle: S) -> Self {
        Self { handle, pending: false }
    }

    pub fn handle(&self) -> S {
        self.handle
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn signal(&mut self) -> S {
        debug_assert!(!self.pending, "one-shot signal set twice without a waiter");
        self.pending = true;
        self.handle
    }

    pub fn consume(&mut self) -> S {
        debug_assert!(self.pending, "one-shot signal consumed before being set");
        self.pending = false;
        self.handle
    }

    /// Forget a pending set whose producer never fired (stale acquire)
    pub fn cancel(&mut self) {
        self.pending = false;
    }
}

impl<S: fmt::Debug> fmt::Debug for OneShotSignal<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.pending { "pending" } else { "clear" };
        write!(f, "OneShotSignal({:?}, {state})", self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_target_only_grows() {
        let mut signal = CountingSignal::new(7u32);
        assert_eq!(signal.wait_point(), (7, 0));
        assert_eq!(signal.advance(), 1);
        assert_eq!(signal.advance(), 2);
        assert_eq!(signal.wait_point(), (7, 2));
    }

    #[test]
    fn one_shot_alternates_between_set_and_consumed() {
        let mut signal = OneShotSignal::new(3u32);
        assert!(!signal.is_pending());
        assert_eq!(signal.signal(), 3);
        assert!(signal.is_pending());
        assert_eq!(signal.consume(), 3);
        assert!(!signal.is_pending());
    }
}
