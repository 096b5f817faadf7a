// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    fmt::Debug,
    hint,
    sync::atomic::{AtomicIsize, Ordering},
};
use std::time::{Duration, Instant};

/// Atomic counter of outstanding work, used to wait for a batch of tasks to
/// finish.
///
/// Every piece of work referencing the fence is [`Fence::add`]ed before it's
/// made visible to the threads that will run it, and [`Fence::signal`]ed once
/// after it has run. The fence is complete when the counter is back at zero.
/// A single fence can track any amount of tasks (fan-out/fan-in), but the
/// tasks' results are only available through the data they wrote to.
///
/// Fences don't own or reference-count anything. Whoever creates one must
/// keep it alive until all the work referencing it has signaled it.
pub struct Fence {
    counter: AtomicIsize,
}

impl Fence {
    /// Creates a new, complete fence.
    pub const fn new() -> Fence {
        Fence {
            counter: AtomicIsize::new(0),
        }
    }

    /// Marks `count` more units of work as outstanding. Must be called before
    /// the work is made visible to other threads.
    pub fn add(&self, count: usize) {
        self.counter.fetch_add(count as isize, Ordering::AcqRel);
    }

    /// Marks `count` units of work as finished. Called once per unit of work,
    /// after the work has been done.
    pub fn signal(&self, count: usize) {
        // Release: the side effects of the work must be visible to whoever
        // observes the decremented counter.
        let previous = self.counter.fetch_sub(count as isize, Ordering::AcqRel);
        debug_assert!(
            previous >= count as isize,
            "fence was signaled more times than work was added to it",
        );
    }

    /// Returns true if there's no outstanding work tracked by this fence.
    ///
    /// Note that this is just a counter check: a fence that never had any
    /// work added to it is also complete.
    pub fn is_complete(&self) -> bool {
        self.counter.load(Ordering::Acquire) == 0
    }

    /// Returns the amount of outstanding work. Only a snapshot.
    pub fn outstanding(&self) -> usize {
        self.counter.load(Ordering::Acquire).max(0) as usize
    }

    /// Spins until the fence is complete, or until `timeout` has passed.
    /// Returns true if the fence completed.
    ///
    /// This keeps the calling thread busy without doing any useful work. When
    /// the work is queued on a thread pool, prefer the pool's `help` function,
    /// which runs queued tasks while waiting.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_complete() {
            return true;
        }
        let start = Instant::now();
        while !self.is_complete() {
            if start.elapsed() >= timeout {
                return self.is_complete();
            }
            hint::spin_loop();
        }
        true
    }
}

impl Default for Fence {
    fn default() -> Self {
        Fence::new()
    }
}

impl Debug for Fence {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fence")
            .field("outstanding", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::Fence;

    #[test]
    fn new_fence_is_complete() {
        let fence = Fence::new();
        assert!(fence.is_complete());
        assert!(fence.wait(Duration::ZERO));
    }

    #[test]
    fn counts_added_and_signaled_work() {
        let fence = Fence::new();
        fence.add(3);
        assert_eq!(3, fence.outstanding());
        fence.signal(1);
        fence.signal(1);
        assert!(!fence.is_complete());
        fence.signal(1);
        assert!(fence.is_complete());
    }

    #[test]
    fn wait_times_out_on_unsignaled_work() {
        let fence = Fence::new();
        fence.add(1);
        assert!(!fence.wait(Duration::from_millis(10)));
        fence.signal(1);
        assert!(fence.wait(Duration::from_millis(10)));
    }

    #[test]
    fn fan_in_from_other_threads() {
        const THREADS: usize = 8;
        let fence = Fence::new();
        fence.add(THREADS);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| fence.signal(1));
            }
            assert!(fence.wait(Duration::from_secs(5)));
        });
        assert!(fence.is_complete());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "fence was signaled more times")]
    fn signaling_past_zero_is_a_bug() {
        let fence = Fence::new();
        fence.signal(1);
    }
}
