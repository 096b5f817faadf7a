// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    fmt::Debug,
    hint,
    mem::transmute,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::{
    sync::{Condvar, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use platform::{
    queue::{MultiConsumer, Producer},
    Fence,
};
use tracing::{debug, warn};

use super::{add_work_to_fences, run_or_abort, signal_fences, FenceList};
use crate::{allocators::Arena, collections::mpmc_queue};

/// How many times a worker polls the empty queue after waking up (or after
/// running a task) before going back to sleep.
pub const WORKER_SPIN_LIMIT: usize = 64;

/// The amount of worker threads to use by default: the available parallelism,
/// minus the main thread and the IO thread. At least one.
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
        .saturating_sub(2)
        .max(1)
}

/// A queued unit of work.
struct Task {
    fences: FenceList,
    /// Cast from: `*mut T`.
    data: *mut (),
    /// Cast from: `fn(&mut T)`.
    func: *const (),
    /// Pass `self.func` and `self.data` in here to call the function with the
    /// right types.
    proxy: fn(func: *const (), data: *mut ()),
}

// Safety: the data pointer is to a `T: Send` (required by push_raw), and the
// fence pointers are to Fences, which are Sync.
unsafe impl Send for Task {}

impl Task {
    fn run(self) {
        run_or_abort("a thread pool task", || (self.proxy)(self.func, self.data));
        // Safety: push_raw requires the fences to live until the task has run,
        // and the task is consumed here, so this is the only time these
        // fences are signaled for this task.
        unsafe { signal_fences(&self.fences) };
    }
}

/// The state shared between the pool and its threads. Allocated from the
/// arena the pool was created with, and never freed.
pub(crate) struct PoolShared {
    producer: Producer<Task>,
    consumer: MultiConsumer<Task>,
    /// Amount of tasks pushed but not yet popped. Incremented before the task
    /// is pushed, so it's never less than the amount of tasks in the queue.
    count: AtomicUsize,
    /// Only used for the sleep/wake handshake, doesn't protect any data.
    sleep: Mutex<()>,
    wake: Condvar,
    should_close: AtomicBool,
}

impl PoolShared {
    /// Pops a task from the queue and runs it on this thread. Returns false
    /// if there were no tasks to run.
    pub(crate) fn run_one(&self) -> bool {
        let Some(task) = self.consumer.pop() else {
            return false;
        };
        self.count.fetch_sub(1, Ordering::SeqCst);
        task.run();
        true
    }

    fn wake_one(&self) {
        // The lock is taken so that a worker can't be between checking the
        // count and starting to wait when the notification is sent.
        drop(self.sleep.lock().unwrap_or_else(PoisonError::into_inner));
        self.wake.notify_one();
    }

    fn wake_all(&self) {
        drop(self.sleep.lock().unwrap_or_else(PoisonError::into_inner));
        self.wake.notify_all();
    }
}

/// A fixed set of worker threads running tasks from a shared queue.
///
/// Tasks are pushed with [`ThreadPool::push_raw`] or more conveniently with
/// [`task_scope`](super::task_scope). Any thread can help run queued tasks
/// with [`ThreadPool::pop`] and [`ThreadPool::help`].
pub struct ThreadPool {
    shared: &'static PoolShared,
    workers: Vec<JoinHandle<()>>,
}

impl Debug for ThreadPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("thread_count", &self.workers.len())
            .field("pending", &self.pending())
            .field("queue_capacity", &self.queue_capacity())
            .finish_non_exhaustive()
    }
}

impl ThreadPool {
    /// Returns a conservative estimate of how many bytes of arena memory
    /// [`ThreadPool::new`] needs for a queue of `queue_capacity` tasks.
    pub fn required_arena_size(queue_capacity: usize) -> usize {
        let slots = queue_capacity.max(1).next_power_of_two();
        slots * (size_of::<Task>() + size_of::<AtomicBool>())
            + size_of::<platform::queue::QueueCursors>()
            + size_of::<PoolShared>()
            + 4 * crate::allocators::ARENA_BLOCK_ALIGNMENT
    }

    /// Creates a thread pool with `worker_count` worker threads, allocating a
    /// task queue with room for `queue_capacity` tasks (rounded up to the next
    /// power of two) from the arena.
    ///
    /// A pool with zero workers is allowed: its tasks are only ever run by
    /// threads calling [`ThreadPool::pop`] or [`ThreadPool::help`] (or the
    /// [`IoThread`](super::IoThread)).
    ///
    /// Returns None if the arena doesn't have enough memory left, or if the
    /// threads could not be spawned.
    pub fn new(arena: &'static Arena, worker_count: usize, queue_capacity: usize) -> Option<ThreadPool> {
        let (producer, consumer) = mpmc_queue::<Task>(arena, queue_capacity)?;
        let shared: &'static PoolShared = arena
            .try_alloc(PoolShared {
                producer,
                consumer,
                count: AtomicUsize::new(0),
                sleep: Mutex::new(()),
                wake: Condvar::new(),
                should_close: AtomicBool::new(false),
            })
            .ok()?;

        let mut pool = ThreadPool {
            shared,
            workers: Vec::with_capacity(worker_count),
        };
        for index in 0..worker_count {
            let spawn_result = thread::Builder::new()
                .name(format!("hurdygurdy-worker-{index}"))
                .spawn(move || worker_loop(shared, index));
            match spawn_result {
                Ok(handle) => pool.workers.push(handle),
                Err(err) => {
                    warn!("failed to spawn thread pool worker {index}: {err}");
                    // Dropping the pool shuts down the already spawned workers.
                    return None;
                }
            }
        }

        debug!(
            "started a thread pool with {worker_count} workers and room for {} tasks",
            pool.queue_capacity(),
        );
        Some(pool)
    }

    /// Queues up `func(data)` to be run on some thread, and adds one unit of
    /// work to each of the fences, to be signaled after `func` has run.
    ///
    /// If the queue is full, this thread runs queued tasks until there's
    /// room.
    ///
    /// ### Safety
    ///
    /// The fences and `data` must stay valid, and `data` must not be accessed
    /// by anything else, until `func` has run. In practice this means waiting
    /// until the fences have completed before touching them again.
    ///
    /// ### Panics
    ///
    /// If there are more than [`MAX_FENCES_PER_TASK`](super::MAX_FENCES_PER_TASK)
    /// fences.
    #[track_caller]
    pub unsafe fn push_raw<T: Send>(&self, fences: &[&Fence], data: *mut T, func: fn(&mut T)) {
        fn proxy<T>(func: *const (), data: *mut ()) {
            // Safety: this pointer is cast from the destination type
            // `fn(&mut T)` in push_raw, and transmuting pointers to fn pointers
            // is ok according to the [fn
            // docs](https://doc.rust-lang.org/core/primitive.fn.html#casting-to-and-from-integers).
            let func = unsafe { transmute::<*const (), fn(&mut T)>(func) };
            // Safety: the caller of push_raw guarantees that the data is valid
            // and not accessed by anyone else until this function has run.
            let data = unsafe { &mut *(data as *mut T) };
            func(data);
        }

        let task = Task {
            fences: add_work_to_fences(fences),
            data: data as *mut (),
            func: func as *const (),
            proxy: proxy::<T>,
        };
        self.push_task(task);
    }

    fn push_task(&self, mut task: Task) {
        let shared = self.shared;
        shared.count.fetch_add(1, Ordering::SeqCst);
        loop {
            match shared.producer.push(task) {
                Ok(()) => break,
                Err(rejected) => {
                    task = rejected;
                    if !shared.run_one() {
                        hint::spin_loop();
                    }
                }
            }
        }
        shared.wake_one();
    }

    /// Runs one queued task on this thread, if there are any. Returns whether
    /// a task was run.
    pub fn pop(&self) -> bool {
        self.shared.run_one()
    }

    /// Runs queued tasks on this thread until the fence is complete, or until
    /// `timeout` has passed. Returns true if the fence completed.
    ///
    /// Unlike [`Fence::wait`], this makes the waiting thread useful.
    pub fn help(&self, fence: &Fence, timeout: Duration) -> bool {
        let start = Instant::now();
        while !fence.is_complete() {
            if start.elapsed() >= timeout {
                return fence.is_complete();
            }
            if !self.shared.run_one() {
                hint::spin_loop();
            }
        }
        true
    }

    /// The amount of worker threads.
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// The amount of tasks pushed but not yet started. Only a snapshot.
    pub fn pending(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// The amount of tasks the queue can hold.
    pub fn queue_capacity(&self) -> usize {
        self.shared.producer.capacity()
    }

    pub(crate) fn shared(&self) -> &'static PoolShared {
        self.shared
    }

    /// Stops and joins all the worker threads. Tasks still in the queue are
    /// not run, so their fences never complete.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.shared.should_close.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.wake_all();
        let worker_count = self.workers.len();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("a thread pool worker panicked");
            }
        }
        let abandoned = self.pending();
        if abandoned > 0 {
            warn!("thread pool shut down with {abandoned} tasks left in the queue, their fences will never complete");
        }
        debug!("thread pool with {worker_count} workers shut down");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(shared: &'static PoolShared, index: usize) {
    debug!("thread pool worker {index} started");
    loop {
        {
            let mut guard = shared.sleep.lock().unwrap_or_else(PoisonError::into_inner);
            while shared.count.load(Ordering::SeqCst) == 0 && !shared.should_close.load(Ordering::SeqCst) {
                guard = shared.wake.wait(guard).unwrap_or_else(PoisonError::into_inner);
            }
        }

        let mut idle_polls = 0;
        while idle_polls < WORKER_SPIN_LIMIT && !shared.should_close.load(Ordering::Relaxed) {
            if shared.run_one() {
                idle_polls = 0;
            } else {
                idle_polls += 1;
                hint::spin_loop();
            }
        }

        if shared.should_close.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!("thread pool worker {index} stopped");
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use platform::Fence;

    use super::ThreadPool;
    use crate::allocators::Arena;

    fn leak_arena(capacity: usize) -> &'static Arena {
        Box::leak(Box::new(Arena::new(capacity)))
    }

    fn increment(n: &mut u32) {
        *n += 1;
    }

    #[test]
    fn help_runs_a_single_task() {
        let pool = ThreadPool::new(leak_arena(64 * 1024), 2, 16).unwrap();
        let fence = Fence::new();
        let mut counter = 0u32;
        // Safety: `help` returns true only after the task has run, and the
        // counter and fence outlive the pool's use of them.
        unsafe { pool.push_raw(&[&fence], &raw mut counter, increment) };
        assert!(pool.help(&fence, Duration::from_secs(1)));
        assert_eq!(1, counter);
        pool.shutdown();
    }

    #[test]
    fn pop_runs_tasks_without_workers() {
        let pool = ThreadPool::new(leak_arena(64 * 1024), 0, 8).unwrap();
        let fence = Fence::new();
        let mut values = [0u32; 4];
        for value in &mut values {
            // Safety: the tasks are run on this thread below, before the
            // values are read.
            unsafe { pool.push_raw(&[&fence], value as *mut u32, increment) };
        }
        assert_eq!(4, fence.outstanding());
        assert_eq!(4, pool.pending());
        while pool.pop() {}
        assert!(fence.is_complete());
        assert_eq!([1; 4], values);
        assert_eq!(0, pool.pending());
    }

    #[test]
    fn full_queue_makes_the_pusher_help() {
        let pool = ThreadPool::new(leak_arena(64 * 1024), 0, 2).unwrap();
        let fence = Fence::new();
        let mut values = [0u32; 16];
        for value in &mut values {
            // Safety: see pop_runs_tasks_without_workers.
            unsafe { pool.push_raw(&[&fence], value as *mut u32, increment) };
        }
        assert!(pool.pending() <= 2);
        assert!(pool.help(&fence, Duration::from_secs(1)));
        assert_eq!([1; 16], values);
    }

    #[test]
    fn fan_in_from_many_tasks() {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        fn bump(_: &mut ()) {
            COUNTER.fetch_add(1, Ordering::Relaxed);
        }

        let pool = ThreadPool::new(leak_arena(256 * 1024), 4, 64).unwrap();
        let batch = Fence::new();
        let everything = Fence::new();
        let mut units = [(); 200];
        for unit in &mut units {
            // Safety: the fences are helped to completion before the end of
            // this function.
            unsafe { pool.push_raw(&[&batch, &everything], unit as *mut (), bump) };
        }
        assert!(pool.help(&batch, Duration::from_secs(5)));
        assert_eq!(200, COUNTER.load(Ordering::Relaxed));
        assert!(pool.help(&everything, Duration::from_secs(5)));
    }

    #[test]
    fn help_times_out_on_foreign_work() {
        let pool = ThreadPool::new(leak_arena(64 * 1024), 1, 8).unwrap();
        let fence = Fence::new();
        fence.add(1);
        assert!(!pool.help(&fence, Duration::from_millis(10)));
        fence.signal(1);
        assert!(pool.help(&fence, Duration::from_millis(10)));
    }

    #[test]
    #[should_panic(expected = "at most 4 fences")]
    fn too_many_fences_panics() {
        let pool = ThreadPool::new(leak_arena(64 * 1024), 0, 8).unwrap();
        let fences = [Fence::new(), Fence::new(), Fence::new(), Fence::new(), Fence::new()];
        let refs = fences.each_ref();
        let mut counter = 0u32;
        // Safety: panics before anything is queued.
        unsafe { pool.push_raw(&refs, &raw mut counter, increment) };
    }

    #[test]
    fn returns_none_when_arena_is_too_small() {
        assert!(ThreadPool::new(leak_arena(128), 1, 64).is_none());
    }

    #[test]
    fn required_arena_size_is_enough() {
        let size = ThreadPool::required_arena_size(100);
        assert!(ThreadPool::new(leak_arena(size), 1, 100).is_some());
    }
}
