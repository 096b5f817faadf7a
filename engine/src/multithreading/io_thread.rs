// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    fmt::Debug,
    mem::transmute,
    sync::atomic::{AtomicBool, Ordering},
};
use std::{
    path::Path,
    thread::{self, JoinHandle, Thread},
    time::Duration,
};

use crossbeam_utils::Backoff;
use platform::{
    queue::{Producer, SingleConsumer},
    Fence,
};
use tracing::{debug, warn};

use super::{add_work_to_fences, run_or_abort, signal_fences, thread_pool::PoolShared, FenceList, ThreadPool};
use crate::{allocators::Arena, collections::mpsc_queue};

/// How long the IO thread sleeps at a time when there's nothing to do. Pushing
/// an IO request wakes it up early, thread pool tasks don't.
pub const IO_PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// A queued file operation.
struct IoRequest {
    fences: FenceList,
    /// Cast from: `*mut T`.
    data: *mut (),
    /// Cast from: `*mut R`.
    resource: *mut (),
    path: *const Path,
    /// Cast from: `fn(&mut T, &mut R, &Path)`.
    func: *const (),
    proxy: fn(func: *const (), data: *mut (), resource: *mut (), path: &Path),
}

// Safety: the data and resource pointers are to `Send` types (required by
// push_raw), the path is only read, and Fences are Sync.
unsafe impl Send for IoRequest {}

impl IoRequest {
    fn run(self) {
        run_or_abort("an IO request", || {
            // Safety: the caller of push_raw guarantees the path stays valid
            // until the request has run.
            let path = unsafe { &*self.path };
            (self.proxy)(self.func, self.data, self.resource, path);
        });
        // Safety: push_raw requires the fences to live until the request has
        // run, and this is the only time they're signaled for this request.
        unsafe { signal_fences(&self.fences) };
    }
}

/// A dedicated thread for blocking file operations.
///
/// Requests are pushed with [`IoThread::push_raw`] or
/// [`Scope::push_io`](super::Scope::push_io), and run in the order they were
/// pushed. When there are no requests, the IO thread runs tasks from the
/// [`ThreadPool`] it was created with.
pub struct IoThread {
    producer: Producer<IoRequest>,
    should_close: &'static AtomicBool,
    thread: Thread,
    handle: Option<JoinHandle<()>>,
    pool: &'static PoolShared,
}

impl Debug for IoThread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoThread")
            .field("thread", &self.thread.name())
            .field("pending", &self.pending())
            .field("queue_capacity", &self.producer.capacity())
            .finish_non_exhaustive()
    }
}

impl IoThread {
    /// Returns a conservative estimate of how many bytes of arena memory
    /// [`IoThread::new`] needs for a queue of `queue_capacity` requests.
    pub fn required_arena_size(queue_capacity: usize) -> usize {
        let slots = queue_capacity.max(1).next_power_of_two();
        slots * (size_of::<IoRequest>() + size_of::<AtomicBool>())
            + size_of::<platform::queue::QueueCursors>()
            + size_of::<AtomicBool>()
            + 4 * crate::allocators::ARENA_BLOCK_ALIGNMENT
    }

    /// Spawns the IO thread, allocating a request queue with room for
    /// `queue_capacity` requests (rounded up to the next power of two) from
    /// the arena.
    ///
    /// Returns None if the arena doesn't have enough memory left, or if the
    /// thread could not be spawned.
    pub fn new(arena: &'static Arena, queue_capacity: usize, thread_pool: &ThreadPool) -> Option<IoThread> {
        let (producer, consumer) = mpsc_queue::<IoRequest>(arena, queue_capacity)?;
        let should_close: &'static AtomicBool = arena.try_alloc(AtomicBool::new(false)).ok()?;
        let pool = thread_pool.shared();

        let spawn_result = thread::Builder::new()
            .name("hurdygurdy-io".into())
            .spawn(move || io_loop(consumer, pool, should_close));
        let handle = match spawn_result {
            Ok(handle) => handle,
            Err(err) => {
                warn!("failed to spawn the IO thread: {err}");
                return None;
            }
        };

        debug!("started the IO thread with room for {} requests", producer.capacity());
        Some(IoThread {
            producer,
            should_close,
            thread: handle.thread().clone(),
            handle: Some(handle),
            pool,
        })
    }

    /// Queues up `func(data, resource, path)` to be run on the IO thread, and
    /// adds one unit of work to each of the fences, to be signaled after
    /// `func` has run.
    ///
    /// If the queue is full, this thread runs thread pool tasks until there's
    /// room.
    ///
    /// ### Safety
    ///
    /// The fences, `data`, `resource` and `path` must stay valid, and `data`
    /// and `resource` must not be accessed by anything else, until `func` has
    /// run. The IO thread must not have been shut down.
    ///
    /// ### Panics
    ///
    /// If there are more than [`MAX_FENCES_PER_TASK`](super::MAX_FENCES_PER_TASK)
    /// fences.
    #[track_caller]
    pub unsafe fn push_raw<T: Send, R: Send>(
        &self,
        fences: &[&Fence],
        data: *mut T,
        resource: *mut R,
        path: *const Path,
        func: fn(&mut T, &mut R, &Path),
    ) {
        fn proxy<T, R>(func: *const (), data: *mut (), resource: *mut (), path: &Path) {
            // Safety: cast from the same type in push_raw, see
            // ThreadPool::push_raw.
            let func = unsafe { transmute::<*const (), fn(&mut T, &mut R, &Path)>(func) };
            // Safety: the caller of push_raw guarantees that these are valid
            // and not accessed by anyone else until this function has run.
            let (data, resource) = unsafe { (&mut *(data as *mut T), &mut *(resource as *mut R)) };
            func(data, resource, path);
        }

        let mut request = IoRequest {
            fences: add_work_to_fences(fences),
            data: data as *mut (),
            resource: resource as *mut (),
            path,
            func: func as *const (),
            proxy: proxy::<T, R>,
        };

        let backoff = Backoff::new();
        loop {
            match self.producer.push(request) {
                Ok(()) => break,
                Err(rejected) => {
                    request = rejected;
                    self.thread.unpark();
                    if !self.pool.run_one() {
                        backoff.snooze();
                    }
                }
            }
        }
        self.thread.unpark();
    }

    /// The amount of requests waiting to be run. Only a snapshot.
    pub fn pending(&self) -> usize {
        self.producer.len()
    }

    /// Stops and joins the IO thread. Requests still in the queue are not
    /// run, so their fences never complete.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.should_close.store(true, Ordering::SeqCst);
        self.thread.unpark();
        if handle.join().is_err() {
            warn!("the IO thread panicked");
        }
        let abandoned = self.pending();
        if abandoned > 0 {
            warn!("IO thread shut down with {abandoned} requests left in the queue, their fences will never complete");
        }
        debug!("IO thread shut down");
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.close();
    }
}

fn io_loop(mut requests: SingleConsumer<IoRequest>, pool: &'static PoolShared, should_close: &'static AtomicBool) {
    debug!("IO thread started");
    let backoff = Backoff::new();
    while !should_close.load(Ordering::SeqCst) {
        if let Some(request) = requests.pop() {
            request.run();
            backoff.reset();
        } else if pool.run_one() {
            backoff.reset();
        } else if backoff.is_completed() {
            thread::park_timeout(IO_PARK_TIMEOUT);
        } else {
            backoff.snooze();
        }
    }
    debug!("IO thread stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        time::Duration,
    };

    use platform::Fence;

    use super::IoThread;
    use crate::{allocators::Arena, multithreading::ThreadPool};

    fn leak_arena(capacity: usize) -> &'static Arena {
        Box::leak(Box::new(Arena::new(capacity)))
    }

    fn record_path(calls: &mut Vec<PathBuf>, lengths: &mut usize, path: &Path) {
        calls.push(path.to_path_buf());
        *lengths += path.as_os_str().len();
    }

    #[test]
    fn runs_requests_in_order() {
        let arena = leak_arena(256 * 1024);
        let pool = ThreadPool::new(arena, 1, 16).unwrap();
        let io = IoThread::new(arena, 4, &pool).unwrap();

        let fence = Fence::new();
        let mut calls = Vec::new();
        let mut lengths = 0usize;
        let paths = [Path::new("a"), Path::new("bb"), Path::new("ccc")];
        for path in paths {
            // Safety: the fence is waited on below, and `calls` and `lengths`
            // are only accessed after that. Requests run one at a time on the
            // IO thread, so sharing the pointers between them is fine.
            unsafe { io.push_raw(&[&fence], &raw mut calls, &raw mut lengths, path, record_path) };
        }
        assert!(fence.wait(Duration::from_secs(5)));
        assert_eq!(
            vec![PathBuf::from("a"), PathBuf::from("bb"), PathBuf::from("ccc")],
            calls,
        );
        assert_eq!(6, lengths);

        io.shutdown();
        pool.shutdown();
    }

    #[test]
    fn io_thread_runs_pool_tasks_when_idle() {
        fn double(n: &mut u32) {
            *n *= 2;
        }

        let arena = leak_arena(256 * 1024);
        // No workers, so only the IO thread can run the task.
        let pool = ThreadPool::new(arena, 0, 16).unwrap();
        let io = IoThread::new(arena, 4, &pool).unwrap();

        let fence = Fence::new();
        let mut value = 21u32;
        // Safety: the fence is waited on before `value` is read.
        unsafe { pool.push_raw(&[&fence], &raw mut value, double) };
        assert!(fence.wait(Duration::from_secs(5)));
        assert_eq!(42, value);

        drop(io);
        drop(pool);
    }

    #[test]
    fn full_queue_makes_the_pusher_help() {
        fn increment_slowly(value: &mut u32, _: &mut (), _: &Path) {
            std::thread::sleep(Duration::from_millis(1));
            *value += 1;
        }

        let arena = leak_arena(256 * 1024);
        let pool = ThreadPool::new(arena, 0, 4).unwrap();
        let io = IoThread::new(arena, 1, &pool).unwrap();
        assert_eq!(1, io.producer.capacity());

        let fence = Fence::new();
        let mut values = [0u32; 32];
        let mut nothing = ();
        for value in &mut values {
            // Safety: each request gets its own element, `nothing` is
            // zero-sized, and `values` is only read after the fence completes.
            unsafe { io.push_raw(&[&fence], value as *mut u32, &raw mut nothing, Path::new("x"), increment_slowly) };
        }
        assert!(fence.wait(Duration::from_secs(5)));
        assert_eq!([1; 32], values);

        io.shutdown();
        pool.shutdown();
    }
}
