// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Worker threads and the tools for sending work to them.
//!
//! There's one [`ThreadPool`] with a shared, bounded task queue, and one
//! [`IoThread`] for blocking file operations, which runs thread pool tasks
//! when it has no requests of its own. Work is tracked with [`Fence`]s: every
//! fence passed in with a task is signaled once after the task has run, and
//! waiting threads can [`ThreadPool::help`] run queued tasks until their fence
//! completes.
//!
//! The raw push functions are unsafe, since the queues don't own the data the
//! tasks operate on. [`task_scope`] wraps them in a safe, lifetime-checked API,
//! similarly to [`std::thread::scope`].

mod io_thread;
mod scoped;
mod thread_pool;

use core::{panic::AssertUnwindSafe, ptr::NonNull};
use std::{panic, process};

use arrayvec::ArrayVec;
use platform::Fence;
use tracing::error;

pub use io_thread::{IoThread, IO_PARK_TIMEOUT};
pub use scoped::{task_scope, Scope};
pub use thread_pool::{default_worker_count, ThreadPool, WORKER_SPIN_LIMIT};

/// The maximum amount of fences a single task or IO request can signal.
pub const MAX_FENCES_PER_TASK: usize = 4;

/// The fences of a queued task. The pointers are valid until the task has run,
/// which is guaranteed by the callers of the raw push functions.
type FenceList = ArrayVec<NonNull<Fence>, MAX_FENCES_PER_TASK>;

/// Adds one unit of outstanding work to each fence, and returns the pointers
/// to be signaled after the work is done.
#[track_caller]
fn add_work_to_fences(fences: &[&Fence]) -> FenceList {
    assert!(
        fences.len() <= MAX_FENCES_PER_TASK,
        "tasks can signal at most {MAX_FENCES_PER_TASK} fences, got {}",
        fences.len(),
    );
    let mut list = FenceList::new();
    for fence in fences {
        fence.add(1);
        list.push(NonNull::from(*fence));
    }
    list
}

/// Signals each fence once.
///
/// ### Safety
///
/// The fences must still be alive, i.e. this is the task the fences were added
/// for, and it's signaling them for the first time.
unsafe fn signal_fences(fences: &FenceList) {
    for fence in fences {
        // Safety: guaranteed by the caller.
        unsafe { fence.as_ref() }.signal(1);
    }
}

/// Runs the task function, aborting the process if it panics. There's nobody
/// to propagate the panic to, and the task's fences would never complete.
fn run_or_abort<F: FnOnce()>(kind: &str, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("{kind} panicked, aborting since its fences would never be signaled");
        process::abort();
    }
}
