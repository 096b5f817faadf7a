// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{hint, marker::PhantomData, panic::AssertUnwindSafe, time::Duration};
use std::{panic, path::Path};

use arrayvec::ArrayVec;
use platform::Fence;

use super::{IoThread, ThreadPool, MAX_FENCES_PER_TASK};

/// Runs the function, inside which tasks can be sent to the thread pool and
/// the IO thread using the [`Scope`].
///
/// Analogous to `std::thread::scope`, except that instead of spawning threads,
/// the scope queues up work on the threads this was created with. The data
/// and fences passed to the tasks are borrowed for the duration of the scope,
/// and the scope helps run queued tasks until all of its work is done before
/// returning, so the borrows always outlive the tasks.
///
/// Fences that are used inside the scope need to be created outside of it.
#[track_caller]
pub fn task_scope<'env, F, T>(thread_pool: &'env ThreadPool, io_thread: Option<&'env IoThread>, f: F) -> T
where
    F: for<'scope> FnOnce(&'scope Scope<'scope, 'env>) -> T,
{
    let scope = Scope {
        thread_pool,
        io_thread,
        all_work: Fence::new(),
        scope: PhantomData,
        env: PhantomData,
    };

    // The hard parts are adapted from std::thread::scope. Finicky stuff.
    let result = panic::catch_unwind(AssertUnwindSafe(|| f(&scope)));

    scope.join();

    match result {
        Err(err) => panic::resume_unwind(err),
        Ok(result) => result,
    }
}

/// Handle for queueing up work on other threads, see [`task_scope`].
pub struct Scope<'scope, 'env: 'scope> {
    thread_pool: &'env ThreadPool,
    io_thread: Option<&'env IoThread>,
    /// Signaled by every task queued through this scope, in addition to the
    /// fences passed in by the user.
    all_work: Fence,

    // These two match the PhantomDatas in a `std::thread::Scope`.
    scope: PhantomData<&'scope mut &'scope ()>,
    env: PhantomData<&'env mut &'env ()>,
}

impl<'scope> Scope<'scope, '_> {
    /// Queues up `func(data)` to be run on the thread pool. Each fence is
    /// signaled once after `func` has run.
    ///
    /// ### Panics
    ///
    /// If there are more than `MAX_FENCES_PER_TASK - 1` fences, since the
    /// scope uses one of the slots for tracking its own work.
    #[track_caller]
    pub fn push<T: Send>(&self, fences: &[&'scope Fence], data: &'scope mut T, func: fn(&mut T)) {
        let fences = self.with_scope_fence(fences);
        // Safety: `data` and the fences are borrowed for 'scope, and the scope
        // doesn't end before all tasks signaling `all_work` have run (see
        // `Scope::join`). `data` is a mutable borrow, so nothing else accesses
        // it until then.
        unsafe { self.thread_pool.push_raw(&fences, data as *mut T, func) };
    }

    /// Queues up `func(data, resource, path)` to be run on the IO thread. Each
    /// fence is signaled once after `func` has run.
    ///
    /// ### Panics
    ///
    /// If the scope was created without an IO thread, or if there are more
    /// than `MAX_FENCES_PER_TASK - 1` fences.
    #[track_caller]
    pub fn push_io<T: Send, R: Send>(
        &self,
        fences: &[&'scope Fence],
        data: &'scope mut T,
        resource: &'scope mut R,
        path: &'scope Path,
        func: fn(&mut T, &mut R, &Path),
    ) {
        let Some(io_thread) = self.io_thread else {
            panic!("this task scope was created without an IO thread");
        };
        let fences = self.with_scope_fence(fences);
        // Safety: see Scope::push. The IO thread outlives 'env, so it can't
        // have been shut down yet.
        unsafe {
            io_thread.push_raw(&fences, data as *mut T, resource as *mut R, path as *const Path, func);
        }
    }

    /// Runs queued tasks on this thread until the fence is complete, or until
    /// `timeout` has passed. See [`ThreadPool::help`].
    pub fn help(&self, fence: &Fence, timeout: Duration) -> bool {
        self.thread_pool.help(fence, timeout)
    }

    /// Spins until the fence is complete, or until `timeout` has passed. See
    /// [`Fence::wait`].
    pub fn wait(&self, fence: &Fence, timeout: Duration) -> bool {
        fence.wait(timeout)
    }

    /// Returns the fence signaled by every task of this scope.
    pub fn all_work(&self) -> &Fence {
        &self.all_work
    }

    #[track_caller]
    fn with_scope_fence<'a>(&'a self, fences: &[&'a Fence]) -> ArrayVec<&'a Fence, MAX_FENCES_PER_TASK> {
        assert!(
            fences.len() < MAX_FENCES_PER_TASK,
            "scoped tasks can signal at most {} fences, got {}",
            MAX_FENCES_PER_TASK - 1,
            fences.len(),
        );
        let mut list = ArrayVec::new();
        list.extend(fences.iter().copied());
        list.push(&self.all_work);
        list
    }

    /// Runs thread pool tasks until every task of this scope has run.
    fn join(&self) {
        while !self.all_work.is_complete() {
            if !self.thread_pool.pop() {
                hint::spin_loop();
            }
        }
    }
}
