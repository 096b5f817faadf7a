// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Thread-local arenas for temporary allocations.
//!
//! Each thread gets [`SCRATCH_ARENA_COUNT`] arenas of its own, created the
//! first time the thread uses them. Functions that need temporary memory wrap
//! their work in [`with_scratch`], which rewinds the arena when the closure
//! returns. If the caller already holds allocations from a scratch arena and
//! passes it in, [`with_scratch_excluding`] picks a different one, so the
//! caller's allocations don't get rewound under them.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::Arena;

/// The amount of scratch arenas per thread. Only this many scratch arenas can
/// be in use at once, so at most `SCRATCH_ARENA_COUNT - 1` arenas can be
/// excluded in [`with_scratch_excluding`].
pub const SCRATCH_ARENA_COUNT: usize = 2;

/// The capacity of scratch arenas, unless configured otherwise with
/// [`set_scratch_arena_capacity`].
pub const DEFAULT_SCRATCH_ARENA_CAPACITY: usize = 4 * 1024 * 1024;

static SCRATCH_ARENA_CAPACITY: AtomicUsize = AtomicUsize::new(DEFAULT_SCRATCH_ARENA_CAPACITY);

thread_local! {
    static SCRATCH_ARENAS: [Arena; SCRATCH_ARENA_COUNT] = {
        let capacity = scratch_arena_capacity();
        core::array::from_fn(|_| Arena::new(capacity))
    };
}

/// Sets the capacity of the scratch arenas created after this call. Threads
/// that have already used their scratch arenas keep their old ones.
pub fn set_scratch_arena_capacity(capacity: usize) {
    assert!(capacity > 0, "scratch arena capacity must be larger than zero");
    SCRATCH_ARENA_CAPACITY.store(capacity, Ordering::Relaxed);
}

/// Returns the capacity new scratch arenas are created with.
pub fn scratch_arena_capacity() -> usize {
    SCRATCH_ARENA_CAPACITY.load(Ordering::Relaxed)
}

/// Runs `f` with a [scope](Arena::scope) of this thread's default scratch
/// arena.
///
/// ### Panics
///
/// If the default scratch arena is already in use by an enclosing
/// [`with_scratch`] call. Pass that arena to [`with_scratch_excluding`]
/// instead, or keep using the arena you already have.
#[track_caller]
pub fn with_scratch<R, F: FnOnce(&Arena) -> R>(f: F) -> R {
    with_scratch_excluding(&[], f)
}

/// Runs `f` with a [scope](Arena::scope) of the first scratch arena on this
/// thread which doesn't share memory with any of the `conflicts`.
///
/// ### Panics
///
/// If every scratch arena is excluded.
#[track_caller]
pub fn with_scratch_excluding<R, F: FnOnce(&Arena) -> R>(conflicts: &[&Arena], f: F) -> R {
    SCRATCH_ARENAS.with(|arenas| {
        let Some(arena) = arenas
            .iter()
            .find(|arena| !conflicts.iter().any(|conflict| Arena::same_memory(arena, conflict)))
        else {
            panic!(
                "every scratch arena ({SCRATCH_ARENA_COUNT}) was excluded, cannot pick one that does not conflict",
            );
        };
        arena.scope(f)
    })
}
