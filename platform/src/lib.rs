// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! This crate contains the low-level, allocation-free parts of the engine's
//! multithreading: the [`Fence`] completion counter and the bounded lock-free
//! [`queue`] the thread pool and the IO thread are built on.
//!
//! Nothing here allocates memory. The queues are created "from parts," i.e.
//! from memory handed in by the caller, which in practice is the engine's
//! persistent arena.
//!
//! This is split off of the main engine crate so that the shared-memory
//! protocols can be tested and compiled independently of the allocator and
//! thread management policies built on top of them.

#![warn(missing_docs)]

mod fence;
pub mod queue;

pub use fence::Fence;
pub use queue::SyncUnsafeCell;
