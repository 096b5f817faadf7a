// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Memory allocators. The engine allocates its persistent state up front from
//! an [`Arena`], and temporary memory from the thread-local [`scratch`]
//! arenas.

mod arena;
pub mod scratch;

pub use arena::{Arena, ARENA_BLOCK_ALIGNMENT};
pub use scratch::{with_scratch, with_scratch_excluding};
