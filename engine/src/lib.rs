// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The concurrency and data core of the HurdyGurdy engine.
//!
//! - [`allocators`]: the [`Arena`] bump allocator every other part of the
//!   engine allocates its persistent memory from, and per-thread scratch
//!   arenas for temporary allocations.
//! - [`collections`]: bounded lock-free queues allocated from an arena.
//! - [`multithreading`]: the thread pool, the IO thread, and scoped task
//!   submission tracked with [`Fence`]s.
//! - [`resources`]: loading and storing files on the IO thread.
//! - [`ecs`]: sparse set entity-component storage.
//!
//! [`EngineContext`] ties these together, creating all of the above out of a
//! single persistent arena according to an [`EngineConfig`].
//!
//! ### Example
//!
//! ```
//! use hurdygurdy::{allocators::Arena, EngineConfig, EngineContext};
//!
//! let config = EngineConfig { worker_threads: Some(1), ..EngineConfig::DEFAULT };
//! let arena: &'static Arena = Box::leak(Box::new(Arena::new(config.required_arena_size())));
//! let context = EngineContext::new(arena, config);
//! assert_eq!(1, context.thread_pool().thread_count());
//! context.shutdown();
//! ```

#![warn(missing_docs)]

pub mod allocators;
pub mod collections;
pub mod ecs;
mod engine;
pub mod multithreading;
pub mod resources;

pub use allocators::Arena;
pub use engine::{EngineConfig, EngineContext};
pub use platform::Fence;
