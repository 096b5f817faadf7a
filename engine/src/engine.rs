// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::Deserialize;
use tracing::info;

use crate::{
    allocators::{scratch, Arena, ARENA_BLOCK_ALIGNMENT},
    ecs::Ecs,
    multithreading::{default_worker_count, task_scope, IoThread, Scope, ThreadPool},
};

/// Parameters for creating an [`EngineContext`].
///
/// Can be deserialized, e.g. from a configuration file. Missing fields are
/// set to their values in [`EngineConfig::DEFAULT`], unknown fields are an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Capacity of each thread's scratch arenas, in bytes.
    pub scratch_arena_size: usize,
    /// The amount of thread pool workers. If None, picked based on the
    /// available parallelism with [`default_worker_count`].
    pub worker_threads: Option<usize>,
    /// How many thread pool tasks can be queued at once.
    pub task_queue_capacity: usize,
    /// How many IO requests can be queued at once.
    pub io_queue_capacity: usize,
    /// The maximum amount of live entities in the ECS. Can be grown later
    /// with [`Ecs::resize_entities`].
    pub max_entities: usize,
}

impl EngineConfig {
    /// Reasonable defaults for small programs.
    pub const DEFAULT: EngineConfig = EngineConfig {
        scratch_arena_size: scratch::DEFAULT_SCRATCH_ARENA_CAPACITY,
        worker_threads: None,
        task_queue_capacity: 1024,
        io_queue_capacity: 256,
        max_entities: 4096,
    };

    /// The amount of worker threads the thread pool will be created with.
    pub fn worker_count(&self) -> usize {
        self.worker_threads.unwrap_or_else(default_worker_count)
    }

    /// Returns how many bytes of the persistent arena [`EngineContext::new`]
    /// will use. Components registered to the ECS afterwards need more.
    pub fn required_arena_size(&self) -> usize {
        ThreadPool::required_arena_size(self.task_queue_capacity)
            + IoThread::required_arena_size(self.io_queue_capacity)
            + self.max_entities * size_of::<u32>()
            + ARENA_BLOCK_ALIGNMENT
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::DEFAULT
    }
}

/// The threads and persistent state of the engine.
///
/// Owns the thread pool, the IO thread and the ECS, all allocated from the
/// persistent arena passed into [`EngineContext::new`].
pub struct EngineContext {
    persistent_arena: &'static Arena,
    config: EngineConfig,
    // Fields are dropped in declaration order, and the IO thread should shut
    // down before the thread pool it runs tasks from.
    io_thread: IoThread,
    thread_pool: ThreadPool,
    ecs: Ecs<'static>,
}

impl EngineContext {
    /// Creates a new engine context.
    ///
    /// Sets the scratch arena capacity, starts the thread pool and the IO
    /// thread, and creates the ECS. Needs at least
    /// [`EngineConfig::required_arena_size`] bytes left in the arena.
    ///
    /// ### Panics
    ///
    /// If the arena doesn't have enough memory left, or if the threads could
    /// not be spawned.
    #[track_caller]
    pub fn new(persistent_arena: &'static Arena, config: EngineConfig) -> EngineContext {
        let required = config.required_arena_size();
        let remaining = persistent_arena.remaining();
        scratch::set_scratch_arena_capacity(config.scratch_arena_size);

        let worker_count = config.worker_count();
        let Some(thread_pool) = ThreadPool::new(persistent_arena, worker_count, config.task_queue_capacity) else {
            panic!("persistent arena should have enough memory for the thread pool (needs about {required} bytes, has {remaining})");
        };
        let Some(io_thread) = IoThread::new(persistent_arena, config.io_queue_capacity, &thread_pool) else {
            panic!("persistent arena should have enough memory for the IO thread (needs about {required} bytes, has {remaining})");
        };
        let Some(ecs) = Ecs::new(persistent_arena, config.max_entities) else {
            panic!("persistent arena should have enough memory for the entity pool (needs about {required} bytes, has {remaining})");
        };

        info!(
            "engine initialized with {worker_count} workers, using {} of {} bytes of the persistent arena",
            persistent_arena.allocated(),
            persistent_arena.capacity(),
        );

        EngineContext {
            persistent_arena,
            config,
            io_thread,
            thread_pool,
            ecs,
        }
    }

    /// The config this context was created with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The arena the context's persistent state is allocated from.
    pub fn persistent_arena(&self) -> &'static Arena {
        self.persistent_arena
    }

    /// The thread pool.
    pub fn thread_pool(&self) -> &ThreadPool {
        &self.thread_pool
    }

    /// The IO thread.
    pub fn io_thread(&self) -> &IoThread {
        &self.io_thread
    }

    /// The entities and components of the engine.
    pub fn ecs(&self) -> &Ecs<'static> {
        &self.ecs
    }

    /// The entities and components of the engine, mutably.
    pub fn ecs_mut(&mut self) -> &mut Ecs<'static> {
        &mut self.ecs
    }

    /// Runs `f` in a [`task_scope`] over the thread pool and the IO thread.
    /// The ECS is passed in alongside the scope, so that its components can
    /// be borrowed by the scope's tasks.
    pub fn scope<'env, F, T>(&'env mut self, f: F) -> T
    where
        F: for<'scope> FnOnce(&'scope Scope<'scope, 'env>, &'env mut Ecs<'static>) -> T,
    {
        let EngineContext {
            io_thread,
            thread_pool,
            ecs,
            ..
        } = self;
        task_scope(thread_pool, Some(&*io_thread), move |scope| f(scope, ecs))
    }

    /// Shuts down the IO thread and the thread pool, joining all of their
    /// threads. Same as dropping the context.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        info!("shutting down the engine");
    }
}
