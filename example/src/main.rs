// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

mod cli;

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use bytemuck::{Pod, Zeroable};
use hurdygurdy::{
    allocators::{with_scratch, Arena, ARENA_BLOCK_ALIGNMENT},
    resources::{self, BinaryResource, ResourceStatus},
    EngineConfig, EngineContext, Fence,
};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
    depth: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
#[repr(C)]
struct Velocity {
    x: f32,
    y: f32,
}

fn main() -> anyhow::Result<()> {
    let opts = cli::options().run();
    tracing_subscriber::fmt()
        .with_max_level(opts.verbosity_level)
        .init();

    let mut config = match &opts.config_path {
        Some(path) => read_config(path)?,
        None => EngineConfig::DEFAULT,
    };
    if let Some(workers) = opts.worker_threads {
        config.worker_threads = Some(workers);
    }
    config.max_entities = config.max_entities.max(opts.entities);

    let arena_size = config.required_arena_size() + component_arena_size(config.max_entities);
    let persistent_arena: &'static Arena = Box::leak(Box::new(Arena::new(arena_size)));
    let mut context = EngineContext::new(persistent_arena, config);

    let loaded = load_files(&mut context, &opts.files);
    for (path, resource) in opts.files.iter().zip(&loaded) {
        match &resource.status {
            ResourceStatus::Loaded => info!("{}: {} bytes", path.display(), resource.bytes.len()),
            ResourceStatus::Failed(err) => warn!("{err}"),
            status => debug!("{}: {status:?}", path.display()),
        }
    }

    simulate(&mut context, opts.entities)?;
    context.shutdown();
    Ok(())
}

fn read_config(path: &Path) -> anyhow::Result<EngineConfig> {
    let config = fs::read_to_string(path).context("Failed to open the engine config file")?;
    serde_json::from_str(&config).context("Failed to parse the engine config file")
}

/// Upper bound for the arena memory used by the components of [`simulate`].
fn component_arena_size(max_entities: usize) -> usize {
    // Each component type has a sparse and a dense array of u32-sized entries.
    let per_entity = 4 * size_of::<u32>() + size_of::<Position>() + size_of::<Velocity>();
    max_entities * per_entity + 8 * ARENA_BLOCK_ALIGNMENT
}

/// Reads the files on the IO thread, helping out with thread pool tasks while
/// waiting.
fn load_files(context: &mut EngineContext, paths: &[PathBuf]) -> Vec<BinaryResource> {
    let all_loaded = Fence::new();
    let mut loaded: Vec<BinaryResource> = paths.iter().map(|_| BinaryResource::default()).collect();
    context.scope(|scope, _| {
        for (resource, path) in loaded.iter_mut().zip(paths) {
            resources::load(scope, &[&all_loaded], resource, path);
        }
        while !scope.help(&all_loaded, Duration::from_millis(100)) {
            debug!("waiting for {} files to load", all_loaded.outstanding());
        }
    });
    loaded
}

/// Spawns entities, updates their components on the thread pool, and sorts
/// them by depth.
fn simulate(context: &mut EngineContext, entity_count: usize) -> anyhow::Result<()> {
    let ecs = context.ecs_mut();
    ecs.register_component::<Position>(entity_count);
    ecs.register_component::<Velocity>(entity_count);

    let mut rng = 0x2545_f491_u32;
    for i in 0..entity_count {
        let entity = ecs.try_spawn().context("Ran out of entities to spawn")?;
        let (x, y) = (random_unit(&mut rng) * 100.0, random_unit(&mut rng) * 100.0);
        ecs.add(entity, Position { x, y, depth: 0.0 });
        if i % 2 == 0 {
            let velocity = Velocity {
                x: random_unit(&mut rng) - 0.5,
                y: random_unit(&mut rng) - 0.5,
            };
            ecs.add(entity, velocity);
        }
    }

    let depths_computed = Fence::new();
    context.scope(|scope, ecs| {
        for position in ecs.components_mut::<Position>() {
            scope.push(&[&depths_computed], position, |p| {
                p.depth = (p.x * p.x + p.y * p.y).sqrt();
            });
        }
    });
    debug_assert!(depths_computed.is_complete());

    let ecs = context.ecs_mut();
    ecs.for_each_pair::<Position, Velocity, _>(|_, position, velocity| {
        position.x += velocity.x;
        position.y += velocity.y;
    });

    ecs.sort::<Position, _>(|a, b| a.depth.total_cmp(&b.depth));
    let sorted = (ecs.components::<Position>().windows(2)).all(|pair| pair[0].depth <= pair[1].depth);
    anyhow::ensure!(sorted, "positions were not sorted by depth");

    with_scratch(|scratch| {
        let entities = ecs.entities::<Position>();
        let nearest = scratch.alloc_slice_fill_with(entities.len().min(5), |i| entities[i]);
        info!("nearest entities: {nearest:?}");
    });

    let to_despawn: Vec<_> = ecs.entities::<Position>().iter().copied().step_by(3).collect();
    for entity in to_despawn {
        ecs.despawn(entity);
    }
    info!(
        "{} entities left, {} of them moving",
        ecs.live_count(),
        ecs.component_count::<Velocity>(),
    );

    ecs.reset();
    Ok(())
}

/// Xorshift, returning a number between 0 and 1.
fn random_unit(state: &mut u32) -> f32 {
    *state ^= *state << 13;
    *state ^= *state >> 17;
    *state ^= *state << 5;
    (*state >> 8) as f32 / (1 << 24) as f32
}

#[cfg(test)]
mod tests {
    use hurdygurdy::{allocators::Arena, EngineConfig, EngineContext};

    use super::{component_arena_size, simulate, Position, Velocity};

    #[test]
    fn simulation_runs_within_its_arena() {
        let config = EngineConfig {
            worker_threads: Some(2),
            task_queue_capacity: 64,
            io_queue_capacity: 4,
            max_entities: 200,
            ..EngineConfig::DEFAULT
        };
        let size = config.required_arena_size() + component_arena_size(config.max_entities);
        let arena: &'static Arena = Box::leak(Box::new(Arena::new(size)));
        let mut context = EngineContext::new(arena, config);

        simulate(&mut context, 200).unwrap();

        let ecs = context.ecs();
        assert_eq!(0, ecs.live_count());
        assert_eq!(0, ecs.component_count::<Position>());
        assert_eq!(0, ecs.component_count::<Velocity>());
    }
}
