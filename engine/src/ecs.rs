// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Sparse set entity-component storage.
//!
//! Entities are plain indices, recycled through a free list. Each component
//! type registered with an [`Ecs`] gets a sparse array (entity to dense index),
//! a dense array of the entities that have the component, and a packed array
//! of the components themselves, all allocated from the arena the [`Ecs`] was
//! created with. Adding, removing and looking up components are O(1), and the
//! packed arrays can be iterated through (and sorted) without any holes.
//!
//! Components are [`Pod`] types, or raw bytes of a fixed size for component
//! types only known at runtime. The [`Ecs`] is not synchronized, it's meant to
//! be used from one thread.

mod component;

use core::{
    any::TypeId,
    cmp::Ordering,
    fmt::{self, Debug, Display},
    mem,
};

use bytemuck::{Pod, Zeroable};

use crate::allocators::Arena;

use component::{ComponentStore, NONE};

pub use component::{assigned_component_ids, component_id, dynamic_component_id, ComponentId};

/// Handle to an entity in an [`Ecs`]. Despawned entities' handles are reused
/// by later spawns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Zeroable, Pod)]
#[repr(transparent)]
pub struct Entity(pub(crate) u32);

impl Entity {
    /// The index of the entity, less than the [`Ecs::entity_capacity`] of the
    /// [`Ecs`] it was spawned from.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity {}", self.0)
    }
}

/// Entity and component storage. See the [module documentation](self).
///
/// ### Example
///
/// ```
/// use hurdygurdy::{allocators::Arena, ecs::Ecs};
///
/// let arena = Arena::new(64 * 1024);
/// let mut ecs = Ecs::new(&arena, 16).unwrap();
/// ecs.register_component::<u32>(16);
///
/// let entity = ecs.spawn();
/// ecs.add(entity, 5u32);
/// assert_eq!(5, *ecs.get::<u32>(entity));
///
/// ecs.despawn(entity);
/// assert!(!ecs.has::<u32>(entity));
/// ```
pub struct Ecs<'a> {
    arena: &'a Arena,
    /// A live entity's slot contains its own index, a free slot contains the
    /// index of the next free slot. The free list ends at the capacity.
    entity_pool: &'a mut [u32],
    next_entity: u32,
    live_count: usize,
    /// Indexed by [`ComponentId::index`].
    stores: Vec<Option<ComponentStore<'a>>>,
}

impl Debug for Ecs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ecs")
            .field("entity_capacity", &self.entity_capacity())
            .field("live_count", &self.live_count)
            .field("registered_components", &self.stores.iter().flatten().count())
            .finish_non_exhaustive()
    }
}

impl<'a> Ecs<'a> {
    /// Creates an [`Ecs`] with room for `max_entities` entities, allocating
    /// the entity pool from the arena.
    ///
    /// Returns None if the arena doesn't have enough memory left.
    ///
    /// ### Panics
    ///
    /// If `max_entities` doesn't fit in an entity index.
    #[track_caller]
    pub fn new(arena: &'a Arena, max_entities: usize) -> Option<Ecs<'a>> {
        assert_entity_capacity(max_entities);
        let entity_pool = arena.try_alloc_slice_fill_with(max_entities, |i| i as u32 + 1)?;
        let mut stores = Vec::new();
        stores.resize_with(assigned_component_ids(), || None);
        Some(Ecs {
            arena,
            entity_pool,
            next_entity: 0,
            live_count: 0,
            stores,
        })
    }

    /// The maximum amount of entities alive at once.
    pub fn entity_capacity(&self) -> usize {
        self.entity_pool.len()
    }

    /// The amount of entities alive.
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Spawns a new entity, reusing a despawned entity's index if possible.
    ///
    /// ### Panics
    ///
    /// If there are [`Ecs::entity_capacity`] entities alive already.
    #[track_caller]
    pub fn spawn(&mut self) -> Entity {
        match self.try_spawn() {
            Some(entity) => entity,
            None => panic!("cannot spawn more than {} entities", self.entity_capacity()),
        }
    }

    /// Spawns a new entity, or returns None if the entity pool is exhausted.
    pub fn try_spawn(&mut self) -> Option<Entity> {
        let index = self.next_entity as usize;
        let next_free = *self.entity_pool.get(index)?;
        self.next_entity = next_free;
        self.entity_pool[index] = index as u32;
        self.live_count += 1;
        Some(Entity(index as u32))
    }

    /// Returns true if the entity has been spawned and not despawned.
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entity_pool.get(entity.index()) == Some(&entity.0)
    }

    /// Removes every component of the entity, and frees it for reuse.
    ///
    /// ### Panics
    ///
    /// If the entity isn't alive.
    #[track_caller]
    pub fn despawn(&mut self, entity: Entity) {
        assert!(self.is_alive(entity), "cannot despawn {entity}, it is not alive");
        for store in self.stores.iter_mut().flatten() {
            if store.dense_index(entity).is_some() {
                store.swap_remove(entity);
            }
        }
        self.entity_pool[entity.index()] = self.next_entity;
        self.next_entity = entity.0;
        self.live_count -= 1;
    }

    /// Registers the component type `C`, with room for `max_components`
    /// components.
    ///
    /// ### Panics
    ///
    /// If `C` is already registered or zero-sized, or if the arena runs out of
    /// memory.
    #[track_caller]
    pub fn register_component<C: Pod>(&mut self, max_components: usize) {
        let id = component_id::<C>();
        self.register_store(id, Some(TypeId::of::<C>()), max_components, size_of::<C>(), align_of::<C>());
    }

    /// Registers a component type only known at runtime, with room for
    /// `max_components` components of `size` bytes, aligned to `align`.
    ///
    /// ### Panics
    ///
    /// If the id is already registered, if `size` is zero or not a multiple
    /// of `align`, or if the arena runs out of memory.
    #[track_caller]
    pub fn register_component_raw(&mut self, id: ComponentId, max_components: usize, size: usize, align: usize) {
        self.register_store(id, None, max_components, size, align);
    }

    #[track_caller]
    fn register_store(
        &mut self,
        id: ComponentId,
        type_id: Option<TypeId>,
        max_components: usize,
        size: usize,
        align: usize,
    ) {
        assert!(size > 0, "zero-sized components are not supported (component {id})");
        assert!(
            align.is_power_of_two() && size % align == 0,
            "component {id} size ({size}) must be a multiple of its alignment ({align})",
        );
        if self.stores.len() <= id.index() {
            self.stores.resize_with(id.index() + 1, || None);
        }
        assert!(
            self.stores[id.index()].is_none(),
            "component {id} is already registered",
        );
        let store = ComponentStore::new(
            self.arena,
            type_id,
            self.entity_capacity(),
            max_components,
            size,
            align,
        );
        self.stores[id.index()] = Some(store);
    }

    /// Unregisters the component type `C`. Its memory is not reclaimed until
    /// the arena is reset.
    ///
    /// ### Panics
    ///
    /// If `C` is not registered.
    #[track_caller]
    pub fn unregister_component<C: Pod>(&mut self) {
        self.unregister_component_raw(component_id::<C>());
    }

    /// Unregisters the component type. Using the id afterwards (until it's
    /// registered again) panics.
    #[track_caller]
    pub fn unregister_component_raw(&mut self, id: ComponentId) {
        let slot = self.stores.get_mut(id.index());
        match slot {
            Some(store @ Some(_)) => *store = None,
            _ => panic!("component {id} is not registered"),
        }
    }

    /// Returns true if the component type `C` is registered.
    pub fn is_registered<C: Pod>(&self) -> bool {
        self.is_registered_raw(component_id::<C>())
    }

    /// Returns true if the component type is registered.
    pub fn is_registered_raw(&self, id: ComponentId) -> bool {
        matches!(self.stores.get(id.index()), Some(Some(_)))
    }

    /// Returns true if the entity has a `C` component.
    #[track_caller]
    pub fn has<C: Pod>(&self, entity: Entity) -> bool {
        self.typed_store::<C>().dense_index(entity).is_some()
    }

    /// Returns true if the entity has the component.
    #[track_caller]
    pub fn has_raw(&self, entity: Entity, id: ComponentId) -> bool {
        self.store(id).dense_index(entity).is_some()
    }

    /// Adds the component to the entity, and returns a borrow of the stored
    /// component.
    ///
    /// ### Panics
    ///
    /// If the entity isn't alive or already has a `C`, or if there are
    /// already as many `C`s as it was registered with room for.
    #[track_caller]
    pub fn add<C: Pod>(&mut self, entity: Entity, component: C) -> &mut C {
        assert!(self.is_alive(entity), "cannot add components to {entity}, it is not alive");
        let bytes = self.typed_store_mut::<C>().push(entity, bytemuck::bytes_of(&component));
        bytemuck::from_bytes_mut(bytes)
    }

    /// Adds the component bytes to the entity, and returns a borrow of the
    /// stored bytes. See [`Ecs::add`].
    #[track_caller]
    pub fn add_raw(&mut self, entity: Entity, id: ComponentId, component: &[u8]) -> &mut [u8] {
        assert!(self.is_alive(entity), "cannot add components to {entity}, it is not alive");
        self.store_mut(id).push(entity, component)
    }

    /// Removes the entity's `C` component. The last component in the packed
    /// array is moved in its place, so the order of the components changes.
    ///
    /// ### Panics
    ///
    /// If the entity doesn't have a `C`.
    #[track_caller]
    pub fn remove<C: Pod>(&mut self, entity: Entity) {
        self.typed_store_mut::<C>().swap_remove(entity);
    }

    /// Removes the entity's component. See [`Ecs::remove`].
    #[track_caller]
    pub fn remove_raw(&mut self, entity: Entity, id: ComponentId) {
        self.store_mut(id).swap_remove(entity);
    }

    /// Returns the entity's `C` component.
    ///
    /// ### Panics
    ///
    /// If the entity doesn't have a `C`.
    #[track_caller]
    pub fn get<C: Pod>(&self, entity: Entity) -> &C {
        let store = self.typed_store::<C>();
        let Some(index) = store.dense_index(entity) else {
            panic!("{entity} does not have the component");
        };
        bytemuck::from_bytes(store.component(index))
    }

    /// Returns the entity's `C` component, mutably. See [`Ecs::get`].
    #[track_caller]
    pub fn get_mut<C: Pod>(&mut self, entity: Entity) -> &mut C {
        let store = self.typed_store_mut::<C>();
        let Some(index) = store.dense_index(entity) else {
            panic!("{entity} does not have the component");
        };
        bytemuck::from_bytes_mut(store.component_mut(index))
    }

    /// Returns the bytes of the entity's component. See [`Ecs::get`].
    #[track_caller]
    pub fn get_raw(&self, entity: Entity, id: ComponentId) -> &[u8] {
        let store = self.store(id);
        let Some(index) = store.dense_index(entity) else {
            panic!("{entity} does not have component {id}");
        };
        store.component(index)
    }

    /// Returns the bytes of the entity's component, mutably. See
    /// [`Ecs::get`].
    #[track_caller]
    pub fn get_mut_raw(&mut self, entity: Entity, id: ComponentId) -> &mut [u8] {
        let store = self.store_mut(id);
        let Some(index) = store.dense_index(entity) else {
            panic!("{entity} does not have component {id}");
        };
        store.component_mut(index)
    }

    /// Sorts the `C` components (and the entities in [`Ecs::entities`]) in
    /// place, in the order defined by `cmp`. The sort is not stable.
    #[track_caller]
    pub fn sort<C: Pod, F: FnMut(&C, &C) -> Ordering>(&mut self, mut cmp: F) {
        self.typed_store_mut::<C>()
            .sort_by(&mut |a, b| cmp(bytemuck::from_bytes(a), bytemuck::from_bytes(b)));
    }

    /// Sorts the components in place, comparing their bytes with `cmp`. See
    /// [`Ecs::sort`].
    #[track_caller]
    pub fn sort_raw<F: FnMut(&[u8], &[u8]) -> Ordering>(&mut self, id: ComponentId, mut cmp: F) {
        self.store_mut(id).sort_by(&mut cmp);
    }

    /// Swaps the `C` components at the two indices of the packed array.
    #[track_caller]
    pub fn swap_dense<C: Pod>(&mut self, index_a: usize, index_b: usize) {
        self.typed_store_mut::<C>().swap(index_a, index_b);
    }

    /// Swaps the positions of the two entities' `C` components in the packed
    /// array.
    ///
    /// ### Panics
    ///
    /// If either of the entities doesn't have a `C`.
    #[track_caller]
    pub fn swap_entities<C: Pod>(&mut self, entity_a: Entity, entity_b: Entity) {
        let store = self.typed_store_mut::<C>();
        let (Some(a), Some(b)) = (store.dense_index(entity_a), store.dense_index(entity_b)) else {
            panic!("both {entity_a} and {entity_b} need to have the component to be swapped");
        };
        store.swap(a, b);
    }

    /// Removes every component from every entity and despawns all entities,
    /// without reallocating anything.
    pub fn reset(&mut self) {
        for store in self.stores.iter_mut().flatten() {
            store.clear();
        }
        for (i, slot) in self.entity_pool.iter_mut().enumerate() {
            *slot = i as u32 + 1;
        }
        self.next_entity = 0;
        self.live_count = 0;
    }

    /// Grows the entity pool and every registered component's sparse array to
    /// `new_max` entities. Existing entities and components stay as they are.
    ///
    /// ### Panics
    ///
    /// If `new_max` is smaller than the current capacity, or if the arena runs
    /// out of memory.
    #[track_caller]
    pub fn resize_entities(&mut self, new_max: usize) {
        let old_max = self.entity_capacity();
        assert!(
            new_max >= old_max,
            "the entity capacity can't be shrunk (from {old_max} to {new_max})",
        );
        assert_entity_capacity(new_max);
        let arena = self.arena;

        // The end of the free list is the old capacity, which is the first new
        // slot, so the free list continues through the new slots.
        let entity_pool = arena.realloc_slice(mem::take(&mut self.entity_pool), new_max);
        for (i, slot) in entity_pool.iter_mut().enumerate().skip(old_max) {
            *slot = i as u32 + 1;
        }
        self.entity_pool = entity_pool;

        for store in self.stores.iter_mut().flatten() {
            store.resize_sparse(arena, new_max);
        }
    }

    /// The entities with a `C` component, in the same order as
    /// [`Ecs::components`].
    #[track_caller]
    pub fn entities<C: Pod>(&self) -> &[Entity] {
        let store = self.typed_store::<C>();
        &store.dense[..store.len]
    }

    /// The entities with the component, in the same order as the packed
    /// component array.
    #[track_caller]
    pub fn entities_raw(&self, id: ComponentId) -> &[Entity] {
        let store = self.store(id);
        &store.dense[..store.len]
    }

    /// All the `C` components, tightly packed.
    #[track_caller]
    pub fn components<C: Pod>(&self) -> &[C] {
        bytemuck::cast_slice(self.typed_store::<C>().packed())
    }

    /// All the `C` components, tightly packed, mutably.
    #[track_caller]
    pub fn components_mut<C: Pod>(&mut self) -> &mut [C] {
        bytemuck::cast_slice_mut(self.typed_store_mut::<C>().packed_mut())
    }

    /// All the component bytes, tightly packed.
    #[track_caller]
    pub fn components_raw(&self, id: ComponentId) -> &[u8] {
        self.store(id).packed()
    }

    /// Iterates through the entities with a `C` component, and the
    /// components.
    #[track_caller]
    pub fn iter<C: Pod>(&self) -> impl Iterator<Item = (Entity, &C)> + '_ {
        self.entities::<C>().iter().copied().zip(self.components::<C>())
    }

    /// Calls `f` for each entity with a `C` component.
    #[track_caller]
    pub fn for_each<C: Pod, F: FnMut(Entity, &mut C)>(&mut self, mut f: F) {
        let store = self.typed_store_mut::<C>();
        let len = store.len;
        let components: &mut [C] = bytemuck::cast_slice_mut(&mut store.components[..len * store.size]);
        for (entity, component) in store.dense[..len].iter().zip(components) {
            f(*entity, component);
        }
    }

    /// Calls `f` for each entity with both an `A` and a `B` component, in the
    /// order of the `A` components.
    ///
    /// ### Panics
    ///
    /// If `A` and `B` are the same type.
    #[track_caller]
    pub fn for_each_pair<A: Pod, B: Pod, F: FnMut(Entity, &mut A, &mut B)>(&mut self, mut f: F) {
        let (id_a, id_b) = (component_id::<A>(), component_id::<B>());
        assert_ne!(id_a, id_b, "for_each_pair needs two different component types");
        self.typed_store::<A>();
        self.typed_store::<B>();

        let (low, high) = self.stores.split_at_mut(id_a.index().max(id_b.index()));
        let (store_a, store_b) = if id_a < id_b {
            (&mut low[id_a.index()], &mut high[0])
        } else {
            (&mut high[0], &mut low[id_b.index()])
        };
        let (Some(store_a), Some(store_b)) = (store_a, store_b) else {
            unreachable!("both stores were checked to be registered above");
        };

        for dense_a in 0..store_a.len {
            let entity = store_a.dense[dense_a];
            let Some(dense_b) = store_b.dense_index(entity) else {
                continue;
            };
            let a = bytemuck::from_bytes_mut(store_a.component_mut(dense_a));
            let b = bytemuck::from_bytes_mut(store_b.component_mut(dense_b));
            f(entity, a, b);
        }
    }

    /// The amount of `C` components.
    #[track_caller]
    pub fn component_count<C: Pod>(&self) -> usize {
        self.typed_store::<C>().len
    }

    /// The index of the entity's `C` component in [`Ecs::components`], if it
    /// has one.
    #[track_caller]
    pub fn dense_index<C: Pod>(&self, entity: Entity) -> Option<usize> {
        self.typed_store::<C>().dense_index(entity)
    }

    #[track_caller]
    fn store(&self, id: ComponentId) -> &ComponentStore<'a> {
        match self.stores.get(id.index()) {
            Some(Some(store)) => store,
            _ => panic!("component {id} is not registered"),
        }
    }

    #[track_caller]
    fn store_mut(&mut self, id: ComponentId) -> &mut ComponentStore<'a> {
        match self.stores.get_mut(id.index()) {
            Some(Some(store)) => store,
            _ => panic!("component {id} is not registered"),
        }
    }

    #[track_caller]
    fn typed_store<C: Pod>(&self) -> &ComponentStore<'a> {
        let store = self.store(component_id::<C>());
        check_store_type::<C>(store);
        store
    }

    #[track_caller]
    fn typed_store_mut<C: Pod>(&mut self) -> &mut ComponentStore<'a> {
        let store = self.store_mut(component_id::<C>());
        check_store_type::<C>(store);
        store
    }

    /// Checks the sparse/dense invariant of every registered component.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.stores.iter().flatten().all(|store| store.is_consistent())
    }
}

#[track_caller]
fn check_store_type<C: Pod>(store: &ComponentStore) {
    if store.type_id.is_some_and(|type_id| type_id != TypeId::of::<C>())
        || store.size != size_of::<C>()
        || store.align < align_of::<C>()
    {
        panic!(
            "component store does not contain {}s",
            core::any::type_name::<C>(),
        );
    }
}

#[track_caller]
fn assert_entity_capacity(max_entities: usize) {
    assert!(
        max_entities < NONE as usize,
        "entity capacity {max_entities} is too large, the maximum is {}",
        NONE - 1,
    );
}

#[cfg(test)]
mod tests {
    use bytemuck::{Pod, Zeroable};
    use proptest::prelude::*;

    use super::{component_id, dynamic_component_id, Ecs, Entity};
    use crate::allocators::Arena;

    #[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
    #[repr(C)]
    struct Position {
        x: i32,
        y: i32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
    #[repr(C)]
    struct Velocity {
        x: i32,
        y: i32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
    #[repr(transparent)]
    struct Value(i32);

    #[test]
    #[should_panic(expected = "component store does not contain")]
    fn typed_access_to_an_underaligned_raw_store_panics() {
        let arena = Arena::new(4096);
        let mut ecs = Ecs::new(&arena, 4).unwrap();
        ecs.register_component_raw(component_id::<Value>(), 4, size_of::<Value>(), 1);
        let entity = ecs.spawn();
        ecs.has::<Value>(entity);
    }

    #[test]
    fn entity_lifecycle_reuses_despawned_ids() {
        let arena = Arena::new(4096);
        let mut ecs = Ecs::new(&arena, 4).unwrap();
        let entities = [ecs.spawn(), ecs.spawn(), ecs.spawn(), ecs.spawn()];
        assert_eq!([Entity(0), Entity(1), Entity(2), Entity(3)], entities);
        assert_eq!(None, ecs.try_spawn());
        ecs.despawn(Entity(2));
        assert!(!ecs.is_alive(Entity(2)));
        assert_eq!(3, ecs.live_count());
        assert_eq!(Entity(2), ecs.spawn());
        assert_eq!(4, ecs.live_count());
    }

    #[test]
    #[should_panic(expected = "cannot spawn more than 4 entities")]
    fn spawning_past_capacity_panics() {
        let arena = Arena::new(4096);
        let mut ecs = Ecs::new(&arena, 4).unwrap();
        for _ in 0..5 {
            ecs.spawn();
        }
    }

    #[test]
    fn components_round_trip() {
        let arena = Arena::new(64 * 1024);
        let mut ecs = Ecs::new(&arena, 8).unwrap();
        ecs.register_component::<Position>(8);
        ecs.register_component::<Velocity>(4);

        let a = ecs.spawn();
        let b = ecs.spawn();
        ecs.add(a, Position { x: 1, y: 2 });
        ecs.add(b, Position { x: 3, y: 4 });
        ecs.add(b, Velocity { x: -1, y: 0 });

        assert_eq!(Position { x: 1, y: 2 }, *ecs.get::<Position>(a));
        assert!(!ecs.has::<Velocity>(a));
        ecs.get_mut::<Position>(b).x = 30;
        assert_eq!(30, ecs.get::<Position>(b).x);

        ecs.remove::<Position>(a);
        assert!(!ecs.has::<Position>(a));
        assert_eq!(&[b], ecs.entities::<Position>());

        ecs.despawn(b);
        assert!(!ecs.has::<Position>(b));
        assert!(!ecs.has::<Velocity>(b));
        assert_eq!(0, ecs.component_count::<Velocity>());
        assert!(ecs.is_consistent());
    }

    #[test]
    fn sort_orders_components_and_keeps_entities_attached() {
        let arena = Arena::new(64 * 1024);
        let mut ecs = Ecs::new(&arena, 8).unwrap();
        ecs.register_component::<Value>(8);
        let values = [5, 1, 4, 2, 3];
        let entities = values.map(|v| {
            let entity = ecs.spawn();
            ecs.add(entity, Value(v));
            entity
        });

        ecs.sort::<Value, _>(|a, b| a.0.cmp(&b.0));

        let sorted: Vec<i32> = ecs.components::<Value>().iter().map(|v| v.0).collect();
        assert_eq!(vec![1, 2, 3, 4, 5], sorted);
        for (entity, value) in entities.iter().zip(values) {
            assert_eq!(Value(value), *ecs.get::<Value>(*entity));
        }
        assert!(ecs.is_consistent());
    }

    #[test]
    fn swaps_keep_sparse_and_dense_in_sync() {
        let arena = Arena::new(64 * 1024);
        let mut ecs = Ecs::new(&arena, 4).unwrap();
        ecs.register_component::<Value>(4);
        let a = ecs.spawn();
        let b = ecs.spawn();
        ecs.add(a, Value(10));
        ecs.add(b, Value(20));

        ecs.swap_entities::<Value>(a, b);
        assert_eq!(&[b, a], ecs.entities::<Value>());
        assert_eq!(Some(1), ecs.dense_index::<Value>(a));
        ecs.swap_dense::<Value>(0, 1);
        assert_eq!(&[Value(10), Value(20)], ecs.components::<Value>());
        assert!(ecs.is_consistent());
    }

    #[test]
    fn iteration_visits_pairs() {
        let arena = Arena::new(64 * 1024);
        let mut ecs = Ecs::new(&arena, 8).unwrap();
        ecs.register_component::<Position>(8);
        ecs.register_component::<Velocity>(8);
        for i in 0..6 {
            let entity = ecs.spawn();
            ecs.add(entity, Position { x: i, y: 0 });
            if i % 2 == 0 {
                ecs.add(entity, Velocity { x: 1, y: 1 });
            }
        }

        let mut moved = 0;
        ecs.for_each_pair::<Position, Velocity, _>(|_, pos, vel| {
            pos.x += vel.x;
            pos.y += vel.y;
            moved += 1;
        });
        assert_eq!(3, moved);

        // Reversed order of the ids hits the other split_at_mut branch.
        ecs.for_each_pair::<Velocity, Position, _>(|_, vel, pos| {
            assert_eq!(1, pos.y);
            vel.x = 0;
        });

        ecs.for_each::<Velocity, _>(|_, vel| assert_eq!(0, vel.x));
        let odd_positions = ecs.iter::<Position>().filter(|(_, pos)| pos.y == 0).count();
        assert_eq!(3, odd_positions);
    }

    #[test]
    fn raw_components() {
        let arena = Arena::new(64 * 1024);
        let mut ecs = Ecs::new(&arena, 4).unwrap();
        let id = dynamic_component_id();
        ecs.register_component_raw(id, 4, 3, 1);
        let e = ecs.spawn();
        ecs.add_raw(e, id, &[1, 2, 3]);
        assert!(ecs.has_raw(e, id));
        ecs.get_mut_raw(e, id)[0] = 9;
        assert_eq!(&[9, 2, 3], ecs.get_raw(e, id));

        let f = ecs.spawn();
        ecs.add_raw(f, id, &[0, 0, 0]);
        ecs.sort_raw(id, |a, b| a.cmp(b));
        assert_eq!(&[f, e], ecs.entities_raw(id));
        assert_eq!(&[0, 0, 0, 9, 2, 3], ecs.components_raw(id));

        ecs.remove_raw(e, id);
        ecs.unregister_component_raw(id);
        assert!(!ecs.is_registered_raw(id));
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn querying_unregistered_component_panics() {
        let arena = Arena::new(64 * 1024);
        let mut ecs = Ecs::new(&arena, 4).unwrap();
        ecs.register_component::<Velocity>(4);
        ecs.unregister_component::<Velocity>();
        let e = ecs.spawn();
        ecs.has::<Velocity>(e);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_registration_panics() {
        let arena = Arena::new(64 * 1024);
        let mut ecs = Ecs::new(&arena, 4).unwrap();
        ecs.register_component::<Position>(4);
        ecs.register_component::<Position>(4);
    }

    #[test]
    #[should_panic(expected = "zero-sized components")]
    fn zero_sized_components_panic() {
        let arena = Arena::new(64 * 1024);
        let mut ecs = Ecs::new(&arena, 4).unwrap();
        ecs.register_component_raw(dynamic_component_id(), 4, 0, 1);
    }

    #[test]
    fn reset_and_resize() {
        let arena = Arena::new(64 * 1024);
        let mut ecs = Ecs::new(&arena, 2).unwrap();
        ecs.register_component::<Value>(8);
        let a = ecs.spawn();
        let b = ecs.spawn();
        ecs.add(a, Value(1));
        ecs.despawn(a);

        ecs.resize_entities(5);
        assert_eq!(5, ecs.entity_capacity());
        assert!(ecs.is_alive(b));
        assert!(!ecs.has::<Value>(a));
        // The despawned slot first, then the new slots.
        let spawned: Vec<Entity> = (0..4).map(|_| ecs.spawn()).collect();
        assert_eq!(vec![Entity(0), Entity(2), Entity(3), Entity(4)], spawned);
        for entity in &spawned {
            ecs.add(*entity, Value(entity.0 as i32));
        }
        assert!(ecs.is_consistent());

        ecs.reset();
        assert_eq!(0, ecs.live_count());
        assert_eq!(0, ecs.component_count::<Value>());
        assert_eq!(Entity(0), ecs.spawn());
        assert!(!ecs.has::<Value>(Entity(0)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Spawn,
        Despawn(usize),
        Add(usize, i32),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Spawn),
            (0usize..16).prop_map(Op::Despawn),
            ((0usize..16), any::<i32>()).prop_map(|(i, v)| Op::Add(i, v)),
            (0usize..16).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn random_operations_keep_the_ecs_consistent(ops in prop::collection::vec(op(), 1..200)) {
            let arena = Arena::new(64 * 1024);
            let mut ecs = Ecs::new(&arena, 16).unwrap();
            ecs.register_component::<Value>(16);
            let mut expected: Vec<Option<i32>> = vec![None; 16];
            let mut alive = vec![false; 16];

            for op in ops {
                match op {
                    Op::Spawn => {
                        if let Some(entity) = ecs.try_spawn() {
                            prop_assert!(!alive[entity.index()]);
                            alive[entity.index()] = true;
                        }
                    }
                    Op::Despawn(i) if alive[i] => {
                        ecs.despawn(Entity(i as u32));
                        alive[i] = false;
                        expected[i] = None;
                    }
                    Op::Add(i, v) if alive[i] && expected[i].is_none() => {
                        ecs.add(Entity(i as u32), Value(v));
                        expected[i] = Some(v);
                    }
                    Op::Remove(i) if expected[i].is_some() => {
                        ecs.remove::<Value>(Entity(i as u32));
                        expected[i] = None;
                    }
                    _ => {}
                }

                prop_assert!(ecs.is_consistent());
                for (i, value) in expected.iter().enumerate() {
                    let entity = Entity(i as u32);
                    prop_assert_eq!(alive[i], ecs.is_alive(entity));
                    match value {
                        Some(v) => {
                            prop_assert_eq!(Value(*v), *ecs.get::<Value>(entity));
                        }
                        None => {
                            prop_assert!(!ecs.has::<Value>(entity));
                        }
                    }
                }
            }
        }
    }
}
