// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    any::TypeId,
    cmp::Ordering,
    fmt::{self, Debug, Display},
};
use std::{
    collections::HashMap,
    sync::{OnceLock, PoisonError, RwLock},
};

use super::Entity;
use crate::allocators::Arena;

/// Identifier of a component type, assigned once per process by
/// [`component_id`] or [`dynamic_component_id`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId(u32);

impl ComponentId {
    /// The id as an index into per-component tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct ComponentIdRegistry {
    next_id: u32,
    by_type: HashMap<TypeId, ComponentId>,
}

impl ComponentIdRegistry {
    fn alloc_id(&mut self) -> ComponentId {
        let id = ComponentId(self.next_id);
        let Some(next_id) = self.next_id.checked_add(1) else {
            panic!("ran out of component ids");
        };
        self.next_id = next_id;
        id
    }
}

static REGISTRY: OnceLock<RwLock<ComponentIdRegistry>> = OnceLock::new();

fn registry() -> &'static RwLock<ComponentIdRegistry> {
    REGISTRY.get_or_init(|| {
        RwLock::new(ComponentIdRegistry {
            next_id: 0,
            by_type: HashMap::new(),
        })
    })
}

/// Returns the id of the component type `C`, assigning the next free id to it
/// the first time the type is seen.
pub fn component_id<C: 'static>() -> ComponentId {
    let type_id = TypeId::of::<C>();
    {
        let registry = registry().read().unwrap_or_else(PoisonError::into_inner);
        if let Some(&id) = registry.by_type.get(&type_id) {
            return id;
        }
    }
    let mut registry = registry().write().unwrap_or_else(PoisonError::into_inner);
    if let Some(&id) = registry.by_type.get(&type_id) {
        return id;
    }
    let id = registry.alloc_id();
    registry.by_type.insert(type_id, id);
    id
}

/// Returns a new component id that isn't associated with any Rust type, for
/// components only known at runtime (see [`Ecs::register_component_raw`]).
///
/// [`Ecs::register_component_raw`]: super::Ecs::register_component_raw
pub fn dynamic_component_id() -> ComponentId {
    registry().write().unwrap_or_else(PoisonError::into_inner).alloc_id()
}

/// Returns the amount of component ids assigned so far.
pub fn assigned_component_ids() -> usize {
    registry().read().unwrap_or_else(PoisonError::into_inner).next_id as usize
}

/// Marks unused slots in the sparse array.
pub(super) const NONE: u32 = u32::MAX;

/// Sparse set storage for one component type, with the components stored as
/// bytes. The typed API in [`Ecs`](super::Ecs) casts them with [`bytemuck`].
///
/// For every entity with this component: `dense[sparse[entity]] == entity`,
/// and `components[sparse[entity]]` is its component.
pub(super) struct ComponentStore<'a> {
    /// Set for stores registered with a Rust type, checked by the typed API.
    pub type_id: Option<TypeId>,
    pub size: usize,
    pub align: usize,
    /// Entity index to dense index, or [`NONE`].
    pub sparse: &'a mut [u32],
    pub dense: &'a mut [Entity],
    /// `size` bytes per component, parallel to `dense`.
    pub components: &'a mut [u8],
    pub len: usize,
}

impl Debug for ComponentStore<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentStore")
            .field("size", &self.size)
            .field("align", &self.align)
            .field("len", &self.len)
            .field("capacity", &self.dense.len())
            .finish_non_exhaustive()
    }
}

impl<'a> ComponentStore<'a> {
    pub fn new(
        arena: &'a Arena,
        type_id: Option<TypeId>,
        entity_capacity: usize,
        max_components: usize,
        size: usize,
        align: usize,
    ) -> ComponentStore<'a> {
        let Some(components_size) = size.checked_mul(max_components) else {
            panic!("{max_components} components of {size} bytes do not fit in memory");
        };
        ComponentStore {
            type_id,
            size,
            align,
            sparse: arena.alloc_slice_fill_with(entity_capacity, |_| NONE),
            dense: arena.alloc_slice_zeroed(max_components),
            components: arena.alloc_bytes(components_size, align),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.dense.len()
    }

    pub fn dense_index(&self, entity: Entity) -> Option<usize> {
        match self.sparse.get(entity.index()) {
            Some(&index) if index != NONE => Some(index as usize),
            _ => None,
        }
    }

    pub fn component(&self, dense_index: usize) -> &[u8] {
        let start = dense_index * self.size;
        &self.components[start..start + self.size]
    }

    pub fn component_mut(&mut self, dense_index: usize) -> &mut [u8] {
        let start = dense_index * self.size;
        &mut self.components[start..start + self.size]
    }

    /// All the components in use, in dense order.
    pub fn packed(&self) -> &[u8] {
        &self.components[..self.len * self.size]
    }

    pub fn packed_mut(&mut self) -> &mut [u8] {
        &mut self.components[..self.len * self.size]
    }

    /// Appends the component for the entity and returns its bytes.
    pub fn push(&mut self, entity: Entity, component: &[u8]) -> &mut [u8] {
        assert_eq!(
            self.size,
            component.len(),
            "component size does not match the size it was registered with",
        );
        assert!(
            self.dense_index(entity).is_none(),
            "{entity} already has this component",
        );
        assert!(
            self.len < self.capacity(),
            "component store is full ({} components)",
            self.capacity(),
        );
        let index = self.len;
        self.len += 1;
        self.dense[index] = entity;
        self.sparse[entity.index()] = index as u32;
        let slot = self.component_mut(index);
        slot.copy_from_slice(component);
        slot
    }

    /// Removes the entity's component by moving the last component in its
    /// place.
    pub fn swap_remove(&mut self, entity: Entity) {
        let Some(index) = self.dense_index(entity) else {
            panic!("{entity} does not have this component");
        };
        let last = self.len - 1;
        if index != last {
            let moved = self.dense[last];
            self.dense[index] = moved;
            self.sparse[moved.index()] = index as u32;
            let size = self.size;
            self.components
                .copy_within(last * size..(last + 1) * size, index * size);
        }
        self.sparse[entity.index()] = NONE;
        self.len = last;
    }

    /// Swaps the components at the two dense indices, keeping the sparse
    /// array pointing at the right places.
    ///
    /// If the indices are the same, this does nothing.
    pub fn swap(&mut self, index_a: usize, index_b: usize) {
        match index_a.cmp(&index_b) {
            Ordering::Equal => {}
            Ordering::Greater => self.swap(index_b, index_a),
            Ordering::Less => {
                assert!(index_b < self.len, "dense index {index_b} is out of bounds");
                let size = self.size;
                let a_byte_index = size * index_a;
                let b_byte_index = size * index_b;
                let (contains_a, starts_with_b) = self.components.split_at_mut(b_byte_index);
                let a = &mut contains_a[a_byte_index..a_byte_index + size];
                let b = &mut starts_with_b[..size];
                a.swap_with_slice(b);

                self.dense.swap(index_a, index_b);
                self.sparse[self.dense[index_a].index()] = index_a as u32;
                self.sparse[self.dense[index_b].index()] = index_b as u32;
            }
        }
    }

    /// Sorts the components in place, in the order defined by `cmp`.
    pub fn sort_by(&mut self, cmp: &mut dyn FnMut(&[u8], &[u8]) -> Ordering) {
        self.quicksort(0, self.len, cmp);
    }

    /// Quicksort over `[begin, end)`, partitioning around the first element
    /// of each range. Recurses into the smaller side and loops on the larger,
    /// so the recursion depth stays logarithmic.
    fn quicksort(&mut self, mut begin: usize, mut end: usize, cmp: &mut dyn FnMut(&[u8], &[u8]) -> Ordering) {
        while end - begin > 1 {
            let pivot = begin;
            // Everything in [begin + 1, i) sorts before the pivot, and
            // everything in (j, end) doesn't.
            let mut i = begin + 1;
            let mut j = end - 1;
            loop {
                while i <= j && cmp(self.component(i), self.component(pivot)) == Ordering::Less {
                    i += 1;
                }
                while i <= j && cmp(self.component(j), self.component(pivot)) != Ordering::Less {
                    j -= 1;
                }
                if i > j {
                    break;
                }
                self.swap(i, j);
                i += 1;
                j -= 1;
            }
            self.swap(pivot, j);

            // The pivot is now at j, in its final position.
            if j - begin < end - (j + 1) {
                self.quicksort(begin, j, cmp);
                begin = j + 1;
            } else {
                self.quicksort(j + 1, end, cmp);
                end = j;
            }
        }
    }

    /// Clears the store without touching the component memory.
    pub fn clear(&mut self) {
        self.sparse.fill(NONE);
        self.len = 0;
    }

    /// Grows the sparse array to cover `entity_capacity` entities.
    pub fn resize_sparse(&mut self, arena: &'a Arena, entity_capacity: usize) {
        let old_capacity = self.sparse.len();
        let sparse = arena.realloc_slice(core::mem::take(&mut self.sparse), entity_capacity);
        sparse[old_capacity.min(entity_capacity)..].fill(NONE);
        self.sparse = sparse;
    }

    /// Checks the sparse/dense invariant, for tests.
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        let dense_ok = (self.dense[..self.len].iter().enumerate())
            .all(|(i, entity)| self.sparse[entity.index()] as usize == i);
        let sparse_count = self.sparse.iter().filter(|&&i| i != NONE).count();
        dense_ok && sparse_count == self.len
    }
}

#[cfg(test)]
mod tests {
    use super::{component_id, dynamic_component_id, ComponentStore};
    use crate::{allocators::Arena, ecs::Entity};

    #[test]
    fn component_ids_are_stable_per_type() {
        struct A;
        struct B;
        let a = component_id::<A>();
        let b = component_id::<B>();
        assert_ne!(a, b);
        assert_eq!(a, component_id::<A>());
        let dynamic = dynamic_component_id();
        assert_ne!(dynamic, a);
        assert_ne!(dynamic, b);
    }

    #[test]
    fn sort_by_orders_bytes_and_keeps_sparse_in_sync() {
        let arena = Arena::new(4096);
        let mut store = ComponentStore::new(&arena, None, 8, 8, 1, 1);
        let values = [7u8, 3, 3, 9, 0, 5, 1, 3];
        for (i, value) in values.iter().enumerate() {
            store.push(Entity(i as u32), &[*value]);
        }
        store.sort_by(&mut |a, b| a.cmp(b));
        assert_eq!(&[0, 1, 3, 3, 3, 5, 7, 9], store.packed());
        assert!(store.is_consistent());
        for (i, value) in values.iter().enumerate() {
            let index = store.dense_index(Entity(i as u32)).unwrap();
            assert_eq!(*value, store.component(index)[0]);
        }
    }
}
