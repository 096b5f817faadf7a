// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{mem::MaybeUninit, sync::atomic::AtomicBool};

use platform::queue::{
    mpmc_from_parts, mpsc_from_parts, MultiConsumer, Producer, QueueCursors, QueueSlot,
    SingleConsumer, SyncUnsafeCell,
};

use crate::allocators::Arena;

type QueueParts<T> = (
    &'static mut [QueueSlot<T>],
    &'static mut [AtomicBool],
    &'static mut QueueCursors,
);

fn alloc_queue_parts<T>(arena: &'static Arena, capacity: usize) -> Option<QueueParts<T>> {
    let slot_count = capacity.max(1).checked_next_power_of_two()?;
    let slots = arena.try_alloc_slice_fill_with(slot_count, |_| {
        SyncUnsafeCell::new(MaybeUninit::<T>::uninit())
    })?;
    let has_item = arena.try_alloc_slice_fill_with(slot_count, |_| AtomicBool::new(false))?;
    let cursors = arena.try_alloc(QueueCursors::new()).ok()?;
    Some((slots, has_item, cursors))
}

/// Creates a bounded multi-producer multi-consumer queue, allocating its
/// memory from the arena. `capacity` is rounded up to the next power of two.
///
/// Returns None if the arena doesn't have enough memory left.
pub fn mpmc_queue<T: Send>(
    arena: &'static Arena,
    capacity: usize,
) -> Option<(Producer<T>, MultiConsumer<T>)> {
    let (slots, has_item, cursors) = alloc_queue_parts(arena, capacity)?;
    Some(mpmc_from_parts(slots, has_item, cursors))
}

/// Creates a bounded multi-producer single-consumer queue, allocating its
/// memory from the arena. `capacity` is rounded up to the next power of two.
///
/// Returns None if the arena doesn't have enough memory left.
pub fn mpsc_queue<T: Send>(
    arena: &'static Arena,
    capacity: usize,
) -> Option<(Producer<T>, SingleConsumer<T>)> {
    let (slots, has_item, cursors) = alloc_queue_parts(arena, capacity)?;
    Some(mpsc_from_parts(slots, has_item, cursors))
}
