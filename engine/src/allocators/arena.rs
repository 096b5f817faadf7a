// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    cell::Cell,
    fmt::Debug,
    mem::MaybeUninit,
    ptr::{self, NonNull},
    slice,
};
use std::{
    alloc::{self, Layout},
    rc::Rc,
};

use bytemuck::Zeroable;

/// The alignment of the backing memory block of every [`Arena`]. Allocations
/// with stricter alignment requirements are still aligned correctly, the head
/// is just bumped further.
pub const ARENA_BLOCK_ALIGNMENT: usize = 64;

/// A bump allocator over a fixed block of memory.
///
/// Allocations are handed out as mutable borrows of the arena, so none of them
/// can outlive it, and [`Arena::reset`] (which requires an exclusive borrow)
/// can't be called while any of them are still in use. Temporary allocations
/// can be made with [`Arena::scope`], which gives out a nested arena handle and
/// rewinds the head back to where it was when the scope ends.
///
/// The only way to free memory is by resetting the head, so the values
/// allocated from this arena are never dropped. Allocating values with
/// destructors is allowed, they're just leaked.
///
/// Arenas are not thread-safe (neither [`Send`] nor [`Sync`]). For temporary
/// allocations on any thread, see [`scratch`](super::scratch).
pub struct Arena {
    block: Rc<Block>,
    /// How many [`Arena::scope`]s deep this handle is. Only the innermost
    /// handle of a block may allocate.
    depth: usize,
}

struct Block {
    ptr: NonNull<u8>,
    capacity: usize,
    /// Offset of the first unallocated byte, `0 <= head <= capacity`.
    head: Cell<usize>,
    /// The depth of the currently innermost [`Arena`] handle for this block.
    active_depth: Cell<usize>,
}

impl Drop for Block {
    fn drop(&mut self) {
        // Safety: the block is only dropped when every Arena handle to it has
        // been dropped, and every allocation borrows one of those handles, so
        // nobody is using the memory anymore. The layout is the same one the
        // memory was allocated with in `Arena::new`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), block_layout(self.capacity)) };
    }
}

fn block_layout(capacity: usize) -> Layout {
    match Layout::from_size_align(capacity, ARENA_BLOCK_ALIGNMENT) {
        Ok(layout) => layout,
        Err(_) => panic!("arena capacity of {capacity} bytes is too large"),
    }
}

impl Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("ptr", &self.block.ptr)
            .field("capacity", &self.block.capacity)
            .field("allocated", &self.block.head.get())
            .field("depth", &self.depth)
            .finish()
    }
}

impl Arena {
    /// Creates a new [`Arena`] with `capacity` bytes of backing memory from
    /// the system allocator.
    ///
    /// Aborts the process if the allocation fails.
    ///
    /// ### Panics
    ///
    /// If `capacity` is zero or too large to be allocated at all.
    #[track_caller]
    pub fn new(capacity: usize) -> Arena {
        assert!(capacity > 0, "arena capacity must be larger than zero");
        let layout = block_layout(capacity);
        // Safety: the layout has a non-zero size, asserted above.
        let ptr = unsafe { alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        Arena {
            block: Rc::new(Block {
                ptr,
                capacity,
                head: Cell::new(0),
                active_depth: Cell::new(0),
            }),
            depth: 0,
        }
    }

    /// Returns the total (free and allocated) amount of memory owned by this
    /// arena, in bytes.
    pub fn capacity(&self) -> usize {
        self.block.capacity
    }

    /// Returns the amount of allocated memory, including padding, in bytes.
    pub fn allocated(&self) -> usize {
        self.block.head.get()
    }

    /// Returns the amount of memory left for allocations, in bytes. Alignment
    /// padding may make the usable amount smaller.
    pub fn remaining(&self) -> usize {
        self.block.capacity - self.block.head.get()
    }

    /// Returns true if both arenas allocate from the same memory block, i.e.
    /// one is a [scope](Arena::scope) of the other, or they're the same arena.
    pub fn same_memory(a: &Arena, b: &Arena) -> bool {
        Rc::ptr_eq(&a.block, &b.block)
    }

    /// Runs `f` with a nested handle to this arena, and frees everything
    /// allocated through that handle after `f` returns (or unwinds).
    ///
    /// Allocations made before the scope stay valid, and the lifetimes of the
    /// allocations made inside the scope make sure they can't escape it.
    ///
    /// ### Panics
    ///
    /// While the scope is active, this handle must not be used to allocate
    /// memory or to start another scope. Use the nested handle instead. The
    /// lifetimes can't forbid this because allocations take shared borrows.
    #[track_caller]
    pub fn scope<R, F: FnOnce(&Arena) -> R>(&self, f: F) -> R {
        self.assert_innermost();

        struct ScopeGuard {
            arena: Arena,
            saved_head: usize,
        }

        impl Drop for ScopeGuard {
            fn drop(&mut self) {
                let block = &self.arena.block;
                block.head.set(self.saved_head);
                block.active_depth.set(self.arena.depth - 1);
            }
        }

        let guard = ScopeGuard {
            arena: Arena {
                block: self.block.clone(),
                depth: self.depth + 1,
            },
            saved_head: self.block.head.get(),
        };
        self.block.active_depth.set(guard.arena.depth);

        f(&guard.arena)
    }

    /// Resets the arena, reclaiming all of the backing memory for future
    /// allocation. **NOTE:** the values allocated from the arena are not
    /// dropped, they're leaked.
    pub fn reset(&mut self) {
        // The exclusive borrow guarantees that there are no allocations (they
        // borrow the arena) or scopes (same) alive, and nested handles are only
        // handed out as shared borrows, so this is always the outermost one.
        debug_assert_eq!(self.depth, self.block.active_depth.get());
        self.block.head.set(0);
    }

    /// Allocates `size` zeroed bytes aligned to `align`.
    ///
    /// ### Panics
    ///
    /// If there's not enough memory left, if `align` is not a power of two, or
    /// if a [scope](Arena::scope) of this arena is active.
    #[track_caller]
    pub fn alloc_bytes(&self, size: usize, align: usize) -> &mut [u8] {
        match self.try_alloc_bytes(size, align) {
            Some(bytes) => bytes,
            None => self.out_of_memory(size, align),
        }
    }

    /// Allocates `size` zeroed bytes aligned to `align`, or returns None if
    /// there's not enough memory left.
    #[track_caller]
    pub fn try_alloc_bytes(&self, size: usize, align: usize) -> Option<&mut [u8]> {
        let ptr = self.try_reserve(size, align)?;
        // Safety: try_reserve returns a pointer to `size` bytes of unused memory
        // within the block, which no other borrow points to (see try_reserve),
        // valid for the lifetime of the &self borrow.
        unsafe {
            ptr.as_ptr().write_bytes(0, size);
            Some(slice::from_raw_parts_mut(ptr.as_ptr(), size))
        }
    }

    /// Allocates one `T` and moves `value` there.
    #[track_caller]
    pub fn alloc<T>(&self, value: T) -> &mut T {
        match self.try_alloc(value) {
            Ok(allocated) => allocated,
            Err(_) => self.out_of_memory(size_of::<T>(), align_of::<T>()),
        }
    }

    /// Allocates one `T` and moves `value` there, or gives the value back if
    /// there's not enough memory left.
    #[track_caller]
    pub fn try_alloc<T>(&self, value: T) -> Result<&mut T, T> {
        let Some(uninit) = self.try_alloc_uninit_slice::<T>(1) else {
            return Err(value);
        };
        Ok(uninit[0].write(value))
    }

    /// Allocates a slice of `len` zeroed `T`s.
    #[track_caller]
    pub fn alloc_slice_zeroed<T: Zeroable>(&self, len: usize) -> &mut [T] {
        match self.try_alloc_slice_zeroed(len) {
            Some(allocated) => allocated,
            None => self.out_of_memory(len.saturating_mul(size_of::<T>()), align_of::<T>()),
        }
    }

    /// Allocates a slice of `len` zeroed `T`s, or returns None if there's not
    /// enough memory left.
    #[track_caller]
    pub fn try_alloc_slice_zeroed<T: Zeroable>(&self, len: usize) -> Option<&mut [T]> {
        let uninit = self.try_alloc_uninit_slice::<T>(len)?;
        let ptr = uninit.as_mut_ptr() as *mut T;
        // Safety: the memory is valid for writes of `len` Ts (it was just
        // allocated for them), and after writing zeroes to it, it contains
        // `len` valid Ts, since T is Zeroable. The borrow of the uninitialized
        // slice is consumed in the process, so this is the only borrow.
        unsafe {
            ptr.write_bytes(0, len);
            Some(slice::from_raw_parts_mut(ptr, len))
        }
    }

    /// Allocates a slice of `len` `T`s, initializing each one with the return
    /// value of `init(index)`.
    #[track_caller]
    pub fn alloc_slice_fill_with<T, F: FnMut(usize) -> T>(&self, len: usize, init: F) -> &mut [T] {
        match self.try_alloc_slice_fill_with(len, init) {
            Some(allocated) => allocated,
            None => self.out_of_memory(len.saturating_mul(size_of::<T>()), align_of::<T>()),
        }
    }

    /// Allocates a slice of `len` `T`s, initializing each one with the return
    /// value of `init(index)`, or returns None if there's not enough memory
    /// left.
    #[track_caller]
    pub fn try_alloc_slice_fill_with<T, F: FnMut(usize) -> T>(
        &self,
        len: usize,
        mut init: F,
    ) -> Option<&mut [T]> {
        let uninit = self.try_alloc_uninit_slice::<T>(len)?;
        for (i, slot) in uninit.iter_mut().enumerate() {
            slot.write(init(i));
        }
        // Safety: every element was initialized in the loop above. If `init`
        // panics, the partially initialized slice is simply leaked, like every
        // other arena allocation.
        Some(unsafe { &mut *(uninit as *mut [MaybeUninit<T>] as *mut [T]) })
    }

    /// Allocates memory for a slice of `MaybeUninit<T>`, leaving the contents
    /// of the slice uninitialized.
    #[track_caller]
    pub fn alloc_uninit_slice<T>(&self, len: usize) -> &mut [MaybeUninit<T>] {
        match self.try_alloc_uninit_slice(len) {
            Some(allocated) => allocated,
            None => self.out_of_memory(len.saturating_mul(size_of::<T>()), align_of::<T>()),
        }
    }

    /// Allocates memory for a slice of `MaybeUninit<T>`, leaving the contents
    /// of the slice uninitialized, or returns None if there's not enough memory
    /// left.
    #[track_caller]
    pub fn try_alloc_uninit_slice<T>(&self, len: usize) -> Option<&mut [MaybeUninit<T>]> {
        let size = len.checked_mul(size_of::<T>())?;
        let ptr = self.try_reserve(size, align_of::<T>())?;
        // Safety:
        // - The pointer is non-null and aligned for T (try_reserve aligns it).
        // - The memory range is within the block, or the slice is zero-sized.
        // - Uninitialized memory is a valid MaybeUninit<T>.
        // - No other borrow points to this memory for the lifetime of the &self
        //   borrow: the head has been bumped past it, and it's only rewound by
        //   `reset` (requires &mut self) or by the end of the scope this handle
        //   belongs to (which outlives the &self borrow).
        Some(unsafe { slice::from_raw_parts_mut(ptr.as_ptr() as *mut MaybeUninit<T>, len) })
    }

    /// Resizes the slice to `new_len` elements. Newly exposed elements are
    /// zeroed.
    ///
    /// Shrinking returns the original memory truncated, without giving the
    /// cut-off part back to the arena. Growing happens in place if `old` is
    /// the most recent allocation of this arena, otherwise a new slice is
    /// allocated and the contents copied over. The old memory is not
    /// reclaimed either way.
    ///
    /// ### Panics
    ///
    /// If there's not enough memory left for the grown slice, or if a
    /// [scope](Arena::scope) of this arena is active.
    #[track_caller]
    pub fn realloc_slice<'a, T: Copy + Zeroable>(&'a self, old: &'a mut [T], new_len: usize) -> &'a mut [T] {
        let old_len = old.len();
        let Some(new_size) = new_len.checked_mul(size_of::<T>()) else {
            self.out_of_memory(usize::MAX, align_of::<T>());
        };
        let ptr = self.realloc_raw(
            NonNull::from(&mut *old).cast::<u8>(),
            old_len * size_of::<T>(),
            new_size,
            align_of::<T>(),
        );
        // Safety: realloc_raw returns a pointer to `new_size` bytes of memory
        // that are only reachable through `old` (which is consumed here) or
        // fresh memory past the previous head. The first `min(old_len,
        // new_len)` elements are copied from `old` and the rest are zeroed,
        // which are valid Ts since T is Zeroable.
        unsafe { slice::from_raw_parts_mut(ptr.as_ptr() as *mut T, new_len) }
    }

    /// Resizes the byte slice to `new_size` bytes, with the same semantics as
    /// [`Arena::realloc_slice`]. `align` is used for the new allocation if
    /// one is needed.
    #[track_caller]
    pub fn realloc_bytes<'a>(&'a self, old: &'a mut [u8], new_size: usize, align: usize) -> &'a mut [u8] {
        let ptr = self.realloc_raw(NonNull::from(&mut *old).cast::<u8>(), old.len(), new_size, align);
        // Safety: see realloc_slice.
        unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), new_size) }
    }

    #[track_caller]
    fn realloc_raw(&self, old: NonNull<u8>, old_size: usize, new_size: usize, align: usize) -> NonNull<u8> {
        self.assert_innermost();
        let block = &*self.block;
        let base = block.ptr.as_ptr() as usize;
        let start = old.as_ptr() as usize;
        let head = block.head.get();
        let is_tail = old_size > 0 && start >= base && start + old_size == base + head;

        if new_size <= old_size {
            // The head stays put, the caller's original slice may still reach
            // up to it once the returned one is gone.
            old
        } else if is_tail {
            let offset = start - base;
            match offset.checked_add(new_size) {
                Some(new_end) if new_end <= block.capacity => block.head.set(new_end),
                _ => self.out_of_memory(new_size - old_size, align),
            }
            // Safety: the range between the old and new end was past the
            // head, so it's unused memory within the block.
            unsafe { old.as_ptr().add(old_size).write_bytes(0, new_size - old_size) };
            old
        } else {
            let Some(new) = self.try_reserve(new_size, align) else {
                self.out_of_memory(new_size, align);
            };
            // Safety: `new` points to `new_size` bytes of unused memory, and
            // `old` is a separate, earlier allocation of `old_size` bytes.
            unsafe {
                ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size);
                new.as_ptr().add(old_size).write_bytes(0, new_size - old_size);
            }
            new
        }
    }

    /// Bumps the head past an allocation of `size` bytes aligned to `align`.
    /// Zero-sized allocations don't move the head.
    #[track_caller]
    fn try_reserve(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(align.is_power_of_two(), "alignment must be a power of two, got {align}");
        self.assert_innermost();

        if size == 0 {
            // Any non-null aligned pointer is valid for zero-sized accesses.
            return NonNull::new(ptr::null_mut::<u8>().wrapping_add(align));
        }

        // Aligning the address instead of the offset, so that alignments
        // larger than the block's also work.
        let block = &*self.block;
        let base = block.ptr.as_ptr() as usize;
        let head = block.head.get();
        let offset = (base + head).checked_next_multiple_of(align)? - base;
        let end = offset.checked_add(size)?;
        if end > block.capacity {
            return None;
        }

        // The Cell guarantees nobody else reads the head between the get above
        // and this set. Only `reset` (which requires an exclusive borrow) and
        // the end of a scope (which requires every borrow of the scope's handle
        // to be gone) move the head backwards, so no live allocation overlaps
        // with the memory past the head.
        block.head.set(end);

        // Safety: `offset + size <= capacity`, so the resulting pointer is
        // within the block, which is a single allocated object.
        Some(unsafe { NonNull::new_unchecked(block.ptr.as_ptr().add(offset)) })
    }

    #[track_caller]
    fn assert_innermost(&self) {
        let active_depth = self.block.active_depth.get();
        if active_depth != self.depth {
            panic!(
                "arena was used while one of its scopes was active (handle depth {}, active scope depth {active_depth}), use the scope's arena instead",
                self.depth,
            );
        }
    }

    #[track_caller]
    fn out_of_memory(&self, size: usize, align: usize) -> ! {
        panic!(
            "arena is out of memory: tried to allocate {size} bytes (aligned to {align}), but only {} of {} bytes are left",
            self.remaining(),
            self.capacity(),
        );
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::Arena;

    #[test]
    fn allocations_are_aligned_and_zeroed() {
        let arena = Arena::new(1024);
        let _ = arena.alloc(1u8);
        let words = arena.alloc_slice_zeroed::<u64>(4);
        assert_eq!(0, words.as_ptr() as usize % align_of::<u64>());
        assert_eq!([0; 4], words);
        let bytes = arena.alloc_bytes(10, 256);
        assert_eq!(0, bytes.as_ptr() as usize % 256);
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_sized_allocations_succeed() {
        let arena = Arena::new(8);
        let _ = arena.alloc_bytes(8, 1);
        let empty = arena.alloc_bytes(0, 16);
        assert!(empty.is_empty());
        assert_eq!(0, empty.as_ptr() as usize % 16);
        assert_eq!(8, arena.allocated());
    }

    #[test]
    #[should_panic(expected = "arena is out of memory")]
    fn overflowing_capacity_panics() {
        let arena = Arena::new(16);
        let _ = arena.alloc_bytes(17, 1);
    }

    #[test]
    fn try_variants_return_none_when_full() {
        let arena = Arena::new(16);
        assert!(arena.try_alloc_bytes(16, 1).is_some());
        assert!(arena.try_alloc_bytes(1, 1).is_none());
        assert_eq!(Err(5u32), arena.try_alloc(5u32));
        assert!(arena.try_alloc_slice_zeroed::<u8>(1).is_none());
    }

    #[test]
    #[should_panic(expected = "larger than zero")]
    fn zero_capacity_panics() {
        let _ = Arena::new(0);
    }

    #[test]
    fn reset_reuses_the_first_address() {
        let mut arena = Arena::new(256);
        let first = arena.alloc_slice_zeroed::<u32>(3).as_ptr();
        let _ = arena.alloc_bytes(100, 1);
        arena.reset();
        assert_eq!(0, arena.allocated());
        let after_reset = arena.alloc_slice_zeroed::<u32>(3).as_ptr();
        assert_eq!(first, after_reset);
    }

    #[test]
    fn tail_realloc_grows_in_place() {
        let arena = Arena::new(256);
        let numbers = arena.alloc_slice_fill_with(4, |i| i as u32);
        let ptr = numbers.as_ptr();
        let numbers = arena.realloc_slice(numbers, 8);
        assert_eq!(ptr, numbers.as_ptr());
        assert_eq!([0, 1, 2, 3, 0, 0, 0, 0], numbers);
        let numbers = arena.realloc_slice(numbers, 2);
        assert_eq!(ptr, numbers.as_ptr());
        assert_eq!(8 * size_of::<u32>(), arena.allocated());
    }

    #[test]
    fn shrinking_keeps_the_old_memory_reserved() {
        let arena = Arena::new(256);
        let original = arena.alloc_slice_fill_with(4, |_| 7u32);
        {
            let shrunk = arena.realloc_slice(&mut *original, 1);
            assert_eq!([7], shrunk);
        }
        let fresh = arena.alloc_slice_fill_with(3, |_| 9u32);
        let original_range = original.as_ptr_range();
        let fresh_range = fresh.as_ptr_range();
        assert!(fresh_range.start >= original_range.end || fresh_range.end <= original_range.start);
        assert_eq!([7; 4], original);
        assert_eq!([9; 3], fresh);
    }

    #[test]
    fn shrinking_in_a_scope_keeps_outer_memory_reserved() {
        let arena = Arena::new(256);
        let outer = arena.alloc_slice_fill_with(8, |_| 1u8);
        let before = arena.allocated();
        arena.scope(|scratch| {
            let shrunk = scratch.realloc_bytes(&mut *outer, 2, 1);
            assert_eq!([1, 1], shrunk);
            assert_eq!(before, scratch.allocated());
            let _ = scratch.alloc_slice_fill_with(8, |_| 2u8);
        });
        assert_eq!([1; 8], outer);
        assert_eq!(before, arena.allocated());
    }

    #[test]
    fn non_tail_realloc_copies_or_truncates() {
        let arena = Arena::new(256);
        let first = arena.alloc_slice_fill_with(4, |i| i as u16 + 1);
        let first_ptr = first.as_ptr();
        let _second = arena.alloc(0u8);

        let grown = arena.realloc_slice(first, 6);
        assert_ne!(first_ptr, grown.as_ptr());
        assert_eq!([1, 2, 3, 4, 0, 0], grown);

        let third = arena.alloc_slice_fill_with(3, |i| i as u16);
        let _fourth = arena.alloc(0u8);
        let third_ptr = third.as_ptr();
        let shrunk = arena.realloc_slice(third, 1);
        assert_eq!(third_ptr, shrunk.as_ptr());
        assert_eq!([0], shrunk);
    }

    #[test]
    fn scopes_rewind_the_head() {
        let arena = Arena::new(1024);
        let outer = arena.alloc(123u32);
        let before = arena.allocated();
        let sum = arena.scope(|scratch| {
            let temp = scratch.alloc_slice_fill_with(16, |i| i as u32);
            let inner_sum = scratch.scope(|inner| {
                let _ = inner.alloc_bytes(100, 1);
                temp.iter().sum::<u32>()
            });
            assert_eq!(before + 16 * 4, scratch.allocated());
            inner_sum
        });
        assert_eq!(120, sum);
        assert_eq!(before, arena.allocated());
        assert_eq!(123, *outer);
    }

    #[test]
    fn scopes_rewind_on_unwind() {
        let arena = Arena::new(1024);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            arena.scope(|scratch| {
                let _ = scratch.alloc_bytes(512, 1);
                panic!("oh no");
            })
        }));
        assert!(result.is_err());
        assert_eq!(0, arena.allocated());
        let _ = arena.alloc_bytes(1024, 1);
    }

    #[test]
    #[should_panic(expected = "while one of its scopes was active")]
    fn allocating_from_outer_arena_in_scope_panics() {
        let arena = Arena::new(1024);
        arena.scope(|_scratch| {
            let _ = arena.alloc(1u8);
        });
    }

    #[test]
    fn same_memory_sees_through_scopes() {
        let a = Arena::new(64);
        let b = Arena::new(64);
        assert!(Arena::same_memory(&a, &a));
        assert!(!Arena::same_memory(&a, &b));
        a.scope(|scoped| assert!(Arena::same_memory(&a, scoped)));
    }

    proptest! {
        #[test]
        fn realloc_of_latest_allocation_never_moves(
            first_len in 0usize..64,
            growths in prop::collection::vec(0usize..16, 1..16),
        ) {
            let arena = Arena::new(4096);
            let _ = arena.alloc_slice_zeroed::<u32>(first_len);
            let mut latest = arena.alloc_slice_fill_with(1, |_| 7u32);
            let ptr = latest.as_ptr();
            for growth in growths {
                let new_len = latest.len() + growth;
                latest = arena.realloc_slice(latest, new_len);
                prop_assert_eq!(ptr, latest.as_ptr());
                prop_assert_eq!(new_len, latest.len());
                prop_assert_eq!(7, latest[0]);
            }
        }
    }
}
