// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounded lock-free ring buffer with multiple producers and either multiple
//! consumers ([`mpmc_from_parts`]) or a single consumer
//! ([`mpsc_from_parts`]).
//!
//! The buffer has two cursors on each end. Producers claim slots by bumping
//! `working_head`, write their value, mark the slot as published, and then
//! advance the visible `head` past every contiguously published slot.
//! Consumers claim slots between `working_tail` and the visible `head`, read
//! the value, mark the slot as empty, and advance the visible `tail` past every
//! contiguously emptied slot. Claims can complete out of order, but the
//! visible windows never have holes in them: consumers never see an
//! unpublished slot, and producers never wrap around into a slot that hasn't
//! been emptied yet.
//!
//! The cursors are monotonic and only masked into slot indices when used, so
//! the slot count must be a power of two.

use core::{
    mem::MaybeUninit,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

pub use sync_unsafe_cell::SyncUnsafeCell;

/// Backing memory of a single element of a queue.
pub type QueueSlot<T> = SyncUnsafeCell<MaybeUninit<T>>;

/// The cursors of a queue, each on its own cache line.
pub struct QueueCursors {
    /// Everything before this is published and visible to consumers.
    head: CachePadded<AtomicUsize>,
    /// Everything before this has been claimed by a producer.
    working_head: CachePadded<AtomicUsize>,
    /// Everything before this has been consumed and emptied.
    tail: CachePadded<AtomicUsize>,
    /// Everything before this has been claimed by a consumer.
    working_tail: CachePadded<AtomicUsize>,
}

impl QueueCursors {
    /// Creates cursors for an empty queue.
    pub const fn new() -> QueueCursors {
        QueueCursors {
            head: CachePadded::new(AtomicUsize::new(0)),
            working_head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            working_tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    fn reset(&mut self) {
        *self.head.get_mut() = 0;
        *self.working_head.get_mut() = 0;
        *self.tail.get_mut() = 0;
        *self.working_tail.get_mut() = 0;
    }
}

impl Default for QueueCursors {
    fn default() -> Self {
        QueueCursors::new()
    }
}

// All the cursor and flag operations are SeqCst: publishing is a
// store-then-load handshake between threads (store own flag, then load the
// shared cursor), and with weaker orderings two publishers could both miss
// each other's store, leaving a published slot outside the visible window.
const ORDER: Ordering = Ordering::SeqCst;

struct SharedQueue<T: 'static> {
    slots: &'static [QueueSlot<T>],
    has_item: &'static [AtomicBool],
    cursors: &'static QueueCursors,
    mask: usize,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        SharedQueue {
            slots: self.slots,
            has_item: self.has_item,
            cursors: self.cursors,
            mask: self.mask,
        }
    }
}

impl<T> SharedQueue<T> {
    fn from_parts(
        slots: &'static mut [QueueSlot<T>],
        has_item: &'static mut [AtomicBool],
        cursors: &'static mut QueueCursors,
    ) -> SharedQueue<T> {
        assert!(
            slots.len().is_power_of_two(),
            "queue slot count must be a power of two, got {}",
            slots.len(),
        );
        assert_eq!(
            slots.len(),
            has_item.len(),
            "queue needs exactly one has_item flag per slot",
        );
        for flag in &mut *has_item {
            *flag.get_mut() = false;
        }
        cursors.reset();
        SharedQueue {
            mask: slots.len() - 1,
            slots,
            has_item,
            cursors,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        // working_tail first, so that the head loaded after it can't be behind it.
        let claimed_by_consumers = self.cursors.working_tail.load(ORDER);
        let published = self.cursors.head.load(ORDER);
        published.wrapping_sub(claimed_by_consumers)
    }

    fn push(&self, value: T) -> Result<(), T> {
        let cursors = self.cursors;

        // 1. Claim a slot. The tail is loaded before working_head so that
        //    `claimed - tail` can't underflow due to a stale working_head.
        let claimed = loop {
            let tail = cursors.tail.load(ORDER);
            let claimed = cursors.working_head.load(ORDER);
            if claimed.wrapping_sub(tail) >= self.capacity() {
                return Err(value);
            }
            if cursors
                .working_head
                .compare_exchange_weak(claimed, claimed.wrapping_add(1), ORDER, ORDER)
                .is_ok()
            {
                break claimed;
            }
        };
        let index = claimed & self.mask;

        // 2. Write the value.
        {
            let slot_ptr = self.slots[index].get();
            // Safety: this slot is not accessed by anyone else right now:
            // - No other producer claimed the same cursor value, since the
            //   claim is a successful CAS from `claimed` to `claimed + 1`.
            // - The previous value in this slot (at cursor `claimed -
            //   capacity`) has been read and the slot emptied, because the
            //   visible tail was past it when we claimed, and the tail is only
            //   advanced past emptied slots.
            // - Consumers don't read this slot until the visible head is moved
            //   past it, which only happens after step 3.
            let slot = unsafe { &mut *slot_ptr };
            slot.write(value);
        }

        // 3. Publish, and make every contiguously published slot visible.
        self.has_item[index].store(true, ORDER);
        self.advance_head();

        Ok(())
    }

    fn advance_head(&self) {
        let cursors = self.cursors;
        let mut head = cursors.head.load(ORDER);
        loop {
            if head == cursors.working_head.load(ORDER) {
                break;
            }
            if !self.has_item[head & self.mask].load(ORDER) {
                // Claimed but not yet published. The producer of that slot
                // will continue from here once it publishes.
                break;
            }
            match cursors
                .head
                .compare_exchange_weak(head, head.wrapping_add(1), ORDER, ORDER)
            {
                Ok(_) => head = head.wrapping_add(1),
                Err(current) => head = current,
            }
        }
    }

    /// Claims the next published slot, with a CAS loop to allow multiple
    /// consumers.
    fn claim_shared(&self) -> Option<usize> {
        let cursors = self.cursors;
        loop {
            let claimed = cursors.working_tail.load(ORDER);
            let head = cursors.head.load(ORDER);
            if claimed == head {
                return None;
            }
            if cursors
                .working_tail
                .compare_exchange_weak(claimed, claimed.wrapping_add(1), ORDER, ORDER)
                .is_ok()
            {
                return Some(claimed);
            }
        }
    }

    /// Reads out and empties the slot at the claimed cursor.
    ///
    /// ### Safety
    ///
    /// `claimed` must be a cursor value claimed from `working_tail` by the
    /// caller, and not be passed into this function more than once.
    unsafe fn take(&self, claimed: usize) -> T {
        let index = claimed & self.mask;
        let slot_ptr = self.slots[index].get();
        // Safety: the slot was published (it's before the visible head), and
        // the caller is the only consumer that claimed it, so it's
        // initialized and nobody else is reading or writing it. Producers
        // can't write into it until it's emptied and the tail moves past it.
        let value = unsafe { (*slot_ptr).assume_init_read() };
        self.has_item[index].store(false, ORDER);
        value
    }

    fn advance_tail(&self) {
        let cursors = self.cursors;
        let mut tail = cursors.tail.load(ORDER);
        loop {
            if tail == cursors.working_tail.load(ORDER) {
                break;
            }
            if self.has_item[tail & self.mask].load(ORDER) {
                // Claimed but not yet emptied. The consumer of that slot will
                // continue from here once it's done.
                break;
            }
            match cursors
                .tail
                .compare_exchange_weak(tail, tail.wrapping_add(1), ORDER, ORDER)
            {
                Ok(_) => tail = tail.wrapping_add(1),
                Err(current) => tail = current,
            }
        }
    }
}

/// Creates a multi-producer multi-consumer queue from its raw parts.
///
/// `slots` and `has_item` must have the same length, which must be a power of
/// two. The parts are reset to represent an empty queue.
///
/// Values still in the queue when every handle has been dropped are leaked,
/// not dropped.
pub fn mpmc_from_parts<T: Send>(
    slots: &'static mut [QueueSlot<T>],
    has_item: &'static mut [AtomicBool],
    cursors: &'static mut QueueCursors,
) -> (Producer<T>, MultiConsumer<T>) {
    let queue = SharedQueue::from_parts(slots, has_item, cursors);
    (
        Producer {
            queue: queue.clone(),
        },
        MultiConsumer { queue },
    )
}

/// Creates a multi-producer single-consumer queue from its raw parts. See
/// [`mpmc_from_parts`] for the requirements.
pub fn mpsc_from_parts<T: Send>(
    slots: &'static mut [QueueSlot<T>],
    has_item: &'static mut [AtomicBool],
    cursors: &'static mut QueueCursors,
) -> (Producer<T>, SingleConsumer<T>) {
    let queue = SharedQueue::from_parts(slots, has_item, cursors);
    (
        Producer {
            queue: queue.clone(),
        },
        SingleConsumer { queue },
    )
}

/// The pushing half of a queue. Can be cloned and shared between threads.
pub struct Producer<T: 'static> {
    queue: SharedQueue<T>,
}

impl<T: Send> Producer<T> {
    /// Pushes the value into the queue if there's room, otherwise returns it
    /// back.
    pub fn push(&self, value: T) -> Result<(), T> {
        self.queue.push(value)
    }

    /// The amount of values the queue can hold.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// The amount of published values not yet claimed by a consumer. Only a
    /// snapshot.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if [`Producer::len`] is 0.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Producer {
            queue: self.queue.clone(),
        }
    }
}

/// The popping half of a multi-consumer queue. Can be cloned and shared
/// between threads.
pub struct MultiConsumer<T: 'static> {
    queue: SharedQueue<T>,
}

impl<T: Send> MultiConsumer<T> {
    /// Returns the value of a published slot, if there are any.
    ///
    /// No FIFO order is guaranteed between consumers: values are claimed in
    /// order, but two consumers' pops may finish in any order.
    pub fn pop(&self) -> Option<T> {
        let claimed = self.queue.claim_shared()?;
        // Safety: `claimed` was just claimed by this call.
        let value = unsafe { self.queue.take(claimed) };
        self.queue.advance_tail();
        Some(value)
    }

    /// The amount of values the queue can hold.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// The amount of published values not yet claimed by a consumer. Only a
    /// snapshot.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if [`MultiConsumer::len`] is 0.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for MultiConsumer<T> {
    fn clone(&self) -> Self {
        MultiConsumer {
            queue: self.queue.clone(),
        }
    }
}

/// The popping half of a single-consumer queue.
pub struct SingleConsumer<T: 'static> {
    queue: SharedQueue<T>,
}

impl<T: Send> SingleConsumer<T> {
    /// Returns the oldest published value, if there are any.
    pub fn pop(&mut self) -> Option<T> {
        let cursors = self.queue.cursors;
        // Only this consumer writes the tail cursors, and we have a mutable
        // borrow of it, so they can't change during this function.
        let claimed = cursors.working_tail.load(ORDER);
        if claimed == cursors.head.load(ORDER) {
            return None;
        }
        cursors.working_tail.store(claimed.wrapping_add(1), ORDER);
        // Safety: `claimed` was claimed above, and we're the only consumer.
        let value = unsafe { self.queue.take(claimed) };
        cursors.tail.store(claimed.wrapping_add(1), ORDER);
        Some(value)
    }

    /// The amount of values the queue can hold.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// The amount of published values not yet popped. Only a snapshot.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if [`SingleConsumer::len`] is 0.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Safety: the queue hands each value from exactly one producer to exactly one
// consumer, and the slot protocol above makes sure only one thread accesses a
// slot at a time, so sharing the handles is fine as long as the values
// themselves can be sent between threads.
unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Sync for Producer<T> {}
unsafe impl<T: Send> Send for MultiConsumer<T> {}
unsafe impl<T: Send> Sync for MultiConsumer<T> {}
unsafe impl<T: Send> Send for SingleConsumer<T> {}

/// FIXME: Use core::cell::SyncUnsafeCell instead when it's stabilized. Tracked
/// in the rust-lang issue
/// [#95439](https://github.com/rust-lang/rust/issues/95439).
mod sync_unsafe_cell {
    #![allow(dead_code)]
    /// [`UnsafeCell`](core::cell::UnsafeCell), but [`Sync`] if `T` is.
    #[repr(transparent)]
    pub struct SyncUnsafeCell<T: ?Sized>(core::cell::UnsafeCell<T>);
    unsafe impl<T: ?Sized + Sync> Sync for SyncUnsafeCell<T> {}
    impl<T> SyncUnsafeCell<T> {
        /// Wraps the value.
        #[inline]
        pub const fn new(value: T) -> Self {
            SyncUnsafeCell(core::cell::UnsafeCell::new(value))
        }
        /// Returns a pointer to the wrapped value.
        #[inline]
        pub const fn get(&self) -> *mut T {
            self.0.get()
        }
    }
}
