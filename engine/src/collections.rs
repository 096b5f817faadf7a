// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounded lock-free queues backed by arena memory.
//!
//! The queue protocol itself lives in the platform crate, these functions just
//! allocate the memory for it.

mod channel;

pub use channel::{mpmc_queue, mpsc_queue};
pub use platform::queue::{MultiConsumer, Producer, SingleConsumer};
