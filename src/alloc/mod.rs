// SPDX-License-Identifier: Apache-2.0

//! Segment-local allocators (C3, C4), both consumers of the event-sourcing
//! manager (C7) rather than of the backing file directly — every byte they
//! touch passes through a [`Transaction`](crate::manager::Transaction), so
//! allocator metadata participates in the same shadow-copy, conflict-checked,
//! commit/rollback discipline as trie data.

pub mod heap;
pub mod fixed;
