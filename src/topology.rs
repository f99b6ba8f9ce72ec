// SPDX-License-Identifier: Apache-2.0

//! Segment Topology (C2): the fixed layout of slots inside every segment.
//!
//! Three slots are declared, in order: the heap allocator slot (C3), the node
//! pool slot (C4), and the trie residence slot, which only takes up space in
//! segment 0. Each segment's topology header records the byte offset at which
//! each slot's region begins, or [`EOS`] if the slot declines residence in that
//! segment.

use bytemuck::{Pod, Zeroable};
use crate::address::{EOS, FarAddress, NodeRef};
use crate::ALIGN;

pub const SLOT_HEAP: usize = 0;
pub const SLOT_NODE_POOL: usize = 1;
pub const SLOT_RESIDENCE: usize = 2;
pub const SLOT_COUNT: usize = 3;

/// Per-segment header for the heap allocator slot (C3).
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct HeapSlotHeader {
	pub area_start: u32,
	pub area_end: u32,
	pub tail: u32,
	pub _pad: u32,
	/// Head of the size-unordered free list threaded through free blocks'
	/// payloads. `FarAddress::NULL` when the heap has no free block.
	pub free_head: FarAddress,
}

/// Number of independently-freelisted node-pool classes a segment can host.
/// The trie's six capacity classes (8/16/32/64/128/256 children) each claim
/// one; the remaining slots are headroom for future shapes.
pub const NODE_POOL_CLASSES: usize = 8;

/// Per-class header for the fixed-size node pool slot (C4): one shape `T`'s
/// free list and bookkeeping within a segment.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct NodePoolSlotHeader {
	pub free_head: FarAddress,
	pub in_use: u32,
	pub capacity: u32,
}

/// The node pool slot's on-disk payload: one [`NodePoolSlotHeader`] per class.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct NodePoolSlot {
	pub classes: [NodePoolSlotHeader; NODE_POOL_CLASSES],
}

/// The store's single singleton block, resident only in segment 0: the root
/// node address and the trie-wide terminal/node counters.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct TrieResidence {
	pub root: NodeRef,
	pub size: u64,
	pub nodes_count: u64,
}

/// Byte offsets of each slot's region within one segment, `EOS` where the slot
/// declines residence.
#[derive(Copy, Clone, Debug)]
pub struct TopologyHeader {
	pub slot_offsets: [u32; SLOT_COUNT],
}

/// Size in bytes of the encoded topology header, aligned to [`ALIGN`].
pub const TOPOLOGY_HEADER_SIZE: usize = {
	let raw = 2 + SLOT_COUNT * 4;
	raw.next_multiple_of(ALIGN)
};

impl TopologyHeader {
	pub fn absent() -> Self {
		Self { slot_offsets: [EOS; SLOT_COUNT] }
	}

	pub fn encode(&self, buf: &mut [u8]) {
		debug_assert!(buf.len() >= TOPOLOGY_HEADER_SIZE);
		buf[0..2].copy_from_slice(&(SLOT_COUNT as u16).to_ne_bytes());
		for (i, off) in self.slot_offsets.iter().enumerate() {
			let at = 2 + i * 4;
			buf[at..at + 4].copy_from_slice(&off.to_ne_bytes());
		}
	}

	pub fn decode(buf: &[u8]) -> Self {
		debug_assert!(buf.len() >= TOPOLOGY_HEADER_SIZE);
		let mut slot_offsets = [EOS; SLOT_COUNT];
		let count = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
		for i in 0..count.min(SLOT_COUNT) {
			let at = 2 + i * 4;
			slot_offsets[i] = u32::from_ne_bytes(buf[at..at + 4].try_into().unwrap());
		}
		Self { slot_offsets }
	}

	pub fn offset(&self, slot: usize) -> Option<u32> {
		match self.slot_offsets[slot] {
			EOS => None,
			off => Some(off),
		}
	}

	pub fn set_offset(&mut self, slot: usize, offset: Option<u32>) {
		self.slot_offsets[slot] = offset.unwrap_or(EOS);
	}
}

/// Returns the byte sizes each slot occupies on the given segment, `0` when the
/// slot declines residence (only the residence slot is segment-0-only).
pub fn slot_sizes(segment_index: u32) -> [u32; SLOT_COUNT] {
	let heap_size = std::mem::size_of::<HeapSlotHeader>() as u32;
	let pool_size = std::mem::size_of::<NodePoolSlot>() as u32;
	let residence_size = if segment_index == 0 {
		(std::mem::size_of::<TrieResidence>() as u32).next_multiple_of(ALIGN as u32)
	} else {
		0
	};
	[
		heap_size.next_multiple_of(ALIGN as u32),
		pool_size.next_multiple_of(ALIGN as u32),
		residence_size,
	]
}
