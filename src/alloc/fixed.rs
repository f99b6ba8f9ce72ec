// SPDX-License-Identifier: Apache-2.0

//! Fixed-Size Allocator Slot (C4): an O(1) alloc/free pool for one fixed-size
//! shape, grown in slabs requested from the heap allocator (C3) and chained
//! across segments and slabs via a single far-address free list.
//!
//! Each pool is identified by a `class` index into the segment's
//! [`NodePoolSlot`] array (see `topology.rs`); the trie (C9) uses one class per
//! node capacity tier.

use std::marker::PhantomData;
use bytemuck::Pod;
use crate::address::{Block, FarAddress};
use crate::error::{Error, Result};
use crate::file::BackingFile;
use crate::manager::Transaction;
use crate::alloc::heap;
use crate::topology::{NodePoolSlot, NodePoolSlotHeader, SLOT_NODE_POOL};

/// Number of elements carved out of a single slab request to the heap
/// allocator when a pool's free list runs dry.
const SLAB_LEN: u32 = 64;

fn slot_block(file: &BackingFile, segment: u32) -> Result<Block> {
	let topology = file.topology_for(segment)?;
	let offset = topology.offset(SLOT_NODE_POOL).ok_or_else(Error::invalid_block)?;
	Ok(Block::new(FarAddress::new(segment, offset), std::mem::size_of::<NodePoolSlot>() as u32))
}

fn read_slot(txn: &mut Transaction, file: &BackingFile, segment: u32) -> Result<NodePoolSlot> {
	let handle = txn.readonly_block(slot_block(file, segment)?, false)?;
	Ok(bytemuck::pod_read_unaligned(handle.as_slice()))
}

fn write_header(txn: &mut Transaction, file: &BackingFile, segment: u32, class: usize, header: NodePoolSlotHeader) -> Result<()> {
	let block = slot_block(file, segment)?;
	let handle = txn.writable_block(block, false)?;
	let field_offset = std::mem::offset_of!(NodePoolSlot, classes) + class * std::mem::size_of::<NodePoolSlotHeader>();
	let field_size = std::mem::size_of::<NodePoolSlotHeader>();
	handle.with_bytes_mut(|dst| dst[field_offset..field_offset + field_size].copy_from_slice(bytemuck::bytes_of(&header)));
	Ok(())
}

/// Reads the far address stored in the first 8 bytes of a free node's slot
/// (the link to the next free node), overlaying `T`'s own bytes while free.
fn read_next_link(txn: &mut Transaction, addr: FarAddress) -> Result<FarAddress> {
	let handle = txn.readonly_block(Block::new(addr, 8), false)?;
	Ok(FarAddress::from_u64(u64::from_ne_bytes(handle.as_slice().try_into().unwrap())))
}

fn write_next_link(txn: &mut Transaction, addr: FarAddress, next: FarAddress) -> Result<()> {
	let handle = txn.writable_block(Block::new(addr, 8), true)?;
	handle.with_bytes_mut(|dst| dst.copy_from_slice(&next.to_u64().to_ne_bytes()));
	Ok(())
}

/// Initialises a fresh segment's node pool slot: every class starts with an
/// empty (null) free list. Called directly against the backing file, outside
/// any transaction, at segment-creation time — a zeroed mmap would otherwise
/// read back as `FarAddress(0, 0)`, a valid-looking address rather than null.
pub fn init_slot(file: &BackingFile, segment: u32) -> Result<()> {
	let block = slot_block(file, segment)?;
	let slot = NodePoolSlot {
		classes: [NodePoolSlotHeader { free_head: FarAddress::NULL, in_use: 0, capacity: 0 }; crate::topology::NODE_POOL_CLASSES],
	};
	file.write_raw(block, bytemuck::bytes_of(&slot))
}

/// A handle identifying one of the `NODE_POOL_CLASSES` shapes hosted per
/// segment; `T` determines the element size used when requesting slabs.
pub struct FixedPool<T> {
	class: usize,
	_marker: PhantomData<fn() -> T>,
}

impl<T: Pod> FixedPool<T> {
	pub fn new(class: usize) -> Self {
		assert!(class < crate::topology::NODE_POOL_CLASSES);
		Self { class, _marker: PhantomData }
	}

	fn element_size() -> u32 {
		(std::mem::size_of::<T>() as u32).max(8).next_multiple_of(crate::ALIGN as u32)
	}

	/// Allocates one zeroed element of `T` from `segment`, growing the pool's
	/// free list with a fresh slab from the heap allocator if it is empty.
	pub fn allocate(&self, txn: &mut Transaction, file: &BackingFile, segment: u32) -> Result<FarAddress> {
		let mut slot = read_slot(txn, file, segment)?;
		let mut header = slot.classes[self.class];

		if header.free_head.is_null() {
			let elem_size = Self::element_size();
			let slab = heap::allocate(txn, file, segment, elem_size * SLAB_LEN)?;
			for i in 0..SLAB_LEN {
				let addr = slab.advance(i * elem_size);
				let next = if i + 1 < SLAB_LEN { slab.advance((i + 1) * elem_size) } else { FarAddress::NULL };
				write_next_link(txn, addr, next)?;
			}
			header.free_head = slab;
			header.capacity += SLAB_LEN;
		}

		let addr = header.free_head;
		let next = read_next_link(txn, addr)?;
		header.free_head = next;
		header.in_use += 1;
		slot.classes[self.class] = header;
		write_header(txn, file, segment, self.class, header)?;

		// `new_content: true` hands back an already-zeroed shadow buffer.
		txn.writable_block(Block::new(addr, Self::element_size()), true)?;
		Ok(addr)
	}

	/// Returns a previously-allocated element to the pool's free list.
	pub fn free(&self, txn: &mut Transaction, file: &BackingFile, segment: u32, addr: FarAddress) -> Result<()> {
		let mut slot = read_slot(txn, file, segment)?;
		let mut header = slot.classes[self.class];
		write_next_link(txn, addr, header.free_head)?;
		header.free_head = addr;
		header.in_use = header.in_use.saturating_sub(1);
		slot.classes[self.class] = header;
		write_header(txn, file, segment, self.class, header)
	}

	/// Reads the raw bytes of the element at `addr`.
	pub fn read(&self, txn: &mut Transaction, addr: FarAddress) -> Result<Vec<u8>> {
		let handle = txn.readonly_block(Block::new(addr, Self::element_size()), false)?;
		Ok(handle.into_bytes())
	}

	/// Writes `value`'s bytes over the element at `addr`.
	pub fn write(&self, txn: &mut Transaction, addr: FarAddress, value: &T) -> Result<()> {
		let handle = txn.writable_block(Block::new(addr, Self::element_size()), false)?;
		handle.with_bytes_mut(|dst| dst[..std::mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(value)));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::file::SEGMENT_HEADER_SIZE;
	use crate::manager::StoreManager;
	use crate::options::StoreOptions;
	use crate::shadow::ShadowPool;
	use crate::topology::slot_sizes;
	use std::sync::Arc;

	#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
	#[repr(C)]
	struct Elem {
		tag: u64,
	}

	fn manager_over_fresh_segment() -> (Arc<StoreManager>, Arc<BackingFile>) {
		let dir = tempfile::tempdir().unwrap();
		let options = StoreOptions::default();
		let file = Arc::new(BackingFile::create(dir.path().join("fixed.db"), &options).unwrap());
		let slots_end = SEGMENT_HEADER_SIZE as u32 + slot_sizes(0).iter().sum::<u32>();
		heap::init_area(&file, 0, slots_end, file.segment_size()).unwrap();
		init_slot(&file, 0).unwrap();
		let manager = Arc::new(StoreManager::new(
			file.clone(),
			Arc::new(ShadowPool::new()),
			options.isolation(),
			std::time::Duration::from_millis(1000),
		));
		std::mem::forget(dir);
		(manager, file)
	}

	#[test]
	fn fresh_slot_starts_with_null_free_head_not_zero() {
		let (manager, file) = manager_over_fresh_segment();
		let mut txn = manager.begin_transaction().unwrap();
		let slot = read_slot(&mut txn, &file, 0).unwrap();
		assert!(slot.classes[0].free_head.is_null());
		txn.rollback();
	}

	#[test]
	fn allocate_then_free_then_reallocate_reuses_slot() {
		let (manager, file) = manager_over_fresh_segment();
		let pool = FixedPool::<Elem>::new(0);
		let mut txn = manager.begin_transaction().unwrap();

		let a = pool.allocate(&mut txn, &file, 0).unwrap();
		pool.write(&mut txn, a, &Elem { tag: 42 }).unwrap();
		pool.free(&mut txn, &file, 0, a).unwrap();

		let b = pool.allocate(&mut txn, &file, 0).unwrap();
		assert_eq!(a, b, "freed slot should be the first one reused");
		txn.commit().unwrap();
	}

	#[test]
	fn allocating_past_one_slab_requests_another() {
		let (manager, file) = manager_over_fresh_segment();
		let pool = FixedPool::<Elem>::new(1);
		let mut txn = manager.begin_transaction().unwrap();

		let mut addrs = Vec::new();
		for _ in 0..(SLAB_LEN + 5) {
			addrs.push(pool.allocate(&mut txn, &file, 0).unwrap());
		}
		let unique: std::collections::HashSet<_> = addrs.iter().map(|a| a.to_u64()).collect();
		assert_eq!(unique.len(), addrs.len(), "every allocated slot must be distinct");
		txn.commit().unwrap();
	}
}
