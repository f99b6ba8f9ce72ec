// SPDX-License-Identifier: Apache-2.0

//! Heap Allocator Slot (C3): a boundary-tagged, first-fit free-list allocator
//! over the unclaimed tail of a segment, with immediate coalescing of
//! adjacent free blocks.
//!
//! Every block is laid out as `[header:8][payload][footer:8]`, both header and
//! footer carrying `(size, free_flag)` so a block can be located and classified
//! from either neighbour. A free block additionally threads itself into a
//! singly-doubly linked free list using its first 16 payload bytes to store
//! `(prev, next)` far addresses — payload is otherwise unused while free, so
//! this costs nothing beyond the 16-byte minimum block size.
//!
//! The free list is unordered (first-fit, not the size-ordered set a
//! size-class index would give you); see `DESIGN.md` for why that tradeoff was
//! made here.

use crate::address::{Block, FarAddress};
use crate::error::{Error, Result};
use crate::file::BackingFile;
use crate::manager::Transaction;
use crate::topology::{HeapSlotHeader, SLOT_HEAP};
use crate::ALIGN;

const TAG_SIZE: u32 = 8;
const MIN_PAYLOAD: u32 = 16;
const FREE_FLAG: u32 = 1;
const USED_FLAG: u32 = 0;

fn round_payload(size: u32) -> u32 {
	size.max(MIN_PAYLOAD).next_multiple_of(ALIGN as u32)
}

fn block_total(payload: u32) -> u32 { payload + 2 * TAG_SIZE }

/// Reads the segment's [`HeapSlotHeader`], through the transaction so this
/// counts as a read of the segment for conflict purposes.
fn read_header(txn: &mut Transaction, file: &BackingFile, segment: u32) -> Result<HeapSlotHeader> {
	let topology = file.topology_for(segment)?;
	let offset = topology.offset(SLOT_HEAP).ok_or_else(Error::invalid_block)?;
	let block = Block::new(FarAddress::new(segment, offset), std::mem::size_of::<HeapSlotHeader>() as u32);
	let handle = txn.readonly_block(block, false)?;
	Ok(bytemuck::pod_read_unaligned(handle.as_slice()))
}

fn write_header(txn: &mut Transaction, file: &BackingFile, segment: u32, header: HeapSlotHeader) -> Result<()> {
	let topology = file.topology_for(segment)?;
	let offset = topology.offset(SLOT_HEAP).ok_or_else(Error::invalid_block)?;
	let block = Block::new(FarAddress::new(segment, offset), std::mem::size_of::<HeapSlotHeader>() as u32);
	let handle = txn.writable_block(block, false)?;
	handle.with_bytes_mut(|dst| dst.copy_from_slice(bytemuck::bytes_of(&header)));
	Ok(())
}

/// `(size, is_free)` read from the 8-byte tag at `addr`.
fn read_tag(txn: &mut Transaction, addr: FarAddress) -> Result<(u32, bool)> {
	let block = Block::new(addr, TAG_SIZE);
	let handle = txn.readonly_block(block, false)?;
	let bytes = handle.as_slice();
	let size = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
	let flag = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
	Ok((size, flag == FREE_FLAG))
}

fn write_tag(txn: &mut Transaction, addr: FarAddress, size: u32, free: bool) -> Result<()> {
	let block = Block::new(addr, TAG_SIZE);
	let handle = txn.writable_block(block, true)?;
	handle.with_bytes_mut(|dst| {
		dst[0..4].copy_from_slice(&size.to_ne_bytes());
		dst[4..8].copy_from_slice(&(if free { FREE_FLAG } else { USED_FLAG }).to_ne_bytes());
	});
	Ok(())
}

fn header_addr(block_start: FarAddress) -> FarAddress { block_start }
fn footer_addr(block_start: FarAddress, payload: u32) -> FarAddress { block_start.advance(TAG_SIZE + payload) }
fn payload_addr(block_start: FarAddress) -> FarAddress { block_start.advance(TAG_SIZE) }

fn write_block_tags(txn: &mut Transaction, block_start: FarAddress, payload: u32, free: bool) -> Result<()> {
	write_tag(txn, header_addr(block_start), payload, free)?;
	write_tag(txn, footer_addr(block_start, payload), payload, free)?;
	Ok(())
}

fn read_free_links(txn: &mut Transaction, block_start: FarAddress) -> Result<(FarAddress, FarAddress)> {
	let block = Block::new(payload_addr(block_start), 16);
	let handle = txn.readonly_block(block, false)?;
	let bytes = handle.as_slice();
	let prev = FarAddress::from_u64(u64::from_ne_bytes(bytes[0..8].try_into().unwrap()));
	let next = FarAddress::from_u64(u64::from_ne_bytes(bytes[8..16].try_into().unwrap()));
	Ok((prev, next))
}

fn write_free_links(txn: &mut Transaction, block_start: FarAddress, prev: FarAddress, next: FarAddress) -> Result<()> {
	let block = Block::new(payload_addr(block_start), 16);
	let handle = txn.writable_block(block, true)?;
	handle.with_bytes_mut(|dst| {
		dst[0..8].copy_from_slice(&prev.to_u64().to_ne_bytes());
		dst[8..16].copy_from_slice(&next.to_u64().to_ne_bytes());
	});
	Ok(())
}

/// Unlinks `addr` from the free list headed by `header.free_head`, patching
/// its neighbours' links (or the head itself).
fn unlink_free(txn: &mut Transaction, file: &BackingFile, segment: u32, mut header: HeapSlotHeader, addr: FarAddress) -> Result<HeapSlotHeader> {
	let (prev, next) = read_free_links(txn, addr)?;
	if prev.is_null() {
		header.free_head = next;
	} else {
		let (pp, _) = read_free_links(txn, prev)?;
		write_free_links(txn, prev, pp, next)?;
	}
	if !next.is_null() {
		let (_, nn) = read_free_links(txn, next)?;
		write_free_links(txn, next, prev, nn)?;
	}
	write_header(txn, file, segment, header)?;
	Ok(header)
}

fn link_free_head(txn: &mut Transaction, file: &BackingFile, segment: u32, mut header: HeapSlotHeader, addr: FarAddress) -> Result<HeapSlotHeader> {
	let old_head = header.free_head;
	write_free_links(txn, addr, FarAddress::NULL, old_head)?;
	if !old_head.is_null() {
		let (_, nn) = read_free_links(txn, old_head)?;
		write_free_links(txn, old_head, addr, nn)?;
	}
	header.free_head = addr;
	write_header(txn, file, segment, header)?;
	Ok(header)
}

/// Allocates `payload_size` bytes in `segment`, returning the far address of
/// the usable payload (not the header). Tries the free list first-fit, then
/// falls back to bumping the segment's unclaimed tail.
pub fn allocate(txn: &mut Transaction, file: &BackingFile, segment: u32, payload_size: u32) -> Result<FarAddress> {
	let payload_size = round_payload(payload_size);
	let mut header = read_header(txn, file, segment)?;
	if header.area_end == 0 {
		return Err(Error::invalid_block());
	}

	let mut cursor = header.free_head;
	while !cursor.is_null() {
		let (size, is_free) = read_tag(txn, header_addr(cursor))?;
		debug_assert!(is_free, "free list entry not marked free");
		if size >= payload_size {
			header = unlink_free(txn, file, segment, header, cursor)?;
			let remaining = size - payload_size;
			if remaining >= block_total(MIN_PAYLOAD) {
				let split_payload = remaining - 2 * TAG_SIZE;
				write_block_tags(txn, cursor, payload_size, false)?;
				let split_start = footer_addr(cursor, payload_size).advance(TAG_SIZE);
				write_block_tags(txn, split_start, split_payload, true)?;
				header = link_free_head(txn, file, segment, header, split_start)?;
			} else {
				write_block_tags(txn, cursor, size, false)?;
			}
			return Ok(payload_addr(cursor));
		}
		let (_, next) = read_free_links(txn, cursor)?;
		cursor = next;
	}

	let needed = block_total(payload_size);
	let start = FarAddress::new(segment, header.tail);
	if header.tail as u64 + needed as u64 > header.area_end as u64 {
		return Err(Error::no_memory());
	}
	write_block_tags(txn, start, payload_size, false)?;
	header.tail += needed;
	write_header(txn, file, segment, header)?;
	Ok(payload_addr(start))
}

/// Frees a payload previously returned by [`allocate`], coalescing with free
/// neighbours in the same segment.
pub fn free(txn: &mut Transaction, file: &BackingFile, addr: FarAddress) -> Result<()> {
	let segment = addr.segment();
	let mut block_start = FarAddress::new(segment, addr.offset() - TAG_SIZE);
	let (mut size, is_free) = read_tag(txn, header_addr(block_start))?;
	if is_free {
		return Err(Error::invalid_block());
	}

	let mut header = read_header(txn, file, segment)?;

	// Coalesce forward: the next block's header sits immediately after our footer.
	let next_start = footer_addr(block_start, size).advance(TAG_SIZE);
	if next_start.offset() < header.tail {
		if let Ok((next_size, next_free)) = read_tag(txn, header_addr(next_start)) {
			if next_free {
				header = unlink_free(txn, file, segment, header, next_start)?;
				size += 2 * TAG_SIZE + next_size;
			}
		}
	}

	// Coalesce backward: our header is preceded by the previous block's footer.
	if block_start.offset() > header.area_start {
		let prev_footer = FarAddress::new(segment, block_start.offset() - TAG_SIZE);
		let (prev_size, prev_free) = read_tag(txn, prev_footer)?;
		if prev_free {
			let prev_start = FarAddress::new(segment, prev_footer.offset() - TAG_SIZE - prev_size);
			header = unlink_free(txn, file, segment, header, prev_start)?;
			size += 2 * TAG_SIZE + prev_size;
			block_start = prev_start;
		}
	}

	write_block_tags(txn, block_start, size, true)?;
	link_free_head(txn, file, segment, header, block_start)?;
	Ok(())
}

/// Initialises a fresh segment's heap area `[start, end)`. Called directly
/// against the backing file (not through a transaction) at segment-creation
/// time, alongside `BackingFile::ensure_segment`'s own header writes.
pub fn init_area(file: &BackingFile, segment: u32, start: u32, end: u32) -> Result<()> {
	let topology = file.topology_for(segment)?;
	let offset = topology.offset(SLOT_HEAP).ok_or_else(Error::invalid_block)?;
	let header = HeapSlotHeader {
		area_start: start,
		area_end: end,
		tail: start,
		_pad: 0,
		free_head: FarAddress::NULL,
	};
	let block = Block::new(FarAddress::new(segment, offset), std::mem::size_of::<HeapSlotHeader>() as u32);
	file.write_raw(block, bytemuck::bytes_of(&header))
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

	fn manager_over_fresh_segment() -> (Arc<StoreManager>, Arc<BackingFile>) {
		let dir = tempfile::tempdir().unwrap();
		let options = StoreOptions::default();
		let file = Arc::new(BackingFile::create(dir.path().join("heap.db"), &options).unwrap());
		let slots_end = SEGMENT_HEADER_SIZE as u32 + slot_sizes(0).iter().sum::<u32>();
		init_area(&file, 0, slots_end, file.segment_size()).unwrap();
		let manager = Arc::new(StoreManager::new(
			file.clone(),
			Arc::new(ShadowPool::new()),
			options.isolation(),
			std::time::Duration::from_millis(1000),
		));
		// keep the tempdir alive for the process lifetime of the test by leaking it;
		// the file handle already has everything it needs memory-mapped.
		std::mem::forget(dir);
		(manager, file)
	}

	#[test]
	fn allocate_then_free_round_trips() {
		let (manager, file) = manager_over_fresh_segment();
		let mut txn = manager.begin_transaction().unwrap();
		let a = allocate(&mut txn, &file, 0, 32).unwrap();
		assert!(!a.is_null());
		free(&mut txn, &file, a).unwrap();
		txn.commit().unwrap();
	}

	#[test]
	fn adjacent_frees_coalesce_into_one_block() {
		let (manager, file) = manager_over_fresh_segment();
		let mut txn = manager.begin_transaction().unwrap();
		let a = allocate(&mut txn, &file, 0, 32).unwrap();
		let b = allocate(&mut txn, &file, 0, 32).unwrap();
		let c = allocate(&mut txn, &file, 0, 32).unwrap();

		free(&mut txn, &file, a).unwrap();
		free(&mut txn, &file, c).unwrap();
		free(&mut txn, &file, b).unwrap();

		// All three should now be one coalesced free block big enough for a
		// larger allocation spanning all of them.
		let big = allocate(&mut txn, &file, 0, 32 * 3 + 32).unwrap();
		assert!(!big.is_null());
		txn.commit().unwrap();
	}

	#[test]
	fn allocate_beyond_area_end_fails() {
		let (manager, file) = manager_over_fresh_segment();
		let mut txn = manager.begin_transaction().unwrap();
		let huge = file.segment_size() * 2;
		assert!(allocate(&mut txn, &file, 0, huge).is_err());
		txn.rollback();
	}
}
