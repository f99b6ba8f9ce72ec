// SPDX-License-Identifier: Apache-2.0

//! Value storage: terminal values are variable-length byte blobs allocated
//! from the heap allocator (C3) and addressed from a node's `value` field.
//! Laid out as a 4-byte length prefix followed by the payload so a value can
//! be read without consulting anything but its own bytes.

use crate::address::{Block, FarAddress};
use crate::alloc::heap;
use crate::error::Result;
use crate::file::BackingFile;
use crate::manager::Transaction;

pub struct ValueManager;

impl ValueManager {
	pub fn store(txn: &mut Transaction, file: &BackingFile, segment: u32, bytes: &[u8]) -> Result<FarAddress> {
		let total = 4 + bytes.len() as u32;
		let addr = heap::allocate(txn, file, segment, total)?;
		let handle = txn.writable_block(Block::new(addr, total), true)?;
		handle.with_bytes_mut(|dst| {
			dst[0..4].copy_from_slice(&(bytes.len() as u32).to_ne_bytes());
			dst[4..].copy_from_slice(bytes);
		});
		Ok(addr)
	}

	pub fn load(txn: &mut Transaction, addr: FarAddress) -> Result<Vec<u8>> {
		let len_handle = txn.readonly_block(Block::new(addr, 4), false)?;
		let len = u32::from_ne_bytes(len_handle.as_slice().try_into().unwrap());
		let handle = txn.readonly_block(Block::new(addr, 4 + len), false)?;
		Ok(handle.as_slice()[4..].to_vec())
	}

	pub fn free(txn: &mut Transaction, file: &BackingFile, addr: FarAddress) -> Result<()> {
		heap::free(txn, file, addr)
	}

	/// Frees `old` (if set) and stores `bytes` as a new value, used by
	/// `update`/`upsert` when overwriting an existing terminal.
	pub fn replace(txn: &mut Transaction, file: &BackingFile, segment: u32, old: FarAddress, bytes: &[u8]) -> Result<FarAddress> {
		if !old.is_null() {
			Self::free(txn, file, old)?;
		}
		Self::store(txn, file, segment, bytes)
	}
}
