// SPDX-License-Identifier: Apache-2.0

//! [`FarAddress`], the single address space spanning every segment, and [`Block`],
//! a contiguous byte range within one segment that a far address anchors.

use std::fmt;
use bytemuck::{Pod, Zeroable};

/// Sentinel used for either half of a [`FarAddress`] to mean "no address" (`EOS`,
/// end-of-segments). Mirrors `~0u32` from the file format.
pub const EOS: u32 = u32::MAX;

/// A 64-bit handle `(segment_index, offset)` addressing a byte in the backing
/// file. Arithmetic on a far address is offset-only; a single [`Block`] may never
/// cross a segment boundary.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct FarAddress {
	segment: u32,
	offset: u32,
}

impl FarAddress {
	/// The null far address, `(EOS, EOS)`.
	pub const NULL: FarAddress = FarAddress { segment: EOS, offset: EOS };

	#[inline]
	pub const fn new(segment: u32, offset: u32) -> Self {
		Self { segment, offset }
	}

	#[inline]
	pub const fn segment(self) -> u32 { self.segment }
	#[inline]
	pub const fn offset(self) -> u32 { self.offset }

	#[inline]
	pub const fn is_null(self) -> bool { self.segment == EOS || self.offset == EOS }

	/// Returns a far address offset by `n` bytes, still within the same segment.
	/// Panics in debug builds if this address is null.
	#[inline]
	pub fn advance(self, n: u32) -> Self {
		debug_assert!(!self.is_null(), "advancing a null far address");
		Self::new(self.segment, self.offset + n)
	}

	/// Packs the address into a single `u64`, `(segment << 32) | offset`.
	#[inline]
	pub const fn to_u64(self) -> u64 {
		((self.segment as u64) << 32) | self.offset as u64
	}

	#[inline]
	pub const fn from_u64(bits: u64) -> Self {
		Self::new((bits >> 32) as u32, bits as u32)
	}
}

impl Default for FarAddress {
	fn default() -> Self { Self::NULL }
}

impl fmt::Debug for FarAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_null() {
			write!(f, "FarAddress(null)")
		} else {
			write!(f, "FarAddress({}:{})", self.segment, self.offset)
		}
	}
}

impl From<u64> for FarAddress {
	fn from(bits: u64) -> Self { Self::from_u64(bits) }
}

impl From<FarAddress> for u64 {
	fn from(addr: FarAddress) -> Self { addr.to_u64() }
}

/// A contiguous byte range `[addr, addr+len)`, entirely within one segment.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Block {
	addr: FarAddress,
	len: u32,
}

impl Block {
	#[inline]
	pub const fn new(addr: FarAddress, len: u32) -> Self {
		Self { addr, len }
	}

	#[inline]
	pub const fn addr(self) -> FarAddress { self.addr }
	#[inline]
	pub const fn len(self) -> u32 { self.len }
	#[inline]
	pub const fn is_empty(self) -> bool { self.len == 0 }

	#[inline]
	pub fn segment(self) -> u32 { self.addr.segment() }
	#[inline]
	pub fn start(self) -> u32 { self.addr.offset() }
	#[inline]
	pub fn end(self) -> u32 { self.addr.offset() + self.len }

	/// Returns `true` if this block and `other` share at least one byte and live
	/// in the same segment.
	pub fn overlaps(self, other: Block) -> bool {
		self.segment() == other.segment() && self.start() < other.end() && other.start() < self.end()
	}

	/// Returns the intersection of this block and `other`, if any, expressed as
	/// an offset range local to each block's start (`self_off`, `other_off`, `len`).
	pub fn intersection(self, other: Block) -> Option<(u32, u32, u32)> {
		if !self.overlaps(other) { return None; }
		let start = self.start().max(other.start());
		let end = self.end().min(other.end());
		Some((start - self.start(), start - other.start(), end - start))
	}
}

/// Addresses a trie node together with the capacity class its bytes must be
/// interpreted as (see `trie::node`) — a bare [`FarAddress`] alone doesn't
/// carry enough information to know which of the six fixed-size node pools it
/// was allocated from.
#[derive(Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct NodeRef {
	pub addr: FarAddress,
	pub class: u32,
}

impl NodeRef {
	pub const NULL: NodeRef = NodeRef { addr: FarAddress::NULL, class: u32::MAX };

	#[inline]
	pub const fn new(addr: FarAddress, class: usize) -> Self {
		Self { addr, class: class as u32 }
	}

	#[inline]
	pub fn is_null(self) -> bool { self.addr.is_null() }
	#[inline]
	pub fn class(self) -> usize { self.class as usize }
}

impl Default for NodeRef {
	fn default() -> Self { Self::NULL }
}

impl fmt::Debug for NodeRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_null() { write!(f, "NodeRef(null)") } else { write!(f, "NodeRef({:?}, class {})", self.addr, self.class) }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zeroed_far_address_is_not_null() {
		// A freshly grown, zero-filled mmap reads back as segment 0, offset 0,
		// which is a valid address — not null. Only (EOS, EOS) is null. Callers
		// that lay out a fresh segment must write FarAddress::NULL explicitly.
		let zeroed: FarAddress = bytemuck::Zeroable::zeroed();
		assert_eq!(zeroed, FarAddress::new(0, 0));
		assert!(!zeroed.is_null());
		assert!(FarAddress::NULL.is_null());
	}

	#[test]
	fn zeroed_node_ref_is_not_null_either() {
		let zeroed: NodeRef = bytemuck::Zeroable::zeroed();
		assert!(!zeroed.is_null());
		assert!(NodeRef::NULL.is_null());
	}

	#[test]
	fn round_trip_through_u64() {
		let addr = FarAddress::new(7, 1234);
		assert_eq!(FarAddress::from_u64(addr.to_u64()), addr);
	}

	#[test]
	fn block_overlap_and_intersection() {
		let a = Block::new(FarAddress::new(0, 10), 20);
		let b = Block::new(FarAddress::new(0, 25), 20);
		let c = Block::new(FarAddress::new(1, 10), 20);

		assert!(a.overlaps(b));
		assert_eq!(a.intersection(b), Some((15, 0, 5)));
		assert!(!a.overlaps(c), "different segments never overlap");
		assert_eq!(a.intersection(c), None);
	}

	#[test]
	fn adjacent_blocks_do_not_overlap() {
		let a = Block::new(FarAddress::new(0, 0), 10);
		let b = Block::new(FarAddress::new(0, 10), 10);
		assert!(!a.overlaps(b));
	}
}
