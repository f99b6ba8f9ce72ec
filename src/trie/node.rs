// SPDX-License-Identifier: Apache-2.0

//! Trie Node (C8): a path-compressed radix node in one of six capacity
//! classes (8/16/32/64/128/256 children), stored as a fixed-size POD struct so
//! it can live in a [`FixedPool`](crate::alloc::fixed::FixedPool) slab.
//!
//! Every class shares the same header shape — version counter, terminal
//! value address, 256-bit presence bitset, inline compressed stem — and
//! differs only in the size of its dense `keys`/`children` arrays. A node
//! that outgrows its class is rebuilt one class up by [`grow`]; this bumps
//! `version`, which is how an in-flight [`Cursor`](super::cursor::Cursor)
//! notices it needs to resynchronize.

use bytemuck::{Pod, Zeroable};
use crate::address::{FarAddress, NodeRef};

/// Inline capacity of a node's path-compressed prefix segment.
pub const STEM_CAP: usize = 32;

/// The dense child-array sizes of the six node capacity classes, in growth
/// order.
pub const CAPACITY_CLASSES: [u16; 6] = [8, 16, 32, 64, 128, 256];

fn presence_set(presence: &mut [u64; 4], byte: u8) {
	presence[(byte >> 6) as usize] |= 1u64 << (byte & 63);
}

fn presence_clear(presence: &mut [u64; 4], byte: u8) {
	presence[(byte >> 6) as usize] &= !(1u64 << (byte & 63));
}

fn presence_test(presence: &[u64; 4], byte: u8) -> bool {
	presence[(byte >> 6) as usize] & (1u64 << (byte & 63)) != 0
}

macro_rules! define_node {
	($name:ident, $cap:expr, $class:expr) => {
		#[repr(C)]
		#[derive(Copy, Clone, Pod, Zeroable)]
		pub struct $name {
			pub version: u32,
			pub child_count: u16,
			pub stem_len: u8,
			pub _pad: u8,
			pub value: FarAddress,
			pub presence: [u64; 4],
			pub stem: [u8; STEM_CAP],
			pub keys: [u8; $cap],
			pub children: [NodeRef; $cap],
		}

		impl Default for $name {
			fn default() -> Self {
				// A zeroed FarAddress/NodeRef is (segment 0, offset 0), not null
				// (only (EOS, EOS) is) -- a fresh node must null these out
				// explicitly, or it reads back as terminal with a bogus value and
				// every unused child slot reads back as a live reference.
				let mut node: Self = bytemuck::Zeroable::zeroed();
				node.value = FarAddress::NULL;
				for child in node.children.iter_mut() {
					*child = NodeRef::NULL;
				}
				node
			}
		}

		impl $name {
			pub const CLASS: usize = $class;
			pub const CAPACITY: usize = $cap;

			pub fn stem(&self) -> &[u8] { &self.stem[..self.stem_len as usize] }

			pub fn set_stem(&mut self, bytes: &[u8]) {
				assert!(bytes.len() <= STEM_CAP, "stem exceeds inline capacity");
				self.stem_len = bytes.len() as u8;
				self.stem[..bytes.len()].copy_from_slice(bytes);
			}

			pub fn is_terminal(&self) -> bool { !self.value.is_null() }

			pub fn is_full(&self) -> bool { self.child_count as usize >= $cap }

			pub fn find_child(&self, byte: u8) -> Option<NodeRef> {
				if !presence_test(&self.presence, byte) { return None; }
				self.keys[..self.child_count as usize].iter()
					.position(|&k| k == byte)
					.map(|i| self.children[i])
			}

			/// Inserts or overwrites the child for `byte`. Returns `false`
			/// without modifying the node if it is full and `byte` is new.
			pub fn set_child(&mut self, byte: u8, addr: NodeRef) -> bool {
				if let Some(i) = self.keys[..self.child_count as usize].iter().position(|&k| k == byte) {
					self.children[i] = addr;
					return true;
				}
				if self.is_full() { return false; }
				let i = self.child_count as usize;
				self.keys[i] = byte;
				self.children[i] = addr;
				self.child_count += 1;
				presence_set(&mut self.presence, byte);
				true
			}

			pub fn remove_child(&mut self, byte: u8) -> bool {
				let Some(i) = self.keys[..self.child_count as usize].iter().position(|&k| k == byte) else { return false };
				let last = self.child_count as usize - 1;
				self.keys[i] = self.keys[last];
				self.children[i] = self.children[last];
				self.child_count -= 1;
				presence_clear(&mut self.presence, byte);
				true
			}

			/// Returns `(byte, child)` pairs in ascending byte order.
			pub fn sorted_children(&self) -> Vec<(u8, NodeRef)> {
				let mut v: Vec<(u8, NodeRef)> = self.keys[..self.child_count as usize].iter().copied()
					.zip(self.children[..self.child_count as usize].iter().copied())
					.collect();
				v.sort_by_key(|&(k, _)| k);
				v
			}
		}
	};
}

define_node!(Node8, 8, 0);
define_node!(Node16, 16, 1);
define_node!(Node32, 32, 2);
define_node!(Node64, 64, 3);
define_node!(Node128, 128, 4);
define_node!(Node256, 256, 5);

/// A type-erased view over one of the six node classes, reconstructed from
/// raw bytes read through a transaction once the class is known (from the far
/// address's allocator class, tracked by the caller).
#[derive(Copy, Clone)]
pub enum AnyNode {
	C8(Node8),
	C16(Node16),
	C32(Node32),
	C64(Node64),
	C128(Node128),
	C256(Node256),
}

macro_rules! delegate {
	($self:expr, $node:ident => $body:expr) => {
		match $self {
			AnyNode::C8($node) => $body,
			AnyNode::C16($node) => $body,
			AnyNode::C32($node) => $body,
			AnyNode::C64($node) => $body,
			AnyNode::C128($node) => $body,
			AnyNode::C256($node) => $body,
		}
	};
}

impl AnyNode {
	pub fn empty(class: usize) -> Self {
		match class {
			0 => AnyNode::C8(Node8::default()),
			1 => AnyNode::C16(Node16::default()),
			2 => AnyNode::C32(Node32::default()),
			3 => AnyNode::C64(Node64::default()),
			4 => AnyNode::C128(Node128::default()),
			5 => AnyNode::C256(Node256::default()),
			_ => unreachable!("invalid node capacity class"),
		}
	}

	pub fn class(&self) -> usize {
		match self {
			AnyNode::C8(_) => 0,
			AnyNode::C16(_) => 1,
			AnyNode::C32(_) => 2,
			AnyNode::C64(_) => 3,
			AnyNode::C128(_) => 4,
			AnyNode::C256(_) => 5,
		}
	}

	pub fn bytes(&self) -> &[u8] {
		delegate!(self, n => bytemuck::bytes_of(n))
	}

	/// Reconstructs a node of `class` from `bytes`, which may carry trailing
	/// alignment padding beyond the struct's own size.
	pub fn from_bytes(class: usize, bytes: &[u8]) -> Self {
		macro_rules! read_as {
			($ty:ty) => {{
				let exact = &bytes[..std::mem::size_of::<$ty>()];
				*bytemuck::from_bytes::<$ty>(exact)
			}};
		}
		match class {
			0 => AnyNode::C8(read_as!(Node8)),
			1 => AnyNode::C16(read_as!(Node16)),
			2 => AnyNode::C32(read_as!(Node32)),
			3 => AnyNode::C64(read_as!(Node64)),
			4 => AnyNode::C128(read_as!(Node128)),
			5 => AnyNode::C256(read_as!(Node256)),
			_ => unreachable!("invalid node capacity class"),
		}
	}

	pub fn version(&self) -> u32 { delegate!(self, n => n.version) }
	pub fn bump_version(&mut self) { delegate!(self, n => n.version = n.version.wrapping_add(1)) }
	pub fn value(&self) -> FarAddress { delegate!(self, n => n.value) }
	pub fn set_value(&mut self, addr: FarAddress) { delegate!(self, n => n.value = addr) }
	pub fn is_terminal(&self) -> bool { delegate!(self, n => n.is_terminal()) }
	pub fn stem(&self) -> Vec<u8> { delegate!(self, n => n.stem().to_vec()) }
	pub fn set_stem(&mut self, bytes: &[u8]) { delegate!(self, n => n.set_stem(bytes)) }
	pub fn is_full(&self) -> bool { delegate!(self, n => n.is_full()) }
	pub fn child_count(&self) -> usize { delegate!(self, n => n.child_count as usize) }
	pub fn find_child(&self, byte: u8) -> Option<NodeRef> { delegate!(self, n => n.find_child(byte)) }
	pub fn set_child(&mut self, byte: u8, addr: NodeRef) -> bool { delegate!(self, n => n.set_child(byte, addr)) }
	pub fn remove_child(&mut self, byte: u8) -> bool { delegate!(self, n => n.remove_child(byte)) }
	pub fn sorted_children(&self) -> Vec<(u8, NodeRef)> { delegate!(self, n => n.sorted_children()) }

	/// Rebuilds this node's content into the next-larger capacity class.
	/// Returns `None` if already at the largest class (256).
	pub fn grown(&self) -> Option<Self> {
		let next_class = self.class() + 1;
		if next_class >= CAPACITY_CLASSES.len() { return None; }
		let mut grown = Self::empty(next_class);
		grown.set_value(self.value());
		grown.set_stem(&self.stem());
		for (byte, child) in self.sorted_children() {
			grown.set_child(byte, child);
		}
		delegate!(&mut grown, n => n.version = self.version().wrapping_add(1));
		Some(grown)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ref_for(byte: u8) -> NodeRef { NodeRef::new(FarAddress::new(0, byte as u32 + 1), 0) }

	#[test]
	fn set_child_then_find_child_round_trips() {
		let mut node = AnyNode::empty(0);
		assert!(node.set_child(b'a', ref_for(b'a')));
		assert!(node.set_child(b'z', ref_for(b'z')));
		assert_eq!(node.find_child(b'a'), Some(ref_for(b'a')));
		assert_eq!(node.find_child(b'z'), Some(ref_for(b'z')));
		assert_eq!(node.find_child(b'm'), None);
		assert_eq!(node.child_count(), 2);
	}

	#[test]
	fn set_child_fails_once_class_capacity_is_full() {
		let mut node = AnyNode::empty(0); // Node8, capacity 8
		for i in 0..8u8 {
			assert!(node.set_child(i, ref_for(i)));
		}
		assert!(!node.set_child(200, ref_for(200)), "a full node8 must reject a 9th distinct child");
		// Overwriting an existing key is always fine, even when full.
		assert!(node.set_child(3, ref_for(99)));
		assert_eq!(node.find_child(3), Some(ref_for(99)));
	}

	#[test]
	fn remove_child_clears_presence_bit() {
		let mut node = AnyNode::empty(0);
		node.set_child(b'x', ref_for(b'x'));
		assert!(node.remove_child(b'x'));
		assert_eq!(node.find_child(b'x'), None);
		assert!(!node.remove_child(b'x'), "removing an absent child returns false");
	}

	#[test]
	fn sorted_children_is_ascending_by_byte() {
		let mut node = AnyNode::empty(0);
		for b in [b'z', b'a', b'm', b'c'] {
			node.set_child(b, ref_for(b));
		}
		let order: Vec<u8> = node.sorted_children().into_iter().map(|(b, _)| b).collect();
		assert_eq!(order, vec![b'a', b'c', b'm', b'z']);
	}

	#[test]
	fn grown_preserves_stem_value_and_children_and_bumps_version() {
		let mut node = AnyNode::empty(0);
		node.set_stem(b"hello");
		node.set_value(FarAddress::new(0, 77));
		for b in [b'a', b'b', b'c'] {
			node.set_child(b, ref_for(b));
		}
		let before_version = node.version();

		let grown = node.grown().expect("class 0 can grow to class 1");
		assert_eq!(grown.class(), 1);
		assert_eq!(grown.stem(), b"hello");
		assert_eq!(grown.value(), FarAddress::new(0, 77));
		assert_eq!(grown.sorted_children(), node.sorted_children());
		assert_eq!(grown.version(), before_version.wrapping_add(1));
	}

	#[test]
	fn largest_class_cannot_grow_further() {
		let node = AnyNode::empty(CAPACITY_CLASSES.len() - 1);
		assert!(node.grown().is_none());
	}

	#[test]
	fn fresh_node_is_not_terminal() {
		let node = AnyNode::empty(0);
		assert!(!node.is_terminal());
		assert!(node.value().is_null());
	}

	#[test]
	fn bytes_round_trip_through_from_bytes() {
		let mut node = AnyNode::empty(2);
		node.set_stem(b"prefix");
		node.set_child(b'q', ref_for(b'q'));
		let bytes = node.bytes().to_vec();
		let restored = AnyNode::from_bytes(2, &bytes);
		assert_eq!(restored.stem(), node.stem());
		assert_eq!(restored.find_child(b'q'), node.find_child(b'q'));
	}
}
