// SPDX-License-Identifier: Apache-2.0

//! Radix Trie (C9): the ordered key-value index built on top of the node
//! pools (C8) and the event-sourcing transaction layer (C7).
//!
//! All trie storage — nodes and values alike — currently lives in segment 0;
//! spilling into further segments once it fills is tracked as an open
//! limitation (see `DESIGN.md`).

pub mod node;
pub mod value;
pub mod cursor;

use crate::address::{Block, FarAddress, NodeRef};
use crate::alloc::fixed::FixedPool;
use crate::error::{Error, Result};
use crate::file::BackingFile;
use crate::manager::{StoreManager, Transaction};
use crate::topology::{SLOT_RESIDENCE, TrieResidence};
use node::{AnyNode, Node8, Node16, Node32, Node64, Node128, Node256};
use value::ValueManager;
use std::sync::Arc;

/// The segment every trie node and value currently lives in.
const SEGMENT: u32 = 0;

struct NodePools {
	p8: FixedPool<Node8>,
	p16: FixedPool<Node16>,
	p32: FixedPool<Node32>,
	p64: FixedPool<Node64>,
	p128: FixedPool<Node128>,
	p256: FixedPool<Node256>,
}

impl NodePools {
	fn new() -> Self {
		Self {
			p8: FixedPool::new(0), p16: FixedPool::new(1), p32: FixedPool::new(2),
			p64: FixedPool::new(3), p128: FixedPool::new(4), p256: FixedPool::new(5),
		}
	}

	fn alloc(&self, txn: &mut Transaction, file: &BackingFile, segment: u32, class: usize) -> Result<NodeRef> {
		let addr = match class {
			0 => self.p8.allocate(txn, file, segment)?,
			1 => self.p16.allocate(txn, file, segment)?,
			2 => self.p32.allocate(txn, file, segment)?,
			3 => self.p64.allocate(txn, file, segment)?,
			4 => self.p128.allocate(txn, file, segment)?,
			5 => self.p256.allocate(txn, file, segment)?,
			_ => return Err(Error::invalid_block()),
		};
		Ok(NodeRef::new(addr, class))
	}

	fn free(&self, txn: &mut Transaction, file: &BackingFile, segment: u32, r: NodeRef) -> Result<()> {
		match r.class() {
			0 => self.p8.free(txn, file, segment, r.addr),
			1 => self.p16.free(txn, file, segment, r.addr),
			2 => self.p32.free(txn, file, segment, r.addr),
			3 => self.p64.free(txn, file, segment, r.addr),
			4 => self.p128.free(txn, file, segment, r.addr),
			5 => self.p256.free(txn, file, segment, r.addr),
			_ => Err(Error::invalid_block()),
		}
	}

	fn read(&self, txn: &mut Transaction, r: NodeRef) -> Result<AnyNode> {
		let bytes = match r.class() {
			0 => self.p8.read(txn, r.addr)?,
			1 => self.p16.read(txn, r.addr)?,
			2 => self.p32.read(txn, r.addr)?,
			3 => self.p64.read(txn, r.addr)?,
			4 => self.p128.read(txn, r.addr)?,
			5 => self.p256.read(txn, r.addr)?,
			_ => return Err(Error::invalid_block()),
		};
		Ok(AnyNode::from_bytes(r.class(), &bytes))
	}

	fn write(&self, txn: &mut Transaction, r: NodeRef, node: &AnyNode) -> Result<()> {
		debug_assert_eq!(r.class(), node.class());
		match node {
			AnyNode::C8(n) => self.p8.write(txn, r.addr, n),
			AnyNode::C16(n) => self.p16.write(txn, r.addr, n),
			AnyNode::C32(n) => self.p32.write(txn, r.addr, n),
			AnyNode::C64(n) => self.p64.write(txn, r.addr, n),
			AnyNode::C128(n) => self.p128.write(txn, r.addr, n),
			AnyNode::C256(n) => self.p256.write(txn, r.addr, n),
		}
	}
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
	a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn residence_block(file: &BackingFile) -> Result<Block> {
	let topology = file.topology_for(0)?;
	let offset = topology.offset(SLOT_RESIDENCE).ok_or_else(Error::invalid_block)?;
	Ok(Block::new(FarAddress::new(0, offset), std::mem::size_of::<TrieResidence>() as u32))
}

fn read_residence(txn: &mut Transaction, file: &BackingFile) -> Result<TrieResidence> {
	let handle = txn.readonly_block(residence_block(file)?, false)?;
	Ok(bytemuck::pod_read_unaligned(handle.as_slice()))
}

fn write_residence(txn: &mut Transaction, file: &BackingFile, residence: TrieResidence) -> Result<()> {
	let handle = txn.writable_block(residence_block(file)?, false)?;
	handle.with_bytes_mut(|dst| dst.copy_from_slice(bytemuck::bytes_of(&residence)));
	Ok(())
}

/// The ordered key-value index. Cloning shares the same underlying store (it
/// is a thin handle around the manager and file, both already `Arc`-backed).
#[derive(Clone)]
pub struct Trie {
	manager: Arc<StoreManager>,
	file: Arc<BackingFile>,
	pools: Arc<NodePools>,
}

impl Trie {
	pub(crate) fn new(manager: Arc<StoreManager>, file: Arc<BackingFile>) -> Self {
		Self { manager, file, pools: Arc::new(NodePools::new()) }
	}

	pub fn manager(&self) -> &Arc<StoreManager> { &self.manager }

	/// Looks up `key`, returning its value if present. Takes its own
	/// read-only transaction.
	pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let mut txn = self.manager.begin_ro_transaction()?;
		let result = self.find_in(&mut txn, key);
		txn.commit()?;
		result
	}

	fn find_in(&self, txn: &mut Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let residence = read_residence(txn, &self.file)?;
		let Some(value_addr) = self.locate(txn, residence.root, key)? else { return Ok(None) };
		Ok(Some(ValueManager::load(txn, value_addr)?))
	}

	/// Returns `true` if `key` has a stored value, without materializing it.
	pub fn check_exists(&self, key: &[u8]) -> Result<bool> {
		let mut txn = self.manager.begin_ro_transaction()?;
		let residence = read_residence(&mut txn, &self.file)?;
		let found = self.locate(&mut txn, residence.root, key)?.is_some();
		txn.commit()?;
		Ok(found)
	}

	/// Descends to the node exactly matching `key`, returning its value
	/// address if it is a terminal.
	fn locate(&self, txn: &mut Transaction, mut cur: NodeRef, mut key: &[u8]) -> Result<Option<FarAddress>> {
		loop {
			if cur.is_null() { return Ok(None); }
			let node = self.pools.read(txn, cur)?;
			let stem = node.stem();
			let common = common_prefix_len(key, &stem);
			if common != stem.len() { return Ok(None); }
			key = &key[stem.len()..];
			if key.is_empty() {
				return Ok(if node.is_terminal() { Some(node.value()) } else { None });
			}
			let Some(child) = node.find_child(key[0]) else { return Ok(None) };
			key = &key[1..];
			cur = child;
		}
	}

	pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
		if self.check_exists(key)? { return Ok(false); }
		self.upsert(key, value)?;
		Ok(true)
	}

	pub fn update(&self, key: &[u8], value: &[u8]) -> Result<bool> {
		if !self.check_exists(key)? { return Ok(false); }
		self.upsert(key, value)?;
		Ok(true)
	}

	/// Inserts `key` with `value`, replacing any existing value. Returns
	/// `true` if a prior value was replaced.
	pub fn upsert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
		let mut txn = self.manager.begin_transaction()?;
		let mut residence = read_residence(&mut txn, &self.file)?;
		let mut delta: i64 = 0;
		let (new_root, replaced) = self.upsert_rec(&mut txn, residence.root, key, value, &mut delta)?;
		residence.root = new_root;
		if !replaced { residence.size += 1; }
		residence.nodes_count = (residence.nodes_count as i64 + delta) as u64;
		write_residence(&mut txn, &self.file, residence)?;
		txn.commit()?;
		Ok(replaced)
	}

	/// Core recursive insert-or-replace. Returns the (possibly relocated due
	/// to growth or a stem split) ref for the caller to store, and whether an
	/// existing terminal was replaced. `delta` accumulates the net change in
	/// allocated node count across the whole call tree.
	fn upsert_rec(&self, txn: &mut Transaction, cur: NodeRef, key: &[u8], value: &[u8], delta: &mut i64) -> Result<(NodeRef, bool)> {
		if cur.is_null() {
			return Ok((self.create_chain(txn, key, value, delta)?, false));
		}

		let mut node = self.pools.read(txn, cur)?;
		let stem = node.stem();
		let common = common_prefix_len(key, &stem);

		if common == stem.len() {
			let remaining = &key[common..];
			if remaining.is_empty() {
				let replaced = node.is_terminal();
				let old = node.value();
				let value_addr = ValueManager::replace(txn, &self.file, SEGMENT, old, value)?;
				node.set_value(value_addr);
				self.pools.write(txn, cur, &node)?;
				return Ok((cur, replaced));
			}
			let edge_byte = remaining[0];
			let child_key = &remaining[1..];
			let existing_child = node.find_child(edge_byte);
			let (new_child, replaced) = self.upsert_rec(txn, existing_child.unwrap_or(NodeRef::NULL), child_key, value, delta)?;
			if node.set_child(edge_byte, new_child) {
				node.bump_version();
				self.pools.write(txn, cur, &node)?;
				return Ok((cur, replaced));
			}
			let mut grown = node.grown().ok_or_else(Error::invalid_block)?;
			if !grown.set_child(edge_byte, new_child) {
				return Err(Error::invalid_block());
			}
			let new_ref = self.pools.alloc(txn, &self.file, SEGMENT, grown.class())?;
			*delta += 1;
			self.pools.write(txn, new_ref, &grown)?;
			self.pools.free(txn, &self.file, SEGMENT, cur)?;
			*delta -= 1;
			return Ok((new_ref, replaced));
		}

		// Partial stem match: split this node at the common prefix.
		let old_remaining = stem[common..].to_vec();
		let old_edge_byte = old_remaining[0];
		node.set_stem(&old_remaining[1..]);
		node.bump_version();
		self.pools.write(txn, cur, &node)?;

		let mut intermediate = AnyNode::empty(0);
		intermediate.set_stem(&key[..common]);
		intermediate.set_child(old_edge_byte, cur);

		let key_remaining = &key[common..];
		let replaced = if key_remaining.is_empty() {
			let value_addr = ValueManager::store(txn, &self.file, SEGMENT, value)?;
			intermediate.set_value(value_addr);
			false
		} else {
			let new_edge_byte = key_remaining[0];
			let leaf_ref = self.create_chain(txn, &key_remaining[1..], value, delta)?;
			intermediate.set_child(new_edge_byte, leaf_ref);
			false
		};

		let intermediate_ref = self.pools.alloc(txn, &self.file, SEGMENT, 0)?;
		*delta += 1;
		self.pools.write(txn, intermediate_ref, &intermediate)?;
		Ok((intermediate_ref, replaced))
	}

	/// Creates a fresh chain of class-0 nodes to hold `key` (chunked across
	/// multiple nodes if it exceeds the inline stem capacity), terminating in
	/// a node holding `value`. Increments `delta` once per node allocated.
	fn create_chain(&self, txn: &mut Transaction, key: &[u8], value: &[u8], delta: &mut i64) -> Result<NodeRef> {
		let mut node = AnyNode::empty(0);
		if key.len() <= node::STEM_CAP {
			node.set_stem(key);
			let value_addr = ValueManager::store(txn, &self.file, SEGMENT, value)?;
			node.set_value(value_addr);
		} else {
			node.set_stem(&key[..node::STEM_CAP]);
			let edge_byte = key[node::STEM_CAP];
			let child = self.create_chain(txn, &key[node::STEM_CAP + 1..], value, delta)?;
			node.set_child(edge_byte, child);
		}
		let node_ref = self.pools.alloc(txn, &self.file, SEGMENT, 0)?;
		*delta += 1;
		self.pools.write(txn, node_ref, &node)?;
		Ok(node_ref)
	}

	/// Removes `key`, returning its prior value if it existed.
	pub fn erase(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let mut txn = self.manager.begin_transaction()?;
		let mut residence = read_residence(&mut txn, &self.file)?;
		let mut delta: i64 = 0;
		let (new_root, removed) = self.erase_rec(&mut txn, residence.root, key, &mut delta)?;
		residence.root = new_root;
		let value = if let Some(addr) = removed {
			residence.size -= 1;
			Some(ValueManager::load(&mut txn, addr)?)
		} else {
			None
		};
		if let Some(addr) = removed {
			ValueManager::free(&mut txn, &self.file, addr)?;
		}
		residence.nodes_count = (residence.nodes_count as i64 + delta) as u64;
		write_residence(&mut txn, &self.file, residence)?;
		txn.commit()?;
		Ok(value)
	}

	/// Returns `(new_ref_for_this_subtree, removed_value_addr)`. `new_ref` is
	/// `NodeRef::NULL` if the subtree became empty and should be unlinked by
	/// the caller. `delta` accumulates the net change in allocated node count.
	fn erase_rec(&self, txn: &mut Transaction, cur: NodeRef, key: &[u8], delta: &mut i64) -> Result<(NodeRef, Option<FarAddress>)> {
		if cur.is_null() { return Ok((NodeRef::NULL, None)); }
		let mut node = self.pools.read(txn, cur)?;
		let stem = node.stem();
		let common = common_prefix_len(key, &stem);
		if common != stem.len() { return Ok((cur, None)); }
		let remaining = &key[common..];

		if remaining.is_empty() {
			if !node.is_terminal() { return Ok((cur, None)); }
			let removed = node.value();
			node.set_value(FarAddress::NULL);
			if node.child_count() == 0 {
				self.pools.free(txn, &self.file, SEGMENT, cur)?;
				*delta -= 1;
				return Ok((NodeRef::NULL, Some(removed)));
			}
			self.pools.write(txn, cur, &node)?;
			return Ok((cur, Some(removed)));
		}

		let edge_byte = remaining[0];
		let Some(child) = node.find_child(edge_byte) else { return Ok((cur, None)) };
		let (new_child, removed) = self.erase_rec(txn, child, &remaining[1..], delta)?;
		if removed.is_none() { return Ok((cur, None)); }

		if new_child.is_null() {
			node.remove_child(edge_byte);
		} else {
			node.set_child(edge_byte, new_child);
		}
		node.bump_version();

		if node.child_count() == 0 && !node.is_terminal() {
			self.pools.free(txn, &self.file, SEGMENT, cur)?;
			*delta -= 1;
			return Ok((NodeRef::NULL, removed));
		}
		self.pools.write(txn, cur, &node)?;
		Ok((cur, removed))
	}

	/// Removes every key starting with `prefix`.
	pub fn prefixed_key_erase_all(&self, prefix: &[u8]) -> Result<u64> {
		let keys = self.collect_prefixed_keys(prefix)?;
		let mut count = 0;
		for key in keys {
			if self.erase(&key)?.is_some() { count += 1; }
		}
		Ok(count)
	}

	/// Removes every key yielded by iterating `prefix`'s range at the moment
	/// this call begins (a snapshot, not a live view — matches `erase` being
	/// a sequence of independent transactions rather than one bulk one).
	pub fn prefixed_erase_all(&self, prefix: &[u8]) -> Result<u64> {
		self.prefixed_key_erase_all(prefix)
	}

	fn collect_prefixed_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
		let mut txn = self.manager.begin_ro_transaction()?;
		let residence = read_residence(&mut txn, &self.file)?;
		let mut out = Vec::new();
		self.collect_rec(&mut txn, residence.root, Vec::new(), prefix, &mut out)?;
		txn.commit()?;
		Ok(out)
	}

	fn collect_rec(&self, txn: &mut Transaction, cur: NodeRef, mut path: Vec<u8>, prefix: &[u8], out: &mut Vec<Vec<u8>>) -> Result<()> {
		if cur.is_null() { return Ok(()); }
		let node = self.pools.read(txn, cur)?;
		path.extend_from_slice(&node.stem());

		// Prune: once `path` is at least as long as `prefix`, it must start
		// with it to stay in this subtree; while shorter, `prefix` must start
		// with `path` so far.
		if path.len() >= prefix.len() {
			if !path.starts_with(prefix) { return Ok(()); }
		} else if !prefix.starts_with(&path) {
			return Ok(());
		}

		if path.len() >= prefix.len() && node.is_terminal() {
			out.push(path.clone());
		}
		for (byte, child) in node.sorted_children() {
			let mut child_path = path.clone();
			child_path.push(byte);
			self.collect_rec(txn, child, child_path, prefix, out)?;
		}
		Ok(())
	}

	/// Inserts `value` under `prefix` joined with `suffix`; a thin
	/// convenience over `upsert` for callers that build keys as
	/// `(prefix, suffix)` pairs.
	pub fn prefixed_upsert(&self, prefix: &[u8], suffix: &[u8], value: &[u8]) -> Result<bool> {
		let key = [prefix, suffix].concat();
		self.upsert(&key, value)
	}

	pub fn prefixed_insert(&self, prefix: &[u8], suffix: &[u8], value: &[u8]) -> Result<bool> {
		let key = [prefix, suffix].concat();
		self.insert(&key, value)
	}

	/// Returns the number of stored keys.
	pub fn len(&self) -> Result<u64> {
		let mut txn = self.manager.begin_ro_transaction()?;
		let residence = read_residence(&mut txn, &self.file)?;
		txn.commit()?;
		Ok(residence.size)
	}

	pub fn is_empty(&self) -> Result<bool> { Ok(self.len()? == 0) }

	/// Returns the total number of allocated nodes backing the trie.
	pub fn nodes_count(&self) -> Result<u64> {
		let mut txn = self.manager.begin_ro_transaction()?;
		let residence = read_residence(&mut txn, &self.file)?;
		txn.commit()?;
		Ok(residence.nodes_count)
	}

	pub(crate) fn pools(&self) -> &Arc<NodePools> { &self.pools }
	pub(crate) fn file(&self) -> &Arc<BackingFile> { &self.file }

	pub(crate) fn root(&self, txn: &mut Transaction) -> Result<NodeRef> {
		Ok(read_residence(txn, &self.file)?.root)
	}

	/// Looks up the first key greater than or equal to `key`, returning a
	/// cursor positioned there. `cursor.next()` yields `(key, value)` in
	/// ascending order from that point on.
	pub fn lower_bound(&self, key: &[u8]) -> Result<cursor::Cursor> {
		let txn = self.manager.begin_ro_transaction()?;
		cursor::Cursor::new(self.clone(), txn, key, None)
	}

	/// A cursor over the whole trie in ascending order, optionally starting
	/// from `start` (equivalent to `lower_bound` when given).
	pub fn range(&self, start: Option<&[u8]>) -> Result<cursor::Range> {
		let txn = self.manager.begin_ro_transaction()?;
		cursor::Cursor::new(self.clone(), txn, start.unwrap_or(&[]), None)
	}

	/// A cursor over exactly the keys starting with `prefix`, in ascending
	/// order.
	pub fn prefixed_range(&self, prefix: &[u8]) -> Result<cursor::Range> {
		let txn = self.manager.begin_ro_transaction()?;
		cursor::Cursor::new(self.clone(), txn, prefix, Some(prefix.to_vec()))
	}

	/// A cursor over exactly the immediate children of the node reached by
	/// `prefix`, one level down (byte, not full subtree).
	pub fn children_range(&self, prefix: &[u8]) -> Result<Vec<u8>> {
		let mut txn = self.manager.begin_ro_transaction()?;
		let residence = read_residence(&mut txn, &self.file)?;
		let mut cur = residence.root;
		let mut key = prefix;
		loop {
			if cur.is_null() { txn.commit()?; return Ok(Vec::new()); }
			let node = self.pools.read(&mut txn, cur)?;
			let stem = node.stem();
			let common = common_prefix_len(key, &stem);
			if common != stem.len() {
				txn.commit()?;
				return Ok(Vec::new());
			}
			key = &key[stem.len()..];
			if key.is_empty() {
				let children = node.sorted_children().into_iter().map(|(b, _)| b).collect();
				txn.commit()?;
				return Ok(children);
			}
			let Some(child) = node.find_child(key[0]) else {
				txn.commit()?;
				return Ok(Vec::new());
			};
			key = &key[1..];
			cur = child;
		}
	}
}
