// SPDX-License-Identifier: Apache-2.0

//! Iterator/Range Facade (C10): an ordered cursor over the trie, backed by a
//! traversal stack of `(node, path-so-far)` frames.
//!
//! Every frame re-reads its node from scratch on each step rather than
//! trusting a cached copy, and resumes each node's child scan from the last
//! byte actually visited rather than a numeric index — so a node that has
//! grown, split, or gained/lost children since the frame was pushed (because
//! this same transaction wrote through the cursor while iterating) is picked
//! up correctly without needing a separate resync pass. Each frame's
//! `version` is still recorded and available via [`Cursor::position_version`]
//! for callers that want to detect such a change explicitly.

use crate::address::NodeRef;
use crate::error::Result;
use crate::manager::Transaction;
use crate::trie::value::ValueManager;
use crate::trie::{common_prefix_len, Trie};

struct Frame {
	node_ref: NodeRef,
	path: Vec<u8>,
	value_emitted: bool,
	last_child_byte: Option<u8>,
	version: u32,
}

/// A live, ordered view over a contiguous span of the trie's keys.
pub struct Cursor {
	trie: Trie,
	txn: Transaction,
	stack: Vec<Frame>,
	prefix: Option<Vec<u8>>,
	finished: bool,
}

/// A bounded span of the trie, produced by [`Trie::range`] /
/// [`Trie::prefixed_range`]. An alias kept distinct from [`Cursor`] so the
/// two names read naturally at call sites; both are the same type.
pub type Range = Cursor;

impl Cursor {
	pub(crate) fn new(trie: Trie, txn: Transaction, start: &[u8], prefix: Option<Vec<u8>>) -> Result<Self> {
		let mut cursor = Self { trie, txn, stack: Vec::new(), prefix, finished: false };
		cursor.seek(start)?;
		Ok(cursor)
	}

	fn seek(&mut self, target: &[u8]) -> Result<()> {
		self.stack.clear();
		let root = self.trie.root(&mut self.txn)?;
		self.seek_rec(root, Vec::new(), target)
	}

	fn seek_rec(&mut self, cur: NodeRef, path: Vec<u8>, target: &[u8]) -> Result<()> {
		if cur.is_null() { return Ok(()); }
		let node = self.trie.pools().read(&mut self.txn, cur)?;
		let mut full_path = path;
		full_path.extend_from_slice(&node.stem());

		let common = common_prefix_len(target, &full_path);

		if target.len() <= full_path.len() && &target[..] == &full_path[..target.len()] {
			self.stack.push(Frame { node_ref: cur, path: full_path, value_emitted: false, last_child_byte: None, version: node.version() });
			return Ok(());
		}

		if common < full_path.len() && common < target.len() {
			if target[common] < full_path[common] {
				self.stack.push(Frame { node_ref: cur, path: full_path, value_emitted: false, last_child_byte: None, version: node.version() });
			}
			return Ok(());
		}

		// common == full_path.len() < target.len(): stem consumed, descend.
		let next_byte = target[full_path.len()];
		let remaining_target = &target[full_path.len() + 1..];
		self.stack.push(Frame { node_ref: cur, path: full_path.clone(), value_emitted: true, last_child_byte: Some(next_byte), version: node.version() });
		if let Some(child_ref) = node.find_child(next_byte) {
			self.seek_rec(child_ref, full_path, remaining_target)?;
		}
		Ok(())
	}

	fn advance(&mut self) -> Result<Option<(Vec<u8>, crate::address::FarAddress)>> {
		if self.finished { return Ok(None); }
		loop {
			let Some(top_path_len) = self.stack.last().map(|f| f.path.len()) else {
				self.finished = true;
				return Ok(None);
			};
			if let Some(prefix) = &self.prefix {
				let path = &self.stack.last().unwrap().path;
				if top_path_len >= prefix.len() && !path.starts_with(prefix.as_slice()) {
					self.stack.clear();
					self.finished = true;
					return Ok(None);
				}
			}

			let node_ref = self.stack.last().unwrap().node_ref;
			let node = self.trie.pools().read(&mut self.txn, node_ref)?;
			let top = self.stack.last_mut().unwrap();
			top.version = node.version();

			if !top.value_emitted {
				top.value_emitted = true;
				if node.is_terminal() {
					let path = top.path.clone();
					return Ok(Some((path, node.value())));
				}
			}

			let children = node.sorted_children();
			let next = match top.last_child_byte {
				None => children.first().copied(),
				Some(b) => children.iter().copied().find(|&(byte, _)| byte > b),
			};
			match next {
				Some((byte, child_ref)) => {
					top.last_child_byte = Some(byte);
					let child_node = self.trie.pools().read(&mut self.txn, child_ref)?;
					let mut child_path = top.path.clone();
					child_path.push(byte);
					child_path.extend_from_slice(&child_node.stem());
					self.stack.push(Frame {
						node_ref: child_ref, path: child_path, value_emitted: false,
						last_child_byte: None, version: child_node.version(),
					});
				}
				None => { self.stack.pop(); }
			}
		}
	}

	/// Advances to and returns the next `(key, value)` pair in order.
	pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
		let Some((key, value_addr)) = self.advance()? else { return Ok(None) };
		let value = ValueManager::load(&mut self.txn, value_addr)?;
		Ok(Some((key, value)))
	}

	/// The key the cursor is currently positioned at, without advancing.
	pub fn peek_key(&self) -> Option<&[u8]> {
		self.stack.last().map(|f| f.path.as_slice())
	}

	/// The version of the node the cursor is currently resting on, useful for
	/// callers that want to detect a concurrent structural change explicitly
	/// rather than relying on the cursor's built-in resync.
	pub fn position_version(&self) -> Option<u32> {
		self.stack.last().map(|f| f.version)
	}

	/// The next sibling byte edge of the node the cursor currently rests on,
	/// without descending — the child-scan analogue of `next()`.
	pub fn next_sibling(&mut self) -> Result<Option<u8>> {
		let Some(top) = self.stack.last() else { return Ok(None) };
		let node_ref = top.node_ref;
		let last = top.last_child_byte;
		let node = self.trie.pools().read(&mut self.txn, node_ref)?;
		Ok(node.sorted_children().into_iter().map(|(b, _)| b).find(|&b| Some(b) > last))
	}

	/// Repositions the cursor at the first key greater than or equal to
	/// `key`, discarding its current position. Lets a caller resume iteration
	/// from a new lower bound without tearing down the cursor's transaction.
	pub fn next_lower_bound_of(&mut self, key: &[u8]) -> Result<()> {
		self.finished = false;
		self.seek(key)
	}

	/// Finishes the cursor's underlying read-only transaction.
	pub fn close(self) -> Result<()> {
		self.txn.commit()
	}
}
