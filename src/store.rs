// SPDX-License-Identifier: Apache-2.0

//! The top-level façade: opens or creates a backing file, wires up the
//! transaction manager, and exposes the trie as an ordered key-value store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::address::{Block, FarAddress, NodeRef};
use crate::alloc::{fixed, heap};
use crate::error::{Error, Result};
use crate::file::{BackingFile, SEGMENT_HEADER_SIZE};
use crate::manager::StoreManager;
use crate::options::StoreOptions;
use crate::shadow::ShadowPool;
use crate::topology::{slot_sizes, TrieResidence, SLOT_RESIDENCE};
use crate::trie::cursor::Range;
use crate::trie::Trie;

/// The segment the trie's own bookkeeping (and, for now, all its nodes and
/// values) lives in; see `trie`'s module docs for the scope this leaves open.
const TRIE_SEGMENT: u32 = 0;

/// An embedded, transactional, ordered key-value store backed by a single
/// memory-mapped file.
pub struct Store {
	manager: Arc<StoreManager>,
	trie: Trie,
}

impl Store {
	/// Creates a new store at `path`, failing if a file already exists there.
	/// Lays down segment 0's heap area, node pool, and trie residence in one
	/// go, so every later transaction finds a fully-initialised store.
	pub fn create(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
		let file = Arc::new(BackingFile::create(path, &options)?);
		let topology = file.topology_for(TRIE_SEGMENT)?;

		let slots_end = SEGMENT_HEADER_SIZE as u32 + slot_sizes(TRIE_SEGMENT).iter().sum::<u32>();
		heap::init_area(&file, TRIE_SEGMENT, slots_end, file.segment_size())?;
		fixed::init_slot(&file, TRIE_SEGMENT)?;

		let residence_offset = topology.offset(SLOT_RESIDENCE).ok_or_else(Error::invalid_block)?;
		let residence = TrieResidence { root: NodeRef::NULL, size: 0, nodes_count: 0 };
		let block = Block::new(FarAddress::new(TRIE_SEGMENT, residence_offset), std::mem::size_of::<TrieResidence>() as u32);
		file.write_raw(block, bytemuck::bytes_of(&residence))?;

		Ok(Self::assemble(file, &options))
	}

	/// Opens an existing store at `path`, inheriting its segment size and
	/// on-disk layout.
	pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
		let file = Arc::new(BackingFile::open(path, &options)?);
		Ok(Self::assemble(file, &options))
	}

	fn assemble(file: Arc<BackingFile>, options: &StoreOptions) -> Self {
		let pool = Arc::new(ShadowPool::new());
		let manager = Arc::new(StoreManager::new(
			file.clone(),
			pool,
			options.isolation(),
			Duration::from_millis(options.gc_interval_millis()),
		));
		let trie = Trie::new(manager.clone(), file);
		Self { manager, trie }
	}

	/// The store's ordered key-value index, for callers that want the fuller
	/// trie API (prefixed operations, cursors) directly.
	pub fn trie(&self) -> &Trie { &self.trie }

	/// The transaction manager, for callers that need several operations to
	/// commit or roll back together as one unit.
	pub fn manager(&self) -> &Arc<StoreManager> { &self.manager }

	/// Looks up `key`.
	pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> { self.trie.find(key) }

	/// Returns `true` if `key` has a stored value.
	pub fn contains_key(&self, key: &[u8]) -> Result<bool> { self.trie.check_exists(key) }

	/// Inserts `key` with `value` if absent. Returns `false` without writing
	/// if `key` already has a value.
	pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> { self.trie.insert(key, value) }

	/// Inserts or replaces `key`. Returns `true` if a prior value existed.
	pub fn upsert(&self, key: &[u8], value: &[u8]) -> Result<bool> { self.trie.upsert(key, value) }

	/// Removes `key`, returning its prior value if any.
	pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> { self.trie.erase(key) }

	/// Removes every key starting with `prefix`, returning how many were
	/// removed.
	pub fn remove_prefixed(&self, prefix: &[u8]) -> Result<u64> { self.trie.prefixed_key_erase_all(prefix) }

	/// A cursor over the whole store in ascending key order, optionally
	/// starting from `start`.
	pub fn range(&self, start: Option<&[u8]>) -> Result<Range> { self.trie.range(start) }

	/// A cursor over exactly the keys starting with `prefix`.
	pub fn prefixed_range(&self, prefix: &[u8]) -> Result<Range> { self.trie.prefixed_range(prefix) }

	/// Returns the number of stored keys.
	pub fn len(&self) -> Result<u64> { self.trie.len() }

	pub fn is_empty(&self) -> Result<bool> { self.trie.is_empty() }

	/// Returns the total number of allocated nodes backing the trie.
	pub fn nodes_count(&self) -> Result<u64> { self.trie.nodes_count() }

	/// Flushes every dirty memory-mapped segment to disk.
	pub fn sync(&self) -> Result<()> { self.manager.backing_file().sync() }
}
