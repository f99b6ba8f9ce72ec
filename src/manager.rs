// SPDX-License-Identifier: Apache-2.0

//! Event-Sourcing Segment Manager (C7): the transactional façade over the
//! backing file (C1) and its change history (C6).
//!
//! Every read or write of a block goes through a [`Transaction`], obtained from
//! [`StoreManager::begin_transaction`] or [`StoreManager::begin_ro_transaction`].
//! A transaction is thread-affine: at most one is open per thread, and at most
//! one writing transaction is open store-wide at a time.

use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use log::{debug, trace, warn};
use crate::address::Block;
use crate::error::{Error, Result};
use crate::file::BackingFile;
use crate::history::{ChangeHistory, TxnId};
use crate::options::IsolationPolicy;
use crate::shadow::ShadowPool;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum TxnState {
	Active,
	/// Poisoned by a failed operation; only `rollback()` is permitted.
	SealedRollbackOnly,
	/// Terminal: committed or rolled back. Any further use is a ghost-state error.
	SealedNoop,
}

thread_local! {
	static THREAD_TXN: Cell<Option<TxnId>> = const { Cell::new(None) };
	static THREAD_IS_WRITER: Cell<bool> = const { Cell::new(false) };
}

/// Owns the backing file and change history, and hands out transactions.
pub struct StoreManager {
	file: Arc<BackingFile>,
	history: Arc<ChangeHistory>,
	isolation: IsolationPolicy,
	next_txn: AtomicU64,
	writer_active: Mutex<bool>,
}

impl StoreManager {
	pub fn new(file: Arc<BackingFile>, pool: Arc<ShadowPool>, isolation: IsolationPolicy, gc_interval: std::time::Duration) -> Self {
		Self {
			file,
			history: ChangeHistory::new(pool, gc_interval),
			isolation,
			next_txn: AtomicU64::new(1),
			writer_active: Mutex::new(false),
		}
	}

	pub fn backing_file(&self) -> &Arc<BackingFile> { &self.file }

	fn alloc_txn_id(&self) -> TxnId {
		self.next_txn.fetch_add(1, Ordering::Relaxed)
	}

	/// Begins a writing transaction on the current thread. Fails if this thread
	/// already has a transaction open (nested transactions are not supported;
	/// finish the existing one, using [`Transaction::save_point`] for partial
	/// rollback within it, before starting another), or if another thread is
	/// already writing.
	pub fn begin_transaction(self: &Arc<Self>) -> Result<Transaction> {
		if THREAD_TXN.with(Cell::get).is_some() {
			return Err(Error::nested_transaction());
		}
		let mut writer = self.writer_active.lock().unwrap_or_else(|e| e.into_inner());
		if *writer {
			return Err(Error::ro_transaction_started());
		}
		*writer = true;
		drop(writer);

		let id = self.alloc_txn_id();
		THREAD_TXN.with(|c| c.set(Some(id)));
		THREAD_IS_WRITER.with(|c| c.set(true));
		trace!("transaction {id} started");
		Ok(Transaction { manager: self.clone(), id, is_ro: false, state: TxnState::Active, savepoint_depth: 0 })
	}

	/// Begins a read-only transaction on the current thread. Fails if this
	/// thread is currently the active writer.
	pub fn begin_ro_transaction(self: &Arc<Self>) -> Result<Transaction> {
		if THREAD_IS_WRITER.with(Cell::get) {
			return Err(Error::cannot_start_ro_transaction());
		}
		if THREAD_TXN.with(Cell::get).is_some() {
			return Err(Error::cannot_start_ro_transaction());
		}
		let id = self.alloc_txn_id();
		THREAD_TXN.with(|c| c.set(Some(id)));
		trace!("read-only transaction {id} started");
		Ok(Transaction { manager: self.clone(), id, is_ro: true, state: TxnState::Active, savepoint_depth: 0 })
	}

	fn end_thread_txn(&self, was_writer: bool) {
		THREAD_TXN.with(|c| c.set(None));
		if was_writer {
			THREAD_IS_WRITER.with(|c| c.set(false));
			*self.writer_active.lock().unwrap_or_else(|e| e.into_inner()) = false;
		}
	}
}

/// A handle to a read-only shadow copy of a block.
pub struct ReadonlyHandle {
	block: Block,
	bytes: Vec<u8>,
}

impl ReadonlyHandle {
	pub fn block(&self) -> Block { self.block }
	pub fn as_slice(&self) -> &[u8] { &self.bytes }
	pub fn into_bytes(self) -> Vec<u8> { self.bytes }
}

/// A handle to a transaction-local, mutable shadow copy of a block. Writes
/// through this handle are visible immediately to later reads within the same
/// transaction, and are flushed to disk on `commit()`.
pub struct WritableHandle {
	block: Block,
	shadow: Arc<Mutex<Vec<u8>>>,
}

impl WritableHandle {
	pub fn block(&self) -> Block { self.block }

	pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
		let guard = self.shadow.lock().unwrap_or_else(|e| e.into_inner());
		f(&guard)
	}

	pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
		let mut guard = self.shadow.lock().unwrap_or_else(|e| e.into_inner());
		f(&mut guard)
	}
}

/// A marker returned by [`Transaction::save_point`], identifying a point in the
/// transaction's change history to roll back to.
#[derive(Copy, Clone, Debug)]
pub struct SavePoint {
	epoch: u64,
}

/// A single logical unit of work against the store. See the module docs.
pub struct Transaction {
	manager: Arc<StoreManager>,
	id: TxnId,
	is_ro: bool,
	state: TxnState,
	savepoint_depth: u32,
}

impl Transaction {
	pub fn id(&self) -> TxnId { self.id }
	pub fn is_readonly(&self) -> bool { self.is_ro }

	fn require_active(&self) -> Result<()> {
		match self.state {
			TxnState::Active => Ok(()),
			TxnState::SealedRollbackOnly | TxnState::SealedNoop => Err(Error::transaction_ghost_state()),
		}
	}

	/// Reads `block`, overlaying any uncommitted writes visible under the
	/// store's isolation policy. Pass `keep_lock` to additionally register this
	/// read in the change history so later writers conflict against it.
	pub fn readonly_block(&mut self, block: Block, keep_lock: bool) -> Result<ReadonlyHandle> {
		self.require_active()?;
		let result = self.readonly_block_inner(block, keep_lock);
		if result.is_err() {
			self.state = TxnState::SealedRollbackOnly;
		}
		result
	}

	fn readonly_block_inner(&self, block: Block, keep_lock: bool) -> Result<ReadonlyHandle> {
		let history = &self.manager.history;
		let mut bytes = vec![0u8; block.len() as usize];
		self.manager.file.read_raw(block, &mut bytes)?;
		history.overlay(self.id, block, self.manager.isolation, &mut bytes);
		if keep_lock {
			history.add_ro(self.id, block);
		}
		Ok(ReadonlyHandle { block, bytes })
	}

	/// Requests a writable shadow copy of `block`. Set `new_content` when the
	/// block has no meaningful prior bytes (freshly allocated space), skipping
	/// the disk read.
	pub fn writable_block(&mut self, block: Block, new_content: bool) -> Result<WritableHandle> {
		self.require_active()?;
		if self.is_ro {
			return Err(Error::ro_transaction_started());
		}
		let result = self.writable_block_inner(block, new_content);
		if result.is_err() {
			self.state = TxnState::SealedRollbackOnly;
		}
		result
	}

	fn writable_block_inner(&self, block: Block, new_content: bool) -> Result<WritableHandle> {
		let history = &self.manager.history;
		let mut bytes = if new_content {
			vec![0u8; block.len() as usize]
		} else {
			let mut buf = vec![0u8; block.len() as usize];
			self.manager.file.read_raw(block, &mut buf)?;
			buf
		};
		history.overlay(self.id, block, IsolationPolicy::ReadUncommitted, &mut bytes);
		let shadow = Arc::new(Mutex::new(bytes));
		if !history.add_wr(self.id, block, shadow.clone()) {
			return Err(Error::concurrent_lock());
		}
		Ok(WritableHandle { block, shadow })
	}

	/// Promotes a previously-read block to writable, re-checking for conflicts.
	pub fn upgrade_to_writable_block(&mut self, handle: ReadonlyHandle) -> Result<WritableHandle> {
		self.require_active()?;
		if self.is_ro {
			return Err(Error::ro_transaction_started());
		}
		let block = handle.block;
		let history = &self.manager.history;
		let mut bytes = handle.bytes;
		history.overlay(self.id, block, IsolationPolicy::ReadUncommitted, &mut bytes);
		let shadow = Arc::new(Mutex::new(bytes));
		if !history.add_wr(self.id, block, shadow.clone()) {
			self.state = TxnState::SealedRollbackOnly;
			return Err(Error::concurrent_lock());
		}
		Ok(WritableHandle { block, shadow })
	}

	/// Records a point in this transaction's history to roll back to later.
	pub fn save_point(&mut self) -> Result<SavePoint> {
		self.require_active()?;
		self.savepoint_depth += 1;
		Ok(SavePoint { epoch: self.manager.history.current_epoch() })
	}

	/// Discards every block captured since `sp`, leaving the transaction active
	/// and able to continue.
	pub fn rollback_to(&mut self, sp: SavePoint) -> Result<()> {
		self.require_active()?;
		self.manager.history.retire_since(self.id, sp.epoch);
		Ok(())
	}

	/// Flushes every writable block captured by this transaction to disk, then
	/// retires its change-history entries.
	pub fn commit(mut self) -> Result<()> {
		if self.is_ro {
			self.seal();
			return Ok(());
		}
		match self.state {
			TxnState::Active => {}
			TxnState::SealedRollbackOnly => {
				warn!("commit requested on poisoned transaction {}, rolling back instead", self.id);
				self.seal();
				return Err(Error::transaction_ghost_state());
			}
			TxnState::SealedNoop => return Err(Error::transaction_ghost_state()),
		}
		for (block, bytes) in self.manager.history.writes_of(self.id) {
			self.manager.file.write_raw(block, &bytes)?;
		}
		debug!("transaction {} committed", self.id);
		self.manager.history.retire_transaction(self.id);
		self.seal();
		Ok(())
	}

	/// Discards every block captured by this transaction.
	pub fn rollback(mut self) {
		self.manager.history.retire_transaction(self.id);
		debug!("transaction {} rolled back", self.id);
		self.seal();
	}

	fn seal(&mut self) {
		if self.state != TxnState::SealedNoop {
			self.manager.end_thread_txn(!self.is_ro);
			self.state = TxnState::SealedNoop;
		}
	}
}

impl Drop for Transaction {
	fn drop(&mut self) {
		if self.state != TxnState::SealedNoop {
			self.manager.history.retire_transaction(self.id);
			self.seal();
		}
	}
}
