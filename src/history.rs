// SPDX-License-Identifier: Apache-2.0

//! Change History (C6): the ordered log of per-transaction block captures that
//! the event-sourcing segment manager (C7) consults to detect conflicts, overlay
//! writes into fresh reads, and enforce the configured [`IsolationPolicy`].
//!
//! The log is indexed by segment (a [`Block`] never crosses a segment boundary,
//! so grouping entries by segment and scanning within the group is sufficient to
//! find every overlap). A background thread wakes periodically — or whenever a
//! transaction completes — and sweeps entries marked [`BlockState::Garbage`],
//! returning their shadow buffers to the [`ShadowPool`].

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use crate::address::Block;
use crate::options::IsolationPolicy;
use crate::shadow::ShadowPool;

pub type TxnId = u64;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BlockKind {
	Ro,
	Wr,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum BlockState {
	Active,
	Garbage,
}

struct BlockProfile {
	block: Block,
	txn: TxnId,
	epoch: u64,
	kind: BlockKind,
	/// The transaction-local shadow copy. Present only for [`BlockKind::Wr`]
	/// entries; shared with the [`WritableHandle`](crate::manager::WritableHandle)
	/// returned to the caller so writes through the handle are immediately
	/// visible to later lookups in this history.
	shadow: Option<Arc<Mutex<Vec<u8>>>>,
	state: BlockState,
}

#[derive(Default)]
struct HistoryInner {
	entries: Vec<BlockProfile>,
	by_segment: HashMap<u32, Vec<usize>>,
}

impl HistoryInner {
	fn index_of(&self, segment: u32) -> &[usize] {
		self.by_segment.get(&segment).map_or(&[], Vec::as_slice)
	}

	fn insert(&mut self, profile: BlockProfile) {
		let segment = profile.block.segment();
		let idx = self.entries.len();
		self.entries.push(profile);
		self.by_segment.entry(segment).or_default().push(idx);
	}

	fn sweep_garbage(&mut self, pool: &ShadowPool) {
		if self.entries.is_empty() { return; }
		let mut kept = Vec::with_capacity(self.entries.len());
		for entry in self.entries.drain(..) {
			if entry.state == BlockState::Garbage {
				if let Some(shadow) = entry.shadow {
					if let Ok(buf) = Arc::try_unwrap(shadow) {
						pool.utilize(buf.into_inner().unwrap_or_default());
					}
				}
			} else {
				kept.push(entry);
			}
		}
		self.entries = kept;
		self.by_segment.clear();
		for (idx, entry) in self.entries.iter().enumerate() {
			self.by_segment.entry(entry.block.segment()).or_default().push(idx);
		}
	}
}

struct GcState {
	running: AtomicBool,
	wake: Condvar,
	wake_lock: Mutex<()>,
}

/// The thread-safe ordered log of block captures, plus its background garbage
/// collector.
pub struct ChangeHistory {
	inner: RwLock<HistoryInner>,
	next_epoch: AtomicU64,
	pool: Arc<ShadowPool>,
	gc: Arc<GcState>,
	gc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeHistory {
	pub fn new(pool: Arc<ShadowPool>, gc_interval: Duration) -> Arc<Self> {
		let history = Arc::new(Self {
			inner: RwLock::new(HistoryInner::default()),
			next_epoch: AtomicU64::new(0),
			pool,
			gc: Arc::new(GcState {
				running: AtomicBool::new(true),
				wake: Condvar::new(),
				wake_lock: Mutex::new(()),
			}),
			gc_thread: Mutex::new(None),
		});

		let weak = Arc::downgrade(&history);
		let gc = history.gc.clone();
		let handle = std::thread::Builder::new()
			.name("vtrie-gc".into())
			.spawn(move || {
				let guard = gc.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
				let mut guard = guard;
				while gc.running.load(Ordering::Acquire) {
					let (g, _timeout) = gc.wake
						.wait_timeout(guard, gc_interval)
						.unwrap_or_else(|e| e.into_inner());
					guard = g;
					if !gc.running.load(Ordering::Acquire) { break; }
					if let Some(history) = weak.upgrade() {
						history.sweep();
					} else {
						break;
					}
				}
			})
			.expect("failed to spawn garbage collector thread");
		*history.gc_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
		history
	}

	fn next_epoch(&self) -> u64 {
		self.next_epoch.fetch_add(1, Ordering::Relaxed)
	}

	/// Adds a retained read-only entry (only called with the `ro_keep_lock`
	/// hint; plain reads never enter the log).
	pub fn add_ro(&self, txn: TxnId, block: Block) {
		let epoch = self.next_epoch();
		self.inner.write().unwrap_or_else(|e| e.into_inner()).insert(BlockProfile {
			block, txn, epoch, kind: BlockKind::Ro, shadow: None, state: BlockState::Active,
		});
	}

	/// Adds a writable entry for `txn`, wrapping `buffer` so writes through the
	/// returned handle are visible to subsequent lookups. Fails with `false` if
	/// another transaction holds a conflicting lock on the range.
	pub fn add_wr(&self, txn: TxnId, block: Block, buffer: Arc<Mutex<Vec<u8>>>) -> bool {
		let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
		for &idx in inner.index_of(block.segment()) {
			let other = &inner.entries[idx];
			if other.txn == txn || other.state == BlockState::Garbage { continue; }
			if other.block.overlaps(block) {
				return false;
			}
		}
		let epoch = self.next_epoch();
		inner.insert(BlockProfile {
			block, txn, epoch, kind: BlockKind::Wr, shadow: Some(buffer), state: BlockState::Active,
		});
		true
	}

	/// Overlays bytes written by prior entries into `out`, which represents
	/// `block`. `current_txn`'s own writes are always applied; other
	/// transactions' writes are applied per `policy`.
	pub fn overlay(&self, current_txn: TxnId, block: Block, policy: IsolationPolicy, out: &mut [u8]) {
		let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
		let mut candidates: Vec<&BlockProfile> = inner.index_of(block.segment())
			.iter()
			.map(|&idx| &inner.entries[idx])
			.filter(|e| e.kind == BlockKind::Wr && e.state == BlockState::Active && e.block.overlaps(block))
			.filter(|e| e.txn == current_txn || policy == IsolationPolicy::ReadUncommitted)
			.collect();
		candidates.sort_by_key(|e| e.epoch);
		for entry in candidates {
			let Some((self_off, other_off, len)) = block.intersection(entry.block) else { continue };
			let shadow = entry.shadow.as_ref().expect("wr entry always carries a shadow buffer");
			let src = shadow.lock().unwrap_or_else(|e| e.into_inner());
			let self_off = self_off as usize;
			let other_off = other_off as usize;
			let len = len as usize;
			out[self_off..self_off + len].copy_from_slice(&src[other_off..other_off + len]);
		}
	}

	/// Returns `true` if raising `ConcurrentLock` is warranted for a readonly
	/// request under `Prevent`-adjacent bookkeeping; readonly requests never
	/// themselves conflict, so this always returns `false` — kept for symmetry
	/// with `add_wr` and documented at the call site in the manager.
	pub fn has_conflicting_wr(&self, current_txn: TxnId, block: Block) -> bool {
		let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
		inner.index_of(block.segment()).iter().any(|&idx| {
			let e = &inner.entries[idx];
			e.txn != current_txn && e.state == BlockState::Active && e.kind == BlockKind::Wr && e.block.overlaps(block)
		})
	}

	/// Returns the committed shadow bytes recorded for every active WR entry of
	/// `txn`, for `commit()` to flush to disk.
	pub fn writes_of(&self, txn: TxnId) -> Vec<(Block, Vec<u8>)> {
		let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
		let mut out: Vec<(Block, Vec<u8>, u64)> = inner.entries.iter()
			.filter(|e| e.txn == txn && e.kind == BlockKind::Wr && e.state == BlockState::Active)
			.map(|e| {
				let bytes = e.shadow.as_ref().unwrap().lock().unwrap_or_else(|g| g.into_inner()).clone();
				(e.block, bytes, e.epoch)
			})
			.collect();
		out.sort_by_key(|&(_, _, epoch)| epoch);
		out.into_iter().map(|(b, v, _)| (b, v)).collect()
	}

	/// Marks every entry of `txn` garbage. Called by both `commit()` (after
	/// materialising writes) and `rollback()`.
	pub fn retire_transaction(&self, txn: TxnId) {
		{
			let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
			for entry in inner.entries.iter_mut().filter(|e| e.txn == txn) {
				entry.state = BlockState::Garbage;
			}
		}
		self.notify_gc();
	}

	/// Marks garbage only the entries of `txn` captured at or after
	/// `since_epoch`, used by save-point rollback.
	pub fn retire_since(&self, txn: TxnId, since_epoch: u64) {
		{
			let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
			for entry in inner.entries.iter_mut().filter(|e| e.txn == txn && e.epoch >= since_epoch) {
				entry.state = BlockState::Garbage;
			}
		}
		self.notify_gc();
	}

	pub fn current_epoch(&self) -> u64 {
		self.next_epoch.load(Ordering::Relaxed)
	}

	fn notify_gc(&self) {
		let _guard = self.gc.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
		self.gc.wake.notify_one();
	}

	/// Runs one garbage-collection pass synchronously; the background thread
	/// calls this too, on its timer.
	pub fn sweep(&self) {
		self.inner.write().unwrap_or_else(|e| e.into_inner()).sweep_garbage(&self.pool);
	}

	pub fn shadow_pool(&self) -> &Arc<ShadowPool> { &self.pool }
}

impl Drop for ChangeHistory {
	fn drop(&mut self) {
		self.gc.running.store(false, Ordering::Release);
		self.notify_gc();
		if let Some(handle) = self.gc_thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
			let _ = handle.join();
		}
	}
}
