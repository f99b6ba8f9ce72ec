// SPDX-License-Identifier: Apache-2.0

//! Store-wide configuration.
//!
//! # Segment size
//!
//! The size of every segment in the backing file, fixed for the life of the file
//! and aligned up to the OS page size at creation. Defaults to 1MiB. Opening an
//! existing file ignores this value and inherits the size recorded in the file's
//! segment header.
//!
//! # Isolation policy
//!
//! The concurrency rule applied when a transaction's block request overlaps a
//! block held by another transaction. See [`IsolationPolicy`]. Defaults to
//! [`IsolationPolicy::Prevent`], the only policy that can raise
//! [`ConcurrentLock`](crate::ErrorKind::ConcurrentLock).

use crate::ALIGN;

/// The concurrency rule C7 applies when a block request overlaps a block held
/// by another transaction.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum IsolationPolicy {
	/// Any conflicting write-locked block from another transaction raises
	/// [`ConcurrentLock`](crate::ErrorKind::ConcurrentLock).
	#[default]
	Prevent,
	/// Writes from other transactions are ignored; reads observe the last
	/// committed image.
	ReadCommitted,
	/// Writes from other transactions, committed or not, are overlaid into
	/// reads (a dirty read).
	ReadUncommitted,
}

/// Options for tuning a store's behavior and performance.
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub struct StoreOptions {
	pub(crate) segment_size: u32,
	pub(crate) isolation: IsolationPolicy,
	pub(crate) mapping_cache_capacity: usize,
	pub(crate) gc_interval_millis: u64,
}

/// The default segment size, 1MiB, aligned up to the OS page size at creation.
pub const DEFAULT_SEGMENT_SIZE: u32 = 1 << 20;

/// The default number of segments kept memory-mapped at once.
pub const DEFAULT_MAPPING_CACHE_CAPACITY: usize = 64;

impl Default for StoreOptions {
	fn default() -> Self {
		Self {
			segment_size: DEFAULT_SEGMENT_SIZE,
			isolation: IsolationPolicy::Prevent,
			mapping_cache_capacity: DEFAULT_MAPPING_CACHE_CAPACITY,
			gc_interval_millis: 50,
		}
	}
}

impl StoreOptions {
	/// Sets the segment size used when *creating* a new file. Aligned up to the
	/// OS page size and to [`ALIGN`]. Ignored when opening an existing file.
	pub fn set_segment_size(mut self, size: u32) -> Self {
		let page = page_size::get() as u32;
		let size = size.next_multiple_of(page).next_multiple_of(ALIGN as u32);
		self.segment_size = size.max(page);
		self
	}

	/// Sets the isolation policy applied to overlapping block requests.
	pub fn set_isolation(mut self, policy: IsolationPolicy) -> Self {
		self.isolation = policy;
		self
	}

	/// Sets the maximum number of segments kept memory-mapped at once.
	pub fn set_mapping_cache_capacity(mut self, capacity: usize) -> Self {
		self.mapping_cache_capacity = capacity.max(1);
		self
	}

	/// Sets how often the background garbage collector wakes to reclaim
	/// completed transactions, absent an explicit wakeup.
	pub fn set_gc_interval_millis(mut self, millis: u64) -> Self {
		self.gc_interval_millis = millis.max(1);
		self
	}

	pub fn segment_size(&self) -> u32 { self.segment_size }
	pub fn isolation(&self) -> IsolationPolicy { self.isolation }
	pub fn mapping_cache_capacity(&self) -> usize { self.mapping_cache_capacity }
	pub fn gc_interval_millis(&self) -> u64 { self.gc_interval_millis }
}
