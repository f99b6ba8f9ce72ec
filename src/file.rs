// SPDX-License-Identifier: Apache-2.0

//! Backing File & Segment Store (C1).
//!
//! Opens or creates the single backing file, grows it one [segment](crate::options)
//! at a time, and serves raw byte ranges backed by a bounded LRU of memory maps.
//! These `readonly_raw`/`writable_raw` accessors are internal; callers go through
//! the event-sourcing manager (C7) instead, which is the only consumer of this
//! module.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use memmap2::MmapMut;
use crate::{ALIGN, MAGIC};
use crate::address::{Block, FarAddress};
use crate::error::{Error, Result};
use crate::options::{StoreOptions, DEFAULT_MAPPING_CACHE_CAPACITY};
use crate::topology::{slot_sizes, TopologyHeader, TOPOLOGY_HEADER_SIZE};

/// Size of the fixed portion of the segment header: magic + segment size, before
/// the topology header.
const SEGMENT_HEADER_PREFIX: usize = 8;

/// Total size of the segment header (prefix + topology header), aligned.
pub const SEGMENT_HEADER_SIZE: usize = (SEGMENT_HEADER_PREFIX + TOPOLOGY_HEADER_SIZE).next_multiple_of(ALIGN);

/// A recursive, intra-process mutex. Reentrant on the same thread; serializes
/// across threads. Used to guard every mapping and size-changing operation on
/// the backing file, matching the "recursive file lock" the segment store is
/// specified to take.
struct RecursiveLock {
	inner: Mutex<()>,
}

thread_local! {
	static RECURSIVE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

impl RecursiveLock {
	fn new() -> Self { Self { inner: Mutex::new(()) } }

	fn with<R>(&self, f: impl FnOnce() -> R) -> R {
		let depth = RECURSIVE_DEPTH.with(|d| d.get());
		if depth == 0 {
			let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
			RECURSIVE_DEPTH.with(|d| d.set(1));
			let result = f();
			RECURSIVE_DEPTH.with(|d| d.set(0));
			drop(guard);
			result
		} else {
			RECURSIVE_DEPTH.with(|d| d.set(depth + 1));
			let result = f();
			RECURSIVE_DEPTH.with(|d| d.set(depth));
			result
		}
	}
}

/// A bounded least-recently-used cache of memory-mapped segments. A miss maps
/// the segment; a hit returns the cached mapping. Eviction is safe because
/// callers never retain a raw pointer past the duration of a single raw read or
/// write — block contents are copied into an owned shadow buffer immediately.
struct MappingCache {
	capacity: usize,
	maps: HashMap<u32, MmapMut>,
	order: VecDeque<u32>,
}

impl MappingCache {
	fn new(capacity: usize) -> Self {
		Self { capacity, maps: HashMap::new(), order: VecDeque::new() }
	}

	fn touch(&mut self, index: u32) {
		if let Some(pos) = self.order.iter().position(|&i| i == index) {
			self.order.remove(pos);
		}
		self.order.push_back(index);
	}

	fn get_or_map(&mut self, index: u32, file: &File, segment_size: u32) -> Result<&mut MmapMut> {
		if !self.maps.contains_key(&index) {
			let map = unsafe {
				memmap2::MmapOptions::new()
					.offset(index as u64 * segment_size as u64)
					.len(segment_size as usize)
					.map_mut(file)
					.map_err(Error::memory_mapping)?
			};
			self.maps.insert(index, map);
			self.evict_if_needed(index);
		}
		self.touch(index);
		Ok(self.maps.get_mut(&index).expect("just inserted"))
	}

	fn evict_if_needed(&mut self, just_inserted: u32) {
		while self.maps.len() > self.capacity {
			let Some(victim) = self.order.iter().copied().find(|&i| i != just_inserted) else { break };
			self.order.retain(|&i| i != victim);
			if let Some(map) = self.maps.remove(&victim) {
				let _ = map.flush();
			}
		}
	}

	fn flush_all(&mut self) -> Result<()> {
		for map in self.maps.values() {
			map.flush().map_err(Error::write_file)?;
		}
		Ok(())
	}
}

/// Opens, grows, and maps the single backing file as a sequence of fixed-size
/// segments (C1).
pub struct BackingFile {
	file: File,
	segment_size: u32,
	segment_count: Mutex<u32>,
	lock: RecursiveLock,
	cache: Mutex<MappingCache>,
}

impl BackingFile {
	/// Creates a new backing file at `path`, failing if one already exists.
	pub fn create(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create_new(true)
			.open(path)
			.map_err(Error::file_open)?;
		fs4::fs_std::FileExt::try_lock_exclusive(&file).map_err(Error::file_open)?;
		let store = Self {
			file,
			segment_size: options.segment_size(),
			segment_count: Mutex::new(0),
			lock: RecursiveLock::new(),
			cache: Mutex::new(MappingCache::new(options.mapping_cache_capacity)),
		};
		store.ensure_segment(0)?;
		Ok(store)
	}

	/// Opens an existing backing file, validating its magic and inheriting its
	/// segment size.
	pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.open(path)
			.map_err(Error::file_open)?;
		fs4::fs_std::FileExt::try_lock_exclusive(&file).map_err(Error::file_open)?;
		let len = file.metadata().map_err(Error::read_file)?.len();
		if len < SEGMENT_HEADER_SIZE as u64 {
			return Err(Error::invalid_signature());
		}
		let mut header = vec![0u8; SEGMENT_HEADER_PREFIX];
		{
			use std::io::Read;
			let mut f = &file;
			f.read_exact(&mut header).map_err(Error::read_file)?;
		}
		if &header[0..4] != MAGIC {
			return Err(Error::invalid_signature());
		}
		let segment_size = u32::from_ne_bytes(header[4..8].try_into().unwrap());
		let segment_count = (len / segment_size as u64) as u32;
		let _ = options;
		Ok(Self {
			file,
			segment_size,
			segment_count: Mutex::new(segment_count),
			lock: RecursiveLock::new(),
			cache: Mutex::new(MappingCache::new(DEFAULT_MAPPING_CACHE_CAPACITY)),
		})
	}

	pub fn segment_size(&self) -> u32 { self.segment_size }

	/// Returns the number of segments currently in the file.
	pub fn available_segments(&self) -> u32 {
		*self.segment_count.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Ensures segment `index` exists, appending a fully-zeroed segment (and any
	/// gap segments before it) if needed, then writing its header. Returns the
	/// topology header for the segment, so callers (C2) can populate slot
	/// offsets on first creation.
	pub fn ensure_segment(&self, index: u32) -> Result<TopologyHeader> {
		self.lock.with(|| self.ensure_segment_locked(index))
	}

	fn ensure_segment_locked(&self, index: u32) -> Result<TopologyHeader> {
		let mut count = self.segment_count.lock().unwrap_or_else(|e| e.into_inner());
		if index < *count {
			drop(count);
			return self.read_topology_header(index);
		}

		let new_count = index + 1;
		let new_len = new_count as u64 * self.segment_size as u64;
		self.file.set_len(new_len).map_err(Error::write_file)?;
		self.file.sync_all().map_err(Error::write_file)?;
		*count = new_count;
		drop(count);

		// Fresh segments get a blank topology header; slots are populated by
		// the caller (the topology layer) via write_topology_header.
		let header = TopologyHeader::absent();
		self.write_segment_header(index, &header)?;
		Ok(header)
	}

	fn write_segment_header(&self, index: u32, topology: &TopologyHeader) -> Result<()> {
		let mut buf = vec![0u8; SEGMENT_HEADER_SIZE];
		buf[0..4].copy_from_slice(MAGIC);
		buf[4..8].copy_from_slice(&self.segment_size.to_ne_bytes());
		topology.encode(&mut buf[SEGMENT_HEADER_PREFIX..SEGMENT_HEADER_PREFIX + TOPOLOGY_HEADER_SIZE]);
		self.write_bytes(index, 0, &buf)
	}

	/// Persists an updated topology header for `index` (called once, when a
	/// slot claims its region on first use of a segment).
	pub fn write_topology_header(&self, index: u32, topology: &TopologyHeader) -> Result<()> {
		self.lock.with(|| self.write_segment_header(index, topology))
	}

	pub fn read_topology_header(&self, index: u32) -> Result<TopologyHeader> {
		let mut buf = vec![0u8; TOPOLOGY_HEADER_SIZE];
		self.read_bytes(index, SEGMENT_HEADER_PREFIX as u32, &mut buf)?;
		Ok(TopologyHeader::decode(&buf))
	}

	/// Computes slot byte sizes and offsets for `index`, writing them if this is
	/// the segment's first use (offsets are still absent).
	pub fn topology_for(&self, index: u32) -> Result<TopologyHeader> {
		self.lock.with(|| {
			let mut header = self.read_topology_header(index)?;
			if header.slot_offsets.iter().all(|&o| o == crate::address::EOS) {
				let sizes = slot_sizes(index);
				let mut cursor = SEGMENT_HEADER_SIZE as u32;
				for (slot, &size) in sizes.iter().enumerate() {
					if size == 0 {
						header.set_offset(slot, None);
					} else {
						header.set_offset(slot, Some(cursor));
						cursor += size;
					}
				}
				self.write_segment_header(index, &header)?;
			}
			Ok(header)
		})
	}

	/// Reads `len` raw bytes at `addr` into `out`. Internal: only C7 calls this.
	pub(crate) fn read_raw(&self, block: Block, out: &mut [u8]) -> Result<()> {
		self.read_bytes(block.segment(), block.start(), out)
	}

	/// Writes `src` to the raw segment mapping at `block`. Internal: only C7's
	/// commit path calls this.
	pub(crate) fn write_raw(&self, block: Block, src: &[u8]) -> Result<()> {
		self.write_bytes(block.segment(), block.start(), src)
	}

	fn read_bytes(&self, segment: u32, offset: u32, out: &mut [u8]) -> Result<()> {
		self.lock.with(|| {
			let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
			let map = cache.get_or_map(segment, &self.file, self.segment_size)?;
			let start = offset as usize;
			let end = start + out.len();
			if end > map.len() {
				return Err(Error::invalid_block());
			}
			out.copy_from_slice(&map[start..end]);
			Ok(())
		})
	}

	fn write_bytes(&self, segment: u32, offset: u32, src: &[u8]) -> Result<()> {
		self.lock.with(|| {
			let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
			let map = cache.get_or_map(segment, &self.file, self.segment_size)?;
			let start = offset as usize;
			let end = start + src.len();
			if end > map.len() {
				return Err(Error::invalid_block());
			}
			map[start..end].copy_from_slice(src);
			Ok(())
		})
	}

	/// Flushes every memory-mapped segment to disk.
	pub fn sync(&self) -> Result<()> {
		self.lock.with(|| {
			self.cache.lock().unwrap_or_else(|e| e.into_inner()).flush_all()
		})
	}
}

impl Drop for BackingFile {
	fn drop(&mut self) {
		let _ = self.sync();
	}
}
