// SPDX-License-Identifier: Apache-2.0

//! Shadow Buffer Cache (C5): recyclable byte buffers keyed by size class, used
//! as transaction-local copies of file blocks. Recycling is an optimisation —
//! correctness never depends on getting a previously-used buffer back.

use std::sync::Mutex;

/// Rounds `size` up to a small size class so differently-sized requests of
/// similar magnitude can reuse the same pooled buffers.
fn size_class(size: usize) -> usize {
	if size <= 64 { return 64; }
	size.next_power_of_two()
}

#[derive(Default)]
struct Bins {
	bins: std::collections::HashMap<usize, Vec<Vec<u8>>>,
}

/// A pool of zero-initialised byte buffers, bucketed by size class.
pub struct ShadowPool {
	bins: Mutex<Bins>,
}

impl Default for ShadowPool {
	fn default() -> Self { Self::new() }
}

impl ShadowPool {
	pub fn new() -> Self {
		Self { bins: Mutex::new(Bins::default()) }
	}

	/// Borrows (or allocates) a zeroed buffer of at least `size` bytes,
	/// truncated to exactly `size`.
	pub fn get(&self, size: usize) -> Vec<u8> {
		let class = size_class(size);
		let mut guard = self.bins.lock().unwrap_or_else(|e| e.into_inner());
		let mut buf = guard.bins.get_mut(&class)
			.and_then(Vec::pop)
			.unwrap_or_else(|| vec![0u8; class]);
		buf.resize(size, 0);
		buf
	}

	/// Returns a buffer to the pool after its owning transaction terminates.
	pub fn utilize(&self, mut buf: Vec<u8>) {
		let class = size_class(buf.capacity().max(buf.len()));
		buf.clear();
		buf.resize(class, 0);
		let mut guard = self.bins.lock().unwrap_or_else(|e| e.into_inner());
		let slot = guard.bins.entry(class).or_default();
		if slot.len() < 256 {
			slot.push(buf);
		}
	}
}
