// Copyright 2023 Strixpyrr
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An embedded, transactional, ordered key-value store backed by a single
//! memory-mapped file.
//!
//! ## How it works
//!
//! The backing file is a sequence of fixed-size *segments* (`file`), each
//! mapped into memory on demand and evicted under a bounded LRU. Within a
//! segment, a small *topology* header (`topology`) records where each
//! compile-time-declared slot lives: a boundary-tagged heap allocator for
//! variable-size blocks (`alloc::heap`), a fixed-size pool allocator for trie
//! nodes (`alloc::fixed`), and, in segment 0 only, the trie's root residence.
//!
//! Every read or write of a block is mediated by the event-sourcing segment
//! manager (`manager`), which hands out [`Transaction`](manager::Transaction)
//! handles. A transaction's writes land in a transaction-local shadow buffer
//! (`shadow`) and are recorded in the store's change history (`history`),
//! which is what lets concurrent transactions coexist: a read overlays the
//! writes its own transaction (and, per [`IsolationPolicy`](options::IsolationPolicy),
//! others') has made so far, and a write conflicts loudly with another
//! transaction's unresolved write to the same bytes rather than silently
//! clobbering it. Commit flushes a transaction's shadow buffers to the mapped
//! segments in order; rollback just discards them.
//!
//! On top of that transactional byte store sits an adaptive radix trie
//! (`trie`), which is where keys and values actually live.

mod address;
mod options;
mod topology;
mod file;
mod shadow;
mod history;
mod manager;
mod alloc;
mod error;
pub mod trie;
mod store;

pub use address::{Block, FarAddress};
pub use error::{Error, ErrorKind, Result};
pub use options::{IsolationPolicy, StoreOptions};
pub use store::Store;
pub use trie::cursor::{Cursor, Range};

/// Magic bytes stamped at the start of every segment header, identifying the
/// file as belonging to this store.
pub const MAGIC: &[u8; 4] = b"mgtr";

/// The alignment, in bytes, every on-disk header and block boundary is padded
/// to. Chosen to keep `FarAddress`-bearing structs naturally aligned on both
/// 32- and 64-bit hosts.
pub(crate) const ALIGN: usize = 16;
