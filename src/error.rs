// SPDX-License-Identifier: Apache-2.0

//! Structured errors for every fallible operation in the store.
//!
//! Every [`Error`] carries an [`ErrorKind`] plus an optional message and, where
//! applicable, a source error from the OS or an inner component. Callers match on
//! [`Error::kind`] to decide whether to retry ([`ErrorKind::ConcurrentLock`]), treat
//! the failure as fatal ([`ErrorKind::InvalidSignature`]), or propagate it.

use std::io;
use amplify_derive::Display;

/// The category of failure a store [`Error`] represents.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum ErrorKind {
	#[display("file header does not carry the expected magic")]
	InvalidSignature,
	#[display("could not open the backing file")]
	FileOpen,
	#[display("could not read the backing file")]
	ReadFile,
	#[display("could not write the backing file")]
	WriteFile,
	#[display("could not memory-map a segment")]
	MemoryMapping,
	#[display("heap allocator has no memory left to satisfy the request")]
	NoMemory,
	#[display("heap is fragmented, free space exists but no single block fits")]
	MemoryNeedCompression,
	#[display("block header is corrupt, addresses the wrong segment, or was already freed")]
	InvalidBlock,
	#[display("requested block overlaps an existing one")]
	OverlappingBlock,
	#[display("another transaction holds a conflicting lock")]
	ConcurrentLock,
	#[display("no transaction is open on this thread")]
	TransactionNotStarted,
	#[display("this thread already has a transaction open, nested transactions are not supported")]
	NestedTransaction,
	#[display("a read-only transaction is open, writes are blocked")]
	RoTransactionStarted,
	#[display("a writing transaction is open, cannot start read-only")]
	CannotStartRoTransaction,
	#[display("operation on a sealed save-point")]
	TransactionGhostState,
}

impl ErrorKind {
	/// Returns `true` if the caller may reasonably retry the operation that
	/// produced this error, per the policy table in the crate's design notes.
	pub fn is_recoverable(self) -> bool {
		use ErrorKind::*;
		matches!(self, MemoryNeedCompression | OverlappingBlock | ConcurrentLock | RoTransactionStarted | CannotStartRoTransaction)
		// NestedTransaction is a programmer error (the thread's own prior
		// transaction must be finished first), not a contention case to retry.
	}
}

/// The error type returned by every fallible store operation.
#[derive(Debug, Display)]
#[display("{kind}")]
pub struct Error {
	kind: ErrorKind,
	source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		self.source.as_deref().map(|e| e as _)
	}
}

impl Error {
	pub fn new(kind: ErrorKind) -> Self {
		Self { kind, source: None }
	}

	fn with_source(kind: ErrorKind, source: impl std::error::Error + Send + Sync + 'static) -> Self {
		Self { kind, source: Some(Box::new(source)) }
	}

	/// Returns the error's kind, for matching retry/fatal policy.
	pub fn kind(&self) -> ErrorKind { self.kind }

	pub(crate) fn invalid_signature() -> Self { Self::new(ErrorKind::InvalidSignature) }
	pub(crate) fn file_open(e: io::Error) -> Self { Self::with_source(ErrorKind::FileOpen, e) }
	pub(crate) fn read_file(e: io::Error) -> Self { Self::with_source(ErrorKind::ReadFile, e) }
	pub(crate) fn write_file(e: io::Error) -> Self { Self::with_source(ErrorKind::WriteFile, e) }
	pub(crate) fn memory_mapping(e: io::Error) -> Self { Self::with_source(ErrorKind::MemoryMapping, e) }
	pub(crate) fn no_memory() -> Self { Self::new(ErrorKind::NoMemory) }
	pub(crate) fn need_compression() -> Self { Self::new(ErrorKind::MemoryNeedCompression) }
	pub(crate) fn invalid_block() -> Self { Self::new(ErrorKind::InvalidBlock) }
	pub(crate) fn overlapping_block() -> Self { Self::new(ErrorKind::OverlappingBlock) }
	pub(crate) fn concurrent_lock() -> Self { Self::new(ErrorKind::ConcurrentLock) }
	pub(crate) fn transaction_not_started() -> Self { Self::new(ErrorKind::TransactionNotStarted) }
	pub(crate) fn nested_transaction() -> Self { Self::new(ErrorKind::NestedTransaction) }
	pub(crate) fn ro_transaction_started() -> Self { Self::new(ErrorKind::RoTransactionStarted) }
	pub(crate) fn cannot_start_ro_transaction() -> Self { Self::new(ErrorKind::CannotStartRoTransaction) }
	pub(crate) fn transaction_ghost_state() -> Self { Self::new(ErrorKind::TransactionGhostState) }
}

/// A specialized [`Result`](std::result::Result) for store operations.
pub type Result<T = ()> = std::result::Result<T, Error>;
