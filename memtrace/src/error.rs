//! Errors

// Imports
use std::io;

/// Tracing error.
///
/// Every variant is fatal to the tracing session: callers propagate it to
/// the top level, which aborts.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
	/// Bad client options
	#[error("Invalid configuration")]
	Config(#[from] ConfigError),

	/// Unable to allocate something the trace can't be faithful without
	#[error("Resource exhausted: {0}")]
	ResourceExhaustion(#[from] ResourceError),

	/// Unable to deliver a message to the channel
	#[error("Unable to write to channel")]
	ChannelWrite(#[from] ChannelError),

	/// Malformed trace stream
	#[error("Unable to decode trace stream")]
	Decode(#[from] DecodeError),

	/// Tracing already ended
	#[error("Tracing has already exited")]
	Exited,
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	/// `-ipc` was not given
	#[error("`-ipc <name>` is required")]
	MissingIpcName,

	/// `-ipc` was given without a value
	#[error("Missing ipc name after `-ipc`")]
	MissingIpcValue,

	/// `-ipc` value can't name a pipe
	#[error("Malformed ipc name {name:?}")]
	MalformedIpcName { name: String },

	/// Unknown option
	#[error("Unrecognized option {option:?}")]
	UnrecognizedOption { option: String },

	/// A quoted token was never closed
	#[error("Unterminated quote in options")]
	UnterminatedQuote,
}

/// Resource exhaustion error
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
	/// Unable to reserve a thread's trace buffer
	#[error("Unable to allocate trace buffer of {bytes} bytes")]
	Buffer { bytes: usize },

	/// A trace buffer can't hold a single entry past its header
	#[error("Trace buffer of {capacity} entries has no room past its header")]
	BufferTooSmall { capacity: usize },

	/// Unable to reserve per-block bookkeeping
	#[error("Unable to allocate block bookkeeping")]
	BlockData,

	/// A thread wrote past the end of its buffer between flushes
	#[error("Trace buffer overflow: store at {offset:#x} past capacity {capacity:#x}")]
	BufferOverflow { offset: usize, capacity: usize },

	/// A thread was started twice, or exited without starting
	#[error("No buffer slot for thread {tid}")]
	ThreadSlot { tid: u64 },
}

/// Channel error
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
	/// The transport accepted fewer bytes than requested
	#[error("Partial write: wrote {written} of {expected} bytes")]
	Partial { written: usize, expected: usize },

	/// The channel was already closed
	#[error("Channel is closed")]
	Closed,

	/// Underlying io error
	#[error("Io error")]
	Io(#[from] io::Error),
}

/// Decode error
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	/// Unknown entry type
	#[error("Unknown entry type {kind}")]
	UnknownKind { kind: u16 },

	/// Stream ended in the middle of an entry
	#[error("Truncated entry")]
	Truncated(#[source] io::Error),

	/// An access was seen before any thread header
	#[error("Entry #{idx} precedes any thread header")]
	Orphan { idx: u64 },

	/// A thread's first message wasn't its registration pair
	#[error("Thread {tid} didn't register before sending entries")]
	Unregistered { tid: u64 },

	/// A thread registered twice
	#[error("Thread {tid} registered more than once")]
	Reregistered { tid: u64 },
}
