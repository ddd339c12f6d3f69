//! Memory access tracer (`memtrace`)
//!
//! Captures the memory accesses of an observed program's threads into
//! per-thread buffers, and streams them to a consumer over a single channel.

// Modules
pub mod buffer;
pub mod channel;
pub mod error;
pub mod flush;
pub mod host;
pub mod options;
pub mod planner;
pub mod replay;
pub mod trace_entry;
pub mod tracer;

// Exports
pub use self::{
	buffer::PerThreadBuffer,
	channel::Channel,
	error::TraceError,
	flush::{FlushOutcome, FlushPolicy},
	host::Machine,
	options::Options,
	planner::{Arch, Planner},
	replay::Replay,
	trace_entry::{EntryKind, TraceEntry, TraceReader},
	tracer::Tracer,
};
