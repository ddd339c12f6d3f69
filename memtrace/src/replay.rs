//! Trace replay.
//!
//! Splits a captured stream back into per-thread event sequences, checking
//! the registration protocol along the way.

// Imports
use {
	crate::{
		error::DecodeError,
		trace_entry::{EntryKind, TraceEntry, TraceReader},
	},
	std::{collections::BTreeMap, io},
};

/// Replayed trace
#[derive(Clone, Debug, Default)]
pub struct Replay {
	/// Threads, by id
	threads: BTreeMap<u64, ThreadTrace>,

	/// Thread of the last header seen
	cur_tid: Option<u64>,

	/// Entries seen
	entries_seen: u64,
}

/// Replayed thread
#[derive(Clone, Debug, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ThreadTrace {
	/// Process id, once registered
	pub pid: Option<u32>,

	/// Thread headers seen, excluding the registration one
	pub messages: usize,

	/// Events, in order
	pub events: Vec<TraceEntry>,
}

impl ThreadTrace {
	/// Returns the number of events of kind `kind`
	pub fn count(&self, kind: EntryKind) -> usize {
		self.events.iter().filter(|event| event.kind == kind).count()
	}
}

impl Replay {
	/// Creates an empty replay
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Replays all entries from `reader`
	pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, DecodeError> {
		let mut replay = Self::new();
		for entry in TraceReader::new(reader) {
			replay.push(entry?)?;
		}

		Ok(replay)
	}

	/// Replays a single entry
	pub fn push(&mut self, entry: TraceEntry) -> Result<(), DecodeError> {
		let idx = self.entries_seen;
		self.entries_seen += 1;

		// If we're expecting a registration, this must be it
		if let Some(tid) = self.cur_tid {
			let thread = self.threads.get(&tid).expect("Current thread must exist");
			if thread.pid.is_none() && entry.kind != EntryKind::Pid {
				return Err(DecodeError::Unregistered { tid });
			}
		}

		match entry.kind {
			EntryKind::Thread => {
				let tid = entry.addr;
				match self.threads.get_mut(&tid) {
					Some(thread) => thread.messages += 1,
					None => {
						tracing::debug!(tid, "New thread");
						self.threads.insert(tid, ThreadTrace::default());
					},
				}
				self.cur_tid = Some(tid);
			},

			EntryKind::Pid => {
				let tid = self.cur_tid.ok_or(DecodeError::Orphan { idx })?;
				let thread = self.threads.get_mut(&tid).expect("Current thread must exist");
				if thread.pid.is_some() {
					return Err(DecodeError::Reregistered { tid });
				}
				thread.pid = Some(entry.addr as u32);
			},

			EntryKind::Read | EntryKind::Write | EntryKind::InstrFetch => {
				let tid = self.cur_tid.ok_or(DecodeError::Orphan { idx })?;
				self.threads
					.get_mut(&tid)
					.expect("Current thread must exist")
					.events
					.push(entry);
			},
		}

		Ok(())
	}

	/// Returns all threads
	pub fn threads(&self) -> &BTreeMap<u64, ThreadTrace> {
		&self.threads
	}

	/// Returns a thread
	pub fn thread(&self, tid: u64) -> Option<&ThreadTrace> {
		self.threads.get(&tid)
	}

	/// Returns the total entries replayed
	pub fn entries_seen(&self) -> u64 {
		self.entries_seen
	}

	/// Returns all threads
	pub fn into_threads(self) -> BTreeMap<u64, ThreadTrace> {
		self.threads
	}
}
