//! Tracer.
//!
//! Process-wide tracing state: the channel, the aggregate counters and the
//! per-thread buffer lifecycle.

// Imports
use {
	crate::{
		buffer::{BufferState, PerThreadBuffer},
		channel::Channel,
		error::{ResourceError, TraceError},
		flush::{self, FlushOutcome, FlushPolicy},
	},
	std::{
		collections::BTreeSet,
		sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
	},
};

/// Tracer
#[derive(Debug)]
pub struct Tracer<C> {
	/// Process id
	pid: u32,

	/// Entries per thread buffer
	buffer_entries: usize,

	/// Channel
	channel: C,

	/// Lifecycle, shared with every thread buffer
	lifecycle: Arc<Lifecycle>,
}

/// Thread lifecycle.
///
/// Shared between the tracer and the buffers it hands out, so a buffer
/// dropped without exiting still ends its thread.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
	/// Aggregate state
	aggregate: Mutex<Aggregate>,

	/// Signaled whenever a thread exits
	thread_exited: Condvar,
}

impl Lifecycle {
	/// Ends thread `tid`, folding its entries into the aggregate
	pub(crate) fn thread_ended(&self, tid: u64, num_refs: u64, abandoned: bool) {
		{
			let mut aggregate = self.aggregate();
			aggregate.num_refs += num_refs;
			if !aggregate.live_threads.remove(&tid) {
				tracing::warn!(tid, "Exited thread wasn't live");
			}
			if abandoned {
				aggregate.abandoned_threads.insert(tid);
			}
		}
		self.thread_exited.notify_all();
	}

	// Note: The aggregate is only ever left consistent, so a panic while
	//       holding the lock doesn't invalidate it.
	fn aggregate(&self) -> MutexGuard<'_, Aggregate> {
		self.aggregate.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// Aggregate state
#[derive(Debug, Default)]
struct Aggregate {
	/// Entries sent by all exited threads
	num_refs: u64,

	/// Live threads
	live_threads: BTreeSet<u64>,

	/// Threads whose buffer was dropped without exiting
	abandoned_threads: BTreeSet<u64>,

	/// Whether tracing has ended
	exited: bool,
}

#[cfg(unix)]
impl Tracer<crate::channel::NamedPipe> {
	/// Starts tracing to the pipe named by `options`.
	///
	/// Blocks until the consumer opens the pipe.
	pub fn from_options(options: &crate::Options) -> Result<Self, TraceError> {
		let path = options.pipe_path();
		let pipe = crate::channel::NamedPipe::open_for_write(&path).map_err(crate::error::ChannelError::Io)?;
		tracing::info!(?path, "Opened trace pipe");

		Ok(Self::new(pipe))
	}
}

impl<C: Channel> Tracer<C> {
	/// Creates a tracer over `channel` for the current process
	pub fn new(channel: C) -> Self {
		Self {
			pid: std::process::id(),
			buffer_entries: PerThreadBuffer::MAX_NUM_ENTRIES,
			channel,
			lifecycle: Arc::default(),
		}
	}

	/// Sets the process id reported to the consumer
	#[must_use]
	pub fn with_pid(self, pid: u32) -> Self {
		Self { pid, ..self }
	}

	/// Sets the number of entries per thread buffer
	#[must_use]
	pub fn with_buffer_entries(self, buffer_entries: usize) -> Self {
		Self { buffer_entries, ..self }
	}

	/// Returns the process id
	pub fn pid(&self) -> u32 {
		self.pid
	}

	/// Returns the channel
	pub fn channel(&self) -> &C {
		&self.channel
	}

	/// Starts thread `tid`, returning its buffer.
	///
	/// The buffer must only be used by that thread, and should be given back
	/// to [`Self::thread_exit`] when it ends. Dropping it instead ends the
	/// thread without its final flush.
	///
	/// # Errors
	/// Returns an error if tracing already exited, if unable to allocate the
	/// buffer, or if `tid` is already live.
	pub fn thread_init(&self, tid: u64) -> Result<PerThreadBuffer, TraceError> {
		let mut buffer = PerThreadBuffer::new(tid, self.buffer_entries)?;

		{
			let mut aggregate = self.lifecycle.aggregate();
			if aggregate.exited {
				return Err(TraceError::Exited);
			}
			if !aggregate.live_threads.insert(tid) {
				return Err(ResourceError::ThreadSlot { tid }.into());
			}
		}
		buffer.attach(Arc::clone(&self.lifecycle));
		buffer.transition(BufferState::Active);
		tracing::debug!(tid, capacity = buffer.capacity(), "Started thread");

		Ok(buffer)
	}

	/// Flush check, called in-line by instrumented code.
	pub fn flush(&self, buffer: &mut PerThreadBuffer, policy: FlushPolicy) -> Result<FlushOutcome, TraceError> {
		flush::memtrace(buffer, &self.channel, self.pid, policy)
	}

	/// Ends a thread, flushing its buffer and releasing it.
	///
	/// Returns the number of entries the thread sent.
	///
	/// # Errors
	/// Returns an error if unable to flush. The thread is still considered exited.
	pub fn thread_exit(&self, mut buffer: PerThreadBuffer) -> Result<u64, TraceError> {
		let tid = buffer.tid();
		buffer.transition(BufferState::Draining);
		let flush_res = self.flush(&mut buffer, FlushPolicy::Forced);
		let num_refs = buffer.free();
		self.lifecycle.thread_ended(tid, num_refs, false);

		flush_res?;
		tracing::debug!(tid, num_refs, "Exited thread");
		Ok(num_refs)
	}

	/// Ends tracing.
	///
	/// Blocks until all live threads have exited, then closes the channel.
	/// No threads may start afterwards.
	/// Returns the number of entries sent by all threads.
	pub fn exit(&self) -> Result<u64, TraceError> {
		let num_refs = {
			let mut aggregate = self.lifecycle.aggregate();
			aggregate.exited = true;
			while !aggregate.live_threads.is_empty() {
				tracing::debug!(live_threads = ?aggregate.live_threads, "Waiting for threads to exit");
				aggregate = self
					.lifecycle
					.thread_exited
					.wait(aggregate)
					.unwrap_or_else(PoisonError::into_inner);
			}
			if !aggregate.abandoned_threads.is_empty() {
				tracing::warn!(abandoned_threads = ?aggregate.abandoned_threads, "Some threads never flushed on exit");
			}
			aggregate.num_refs
		};

		tracing::info!(num_refs, "Memtrace num refs seen");
		self.channel.close()?;

		Ok(num_refs)
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{channel::CaptureChannel, trace_entry::TraceEntry},
		std::sync::Arc,
	};

	#[test]
	fn aggregates_thread_counts() {
		let channel = Arc::new(CaptureChannel::new());
		let tracer = Tracer::new(Arc::clone(&channel)).with_pid(10);

		let mut first = tracer.thread_init(1).unwrap();
		let second = tracer.thread_init(2).unwrap();
		first.push(&TraceEntry::read(4, 0x10)).unwrap();
		first.push(&TraceEntry::write(4, 0x10)).unwrap();

		assert_eq!(tracer.thread_exit(first).unwrap(), 3);
		assert_eq!(tracer.thread_exit(second).unwrap(), 1);
		assert_eq!(tracer.exit().unwrap(), 4);
		assert!(channel.is_closed());

		// 2 registrations, 2 payloads
		assert_eq!(channel.messages().len(), 4);
	}

	#[test]
	fn rejects_duplicate_thread() {
		let tracer = Tracer::new(CaptureChannel::new());
		let _buffer = tracer.thread_init(1).unwrap();
		assert!(matches!(
			tracer.thread_init(1),
			Err(TraceError::ResourceExhaustion(ResourceError::ThreadSlot { tid: 1 }))
		));
	}

	#[test]
	fn exit_waits_for_threads() {
		let channel = Arc::new(CaptureChannel::new());
		let tracer = Tracer::new(Arc::clone(&channel));
		let buffer = tracer.thread_init(7).unwrap();

		let num_refs = std::thread::scope(|s| {
			s.spawn(|| {
				std::thread::sleep(std::time::Duration::from_millis(20));
				tracer.thread_exit(buffer).unwrap();
			});

			tracer.exit().unwrap()
		});

		assert_eq!(num_refs, 1);
		assert_eq!(channel.messages().len(), 2);
		assert!(channel.is_closed());
	}

	#[test]
	fn dropped_buffer_doesnt_block_exit() {
		let channel = Arc::new(CaptureChannel::new());
		let tracer = Tracer::new(Arc::clone(&channel));
		let mut flushed = tracer.thread_init(1).unwrap();
		let unflushed = tracer.thread_init(2).unwrap();
		flushed.push(&TraceEntry::read(4, 0x10)).unwrap();
		tracer.flush(&mut flushed, FlushPolicy::Forced).unwrap();

		std::thread::scope(|s| {
			s.spawn(move || {
				drop(flushed);
				drop(unflushed);
			});
		});

		// Only the entries flushed before the drop count
		assert_eq!(tracer.exit().unwrap(), 2);
		assert!(channel.is_closed());
	}

	#[test]
	fn rejects_threads_after_exit() {
		let tracer = Tracer::new(CaptureChannel::new());
		tracer.exit().unwrap();
		assert!(matches!(tracer.thread_init(1), Err(TraceError::Exited)));
	}

	#[test]
	fn rejects_buffer_without_room() {
		let tracer = Tracer::new(CaptureChannel::new()).with_buffer_entries(1);
		assert!(matches!(
			tracer.thread_init(1),
			Err(TraceError::ResourceExhaustion(ResourceError::BufferTooSmall { capacity: 1 }))
		));
		assert_eq!(tracer.exit().unwrap(), 0);
	}

	#[test]
	fn failed_exit_flush_still_exits() {
		let tracer = Tracer::new(CaptureChannel::with_write_limit(0));
		let buffer = tracer.thread_init(3).unwrap();
		assert!(matches!(tracer.thread_exit(buffer), Err(TraceError::ChannelWrite(_))));
		assert_eq!(tracer.exit().unwrap(), 0);
	}
}
