//! Flushing.
//!
//! Drains a thread's buffer into the channel.

// Imports
use {
	crate::{buffer::PerThreadBuffer, channel::Channel, error::TraceError, trace_entry::TraceEntry},
	std::fmt,
};

/// Flush policy
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum FlushPolicy {
	/// Skip the flush while the buffer is less than half full.
	///
	/// Used by the periodic in-line flush checks.
	Deferrable,

	/// Always flush.
	///
	/// Used when a thread exits.
	Forced,
}

/// Flush outcome
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum FlushOutcome {
	/// Buffer wasn't full enough, nothing was sent
	Deferred,

	/// Buffer was sent
	Flushed {
		/// Entries sent, including the header
		entries: usize,

		/// Whether the registration pair was sent first
		registered: bool,
	},
}

impl fmt::Display for FlushOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Deferred => write!(f, "deferred"),
			Self::Flushed {
				entries,
				registered: false,
			} => write!(f, "flushed {entries} entries"),
			Self::Flushed {
				entries,
				registered: true,
			} => write!(f, "registered and flushed {entries} entries"),
		}
	}
}

/// Flushes `buffer` into `channel`.
///
/// On the thread's first flush, a `[thread, pid]` message is sent before the
/// buffer contents. Afterwards the buffer is left empty.
///
/// # Errors
/// Returns an error if unable to send either message.
pub fn memtrace<C: Channel + ?Sized>(
	buffer: &mut PerThreadBuffer,
	channel: &C,
	pid: u32,
	policy: FlushPolicy,
) -> Result<FlushOutcome, TraceError> {
	// Delay sending until the buffer is half-filled
	let occupied = buffer.occupied_entries();
	if policy == FlushPolicy::Deferrable && occupied < buffer.capacity() / 2 {
		tracing::trace!(tid = buffer.tid(), occupied, "Deferring flush");
		return Ok(FlushOutcome::Deferred);
	}

	// Note: The initial slot was left empty for the header
	buffer.write_header();

	// Note: Registration happens once per thread, so we don't keep a
	//       second header slot for it and just send it separately.
	let registering = !buffer.is_registered();
	if registering {
		let header = buffer.header();
		let mut pid_info = [0; 2 * TraceEntry::BYTE_SIZE];
		header.encode(&mut pid_info[..TraceEntry::BYTE_SIZE]);
		TraceEntry::pid(pid).encode(&mut pid_info[TraceEntry::BYTE_SIZE..]);

		buffer.mark_registered();
		channel.send(&pid_info)?;
		tracing::debug!(tid = buffer.tid(), pid, "Registered thread");
	}

	channel.send(buffer.occupied_bytes())?;
	buffer.add_refs(occupied as u64);
	buffer.reset();

	let outcome = FlushOutcome::Flushed {
		entries:    occupied,
		registered: registering,
	};
	tracing::debug!(tid = buffer.tid(), %outcome, "Flushed buffer");
	Ok(outcome)
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{channel::CaptureChannel, trace_entry::TraceReader},
	};

	fn decode(message: &[u8]) -> Vec<TraceEntry> {
		TraceReader::new(message).collect::<Result<_, _>>().unwrap()
	}

	#[test]
	fn defers_below_half() {
		let channel = CaptureChannel::new();
		let mut buffer = PerThreadBuffer::new(5, 8).unwrap();

		// 1 header + 2 entries is below 8 / 2
		buffer.push(&TraceEntry::read(4, 0x10)).unwrap();
		buffer.push(&TraceEntry::read(4, 0x20)).unwrap();
		let outcome = memtrace(&mut buffer, &channel, 1, FlushPolicy::Deferrable).unwrap();
		assert_eq!(outcome, FlushOutcome::Deferred);
		assert!(channel.messages().is_empty());
		assert_eq!(buffer.pending_entries(), 2);

		// 1 header + 3 entries reaches it
		buffer.push(&TraceEntry::read(4, 0x30)).unwrap();
		let outcome = memtrace(&mut buffer, &channel, 1, FlushPolicy::Deferrable).unwrap();
		assert_eq!(outcome, FlushOutcome::Flushed {
			entries:    4,
			registered: true,
		});
		assert_eq!(buffer.pending_entries(), 0);
	}

	#[test]
	fn forced_flush_sends_empty_buffer() {
		let channel = CaptureChannel::new();
		let mut buffer = PerThreadBuffer::new(5, 8).unwrap();

		let outcome = memtrace(&mut buffer, &channel, 99, FlushPolicy::Forced).unwrap();
		assert_eq!(outcome, FlushOutcome::Flushed {
			entries:    1,
			registered: true,
		});

		let messages = channel.messages();
		assert_eq!(messages.len(), 2);
		assert_eq!(decode(&messages[0]), [TraceEntry::thread(5), TraceEntry::pid(99)]);
		assert_eq!(decode(&messages[1]), [TraceEntry::thread(5)]);
		assert_eq!(buffer.num_refs(), 1);
	}

	#[test]
	fn registers_once() {
		let channel = CaptureChannel::new();
		let mut buffer = PerThreadBuffer::new(5, 8).unwrap();

		buffer.push(&TraceEntry::read(4, 0xa)).unwrap();
		memtrace(&mut buffer, &channel, 2, FlushPolicy::Forced).unwrap();
		buffer.push(&TraceEntry::write(8, 0xb)).unwrap();
		let outcome = memtrace(&mut buffer, &channel, 2, FlushPolicy::Forced).unwrap();
		assert_eq!(outcome, FlushOutcome::Flushed {
			entries:    2,
			registered: false,
		});

		let messages = channel.messages().iter().map(|message| decode(message)).collect::<Vec<_>>();
		assert_eq!(messages, [
			vec![TraceEntry::thread(5), TraceEntry::pid(2)],
			vec![TraceEntry::thread(5), TraceEntry::read(4, 0xa)],
			vec![TraceEntry::thread(5), TraceEntry::write(8, 0xb)],
		]);
		assert_eq!(buffer.num_refs(), 4);
	}

	#[test]
	fn partial_write_is_an_error() {
		let channel = CaptureChannel::with_write_limit(2 * TraceEntry::BYTE_SIZE);
		let mut buffer = PerThreadBuffer::new(5, 8).unwrap();
		for _ in 0..3 {
			buffer.push(&TraceEntry::read(4, 0x10)).unwrap();
		}

		let err = memtrace(&mut buffer, &channel, 2, FlushPolicy::Forced).unwrap_err();
		assert!(matches!(
			err,
			TraceError::ChannelWrite(crate::error::ChannelError::Partial {
				written:  32,
				expected: 64,
			})
		));
	}
}
