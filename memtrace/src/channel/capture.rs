//! In-memory channel

// Imports
use {
	super::Channel,
	crate::error::ChannelError,
	std::sync::{Mutex, MutexGuard},
};

/// Channel that records every message in memory
#[derive(Debug, Default)]
pub struct CaptureChannel {
	/// Inner
	inner: Mutex<Inner>,

	/// Maximum bytes accepted per send, emulating a short write
	write_limit: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
	/// Messages, in send order
	messages: Vec<Vec<u8>>,

	/// Whether we're closed
	closed: bool,
}

impl CaptureChannel {
	/// Creates an empty channel
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a channel that only accepts the first `limit` bytes of each send
	#[must_use]
	pub fn with_write_limit(limit: usize) -> Self {
		Self {
			inner:       Mutex::default(),
			write_limit: Some(limit),
		}
	}

	/// Returns all messages sent so far
	pub fn messages(&self) -> Vec<Vec<u8>> {
		self.inner().messages.clone()
	}

	/// Returns all bytes sent so far, as a single stream
	pub fn bytes(&self) -> Vec<u8> {
		self.inner().messages.concat()
	}

	/// Returns whether the channel was closed
	pub fn is_closed(&self) -> bool {
		self.inner().closed
	}

	fn inner(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().expect("Capture channel lock was poisoned")
	}
}

impl Channel for CaptureChannel {
	fn send(&self, bytes: &[u8]) -> Result<(), ChannelError> {
		let mut inner = self.inner();
		if inner.closed {
			return Err(ChannelError::Closed);
		}

		let written = self.write_limit.map_or(bytes.len(), |limit| bytes.len().min(limit));
		inner.messages.push(bytes[..written].to_vec());
		match written == bytes.len() {
			true => Ok(()),
			false => Err(ChannelError::Partial {
				written,
				expected: bytes.len(),
			}),
		}
	}

	fn close(&self) -> Result<(), ChannelError> {
		self.inner().closed = true;
		Ok(())
	}
}
