//! Channel.
//!
//! The single, process-wide, ordered byte stream to the consumer.

// Modules
pub mod capture;
#[cfg(unix)]
pub mod named_pipe;

// Exports
pub use self::capture::CaptureChannel;
#[cfg(unix)]
pub use self::named_pipe::{NamedPipe, NamedPipeReader};

// Imports
use {crate::error::ChannelError, std::sync::Arc};

/// Channel
pub trait Channel: Send + Sync {
	/// Sends `bytes` as a single message.
	///
	/// Either all of `bytes` is delivered, or an error is returned.
	fn send(&self, bytes: &[u8]) -> Result<(), ChannelError>;

	/// Closes the channel.
	///
	/// Any sends afterwards fail with [`ChannelError::Closed`].
	fn close(&self) -> Result<(), ChannelError>;
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
	fn send(&self, bytes: &[u8]) -> Result<(), ChannelError> {
		(**self).send(bytes)
	}

	fn close(&self) -> Result<(), ChannelError> {
		(**self).close()
	}
}
