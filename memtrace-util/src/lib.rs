//! Utilities

// Modules
pub mod logger;

// Imports
use std::{cell::RefCell, fmt, io};

/// Extension trait for `R: io::Read` types to read a byte array
#[extend::ext(name = ReadByteArray)]
pub impl<R: io::Read> R {
	/// Reads a byte array `[u8; N]` from this reader, unless it's at the end.
	///
	/// Returns `Ok(None)` if the reader was exhausted before the first byte,
	/// and `Err` if it was exhausted anywhere else.
	fn read_byte_array_or_eof<const N: usize>(&mut self) -> Result<Option<[u8; N]>, io::Error> {
		let mut array = [0u8; N];
		let mut filled = 0;
		while filled < N {
			match self.read(&mut array[filled..]) {
				Ok(0) if filled == 0 => return Ok(None),
				Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
				Ok(read) => filled += read,
				Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
				Err(err) => return Err(err),
			}
		}

		Ok(Some(array))
	}
}

/// [`fmt::Display`] helper to display using a `FnMut(&mut fmt::Formatter)`
pub struct DisplayWrapper<F: FnMut(&mut fmt::Formatter) -> fmt::Result>(RefCell<F>);

impl<F: FnMut(&mut fmt::Formatter) -> fmt::Result> DisplayWrapper<F> {
	/// Creates a new display wrapper
	#[must_use]
	pub const fn new(func: F) -> Self {
		Self(RefCell::new(func))
	}
}


impl<F: FnMut(&mut fmt::Formatter) -> fmt::Result> fmt::Display for DisplayWrapper<F> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		// Note: `f` cannot be re-entrant, so this cannot fail
		self.0.borrow_mut()(f)
	}
}
