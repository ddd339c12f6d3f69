//! Named pipe channel

// Imports
use {
	super::Channel,
	crate::error::ChannelError,
	std::{
		ffi::CString,
		fs,
		io::{self, Read, Write},
		os::unix::ffi::OsStrExt,
		path::{Path, PathBuf},
		sync::{Mutex, MutexGuard},
	},
};

/// Named pipe, write end.
///
/// All sends are serialized, so messages from different threads are never
/// interleaved, regardless of their size.
#[derive(Debug)]
pub struct NamedPipe {
	/// Path
	path: PathBuf,

	/// File, `None` once closed
	file: Mutex<Option<fs::File>>,
}

impl NamedPipe {
	/// Returns the path of the pipe named `name`
	pub fn path_for(name: &str) -> PathBuf {
		std::env::temp_dir().join(name)
	}

	/// Opens the pipe at `path` for writing.
	///
	/// Blocks until a reader opens the pipe.
	pub fn open_for_write(path: &Path) -> Result<Self, io::Error> {
		let file = fs::OpenOptions::new().write(true).open(path)?;
		match self::maximize_buffer(&file) {
			Ok(size) => tracing::debug!(?path, size, "Maximized pipe buffer"),
			Err(err) => tracing::warn!(?path, %err, "Unable to maximize pipe buffer"),
		}

		Ok(Self {
			path: path.to_path_buf(),
			file: Mutex::new(Some(file)),
		})
	}

	/// Returns the path
	pub fn path(&self) -> &Path {
		&self.path
	}

	fn file(&self) -> MutexGuard<'_, Option<fs::File>> {
		self.file.lock().expect("Pipe lock was poisoned")
	}
}

impl Channel for NamedPipe {
	fn send(&self, bytes: &[u8]) -> Result<(), ChannelError> {
		let mut file = self.file();
		let file = file.as_mut().ok_or(ChannelError::Closed)?;

		// Note: Only interruptions are retried, a short write is fatal.
		let written = loop {
			match file.write(bytes) {
				Ok(written) => break written,
				Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
				Err(err) => return Err(ChannelError::Io(err)),
			}
		};

		match written == bytes.len() {
			true => Ok(()),
			false => Err(ChannelError::Partial {
				written,
				expected: bytes.len(),
			}),
		}
	}

	fn close(&self) -> Result<(), ChannelError> {
		if let Some(mut file) = self.file().take() {
			file.flush()?;
		}

		Ok(())
	}
}

/// Named pipe, read end.
///
/// Creates the pipe and removes it when dropped.
#[derive(Debug)]
pub struct NamedPipeReader {
	/// Path
	path: PathBuf,

	/// File, once opened
	file: Option<fs::File>,
}

impl NamedPipeReader {
	/// Creates a pipe at `path`
	pub fn create(path: &Path) -> Result<Self, io::Error> {
		let c_path = CString::new(path.as_os_str().as_bytes())
			.map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

		// SAFETY: `c_path` is a valid nul-terminated string
		let res = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
		if res != 0 {
			return Err(io::Error::last_os_error());
		}
		tracing::debug!(?path, "Created named pipe");

		Ok(Self {
			path: path.to_path_buf(),
			file: None,
		})
	}

	/// Opens the pipe for reading.
	///
	/// Blocks until a writer opens the pipe.
	pub fn open(&mut self) -> Result<(), io::Error> {
		if self.file.is_none() {
			self.file = Some(fs::File::open(&self.path)?);
		}

		Ok(())
	}

	/// Returns the path
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Read for NamedPipeReader {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match &mut self.file {
			Some(file) => file.read(buf),
			None => Err(io::Error::new(io::ErrorKind::NotConnected, "Pipe wasn't opened")),
		}
	}
}

impl Drop for NamedPipeReader {
	fn drop(&mut self) {
		if let Err(err) = fs::remove_file(&self.path) {
			tracing::warn!(path = ?self.path, %err, "Unable to remove named pipe");
		}
	}
}

/// Grows the pipe's buffer to the system maximum, returning the new size
#[cfg(target_os = "linux")]
fn maximize_buffer(file: &fs::File) -> Result<usize, io::Error> {
	use std::os::fd::AsRawFd;

	let max_size = fs::read_to_string("/proc/sys/fs/pipe-max-size")?;
	let max_size = max_size
		.trim()
		.parse::<libc::c_int>()
		.map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

	// SAFETY: The file descriptor is open for the duration of the call
	let size = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETPIPE_SZ, max_size) };
	match usize::try_from(size) {
		Ok(size) => Ok(size),
		Err(_) => Err(io::Error::last_os_error()),
	}
}

/// Grows the pipe's buffer to the system maximum, returning the new size
#[cfg(not(target_os = "linux"))]
fn maximize_buffer(_file: &fs::File) -> Result<usize, io::Error> {
	Ok(libc::PIPE_BUF)
}
