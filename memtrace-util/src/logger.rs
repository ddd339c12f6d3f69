//! Logger

// Imports
use {
	std::{fs, io, path::Path, sync::Mutex},
	tracing::metadata::LevelFilter,
	tracing_subscriber::{prelude::*, EnvFilter},
};

/// Logging before the logger is initialized.
///
/// Messages are queued and emitted once [`init`](super::init) is called.
pub mod pre_init {
	// Imports
	use std::sync::Mutex;

	/// Queued message level
	#[derive(Clone, Copy, Debug)]
	pub(super) enum Level {
		Debug,
		Warn,
	}

	/// Queued messages
	static MESSAGES: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());

	/// Queues a debug message
	pub fn debug(msg: impl Into<String>) {
		self::push(Level::Debug, msg.into());
	}

	/// Queues a warning message
	pub fn warn(msg: impl Into<String>) {
		self::push(Level::Warn, msg.into());
	}

	fn push(level: Level, msg: String) {
		MESSAGES
			.lock()
			.unwrap_or_else(|err| err.into_inner())
			.push((level, msg));
	}

	/// Takes all queued messages
	pub(super) fn take() -> Vec<(Level, String)> {
		std::mem::take(&mut *MESSAGES.lock().unwrap_or_else(|err| err.into_inner()))
	}
}

/// Initializes the logger.
///
/// Logs to stderr, filtered by `RUST_LOG` (defaults to `info`).
/// If `log_file` is given, additionally logs to it, filtered by
/// `RUST_LOG_FILE` (defaults to `trace`).
pub fn init(log_file: Option<&Path>, log_file_append: bool) {
	let term_layer = tracing_subscriber::fmt::layer()
		.with_writer(io::stderr)
		.with_filter(self::env_filter("RUST_LOG", LevelFilter::INFO));

	let file_layer = log_file.and_then(|path| {
		let file = fs::OpenOptions::new()
			.create(true)
			.write(true)
			.append(log_file_append)
			.truncate(!log_file_append)
			.open(path);

		match file {
			Ok(file) => Some(
				tracing_subscriber::fmt::layer()
					.with_ansi(false)
					.with_writer(Mutex::new(file))
					.with_filter(self::env_filter("RUST_LOG_FILE", LevelFilter::TRACE)),
			),
			Err(err) => {
				pre_init::warn(format!("Unable to open log file {path:?}: {err}"));
				None
			},
		}
	});

	if let Err(err) = tracing_subscriber::registry()
		.with(term_layer)
		.with(file_layer)
		.try_init()
	{
		eprintln!("Unable to initialize logger: {err}");
	}

	for (level, msg) in pre_init::take() {
		match level {
			pre_init::Level::Debug => tracing::debug!("{msg}"),
			pre_init::Level::Warn => tracing::warn!("{msg}"),
		}
	}
}

/// Creates an env filter from `var`, defaulting to `default`
fn env_filter(var: &str, default: LevelFilter) -> EnvFilter {
	EnvFilter::builder()
		.with_default_directive(default.into())
		.with_env_var(var)
		.from_env_lossy()
}
