//! Arguments

// Imports
use std::path::PathBuf;

/// Arguments
#[derive(Debug)]
#[derive(clap::Parser)]
pub struct Args {
	/// Log file
	///
	/// Specifies a file to perform verbose logging to.
	/// You can use `RUST_LOG_FILE` to set filtering options
	#[clap(long = "log-file")]
	pub log_file: Option<PathBuf>,

	/// Whether to append to the log file
	#[clap(long = "log-file-append")]
	pub log_file_append: bool,

	/// Client options
	///
	/// Must contain `-ipc <name>`, the name of the pipe the consumer is reading.
	#[clap(long = "options", allow_hyphen_values = true)]
	pub options: String,

	/// Program file
	///
	/// Describes the blocks of the program and what each thread executes.
	pub program_file: PathBuf,
}
