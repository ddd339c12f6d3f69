//! Reads a `memtrace` stream, either from a named pipe or a captured file,
//! and summarizes it per thread.

// Imports
use {
	anyhow::Context,
	clap::Parser,
	itertools::Itertools,
	memtrace::{channel::NamedPipeReader, replay::ThreadTrace, EntryKind, Options, Replay, TraceEntry},
	memtrace_util::{logger, DisplayWrapper},
	std::{
		collections::BTreeMap,
		fs,
		io::{self, BufReader, BufWriter},
		path::PathBuf,
	},
};

/// Arguments
#[derive(Debug)]
#[derive(clap::Parser)]
struct Args {
	/// Log file
	///
	/// Specifies a file to perform verbose logging to.
	/// You can use `RUST_LOG_FILE` to set filtering options
	#[clap(long = "log-file")]
	log_file: Option<PathBuf>,

	/// Whether to append to the log file
	#[clap(long = "log-file-append")]
	log_file_append: bool,

	/// Name of the pipe to create and read from
	#[clap(long = "ipc", conflicts_with = "input_file", required_unless_present = "input_file")]
	ipc_name: Option<String>,

	/// Captured stream to read instead of a pipe
	#[clap(long = "input")]
	input_file: Option<PathBuf>,

	/// Output file for the summary, defaults to stdout
	#[clap(long = "output")]
	output_file: Option<PathBuf>,

	/// Whether to include every event in the summary
	#[clap(long = "events")]
	events: bool,
}

/// Summary
#[derive(Debug)]
#[derive(serde::Serialize)]
struct Summary {
	/// Total entries
	entries: u64,

	/// Threads, by id
	threads: BTreeMap<u64, ThreadSummary>,
}

/// Thread summary
#[derive(Debug)]
#[derive(serde::Serialize)]
struct ThreadSummary {
	pid:           Option<u32>,
	messages:      usize,
	reads:         usize,
	writes:        usize,
	instr_fetches: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	events:        Option<Vec<TraceEntry>>,
}

fn main() -> Result<(), anyhow::Error> {
	// Get arguments
	let args = Args::parse();
	logger::pre_init::debug(format!("Args: {args:?}"));

	// Initialize logging
	logger::init(args.log_file.as_deref(), args.log_file_append);

	// Replay the stream
	let replay = match (&args.input_file, &args.ipc_name) {
		(Some(input_file), _) => {
			let file = fs::File::open(input_file).context("Unable to open input file")?;
			Replay::from_reader(BufReader::new(file)).context("Unable to replay input file")?
		},
		(None, Some(ipc_name)) => {
			// Note: We go through the client options so the name is validated the same way.
			let options = Options::parse(&format!("-ipc \"{ipc_name}\"")).context("Invalid pipe name")?;
			let mut pipe = NamedPipeReader::create(&options.pipe_path()).context("Unable to create pipe")?;
			tracing::info!(path = ?pipe.path(), "Waiting for tracer");
			pipe.open().context("Unable to open pipe")?;

			Replay::from_reader(BufReader::new(&mut pipe)).context("Unable to replay pipe")?
		},
		(None, None) => anyhow::bail!("One of `--ipc` or `--input` is required"),
	};

	tracing::info!(
		"Replayed {} entries: {}",
		replay.entries_seen(),
		DisplayWrapper::new(|f| {
			let threads = replay
				.threads()
				.iter()
				.map(|(tid, thread)| {
					let reads = thread.count(EntryKind::Read);
					let writes = thread.count(EntryKind::Write);
					format!("{tid}: {reads}r/{writes}w")
				})
				.join(", ");
			write!(f, "[{threads}]")
		})
	);

	let summary = Summary {
		entries: replay.entries_seen(),
		threads: replay
			.into_threads()
			.into_iter()
			.map(|(tid, thread)| (tid, self::thread_summary(thread, args.events)))
			.collect(),
	};

	match &args.output_file {
		Some(output_file) => {
			let file = fs::File::create(output_file).context("Unable to create output file")?;
			serde_json::to_writer_pretty(BufWriter::new(file), &summary).context("Unable to write summary")?;
		},
		None => serde_json::to_writer_pretty(io::stdout().lock(), &summary).context("Unable to write summary")?,
	}

	Ok(())
}

/// Summarizes a thread
fn thread_summary(thread: ThreadTrace, include_events: bool) -> ThreadSummary {
	ThreadSummary {
		pid:           thread.pid,
		messages:      thread.messages,
		reads:         thread.count(EntryKind::Read),
		writes:        thread.count(EntryKind::Write),
		instr_fetches: thread.count(EntryKind::InstrFetch),
		events:        include_events.then_some(thread.events),
	}
}
