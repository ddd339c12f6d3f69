//! Tracing over a named pipe
#![cfg(unix)]

// Imports
use {
	memtrace::{channel::NamedPipeReader, Options, Replay, TraceEntry, Tracer},
	std::thread,
};

#[test]
fn tracer_streams_to_consumer() {
	let options = Options::parse(&format!("-ipc memtrace-test-{}", std::process::id())).unwrap();
	let mut reader = NamedPipeReader::create(&options.pipe_path()).unwrap();

	let tracer_thread = thread::spawn(move || {
		let tracer = Tracer::from_options(&options).unwrap().with_pid(3);
		let mut buffer = tracer.thread_init(9).unwrap();
		buffer.push(&TraceEntry::read(4, 0x40)).unwrap();
		buffer.push(&TraceEntry::write(1, 0x41)).unwrap();
		tracer.thread_exit(buffer).unwrap();
		tracer.exit().unwrap()
	});

	reader.open().unwrap();
	let replay = Replay::from_reader(&mut reader).unwrap();
	assert_eq!(tracer_thread.join().unwrap(), 3);

	let thread = replay.thread(9).unwrap();
	assert_eq!(thread.pid, Some(3));
	assert_eq!(thread.events, [TraceEntry::read(4, 0x40), TraceEntry::write(1, 0x41)]);
}
