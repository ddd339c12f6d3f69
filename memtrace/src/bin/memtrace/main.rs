//! Memory access tracer (`memtrace`)
//!
//! Runs a described program's threads through the tracer, streaming their
//! memory accesses to the consumer reading the pipe.

// Modules
mod args;
mod config;

// Imports
use {
	self::{
		args::Args,
		config::{Program, ThreadProgram},
	},
	anyhow::Context,
	clap::Parser,
	memtrace::{planner::BlockPlan, Channel, Machine, Options, Planner, Tracer},
	memtrace_util::logger,
	std::{fs, thread},
};

fn main() -> Result<(), anyhow::Error> {
	// Get arguments
	let args = Args::parse();
	logger::pre_init::debug(format!("Args: {args:?}"));

	// Initialize logging
	logger::init(args.log_file.as_deref(), args.log_file_append);

	// Parse the options
	let options = Options::parse(&args.options).context("Unable to parse client options")?;
	tracing::debug!(?options, "Parsed client options");

	// Read the program
	let program = {
		let program_file = fs::File::open(&args.program_file).context("Unable to open program file")?;
		serde_json::from_reader::<_, Program>(program_file).context("Unable to parse program file")?
	};

	// Plan every block up front, like a code cache would
	let planner = Planner::new(program.arch).with_instr_fetch(program.instr_fetch);
	let block_plans = program
		.blocks
		.iter()
		.enumerate()
		.map(|(block_idx, block)| {
			planner
				.plan_block(block)
				.with_context(|| format!("Unable to plan block {block_idx}"))
		})
		.collect::<Result<Vec<_>, _>>()?;
	tracing::info!(blocks = block_plans.len(), threads = program.threads.len(), "Planned program");

	// Then start tracing
	let mut tracer = Tracer::from_options(&options).context("Unable to start tracer")?;
	if let Some(buffer_entries) = program.buffer_entries {
		tracer = tracer.with_buffer_entries(buffer_entries);
	}

	thread::scope(|s| {
		let handles = program
			.threads
			.iter()
			.map(|thread_program| {
				let tracer = &tracer;
				let block_plans = &block_plans;
				s.spawn(move || self::run_thread(tracer, block_plans, thread_program))
			})
			.collect::<Vec<_>>();

		handles.into_iter().try_for_each(|handle| match handle.join() {
			Ok(res) => res,
			Err(_) => anyhow::bail!("Thread panicked"),
		})
	})?;

	let num_refs = tracer.exit().context("Unable to finish tracing")?;
	tracing::info!(num_refs, "Finished tracing");

	Ok(())
}

/// Runs a thread of the program
fn run_thread<C: Channel>(
	tracer: &Tracer<C>,
	block_plans: &[BlockPlan],
	thread_program: &ThreadProgram,
) -> Result<(), anyhow::Error> {
	let tid = thread_program.tid;
	let mut buffer = tracer.thread_init(tid).context("Unable to start thread")?;

	let mut machine = Machine::new();
	for run in &thread_program.runs {
		let block_plan = block_plans
			.get(run.block)
			.with_context(|| format!("Thread {tid} runs unknown block {}", run.block))?;

		for (&reg, &value) in &run.regs {
			machine.set_reg(reg, value);
		}

		for instr_plan in &block_plan.instrs {
			machine
				.execute(instr_plan, &mut buffer, tracer)
				.with_context(|| format!("Unable to execute block {} on thread {tid}", run.block))?;
		}
	}

	let num_refs = tracer.thread_exit(buffer).context("Unable to exit thread")?;
	tracing::debug!(tid, num_refs, "Thread finished");

	Ok(())
}
