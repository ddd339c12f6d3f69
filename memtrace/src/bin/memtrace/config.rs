//! Program description

// Imports
use {
	memtrace::planner::{Arch, Instr, Reg},
	std::collections::BTreeMap,
};

/// Program
#[derive(Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Program {
	/// Architecture
	pub arch: Arch,

	/// Whether to emit instruction fetch entries
	#[serde(default)]
	pub instr_fetch: bool,

	/// Buffer entries per thread
	#[serde(default)]
	pub buffer_entries: Option<usize>,

	/// Blocks
	pub blocks: Vec<Vec<Instr>>,

	/// Threads
	pub threads: Vec<ThreadProgram>,
}

/// Thread program
#[derive(Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ThreadProgram {
	/// Thread id
	pub tid: u64,

	/// Blocks executed, in order
	pub runs: Vec<BlockRun>,
}

/// Block run
#[derive(Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct BlockRun {
	/// Block index
	pub block: usize,

	/// Register values when entering the block
	#[serde(default)]
	pub regs: BTreeMap<Reg, u64>,
}
