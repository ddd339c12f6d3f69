//! Instrumentation plans

// Imports
use {
	super::instr::{MemOperand, Reg},
	crate::trace_entry::TraceEntry,
	itertools::Itertools,
	std::fmt,
};

/// Spill slot, where a scratch register's value is kept while we use it
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum SpillSlot {
	/// Slot for the buffer pointer register
	Ptr,

	/// Slot for the temporary register
	Tmp,
}

impl SpillSlot {
	/// Number of spill slots
	pub const COUNT: usize = 2;

	/// Returns the index of this slot
	#[must_use]
	pub const fn idx(self) -> usize {
		match self {
			Self::Ptr => 0,
			Self::Tmp => 1,
		}
	}
}

/// Operation the host must materialize before an instruction.
///
/// Buffer offsets are relative to the register holding the buffer pointer.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Op {
	/// Saves `reg` into `slot`
	SaveReg { reg: Reg, slot: SpillSlot },

	/// Restores `reg` from `slot`
	RestoreReg { reg: Reg, slot: SpillSlot },

	/// Loads the thread's buffer pointer into `dst`
	LoadBufPtr { dst: Reg },

	/// Loads `value` into `scratch` and stores its low 16 bits at `base + disp`
	StoreImm16 {
		base:    Reg,
		scratch: Reg,
		disp:    usize,
		value:   u16,
	},

	/// Loads `value` into `scratch` and stores it at `base + disp`
	StoreImm64 {
		base:    Reg,
		scratch: Reg,
		disp:    usize,
		value:   u64,
	},

	/// Computes the address referred to by `mem` into `dst`, possibly clobbering `scratch`
	LoadEffectiveAddr { mem: MemOperand, dst: Reg, scratch: Reg },

	/// Stores `src` at `base + disp`
	StoreReg64 { base: Reg, disp: usize, src: Reg },

	/// Adds `adjust` to `reg` and writes it back as the thread's buffer pointer
	AdvanceBufPtr { reg: Reg, adjust: usize },

	/// Calls the deferrable flush
	FlushCheck,
}

impl fmt::Display for Op {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match *self {
			Self::SaveReg { reg, slot } => write!(f, "spill {reg} -> {slot:?}"),
			Self::RestoreReg { reg, slot } => write!(f, "restore {reg} <- {slot:?}"),
			Self::LoadBufPtr { dst } => write!(f, "{dst} = buf_ptr"),
			Self::StoreImm16 {
				base,
				scratch,
				disp,
				value,
			} => write!(f, "{scratch} = {value:#x}; [{base} + {disp:#x}]:2 = {scratch}"),
			Self::StoreImm64 {
				base,
				scratch,
				disp,
				value,
			} => write!(f, "{scratch} = {value:#x}; [{base} + {disp:#x}]:8 = {scratch}"),
			Self::LoadEffectiveAddr { mem, dst, .. } => write!(f, "{dst} = &{mem}"),
			Self::StoreReg64 { base, disp, src } => write!(f, "[{base} + {disp:#x}]:8 = {src}"),
			Self::AdvanceBufPtr { reg, adjust } => write!(f, "buf_ptr = {reg} += {adjust:#x}"),
			Self::FlushCheck => write!(f, "call memtrace(deferrable)"),
		}
	}
}

/// Plan for a single instruction
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct InstrPlan {
	/// Operations, in order
	pub ops: Vec<Op>,

	/// Number of entries written
	pub entries: usize,
}

impl InstrPlan {
	/// Returns if this plan does nothing
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}

	/// Returns the bytes this plan advances the buffer pointer by
	#[must_use]
	pub fn advance_bytes(&self) -> usize {
		self.entries * TraceEntry::BYTE_SIZE
	}

	/// Returns if this plan calls the flush check
	#[must_use]
	pub fn has_flush_check(&self) -> bool {
		self.ops.contains(&Op::FlushCheck)
	}
}

impl fmt::Display for InstrPlan {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.ops.iter().join("; "))
	}
}

/// Plan for a block, one plan per instruction
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct BlockPlan {
	/// Instruction plans, in instruction order
	pub instrs: Vec<InstrPlan>,
}

impl BlockPlan {
	/// Returns the total entries written by this block
	#[must_use]
	pub fn entries(&self) -> usize {
		self.instrs.iter().map(|plan| plan.entries).sum()
	}

	/// Returns the number of flush checks in this block
	#[must_use]
	pub fn flush_checks(&self) -> usize {
		self.instrs.iter().filter(|plan| plan.has_flush_check()).count()
	}
}
