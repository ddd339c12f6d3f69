//! Injection planner.
//!
//! Decides, for each instruction of the observed program, which trace entries
//! it needs and what code the host must insert before it to write them.

// Modules
pub mod instr;
pub mod plan;

// Exports
pub use self::{
	instr::{Instr, MemOperand, Operand, Reg},
	plan::{BlockPlan, InstrPlan, Op, SpillSlot},
};

// Imports
use crate::{
	error::ResourceError,
	trace_entry::{EntryKind, TraceEntry},
};

/// Architecture
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
	X86,
	Arm,
}

impl Arch {
	/// Returns the scratch registers, `(ptr, tmp)`.
	///
	/// `ptr` holds the buffer pointer and `tmp` the values being stored.
	#[must_use]
	pub const fn scratch_regs(self) -> (Reg, Reg) {
		match self {
			// `xcx`, `xbx`
			Self::X86 => (Reg(1), Reg(3)),
			// `r1`, `r2`
			Self::Arm => (Reg(1), Reg(2)),
		}
	}

	/// Returns if a flush check may be inserted before `instr`.
	///
	/// Skipping a flush check is fine, the buffer will be flushed by a later
	/// one or when the thread exits.
	#[must_use]
	pub fn flush_allowed(self, instr: &Instr) -> bool {
		match self {
			Self::X86 => true,
			// Note: Code between exclusive load/store pairs must be kept to a
			//       minimum, as it may clear the exclusive monitor.
			Self::Arm => !instr.predicated && !instr.exclusive_store,
		}
	}
}

/// Per-block bookkeeping
#[derive(Debug)]
pub struct BlockData {
	/// Whether the flush check was already inserted
	flush_check_inserted: bool,

	/// Plans so far
	plans: Vec<InstrPlan>,
}

/// Injection planner
#[derive(Clone, Copy, Debug)]
pub struct Planner {
	/// Architecture
	arch: Arch,

	/// Whether to emit instruction fetch entries
	instr_fetch: bool,
}

impl Planner {
	/// Creates a planner for `arch`.
	///
	/// Instruction fetch entries start disabled.
	#[must_use]
	pub const fn new(arch: Arch) -> Self {
		Self {
			arch,
			instr_fetch: false,
		}
	}

	/// Sets whether to emit instruction fetch entries
	#[must_use]
	pub const fn with_instr_fetch(self, instr_fetch: bool) -> Self {
		Self { instr_fetch, ..self }
	}

	/// Returns the architecture
	#[must_use]
	pub const fn arch(&self) -> Arch {
		self.arch
	}

	/// Starts a block of `len` instructions.
	///
	/// # Errors
	/// Returns an error if unable to allocate the block's bookkeeping.
	pub fn begin_block(&self, len: usize) -> Result<BlockData, ResourceError> {
		let mut plans = Vec::new();
		plans.try_reserve_exact(len).map_err(|_| ResourceError::BlockData)?;

		Ok(BlockData {
			flush_check_inserted: false,
			plans,
		})
	}

	/// Finishes a block
	pub fn end_block(&self, block: BlockData) -> BlockPlan {
		BlockPlan { instrs: block.plans }
	}

	/// Plans all instructions of a block
	pub fn plan_block(&self, instrs: &[Instr]) -> Result<BlockPlan, ResourceError> {
		let mut block = self.begin_block(instrs.len())?;
		for instr in instrs {
			self.plan_instr(&mut block, instr);
		}

		Ok(self.end_block(block))
	}

	/// Plans a single instruction of `block`, returning its plan
	pub fn plan_instr<'a>(&self, block: &'a mut BlockData, instr: &Instr) -> &'a InstrPlan {
		let plan = self.instr_plan(block, instr);
		tracing::trace!(pc = instr.pc, %plan, "Planned instruction");

		block.plans.push(plan);
		block.plans.last().expect("Just pushed a plan")
	}

	fn instr_plan(&self, block: &mut BlockData, instr: &Instr) -> InstrPlan {
		// Only instrument the program's own instructions that access memory
		if !instr.is_app() || (!instr.reads_memory() && !instr.writes_memory()) {
			return InstrPlan::default();
		}

		// Note: We save the scratch registers once per instruction, instead of
		//       once per entry.
		let (reg_ptr, reg_tmp) = self.arch.scratch_regs();
		let mut ops = vec![
			Op::SaveReg {
				reg:  reg_ptr,
				slot: SpillSlot::Ptr,
			},
			Op::SaveReg {
				reg:  reg_tmp,
				slot: SpillSlot::Tmp,
			},
			Op::LoadBufPtr { dst: reg_ptr },
		];
		let mut adjust = 0;

		// Note: Instruction fetch entries are off by default, since a separate
		//       entry per instruction takes more space than it's worth unless
		//       there are at least 2 memory references per instruction.
		if self.instr_fetch {
			ops.extend([
				Op::StoreImm16 {
					base:    reg_ptr,
					scratch: reg_tmp,
					disp:    adjust + TraceEntry::KIND_OFFSET,
					value:   EntryKind::InstrFetch.to_u16(),
				},
				Op::StoreImm16 {
					base:    reg_ptr,
					scratch: reg_tmp,
					disp:    adjust + TraceEntry::SIZE_OFFSET,
					value:   instr.length,
				},
				Op::StoreImm16 {
					base:    reg_ptr,
					scratch: reg_tmp,
					disp:    adjust + TraceEntry::OPCODE_OFFSET,
					value:   instr.opcode,
				},
				Op::StoreImm64 {
					base:    reg_ptr,
					scratch: reg_tmp,
					disp:    adjust + TraceEntry::ADDR_OFFSET,
					value:   instr.pc,
				},
			]);
			adjust += TraceEntry::BYTE_SIZE;
		}

		let mem_refs = instr
			.mem_srcs()
			.map(|mem| (EntryKind::Read, mem))
			.chain(instr.mem_dsts().map(|mem| (EntryKind::Write, mem)));
		for (kind, mem) in mem_refs {
			ops.extend([
				Op::StoreImm16 {
					base:    reg_ptr,
					scratch: reg_tmp,
					disp:    adjust + TraceEntry::KIND_OFFSET,
					value:   kind.to_u16(),
				},
				Op::StoreImm16 {
					base:    reg_ptr,
					scratch: reg_tmp,
					disp:    adjust + TraceEntry::SIZE_OFFSET,
					value:   mem.size,
				},
			]);

			// If the address depends on the scratch registers, get the program's
			// values back first.
			if mem.uses_reg(reg_ptr) {
				ops.push(Op::RestoreReg {
					reg:  reg_ptr,
					slot: SpillSlot::Ptr,
				});
			}
			if mem.uses_reg(reg_tmp) {
				ops.push(Op::RestoreReg {
					reg:  reg_tmp,
					slot: SpillSlot::Tmp,
				});
			}

			// Note: `reg_ptr` is used as scratch for the address, so reload it after.
			ops.extend([
				Op::LoadEffectiveAddr {
					mem:     *mem,
					dst:     reg_tmp,
					scratch: reg_ptr,
				},
				Op::LoadBufPtr { dst: reg_ptr },
				Op::StoreReg64 {
					base: reg_ptr,
					disp: adjust + TraceEntry::ADDR_OFFSET,
					src:  reg_tmp,
				},
			]);
			adjust += TraceEntry::BYTE_SIZE;
		}

		// Note: We update the buffer pointer once per instruction, instead of
		//       once per entry.
		ops.extend([
			Op::AdvanceBufPtr { reg: reg_ptr, adjust },
			Op::RestoreReg {
				reg:  reg_ptr,
				slot: SpillSlot::Ptr,
			},
			Op::RestoreReg {
				reg:  reg_tmp,
				slot: SpillSlot::Tmp,
			},
		]);

		if !block.flush_check_inserted && self.arch.flush_allowed(instr) {
			ops.push(Op::FlushCheck);
			block.flush_check_inserted = true;
		}

		InstrPlan {
			ops,
			entries: adjust / TraceEntry::BYTE_SIZE,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn mem(base: u8, size: u16) -> Operand {
		Operand::Mem(MemOperand {
			base: Some(Reg(base)),
			index: None,
			scale: 1,
			disp: 0,
			size,
		})
	}

	fn instr(srcs: Vec<Operand>, dsts: Vec<Operand>) -> Instr {
		Instr {
			pc: 0x400000,
			opcode: 0,
			length: 4,
			meta: false,
			srcs,
			dsts,
			predicated: false,
			exclusive_store: false,
		}
	}

	/// Returns the `(kind, size)` of every entry a plan stores, in order
	fn stored_entries(plan: &InstrPlan) -> Vec<(u16, u16)> {
		let stores = plan
			.ops
			.iter()
			.filter_map(|op| match *op {
				Op::StoreImm16 { disp, value, .. } if disp % TraceEntry::BYTE_SIZE != TraceEntry::OPCODE_OFFSET =>
					Some((disp, value)),
				_ => None,
			})
			.collect::<Vec<_>>();

		stores
			.chunks_exact(2)
			.map(|pair| {
				assert_eq!(pair[0].0 % TraceEntry::BYTE_SIZE, TraceEntry::KIND_OFFSET);
				assert_eq!(pair[1].0 % TraceEntry::BYTE_SIZE, TraceEntry::SIZE_OFFSET);
				(pair[0].1, pair[1].1)
			})
			.collect()
	}

	#[test]
	fn skips_non_memory_and_meta() {
		let planner = Planner::new(Arch::X86);
		let mut meta = instr(vec![mem(0, 4)], vec![]);
		meta.meta = true;

		let plan = planner
			.plan_block(&[instr(vec![Operand::Reg(Reg(0))], vec![Operand::Imm(1)]), meta])
			.unwrap();
		assert!(plan.instrs.iter().all(InstrPlan::is_empty));
		assert_eq!(plan.flush_checks(), 0);
	}

	#[test]
	fn sources_then_destinations() {
		let planner = Planner::new(Arch::X86);
		let plan = planner
			.plan_block(&[instr(vec![mem(0, 4), Operand::Reg(Reg(5)), mem(6, 2)], vec![mem(7, 8)])])
			.unwrap();

		let plan = &plan.instrs[0];
		assert_eq!(plan.entries, 3);
		assert_eq!(stored_entries(plan), [(0, 4), (0, 2), (1, 8)]);

		// Single pointer update for all entries
		let advances = plan
			.ops
			.iter()
			.filter(|op| matches!(op, Op::AdvanceBufPtr { .. }))
			.collect::<Vec<_>>();
		assert_eq!(advances, [&Op::AdvanceBufPtr {
			reg:    Reg(1),
			adjust: 3 * TraceEntry::BYTE_SIZE,
		}]);
	}

	#[test]
	fn saves_and_restores_scratch() {
		let planner = Planner::new(Arch::Arm);
		let plan = planner.plan_block(&[instr(vec![mem(0, 4)], vec![])]).unwrap();
		let ops = &plan.instrs[0].ops;

		assert_eq!(&ops[..2], [
			Op::SaveReg {
				reg:  Reg(1),
				slot: SpillSlot::Ptr,
			},
			Op::SaveReg {
				reg:  Reg(2),
				slot: SpillSlot::Tmp,
			},
		]);
		assert_eq!(&ops[ops.len() - 3..], [
			Op::RestoreReg {
				reg:  Reg(1),
				slot: SpillSlot::Ptr,
			},
			Op::RestoreReg {
				reg:  Reg(2),
				slot: SpillSlot::Tmp,
			},
			Op::FlushCheck,
		]);
	}

	#[test]
	fn restores_scratch_used_by_address() {
		let planner = Planner::new(Arch::X86);
		let plan = planner.plan_block(&[instr(vec![mem(1, 4)], vec![])]).unwrap();
		let ops = &plan.instrs[0].ops;

		let lea_idx = ops
			.iter()
			.position(|op| matches!(op, Op::LoadEffectiveAddr { .. }))
			.unwrap();
		assert_eq!(ops[lea_idx - 1], Op::RestoreReg {
			reg:  Reg(1),
			slot: SpillSlot::Ptr,
		});
		assert_eq!(ops[lea_idx + 1], Op::LoadBufPtr { dst: Reg(1) });
	}

	#[test]
	fn one_flush_check_per_block() {
		let planner = Planner::new(Arch::X86);
		let plan = planner
			.plan_block(&[
				instr(vec![], vec![Operand::Reg(Reg(0))]),
				instr(vec![mem(0, 4), mem(2, 4)], vec![]),
				instr(vec![], vec![mem(0, 8)]),
			])
			.unwrap();

		assert!(!plan.instrs[0].has_flush_check());
		assert!(plan.instrs[1].has_flush_check());
		assert!(!plan.instrs[2].has_flush_check());
		assert_eq!(plan.flush_checks(), 1);
		assert_eq!(plan.entries(), 3);
	}

	#[test]
	fn arm_defers_flush_check_past_unsafe_instrs() {
		let planner = Planner::new(Arch::Arm);
		let mut predicated = instr(vec![mem(0, 4)], vec![]);
		predicated.predicated = true;
		let mut exclusive = instr(vec![], vec![mem(0, 4)]);
		exclusive.exclusive_store = true;

		let plan = planner
			.plan_block(&[predicated, exclusive, instr(vec![mem(0, 4)], vec![])])
			.unwrap();
		assert_eq!(plan.entries(), 3);
		assert!(!plan.instrs[0].has_flush_check());
		assert!(!plan.instrs[1].has_flush_check());
		assert!(plan.instrs[2].has_flush_check());
	}

	#[test]
	fn x86_ignores_predication() {
		let planner = Planner::new(Arch::X86);
		let mut predicated = instr(vec![mem(0, 4)], vec![]);
		predicated.predicated = true;

		let plan = planner.plan_block(&[predicated]).unwrap();
		assert!(plan.instrs[0].has_flush_check());
	}

	#[test]
	fn instr_fetch_entry_comes_first() {
		let planner = Planner::new(Arch::X86).with_instr_fetch(true);
		let mut load = instr(vec![mem(0, 4)], vec![]);
		load.opcode = 0x8b;
		let plan = planner.plan_block(&[load]).unwrap();
		let plan = &plan.instrs[0];

		assert_eq!(plan.entries, 2);
		assert_eq!(stored_entries(plan), [(EntryKind::InstrFetch.to_u16(), 4), (0, 4)]);
		assert!(plan.ops.contains(&Op::StoreImm16 {
			base:    Reg(1),
			scratch: Reg(3),
			disp:    TraceEntry::OPCODE_OFFSET,
			value:   0x8b,
		}));
		assert!(plan.ops.contains(&Op::StoreImm64 {
			base:    Reg(1),
			scratch: Reg(3),
			disp:    TraceEntry::ADDR_OFFSET,
			value:   0x400000,
		}));
	}
}
