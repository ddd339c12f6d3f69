//! Reference host.
//!
//! Materializes instrumentation plans by interpreting them against a
//! simulated register file, the way a code-injecting host would execute the
//! code it inserted.

// Imports
use {
	crate::{
		buffer::PerThreadBuffer,
		channel::Channel,
		error::{ResourceError, TraceError},
		flush::FlushPolicy,
		planner::{InstrPlan, Op, Reg, SpillSlot},
		tracer::Tracer,
	},
	std::{collections::BTreeMap, fmt},
};

/// Simulated thread state
#[derive(Clone)]
pub struct Machine {
	/// Registers
	regs: [u64; Self::REG_COUNT],

	/// Spill slots
	spill_slots: [u64; SpillSlot::COUNT],
}

impl Machine {
	/// Number of registers
	pub const REG_COUNT: usize = 1 + u8::MAX as usize;

	/// Creates a machine with all registers zeroed
	#[must_use]
	pub const fn new() -> Self {
		Self {
			regs:        [0; Self::REG_COUNT],
			spill_slots: [0; SpillSlot::COUNT],
		}
	}

	/// Returns a register's value
	#[must_use]
	pub const fn reg(&self, reg: Reg) -> u64 {
		self.regs[reg.idx()]
	}

	/// Sets a register's value
	pub fn set_reg(&mut self, reg: Reg, value: u64) {
		self.regs[reg.idx()] = value;
	}

	/// Executes the operations of `plan` for the thread owning `buffer`.
	///
	/// # Errors
	/// Returns an error if a store lands outside of the buffer, or if a flush fails.
	pub fn execute<C: Channel>(
		&mut self,
		plan: &InstrPlan,
		buffer: &mut PerThreadBuffer,
		tracer: &Tracer<C>,
	) -> Result<(), TraceError> {
		for op in &plan.ops {
			self.execute_op(op, buffer, tracer)?;
		}

		Ok(())
	}

	fn execute_op<C: Channel>(
		&mut self,
		op: &Op,
		buffer: &mut PerThreadBuffer,
		tracer: &Tracer<C>,
	) -> Result<(), TraceError> {
		match *op {
			Op::SaveReg { reg, slot } => self.spill_slots[slot.idx()] = self.reg(reg),
			Op::RestoreReg { reg, slot } => self.set_reg(reg, self.spill_slots[slot.idx()]),
			Op::LoadBufPtr { dst } => self.set_reg(dst, buffer.buf_ptr() as u64),
			Op::StoreImm16 {
				base,
				scratch,
				disp,
				value,
			} => {
				let offset = self.offset(base, disp, buffer)?;
				self.set_reg(scratch, u64::from(value));
				buffer.store_u16(offset, value)?;
			},
			Op::StoreImm64 {
				base,
				scratch,
				disp,
				value,
			} => {
				let offset = self.offset(base, disp, buffer)?;
				self.set_reg(scratch, value);
				buffer.store_u64(offset, value)?;
			},
			Op::LoadEffectiveAddr { mem, dst, .. } => {
				let addr = mem.effective_addr(|reg| self.reg(reg));
				self.set_reg(dst, addr);
			},
			Op::StoreReg64 { base, disp, src } => {
				let offset = self.offset(base, disp, buffer)?;
				buffer.store_u64(offset, self.reg(src))?;
			},
			Op::AdvanceBufPtr { reg, adjust } => {
				let buf_ptr = self.offset(reg, adjust, buffer)?;
				self.set_reg(reg, buf_ptr as u64);
				buffer.set_buf_ptr(buf_ptr)?;
			},
			Op::FlushCheck => {
				let outcome = tracer.flush(buffer, FlushPolicy::Deferrable)?;
				tracing::trace!(tid = buffer.tid(), %outcome, "Flush check");
			},
		}

		Ok(())
	}

	/// Returns the buffer offset `base + disp`
	fn offset(&self, base: Reg, disp: usize, buffer: &PerThreadBuffer) -> Result<usize, ResourceError> {
		usize::try_from(self.reg(base))
			.ok()
			.and_then(|base| base.checked_add(disp))
			.ok_or(ResourceError::BufferOverflow {
				offset:   usize::MAX,
				capacity: buffer.capacity_bytes(),
			})
	}
}

impl Default for Machine {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for Machine {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// Note: Only show the registers in use
		let regs = self
			.regs
			.iter()
			.enumerate()
			.filter(|&(_, &value)| value != 0)
			.map(|(idx, &value)| (Reg(idx as u8), value))
			.collect::<BTreeMap<_, _>>();

		f.debug_struct("Machine")
			.field("regs", &regs)
			.field("spill_slots", &self.spill_slots)
			.finish()
	}
}
