//! Instruction descriptors.
//!
//! What the host tells us about an instruction of the observed program.

// Imports
use std::fmt;

/// Register
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Reg(pub u8);

impl Reg {
	/// Returns the index of this register
	#[must_use]
	pub const fn idx(self) -> usize {
		self.0 as usize
	}
}

impl fmt::Display for Reg {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "r{}", self.0)
	}
}

/// Operand
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
	/// Register
	Reg(Reg),

	/// Immediate
	Imm(i64),

	/// Memory reference
	Mem(MemOperand),
}

impl Operand {
	/// Returns this operand as a memory reference
	#[must_use]
	pub const fn as_mem(&self) -> Option<&MemOperand> {
		match self {
			Self::Mem(mem) => Some(mem),
			_ => None,
		}
	}
}

/// Memory operand.
///
/// Refers to `base + index * scale + disp`.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MemOperand {
	/// Base register
	#[serde(default)]
	pub base: Option<Reg>,

	/// Index register
	#[serde(default)]
	pub index: Option<Reg>,

	/// Index scale
	#[serde(default = "MemOperand::default_scale")]
	pub scale: u8,

	/// Displacement
	#[serde(default)]
	pub disp: i64,

	/// Access width, in bytes
	pub size: u16,
}

impl MemOperand {
	fn default_scale() -> u8 {
		1
	}

	/// Returns if this operand's address depends on `reg`
	#[must_use]
	pub fn uses_reg(&self, reg: Reg) -> bool {
		self.base == Some(reg) || self.index == Some(reg)
	}

	/// Computes the effective address, given the register values
	pub fn effective_addr(&self, mut reg_value: impl FnMut(Reg) -> u64) -> u64 {
		let base = self.base.map_or(0, &mut reg_value);
		let index = self.index.map_or(0, &mut reg_value);

		base.wrapping_add(index.wrapping_mul(u64::from(self.scale)))
			.wrapping_add_signed(self.disp)
	}
}

impl fmt::Display for MemOperand {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "[")?;
		let mut has_term = false;
		if let Some(base) = self.base {
			write!(f, "{base}")?;
			has_term = true;
		}
		if let Some(index) = self.index {
			if has_term {
				write!(f, " + ")?;
			}
			write!(f, "{index}*{}", self.scale)?;
			has_term = true;
		}
		match (has_term, self.disp) {
			(true, 0) => (),
			(true, disp) if disp < 0 => write!(f, " - {:#x}", disp.unsigned_abs())?,
			(true, disp) => write!(f, " + {disp:#x}")?,
			(false, disp) => write!(f, "{disp:#x}")?,
		}
		write!(f, "]:{}", self.size)
	}
}

/// Instruction
#[derive(Clone, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Instr {
	/// Program counter
	pub pc: u64,

	/// Opcode
	#[serde(default)]
	pub opcode: u16,

	/// Length, in bytes
	pub length: u16,

	/// Whether this instruction was introduced by rewriting, rather
	/// than being part of the observed program
	#[serde(default)]
	pub meta: bool,

	/// Source operands
	#[serde(default)]
	pub srcs: Vec<Operand>,

	/// Destination operands
	#[serde(default)]
	pub dsts: Vec<Operand>,

	/// Whether this instruction only executes conditionally
	#[serde(default)]
	pub predicated: bool,

	/// Whether this is the store of an exclusive load/store pair
	#[serde(default)]
	pub exclusive_store: bool,
}

impl Instr {
	/// Returns if this instruction belongs to the observed program
	#[must_use]
	pub fn is_app(&self) -> bool {
		!self.meta
	}

	/// Returns the memory source operands, in order
	pub fn mem_srcs(&self) -> impl Iterator<Item = &MemOperand> {
		self.srcs.iter().filter_map(Operand::as_mem)
	}

	/// Returns the memory destination operands, in order
	pub fn mem_dsts(&self) -> impl Iterator<Item = &MemOperand> {
		self.dsts.iter().filter_map(Operand::as_mem)
	}

	/// Returns if this instruction reads memory
	#[must_use]
	pub fn reads_memory(&self) -> bool {
		self.mem_srcs().next().is_some()
	}

	/// Returns if this instruction writes memory
	#[must_use]
	pub fn writes_memory(&self) -> bool {
		self.mem_dsts().next().is_some()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn effective_addr() {
		let mem = MemOperand {
			base:  Some(Reg(0)),
			index: Some(Reg(1)),
			scale: 4,
			disp:  -8,
			size:  4,
		};
		let addr = mem.effective_addr(|reg| match reg {
			Reg(0) => 0x1000,
			Reg(1) => 3,
			_ => unreachable!(),
		});
		assert_eq!(addr, 0x1000 + 12 - 8);
		assert_eq!(mem.to_string(), "[r0 + r1*4 - 0x8]:4");
	}

	#[test]
	fn absolute_addr() {
		let mem = MemOperand {
			base:  None,
			index: None,
			scale: 1,
			disp:  0x4000,
			size:  8,
		};
		assert_eq!(mem.effective_addr(|_| unreachable!()), 0x4000);
		assert!(!mem.uses_reg(Reg(0)));
	}

	#[test]
	fn deserializes_with_defaults() {
		let instr = serde_json::from_str::<Instr>(
			r#"{
				"pc": 4096,
				"length": 3,
				"srcs": [{ "mem": { "base": 2, "size": 4 } }],
				"dsts": [{ "reg": 0 }]
			}"#,
		)
		.unwrap();

		assert!(instr.is_app());
		assert!(instr.reads_memory());
		assert!(!instr.writes_memory());
		assert_eq!(instr.mem_srcs().next().map(|mem| mem.scale), Some(1));
	}
}
