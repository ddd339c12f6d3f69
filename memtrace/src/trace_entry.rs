//! Trace entries.
//!
//! A trace entry is the fixed-layout record used both in the per-thread
//! buffers and on the wire:
//!
//! | Offset | Size | Field                  |
//! |--------|------|------------------------|
//! | `0x0`  | 2    | Type                   |
//! | `0x2`  | 2    | Size                   |
//! | `0x4`  | 2    | Opcode (fetches only)  |
//! | `0x6`  | 2    | Padding (zero)         |
//! | `0x8`  | 8    | Address / identifier   |
//!
//! All fields are little-endian.

// Imports
use {
	crate::error::DecodeError,
	byteorder::{ByteOrder, LittleEndian},
	memtrace_util::ReadByteArray,
	std::{fmt, io},
};

/// Trace entry
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TraceEntry {
	/// Kind
	pub kind: EntryKind,

	/// Access width in bytes, or identifier width for headers
	pub size: u16,

	/// Opcode of the fetched instruction, zero for every other kind
	#[serde(default)]
	pub opcode: u16,

	/// Address, or identifier for headers
	pub addr: u64,
}

impl TraceEntry {
	/// Size of an entry (including padding)
	pub const BYTE_SIZE: usize = 0x10;

	/// Offset of the type field
	pub const KIND_OFFSET: usize = 0x0;

	/// Offset of the size field
	pub const SIZE_OFFSET: usize = 0x2;

	/// Offset of the opcode field
	pub const OPCODE_OFFSET: usize = 0x4;

	/// Offset of the address field
	pub const ADDR_OFFSET: usize = 0x8;

	/// Width of a thread identifier
	pub const THREAD_ID_SIZE: u16 = std::mem::size_of::<u64>() as u16;

	/// Width of a process identifier
	pub const PROCESS_ID_SIZE: u16 = std::mem::size_of::<u32>() as u16;

	/// Creates a thread header entry
	#[must_use]
	pub const fn thread(tid: u64) -> Self {
		Self {
			kind: EntryKind::Thread,
			size: Self::THREAD_ID_SIZE,
			opcode: 0,
			addr: tid,
		}
	}

	/// Creates a process entry
	#[must_use]
	pub const fn pid(pid: u32) -> Self {
		Self {
			kind: EntryKind::Pid,
			size: Self::PROCESS_ID_SIZE,
			opcode: 0,
			addr: pid as u64,
		}
	}

	/// Creates a read entry
	#[must_use]
	pub const fn read(size: u16, addr: u64) -> Self {
		Self {
			kind: EntryKind::Read,
			size,
			opcode: 0,
			addr,
		}
	}

	/// Creates a write entry
	#[must_use]
	pub const fn write(size: u16, addr: u64) -> Self {
		Self {
			kind: EntryKind::Write,
			size,
			opcode: 0,
			addr,
		}
	}

	/// Creates an instruction fetch entry
	#[must_use]
	pub const fn instr_fetch(opcode: u16, length: u16, pc: u64) -> Self {
		Self {
			kind: EntryKind::InstrFetch,
			size: length,
			opcode,
			addr: pc,
		}
	}

	/// Encodes this entry into `bytes`.
	///
	/// # Panics
	/// Panics if `bytes` is shorter than [`Self::BYTE_SIZE`].
	pub fn encode(&self, bytes: &mut [u8]) {
		let bytes = &mut bytes[..Self::BYTE_SIZE];
		LittleEndian::write_u16(&mut bytes[Self::KIND_OFFSET..], self.kind.to_u16());
		LittleEndian::write_u16(&mut bytes[Self::SIZE_OFFSET..], self.size);
		LittleEndian::write_u16(&mut bytes[Self::OPCODE_OFFSET..], self.opcode);
		bytes[Self::OPCODE_OFFSET + 2..Self::ADDR_OFFSET].fill(0);
		LittleEndian::write_u64(&mut bytes[Self::ADDR_OFFSET..], self.addr);
	}

	/// Returns this entry encoded
	#[must_use]
	pub fn to_bytes(&self) -> [u8; Self::BYTE_SIZE] {
		let mut bytes = [0; Self::BYTE_SIZE];
		self.encode(&mut bytes);
		bytes
	}

	/// Decodes an entry from `bytes`.
	///
	/// # Panics
	/// Panics if `bytes` is shorter than [`Self::BYTE_SIZE`].
	pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
		let bytes = &bytes[..Self::BYTE_SIZE];
		let kind = LittleEndian::read_u16(&bytes[Self::KIND_OFFSET..]);
		let kind = EntryKind::from_u16(kind).ok_or(DecodeError::UnknownKind { kind })?;

		// Note: Instrumented code only stores the opcode for fetches, so for
		//       every other kind these bytes may hold a previous entry's.
		let opcode = match kind {
			EntryKind::InstrFetch => LittleEndian::read_u16(&bytes[Self::OPCODE_OFFSET..]),
			_ => 0,
		};

		Ok(Self {
			kind,
			size: LittleEndian::read_u16(&bytes[Self::SIZE_OFFSET..]),
			opcode,
			addr: LittleEndian::read_u64(&bytes[Self::ADDR_OFFSET..]),
		})
	}
}

impl fmt::Display for TraceEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.kind {
			EntryKind::Thread => write!(f, "thread({})", self.addr),
			EntryKind::Pid => write!(f, "pid({})", self.addr),
			EntryKind::InstrFetch => write!(f, "ifetch({}, {}, {:#x})", self.opcode, self.size, self.addr),
			kind => write!(f, "{kind}({}, {:#x})", self.size, self.addr),
		}
	}
}

/// Entry kind
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
	/// Memory read
	Read,

	/// Memory write
	Write,

	/// Instruction fetch.
	///
	/// `size` holds the instruction length, `opcode` its opcode and `addr` its pc.
	InstrFetch,

	/// Thread header, `addr` holds the thread id
	Thread,

	/// Process, `addr` holds the process id
	Pid,
}

impl EntryKind {
	/// Returns the wire value of this kind
	#[must_use]
	pub const fn to_u16(self) -> u16 {
		match self {
			Self::Read => 0,
			Self::Write => 1,
			Self::InstrFetch => 2,
			Self::Thread => 3,
			Self::Pid => 4,
		}
	}

	/// Parses a kind from its wire value
	#[must_use]
	pub const fn from_u16(kind: u16) -> Option<Self> {
		match kind {
			0 => Some(Self::Read),
			1 => Some(Self::Write),
			2 => Some(Self::InstrFetch),
			3 => Some(Self::Thread),
			4 => Some(Self::Pid),
			_ => None,
		}
	}

	/// Returns if this kind is a memory access
	#[must_use]
	pub const fn is_access(self) -> bool {
		matches!(self, Self::Read | Self::Write)
	}
}

impl fmt::Display for EntryKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Read => "read",
			Self::Write => "write",
			Self::InstrFetch => "ifetch",
			Self::Thread => "thread",
			Self::Pid => "pid",
		};
		f.write_str(name)
	}
}

/// Trace entry reader.
///
/// Reads a stream of consecutive entries, as sent over the channel.
#[derive(Clone, Debug)]
pub struct TraceReader<R> {
	/// Entries read so far
	entries_read: u64,

	/// Reader
	reader: R,
}

impl<R: io::Read> TraceReader<R> {
	/// Creates a new reader
	pub fn new(reader: R) -> Self {
		Self {
			entries_read: 0,
			reader,
		}
	}

	/// Reads the next entry.
	///
	/// Returns `Ok(None)` once the stream ends on an entry boundary.
	pub fn read_next(&mut self) -> Result<Option<TraceEntry>, DecodeError> {
		let Some(bytes) = self
			.reader
			.read_byte_array_or_eof::<{ TraceEntry::BYTE_SIZE }>()
			.map_err(DecodeError::Truncated)?
		else {
			return Ok(None);
		};

		let entry = TraceEntry::decode(&bytes)?;
		self.entries_read += 1;
		Ok(Some(entry))
	}

	/// Returns the number of entries read so far
	pub fn entries_read(&self) -> u64 {
		self.entries_read
	}
}

impl<R: io::Read> Iterator for TraceReader<R> {
	type Item = Result<TraceEntry, DecodeError>;

	fn next(&mut self) -> Option<Self::Item> {
		self.read_next().transpose()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn layout() {
		let bytes = TraceEntry::write(8, 0x1122_3344_5566_7788).to_bytes();
		assert_eq!(bytes, [
			1, 0, 8, 0, 0, 0, 0, 0, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11
		]);
	}

	#[test]
	fn instr_fetch_carries_opcode() {
		let entry = TraceEntry::instr_fetch(0x1234, 5, 0x40_1000);
		let bytes = entry.to_bytes();
		assert_eq!(&bytes[..8], [2, 0, 5, 0, 0x34, 0x12, 0, 0]);
		assert_eq!(TraceEntry::decode(&bytes).unwrap(), entry);
		assert_eq!(entry.to_string(), "ifetch(4660, 5, 0x401000)");
	}

	#[test]
	fn stale_opcode_ignored_for_accesses() {
		let mut bytes = TraceEntry::read(4, 0x10).to_bytes();
		bytes[TraceEntry::OPCODE_OFFSET] = 0x8b;
		assert_eq!(TraceEntry::decode(&bytes).unwrap(), TraceEntry::read(4, 0x10));
	}

	#[test]
	fn header_widths() {
		assert_eq!(TraceEntry::thread(7).size, 8);
		assert_eq!(TraceEntry::pid(7).size, 4);
		assert_eq!(TraceEntry::pid(7).addr, 7);
	}

	#[test]
	fn decode_rejects_unknown_kind() {
		let mut bytes = TraceEntry::read(4, 0x10).to_bytes();
		bytes[0] = 0x7f;
		assert!(matches!(
			TraceEntry::decode(&bytes),
			Err(DecodeError::UnknownKind { kind: 0x7f })
		));
	}

	#[test]
	fn reader_stops_at_boundary() {
		let entries = [TraceEntry::thread(3), TraceEntry::read(4, 0xa0), TraceEntry::write(2, 0xb0)];
		let bytes = entries.iter().flat_map(TraceEntry::to_bytes).collect::<Vec<_>>();

		let mut reader = TraceReader::new(bytes.as_slice());
		let read = reader.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
		assert_eq!(read, entries);
		assert_eq!(reader.entries_read(), 3);
	}

	#[test]
	fn reader_reports_truncation() {
		let bytes = TraceEntry::read(4, 0xa0).to_bytes();
		let mut reader = TraceReader::new(&bytes[..10]);
		assert!(matches!(reader.read_next(), Err(DecodeError::Truncated(_))));
	}
}
