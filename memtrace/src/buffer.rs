//! Per-thread trace buffer

// Imports
use {
	crate::{error::ResourceError, trace_entry::TraceEntry, tracer::Lifecycle},
	byteorder::{ByteOrder, LittleEndian},
	std::sync::Arc,
};

/// Per-thread trace buffer.
///
/// Holds `capacity` encoded [`TraceEntry`]s. The first [`Self::HEADER_SLOTS`]
/// slots are reserved for the thread header, which is only written when
/// flushing.
///
/// Owned by a single thread for its whole lifetime.
#[derive(Debug)]
pub struct PerThreadBuffer {
	/// Thread id
	tid: u64,

	/// Encoded entries
	bytes: Box<[u8]>,

	/// Write cursor, as a byte offset into `bytes`.
	///
	/// This is the thread-local "next free slot" pointer.
	buf_ptr: usize,

	/// Entries sent so far
	num_refs: u64,

	/// Whether the thread has sent its registration
	registered: bool,

	/// State
	state: BufferState,

	/// Lifecycle of the tracer that started this thread
	lifecycle: Option<Arc<Lifecycle>>,
}

impl PerThreadBuffer {
	/// Default number of entries per buffer.
	///
	/// Must be big enough to hold all entries between flush checks.
	pub const MAX_NUM_ENTRIES: usize = 4096;

	/// Number of slots reserved for headers
	pub const HEADER_SLOTS: usize = 1;

	/// Byte offset of the first user entry
	pub const HEADER_BYTES: usize = Self::HEADER_SLOTS * TraceEntry::BYTE_SIZE;

	/// Allocates a buffer for thread `tid` with room for `capacity` entries.
	///
	/// # Errors
	/// Returns an error if `capacity` can't hold a single entry past the
	/// headers, or if unable to allocate the backing store.
	pub fn new(tid: u64, capacity: usize) -> Result<Self, ResourceError> {
		if capacity <= Self::HEADER_SLOTS {
			return Err(ResourceError::BufferTooSmall { capacity });
		}

		let len = capacity
			.checked_mul(TraceEntry::BYTE_SIZE)
			.ok_or(ResourceError::Buffer { bytes: usize::MAX })?;
		let mut bytes = Vec::new();
		bytes
			.try_reserve_exact(len)
			.map_err(|_| ResourceError::Buffer { bytes: len })?;
		bytes.resize(len, 0);

		Ok(Self {
			tid,
			bytes: bytes.into_boxed_slice(),
			buf_ptr: Self::HEADER_BYTES,
			num_refs: 0,
			registered: false,
			state: BufferState::Uninitialized,
			lifecycle: None,
		})
	}

	/// Ties this buffer to a tracer's lifecycle, so dropping it without
	/// freeing it still ends its thread.
	pub(crate) fn attach(&mut self, lifecycle: Arc<Lifecycle>) {
		self.lifecycle = Some(lifecycle);
	}

	/// Returns the thread id
	pub fn tid(&self) -> u64 {
		self.tid
	}

	/// Returns the capacity, in entries
	pub fn capacity(&self) -> usize {
		self.bytes.len() / TraceEntry::BYTE_SIZE
	}

	/// Returns the capacity, in bytes
	pub fn capacity_bytes(&self) -> usize {
		self.bytes.len()
	}

	/// Returns the buffer pointer, as a byte offset
	pub fn buf_ptr(&self) -> usize {
		self.buf_ptr
	}

	/// Sets the buffer pointer.
	///
	/// # Errors
	/// Returns an error if `buf_ptr` is past the end or inside the header slots.
	pub fn set_buf_ptr(&mut self, buf_ptr: usize) -> Result<(), ResourceError> {
		if buf_ptr < Self::HEADER_BYTES || buf_ptr > self.bytes.len() {
			return Err(ResourceError::BufferOverflow {
				offset:   buf_ptr,
				capacity: self.bytes.len(),
			});
		}

		self.buf_ptr = buf_ptr;
		Ok(())
	}

	/// Returns the number of occupied slots, including the header slots
	pub fn occupied_entries(&self) -> usize {
		self.buf_ptr / TraceEntry::BYTE_SIZE
	}

	/// Returns the number of user entries currently buffered
	pub fn pending_entries(&self) -> usize {
		self.occupied_entries() - Self::HEADER_SLOTS
	}

	/// Returns the occupied bytes, from the header slot up to the buffer pointer
	pub fn occupied_bytes(&self) -> &[u8] {
		&self.bytes[..self.buf_ptr]
	}

	/// Stores a `u16` at byte `offset`
	pub fn store_u16(&mut self, offset: usize, value: u16) -> Result<(), ResourceError> {
		let bytes = self.slot_mut(offset, 2)?;
		LittleEndian::write_u16(bytes, value);
		Ok(())
	}

	/// Stores a `u64` at byte `offset`
	pub fn store_u64(&mut self, offset: usize, value: u64) -> Result<(), ResourceError> {
		let bytes = self.slot_mut(offset, 8)?;
		LittleEndian::write_u64(bytes, value);
		Ok(())
	}

	/// Appends an entry at the buffer pointer and advances it
	pub fn push(&mut self, entry: &TraceEntry) -> Result<(), ResourceError> {
		let offset = self.buf_ptr;
		entry.encode(self.slot_mut(offset, TraceEntry::BYTE_SIZE)?);
		self.buf_ptr += TraceEntry::BYTE_SIZE;
		Ok(())
	}

	/// Returns the user entries currently buffered.
	///
	/// Slots the host left half-written decode as errors.
	pub fn pending(&self) -> impl Iterator<Item = Result<TraceEntry, crate::error::DecodeError>> + '_ {
		self.bytes[Self::HEADER_BYTES..self.buf_ptr]
			.chunks_exact(TraceEntry::BYTE_SIZE)
			.map(TraceEntry::decode)
	}

	/// Writes the thread header into the reserved slot
	pub fn write_header(&mut self) {
		TraceEntry::thread(self.tid).encode(&mut self.bytes[..TraceEntry::BYTE_SIZE]);
	}

	/// Returns the header entry
	pub fn header(&self) -> TraceEntry {
		TraceEntry::thread(self.tid)
	}

	/// Resets the buffer pointer to just past the header slots
	pub fn reset(&mut self) {
		self.buf_ptr = Self::HEADER_BYTES;
	}

	/// Returns the number of entries sent so far
	pub fn num_refs(&self) -> u64 {
		self.num_refs
	}

	/// Adds to the number of entries sent
	pub fn add_refs(&mut self, count: u64) {
		self.num_refs += count;
	}

	/// Returns whether this thread has registered
	pub fn is_registered(&self) -> bool {
		self.registered
	}

	/// Marks this thread as registered.
	///
	/// # Panics
	/// Panics if the thread was already registered.
	pub fn mark_registered(&mut self) {
		assert!(!self.registered, "Thread {} registered twice", self.tid);
		self.registered = true;
	}

	/// Returns the state
	pub fn state(&self) -> BufferState {
		self.state
	}

	/// Moves to state `state`.
	///
	/// # Panics
	/// Panics if the transition isn't `Uninitialized -> Active -> Draining -> Freed`.
	pub fn transition(&mut self, state: BufferState) {
		assert!(
			self.state.next() == Some(state),
			"Invalid buffer transition for thread {}: {:?} -> {state:?}",
			self.tid,
			self.state
		);
		tracing::trace!(tid = self.tid, from = ?self.state, to = ?state, "Buffer transition");
		self.state = state;
	}

	/// Releases the backing store, returning the number of entries sent.
	///
	/// # Panics
	/// Panics if the buffer isn't draining.
	pub fn free(mut self) -> u64 {
		self.transition(BufferState::Freed);
		self.num_refs
	}

	/// Returns `len` bytes at `offset`, checking bounds
	fn slot_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], ResourceError> {
		let capacity = self.bytes.len();
		offset
			.checked_add(len)
			.and_then(|end| self.bytes.get_mut(offset..end))
			.ok_or(ResourceError::BufferOverflow { offset, capacity })
	}
}

impl Drop for PerThreadBuffer {
	fn drop(&mut self) {
		if self.state == BufferState::Freed {
			return;
		}

		if let Some(lifecycle) = &self.lifecycle {
			tracing::warn!(tid = self.tid, pending = self.pending_entries(), "Thread buffer dropped without exiting");
			lifecycle.thread_ended(self.tid, self.num_refs, true);
		}
	}
}

/// Buffer state
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum BufferState {
	/// Allocated, not yet published to its thread
	Uninitialized,

	/// In use by its thread
	Active,

	/// Its thread is exiting
	Draining,

	/// Released
	Freed,
}

impl BufferState {
	/// Returns the only state this one may move to
	#[must_use]
	pub const fn next(self) -> Option<Self> {
		match self {
			Self::Uninitialized => Some(Self::Active),
			Self::Active => Some(Self::Draining),
			Self::Draining => Some(Self::Freed),
			Self::Freed => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn starts_past_header() {
		let buffer = PerThreadBuffer::new(1, 16).unwrap();
		assert_eq!(buffer.buf_ptr(), TraceEntry::BYTE_SIZE);
		assert_eq!(buffer.occupied_entries(), 1);
		assert_eq!(buffer.pending_entries(), 0);
		assert_eq!(buffer.capacity(), 16);
		assert_eq!(buffer.state(), BufferState::Uninitialized);
	}

	#[test]
	fn rejects_capacity_without_room() {
		for capacity in [0, 1] {
			assert!(matches!(
				PerThreadBuffer::new(1, capacity),
				Err(ResourceError::BufferTooSmall { capacity: got }) if got == capacity
			));
		}
		assert_eq!(PerThreadBuffer::new(1, 2).unwrap().capacity(), 2);
	}

	#[test]
	fn push_and_reset() {
		let mut buffer = PerThreadBuffer::new(1, 4).unwrap();
		buffer.push(&TraceEntry::read(4, 0x1000)).unwrap();
		buffer.push(&TraceEntry::write(8, 0x2000)).unwrap();
		buffer.push(&TraceEntry::read(1, 0x3000)).unwrap();
		assert!(matches!(
			buffer.push(&TraceEntry::read(1, 0x4000)),
			Err(ResourceError::BufferOverflow { offset: 0x40, capacity: 0x40 })
		));

		let pending = buffer.pending().collect::<Result<Vec<_>, _>>().unwrap();
		assert_eq!(pending, [
			TraceEntry::read(4, 0x1000),
			TraceEntry::write(8, 0x2000),
			TraceEntry::read(1, 0x3000)
		]);

		buffer.reset();
		assert_eq!(buffer.pending_entries(), 0);
	}

	#[test]
	fn header_written_lazily() {
		let mut buffer = PerThreadBuffer::new(42, 4).unwrap();
		assert_eq!(&buffer.occupied_bytes()[..2], [0, 0]);

		buffer.write_header();
		assert_eq!(
			TraceEntry::decode(buffer.occupied_bytes()).unwrap(),
			TraceEntry::thread(42)
		);
	}

	#[test]
	fn rejects_pointer_outside_buffer() {
		let mut buffer = PerThreadBuffer::new(1, 4).unwrap();
		assert!(buffer.set_buf_ptr(0).is_err());
		assert!(buffer.set_buf_ptr(0x41).is_err());
		buffer.set_buf_ptr(0x40).unwrap();
		assert_eq!(buffer.pending_entries(), 3);
	}

	#[test]
	fn lifecycle_transitions() {
		let mut buffer = PerThreadBuffer::new(1, 4).unwrap();
		buffer.transition(BufferState::Active);
		buffer.transition(BufferState::Draining);
		buffer.add_refs(3);
		assert_eq!(buffer.free(), 3);
	}

	#[test]
	#[should_panic = "Invalid buffer transition"]
	fn no_return_to_active() {
		let mut buffer = PerThreadBuffer::new(1, 4).unwrap();
		buffer.transition(BufferState::Active);
		buffer.transition(BufferState::Draining);
		buffer.transition(BufferState::Active);
	}
}
