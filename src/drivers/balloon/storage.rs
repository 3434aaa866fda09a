use alloc::vec::Vec;

use thiserror::Error;

use crate::config::{CHUNK_PAGES, ERROR_PAGES};
use crate::mm::{PageHandle, PageSize};

/// Bookkeeping memory for balloon pages could not be allocated.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Unable to allocate balloon page chunk")]
pub struct StorageError;

/// A fixed-capacity block of page handles.
#[derive(Debug)]
struct Chunk {
	entries: Vec<PageHandle>,
}

impl Chunk {
	fn try_new() -> Result<Self, StorageError> {
		let mut entries = Vec::new();
		entries
			.try_reserve_exact(CHUNK_PAGES)
			.map_err(|_| StorageError)?;
		Ok(Self { entries })
	}

	fn room(&self) -> usize {
		CHUNK_PAGES - self.entries.len()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkId(usize);

/// Slab of chunks addressed by [`ChunkId`].
#[derive(Debug, Default)]
struct ChunkArena {
	slots: Vec<Option<Chunk>>,
	vacant: Vec<ChunkId>,
}

impl ChunkArena {
	fn insert(&mut self, chunk: Chunk) -> Result<ChunkId, StorageError> {
		if let Some(id) = self.vacant.pop() {
			self.slots[id.0] = Some(chunk);
			return Ok(id);
		}

		self.slots.try_reserve(1).map_err(|_| StorageError)?;
		self.slots.push(Some(chunk));
		Ok(ChunkId(self.slots.len() - 1))
	}

	fn remove(&mut self, id: ChunkId) {
		self.slots[id.0] = None;
		if self.vacant.try_reserve(1).is_ok() {
			self.vacant.push(id);
		}
	}

	fn get(&self, id: ChunkId) -> Option<&Chunk> {
		self.slots.get(id.0)?.as_ref()
	}

	fn get_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
		self.slots.get_mut(id.0)?.as_mut()
	}
}

/// Chunks holding the pages of one size class, most recently used last.
#[derive(Debug, Default)]
struct ChunkList {
	chunks: Vec<ChunkId>,
	len: usize,
}

/// Pages the hypervisor refused during the current cycle.
///
/// They are kept reserved so the OS does not hand them out again before the
/// cycle ends.
#[derive(Debug, Default)]
pub struct ErrorPages {
	pages: heapless::Vec<PageHandle, ERROR_PAGES>,
	overflowed: bool,
}

impl ErrorPages {
	pub fn len(&self) -> usize {
		self.pages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pages.is_empty()
	}

	/// Whether a refused page had to be released immediately this cycle.
	pub fn overflowed(&self) -> bool {
		self.overflowed
	}
}

/// Ownership records of every page in the balloon.
///
/// Empty chunks are destroyed, except for one spare chunk retained so that
/// pages returned by a failed unlock always find room.
#[derive(Debug, Default)]
pub struct BalloonStorage {
	arena: ChunkArena,
	lists: [ChunkList; 2],
	spare: Option<ChunkId>,
	errors: [ErrorPages; 2],
}

impl BalloonStorage {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of pages of the given size held.
	pub fn len(&self, size: PageSize) -> usize {
		self.lists[size.index()].len
	}

	pub fn is_empty(&self) -> bool {
		PageSize::ALL.into_iter().all(|size| self.len(size) == 0)
	}

	pub fn num_chunks(&self, size: PageSize) -> usize {
		self.lists[size.index()].chunks.len()
	}

	pub fn has_spare(&self) -> bool {
		self.spare.is_some()
	}

	fn head(&self, size: PageSize) -> Option<ChunkId> {
		self.lists[size.index()].chunks.last().copied()
	}

	fn head_room(&self, size: PageSize) -> usize {
		self.head(size)
			.and_then(|id| self.arena.get(id))
			.map_or(0, Chunk::room)
	}

	/// Makes sure `additional` pages can be pushed without allocating.
	pub fn reserve(&mut self, size: PageSize, additional: usize) -> Result<(), StorageError> {
		debug_assert!(additional <= CHUNK_PAGES);

		let list = &mut self.lists[size.index()];
		list.chunks.try_reserve(1).map_err(|_| StorageError)?;

		if self.head_room(size) >= additional || self.spare.is_some() {
			return Ok(());
		}

		let id = self.arena.insert(Chunk::try_new()?)?;
		trace!("<balloon:storage> Allocated spare chunk {}", id.0);
		self.spare = Some(id);
		Ok(())
	}

	/// Records a page locked with the hypervisor.
	pub fn push(&mut self, size: PageSize, handle: PageHandle) -> Result<(), StorageError> {
		let id = match self.head(size) {
			Some(id) if self.head_room(size) > 0 => id,
			_ => self.link_chunk(size)?,
		};

		let chunk = self.arena.get_mut(id).ok_or(StorageError)?;
		chunk.entries.push(handle);
		self.lists[size.index()].len += 1;
		Ok(())
	}

	fn link_chunk(&mut self, size: PageSize) -> Result<ChunkId, StorageError> {
		let list = &mut self.lists[size.index()];
		list.chunks.try_reserve(1).map_err(|_| StorageError)?;

		let id = match self.spare.take() {
			Some(id) => id,
			None => self.arena.insert(Chunk::try_new()?)?,
		};

		self.lists[size.index()].chunks.push(id);
		Ok(id)
	}

	/// Takes the most recently stored page of the given size.
	pub fn pop(&mut self, size: PageSize) -> Option<PageHandle> {
		let id = self.head(size)?;
		let chunk = self.arena.get_mut(id)?;
		let handle = chunk.entries.pop()?;
		let emptied = chunk.entries.is_empty();

		let list = &mut self.lists[size.index()];
		list.len -= 1;

		if emptied {
			list.chunks.pop();
			if self.spare.is_none() {
				self.spare = Some(id);
			} else {
				trace!("<balloon:storage> Destroying empty chunk {}", id.0);
				self.arena.remove(id);
			}
		}

		Some(handle)
	}

	/// Destroys the spare chunk, if any.
	pub fn release_spare(&mut self) {
		if let Some(id) = self.spare.take() {
			self.arena.remove(id);
		}
	}

	/// Quarantines a refused page. Hands the page back if the quarantine of
	/// its size class is full.
	pub fn quarantine(&mut self, size: PageSize, handle: PageHandle) -> Result<(), PageHandle> {
		let errors = &mut self.errors[size.index()];
		errors.pages.push(handle).inspect_err(|_| {
			errors.overflowed = true;
		})
	}

	pub fn error_pages(&self, size: PageSize) -> &ErrorPages {
		&self.errors[size.index()]
	}

	/// Takes the next quarantined page of the given size. Once the quarantine
	/// is drained it accepts pages for a new cycle.
	pub fn pop_error_page(&mut self, size: PageSize) -> Option<PageHandle> {
		let errors = &mut self.errors[size.index()];
		let handle = errors.pages.pop();
		if handle.is_none() {
			errors.overflowed = false;
		}
		handle
	}
}
