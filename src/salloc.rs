//! Separate page-backed allocator for engine metadata.
//!
//! Every region, subregion, host array, link and tree node is carved out of
//! blocks obtained directly from the OS, never from the process allocator.
//! The fault pipeline runs while arbitrary application threads may be frozen
//! inside malloc, so the engine must not depend on the process allocator for
//! anything it touches after initialization.

use crate::{os, page, Error, Result};
use std::mem;
use std::ptr::{self, NonNull};

/// Pages per block requested from the OS.
const BLOCK_PAGES: usize = 16;

/// Alignment guaranteed for every allocation.
const ALIGN: usize = 16;

/// Value stored in a live chunk's `next` field; free detects a pointer that
/// was never handed out (or was freed twice) by its absence.
const LIVE_SENTINEL: usize = 0x5a11_0c5e;

/// Fully free blocks retained before whole blocks are returned to the OS.
const RETAINED_FREE_BLOCKS: usize = 1;

#[repr(C)]
struct Chunk {
  /// Total chunk size in bytes, header included.
  size: usize,
  /// Next free chunk of the block (address ordered) while free; the live
  /// sentinel while allocated.
  next: *mut Chunk,
}

#[repr(C)]
struct Block {
  /// First chunk-usable address of the block.
  base: *mut u8,
  /// Usable bytes (block size minus this header).
  usable: usize,
  /// Address-ordered free chunk list.
  free: *mut Chunk,
  /// Total bytes on the free list.
  free_bytes: usize,
  /// Next block, address ordered.
  next: *mut Block,
}

const CHUNK_HEADER: usize = mem::size_of::<Chunk>();
const BLOCK_HEADER: usize = (mem::size_of::<Block>() + ALIGN - 1) & !(ALIGN - 1);

/// The separate allocator.
///
/// Not internally synchronized: callers serialize access (the engine keeps it
/// behind a mutex and only uses it from writer sections and startup paths).
pub struct Salloc {
  blocks: *mut Block,
  block_size: usize,
  max_alloc: usize,
}

unsafe impl Send for Salloc {}

impl Salloc {
  pub fn new() -> Self {
    let block_size = BLOCK_PAGES * page::size();
    Salloc {
      blocks: ptr::null_mut(),
      block_size,
      // one page minus the chunk header
      max_alloc: page::size() - CHUNK_HEADER,
    }
  }

  /// Allocates `nbytes` of 16-byte-aligned memory.
  pub fn alloc(&mut self, nbytes: usize) -> Result<NonNull<u8>> {
    if nbytes == 0 || nbytes > self.max_alloc {
      return Err(Error::AllocFailed);
    }
    let needed = (nbytes + CHUNK_HEADER + ALIGN - 1) & !(ALIGN - 1);

    unsafe {
      if let Some(chunk) = self.take_chunk(needed) {
        return Ok(self.mark_live(chunk));
      }

      self.grow()?;
      match self.take_chunk(needed) {
        Some(chunk) => Ok(self.mark_live(chunk)),
        None => Err(Error::AllocFailed),
      }
    }
  }

  /// Returns memory obtained from [Salloc::alloc].
  ///
  /// Freeing a pointer this allocator never handed out is detected through
  /// the header sentinel and ignored (with a log record), matching the
  /// engine's no-abort policy for bookkeeping bugs.
  pub fn free(&mut self, ptr: NonNull<u8>) {
    unsafe {
      let chunk = ptr.as_ptr().sub(CHUNK_HEADER) as *mut Chunk;
      if (*chunk).next as usize != LIVE_SENTINEL {
        log::error!("salloc: free of an invalid pointer {:p}", ptr);
        return;
      }

      let block = match self.owning_block(chunk) {
        Some(block) => block,
        None => {
          log::error!("salloc: freed pointer {:p} belongs to no block", ptr);
          return;
        }
      };

      Self::insert_free(block, chunk);
      self.release_spare_blocks();
    }
  }

  /// Allocates storage for a value and moves it in.
  pub fn alloc_value<T>(&mut self, value: T) -> Result<NonNull<T>> {
    debug_assert!(mem::align_of::<T>() <= ALIGN);
    let raw = self.alloc(mem::size_of::<T>())?.cast::<T>();
    unsafe { ptr::write(raw.as_ptr(), value) };
    Ok(raw)
  }

  /// Drops a value in place and returns its storage.
  pub unsafe fn free_value<T>(&mut self, value: NonNull<T>) {
    ptr::drop_in_place(value.as_ptr());
    self.free(value.cast());
  }

  /// First-fit search over all blocks; splits oversized chunks.
  unsafe fn take_chunk(&mut self, needed: usize) -> Option<*mut Chunk> {
    let mut block = self.blocks;
    while !block.is_null() {
      let mut cursor = &mut (*block).free as *mut *mut Chunk;
      while !(*cursor).is_null() {
        let chunk = *cursor;
        if (*chunk).size >= needed {
          if (*chunk).size - needed >= CHUNK_HEADER + ALIGN {
            // split off the tail as a new free chunk
            let rest = (chunk as *mut u8).add(needed) as *mut Chunk;
            (*rest).size = (*chunk).size - needed;
            (*rest).next = (*chunk).next;
            (*chunk).size = needed;
            *cursor = rest;
          } else {
            *cursor = (*chunk).next;
          }
          (*block).free_bytes -= (*chunk).size;
          return Some(chunk);
        }
        cursor = &mut (*chunk).next as *mut *mut Chunk;
      }
      block = (*block).next;
    }
    None
  }

  unsafe fn mark_live(&self, chunk: *mut Chunk) -> NonNull<u8> {
    (*chunk).next = LIVE_SENTINEL as *mut Chunk;
    NonNull::new_unchecked((chunk as *mut u8).add(CHUNK_HEADER))
  }

  /// Maps one more block and links it into the address-ordered block list.
  unsafe fn grow(&mut self) -> Result<()> {
    let base = os::alloc_pages(self.block_size)?;
    let block = base as *mut Block;
    let first = base.add(BLOCK_HEADER) as *mut Chunk;

    (*first).size = self.block_size - BLOCK_HEADER;
    (*first).next = ptr::null_mut();
    (*block).base = base.add(BLOCK_HEADER);
    (*block).usable = self.block_size - BLOCK_HEADER;
    (*block).free = first;
    (*block).free_bytes = (*first).size;

    let mut cursor = &mut self.blocks as *mut *mut Block;
    while !(*cursor).is_null() && (*cursor as usize) < block as usize {
      cursor = &mut (**cursor).next as *mut *mut Block;
    }
    (*block).next = *cursor;
    *cursor = block;
    Ok(())
  }

  unsafe fn owning_block(&self, chunk: *mut Chunk) -> Option<*mut Block> {
    let address = chunk as usize;
    let mut block = self.blocks;
    while !block.is_null() {
      let start = (*block).base as usize;
      if address >= start && address < start + (*block).usable {
        return Some(block);
      }
      block = (*block).next;
    }
    None
  }

  /// Inserts a chunk into its block's address-ordered free list, coalescing
  /// with both neighbours where they touch.
  unsafe fn insert_free(block: *mut Block, chunk: *mut Chunk) {
    (*block).free_bytes += (*chunk).size;

    let mut cursor = &mut (*block).free as *mut *mut Chunk;
    while !(*cursor).is_null() && (*cursor as usize) < chunk as usize {
      cursor = &mut (**cursor).next as *mut *mut Chunk;
    }

    (*chunk).next = *cursor;
    *cursor = chunk;

    // forward merge
    let succ = (*chunk).next;
    if !succ.is_null() && (chunk as *mut u8).add((*chunk).size) as *mut Chunk == succ {
      (*chunk).size += (*succ).size;
      (*chunk).next = (*succ).next;
    }

    // backward merge: find the predecessor again from the head
    let mut prev = (*block).free;
    if prev != chunk {
      while (*prev).next != chunk {
        prev = (*prev).next;
      }
      if (prev as *mut u8).add((*prev).size) as *mut Chunk == chunk {
        (*prev).size += (*chunk).size;
        (*prev).next = (*chunk).next;
      }
    }
  }

  /// Returns fully free blocks to the OS past the retention threshold.
  unsafe fn release_spare_blocks(&mut self) {
    let mut spare = 0usize;
    let mut cursor = &mut self.blocks as *mut *mut Block;
    while !(*cursor).is_null() {
      let block = *cursor;
      if (*block).free_bytes == (*block).usable {
        spare += 1;
        if spare > RETAINED_FREE_BLOCKS {
          *cursor = (*block).next;
          let _ = os::free_pages(block as *mut u8, self.block_size);
          continue;
        }
      }
      cursor = &mut (*block).next as *mut *mut Block;
    }
  }
}

impl Drop for Salloc {
  fn drop(&mut self) {
    unsafe {
      let mut block = self.blocks;
      while !block.is_null() {
        let next = (*block).next;
        let _ = os::free_pages(block as *mut u8, self.block_size);
        block = next;
      }
    }
  }
}
