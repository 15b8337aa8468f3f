#![allow(clippy::missing_safety_doc)]
//! Boundary-tag heap allocator with segregated free lists and small-size quick lists.
//!
//! A [`Heap`] manages one growable region handed out by an [`Arena`]. Block headers and
//! footers are stored XOR-obfuscated with a per-process magic value, and every pointer passed
//! back to [`Heap::release`] or [`Heap::resize`] is validated against heap geometry before the
//! allocator trusts it.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, UnsafeCell},
  fmt, hint,
  marker::PhantomData,
  mem::{self, size_of},
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};
use std::sync::OnceLock;

use log::{debug, error};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Width of a header or footer word.
const WORD: usize = size_of::<u64>();

/// Alignment of every payload address.
pub const ALIGN: usize = 16;

/// Smallest block: header, two list links and a footer.
pub const MIN_BLOCK_SIZE: usize = 32;

/// Bytes added to the arena by one growth step.
pub const PAGE_SIZE: usize = 4096;

/// Number of exact-size quick lists (32, 48, ..., 176).
pub const NUM_QUICK_LISTS: usize = 10;

/// Blocks a single quick list may hold before it is flushed.
pub const QUICK_LIST_MAX: usize = 5;

/// Number of segregated main free lists.
pub const NUM_FREE_LISTS: usize = 10;

const THIS_BLOCK_ALLOCATED: u64 = 0x4;
const PREV_BLOCK_ALLOCATED: u64 = 0x2;
const FLAG_MASK: u64 = 0x7;

/// Largest block size served by a quick list.
const QUICK_MAX_SIZE: usize = MIN_BLOCK_SIZE + (NUM_QUICK_LISTS - 1) * ALIGN;

/// Size of the first block: one page minus the leading filler word and the trailing word that
/// becomes the next page's first header.
const INITIAL_BLOCK_SIZE: usize = PAGE_SIZE - 2 * WORD;

/// Default reservation for the process-wide heap, in pages (64MB).
const DEFAULT_MAX_PAGES: usize = 16 * 1024;

/// Environment variable overriding the process-wide reservation.
const MAX_PAGES_ENV: &[u8] = b"TAGHEAP_MAX_PAGES\0";

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGN.is_power_of_two());
const _: () = assert!(MIN_BLOCK_SIZE % ALIGN == 0);
const _: () = assert!(size_of::<Links>() + 2 * WORD <= MIN_BLOCK_SIZE);
const _: () = assert!(PAGE_SIZE % ALIGN == 0);
const _: () = assert!(INITIAL_BLOCK_SIZE >= MIN_BLOCK_SIZE);
const _: () = assert!(QUICK_MAX_SIZE == 176);
const _: () = assert!(matches!(quick_class(QUICK_MAX_SIZE), Some(9)));
const _: () = assert!(main_class(MIN_BLOCK_SIZE) == 0);
const _: () = assert!(main_class(64) == 1 && main_class(65) == 2);
const _: () = assert!(main_class(8192) == 8 && main_class(8193) == NUM_FREE_LISTS - 1);

// =============================================================================
// Errors
// =============================================================================

/// Validation check a caller-supplied pointer failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidPointer {
  #[error("null pointer")]
  Null,
  #[error("pointer is not 16-byte aligned")]
  Misaligned,
  #[error("header lies before the heap start")]
  BeforeHeap,
  #[error("block extends past the heap end")]
  PastHeap,
  #[error("header encodes an impossible block size {0}")]
  BadSize(usize),
  #[error("block is not allocated")]
  NotAllocated,
  #[error("previous-allocated flag disagrees with the previous block")]
  PrevAllocMismatch,
}

impl InvalidPointer {
  /// Fixed diagnostic for the abort path, which must not allocate.
  const fn banner(self) -> &'static str {
    match self {
      Self::Null => "tagheap: invalid pointer (null)\n",
      Self::Misaligned => "tagheap: invalid pointer (misaligned)\n",
      Self::BeforeHeap => "tagheap: invalid pointer (before heap start)\n",
      Self::PastHeap => "tagheap: invalid pointer (past heap end)\n",
      Self::BadSize(_) => "tagheap: invalid pointer (bad block size)\n",
      Self::NotAllocated => "tagheap: invalid pointer (not allocated)\n",
      Self::PrevAllocMismatch => "tagheap: invalid pointer (prev-alloc mismatch)\n",
    }
  }
}

/// Recoverable allocator errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  #[error("out of memory: arena cannot satisfy a {requested}-byte request")]
  OutOfMemory { requested: usize },
  #[error("invalid alignment {0}: must be a power of two and at least 32")]
  InvalidAlignment(usize),
  #[error("invalid pointer {ptr:#x}: {reason}")]
  InvalidPointer { ptr: usize, reason: InvalidPointer },
}

impl AllocError {
  /// C `errno` equivalent.
  pub fn errno(&self) -> i32 {
    match self {
      Self::OutOfMemory { .. } => libc::ENOMEM,
      Self::InvalidAlignment(_) | Self::InvalidPointer { .. } => libc::EINVAL,
    }
  }
}

/// Broken heap invariant found by [`Heap::verify`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
  #[error("block {0:#x} has invalid size {1}")]
  BadSize(usize, usize),
  #[error("block {0:#x} runs past the heap end")]
  Overrun(usize),
  #[error("block {0:#x} has a stale previous-allocated flag")]
  StalePrevAlloc(usize),
  #[error("free block {0:#x} has a footer that differs from its header")]
  FooterMismatch(usize),
  #[error("free blocks {0:#x} and {1:#x} are adjacent")]
  Uncoalesced(usize, usize),
  #[error("tracked last block {tracked:#x} is not the block at the heap end {actual:#x}")]
  StaleLast { tracked: usize, actual: usize },
  #[error("free list {class} holds misfiled block {block:#x}")]
  Misfiled { class: usize, block: usize },
  #[error("quick list {index} holds misfiled block {block:#x}")]
  MisfiledQuick { index: usize, block: usize },
  #[error("quick list {index} records {recorded} blocks but links {linked}")]
  QuickLength { index: usize, recorded: usize, linked: usize },
  #[error("{listed} blocks on free lists but {walked} free blocks in the heap")]
  LostBlock { listed: usize, walked: usize },
}

#[cold]
#[inline(never)]
fn abort_invalid(ptr: *mut u8, reason: InvalidPointer, logging: bool) -> ! {
  if logging {
    error!(
      "{}",
      AllocError::InvalidPointer {
        ptr: ptr.addr(),
        reason
      }
    );
  }
  let msg = reason.banner();
  unsafe {
    libc::write(2, msg.as_ptr().cast(), msg.len());
    libc::abort();
  }
}

// =============================================================================
// Block Codec
// =============================================================================

/// Header or footer word after removing the obfuscation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Tag(u64);

impl Tag {
  const fn new(size: usize, allocated: bool, prev_allocated: bool) -> Self {
    let mut word = size as u64 & !FLAG_MASK;
    if allocated {
      word |= THIS_BLOCK_ALLOCATED;
    }
    if prev_allocated {
      word |= PREV_BLOCK_ALLOCATED;
    }
    Self(word)
  }

  #[inline(always)]
  const fn size(self) -> usize {
    (self.0 & !FLAG_MASK) as usize
  }

  #[inline(always)]
  const fn is_allocated(self) -> bool {
    self.0 & THIS_BLOCK_ALLOCATED != 0
  }

  #[inline(always)]
  const fn prev_allocated(self) -> bool {
    self.0 & PREV_BLOCK_ALLOCATED != 0
  }

  const fn with_prev_allocated(self, prev_allocated: bool) -> Self {
    Self::new(self.size(), self.is_allocated(), prev_allocated)
  }

  #[inline(always)]
  const fn encode(self, magic: u64) -> u64 {
    self.0 ^ magic
  }

  #[inline(always)]
  const fn decode(raw: u64, magic: u64) -> Self {
    Self(raw ^ magic)
  }
}

/// A block named by its payload address. Header, footer and neighbors are computed from it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Block(*mut u8);

impl Block {
  #[inline(always)]
  fn addr(self) -> usize {
    self.0.addr()
  }

  #[inline(always)]
  fn header(self) -> *mut u64 {
    self.0.wrapping_sub(WORD).cast()
  }

  /// Footer of a block of `size` bytes: its last word.
  #[inline(always)]
  fn footer(self, size: usize) -> *mut u64 {
    self.0.wrapping_add(size - 2 * WORD).cast()
  }

  #[inline(always)]
  unsafe fn tag(self, magic: u64) -> Tag {
    Tag::decode(unsafe { self.header().read() }, magic)
  }

  #[inline(always)]
  unsafe fn set_header(self, tag: Tag, magic: u64) {
    unsafe { self.header().write(tag.encode(magic)) }
  }

  #[inline(always)]
  unsafe fn set_footer(self, tag: Tag, magic: u64) {
    unsafe { self.footer(tag.size()).write(tag.encode(magic)) }
  }

  /// Writes the boundary-tag pair of a free block.
  unsafe fn write_free(self, tag: Tag, magic: u64) {
    debug_assert!(!tag.is_allocated());
    unsafe {
      self.set_header(tag, magic);
      self.set_footer(tag, magic);
    }
  }

  #[inline(always)]
  fn next(self, size: usize) -> Block {
    Block(self.0.wrapping_add(size))
  }

  /// Previous block, located through its footer. Only meaningful when it is free.
  unsafe fn prev(self, magic: u64) -> Block {
    let footer = self.0.wrapping_sub(2 * WORD).cast::<u64>();
    let size = Tag::decode(unsafe { footer.read() }, magic).size();
    Block(self.0.wrapping_sub(size))
  }

  #[inline(always)]
  fn links(self) -> *mut Links {
    self.0.cast()
  }

  /// Storage of the single quick-list link.
  #[inline(always)]
  fn quick_next(self) -> *mut *mut u8 {
    self.0.cast()
  }
}

// =============================================================================
// Free List Nodes
// =============================================================================

/// Link word inside a free block: either a block payload or the sentinel of class `n`,
/// encoded as the address-less pointer `n`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Link(*mut u8);

impl Link {
  const fn head(class: usize) -> Self {
    Self(ptr::without_provenance_mut(class))
  }

  #[inline(always)]
  fn is_head(self) -> bool {
    self.0.addr() < NUM_FREE_LISTS
  }

  #[inline(always)]
  fn block(self) -> Block {
    debug_assert!(!self.is_head());
    Block(self.0)
  }
}

impl From<Block> for Link {
  fn from(block: Block) -> Self {
    Self(block.0)
  }
}

/// Body overlay of a main-listed free block, and the shape of every sentinel.
#[repr(C)]
#[derive(Clone, Copy)]
struct Links {
  next: Link,
  prev: Link,
}

impl Links {
  const fn sentinel(class: usize) -> Self {
    Self {
      next: Link::head(class),
      prev: Link::head(class),
    }
  }
}

const fn empty_heads() -> [Links; NUM_FREE_LISTS] {
  let mut heads = [Links::sentinel(0); NUM_FREE_LISTS];
  let mut class = 1;
  while class < NUM_FREE_LISTS {
    heads[class] = Links::sentinel(class);
    class += 1;
  }
  heads
}

#[derive(Clone, Copy)]
struct QuickSlot {
  len: usize,
  first: *mut u8,
}

impl QuickSlot {
  const EMPTY: Self = Self {
    len: 0,
    first: null_mut(),
  };
}

// =============================================================================
// Arena Providers
// =============================================================================

/// Supplies the raw region a [`Heap`] manages.
///
/// # Safety
/// `[start, end)` must stay readable and writable while the arena lives and must never move.
/// `start` must be 16-byte aligned. `grow` must extend the region in place by exactly
/// [`PAGE_SIZE`] bytes and return the previous end, or return `None` and leave the region
/// unchanged.
pub unsafe trait Arena {
  fn start(&self) -> *mut u8;
  fn end(&self) -> *mut u8;
  fn grow(&mut self) -> Option<NonNull<u8>>;
  /// Key XORed into every header and footer word.
  fn magic(&self) -> u64;
}

/// Per-process obfuscation key. Always 0 with the `weak-magic` feature.
pub fn process_magic() -> u64 {
  if cfg!(feature = "weak-magic") {
    return 0;
  }
  static MAGIC: OnceLock<u64> = OnceLock::new();
  *MAGIC.get_or_init(random_u64)
}

fn random_u64() -> u64 {
  let mut buf = [0u8; 8];

  #[cfg(target_os = "linux")]
  {
    let n = unsafe { libc::getrandom(buf.as_mut_ptr().cast(), buf.len(), 0) };
    if n == buf.len() as isize {
      return u64::from_ne_bytes(buf);
    }
  }

  // Stack address and clock, mixed with the splitmix64 finalizer.
  let mut ts: libc::timespec = unsafe { mem::zeroed() };
  unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
  let mut x = (buf.as_ptr().addr() as u64).wrapping_mul(0x517c_c1b7_2722_0a95)
    ^ (ts.tv_nsec as u64)
    ^ ((ts.tv_sec as u64) << 32);
  x ^= x >> 30;
  x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
  x ^= x >> 27;
  x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
  x ^ (x >> 31)
}

#[cfg(unix)]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(unix)]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Arena backed by one anonymous mapping of `max_pages` pages, reserved on the first growth
/// and handed out a page at a time.
#[cfg(unix)]
pub struct MmapArena {
  base: *mut u8,
  len: usize,
  max_pages: usize,
  magic: Option<u64>,
}

#[cfg(unix)]
unsafe impl Send for MmapArena {}

#[cfg(unix)]
impl MmapArena {
  pub const fn new(max_pages: usize) -> Self {
    Self {
      base: null_mut(),
      len: 0,
      max_pages,
      magic: None,
    }
  }

  /// Replaces the process magic, e.g. to make header contents predictable in tests.
  pub fn with_magic(mut self, magic: u64) -> Self {
    self.magic = Some(magic);
    self
  }

  pub fn max_pages(&self) -> usize {
    self.max_pages
  }
}

#[cfg(unix)]
unsafe impl Arena for MmapArena {
  fn start(&self) -> *mut u8 {
    self.base
  }

  fn end(&self) -> *mut u8 {
    self.base.wrapping_add(self.len)
  }

  fn grow(&mut self) -> Option<NonNull<u8>> {
    let reserved = self.max_pages.checked_mul(PAGE_SIZE)?;
    if self.len + PAGE_SIZE > reserved {
      return None;
    }
    if self.base.is_null() {
      let base = unsafe { os_mmap(reserved) };
      if base.is_null() {
        return None;
      }
      self.base = base;
    }
    let old_end = unsafe { self.base.add(self.len) };
    self.len += PAGE_SIZE;
    NonNull::new(old_end)
  }

  fn magic(&self) -> u64 {
    self.magic.unwrap_or_else(process_magic)
  }
}

#[cfg(unix)]
impl Drop for MmapArena {
  fn drop(&mut self) {
    if !self.base.is_null() {
      unsafe { os_munmap(self.base, self.max_pages * PAGE_SIZE) };
    }
  }
}

/// Arena carved out of a caller-provided buffer.
pub struct SliceArena<'a> {
  start: *mut u8,
  len: usize,
  capacity: usize,
  magic: Option<u64>,
  _buf: PhantomData<&'a mut [u8]>,
}

unsafe impl Send for SliceArena<'_> {}

impl<'a> SliceArena<'a> {
  /// Uses every whole page of `buf` after aligning its start to 16 bytes.
  pub fn new(buf: &'a mut [u8]) -> Self {
    let raw = buf.as_mut_ptr();
    let pad = align_up(raw.addr(), ALIGN) - raw.addr();
    let usable = buf.len().saturating_sub(pad);
    Self {
      start: raw.wrapping_add(pad),
      len: 0,
      capacity: usable - usable % PAGE_SIZE,
      magic: None,
      _buf: PhantomData,
    }
  }

  pub fn with_magic(mut self, magic: u64) -> Self {
    self.magic = Some(magic);
    self
  }

  pub fn capacity_pages(&self) -> usize {
    self.capacity / PAGE_SIZE
  }
}

unsafe impl Arena for SliceArena<'_> {
  fn start(&self) -> *mut u8 {
    self.start
  }

  fn end(&self) -> *mut u8 {
    self.start.wrapping_add(self.len)
  }

  fn grow(&mut self) -> Option<NonNull<u8>> {
    if self.len + PAGE_SIZE > self.capacity {
      return None;
    }
    let old_end = self.end();
    self.len += PAGE_SIZE;
    NonNull::new(old_end)
  }

  fn magic(&self) -> u64 {
    self.magic.unwrap_or_else(process_magic)
  }
}

// =============================================================================
// Heap
// =============================================================================

/// Emits a `log` record unless the heap has been muted.
macro_rules! heap_log {
  ($heap:expr, $level:ident, $($arg:tt)+) => {
    if $heap.logging {
      log::$level!($($arg)+);
    }
  };
}

/// Allocator state over one arena. Not synchronized: callers serialize access.
pub struct Heap<A: Arena> {
  arena: A,
  magic: u64,
  heads: [Links; NUM_FREE_LISTS],
  quick: [QuickSlot; NUM_QUICK_LISTS],
  /// Payload of the block that ends at the heap's last word.
  last: Block,
  ready: bool,
  logging: bool,
}

// Every pointer the heap holds points into memory owned by its arena.
unsafe impl<A: Arena + Send> Send for Heap<A> {}

impl<A: Arena> Heap<A> {
  pub const fn new(arena: A) -> Self {
    Self {
      arena,
      magic: 0,
      heads: empty_heads(),
      quick: [QuickSlot::EMPTY; NUM_QUICK_LISTS],
      last: Block(null_mut()),
      ready: false,
      logging: true,
    }
  }

  /// Turns the heap's own log records on or off. A heap that serves the global allocator
  /// must be muted, since formatting a record may allocate.
  pub fn set_logging(&mut self, enabled: bool) {
    self.logging = enabled;
  }

  pub fn arena(&self) -> &A {
    &self.arena
  }

  /// Pages obtained from the arena so far.
  pub fn pages(&self) -> usize {
    (self.arena.end().addr() - self.arena.start().addr()) / PAGE_SIZE
  }

  /// Allocates at least `size` bytes, 16-byte aligned. `Ok(None)` for a zero-size request.
  pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
    if size == 0 {
      return Ok(None);
    }
    let asize = block_size(size).ok_or(AllocError::OutOfMemory { requested: size })?;
    let block = self
      .allocate_block(asize)
      .ok_or(AllocError::OutOfMemory { requested: size })?;
    Ok(NonNull::new(block.0))
  }

  /// [`Heap::allocate`] followed by zeroing the requested bytes.
  pub fn allocate_zeroed(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
    let ptr = self.allocate(size)?;
    if let Some(p) = ptr {
      unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
    }
    Ok(ptr)
  }

  /// Allocates at least `size` bytes at a multiple of `align`, which must be a power of two
  /// no smaller than [`MIN_BLOCK_SIZE`].
  pub fn aligned_allocate(
    &mut self,
    size: usize,
    align: usize,
  ) -> Result<Option<NonNull<u8>>, AllocError> {
    if !align.is_power_of_two() || align < MIN_BLOCK_SIZE {
      return Err(AllocError::InvalidAlignment(align));
    }
    if size == 0 {
      return Ok(None);
    }
    let oom = AllocError::OutOfMemory { requested: size };
    let asize = block_size(size).ok_or(oom)?;
    // Room to slide the payload forward by up to `align + 16` bytes and still hold `size`.
    let padded = size
      .checked_add(align)
      .and_then(|s| s.checked_add(MIN_BLOCK_SIZE))
      .and_then(block_size)
      .ok_or(oom)?;
    let block = self.allocate_block(padded).ok_or(oom)?;

    let magic = self.magic;
    let mut aligned = block;
    if block.addr() % align != 0 {
      let mut target = align_up(block.addr(), align);
      if target - block.addr() < MIN_BLOCK_SIZE {
        target += align;
      }
      let lead = target - block.addr();
      let tag = unsafe { block.tag(magic) };
      aligned = block.next(lead);
      heap_log!(self, trace, "aligned {:p}: releasing {lead} leading bytes", aligned.0);
      unsafe {
        aligned.set_header(Tag::new(tag.size() - lead, true, false), magic);
        block.write_free(Tag::new(lead, false, tag.prev_allocated()), magic);
        let merged = self.coalesce(block);
        self.list_insert(merged);
      }
    }
    unsafe { self.place(aligned, asize) };
    debug_assert_eq!(aligned.addr() % align, 0);
    Ok(NonNull::new(aligned.0))
  }

  /// Returns a block to the heap. Aborts the process if `ptr` fails validation.
  ///
  /// # Safety
  /// `ptr` must not be used after this call.
  pub unsafe fn release(&mut self, ptr: *mut u8) {
    let block = self
      .validate(ptr)
      .unwrap_or_else(|reason| abort_invalid(ptr, reason, self.logging));
    unsafe { self.release_block(block) };
  }

  /// Resizes the block at `ptr`, moving it only when it has to grow. A zero `size` releases the
  /// block and yields `Ok(None)`. Aborts the process if `ptr` fails validation.
  ///
  /// # Safety
  /// On `Ok`, `ptr` must not be used again unless it is the returned address.
  pub unsafe fn resize(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, AllocError> {
    let block = self
      .validate(ptr)
      .unwrap_or_else(|reason| abort_invalid(ptr, reason, self.logging));
    if size == 0 {
      unsafe { self.release_block(block) };
      return Ok(None);
    }
    let oom = AllocError::OutOfMemory { requested: size };
    let asize = block_size(size).ok_or(oom)?;
    let current = unsafe { block.tag(self.magic) }.size();

    if asize <= current {
      if asize < current {
        unsafe { self.place(block, asize) };
      }
      return Ok(NonNull::new(ptr));
    }

    let fresh = self.allocate_block(asize).ok_or(oom)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr, fresh.0, (current - WORD).min(size));
      self.release_block(block);
    }
    Ok(NonNull::new(fresh.0))
  }

  /// Runs the release/resize validation without aborting.
  pub fn check(&self, ptr: *mut u8) -> Result<(), AllocError> {
    self
      .validate(ptr)
      .map(|_| ())
      .map_err(|reason| AllocError::InvalidPointer {
        ptr: ptr.addr(),
        reason,
      })
  }

  /// Payload bytes available at a live allocation.
  pub fn usable_size(&self, ptr: *mut u8) -> Result<usize, AllocError> {
    self.check(ptr)?;
    Ok(unsafe { Block(ptr).tag(self.magic) }.size() - WORD)
  }

  // ---------------------------------------------------------------------------
  // Allocation engine
  // ---------------------------------------------------------------------------

  fn init(&mut self) -> bool {
    self.heads = empty_heads();
    self.quick = [QuickSlot::EMPTY; NUM_QUICK_LISTS];
    self.magic = self.arena.magic();

    let Some(page) = self.arena.grow() else {
      heap_log!(self, debug, "arena refused the initial page");
      return false;
    };
    debug_assert_eq!(page.as_ptr().addr() % ALIGN, 0);

    // The first word is filler so that the first payload lands on a 16-byte boundary.
    let block = Block(page.as_ptr().wrapping_add(2 * WORD));
    unsafe {
      block.write_free(Tag::new(INITIAL_BLOCK_SIZE, false, true), self.magic);
      self.list_insert(block);
    }
    self.last = block;
    self.ready = true;
    heap_log!(self, debug, "heap initialized at {:p}", page.as_ptr());
    true
  }

  /// Adds one page, merged with a free last block when there is one.
  fn grow(&mut self) -> bool {
    let old_end = self.arena.end();
    let Some(page) = self.arena.grow() else {
      heap_log!(self, debug, "arena exhausted at {} pages", self.pages());
      return false;
    };
    debug_assert_eq!(page.as_ptr(), old_end);

    let magic = self.magic;
    let prev_allocated = unsafe { self.last.tag(magic) }.is_allocated();
    // The header fills the word that used to close the heap.
    let block = Block(page.as_ptr());
    unsafe {
      block.write_free(Tag::new(PAGE_SIZE, false, prev_allocated), magic);
      let merged = self.coalesce(block);
      self.list_insert(merged);
    }
    heap_log!(self, debug, "heap grew to {} pages", self.pages());
    true
  }

  fn allocate_block(&mut self, asize: usize) -> Option<Block> {
    if !self.ready && !self.init() {
      return None;
    }

    if let Some(index) = quick_class(asize)
      && let Some(block) = unsafe { self.quick_pop(index, asize) }
    {
      return Some(block);
    }

    loop {
      for class in main_class(asize)..NUM_FREE_LISTS {
        if let Some(block) = self.find_fit(class, asize) {
          unsafe {
            self.list_remove(block);
            self.place(block, asize);
          }
          return Some(block);
        }
      }
      if !self.grow() {
        return None;
      }
    }
  }

  /// Marks `block` allocated at `asize` bytes, splitting off the tail when it can stand as a
  /// block of its own.
  unsafe fn place(&mut self, block: Block, asize: usize) {
    let magic = self.magic;
    let tag = unsafe { block.tag(magic) };
    let size = tag.size();
    debug_assert!(size >= asize);

    let remainder = size - asize;
    if remainder < MIN_BLOCK_SIZE {
      unsafe {
        block.set_header(Tag::new(size, true, tag.prev_allocated()), magic);
        self.set_successor_prev_allocated(block, size, true);
      }
      self.note_last(block, size);
      return;
    }

    heap_log!(self, trace, "split {size}-byte block at {:p}: {asize} + {remainder}", block.0);
    let rest = block.next(asize);
    unsafe {
      block.set_header(Tag::new(asize, true, tag.prev_allocated()), magic);
      rest.write_free(Tag::new(remainder, false, true), magic);
      let merged = self.coalesce(rest);
      let merged_size = merged.tag(magic).size();
      self.set_successor_prev_allocated(merged, merged_size, false);
      self.list_insert(merged);
    }
  }

  unsafe fn release_block(&mut self, block: Block) {
    let size = unsafe { block.tag(self.magic) }.size();
    match quick_class(size) {
      Some(index) => unsafe { self.quick_push(index, block) },
      None => unsafe { self.free_to_main(block) },
    }
  }

  /// Frees an allocated-marked block into the main lists.
  unsafe fn free_to_main(&mut self, block: Block) {
    let magic = self.magic;
    let tag = unsafe { block.tag(magic) };
    unsafe {
      block.write_free(Tag::new(tag.size(), false, tag.prev_allocated()), magic);
      let merged = self.coalesce(block);
      let merged_size = merged.tag(magic).size();
      self.set_successor_prev_allocated(merged, merged_size, false);
      self.list_insert(merged);
    }
  }

  /// Rewrites the previous-allocated flag of the block after `block`, if it is inside the heap.
  unsafe fn set_successor_prev_allocated(&mut self, block: Block, size: usize, allocated: bool) {
    let next = block.next(size);
    if !self.in_heap(next) {
      return;
    }
    let magic = self.magic;
    let tag = unsafe { next.tag(magic) }.with_prev_allocated(allocated);
    unsafe {
      next.set_header(tag, magic);
      if !tag.is_allocated() {
        next.set_footer(tag, magic);
      }
    }
  }

  #[inline(always)]
  fn in_heap(&self, block: Block) -> bool {
    block.addr() < self.arena.end().addr()
  }

  #[inline(always)]
  fn note_last(&mut self, block: Block, size: usize) {
    if block.addr() + size == self.arena.end().addr() {
      self.last = block;
    }
  }

  // ---------------------------------------------------------------------------
  // Coalescer
  // ---------------------------------------------------------------------------

  /// Merges a free, unlisted block with its free neighbors and returns the merged block.
  /// The result is not on any list.
  unsafe fn coalesce(&mut self, block: Block) -> Block {
    let magic = self.magic;
    let tag = unsafe { block.tag(magic) };
    debug_assert!(!tag.is_allocated());

    let next = block.next(tag.size());
    let next_tag = self
      .in_heap(next)
      .then(|| unsafe { next.tag(magic) })
      .filter(|t| !t.is_allocated());

    let mut start = block;
    let mut size = tag.size();
    let mut prev_allocated = tag.prev_allocated();

    match (tag.prev_allocated(), next_tag) {
      (true, None) => {}
      (true, Some(next_tag)) => unsafe {
        self.list_remove(next);
        size += next_tag.size();
      },
      (false, next_tag) => unsafe {
        let prev = block.prev(magic);
        let prev_tag = prev.tag(magic);
        self.list_remove(prev);
        if let Some(next_tag) = next_tag {
          self.list_remove(next);
          size += next_tag.size();
        }
        size += prev_tag.size();
        prev_allocated = prev_tag.prev_allocated();
        start = prev;
      },
    }

    if start != block || size != tag.size() {
      unsafe { start.write_free(Tag::new(size, false, prev_allocated), magic) };
    }
    self.note_last(start, size);
    start
  }

  // ---------------------------------------------------------------------------
  // Main free lists
  // ---------------------------------------------------------------------------

  #[inline(always)]
  fn node(&self, link: Link) -> *const Links {
    if link.is_head() {
      &raw const self.heads[link.0.addr()]
    } else {
      link.0.cast_const().cast()
    }
  }

  #[inline(always)]
  fn node_mut(&mut self, link: Link) -> *mut Links {
    if link.is_head() {
      &raw mut self.heads[link.0.addr()]
    } else {
      link.0.cast()
    }
  }

  #[inline(always)]
  unsafe fn next_of(&self, link: Link) -> Link {
    unsafe { (*self.node(link)).next }
  }

  #[inline(always)]
  unsafe fn prev_of(&self, link: Link) -> Link {
    unsafe { (*self.node(link)).prev }
  }

  #[inline(always)]
  unsafe fn set_next(&mut self, link: Link, to: Link) {
    unsafe { (*self.node_mut(link)).next = to }
  }

  #[inline(always)]
  unsafe fn set_prev(&mut self, link: Link, to: Link) {
    unsafe { (*self.node_mut(link)).prev = to }
  }

  /// Pushes a free block on the head of its class list.
  unsafe fn list_insert(&mut self, block: Block) {
    let class = main_class(unsafe { block.tag(self.magic) }.size());
    let head = Link::head(class);
    let this = Link::from(block);
    unsafe {
      let first = self.next_of(head);
      block.links().write(Links {
        next: first,
        prev: head,
      });
      self.set_prev(first, this);
      self.set_next(head, this);
    }
  }

  unsafe fn list_remove(&mut self, block: Block) {
    let Links { next, prev } = unsafe { block.links().read() };
    unsafe {
      self.set_next(prev, next);
      self.set_prev(next, prev);
    }
  }

  /// First block in `class` with at least `size` bytes.
  fn find_fit(&self, class: usize, size: usize) -> Option<Block> {
    let head = Link::head(class);
    let mut cur = unsafe { self.next_of(head) };
    while cur != head {
      let block = cur.block();
      if unsafe { block.tag(self.magic) }.size() >= size {
        return Some(block);
      }
      cur = unsafe { self.next_of(cur) };
    }
    None
  }

  /// Blocks currently on main list `class`; 0 for a class past the last list.
  pub fn free_list_len(&self, class: usize) -> usize {
    if class >= NUM_FREE_LISTS {
      return 0;
    }
    let head = Link::head(class);
    let mut len = 0;
    let mut cur = unsafe { self.next_of(head) };
    while cur != head {
      len += 1;
      cur = unsafe { self.next_of(cur) };
    }
    len
  }

  // ---------------------------------------------------------------------------
  // Quick lists
  // ---------------------------------------------------------------------------

  unsafe fn quick_push(&mut self, index: usize, block: Block) {
    if self.quick[index].len == QUICK_LIST_MAX {
      unsafe { self.quick_flush(index) };
    }
    let slot = &mut self.quick[index];
    unsafe { block.quick_next().write(slot.first) };
    slot.first = block.0;
    slot.len += 1;
  }

  /// Unlinks the first block of at least `size` bytes.
  unsafe fn quick_pop(&mut self, index: usize, size: usize) -> Option<Block> {
    let magic = self.magic;
    let slot = &mut self.quick[index];
    let mut prev: Option<Block> = None;
    let mut cur = slot.first;
    while !cur.is_null() {
      let block = Block(cur);
      let next = unsafe { block.quick_next().read() };
      if unsafe { block.tag(magic) }.size() >= size {
        match prev {
          Some(prev) => unsafe { prev.quick_next().write(next) },
          None => slot.first = next,
        }
        slot.len -= 1;
        return Some(block);
      }
      prev = Some(block);
      cur = next;
    }
    None
  }

  /// Moves every block of slot `index` to the main lists.
  unsafe fn quick_flush(&mut self, index: usize) {
    let slot = mem::replace(&mut self.quick[index], QuickSlot::EMPTY);
    heap_log!(self, trace, "flushing quick list {index} ({} blocks)", slot.len);
    let mut cur = slot.first;
    while !cur.is_null() {
      let block = Block(cur);
      let next = unsafe { block.quick_next().read() };
      unsafe { self.free_to_main(block) };
      cur = next;
    }
  }

  fn quick_contains(&self, index: usize, block: Block) -> bool {
    let mut cur = self.quick[index].first;
    let mut seen = 0;
    while !cur.is_null() && seen < QUICK_LIST_MAX {
      if cur == block.0 {
        return true;
      }
      cur = unsafe { Block(cur).quick_next().read() };
      seen += 1;
    }
    false
  }

  /// Blocks currently on quick list `index`.
  pub fn quick_list_len(&self, index: usize) -> usize {
    self.quick.get(index).map_or(0, |slot| slot.len)
  }

  // ---------------------------------------------------------------------------
  // Validator
  // ---------------------------------------------------------------------------

  fn validate(&self, ptr: *mut u8) -> Result<Block, InvalidPointer> {
    if ptr.is_null() {
      return Err(InvalidPointer::Null);
    }
    if ptr.addr() % ALIGN != 0 {
      return Err(InvalidPointer::Misaligned);
    }

    let start = self.arena.start().addr();
    let end = self.arena.end().addr();
    // Bounds come before the header read so that no word outside the arena is touched.
    if ptr.addr() - WORD < start {
      return Err(InvalidPointer::BeforeHeap);
    }
    if ptr.addr() >= end {
      return Err(InvalidPointer::PastHeap);
    }

    let block = Block(ptr);
    let tag = unsafe { block.tag(self.magic) };
    let size = tag.size();
    if size < MIN_BLOCK_SIZE || size % ALIGN != 0 {
      return Err(InvalidPointer::BadSize(size));
    }
    if ptr.addr().checked_add(size).is_none_or(|block_end| block_end > end) {
      return Err(InvalidPointer::PastHeap);
    }
    if !tag.is_allocated() {
      return Err(InvalidPointer::NotAllocated);
    }
    if let Some(index) = quick_class(size)
      && self.quick_contains(index, block)
    {
      return Err(InvalidPointer::NotAllocated);
    }
    if !tag.prev_allocated() && !self.prev_is_free(block) {
      return Err(InvalidPointer::PrevAllocMismatch);
    }
    Ok(block)
  }

  /// Whether the footer word before `block` describes a real free predecessor.
  fn prev_is_free(&self, block: Block) -> bool {
    let first = self.arena.start().addr() + 2 * WORD;
    if block.addr() <= first {
      // The first block has no predecessor.
      return false;
    }
    let footer = Tag::decode(
      unsafe { block.0.wrapping_sub(2 * WORD).cast::<u64>().read() },
      self.magic,
    );
    let prev_size = footer.size();
    if prev_size < MIN_BLOCK_SIZE || prev_size % ALIGN != 0 {
      return false;
    }
    match block.addr().checked_sub(prev_size) {
      Some(prev_addr) if prev_addr >= first => {}
      _ => return false,
    }
    let prev = Block(block.0.wrapping_sub(prev_size));
    let prev_tag = unsafe { prev.tag(self.magic) };
    !prev_tag.is_allocated() && prev_tag == footer
  }

  // ---------------------------------------------------------------------------
  // Diagnostics
  // ---------------------------------------------------------------------------

  /// Every block in address order.
  pub fn blocks(&self) -> Blocks<'_, A> {
    Blocks {
      cursor: if self.ready {
        self.arena.start().wrapping_add(2 * WORD)
      } else {
        self.arena.end()
      },
      heap: self,
    }
  }

  /// Checks every structural invariant of the heap.
  pub fn verify(&self) -> Result<(), Corruption> {
    if !self.ready {
      return Ok(());
    }
    let magic = self.magic;
    let start = self.arena.start().addr();
    let end = self.arena.end().addr();

    let mut expect_prev_allocated = true;
    let mut prev_free: Option<usize> = None;
    let mut walked = 0;
    let mut last = None;
    for info in self.blocks() {
      let addr = info.payload.addr();
      if info.size < MIN_BLOCK_SIZE || info.size % ALIGN != 0 {
        return Err(Corruption::BadSize(addr, info.size));
      }
      if addr.checked_add(info.size).is_none_or(|block_end| block_end > end) {
        return Err(Corruption::Overrun(addr));
      }
      if info.prev_allocated != expect_prev_allocated {
        return Err(Corruption::StalePrevAlloc(addr));
      }
      if info.allocated {
        prev_free = None;
      } else {
        let block = Block(info.payload);
        let footer = Tag::decode(unsafe { block.footer(info.size).read() }, magic);
        if footer != unsafe { block.tag(magic) } {
          return Err(Corruption::FooterMismatch(addr));
        }
        if let Some(prev) = prev_free {
          return Err(Corruption::Uncoalesced(prev, addr));
        }
        prev_free = Some(addr);
        walked += 1;
      }
      expect_prev_allocated = info.allocated;
      last = Some(addr);
    }
    if let Some(actual) = last
      && actual != self.last.addr()
    {
      return Err(Corruption::StaleLast {
        tracked: self.last.addr(),
        actual,
      });
    }

    let mut listed = 0;
    for class in 0..NUM_FREE_LISTS {
      let head = Link::head(class);
      let mut prev = head;
      let mut cur = unsafe { self.next_of(head) };
      while cur != head {
        let addr = cur.0.addr();
        let misfiled = Corruption::Misfiled { class, block: addr };
        if addr % ALIGN != 0 || addr < start + 2 * WORD || addr >= end {
          return Err(misfiled);
        }
        let tag = unsafe { cur.block().tag(magic) };
        if tag.is_allocated() || main_class(tag.size()) != class {
          return Err(misfiled);
        }
        if unsafe { self.prev_of(cur) } != prev {
          return Err(misfiled);
        }
        listed += 1;
        if listed > walked {
          return Err(Corruption::LostBlock { listed, walked });
        }
        prev = cur;
        cur = unsafe { self.next_of(cur) };
      }
      if unsafe { self.prev_of(head) } != prev {
        return Err(Corruption::Misfiled {
          class,
          block: prev.0.addr(),
        });
      }
    }
    if listed != walked {
      return Err(Corruption::LostBlock { listed, walked });
    }

    for (index, slot) in self.quick.iter().enumerate() {
      let expected_size = MIN_BLOCK_SIZE + index * ALIGN;
      let mut linked = 0;
      let mut cur = slot.first;
      while !cur.is_null() {
        let addr = cur.addr();
        let misfiled = Corruption::MisfiledQuick { index, block: addr };
        if linked == QUICK_LIST_MAX || addr % ALIGN != 0 || addr < start + 2 * WORD || addr >= end
        {
          return Err(misfiled);
        }
        let tag = unsafe { Block(cur).tag(magic) };
        if !tag.is_allocated() || tag.size() != expected_size {
          return Err(misfiled);
        }
        linked += 1;
        cur = unsafe { Block(cur).quick_next().read() };
      }
      if linked != slot.len {
        return Err(Corruption::QuickLength {
          index,
          recorded: slot.len,
          linked,
        });
      }
    }
    Ok(())
  }

  /// Logs the heap layout, quick lists and free lists at debug level.
  pub fn dump(&self) {
    if !self.logging || !log::log_enabled!(log::Level::Debug) {
      return;
    }
    debug!(
      "heap [{:p}, {:p}) {} pages",
      self.arena.start(),
      self.arena.end(),
      self.pages()
    );
    for info in self.blocks() {
      debug!("  {info}");
    }
    for (index, slot) in self.quick.iter().enumerate() {
      if slot.len > 0 {
        debug!(
          "  quick[{index}]: {} x {} bytes",
          slot.len,
          MIN_BLOCK_SIZE + index * ALIGN
        );
      }
    }
    for class in 0..NUM_FREE_LISTS {
      let len = self.free_list_len(class);
      if len > 0 {
        debug!("  free[{class}]: {len} blocks");
      }
    }
  }
}

/// One block as seen by a heap walk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockInfo {
  pub payload: *mut u8,
  pub size: usize,
  pub allocated: bool,
  pub prev_allocated: bool,
}

impl fmt::Display for BlockInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{:p} {:>6} bytes {} (prev {})",
      self.payload,
      self.size,
      if self.allocated { "allocated" } else { "free" },
      if self.prev_allocated { "allocated" } else { "free" },
    )
  }
}

/// Iterator returned by [`Heap::blocks`].
pub struct Blocks<'h, A: Arena> {
  heap: &'h Heap<A>,
  cursor: *mut u8,
}

impl<A: Arena> Iterator for Blocks<'_, A> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let end = self.heap.arena.end();
    if self.cursor.addr() >= end.addr() {
      return None;
    }
    let block = Block(self.cursor);
    let tag = unsafe { block.tag(self.heap.magic) };
    // A zero size would never advance; stop the walk after reporting it.
    self.cursor = if tag.size() == 0 {
      end
    } else {
      block.next(tag.size()).0
    };
    Some(BlockInfo {
      payload: block.0,
      size: tag.size(),
      allocated: tag.is_allocated(),
      prev_allocated: tag.prev_allocated(),
    })
  }
}

// =============================================================================
// Process-wide heap
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

thread_local! {
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// A [`Heap`] over an [`MmapArena`] that can serve as the `#[global_allocator]`.
///
/// Calls are serialized with a spin lock. The reservation is read from `TAGHEAP_MAX_PAGES` on
/// first use.
///
/// ```rust,ignore
/// #[global_allocator]
/// static GLOBAL: tagheap::GlobalHeap = tagheap::GlobalHeap::new();
/// ```
#[cfg(unix)]
pub struct GlobalHeap {
  lock: SpinLock,
  heap: UnsafeCell<Option<Heap<MmapArena>>>,
}

#[cfg(unix)]
unsafe impl Sync for GlobalHeap {}

#[cfg(unix)]
impl GlobalHeap {
  pub const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      heap: UnsafeCell::new(None),
    }
  }

  /// Runs `f` with exclusive access to the heap. `None` on re-entry from the same thread or
  /// during thread-local teardown.
  pub fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<MmapArena>) -> R) -> Option<R> {
    IN_ALLOC
      .try_with(|flag| {
        if flag.get() {
          return None;
        }
        flag.set(true);
        self.lock.lock();

        let heap = unsafe { &mut *self.heap.get() }
          .get_or_insert_with(|| {
            let mut heap = Heap::new(MmapArena::new(max_pages_from_env()));
            heap.set_logging(false);
            heap
          });
        let result = f(heap);

        self.lock.unlock();
        flag.set(false);
        Some(result)
      })
      .ok()
      .flatten()
  }
}

#[cfg(unix)]
impl Default for GlobalHeap {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(unix)]
unsafe impl GlobalAlloc for GlobalHeap {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let size = layout.size().max(1);
    self
      .with_heap(|heap| {
        if layout.align() <= ALIGN {
          heap.allocate(size)
        } else {
          heap.aligned_allocate(size, layout.align().max(MIN_BLOCK_SIZE))
        }
      })
      .and_then(|result| result.ok().flatten())
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    // On re-entry or after thread-local teardown the block is leaked.
    self.with_heap(|heap| unsafe { heap.release(ptr) });
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGN {
      // `resize` only preserves the base 16-byte alignment.
      let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
      let new_ptr = unsafe { self.alloc(new_layout) };
      if !new_ptr.is_null() {
        unsafe {
          ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
          self.dealloc(ptr, layout);
        }
      }
      return new_ptr;
    }

    self
      .with_heap(|heap| unsafe { heap.resize(ptr, new_size.max(1)) })
      .and_then(|result| result.ok().flatten())
      .map_or(null_mut(), NonNull::as_ptr)
  }
}

// =============================================================================
// Configuration
// =============================================================================

/// Reservation for the process-wide heap: `TAGHEAP_MAX_PAGES`, else 16384 pages.
pub fn max_pages_from_env() -> usize {
  unsafe { getenv_usize(MAX_PAGES_ENV) }
    .filter(|&pages| pages > 0)
    .unwrap_or(DEFAULT_MAX_PAGES)
}

/// Parses a decimal environment variable without allocating.
///
/// # Safety
/// `key` must be NUL-terminated. Calls `libc::getenv`.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
  debug_assert_eq!(key.last(), Some(&0));
  let val = unsafe { libc::getenv(key.as_ptr().cast()) };
  if val.is_null() {
    return None;
  }

  let mut result: usize = 0;
  let mut cursor = val.cast::<u8>().cast_const();
  loop {
    let byte = unsafe { cursor.read() };
    if byte == 0 {
      break;
    }
    if !byte.is_ascii_digit() {
      return None;
    }
    result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
    cursor = unsafe { cursor.add(1) };
  }
  Some(result)
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(all(unix, feature = "c_api"))]
static C_HEAP: GlobalHeap = GlobalHeap::new();

#[cfg(all(unix, feature = "c_api"))]
fn set_errno(code: i32) {
  #[cfg(target_os = "linux")]
  unsafe {
    *libc::__errno_location() = code
  };
  #[cfg(target_os = "macos")]
  unsafe {
    *libc::__error() = code
  };
  #[cfg(not(any(target_os = "linux", target_os = "macos")))]
  let _ = code;
}

/// Converts a heap result to a C return value, setting `errno` on failure.
#[cfg(all(unix, feature = "c_api"))]
fn c_result(result: Option<Result<Option<NonNull<u8>>, AllocError>>) -> *mut u8 {
  match result {
    Some(Ok(ptr)) => ptr.map_or(null_mut(), NonNull::as_ptr),
    Some(Err(err)) => {
      set_errno(err.errno());
      null_mut()
    }
    None => {
      set_errno(libc::ENOMEM);
      null_mut()
    }
  }
}

#[cfg(all(unix, feature = "c_api"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  c_result(C_HEAP.with_heap(|heap| heap.allocate(size)))
}

#[cfg(all(unix, feature = "c_api"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  C_HEAP.with_heap(|heap| unsafe { heap.release(ptr) });
}

#[cfg(all(unix, feature = "c_api"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    set_errno(libc::ENOMEM);
    return null_mut();
  };
  c_result(C_HEAP.with_heap(|heap| heap.allocate_zeroed(total)))
}

#[cfg(all(unix, feature = "c_api"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return unsafe { malloc(size) };
  }
  c_result(C_HEAP.with_heap(|heap| unsafe { heap.resize(ptr, size) }))
}

/// Aligned allocation with C conventions: alignments up to 16 are already guaranteed.
#[cfg(all(unix, feature = "c_api"))]
fn c_aligned(size: usize, alignment: usize) -> Option<Result<Option<NonNull<u8>>, AllocError>> {
  if alignment.is_power_of_two() && alignment <= ALIGN {
    C_HEAP.with_heap(|heap| heap.allocate(size))
  } else {
    C_HEAP.with_heap(|heap| heap.aligned_allocate(size, alignment))
  }
}

#[cfg(all(unix, feature = "c_api"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
    return libc::EINVAL;
  }
  match c_aligned(size, alignment) {
    Some(Ok(ptr)) => {
      unsafe { *memptr = ptr.map_or(null_mut(), NonNull::as_ptr) };
      0
    }
    Some(Err(err)) => err.errno(),
    None => libc::ENOMEM,
  }
}

#[cfg(all(unix, feature = "c_api"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
  c_result(c_aligned(size, alignment))
}

#[cfg(all(unix, feature = "c_api"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
  c_result(c_aligned(size, alignment))
}

#[cfg(all(unix, feature = "c_api"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  C_HEAP
    .with_heap(|heap| heap.usable_size(ptr).unwrap_or(0))
    .unwrap_or(0)
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Size Classes
// =============================================================================

/// Block size for a payload request: header word added, rounded to 16, floored at 32.
/// `None` when the computation overflows.
#[inline(always)]
pub const fn block_size(size: usize) -> Option<usize> {
  let Some(padded) = size.checked_add(WORD + ALIGN - 1) else {
    return None;
  };
  let rounded = padded & !(ALIGN - 1);
  Some(if rounded < MIN_BLOCK_SIZE {
    MIN_BLOCK_SIZE
  } else {
    rounded
  })
}

/// Quick list for an exact block size, if it has one.
#[inline(always)]
pub const fn quick_class(size: usize) -> Option<usize> {
  if size < MIN_BLOCK_SIZE || size > QUICK_MAX_SIZE || size % ALIGN != 0 {
    return None;
  }
  Some((size - MIN_BLOCK_SIZE) / ALIGN)
}

/// Main free list for a block size: class 0 holds exactly 32 bytes, class `i` holds
/// `(16 << i, 16 << (i + 1)]`, the last class holds everything larger.
#[inline(always)]
pub const fn main_class(size: usize) -> usize {
  if size <= MIN_BLOCK_SIZE {
    return 0;
  }
  let ceil_log2 = (usize::BITS - (size - 1).leading_zeros()) as usize;
  let class = ceil_log2 - 5;
  if class < NUM_FREE_LISTS - 1 {
    class
  } else {
    NUM_FREE_LISTS - 1
  }
}

// =============================================================================
// Tests
// =============================================================================
