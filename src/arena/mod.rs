//! Tagged bump allocator (§4.1).
//!
//! Pages of a fixed size are drawn from a global free list keyed only by size (all pages in a
//! pool are the same size, so the free list is a plain stack). A [`ThreadArenaView`] owns at
//! most one current page and bump-allocates from it without touching any lock; it only takes the
//! pool's lock when its current page is exhausted and a fresh one is needed. No destructors run
//! over arena memory — it is for POD-like command payloads only; anything with a destructor is
//! tracked separately via a pass's keep-alive list (§4.4).

mod tag;

pub use tag::{ArenaTag, ArenaTagKind};

use crate::sync::{lock, Mutex};
use log::trace;
use std::collections::HashMap;

struct Page {
    buf: Box<[u8]>,
    cursor: usize,
}

impl Page {
    fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            cursor: 0,
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Attempts a bump allocation of `size` bytes aligned to `align`. Returns `None` if the
    /// remaining space on this page is insufficient; the caller must fall back to a fresh page.
    fn try_allocate(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");

        let base = self.buf.as_mut_ptr() as usize;
        let aligned_cursor = (base + self.cursor + align - 1) & !(align - 1);
        let offset = aligned_cursor - base;
        let end = offset.checked_add(size)?;

        if end > self.buf.len() {
            return None;
        }

        self.cursor = end;

        // SAFETY: `offset + size <= self.buf.len()`, and the returned pointer is derived from
        // this page's own heap allocation, which outlives the pointer per the tag's lifetime
        // contract enforced by `TaggedArena::free`.
        Some(unsafe { self.buf.as_mut_ptr().add(offset) })
    }
}

#[derive(Default)]
struct TagPages {
    retired: Vec<Page>,
    freed: bool,
}

struct ArenaState {
    free_pages: Vec<Page>,
    tags: HashMap<ArenaTag, TagPages>,
    pages_created: u64,
    high_water_pages: usize,
}

/// A bump allocator whose pages are released in bulk by [`ArenaTag`].
pub struct TaggedArena {
    page_size: usize,
    state: Mutex<ArenaState>,
}

impl TaggedArena {
    /// Creates a new arena whose pages are `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be non-zero");

        Self {
            page_size,
            state: Mutex::new(ArenaState {
                free_pages: Vec::new(),
                tags: HashMap::new(),
                pages_created: 0,
                high_water_pages: 0,
            }),
        }
    }

    fn acquire_page(&self) -> Page {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut state = lock(&self.state);

        let page = state.free_pages.pop().unwrap_or_else(|| {
            state.pages_created += 1;
            trace!("arena: creating page #{}", state.pages_created);

            Page::new(self.page_size)
        });

        page
    }

    fn retire_page(&self, tag: ArenaTag, page: Page) {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut state = lock(&self.state);

        let tag_pages = state.tags.entry(tag).or_default();
        assert!(
            !tag_pages.freed,
            "arena page retired onto an already-freed tag {tag:?}"
        );

        tag_pages.retired.push(page);

        let live_pages: usize = state.tags.values().map(|t| t.retired.len()).sum();
        if live_pages > state.high_water_pages {
            state.high_water_pages = live_pages;
        }
    }

    /// Returns a handle that bump-allocates pages tagged with `tag`. Cheap to create; intended to
    /// be held for the duration of one pass's recording (or one thread's slice of work within a
    /// phase), then dropped.
    pub fn thread_view(&self, tag: ArenaTag) -> ThreadArenaView<'_> {
        ThreadArenaView {
            arena: self,
            tag,
            current: None,
        }
    }

    /// Releases every page retired under `tag`. Every pointer previously returned for this tag
    /// is invalidated by this call.
    ///
    /// # Panics
    ///
    /// Double-freeing a tag is a fatal programming error (§4.1).
    pub fn free(&self, tag: ArenaTag) {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut state = lock(&self.state);

        let tag_pages = state.tags.entry(tag).or_default();
        assert!(!tag_pages.freed, "double free of arena tag {tag:?}");
        tag_pages.freed = true;
        let retired = std::mem::take(&mut tag_pages.retired);

        trace!("arena: freeing tag {tag:?} ({} pages)", retired.len());

        for mut page in retired {
            page.reset();
            state.free_pages.push(page);
        }
    }

    /// Number of pages the arena has ever created (never shrinks; pages are recycled, not
    /// deallocated).
    pub fn pages_created(&self) -> u64 {
        lock(&self.state).pages_created
    }

    /// The largest number of live (retired-but-not-freed) pages observed at once, across all
    /// tags. Exposed for tests and diagnostics, not the hot path.
    pub fn high_water_pages(&self) -> usize {
        lock(&self.state).high_water_pages
    }
}

/// A per-thread, lock-free-on-the-fast-path bump allocator scoped to one [`ArenaTag`].
pub struct ThreadArenaView<'a> {
    arena: &'a TaggedArena,
    tag: ArenaTag,
    current: Option<Page>,
}

impl<'a> ThreadArenaView<'a> {
    /// Bump-allocates `size` bytes aligned to `align` from this view's current page, taking a
    /// fresh page from the arena's pool when the current one is exhausted.
    ///
    /// Never fails short of process OOM; `size` must not exceed the arena's page size.
    pub fn allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        assert!(
            size <= self.arena.page_size,
            "allocation of {size} bytes exceeds arena page size {}",
            self.arena.page_size
        );

        if let Some(page) = self.current.as_mut() {
            if let Some(ptr) = page.try_allocate(size, align) {
                return ptr;
            }

            let exhausted = self.current.take().unwrap();
            self.arena.retire_page(self.tag, exhausted);
        }

        let mut page = self.arena.acquire_page();
        let ptr = page
            .try_allocate(size, align)
            .expect("fresh page too small for allocation; page_size misconfigured");
        self.current = Some(page);

        ptr
    }

    /// Copies `bytes` into arena-owned storage and returns a pointer to the copy, stable for the
    /// lifetime of this view's tag.
    pub fn copy_bytes(&mut self, bytes: &[u8]) -> *mut u8 {
        if bytes.is_empty() {
            return std::ptr::NonNull::dangling().as_ptr();
        }

        let ptr = self.allocate(bytes.len(), 1);

        // SAFETY: `ptr` was just allocated with exactly `bytes.len()` bytes of room.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }

        ptr
    }
}

impl Drop for ThreadArenaView<'_> {
    fn drop(&mut self) {
        if let Some(page) = self.current.take() {
            self.arena.retire_page(self.tag, page);
        }
    }
}
