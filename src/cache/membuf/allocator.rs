//! Page Allocator
//!
//! Free-space accounting for the buffer pool. The pool is split into pages;
//! each page keeps an offset-ordered free list. Allocation is first-fit
//! across pages, frees coalesce with both neighbours.

use std::collections::BTreeMap;

/// An allocated byte range inside one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Page index
    pub page: usize,
    /// Offset inside the page
    pub offset: u64,
    /// Length in bytes
    pub len: u64,
}

impl Region {
    /// Zero-length region; never backed by pool memory
    pub const EMPTY: Region = Region {
        page: 0,
        offset: 0,
        len: 0,
    };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
struct FreeList {
    size: u64,
    /// offset -> length
    blocks: BTreeMap<u64, u64>,
    free_bytes: u64,
}

impl FreeList {
    fn new(size: u64) -> Self {
        let mut blocks = BTreeMap::new();
        if size > 0 {
            blocks.insert(0, size);
        }
        Self {
            size,
            blocks,
            free_bytes: size,
        }
    }

    fn allocate(&mut self, len: u64) -> Option<u64> {
        let (&offset, &block_len) = self.blocks.iter().find(|(_, l)| **l >= len)?;
        self.blocks.remove(&offset);
        if block_len > len {
            self.blocks.insert(offset + len, block_len - len);
        }
        self.free_bytes -= len;
        Some(offset)
    }

    fn free(&mut self, mut offset: u64, mut len: u64) {
        debug_assert!(offset + len <= self.size, "region outside page");
        self.free_bytes += len;

        if let Some((&prev_offset, &prev_len)) = self.blocks.range(..offset).next_back() {
            debug_assert!(prev_offset + prev_len <= offset, "double free");
            if prev_offset + prev_len == offset {
                self.blocks.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        if let Some((&next_offset, &next_len)) = self.blocks.range(offset + len..).next() {
            if offset + len == next_offset {
                self.blocks.remove(&next_offset);
                len += next_len;
            }
        }
        self.blocks.insert(offset, len);
    }

    fn largest_block(&self) -> u64 {
        self.blocks.values().copied().max().unwrap_or(0)
    }
}

/// First-fit allocator over fixed-size pages
#[derive(Debug)]
pub struct PageAllocator {
    pages: Vec<FreeList>,
    capacity: u64,
}

impl PageAllocator {
    /// Split `capacity` into pages of at most `page_size` bytes; the last
    /// page takes the remainder.
    pub fn new(capacity: u64, page_size: u64) -> Self {
        let page_size = page_size.clamp(1, capacity.max(1));
        let mut pages = Vec::new();
        let mut remaining = capacity;
        while remaining > 0 {
            let size = remaining.min(page_size);
            pages.push(FreeList::new(size));
            remaining -= size;
        }
        Self { pages, capacity }
    }

    /// Reserve `len` contiguous bytes
    pub fn allocate(&mut self, len: u64) -> Option<Region> {
        if len == 0 {
            return Some(Region::EMPTY);
        }
        self.pages.iter_mut().enumerate().find_map(|(page, list)| {
            if list.free_bytes < len {
                return None;
            }
            list.allocate(len).map(|offset| Region { page, offset, len })
        })
    }

    /// Return a region to its page
    pub fn free(&mut self, region: Region) {
        if region.is_empty() {
            return;
        }
        if let Some(list) = self.pages.get_mut(region.page) {
            list.free(region.offset, region.len);
        }
    }

    /// Total capacity
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Free bytes across all pages
    pub fn free_bytes(&self) -> u64 {
        self.pages.iter().map(|p| p.free_bytes).sum()
    }

    /// Allocated bytes across all pages
    pub fn used_bytes(&self) -> u64 {
        self.capacity - self.free_bytes()
    }

    /// Largest contiguous free block in any page
    pub fn largest_free_block(&self) -> u64 {
        self.pages
            .iter()
            .map(FreeList::largest_block)
            .max()
            .unwrap_or(0)
    }

    /// Largest page, i.e. the largest region that can ever be allocated
    pub fn max_region(&self) -> u64 {
        self.pages.iter().map(|p| p.size).max().unwrap_or(0)
    }

    /// Page sizes in order
    pub fn page_sizes(&self) -> Vec<u64> {
        self.pages.iter().map(|p| p.size).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
