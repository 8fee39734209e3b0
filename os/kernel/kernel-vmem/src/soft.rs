//! # Software Address Space
//!
//! A page table kept in a hash map, with frame contents held in sparse
//! buffers that are created on first access. Frames that were never written
//! read back as [`FRESH_FRAME_PATTERN`], not zero, so code that relies on
//! zero-filled memory has to fill it explicitly.
//!
//! Several spaces can share one [`SoftPhysicalMemory`], in which case a
//! frame mapped in two of them shows the same bytes through both.

use crate::{HeapCursor, HeapLayout, MapError, MappingFlags, VirtualAddressSpace};
use alloc::boxed::Box;
use alloc::sync::Arc;
use hashbrown::HashMap;
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;

/// Content of a frame nobody has written yet.
pub const FRESH_FRAME_PATTERN: u8 = 0xCC;

#[allow(clippy::cast_possible_truncation)]
const PAGE_BYTES: usize = PAGE_SIZE as usize;

type Frame = Box<[u8; PAGE_BYTES]>;

/// Sparse backing store for physical frames.
pub struct SoftPhysicalMemory {
    frames: SpinLock<HashMap<FrameNumber, Frame>>,
}

impl Default for SoftPhysicalMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftPhysicalMemory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: SpinLock::new(HashMap::new()),
        }
    }

    fn read(&self, pa: PhysicalAddress) -> u8 {
        self.frames.with_lock(|frames| {
            frames
                .get(&pa.frame())
                .map_or(FRESH_FRAME_PATTERN, |f| f[page_offset(pa.as_u64())])
        })
    }

    fn write(&self, pa: PhysicalAddress, value: u8) {
        self.frames.with_lock(|frames| {
            let frame = frames
                .entry(pa.frame())
                .or_insert_with(|| Box::new([FRESH_FRAME_PATTERN; PAGE_BYTES]));
            frame[page_offset(pa.as_u64())] = value;
        });
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn page_offset(addr: u64) -> usize {
    (addr & (PAGE_SIZE - 1)) as usize
}

struct Tables {
    pages: HashMap<VirtualAddress, (PhysicalAddress, MappingFlags)>,
    /// Number of further `map` calls allowed to succeed; `None` is unlimited.
    map_budget: Option<usize>,
    unmap_budget: Option<usize>,
}

/// Hash-map backed [`VirtualAddressSpace`].
pub struct SoftAddressSpace {
    tables: SpinLock<Tables>,
    memory: Arc<SoftPhysicalMemory>,
    heap: HeapCursor,
    layout: HeapLayout,
}

impl Default for SoftAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftAddressSpace {
    /// An empty space with its own physical memory and the default user
    /// heap layout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_memory(Arc::new(SoftPhysicalMemory::new()))
    }

    /// An empty space backed by `memory`, which may be shared with others.
    #[must_use]
    pub fn with_memory(memory: Arc<SoftPhysicalMemory>) -> Self {
        Self {
            tables: SpinLock::new(Tables {
                pages: HashMap::new(),
                map_budget: None,
                unmap_budget: None,
            }),
            memory,
            heap: HeapCursor::default(),
            layout: HeapLayout::user(),
        }
    }

    /// A new, empty space sharing this one's physical memory.
    #[must_use]
    pub fn sibling(&self) -> Self {
        Self::with_memory(Arc::clone(&self.memory))
    }

    #[must_use]
    pub fn with_heap(mut self, heap: HeapCursor, layout: HeapLayout) -> Self {
        self.heap = heap;
        self.layout = layout;
        self
    }

    /// Lets the next `budget` calls to `map` succeed and fails every one
    /// after that with [`MapError::OutOfTables`]. `None` lifts the limit.
    pub fn set_map_budget(&self, budget: Option<usize>) {
        self.tables.with_lock(|t| t.map_budget = budget);
    }

    /// Same as [`set_map_budget`](Self::set_map_budget) for `unmap` calls
    /// on mapped pages.
    pub fn set_unmap_budget(&self, budget: Option<usize>) {
        self.tables.with_lock(|t| t.unmap_budget = budget);
    }

    /// Number of mapped pages.
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.tables.with_lock(|t| t.pages.len())
    }

    fn translate(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, MappingFlags)> {
        let page = virt.align_down();
        self.tables.with_lock(|t| t.pages.get(&page).copied()).map(|(pa, flags)| (pa + (virt - page), flags))
    }

    /// Reads one byte through the translation.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if the page is not mapped.
    pub fn read_byte(&self, virt: VirtualAddress) -> Result<u8, MapError> {
        let (pa, _) = self.translate(virt).ok_or(MapError::NotMapped(virt.align_down()))?;
        Ok(self.memory.read(pa))
    }

    /// Writes one byte through the translation, honouring write protection.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if the page is not mapped,
    /// [`MapError::WriteProtected`] if it lacks [`MappingFlags::WRITE`] (this
    /// is where a real CPU would raise a page fault).
    pub fn write_byte(&self, virt: VirtualAddress, value: u8) -> Result<(), MapError> {
        let (pa, flags) = self.translate(virt).ok_or(MapError::NotMapped(virt.align_down()))?;
        if !flags.contains(MappingFlags::WRITE) {
            return Err(MapError::WriteProtected(virt.align_down()));
        }
        self.memory.write(pa, value);
        Ok(())
    }
}

impl VirtualAddressSpace for SoftAddressSpace {
    fn map(
        &self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        if !phys.is_page_aligned() {
            return Err(MapError::Unaligned(phys.as_u64()));
        }
        if !virt.is_page_aligned() {
            return Err(MapError::Unaligned(virt.as_u64()));
        }

        self.tables.with_lock(|t| {
            if t.pages.contains_key(&virt) {
                return Err(MapError::AlreadyMapped(virt));
            }
            match &mut t.map_budget {
                Some(0) => return Err(MapError::OutOfTables),
                Some(n) => *n -= 1,
                None => {}
            }
            t.pages.insert(virt, (phys, flags));
            Ok(())
        })
    }

    fn unmap(&self, virt: VirtualAddress) -> Result<(), MapError> {
        let page = virt.align_down();
        self.tables.with_lock(|t| {
            if !t.pages.contains_key(&page) {
                return Err(MapError::NotMapped(page));
            }
            match &mut t.unmap_budget {
                Some(0) => return Err(MapError::OutOfTables),
                Some(n) => *n -= 1,
                None => {}
            }
            t.pages.remove(&page);
            Ok(())
        })
    }

    fn mapping(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, MappingFlags)> {
        let page = virt.align_down();
        self.tables.with_lock(|t| t.pages.get(&page).copied())
    }

    unsafe fn fill(&self, virt: VirtualAddress, value: u8, len: usize) {
        for i in 0..len as u64 {
            if let Some((pa, _)) = self.translate(virt + i) {
                self.memory.write(pa, value);
            }
        }
    }

    fn heap_cursor(&mut self) -> &mut HeapCursor {
        &mut self.heap
    }

    fn heap_layout(&self) -> HeapLayout {
        self.layout
    }
}
