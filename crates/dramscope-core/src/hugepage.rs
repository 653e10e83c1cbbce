//! Huge-page acquisition and physical-address translation.
//!
//! This is the only module that owns raw mappings or reads the pagemap.
//! Everything it hands out is an owned value type ([`MappedRegion`]); the
//! engine never dereferences a physical address, only virtual addresses
//! paired with their translations.
//!
//! Requires Linux, 1 GiB huge pages reserved at boot, and `CAP_SYS_ADMIN`
//! for PFN visibility in `/proc/self/pagemap`.

#![cfg(target_os = "linux")]

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::error::DiscoveryError;
use crate::pool::MappedRegion;

/// 1 GiB.
pub const HUGE_PAGE_SIZE: usize = 1 << 30;

const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

/// An owned anonymous mapping of one or more 1 GiB huge pages.
pub struct HugePageRegion {
    base: *mut u8,
    len: usize,
}

impl HugePageRegion {
    /// Map `num_pages` 1 GiB huge pages read-write and touch the first byte
    /// of each page so a physical frame is actually assigned before
    /// translation.
    pub fn allocate(num_pages: usize) -> Result<Self, DiscoveryError> {
        let len = num_pages * HUGE_PAGE_SIZE;

        // SAFETY: anonymous private mapping with no fd; the result is
        // checked against MAP_FAILED before use.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | libc::MAP_HUGE_1GB,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(DiscoveryError::AllocationFailure {
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        let base = base as *mut u8;

        for page in 0..num_pages {
            // SAFETY: page * HUGE_PAGE_SIZE < len; the mapping is writable.
            unsafe {
                std::ptr::write_volatile(base.add(page * HUGE_PAGE_SIZE), 0);
            }
        }

        Ok(Self { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_pages(&self) -> usize {
        self.len / HUGE_PAGE_SIZE
    }

    /// Virtual base address of each huge page.
    pub fn page_bases(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pages()).map(|p| self.base as usize + p * HUGE_PAGE_SIZE)
    }

    /// Translate every page and return one region per huge page.
    ///
    /// Within a huge page, physical addresses are contiguous, so a single
    /// base translation covers the whole gigabyte.
    pub fn mapped_regions(&self) -> Result<Vec<MappedRegion>, DiscoveryError> {
        self.page_bases()
            .map(|vaddr| {
                let paddr = physical_address(vaddr)?;
                Ok(MappedRegion {
                    vaddr,
                    paddr,
                    len: HUGE_PAGE_SIZE,
                })
            })
            .collect()
    }
}

impl Drop for HugePageRegion {
    fn drop(&mut self) {
        // SAFETY: base/len came from a successful mmap and are unmapped
        // exactly once.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Translate a virtual address through `/proc/self/pagemap`.
///
/// The file is opened per query and closed immediately. A missing present
/// bit or an all-zero PFN means the kernel hid the frame (typically: no
/// `CAP_SYS_ADMIN`).
pub fn physical_address(vaddr: usize) -> Result<u64, DiscoveryError> {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

    let file = File::open("/proc/self/pagemap")
        .map_err(|_| DiscoveryError::NoPhysicalTranslation { vaddr })?;

    let mut entry = [0u8; 8];
    let offset = (vaddr / page_size) as u64 * 8;
    file.read_exact_at(&mut entry, offset)
        .map_err(|_| DiscoveryError::NoPhysicalTranslation { vaddr })?;

    let entry = u64::from_le_bytes(entry);
    if entry & PAGEMAP_PRESENT == 0 {
        return Err(DiscoveryError::NoPhysicalTranslation { vaddr });
    }
    let pfn = entry & PAGEMAP_PFN_MASK;
    if pfn == 0 {
        return Err(DiscoveryError::NoPhysicalTranslation { vaddr });
    }

    Ok(pfn * page_size as u64 + (vaddr % page_size) as u64)
}
