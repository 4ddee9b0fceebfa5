use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::ops::{Add, Sub};

use log::{debug, warn};
use pagemap2::{PageMapError, VirtualMemoryArea};
use serde::Serialize;
use thiserror::Error;

use crate::util::PAGE_SIZE;

#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Physical memory address.
///
/// A newtype wrapper around a physical address value.
pub struct PhysAddr(u64);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:02x})", self.0))
    }
}

impl std::fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl PhysAddr {
    /// Creates a new physical address.
    pub const fn new(addr: u64) -> Self {
        PhysAddr(addr)
    }

    /// Returns the address as a u64.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the physical frame number for the given page size.
    pub fn frame(&self, page_size: usize) -> u64 {
        self.0 / page_size as u64
    }
}

impl Add<u64> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: u64) -> Self::Output {
        PhysAddr(self.0 + rhs)
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: usize) -> Self::Output {
        PhysAddr(self.0 + rhs as u64)
    }
}

impl Sub<usize> for PhysAddr {
    type Output = PhysAddr;

    fn sub(self, rhs: usize) -> Self::Output {
        assert!(self.0 >= rhs as u64);
        PhysAddr(self.0 - rhs as u64)
    }
}

impl From<PhysAddr> for u64 {
    fn from(addr: PhysAddr) -> u64 {
        addr.0
    }
}

/// Reasons a virtual page could not be resolved.
///
/// None of these are fatal: the page is simply not considered as a target.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The mapping table could not be opened, or it hides frame numbers (unprivileged read).
    #[error("page mapping table inaccessible")]
    PermissionDenied,
    /// The page is not present in physical memory.
    #[error("page not present")]
    NotPresent,
    /// The mapping table returned fewer entries than requested.
    #[error("short read from page mapping table")]
    ShortRead,
    /// Any other error from the pagemap reader.
    #[error(transparent)]
    PageMap(#[from] PageMapError),
}

/// Capability for translating virtual addresses into physical addresses.
///
/// Resolution is best-effort: the operating system may remap a page at any
/// time, so a result is only a snapshot.
pub trait PhysAddrResolver {
    /// Translates a virtual address to a physical address.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] if the page is unmapped or the table is inaccessible.
    fn resolve(&mut self, virt: usize) -> Result<PhysAddr, ResolveError>;

    /// Resolves `pages` consecutive pages starting at `start`.
    ///
    /// Index `i` of the result holds the physical address of page `i`, or `None`
    /// if that page could not be resolved.
    fn resolve_pages(&mut self, start: usize, pages: usize, page_size: usize) -> Vec<Option<PhysAddr>> {
        (0..pages)
            .map(|i| self.resolve(start + i * page_size).ok())
            .collect()
    }
}

/// Virtual to physical address translator using Linux pagemap.
///
/// Uses `/proc/self/pagemap`. Without root privileges the kernel reports frame
/// number 0 for every page, which is treated as [`ResolveError::PermissionDenied`].
pub struct LinuxPageMap {
    pagemap: Option<pagemap2::PageMap>,
    page_size: usize,
    warned_zero_pfn: bool,
}

impl LinuxPageMap {
    /// Opens the pagemap of the current process.
    ///
    /// Failure to open is not an error: every later lookup reports
    /// [`ResolveError::PermissionDenied`].
    pub fn new() -> Self {
        Self::for_process(std::process::id())
    }

    /// Opens the pagemap of the process `pid`.
    pub fn for_process(pid: u32) -> Self {
        let pagemap = match pagemap2::PageMap::new(pid as u64) {
            Ok(pagemap) => Some(pagemap),
            Err(e) => {
                warn!("Failed to open pagemap for pid {}: {}", pid, e);
                None
            }
        };
        LinuxPageMap {
            pagemap,
            page_size: PAGE_SIZE,
            warned_zero_pfn: false,
        }
    }

    /// Whether the pagemap could be opened.
    pub fn is_available(&self) -> bool {
        self.pagemap.is_some()
    }

    fn frame_to_phys(&mut self, pfn: u64, virt: usize) -> Result<PhysAddr, ResolveError> {
        if pfn == 0 {
            if !self.warned_zero_pfn {
                warn!(
                    "Got invalid PFN 0 for virtual address 0x{:x}. Are we root?",
                    virt
                );
                self.warned_zero_pfn = true;
            }
            return Err(ResolveError::PermissionDenied);
        }
        let offset = (virt % self.page_size) as u64;
        Ok(PhysAddr(pfn * self.page_size as u64 + offset))
    }
}

impl Default for LinuxPageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysAddrResolver for LinuxPageMap {
    fn resolve(&mut self, virt: usize) -> Result<PhysAddr, ResolveError> {
        let page_size = self.page_size as u64;
        let pagemap = self.pagemap.as_mut().ok_or(ResolveError::PermissionDenied)?;
        let vaddr_start_page = virt as u64 & !(page_size - 1);
        let vaddr_end_page = vaddr_start_page + page_size - 1;

        let memory_region = VirtualMemoryArea::from((vaddr_start_page, vaddr_end_page));
        let entries = pagemap.pagemap_vma(&memory_region)?;
        let entry = entries.first().ok_or(ResolveError::ShortRead)?;
        if !entry.present() {
            return Err(ResolveError::NotPresent);
        }
        let pfn = entry.pfn().map_err(|_| ResolveError::NotPresent)?;
        self.frame_to_phys(pfn, virt)
    }

    fn resolve_pages(&mut self, start: usize, pages: usize, page_size: usize) -> Vec<Option<PhysAddr>> {
        let Some(pagemap) = self.pagemap.as_mut() else {
            return vec![None; pages];
        };
        let region = VirtualMemoryArea::from((start as u64, (start + pages * page_size) as u64));
        let entries = match pagemap.pagemap_vma(&region) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Ranged pagemap read failed ({}), falling back to single lookups", e);
                return (0..pages)
                    .map(|i| self.resolve(start + i * page_size).ok())
                    .collect();
            }
        };
        let pfns = entries
            .iter()
            .map(|e| if e.present() { e.pfn().ok() } else { None })
            .collect::<Vec<_>>();
        // pagemap has one entry per base page
        let step = (page_size / self.page_size).max(1);
        (0..pages)
            .map(|i| {
                let pfn = pfns.get(i * step).copied().flatten()?;
                self.frame_to_phys(pfn, start + i * page_size).ok()
            })
            .collect()
    }
}

/// In-memory resolver backed by a fixed `virtual page -> physical page` table.
///
/// Lets discovery run against synthetic layouts.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    page_size: usize,
    pages: HashMap<usize, PhysAddr>,
}

impl StaticResolver {
    /// Creates an empty table; every lookup reports [`ResolveError::NotPresent`].
    pub fn new(page_size: usize) -> Self {
        StaticResolver {
            page_size,
            pages: HashMap::new(),
        }
    }

    /// Maps the page containing `virt` to the physical page at `phys`.
    pub fn insert(&mut self, virt: usize, phys: PhysAddr) {
        let virt_page = virt & !(self.page_size - 1);
        let phys_page = PhysAddr(phys.0 & !(self.page_size as u64 - 1));
        self.pages.insert(virt_page, phys_page);
    }

    /// Builds a table mapping consecutive virtual pages from `start` onto `phys` in order.
    pub fn from_pages(start: usize, page_size: usize, phys: &[PhysAddr]) -> Self {
        let mut resolver = Self::new(page_size);
        for (i, &p) in phys.iter().enumerate() {
            resolver.insert(start + i * page_size, p);
        }
        resolver
    }
}

impl PhysAddrResolver for StaticResolver {
    fn resolve(&mut self, virt: usize) -> Result<PhysAddr, ResolveError> {
        let virt_page = virt & !(self.page_size - 1);
        self.pages
            .get(&virt_page)
            .map(|&p| p + (virt - virt_page))
            .ok_or(ResolveError::NotPresent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver_keeps_page_offset() {
        let mut resolver = StaticResolver::new(4096);
        resolver.insert(0x10000, PhysAddr::new(0x4000_0000));
        let p = resolver.resolve(0x10123).unwrap();
        assert_eq!(p, PhysAddr::new(0x4000_0123));
    }

    #[test]
    fn test_static_resolver_unmapped() {
        let mut resolver = StaticResolver::new(4096);
        assert!(matches!(
            resolver.resolve(0x10000),
            Err(ResolveError::NotPresent)
        ));
    }

    #[test]
    fn test_resolve_pages_marks_holes() {
        let mut resolver = StaticResolver::new(4096);
        resolver.insert(0x20000, PhysAddr::new(0x5000_0000));
        resolver.insert(0x22000, PhysAddr::new(0x6000_0000));
        let pages = resolver.resolve_pages(0x20000, 3, 4096);
        assert_eq!(
            pages,
            vec![
                Some(PhysAddr::new(0x5000_0000)),
                None,
                Some(PhysAddr::new(0x6000_0000))
            ]
        );
    }

    #[test]
    #[ignore]
    fn test_linux_pagemap_resolves_stack_page() {
        let value = 0u64;
        let mut pagemap = LinuxPageMap::new();
        let phys = pagemap.resolve(&value as *const u64 as usize);
        assert!(phys.is_ok(), "requires root: {:?}", phys);
    }
}
