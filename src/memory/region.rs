//! The mapped heap region and its one-per-cluster owner.

use super::layout::RegionLayout;
use crate::config::Placement;
use crate::error::{RdsmError, Result};
use crate::types::FlagId;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// One anonymous mapping holding local flags, heap and remote flags.
///
/// Peers write into the heap through the NIC without any Rust-visible
/// synchronization, so all access goes through raw pointers.
pub struct MappedRegion {
    ptr: *mut u8,
    layout: RegionLayout,
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map the region so that the heap starts at `heap_start` (fixed
    /// placement) or wherever the kernel chooses.
    ///
    /// Pages are populated up front and zero-filled.
    pub fn map(layout: RegionLayout, placement: Placement, heap_start: usize) -> Result<Self> {
        let len = layout.region_size();
        let (hint, flags) = match placement {
            Placement::Fixed => {
                let (region_start, _) = layout.compute(heap_start)?;
                (region_start, libc::MAP_FIXED_NOREPLACE)
            }
            Placement::Anywhere => (0, 0),
        };
        let flags = flags | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE;

        let ret = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(RdsmError::Mapping {
                addr: hint,
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
        if placement == Placement::Fixed && ret as usize != hint {
            unsafe { libc::munmap(ret, len) };
            return Err(RdsmError::Mapping {
                addr: hint,
                len,
                source: std::io::Error::from_raw_os_error(libc::EEXIST),
            });
        }

        tracing::debug!(
            region_start = format_args!("{:#x}", ret as usize),
            len,
            ?placement,
            "mapped heap region"
        );
        Ok(Self {
            ptr: ret as *mut u8,
            layout,
        })
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn region_start(&self) -> usize {
        self.ptr as usize
    }

    pub fn region_len(&self) -> usize {
        self.layout.region_size()
    }

    pub fn heap_start(&self) -> usize {
        self.region_start() + self.layout.heap_offset()
    }

    pub fn heap_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.add(self.layout.heap_offset()) }
    }

    /// Absolute address of heap range `[offset, offset + len)`.
    pub fn heap_addr(&self, offset: usize, len: usize) -> Result<usize> {
        Ok(self.region_start() + self.layout.heap_range(offset, len)?)
    }

    /// Absolute address of flag `id`.
    pub fn flag_addr(&self, id: FlagId) -> Result<usize> {
        Ok(self.region_start() + self.layout.flag_offset(id)?)
    }

    fn flag(&self, id: FlagId) -> Result<&AtomicU8> {
        let addr = self.flag_addr(id)?;
        Ok(unsafe { &*(addr as *const AtomicU8) })
    }

    pub fn clear_flag(&self, id: FlagId) -> Result<()> {
        self.flag(id)?.store(0, Ordering::Release);
        Ok(())
    }

    pub fn flag_is_set(&self, id: FlagId) -> Result<bool> {
        Ok(self.flag(id)?.load(Ordering::Acquire) != 0)
    }

    /// Set the byte peers read to complete a synchronization.
    ///
    /// Written once at registration and never cleared.
    pub fn arm_remote_sentinel(&self) {
        let sentinel = unsafe {
            &*(self.ptr.add(self.layout.remote_flag_offset()) as *const AtomicU8)
        };
        sentinel.store(1, Ordering::Release);
    }

    pub fn remote_sentinel(&self) -> u8 {
        unsafe { ptr::read_volatile(self.ptr.add(self.layout.remote_flag_offset())) }
    }

    /// Copy `data` into the heap at `offset`.
    pub fn write_heap(&self, offset: usize, data: &[u8]) -> Result<()> {
        let addr = self.heap_addr(offset, data.len())?;
        unsafe { ptr::copy(data.as_ptr(), addr as *mut u8, data.len()) };
        Ok(())
    }

    /// Copy heap bytes at `offset` into `out`.
    pub fn read_heap(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let addr = self.heap_addr(offset, out.len())?;
        unsafe { ptr::copy(addr as *const u8, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Copy `len` heap bytes from `src` to `dst`; ranges may overlap.
    pub fn copy_within(&self, src: usize, dst: usize, len: usize) -> Result<()> {
        let from = self.heap_addr(src, len)?;
        let to = self.heap_addr(dst, len)?;
        unsafe { ptr::copy(from as *const u8, to as *mut u8, len) };
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.layout.region_size());
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("region_start", &format_args!("{:#x}", self.region_start()))
            .field("layout", &self.layout)
            .finish()
    }
}

/// Owns the cluster's single mapping; connections share it by `Arc`.
///
/// The mapping is created by the first caller of [`region`](Self::region)
/// and reused by every later connection.
pub struct RegionManager {
    layout: RegionLayout,
    placement: Placement,
    heap_start: usize,
    region: Mutex<Option<Arc<MappedRegion>>>,
}

impl RegionManager {
    pub fn new(layout: RegionLayout, placement: Placement, heap_start: usize) -> Self {
        Self {
            layout,
            placement,
            heap_start,
            region: Mutex::new(None),
        }
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// The mapping, created on first use.
    pub fn region(&self) -> Result<Arc<MappedRegion>> {
        let mut guard = self
            .region
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("region"))?;
        if let Some(region) = guard.as_ref() {
            return Ok(Arc::clone(region));
        }
        let region = Arc::new(MappedRegion::map(
            self.layout,
            self.placement,
            self.heap_start,
        )?);
        *guard = Some(Arc::clone(&region));
        Ok(region)
    }

    /// The mapping if it has been created.
    pub fn mapped(&self) -> Option<Arc<MappedRegion>> {
        self.region.lock().ok().and_then(|g| g.as_ref().map(Arc::clone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RegionLayout {
        RegionLayout::new(1 << 16, 64, 4096).unwrap()
    }

    #[test]
    fn test_map_anywhere_zeroed() {
        let region = MappedRegion::map(layout(), Placement::Anywhere, 0).unwrap();
        assert_eq!(region.heap_start() - region.region_start(), 64);
        let mut buf = [0xffu8; 16];
        region.read_heap(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(region.remote_sentinel(), 0);
    }

    #[test]
    fn test_map_fixed_at_requested_address() {
        // Reserve an address range, release it, then map there.
        let probe = MappedRegion::map(layout(), Placement::Anywhere, 0).unwrap();
        let heap_start = probe.heap_start();
        drop(probe);
        let region = MappedRegion::map(layout(), Placement::Fixed, heap_start).unwrap();
        assert_eq!(region.heap_start(), heap_start);
    }

    #[test]
    fn test_fixed_refuses_occupied_range() {
        let first = MappedRegion::map(layout(), Placement::Anywhere, 0).unwrap();
        let err = MappedRegion::map(layout(), Placement::Fixed, first.heap_start()).unwrap_err();
        assert!(matches!(err, RdsmError::Mapping { .. }));
    }

    #[test]
    fn test_flags_and_sentinel() {
        let region = MappedRegion::map(layout(), Placement::Anywhere, 0).unwrap();
        assert_eq!(region.flag_addr(63).unwrap(), region.heap_start() - 1);
        assert!(!region.flag_is_set(3).unwrap());
        unsafe { *(region.flag_addr(3).unwrap() as *mut u8) = 1 };
        assert!(region.flag_is_set(3).unwrap());
        region.clear_flag(3).unwrap();
        assert!(!region.flag_is_set(3).unwrap());
        assert!(region.clear_flag(64).is_err());

        region.arm_remote_sentinel();
        assert_eq!(region.remote_sentinel(), 1);
    }

    #[test]
    fn test_heap_copy_and_bounds() {
        let region = MappedRegion::map(layout(), Placement::Anywhere, 0).unwrap();
        region.write_heap(0, b"hello").unwrap();
        region.copy_within(0, 100, 5).unwrap();
        let mut out = [0u8; 5];
        region.read_heap(100, &mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert!(region.write_heap((1 << 16) - 2, b"abc").is_err());
        assert!(region.copy_within(0, (1 << 16) - 4, 5).is_err());
    }

    #[test]
    fn test_manager_maps_once() {
        let manager = RegionManager::new(layout(), Placement::Anywhere, 0);
        assert!(manager.mapped().is_none());
        let a = manager.region().unwrap();
        let b = manager.region().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.mapped().unwrap().region_start(), a.region_start());
    }
}
