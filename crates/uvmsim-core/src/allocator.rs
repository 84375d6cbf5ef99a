//! Two-tier physical page pools
//!
//! One fixed-size backing region per tier with a bitmap of per-page
//! occupancy. Allocation is deterministic first-fit: the lowest clear bit
//! wins, always. Exhaustion returns a sentinel, never an error; invalid or
//! double frees are logged and ignored.
//!
//! Host pages are real pointers into the host region. Accelerator pages are
//! synthetic addresses starting at [`GPU_ADDRESS_BASE`]; when the simulator
//! flag is set they are backed by a second host region so migrations move
//! real bytes, otherwise device copies are accounting-only.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Result, UvmError};
use crate::types::GPU_ADDRESS_BASE;

/// Configuration for [`PageAllocator`].
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Page size in bytes, shared by both tiers.
    pub page_size: usize,
    /// Host pool size in bytes.
    pub cpu_pool_bytes: usize,
    /// Accelerator pool size in bytes.
    pub gpu_pool_bytes: usize,
    /// Advisory: request page-locked host memory. The simulator logs the
    /// request and uses ordinary allocation.
    pub use_pinned_memory: bool,
    /// Back the accelerator tier with a host buffer.
    pub use_gpu_simulator: bool,
}

/// Occupancy bitmap for one tier.
struct PoolState {
    bitmap: Vec<bool>,
    allocated: usize,
}

impl PoolState {
    fn new(num_pages: usize) -> Self {
        Self {
            bitmap: vec![false; num_pages],
            allocated: 0,
        }
    }

    /// Lowest clear index, or None when the pool is exhausted.
    fn take_first_free(&mut self) -> Option<usize> {
        let idx = self.bitmap.iter().position(|used| !used)?;
        self.bitmap[idx] = true;
        self.allocated += 1;
        Some(idx)
    }

    /// Clear a bit; false when it was already clear.
    fn release(&mut self, idx: usize) -> bool {
        if idx < self.bitmap.len() && self.bitmap[idx] {
            self.bitmap[idx] = false;
            self.allocated -= 1;
            true
        } else {
            false
        }
    }

    fn available(&self) -> usize {
        self.bitmap.len() - self.allocated
    }
}

struct Pools {
    cpu: PoolState,
    gpu: PoolState,
}

/// Bitmap page pools for the host and accelerator tiers.
pub struct PageAllocator {
    config: AllocatorConfig,
    cpu_base: NonNull<u8>,
    cpu_layout: Layout,
    /// Simulated device backing; None in accounting-only mode.
    gpu_base: Option<NonNull<u8>>,
    gpu_layout: Option<Layout>,
    pools: Mutex<Pools>,
}

// Safety: the raw pool bases are only handed out as page-granular,
// non-overlapping regions whose occupancy is tracked under `pools`; the
// buffers themselves live until Drop. Concurrent byte access to a single
// page is serialized by the manager, not by this type.
unsafe impl Send for PageAllocator {}
unsafe impl Sync for PageAllocator {}

impl PageAllocator {
    /// Allocate both backing regions and build empty bitmaps.
    ///
    /// Fails only if the OS refuses a region; this is the one irrecoverable
    /// error in the engine.
    pub fn new(config: AllocatorConfig) -> Result<Self> {
        let num_cpu_pages = config.cpu_pool_bytes / config.page_size;
        let num_gpu_pages = config.gpu_pool_bytes / config.page_size;
        if num_cpu_pages == 0 || num_gpu_pages == 0 {
            return Err(UvmError::PoolAllocation(
                "each pool must hold at least one page".to_string(),
            ));
        }

        if config.use_pinned_memory {
            debug!("pinned host memory requested; simulator uses ordinary allocation");
        }

        let cpu_layout = Layout::from_size_align(config.cpu_pool_bytes, config.page_size)
            .map_err(|e| UvmError::PoolAllocation(format!("host pool layout: {e}")))?;
        let sim_layout = if config.use_gpu_simulator {
            Some(
                Layout::from_size_align(config.gpu_pool_bytes, config.page_size)
                    .map_err(|e| UvmError::PoolAllocation(format!("device pool layout: {e}")))?,
            )
        } else {
            None
        };

        // Zeroed so reads of never-written pages are defined.
        let cpu_base = unsafe { alloc_zeroed(cpu_layout) };
        let cpu_base = NonNull::new(cpu_base).ok_or_else(|| {
            UvmError::PoolAllocation(format!(
                "host pool of {} bytes refused by the OS",
                config.cpu_pool_bytes
            ))
        })?;

        let (gpu_base, gpu_layout) = if let Some(layout) = sim_layout {
            let base = unsafe { alloc_zeroed(layout) };
            let base = NonNull::new(base).ok_or_else(|| {
                // The host region must not leak when the device region fails.
                unsafe { dealloc(cpu_base.as_ptr(), cpu_layout) };
                UvmError::PoolAllocation(format!(
                    "simulated device pool of {} bytes refused by the OS",
                    config.gpu_pool_bytes
                ))
            })?;
            (Some(base), Some(layout))
        } else {
            (None, None)
        };

        debug!(
            cpu_pages = num_cpu_pages,
            gpu_pages = num_gpu_pages,
            simulator = config.use_gpu_simulator,
            "page allocator initialized"
        );

        Ok(Self {
            config,
            cpu_base,
            cpu_layout,
            gpu_base,
            gpu_layout,
            pools: Mutex::new(Pools {
                cpu: PoolState::new(num_cpu_pages),
                gpu: PoolState::new(num_gpu_pages),
            }),
        })
    }

    /// Claim the lowest free host page. None when the pool is exhausted.
    pub fn allocate_cpu_page(&self) -> Option<NonNull<u8>> {
        let mut pools = self.pools.lock();
        match pools.cpu.take_first_free() {
            Some(idx) => {
                let ptr = unsafe { self.cpu_base.as_ptr().add(idx * self.config.page_size) };
                trace!(idx, "allocated host page");
                // Safety: idx * page_size < cpu_pool_bytes, so the offset
                // stays inside the region allocated in `new`.
                Some(unsafe { NonNull::new_unchecked(ptr) })
            }
            None => {
                warn!("no free host pages available");
                None
            }
        }
    }

    /// Return a host page to the pool. Pointers outside the pool and
    /// already-free pages are rejected with a warning.
    pub fn deallocate_cpu_page(&self, ptr: NonNull<u8>) {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.cpu_base.as_ptr() as usize);
        if offset >= self.config.cpu_pool_bytes {
            warn!("attempted to deallocate a pointer outside the host pool");
            return;
        }
        let idx = offset / self.config.page_size;
        let mut pools = self.pools.lock();
        if pools.cpu.release(idx) {
            trace!(idx, "deallocated host page");
        } else {
            warn!(idx, "double free of host page ignored");
        }
    }

    /// Claim the lowest free accelerator page, returning its synthetic
    /// address. None when the pool is exhausted.
    pub fn allocate_gpu_page(&self) -> Option<u64> {
        let mut pools = self.pools.lock();
        match pools.gpu.take_first_free() {
            Some(idx) => {
                let addr = GPU_ADDRESS_BASE + (idx * self.config.page_size) as u64;
                trace!(idx, addr, "allocated device page");
                Some(addr)
            }
            None => {
                warn!("no free device pages available");
                None
            }
        }
    }

    /// Return an accelerator page to the pool. Addresses below the device
    /// base and already-free pages are rejected with a warning.
    pub fn deallocate_gpu_page(&self, gpu_addr: u64) {
        if gpu_addr < GPU_ADDRESS_BASE {
            warn!(gpu_addr, "invalid device address");
            return;
        }
        let idx = ((gpu_addr - GPU_ADDRESS_BASE) / self.config.page_size as u64) as usize;
        let mut pools = self.pools.lock();
        if pools.gpu.release(idx) {
            trace!(idx, "deallocated device page");
        } else {
            warn!(idx, "double free of device page ignored");
        }
    }

    pub fn available_cpu_pages(&self) -> usize {
        self.pools.lock().cpu.available()
    }

    pub fn available_gpu_pages(&self) -> usize {
        self.pools.lock().gpu.available()
    }

    pub fn total_cpu_pages(&self) -> usize {
        self.config.cpu_pool_bytes / self.config.page_size
    }

    pub fn total_gpu_pages(&self) -> usize {
        self.config.gpu_pool_bytes / self.config.page_size
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Copy `len` bytes from a host page into the device backing.
    ///
    /// No-op in accounting-only mode. Out-of-range destinations are
    /// rejected with a warning rather than clobbering memory.
    ///
    /// # Safety
    /// `src` must be valid for reads of `len` bytes.
    pub(crate) unsafe fn copy_page_to_device(&self, gpu_addr: u64, src: NonNull<u8>, len: usize) {
        let Some(gpu_base) = self.gpu_base else {
            return;
        };
        let Some(offset) = self.device_offset(gpu_addr, len) else {
            return;
        };
        std::ptr::copy_nonoverlapping(src.as_ptr(), gpu_base.as_ptr().add(offset), len);
    }

    /// Copy `len` bytes from the device backing into a host page.
    ///
    /// No-op in accounting-only mode.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `len` bytes.
    pub(crate) unsafe fn copy_page_from_device(&self, gpu_addr: u64, dst: NonNull<u8>, len: usize) {
        let Some(gpu_base) = self.gpu_base else {
            return;
        };
        let Some(offset) = self.device_offset(gpu_addr, len) else {
            return;
        };
        std::ptr::copy_nonoverlapping(gpu_base.as_ptr().add(offset), dst.as_ptr(), len);
    }

    fn device_offset(&self, gpu_addr: u64, len: usize) -> Option<usize> {
        if gpu_addr < GPU_ADDRESS_BASE {
            warn!(gpu_addr, "device copy below the address base rejected");
            return None;
        }
        let offset = (gpu_addr - GPU_ADDRESS_BASE) as usize;
        if offset + len > self.config.gpu_pool_bytes {
            warn!(gpu_addr, len, "device copy past the pool end rejected");
            return None;
        }
        Some(offset)
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.cpu_base.as_ptr(), self.cpu_layout);
            if let (Some(base), Some(layout)) = (self.gpu_base, self.gpu_layout) {
                dealloc(base.as_ptr(), layout);
            }
        }
    }
}
