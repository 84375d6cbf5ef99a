//! Scoped typed views over virtual allocations
//!
//! [`DeviceMapped`] acquires a virtual range on construction and releases
//! it when it goes out of scope. Element access goes through the manager's
//! read/write operations, because simulator virtual addresses are synthetic
//! and must never be dereferenced. Moves transfer ownership; there is no
//! Clone.

use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;

use crate::manager::VmManager;
use crate::types::Address;

/// Element types that are valid for every initialized bit pattern.
///
/// # Safety
/// Implementors must accept arbitrary byte content, including all zeros;
/// the backing pages start zeroed and are filled by untyped copies.
pub unsafe trait PlainOldData: Copy {}

unsafe impl PlainOldData for u8 {}
unsafe impl PlainOldData for u16 {}
unsafe impl PlainOldData for u32 {}
unsafe impl PlainOldData for u64 {}
unsafe impl PlainOldData for usize {}
unsafe impl PlainOldData for i8 {}
unsafe impl PlainOldData for i16 {}
unsafe impl PlainOldData for i32 {}
unsafe impl PlainOldData for i64 {}
unsafe impl PlainOldData for isize {}
unsafe impl PlainOldData for f32 {}
unsafe impl PlainOldData for f64 {}

/// An owned, typed view over a virtual allocation of `len` elements.
pub struct DeviceMapped<T: PlainOldData> {
    vm: Arc<VmManager>,
    vaddr: Address,
    len: usize,
    _elements: PhantomData<T>,
}

impl<T: PlainOldData> DeviceMapped<T> {
    /// Allocate room for `len` elements, optionally prefetched to the
    /// device tier. None when the manager cannot satisfy the allocation.
    pub fn new(vm: Arc<VmManager>, len: usize, gpu_resident: bool) -> Option<Self> {
        let bytes = len.checked_mul(std::mem::size_of::<T>())?;
        let vaddr = vm.allocate(bytes, gpu_resident)?;
        Some(Self {
            vm,
            vaddr,
            len,
            _elements: PhantomData,
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Starting virtual address of the backing allocation.
    pub fn vaddr(&self) -> Address {
        self.vaddr
    }

    fn element_addr(&self, index: usize) -> Address {
        self.vaddr + (index * std::mem::size_of::<T>()) as u64
    }

    /// Read the element at `index`.
    ///
    /// # Panics
    /// When `index` is out of bounds.
    pub fn get(&self, index: usize) -> T {
        assert!(
            index < self.len,
            "index {index} out of bounds for length {}",
            self.len
        );
        // Zeroed, not uninit: if the read is cut short the remaining bytes
        // are still a valid T.
        let mut value = MaybeUninit::<T>::zeroed();
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                value.as_mut_ptr() as *mut u8,
                std::mem::size_of::<T>(),
            )
        };
        self.vm.read_from_vaddr(self.element_addr(index), buf);
        unsafe { value.assume_init() }
    }

    /// Write the element at `index`.
    ///
    /// # Panics
    /// When `index` is out of bounds.
    pub fn set(&self, index: usize, value: T) {
        assert!(
            index < self.len,
            "index {index} out of bounds for length {}",
            self.len
        );
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &value as *const T as *const u8,
                std::mem::size_of::<T>(),
            )
        };
        self.vm.write_to_vaddr(self.element_addr(index), bytes);
    }

    /// Hint the whole view onto the device tier.
    pub fn prefetch_to_gpu(&self) {
        let page_size = match self.vm.page_size() {
            Some(size) => size,
            None => return,
        };
        let bytes = self.len * std::mem::size_of::<T>();
        let mut offset = 0usize;
        while offset < bytes.max(1) {
            self.vm.prefetch_to_gpu(self.vaddr + offset as u64);
            offset += page_size;
        }
    }
}

impl<T: PlainOldData> Drop for DeviceMapped<T> {
    fn drop(&mut self) {
        self.vm.free(self.vaddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;

    const PAGE: usize = 4096;

    fn vm() -> Arc<VmManager> {
        let config = VmConfig::default()
            .page_size(PAGE)
            .cpu_memory(64 * PAGE)
            .gpu_memory(16 * PAGE)
            .use_gpu_simulator(true);
        Arc::new(VmManager::with_config(config).unwrap())
    }

    #[test]
    fn set_and_get_elements() {
        let vm = vm();
        let view: DeviceMapped<u32> = DeviceMapped::new(Arc::clone(&vm), 1024, false).unwrap();
        assert_eq!(view.len(), 1024);

        view.set(0, 42);
        view.set(1, 99);
        view.set(1023, 7);

        assert_eq!(view.get(0), 42);
        assert_eq!(view.get(1), 99);
        assert_eq!(view.get(1023), 7);
    }

    #[test]
    fn elements_start_zeroed() {
        let vm = vm();
        let view: DeviceMapped<u64> = DeviceMapped::new(vm, 16, false).unwrap();
        assert_eq!(view.get(5), 0);
    }

    #[test]
    fn drop_releases_the_allocation() {
        let vm = vm();
        let used_before = vm.cpu_pages_used();
        {
            let view: DeviceMapped<u8> = DeviceMapped::new(Arc::clone(&vm), 2 * PAGE, false).unwrap();
            view.set(0, 1);
            assert!(vm.cpu_pages_used() > used_before);
        }
        assert_eq!(vm.cpu_pages_used(), used_before);
    }

    #[test]
    fn device_prefetch_on_construction() {
        let vm = vm();
        let view: DeviceMapped<f32> =
            DeviceMapped::new(Arc::clone(&vm), PAGE / 4, true).unwrap();
        assert_eq!(vm.gpu_pages_used(), 1);
        drop(view);
        assert_eq!(vm.gpu_pages_used(), 0);
    }

    #[test]
    fn prefetch_to_gpu_covers_every_page() {
        let vm = vm();
        let view: DeviceMapped<u8> = DeviceMapped::new(Arc::clone(&vm), 3 * PAGE, false).unwrap();
        view.prefetch_to_gpu();
        assert_eq!(vm.gpu_pages_used(), 3);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn get_out_of_bounds_panics() {
        let vm = vm();
        let view: DeviceMapped<u32> = DeviceMapped::new(vm, 4, false).unwrap();
        view.get(4);
    }

    #[test]
    fn spans_page_boundaries() {
        let vm = vm();
        // Element 512 of u64 starts at byte 4096: crosses into page 1.
        let view: DeviceMapped<u64> = DeviceMapped::new(vm, 1024, false).unwrap();
        view.set(511, u64::MAX);
        view.set(512, 0x0123_4567_89AB_CDEF);
        assert_eq!(view.get(511), u64::MAX);
        assert_eq!(view.get(512), 0x0123_4567_89AB_CDEF);
    }
}
