//! Manager configuration

use tracing::Level;

use crate::error::UvmError;

/// Default page size: 64 KiB.
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;
/// Default virtual address space: 256 GiB. Bounds the VPN count; never
/// densely materialized.
pub const DEFAULT_VIRTUAL_ADDRESS_SPACE: usize = 256 * 1024 * 1024 * 1024;
/// Default host pool: 8 GiB.
pub const DEFAULT_CPU_MEMORY: usize = 8 * 1024 * 1024 * 1024;
/// Default accelerator pool: 4 GiB.
pub const DEFAULT_GPU_MEMORY: usize = 4 * 1024 * 1024 * 1024;
/// Default TLB capacity in entries.
pub const DEFAULT_TLB_SIZE: usize = 1024;
/// Default TLB associativity.
pub const DEFAULT_TLB_ASSOCIATIVITY: usize = 8;

/// Replacement policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicyKind {
    /// Evict the least recently used resident.
    Lru,
    /// Second-chance ring with reference bits.
    Clock,
}

impl std::fmt::Display for ReplacementPolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplacementPolicyKind::Lru => write!(f, "LRU"),
            ReplacementPolicyKind::Clock => write!(f, "CLOCK"),
        }
    }
}

/// Configuration for a [`VmManager`](crate::VmManager) instance.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Page size in bytes. Process-wide constant for the instance.
    pub page_size: usize,
    /// Virtual address space size in bytes.
    pub virtual_address_space: usize,
    /// Host pool size in bytes.
    pub cpu_memory: usize,
    /// Accelerator pool size in bytes.
    pub gpu_memory: usize,
    /// Total TLB entries.
    pub tlb_size: usize,
    /// TLB entries per set.
    pub tlb_associativity: usize,
    /// Victim selection policy for accelerator eviction.
    pub replacement_policy: ReplacementPolicyKind,
    /// Advisory: request page-locked host memory where available.
    pub use_pinned_memory: bool,
    /// Back the accelerator tier with a host buffer so migrations move
    /// real bytes.
    pub use_gpu_simulator: bool,
    /// Honor the `prefetch_to_gpu` argument of `allocate`.
    pub enable_prefetch: bool,
    /// Log level the embedding application should install a subscriber at.
    pub log_level: Level,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            virtual_address_space: DEFAULT_VIRTUAL_ADDRESS_SPACE,
            cpu_memory: DEFAULT_CPU_MEMORY,
            gpu_memory: DEFAULT_GPU_MEMORY,
            tlb_size: DEFAULT_TLB_SIZE,
            tlb_associativity: DEFAULT_TLB_ASSOCIATIVITY,
            replacement_policy: ReplacementPolicyKind::Lru,
            use_pinned_memory: true,
            use_gpu_simulator: false,
            enable_prefetch: true,
            log_level: Level::INFO,
        }
    }
}

impl VmConfig {
    /// Set the page size.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Set the host pool size.
    pub fn cpu_memory(mut self, bytes: usize) -> Self {
        self.cpu_memory = bytes;
        self
    }

    /// Set the accelerator pool size.
    pub fn gpu_memory(mut self, bytes: usize) -> Self {
        self.gpu_memory = bytes;
        self
    }

    /// Set the replacement policy.
    pub fn replacement_policy(mut self, kind: ReplacementPolicyKind) -> Self {
        self.replacement_policy = kind;
        self
    }

    /// Enable or disable the simulated accelerator backing.
    pub fn use_gpu_simulator(mut self, enabled: bool) -> Self {
        self.use_gpu_simulator = enabled;
        self
    }

    /// Set the log level the embedding application should honor.
    pub fn log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), UvmError> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(UvmError::InvalidConfig(format!(
                "page size must be a nonzero power of two, got {}",
                self.page_size
            )));
        }
        if self.cpu_memory < self.page_size {
            return Err(UvmError::InvalidConfig(
                "host pool must hold at least one page".to_string(),
            ));
        }
        if self.gpu_memory < self.page_size {
            return Err(UvmError::InvalidConfig(
                "accelerator pool must hold at least one page".to_string(),
            ));
        }
        if self.virtual_address_space < self.page_size {
            return Err(UvmError::InvalidConfig(
                "virtual address space smaller than one page".to_string(),
            ));
        }
        if self.tlb_associativity == 0 {
            return Err(UvmError::InvalidConfig(
                "TLB associativity must be nonzero".to_string(),
            ));
        }
        if self.tlb_size < self.tlb_associativity || self.tlb_size % self.tlb_associativity != 0 {
            return Err(UvmError::InvalidConfig(format!(
                "TLB size {} must be a multiple of associativity {}",
                self.tlb_size, self.tlb_associativity
            )));
        }
        Ok(())
    }
}
