//! # uvmsim-core
//!
//! User-space unified virtual memory simulator: one virtual address space
//! backed by a host tier and a (typically smaller) accelerator tier, with
//! transparent on-demand page migration between them.
//!
//! Applications allocate virtual ranges, read and write through virtual
//! addresses, and optionally hint residency (touch, prefetch). The engine
//! resolves residency faults, migrates page contents, evicts victims when
//! the accelerator tier fills up, and exposes monotonic performance
//! counters.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         VmManager                            |
//! |   allocate / free / touch / read / write / map_* / prefetch  |
//! +------+----------+---------+----------+----------------------+
//!        |          |         |          |
//!        v          v         v          v
//!   PageTable   PageAllocator  TLB   ReplacementPolicy
//!   VPN→entry   host + device  set-  LRU | CLOCK
//!   residency   bitmap pools   assoc
//!        |
//!        v
//!   MigrationManager: sync + queued async page copies
//! ```
//!
//! # Example
//!
//! ```
//! use uvmsim_core::{VmConfig, VmManager};
//!
//! let config = VmConfig::default()
//!     .page_size(4096)
//!     .cpu_memory(64 * 4096)
//!     .gpu_memory(16 * 4096)
//!     .use_gpu_simulator(true);
//! let vm = VmManager::with_config(config).unwrap();
//!
//! let vaddr = vm.allocate(8 * 1024, false).unwrap();
//! vm.write_to_vaddr(vaddr, b"hello tiers");
//!
//! let mut buf = [0u8; 11];
//! vm.read_from_vaddr(vaddr, &mut buf);
//! assert_eq!(&buf, b"hello tiers");
//!
//! vm.free(vaddr);
//! ```

pub mod allocator;
pub mod config;
pub mod counters;
pub mod error;
pub mod manager;
pub mod mapped;
pub mod migration;
pub mod page_table;
pub mod policy;
pub mod tlb;
pub mod types;

pub use allocator::{AllocatorConfig, PageAllocator};
pub use config::{ReplacementPolicyKind, VmConfig};
pub use counters::{PerfCounters, PerfSnapshot};
pub use error::{Result, UvmError};
pub use manager::VmManager;
pub use mapped::{DeviceMapped, PlainOldData};
pub use migration::{MigrationConfig, MigrationManager};
pub use page_table::{PageEntry, PageTable};
pub use policy::{build_policy, ClockPolicy, LruPolicy, ReplacementPolicy};
pub use tlb::{Tlb, TlbConfig, TlbEntry};
pub use types::{Address, PageResidency, Vpn, GPU_ADDRESS_BASE};
