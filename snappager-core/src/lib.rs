//! Snappager Core Library
//!
//! Userfaultfd demand-paging engine for restoring microVM snapshots.
//! Provides the kernel ABI codec, the handshake with the hypervisor,
//! per-VM fault handlers, shared page population (eager or lazy from a
//! content-addressed chunk store) and the poll-driven runtime.

pub mod chunk;
pub mod config;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod memory;
pub mod pager;
pub mod reactor;
pub mod runtime;
pub mod tracer;
pub mod types;
pub mod uffd;
pub mod working_set;

// Re-export commonly used types
pub use chunk::{ChunkCache, ChunkStore, DirChunkStore};
pub use config::{ConfigLoader, PagerConfig, RawPagerConfig};
pub use error::{HandshakeError, HardValidationError, PagerError, PagerResult};
pub use handler::UffdHandler;
pub use pager::{BackingSource, PageOperations};
pub use runtime::{start_uffd_handler, start_uffd_handler_with_peer, PeerProcess, Runtime};
pub use tracer::PageFaultTracer;
pub use types::{ChunkHash, PageSize, Region};
pub use working_set::WorkingSet;
