//! The copy and compaction pipeline: interval planning, per-tenant block
//! writing with commit batching, bounded append/flush fleets, post-copy
//! compaction, verification, and the optional object-store metadata pass.

pub mod compactor;
pub mod copy;
pub mod metrics;
pub mod pool;
pub mod router;
pub mod source;
pub mod thanos;
pub mod writer;

pub use copy::{
    run_copy,
    CopyOptions,
    CopySummary,
    DEFAULT_COMMIT_COUNT,
};
pub use remote_read::DEFAULT_READ_TIMEOUT;
pub use source::{
    is_remote,
    open_source,
    Source,
};
pub use writer::TenantResult;
