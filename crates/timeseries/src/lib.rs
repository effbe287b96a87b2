//! Core time series model shared by the block store and the copy pipeline:
//! labels, matchers, samples, and the interval arithmetic that slices a copy
//! into block-aligned and query-aligned ranges.

pub mod labels;
pub mod matchers;
pub mod range;
pub mod sample;

pub use labels::{
    Label,
    Labels,
};
pub use matchers::{
    MatchType,
    Matcher,
};
pub use range::{
    block_ranges,
    query_ranges,
    validate_block_split,
    validate_splits,
    PlanError,
};
pub use sample::{
    Sample,
    Series,
};
