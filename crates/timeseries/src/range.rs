//! Interval arithmetic for the copy planner. Outer (block) ranges tile the
//! copy interval at block-split width; inner (query) ranges tile one outer
//! range at query-split width, aligned to that range's start.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error(
        "query split {query_split_ms}ms must evenly divide the native block duration \
         {native_ms}ms, try {suggest_ms}ms"
    )]
    MisalignedQuerySplit {
        query_split_ms: i64,
        native_ms: i64,
        suggest_ms: i64,
    },
    #[error(
        "block split {block_split_ms}ms must be a multiple of the native block duration \
         {native_ms}ms, try {suggest_ms}ms"
    )]
    MisalignedBlockSplit {
        block_split_ms: i64,
        native_ms: i64,
        suggest_ms: i64,
    },
    #[error("query split must be positive, got {0}ms")]
    NonPositiveQuerySplit(i64),
    #[error("start time {mint_ms}ms is after end time {maxt_ms}ms")]
    InvertedInterval { mint_ms: i64, maxt_ms: i64 },
}

/// Half-open ranges `[t0, t1)` of `block_split` width tiling `[mint, maxt)`,
/// the last truncated to `maxt`. A zero split falls back to the native block
/// duration.
pub fn block_ranges(
    mint: i64,
    maxt: i64,
    block_split: i64,
    native: i64,
) -> impl Iterator<Item = (i64, i64)> {
    let split = if block_split == 0 { native } else { block_split };
    (mint..maxt)
        .step_by(split as usize)
        .map(move |t0| (t0, maxt.min(t0 + split)))
}

/// Query-aligned subranges of one outer range. Alignment starts at the outer
/// range's `mint`; there is no grid shared across outer ranges.
pub fn query_ranges(mint: i64, maxt: i64, query_split: i64) -> impl Iterator<Item = (i64, i64)> {
    (mint..maxt)
        .step_by(query_split as usize)
        .map(move |t0| (t0, maxt.min(t0 + query_split)))
}

/// Normalizes the two split widths against the native block duration,
/// clamping where the original tool clamped and failing with a remedial
/// suggestion where no clamp applies. Returns `(query_split, block_split)`.
///
/// * `query_split` wider than half a native block is clamped down to `D/2`;
///   otherwise it must evenly divide `D`.
/// * `block_split <= 0` is passed through as 0 (one block per copy,
///   compaction disabled); a positive value narrower than `D` is widened to
///   `D`; anything wider must be a multiple of `D`.
pub fn validate_splits(
    query_split: i64,
    block_split: i64,
    native: i64,
) -> Result<(i64, i64), PlanError> {
    let query_split = if query_split <= 0 {
        return Err(PlanError::NonPositiveQuerySplit(query_split));
    } else if query_split > native / 2 {
        native / 2
    } else if native % query_split != 0 {
        return Err(PlanError::MisalignedQuerySplit {
            query_split_ms: query_split,
            native_ms: native,
            suggest_ms: native / (native / query_split),
        });
    } else {
        query_split
    };
    Ok((query_split, validate_block_split(block_split, native)?))
}

/// The block-split half of [`validate_splits`], standalone for the compact
/// path which has no query split.
pub fn validate_block_split(block_split: i64, native: i64) -> Result<i64, PlanError> {
    if block_split <= 0 {
        Ok(0)
    } else if block_split < native {
        Ok(native)
    } else if block_split % native != 0 {
        Err(PlanError::MisalignedBlockSplit {
            block_split_ms: block_split,
            native_ms: native,
            suggest_ms: (block_split / native + 1) * native,
        })
    } else {
        Ok(block_split)
    }
}
