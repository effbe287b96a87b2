//! Client side of the Prometheus remote read protocol: one snappy-compressed
//! protobuf request per query window, plus the JSON label-values side channel
//! used to enumerate tenants.

pub mod client;
pub mod protos;

pub use client::{
    LabelValuesClient,
    ReadClient,
    DEFAULT_READ_TIMEOUT,
};
