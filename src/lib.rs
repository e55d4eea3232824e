//! Windowed performance-trace aggregation and upload pipeline.
//!
//! Host threads push [`source::event::RawEvent`]s into a
//! [`pipeline::Pipeline`]; events are folded into fixed wall-clock windows,
//! kept in a bounded local store for querying, and shipped to a remote
//! collector with retries.

pub mod aggregate;
pub mod clock;
pub mod config;
pub mod encode;
pub mod export;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod upload;
