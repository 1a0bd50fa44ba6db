//! Utilities for predictable, allocation-free timing code.
//!
//! This crate provides the small building blocks the receiver engine is made of:
//!
//! - [`time`]: a monotonic local clock in nanosecond ticks, and conversions to and from
//!   [`std::time::Instant`].
//! - [`wrap`]: signed "who is ahead" distances between values of modular counters, like RTP
//!   frame timestamps and wall-clock ticks.
//! - [`stats`]: single-pass mean/variance/max accumulation for diagnostics.
//! - [`queue`]: periodic counters and ring-buffer re-exports.
//!
//! None of these allocate or lock after initialization, so they can be used from
//! real-time threads.

pub mod queue;
pub mod stats;
pub mod time;
pub mod wrap;
