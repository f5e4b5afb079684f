//! Rategate - Sliding Window Rate Limiting Gate
//!
//! This crate implements the rate limiting stage that sits in front of the
//! athlete/scout platform API. Request counts live in a shared Redis store so
//! every instance enforces the same quota, with an in-process fallback that
//! keeps the gate enforcing while the store is unreachable.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
