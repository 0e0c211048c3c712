//! Image acquisition for auction lots: walk a chain of fetch strategies per
//! lot, normalize what comes back, store it, and fall back to a synthesized
//! placeholder so every lot ends with an image or an explicit failure.

pub mod acquisition;
pub mod config;
pub mod http;
pub mod lots;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod storage;
pub mod strategy;
