//! Hourly pageview dump pipeline: fetch each dump, keep the most viewed pages
//! per site, write a small summary and discard the raw file.

pub mod analysis;
pub mod config;
pub mod download;
pub mod handoff;
pub mod pipeline;
pub mod records;
pub mod schedule;
pub mod signals;
pub mod stats;
pub mod topk;
