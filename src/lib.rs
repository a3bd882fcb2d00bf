// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod media;
pub mod provider;
pub mod queue;
pub mod relay;
pub mod rtsp;
pub mod sfu;
pub mod stats;
