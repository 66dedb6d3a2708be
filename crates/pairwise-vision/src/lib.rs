//! # pairwise-vision
//!
//! Client for the external vision similarity service.
//!
//! - [`VisionClient`] implements [`pairwise_core::SimilarityMatcher`] over
//!   the service's v2 API with automatic fallback to v1.
//! - [`matches`] turns raw search responses into thresholded candidates.
//! - [`modes`] translates match-mode names between wire versions.

pub mod client;
pub mod config;
pub mod matches;
pub mod modes;

pub use client::{bearer_header, VisionClient};
pub use config::VisionConfig;
pub use matches::{extract_matches, MatchThresholds, VisionMatch};
pub use modes::{is_known_mode, normalize_legacy_mode, to_v2_mode};
