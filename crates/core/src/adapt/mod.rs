//! Mesh adaptation
//!
//! - `wavelet`: wavelet error estimator and the refine/coarsen pass

pub mod wavelet;

pub use wavelet::{AdaptConfig, AdaptCriterion, AdaptReport, WaveletEstimator};
