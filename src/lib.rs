#![recursion_limit = "256"]
//! Unsupervised domain adaptation for image classifiers.
//!
//! A labelled source domain and an unlabelled target domain are paired into
//! synchronized batches, fed through two independent feature branches, and
//! trained with a shared classifier head plus a CORAL penalty that pulls the
//! second-order statistics of both branches together.

pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod training;

pub use error::{Error, Result};
