//! Core domain types for barrage.
//!
//! This module contains pure domain types with no persistence or network dependencies:
//! - Requests and request sets
//! - Batches, providers and batch states
//! - Lifecycle records
//! - Raw and reconciled outcomes

pub mod batch;
pub mod outcome;
pub mod record;
pub mod request;
