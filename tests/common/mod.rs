//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - Block and payload builders with plausible record headers
//! - A mock upstream that records repair requests
//! - Wire helpers for talking to a live endpoint

#![allow(dead_code)]

pub mod blocks;
pub mod mock_upstream;

#[allow(unused_imports)]
pub use blocks::*;
#[allow(unused_imports)]
pub use mock_upstream::*;
