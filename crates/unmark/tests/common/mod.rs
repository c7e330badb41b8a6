//! Shared test utilities for unmark integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated services and batches in temp directories
//! - Transform stubs with scripted, gated, failing and counting behaviour
//! - `wait_until` for polling asynchronous outcomes

pub mod harness;
pub mod transforms;

pub use harness::{wait_until, TestHarness};
pub use transforms::*;
