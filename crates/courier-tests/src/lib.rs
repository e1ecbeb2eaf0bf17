//! Courier Integration Tests
//!
//! End-to-end scenarios run against the in-memory broker and store.
//! Run with: `cargo test -p courier-tests`
//!
//! For tests that require Redis:
//! ```sh
//! docker run -d -p 6379:6379 redis:7-alpine
//! cargo test -p courier-tests -- --ignored
//! ```

pub mod common;
