//! # meshfs Testkit
//!
//! Testing utilities for meshfs.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Generators**: Proptest strategies for paths, version vectors and
//!   metadata store operations
//! - **Fixtures**: Nodes running on loopback in throwaway data directories
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use meshfs_testkit::generators::{messy_path, tree_path};
//!
//! proptest! {
//!     #[test]
//!     fn normalize_is_idempotent(path in messy_path()) {
//!         let once = meshfs_core::normalize(&path).unwrap();
//!         prop_assert_eq!(meshfs_core::normalize(&once).unwrap(), once);
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use meshfs_testkit::fixtures::{wait_for_peers, TestNode};
//!
//! async fn example() {
//!     let a = TestNode::spawn("a").await;
//!     let b = TestNode::spawn("b").await;
//!     a.node.connect(b.addr()).await.unwrap();
//!     wait_for_peers(&b.node, 1).await;
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{test_config, wait_for_peers, wait_until, TestNode};
