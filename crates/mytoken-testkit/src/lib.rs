//! # mytoken testkit
//!
//! Testing utilities for mytoken.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a service over an in-memory store with a scripted identity
//!   provider and a controllable clock
//! - **Generators**: Proptest strategies for capabilities and restrictions
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use mytoken_testkit::fixtures::TestFixture;
//! use mytoken_core::{Capability, CapabilitySet};
//!
//! async fn example() {
//!     let fixture = TestFixture::new();
//!     let token = fixture
//!         .root_mytoken(CapabilitySet::from([Capability::AccessToken]), vec![])
//!         .await;
//!     fixture.advance(60);
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use mytoken_testkit::generators::{capability_set, restriction};
//!
//! proptest! {
//!     #[test]
//!     fn restrictions_validate(r in restriction()) {
//!         prop_assert!(r.validate().is_ok());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{client_at, test_config, MockProvider, RefreshCall, TestFixture};
