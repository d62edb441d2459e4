//! Descriptor model and blueprint derivation for the holotree cache.
//!
//! This crate is the pure half of htc: parsing and merging declarative
//! environment manifests, rendering them to a canonical form, and deriving
//! the blueprint fingerprint that keys everything else. All filesystem and
//! process work lives in `htc-core`.

mod blueprint;
mod descriptor;
mod error;

pub use blueprint::{compose_final_blueprint, short_identity, user_home_identity, Blueprint};
pub use descriptor::{Descriptor, Requirement};
pub use error::DescriptorError;
