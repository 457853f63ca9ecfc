//! Resource-map construction, allocation policy, and compute-server
//! supervision for a GPU sharing device plugin. See each module for the
//! corresponding part of the design.

pub mod allocator;
pub mod annotated_id;
pub mod config;
pub mod device;
pub mod error;
pub mod health;
pub mod readiness;
pub mod resource;
pub mod signal;
pub mod supervisor;

pub use annotated_id::AnnotatedId;
pub use config::Configuration;
pub use error::CoreError;
pub use resource::{Resource, ResourceMap};
