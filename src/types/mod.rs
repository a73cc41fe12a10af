// ABOUTME: Core identifier and version types shared across the crate.
// ABOUTME: Phantom-typed IDs prevent mixing deployment and instance identifiers.

mod id;
mod version;

pub use id::{DeploymentId, Id, InstanceId};
pub use version::Version;
