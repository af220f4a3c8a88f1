//! External service integrations.

pub mod registry_client;

pub use registry_client::{HttpRegistryClient, RegistryClientBuildError, RegistryCredential};
