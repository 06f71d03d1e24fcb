//! Supervision of language server sessions.
//!
//! The supervisor keeps at most one [`warden_lsp::ProtocolSession`] per
//! project and language in a [`SessionRegistry`]. Sessions start on first
//! use: concurrent requests for the same project and language share a single
//! startup, managed runtimes (the JVM-hosted BSL Language Server) are
//! prepared through [`warden_runtime::RuntimeManager`] before launch, and
//! sessions idle for longer than the configured window are shut down by a
//! background reaper.
//!
//! [`bootstrap_with`] wires configuration, structured telemetry and the
//! registry together and reports each stage through a [`HealthReporter`].

mod bootstrap;
pub mod catalog;
mod errors;
mod health;
mod registry;
mod telemetry;

pub use bootstrap::{
    BootstrapError, ConfigLoader, StaticConfigLoader, Supervisor, SystemConfigLoader, bootstrap,
    bootstrap_with,
};
pub use catalog::{BSL_DESCRIPTOR_ID, DescriptorCatalog};
pub use errors::RegistryError;
pub use health::{HealthReporter, StructuredHealthReporter};
pub use registry::{
    RegistryBuilder, RegistrySettings, ReleaseRegistryFactory, SessionKey, SessionRegistry,
    github_releases,
};
pub use telemetry::{TelemetryError, TelemetryHandle, initialise as initialise_telemetry};

#[cfg(test)]
mod tests;
