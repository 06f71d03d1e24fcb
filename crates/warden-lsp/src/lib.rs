//! Language server protocol sessions for the Warden supervisor.
//!
//! The crate models the servers Warden knows how to run as
//! [`ServerDescriptor`] values and drives each running server through a
//! [`ProtocolSession`]: spawn, `initialize` handshake, capability
//! negotiation, request correlation, crash detection with bounded restarts,
//! and orderly shutdown. Features are exposed only when the server reports
//! them and the descriptor opts into them; see [`CapabilityFlags`].

pub mod capability;
pub mod descriptor;
mod errors;
mod language;
pub mod session;

pub use capability::{
    CapabilityFlags, Feature, FeatureFlag, FeatureParseError, FeatureSet, FeatureUnavailable,
    Gated, UnavailableReason,
};
pub use descriptor::{
    ArtifactSource, LaunchContext, LaunchTemplate, ProjectConfigSpec, ServerDescriptor,
};
pub use errors::{SessionError, StartupError, TransportError};
pub use language::{Language, LanguageParseError};
pub use session::{
    LaunchCommand, PendingRequest, ProcessSpawner, ProtocolSession, ServerNotification,
    ServerProcess, ServerSpawner, SessionConfig, SessionOptions, SessionState, SpawnedServer,
    TerminationCause, TerminationHook, TerminationReport, file_uri, java_executable,
};

#[cfg(test)]
mod tests;
