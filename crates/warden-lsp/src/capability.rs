//! Capability gate: a feature is exposed only when the server reports it and
//! the descriptor has opted in to it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

/// Optional protocol feature guarded by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    /// `textDocument/definition`.
    Definition,
    /// `textDocument/references`.
    References,
    /// `textDocument/documentSymbol`.
    DocumentSymbols,
    /// `workspace/symbol`.
    WorkspaceSymbols,
    /// `textDocument/hover`.
    Hover,
    /// `textDocument/completion`.
    Completion,
    /// Pull diagnostics via `textDocument/diagnostic`.
    Diagnostics,
    /// `textDocument/rename`.
    Rename,
    /// `textDocument/formatting`.
    Formatting,
    /// `textDocument/prepareCallHierarchy` and related requests.
    CallHierarchy,
}

impl Feature {
    /// Every gated feature.
    pub const ALL: [Self; 10] = [
        Self::Definition,
        Self::References,
        Self::DocumentSymbols,
        Self::WorkspaceSymbols,
        Self::Hover,
        Self::Completion,
        Self::Diagnostics,
        Self::Rename,
        Self::Formatting,
        Self::CallHierarchy,
    ];

    /// Stable dotted identifier used in descriptors and logs.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Definition => "observe.get-definition",
            Self::References => "observe.find-references",
            Self::DocumentSymbols => "observe.document-symbols",
            Self::WorkspaceSymbols => "observe.workspace-symbols",
            Self::Hover => "observe.hover",
            Self::Completion => "observe.completion",
            Self::Diagnostics => "verify.diagnostics",
            Self::Rename => "act.rename",
            Self::Formatting => "act.format",
            Self::CallHierarchy => "observe.call-hierarchy",
        }
    }

    /// Field of `ServerCapabilities` that advertises the feature.
    #[must_use]
    pub const fn server_capability(self) -> &'static str {
        match self {
            Self::Definition => "definitionProvider",
            Self::References => "referencesProvider",
            Self::DocumentSymbols => "documentSymbolProvider",
            Self::WorkspaceSymbols => "workspaceSymbolProvider",
            Self::Hover => "hoverProvider",
            Self::Completion => "completionProvider",
            Self::Diagnostics => "diagnosticProvider",
            Self::Rename => "renameProvider",
            Self::Formatting => "documentFormattingProvider",
            Self::CallHierarchy => "callHierarchyProvider",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.key())
    }
}

/// Raised when a feature key is not recognised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown feature '{0}'")]
pub struct FeatureParseError(String);

impl FromStr for Feature {
    type Err = FeatureParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalised = input.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|feature| feature.key() == normalised)
            .ok_or(FeatureParseError(normalised))
    }
}

/// Set of features, used for descriptor opt-ins and reported features.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet(BTreeSet<Feature>);

impl FeatureSet {
    /// A set holding every feature.
    #[must_use]
    pub fn all() -> Self {
        Feature::ALL.into_iter().collect()
    }

    /// Whether `feature` is a member.
    #[must_use]
    pub fn contains(&self, feature: Feature) -> bool {
        self.0.contains(&feature)
    }

    /// Adds `feature`.
    pub fn insert(&mut self, feature: Feature) {
        self.0.insert(feature);
    }

    /// Iterates members in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.0.iter().copied()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Features a server advertises in its `ServerCapabilities` object.
    ///
    /// A provider counts as reported when present and neither `null` nor
    /// `false`; option objects and `true` both qualify.
    #[must_use]
    pub fn reported_by(server_capabilities: &Value) -> Self {
        Feature::ALL
            .into_iter()
            .filter(|feature| {
                !matches!(
                    server_capabilities.get(feature.server_capability()),
                    None | Some(Value::Null | Value::Bool(false))
                )
            })
            .collect()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Why a feature is not exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The descriptor opted in but the server did not report it.
    NotReported,
    /// The server reported it but the descriptor has not validated it.
    NotOptedIn,
    /// Neither signal is present.
    NotReportedNorOptedIn,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotReported => "not reported by the server",
            Self::NotOptedIn => "not opted in by the descriptor",
            Self::NotReportedNorOptedIn => "neither reported nor opted in",
        };
        formatter.write_str(label)
    }
}

/// Typed outcome for a closed gate. Not an error: callers degrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureUnavailable {
    /// Feature that was requested.
    pub feature: Feature,
    /// Why it is unavailable.
    pub reason: UnavailableReason,
}

impl fmt::Display for FeatureUnavailable {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} is unavailable: {}", self.feature, self.reason)
    }
}

/// Result of a gated operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Gated<T> {
    /// The gate was open and the operation ran.
    Available(T),
    /// The gate was closed; nothing was sent to the server.
    Unavailable(FeatureUnavailable),
}

impl<T> Gated<T> {
    /// Returns the value, or `fallback` when the feature was unavailable.
    pub fn unwrap_or(self, fallback: T) -> T {
        match self {
            Self::Available(value) => value,
            Self::Unavailable(_) => fallback,
        }
    }
}

/// The two signals recorded for one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureFlag {
    /// The server said it can.
    pub reported: bool,
    /// The descriptor says this is trustworthy.
    pub opted_in: bool,
}

impl FeatureFlag {
    /// Whether the feature is exposed.
    #[must_use]
    pub const fn is_exposed(self) -> bool {
        self.reported && self.opted_in
    }
}

/// Per-feature flags frozen at handshake completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityFlags {
    flags: BTreeMap<Feature, FeatureFlag>,
}

impl CapabilityFlags {
    /// Combines reported and opted-in features.
    #[must_use]
    pub fn new(reported: &FeatureSet, opted_in: &FeatureSet) -> Self {
        let flags = Feature::ALL
            .into_iter()
            .map(|feature| {
                let flag = FeatureFlag {
                    reported: reported.contains(feature),
                    opted_in: opted_in.contains(feature),
                };
                (feature, flag)
            })
            .collect();
        Self { flags }
    }

    /// Computes flags from the `capabilities` object of an initialize result.
    #[must_use]
    pub fn negotiate(server_capabilities: &Value, opted_in: &FeatureSet) -> Self {
        Self::new(&FeatureSet::reported_by(server_capabilities), opted_in)
    }

    /// Flags recorded for `feature`.
    #[must_use]
    pub fn flag(&self, feature: Feature) -> FeatureFlag {
        self.flags.get(&feature).copied().unwrap_or_default()
    }

    /// Opens or closes the gate for `feature`.
    ///
    /// # Errors
    ///
    /// Returns [`FeatureUnavailable`] naming which signal is missing.
    pub fn check(&self, feature: Feature) -> Result<(), FeatureUnavailable> {
        let reason = match self.flag(feature) {
            FeatureFlag {
                reported: true,
                opted_in: true,
            } => return Ok(()),
            FeatureFlag {
                reported: false,
                opted_in: true,
            } => UnavailableReason::NotReported,
            FeatureFlag {
                reported: true,
                opted_in: false,
            } => UnavailableReason::NotOptedIn,
            FeatureFlag {
                reported: false,
                opted_in: false,
            } => UnavailableReason::NotReportedNorOptedIn,
        };
        Err(FeatureUnavailable { feature, reason })
    }

    /// Whether `feature` is exposed.
    #[must_use]
    pub fn is_available(&self, feature: Feature) -> bool {
        self.flag(feature).is_exposed()
    }

    /// Every exposed feature.
    #[must_use]
    pub fn exposed(&self) -> FeatureSet {
        self.flags
            .iter()
            .filter(|(_, flag)| flag.is_exposed())
            .map(|(feature, _)| *feature)
            .collect()
    }
}
