//! Built-in server descriptors, one per supported language.

use std::collections::BTreeMap;
use std::sync::Arc;

use warden_lsp::{
    ArtifactSource, Feature, FeatureSet, Language, LaunchTemplate, ProjectConfigSpec,
    ServerDescriptor,
};
use warden_runtime::{ArtifactSpec, ReleaseSource};

/// Identifier of the BSL Language Server descriptor.
pub const BSL_DESCRIPTOR_ID: &str = "bsl-language-server";

/// Descriptors keyed by the language they serve.
#[derive(Debug, Clone, Default)]
pub struct DescriptorCatalog {
    descriptors: BTreeMap<Language, Arc<ServerDescriptor>>,
}

impl DescriptorCatalog {
    /// A catalog with no descriptors.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The descriptors Warden ships with.
    #[must_use]
    pub fn builtin() -> Self {
        Self::empty()
            .with(rust_analyzer())
            .with(pyrefly())
            .with(tsgo())
            .with(bsl_language_server())
    }

    /// Adds `descriptor`, replacing any other descriptor for its language.
    #[must_use]
    pub fn with(mut self, descriptor: ServerDescriptor) -> Self {
        self.descriptors
            .insert(descriptor.language(), Arc::new(descriptor));
        self
    }

    /// Descriptor serving `language`.
    #[must_use]
    pub fn get(&self, language: Language) -> Option<&Arc<ServerDescriptor>> {
        self.descriptors.get(&language)
    }

    /// Every descriptor, ordered by language.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerDescriptor>> + '_ {
        self.descriptors.values()
    }
}

fn features(list: &[Feature]) -> FeatureSet {
    list.iter().copied().collect()
}

fn on_path(
    id: &str,
    language: Language,
    executable: &str,
    args: &[&str],
    opted_in: &[Feature],
) -> ServerDescriptor {
    ServerDescriptor::new(
        id,
        language,
        LaunchTemplate::Direct {
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
        },
        ArtifactSource::OnPath {
            executable: executable.to_owned(),
        },
    )
    .with_opted_in(features(opted_in))
}

/// `rust-analyzer` from `PATH`.
#[must_use]
pub fn rust_analyzer() -> ServerDescriptor {
    on_path(
        "rust-analyzer",
        Language::Rust,
        "rust-analyzer",
        &[],
        &[
            Feature::Definition,
            Feature::References,
            Feature::DocumentSymbols,
            Feature::WorkspaceSymbols,
            Feature::Hover,
            Feature::Completion,
            Feature::Rename,
            Feature::Formatting,
            Feature::CallHierarchy,
        ],
    )
}

/// `pyrefly lsp` from `PATH`.
#[must_use]
pub fn pyrefly() -> ServerDescriptor {
    on_path(
        "pyrefly",
        Language::Python,
        "pyrefly",
        &["lsp"],
        &[
            Feature::Definition,
            Feature::References,
            Feature::DocumentSymbols,
            Feature::Hover,
            Feature::Completion,
        ],
    )
}

/// `tsgo --lsp` from `PATH`.
#[must_use]
pub fn tsgo() -> ServerDescriptor {
    on_path(
        "tsgo",
        Language::TypeScript,
        "tsgo",
        &["--lsp", "--stdio"],
        &[
            Feature::Definition,
            Feature::References,
            Feature::DocumentSymbols,
            Feature::Hover,
        ],
    )
}

/// The JVM-hosted BSL Language Server, downloaded from its GitHub releases.
///
/// Launched as `java -Xmx<memory> <options> -jar <artifact>`, with the
/// project's `.bsl-language-server.json` forwarded through
/// `--configuration` and the Russian locale sent during `initialize`.
#[must_use]
pub fn bsl_language_server() -> ServerDescriptor {
    let artifact = ArtifactSpec::new(
        "bsl-language-server-",
        "-exec.jar",
        ReleaseSource::github("1c-syntax", "bsl-language-server"),
    );
    ServerDescriptor::new(
        BSL_DESCRIPTOR_ID,
        Language::Bsl,
        LaunchTemplate::Jvm { args: Vec::new() },
        ArtifactSource::Managed(artifact),
    )
    .with_opted_in(features(&[
        Feature::Definition,
        Feature::References,
        Feature::DocumentSymbols,
        Feature::WorkspaceSymbols,
        Feature::Hover,
        Feature::Diagnostics,
    ]))
    .with_project_config(ProjectConfigSpec {
        file_name: String::from(".bsl-language-server.json"),
        flag: String::from("--configuration"),
    })
    .with_default_memory("2G")
    .with_locale("ru")
}
