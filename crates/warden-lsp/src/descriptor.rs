//! Static identity of a language server kind.

use std::path::{Path, PathBuf};

use serde_json::Value;
use warden_config::LanguageSettings;
use warden_runtime::ArtifactSpec;

use crate::capability::FeatureSet;
use crate::errors::StartupError;
use crate::language::Language;
use crate::session::{LaunchCommand, java_executable};

/// Where the server's runtime comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// Downloaded and kept current by the runtime manager.
    Managed(ArtifactSpec),
    /// Installed by the user and found on `PATH`; never updated.
    OnPath {
        /// Executable name or path.
        executable: String,
    },
}

/// How the process command line is assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTemplate {
    /// Runs the executable directly: `<program> <args> <launch options>`.
    Direct {
        /// Fixed arguments.
        args: Vec<String>,
    },
    /// Runs a managed jar:
    /// `java -Xmx<memory> <launch options> -jar <artifact> <args>`.
    Jvm {
        /// Fixed arguments placed after the jar.
        args: Vec<String>,
    },
}

/// Server-specific project configuration file forwarded at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfigSpec {
    /// Well-known file name looked up in the project root.
    pub file_name: String,
    /// Flag that precedes the path on the command line.
    pub flag: String,
}

/// Inputs that vary per launch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    /// Project root, used as the working directory.
    pub workspace: &'a Path,
    /// Resolved runtime artifact, for managed descriptors.
    pub artifact: Option<&'a Path>,
    /// Per-language settings from configuration.
    pub settings: &'a LanguageSettings,
    /// `JAVA_HOME`, when set.
    pub java_home: Option<&'a Path>,
}

/// Immutable identity of a language server kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    id: String,
    language: Language,
    launch: LaunchTemplate,
    artifact: ArtifactSource,
    opted_in: FeatureSet,
    project_config: Option<ProjectConfigSpec>,
    default_memory: Option<String>,
    locale: Option<String>,
    initialization_options: Option<Value>,
}

impl ServerDescriptor {
    /// Creates a descriptor with no opted-in features.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        language: Language,
        launch: LaunchTemplate,
        artifact: ArtifactSource,
    ) -> Self {
        Self {
            id: id.into(),
            language,
            launch,
            artifact,
            opted_in: FeatureSet::default(),
            project_config: None,
            default_memory: None,
            locale: None,
            initialization_options: None,
        }
    }

    /// Sets the validated feature set.
    #[must_use]
    pub fn with_opted_in(mut self, features: FeatureSet) -> Self {
        self.opted_in = features;
        self
    }

    /// Declares a project configuration file.
    #[must_use]
    pub fn with_project_config(mut self, spec: ProjectConfigSpec) -> Self {
        self.project_config = Some(spec);
        self
    }

    /// Sets the memory budget used when configuration supplies none.
    #[must_use]
    pub fn with_default_memory(mut self, memory: impl Into<String>) -> Self {
        self.default_memory = Some(memory.into());
        self
    }

    /// Sets the locale sent in `initialize`.
    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// Sets `initializationOptions` sent in `initialize`.
    #[must_use]
    pub fn with_initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    /// Stable identifier, also the runtime directory name.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Language served.
    #[must_use]
    pub const fn language(&self) -> Language {
        self.language
    }

    /// Runtime source.
    #[must_use]
    pub const fn artifact(&self) -> &ArtifactSource {
        &self.artifact
    }

    /// Managed artifact spec, when the runtime is downloaded.
    #[must_use]
    pub const fn managed_artifact(&self) -> Option<&ArtifactSpec> {
        match &self.artifact {
            ArtifactSource::Managed(spec) => Some(spec),
            ArtifactSource::OnPath { .. } => None,
        }
    }

    /// Features validated for this server kind.
    #[must_use]
    pub const fn opted_in(&self) -> &FeatureSet {
        &self.opted_in
    }

    /// Locale for `initialize`.
    #[must_use]
    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    /// `initializationOptions` for `initialize`.
    #[must_use]
    pub const fn initialization_options(&self) -> Option<&Value> {
        self.initialization_options.as_ref()
    }

    /// Resolves the project configuration file.
    ///
    /// An explicit setting wins (relative paths resolve against the
    /// workspace); otherwise the well-known file is used when it exists in
    /// the project root as a regular file.
    #[must_use]
    pub fn project_config_file(
        &self,
        workspace: &Path,
        settings: &LanguageSettings,
    ) -> Option<PathBuf> {
        if let Some(explicit) = &settings.config_file {
            let path = Path::new(explicit.as_str());
            return Some(if path.is_absolute() {
                path.to_path_buf()
            } else {
                workspace.join(path)
            });
        }
        let spec = self.project_config.as_ref()?;
        let candidate = workspace.join(&spec.file_name);
        candidate.is_file().then_some(candidate)
    }

    /// Builds the command that launches this server.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::ArtifactMissing`] when a managed descriptor is
    /// launched without a resolved artifact.
    pub fn launch_command(
        &self,
        context: &LaunchContext<'_>,
    ) -> Result<LaunchCommand, StartupError> {
        let settings = context.settings;
        let passthrough = settings.launch_options_without_memory();
        let mut command = match (&self.launch, &self.artifact) {
            (LaunchTemplate::Direct { args }, ArtifactSource::OnPath { executable }) => {
                LaunchCommand::new(executable, context.workspace)
                    .with_args(args.iter().cloned())
                    .with_args(settings.launch_options.iter().cloned())
            }
            (LaunchTemplate::Direct { args }, ArtifactSource::Managed(_)) => {
                LaunchCommand::new(self.require_artifact(context)?, context.workspace)
                    .with_args(args.iter().cloned())
                    .with_args(settings.launch_options.iter().cloned())
            }
            (LaunchTemplate::Jvm { args }, _) => {
                let artifact = self.require_artifact(context)?;
                let memory = settings.memory_budget(self.default_memory.as_deref().unwrap_or("2G"));
                let mut command =
                    LaunchCommand::new(java_executable(context.java_home), context.workspace)
                        .with_args([format!("-Xmx{memory}")])
                        .with_args(passthrough)
                        .with_args([String::from("-jar"), artifact.display().to_string()])
                        .with_args(args.iter().cloned());
                if let Some(home) = context.java_home {
                    command = command.with_env("JAVA_HOME", home.display().to_string());
                }
                command
            }
        };

        if let (Some(spec), Some(path)) = (
            &self.project_config,
            self.project_config_file(context.workspace, settings),
        ) {
            command = command.with_args([spec.flag.clone(), path.display().to_string()]);
        }
        Ok(command)
    }

    fn require_artifact(&self, context: &LaunchContext<'_>) -> Result<PathBuf, StartupError> {
        context
            .artifact
            .map(Path::to_path_buf)
            .ok_or_else(|| StartupError::ArtifactMissing {
                descriptor: self.id.clone(),
                detail: String::from("no runtime artifact was resolved"),
            })
    }
}
