//! Runtime managers for managed descriptors, created on first use.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use warden_lsp::ServerDescriptor;
use warden_runtime::{
    ArtifactSpec, GithubReleaseRegistry, ReleaseRegistry, RuntimeManager, RuntimeSettings,
};

use super::lock;

/// Builds the release registry serving an artifact.
pub type ReleaseRegistryFactory =
    Arc<dyn Fn(&ArtifactSpec) -> Arc<dyn ReleaseRegistry> + Send + Sync>;

/// Factory querying the GitHub releases of each artifact.
#[must_use]
pub fn github_releases() -> ReleaseRegistryFactory {
    Arc::new(|spec: &ArtifactSpec| -> Arc<dyn ReleaseRegistry> {
        Arc::new(GithubReleaseRegistry::new(spec.source()))
    })
}

pub(crate) struct Runtimes {
    resources_dir: PathBuf,
    settings: RuntimeSettings,
    factory: ReleaseRegistryFactory,
    managers: Mutex<HashMap<String, Arc<RuntimeManager>>>,
}

impl Runtimes {
    pub(crate) fn new(
        resources_dir: PathBuf,
        settings: RuntimeSettings,
        factory: ReleaseRegistryFactory,
    ) -> Self {
        Self {
            resources_dir,
            settings,
            factory,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Manager for `descriptor`, or `None` when its server comes from `PATH`.
    pub(crate) fn manager_for(&self, descriptor: &ServerDescriptor) -> Option<Arc<RuntimeManager>> {
        let spec = descriptor.managed_artifact()?;
        let mut managers = lock(&self.managers);
        let manager = managers
            .entry(descriptor.id().to_owned())
            .or_insert_with(|| {
                Arc::new(RuntimeManager::new(
                    descriptor.id(),
                    spec.clone(),
                    &self.resources_dir,
                    (self.factory)(spec),
                    self.settings,
                ))
            });
        Some(Arc::clone(manager))
    }
}

impl fmt::Debug for Runtimes {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Runtimes")
            .field("resources_dir", &self.resources_dir)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
