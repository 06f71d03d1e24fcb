//! Remote release registry.
//!
//! The manager depends on exactly two read-only operations: listing the
//! available releases and fetching one asset. [`GithubReleaseRegistry`]
//! serves both from the GitHub releases API.

use std::io::{self, Write};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::artifact::{ArtifactSpec, ReleaseSource};
use crate::errors::DependencyError;
use crate::version::ArtifactVersion;

/// Log target for registry traffic.
pub(crate) const REGISTRY_TARGET: &str = "warden_runtime::registry";

const GITHUB_API: &str = "https://api.github.com";
const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";
const PAGE_SIZE: u32 = 100;
/// Upper bound on listing pages followed through `Link` headers.
const MAX_PAGES: usize = 50;

/// One downloadable file of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    /// File name.
    pub name: String,
    /// Direct download location.
    pub download_url: String,
    /// Size in bytes announced by the registry.
    pub size: u64,
    /// Lowercase hex SHA-256, when the registry publishes one.
    pub sha256: Option<String>,
}

/// A published release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Version parsed from the tag.
    pub version: ArtifactVersion,
    /// Tag as published.
    pub tag: String,
    /// Downloadable files.
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    /// The asset matching `spec`, if the release carries one.
    #[must_use]
    pub fn artifact(&self, spec: &ArtifactSpec) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| spec.matches(&asset.name))
    }
}

/// Read-only access to published releases.
pub trait ReleaseRegistry: Send + Sync {
    /// Lists releases, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError::Registry`] when the registry is unreachable
    /// or answers with something unreadable.
    fn list_releases(&self) -> Result<Vec<Release>, DependencyError>;

    /// Streams `asset` into `sink`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError::Download`] when the transfer fails.
    fn fetch(&self, asset: &ReleaseAsset, sink: &mut dyn Write) -> Result<u64, DependencyError>;
}

/// The newest release carrying an artifact for `spec`.
#[must_use]
pub fn latest_artifact<'a>(
    releases: &'a [Release],
    spec: &ArtifactSpec,
) -> Option<(&'a Release, &'a ReleaseAsset)> {
    releases
        .iter()
        .filter_map(|release| release.artifact(spec).map(|asset| (release, asset)))
        .max_by_key(|(release, _)| release.version)
}

/// The release of `version` carrying an artifact for `spec`.
#[must_use]
pub fn artifact_for_version<'a>(
    releases: &'a [Release],
    spec: &ArtifactSpec,
    version: &ArtifactVersion,
) -> Option<(&'a Release, &'a ReleaseAsset)> {
    releases
        .iter()
        .filter(|release| release.version == *version)
        .find_map(|release| release.artifact(spec).map(|asset| (release, asset)))
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    digest: Option<String>,
}

/// Parses a GitHub releases listing.
///
/// Drafts, prereleases and tags that are not a version triple are skipped.
/// The result is sorted newest first.
///
/// # Errors
///
/// Returns [`DependencyError::Registry`] when `body` is not a release array.
pub fn parse_releases(body: &str) -> Result<Vec<Release>, DependencyError> {
    let listed: Vec<GithubRelease> =
        serde_json::from_str(body).map_err(|error| DependencyError::Registry {
            message: format!("unreadable release listing: {error}"),
        })?;
    let mut releases: Vec<Release> = listed
        .into_iter()
        .filter(|release| !release.draft && !release.prerelease)
        .filter_map(|release| {
            let Ok(version) = release.tag_name.parse::<ArtifactVersion>() else {
                debug!(
                    target: REGISTRY_TARGET,
                    tag = %release.tag_name,
                    "ignoring unversioned tag"
                );
                return None;
            };
            let assets = release
                .assets
                .into_iter()
                .map(|asset| ReleaseAsset {
                    sha256: asset
                        .digest
                        .as_deref()
                        .and_then(|digest| digest.strip_prefix("sha256:"))
                        .map(str::to_ascii_lowercase),
                    name: asset.name,
                    download_url: asset.browser_download_url,
                    size: asset.size,
                })
                .collect();
            Some(Release {
                version,
                tag: release.tag_name,
                assets,
            })
        })
        .collect();
    releases.sort_by(|left, right| right.version.cmp(&left.version));
    Ok(releases)
}

/// The `rel="next"` target of an RFC 8288 `Link` header.
#[must_use]
pub fn next_page(link: &str) -> Option<String> {
    link.split(',').find_map(|entry| {
        let (target, params) = entry.split_once(';')?;
        let is_next = params
            .split(';')
            .filter_map(|param| param.trim().strip_prefix("rel="))
            .flat_map(|rel| rel.trim_matches('"').split_whitespace())
            .any(|rel| rel == "next");
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        is_next.then(|| target.to_owned())
    })
}

/// Registry backed by the GitHub releases API.
#[derive(Debug, Clone)]
pub struct GithubReleaseRegistry {
    agent: ureq::Agent,
    releases_url: String,
    user_agent: String,
}

impl GithubReleaseRegistry {
    /// Registry for `source` on api.github.com.
    #[must_use]
    pub fn new(source: &ReleaseSource) -> Self {
        Self::with_api_base(GITHUB_API, source)
    }

    /// Registry for `source` against another API host.
    #[must_use]
    pub fn with_api_base(api_base: &str, source: &ReleaseSource) -> Self {
        let ReleaseSource::GitHub { owner, repo } = source;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(30))
            .build();
        Self {
            agent,
            releases_url: format!(
                "{}/repos/{owner}/{repo}/releases",
                api_base.trim_end_matches('/')
            ),
            user_agent: format!("warden/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Releases endpoint of the repository.
    #[must_use]
    pub fn releases_url(&self) -> &str {
        &self.releases_url
    }

    /// First listing page requested by [`ReleaseRegistry::list_releases`].
    #[must_use]
    pub fn first_page_url(&self) -> String {
        format!("{}?per_page={PAGE_SIZE}", self.releases_url)
    }

    /// Fetches one listing page and the URL of the page after it.
    fn list_page(&self, url: &str) -> Result<(Vec<Release>, Option<String>), DependencyError> {
        debug!(target: REGISTRY_TARGET, %url, "listing releases");
        let response = self
            .agent
            .get(url)
            .set("Accept", GITHUB_ACCEPT)
            .set("User-Agent", &self.user_agent)
            .call()
            .map_err(|error| DependencyError::Registry {
                message: error.to_string(),
            })?;
        let next = response.header("Link").and_then(next_page);
        let body = response
            .into_string()
            .map_err(|error| DependencyError::Registry {
                message: format!("failed to read release listing: {error}"),
            })?;
        Ok((parse_releases(&body)?, next))
    }
}

impl ReleaseRegistry for GithubReleaseRegistry {
    fn list_releases(&self) -> Result<Vec<Release>, DependencyError> {
        let mut releases = Vec::new();
        let mut url = Some(self.first_page_url());
        let mut pages = 0;
        while let Some(current) = url.take() {
            if pages == MAX_PAGES {
                warn!(
                    target: REGISTRY_TARGET,
                    pages,
                    "release listing truncated at the page limit"
                );
                break;
            }
            let (page, next) = self.list_page(&current)?;
            releases.extend(page);
            url = next;
            pages += 1;
        }
        releases.sort_by(|left, right| right.version.cmp(&left.version));
        Ok(releases)
    }

    fn fetch(&self, asset: &ReleaseAsset, sink: &mut dyn Write) -> Result<u64, DependencyError> {
        debug!(
            target: REGISTRY_TARGET,
            asset = %asset.name,
            url = %asset.download_url,
            "downloading asset"
        );
        let download_error = |message: String| DependencyError::Download {
            asset: asset.name.clone(),
            message,
        };
        let response = self
            .agent
            .get(&asset.download_url)
            .set("User-Agent", &self.user_agent)
            .call()
            .map_err(|error| download_error(error.to_string()))?;
        let mut reader = response.into_reader();
        io::copy(&mut reader, sink).map_err(|error| download_error(error.to_string()))
    }
}
