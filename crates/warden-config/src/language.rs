//! Per-language server settings expressed as `language:key=value` directives.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Setting addressed by a [`LanguageDirective`].
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum LanguageSettingKey {
    /// Memory budget handed to the server runtime, e.g. `4G`.
    Memory,
    /// Version pin; disables background refresh and promotion.
    Version,
    /// Raw launch options passed through to the runtime, whitespace separated.
    LaunchOptions,
    /// Path to a server-specific project configuration file.
    ConfigFile,
}

/// Errors produced when parsing [`LanguageDirective`] values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LanguageDirectiveParseError {
    /// Language separator (`:`) was missing from the directive.
    #[error("directive '{0}' is missing the language separator ':'")]
    MissingLanguage(String),
    /// Setting assignment (`=`) was missing from the directive.
    #[error("directive '{0}' is missing the setting assignment '='")]
    MissingAssignment(String),
    /// The setting key is not recognised.
    #[error("unsupported language setting '{0}'")]
    UnknownSetting(String),
}

/// One `language:key=value` assignment.
///
/// Serialised as its textual form so configuration files and CLI flags share
/// one syntax.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct LanguageDirective {
    /// Language identifier such as `bsl` or `rust`.
    pub language: String,
    /// Setting being assigned.
    pub key: LanguageSettingKey,
    /// Raw value; interpretation depends on `key`.
    pub value: String,
}

impl LanguageDirective {
    /// Creates a new directive.
    #[must_use]
    pub fn new(
        language: impl Into<String>,
        key: LanguageSettingKey,
        value: impl Into<String>,
    ) -> Self {
        Self {
            language: language.into(),
            key,
            value: value.into(),
        }
    }
}

impl fmt::Display for LanguageDirective {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}={}", self.language, self.key, self.value)
    }
}

impl FromStr for LanguageDirective {
    type Err = LanguageDirectiveParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (language, rest) = input
            .split_once(':')
            .ok_or_else(|| LanguageDirectiveParseError::MissingLanguage(input.to_owned()))?;
        let (key, value) = rest
            .split_once('=')
            .ok_or_else(|| LanguageDirectiveParseError::MissingAssignment(input.to_owned()))?;
        let key = LanguageSettingKey::from_str(key.trim())
            .map_err(|_| LanguageDirectiveParseError::UnknownSetting(key.to_owned()))?;
        Ok(Self::new(language, key, value.trim()))
    }
}

impl TryFrom<String> for LanguageDirective {
    type Error = LanguageDirectiveParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LanguageDirective> for String {
    fn from(directive: LanguageDirective) -> Self {
        directive.to_string()
    }
}

/// Settings resolved for a single language.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LanguageSettings {
    /// Explicit memory budget.
    #[serde(default)]
    pub memory: Option<String>,
    /// Pinned server version, as written by the user.
    #[serde(default)]
    pub version: Option<String>,
    /// Passthrough launch options.
    #[serde(default)]
    pub launch_options: Vec<String>,
    /// Explicit project configuration file.
    #[serde(default)]
    pub config_file: Option<Utf8PathBuf>,
}

const MAX_HEAP_FLAG: &str = "-Xmx";

impl LanguageSettings {
    fn apply(&mut self, key: LanguageSettingKey, value: &str) {
        let value = value.trim();
        let optional = (!value.is_empty()).then(|| value.to_owned());
        match key {
            LanguageSettingKey::Memory => self.memory = optional,
            LanguageSettingKey::Version => self.version = optional,
            LanguageSettingKey::LaunchOptions => {
                self.launch_options = value.split_whitespace().map(str::to_owned).collect();
            }
            LanguageSettingKey::ConfigFile => self.config_file = optional.map(Utf8PathBuf::from),
        }
    }

    /// Resolves the memory budget.
    ///
    /// An explicit `memory` setting wins; otherwise the last `-Xmx<size>`
    /// launch option is used; otherwise `default`.
    #[must_use]
    pub fn memory_budget(&self, default: &str) -> String {
        if let Some(memory) = &self.memory {
            return memory.clone();
        }
        self.launch_options
            .iter()
            .rev()
            .find_map(|option| option.strip_prefix(MAX_HEAP_FLAG))
            .filter(|size| !size.is_empty())
            .map_or_else(|| default.to_owned(), str::to_owned)
    }

    /// Launch options with heap sizing removed, since the budget from
    /// [`Self::memory_budget`] is emitted separately.
    #[must_use]
    pub fn launch_options_without_memory(&self) -> Vec<String> {
        self.launch_options
            .iter()
            .filter(|option| !option.starts_with(MAX_HEAP_FLAG))
            .cloned()
            .collect()
    }

    /// Pinned version, when set.
    #[must_use]
    pub fn pinned_version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// Language settings grouped by normalised language identifier.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LanguageSettingsMatrix {
    /// Settings keyed by lower-case language identifier.
    #[serde(default)]
    pub languages: BTreeMap<String, LanguageSettings>,
}

impl LanguageSettingsMatrix {
    /// Folds directives into a matrix; later directives win.
    #[must_use]
    pub fn from_directives<'a, I>(directives: I) -> Self
    where
        I: IntoIterator<Item = &'a LanguageDirective>,
    {
        let mut matrix = Self::default();
        for directive in directives {
            matrix.set(&directive.language, directive.key, &directive.value);
        }
        matrix
    }

    /// Stores or replaces a single setting.
    pub fn set(&mut self, language: &str, key: LanguageSettingKey, value: &str) {
        self.languages
            .entry(normalise_key(language))
            .or_default()
            .apply(key, value);
    }

    /// Settings for `language`, or defaults when none were configured.
    #[must_use]
    pub fn settings_for(&self, language: &str) -> LanguageSettings {
        self.languages
            .get(&normalise_key(language))
            .cloned()
            .unwrap_or_default()
    }
}

fn normalise_key(key: &str) -> String {
    key.trim().to_lowercase()
}
