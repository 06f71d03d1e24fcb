//! Languages served by supervised language servers.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Languages with a known server descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Language {
    /// Rust via `rust-analyzer`.
    Rust,
    /// Python via `pyrefly lsp`.
    Python,
    /// TypeScript via `tsgo --lsp`.
    TypeScript,
    /// 1C:Enterprise BSL via the JVM-hosted BSL Language Server.
    Bsl,
}

impl Language {
    /// Every supported language.
    pub const ALL: [Self; 4] = [Self::Rust, Self::Python, Self::TypeScript, Self::Bsl];

    /// Returns the lower-case identifier used in configuration directives.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::TypeScript => "typescript",
            Self::Bsl => "bsl",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Errors raised when parsing language identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unsupported language '{0}'")]
pub struct LanguageParseError(String);

impl LanguageParseError {
    /// Returns the input that failed to parse.
    #[must_use]
    pub fn input(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for Language {
    type Err = LanguageParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalised = input.trim().to_ascii_lowercase();
        match normalised.as_str() {
            "rust" => Ok(Self::Rust),
            "python" => Ok(Self::Python),
            "typescript" | "ts" => Ok(Self::TypeScript),
            "bsl" | "1c" => Ok(Self::Bsl),
            other => Err(LanguageParseError(other.to_owned())),
        }
    }
}
