//! Dependency lifetimes and the container that honours them.
//!
//! - [`Lifetime`]: caching policy of a registration
//! - [`LifetimeTag`]: lifetime as it appears in registration tables (enum,
//!   numeric tag, name, or unspecified)
//! - [`container`]: registration, resolution, and singleton disposal

pub mod container;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use container::{Container, ContainerBuilder, Disposable, Resolver};

/// How long a resolved instance is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifetime {
    /// One instance per container, constructed on first resolution.
    Singleton,
    /// A fresh instance for every resolution.
    PerResolve,
    /// One instance per processing cycle, invalidated when the cycle ends.
    PerUnitOfWork,
}

impl Lifetime {
    /// Numeric tag used in registration tables.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::Singleton => 0,
            Self::PerResolve => 1,
            Self::PerUnitOfWork => 2,
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Singleton => "singleton",
            Self::PerResolve => "per-resolve",
            Self::PerUnitOfWork => "per-unit-of-work",
        };
        f.write_str(label)
    }
}

impl TryFrom<u8> for Lifetime {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Singleton),
            1 => Ok(Self::PerResolve),
            2 => Ok(Self::PerUnitOfWork),
            other => Err(other),
        }
    }
}

impl FromStr for Lifetime {
    type Err = String;

    /// Accepts `singleton`, `per-resolve` and `per-unit-of-work`, ignoring
    /// case, `-` and `_` (so `PerUnitOfWork` and `per_unit_of_work` parse too).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "singleton" => Ok(Self::Singleton),
            "perresolve" => Ok(Self::PerResolve),
            "perunitofwork" => Ok(Self::PerUnitOfWork),
            _ => Err(s.to_string()),
        }
    }
}

/// Lifetime as written in a registration: checked when the registration is
/// applied, so an out-of-range value fails registration rather than
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LifetimeTag {
    /// No lifetime given; resolves to [`Lifetime::PerResolve`].
    #[default]
    Unspecified,
    /// Already-typed lifetime.
    Lifetime(Lifetime),
    /// Numeric tag (`0` singleton, `1` per-resolve, `2` per-unit-of-work).
    Numeric(u8),
    /// Lifetime name, see [`Lifetime::from_str`].
    Named(String),
}

impl LifetimeTag {
    /// The lifetime this tag denotes.
    ///
    /// # Errors
    ///
    /// Returns the offending value rendered as a string if the tag does not
    /// name a lifetime.
    pub fn resolve(&self) -> Result<Lifetime, String> {
        match self {
            Self::Unspecified => Ok(Lifetime::PerResolve),
            Self::Lifetime(lifetime) => Ok(*lifetime),
            Self::Numeric(value) => Lifetime::try_from(*value).map_err(|v| v.to_string()),
            Self::Named(name) => name.parse(),
        }
    }
}

impl From<Lifetime> for LifetimeTag {
    fn from(lifetime: Lifetime) -> Self {
        Self::Lifetime(lifetime)
    }
}

impl From<u8> for LifetimeTag {
    fn from(value: u8) -> Self {
        Self::Numeric(value)
    }
}

impl From<&str> for LifetimeTag {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for LifetimeTag {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<Option<Lifetime>> for LifetimeTag {
    fn from(lifetime: Option<Lifetime>) -> Self {
        lifetime.map_or(Self::Unspecified, Self::Lifetime)
    }
}
