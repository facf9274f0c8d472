//! Dependency and toolchain version parsing with semantic ordering.
//!
//! Dependency versions follow Go module conventions (`v1.11.1`,
//! `v1.16.0-rc.1`, `v2.0.0+incompatible`). Toolchain versions are the
//! shorter Go release form (`1.18`, `1.21.3`, `go1.22`).

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PreId {
    Numeric(u64),
    Alpha(String),
}

impl Ord for PreId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Numeric(a), Self::Numeric(b)) => a.cmp(b),
            (Self::Numeric(_), Self::Alpha(_)) => Ordering::Less,
            (Self::Alpha(_), Self::Numeric(_)) => Ordering::Greater,
            (Self::Alpha(a), Self::Alpha(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for PreId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A released version of a dependency module.
///
/// Ordering ignores build metadata, so `v2.0.0+incompatible == v2.0.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleVersion {
    major: u64,
    minor: u64,
    patch: u64,
    pre: Vec<PreId>,
    raw: String,
}

impl ModuleVersion {
    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    #[must_use]
    pub const fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for ModuleVersion {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let bad = || HarnessError::Configuration(format!("invalid module version '{raw}'"));
        let body = raw.strip_prefix('v').unwrap_or(raw);
        let body = body.split_once('+').map_or(body, |(core, _build)| core);
        let (core, pre) = match body.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (body, None),
        };

        let mut parts = core.split('.');
        let major = parse_component(parts.next()).ok_or_else(bad)?;
        let minor = parse_component(parts.next()).ok_or_else(bad)?;
        let patch = parse_component(parts.next()).ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }

        let pre = match pre {
            None => Vec::new(),
            Some(pre) => {
                let mut ids = Vec::new();
                for id in pre.split('.') {
                    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                    {
                        return Err(bad());
                    }
                    ids.push(match id.parse::<u64>() {
                        Ok(n) => PreId::Numeric(n),
                        Err(_) => PreId::Alpha(id.to_string()),
                    });
                }
                ids
            }
        };

        Ok(Self {
            major,
            minor,
            patch,
            pre,
            raw: raw.to_string(),
        })
    }
}

fn parse_component(part: Option<&str>) -> Option<u64> {
    let part = part?;
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl Ord for ModuleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple()
            .cmp(&other.triple())
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.pre.cmp(&other.pre),
            })
    }
}

impl PartialOrd for ModuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ModuleVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ModuleVersion {}

// Consistent with `Eq`: build metadata in `raw` is not hashed.
impl Hash for ModuleVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.triple().hash(state);
        self.pre.hash(state);
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for ModuleVersion {
    type Error = HarnessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModuleVersion> for String {
    fn from(value: ModuleVersion) -> Self {
        value.raw
    }
}

/// Upper end of a declared dependency range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionBound {
    Bounded(ModuleVersion),
    /// No ceiling; every newer release is in range.
    Latest,
}

impl VersionBound {
    /// Parse a ceiling. Empty, `latest` and `*` mean unbounded.
    pub fn parse(raw: &str) -> Result<Self, HarnessError> {
        match raw.trim() {
            "" | "latest" | "*" => Ok(Self::Latest),
            other => other.parse().map(Self::Bounded),
        }
    }

    #[must_use]
    pub fn admits(&self, version: &ModuleVersion) -> bool {
        match self {
            Self::Bounded(max) => version <= max,
            Self::Latest => true,
        }
    }
}

impl fmt::Display for VersionBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(v) => v.fmt(f),
            Self::Latest => f.write_str("latest"),
        }
    }
}

/// A compiler/runtime release, e.g. Go `1.18` or `1.21.3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl RuntimeVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Value for `GOTOOLCHAIN`, e.g. `go1.21.3`.
    #[must_use]
    pub fn toolchain_name(&self) -> String {
        format!("go{self}")
    }
}

impl FromStr for RuntimeVersion {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let bad = || HarnessError::Configuration(format!("invalid runtime version '{raw}'"));
        let body = raw.strip_prefix("go").unwrap_or(raw);
        // `go1.22rc1` and `1.21.0 X:nocoverageredesign` keep their numeric prefix only.
        let end = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let numeric = body[..end].trim_end_matches('.');

        let mut parts = numeric.split('.');
        let major = parse_component(parts.next()).ok_or_else(bad)?;
        let minor = parse_component(parts.next()).ok_or_else(bad)?;
        let patch = match parts.next() {
            Some(p) => parse_component(Some(p)).ok_or_else(bad)?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(bad());
        }
        let narrow = |n: u64| u32::try_from(n).map_err(|_| bad());
        Ok(Self::new(narrow(major)?, narrow(minor)?, narrow(patch)?))
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

impl TryFrom<String> for RuntimeVersion {
    type Error = HarnessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RuntimeVersion> for String {
    fn from(value: RuntimeVersion) -> Self {
        value.to_string()
    }
}
