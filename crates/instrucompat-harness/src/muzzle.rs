//! Static API-surface ("muzzle") checks.
//!
//! Extracts the dependency symbols a set of Go sources references and diffs
//! them against the exports the dependency declares for one version.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::resolver::sanitize;
use crate::version::ModuleVersion;

/// One `pkg.Symbol` use found in a source file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolRef {
    /// Package path relative to the dependency root (`mongo/options`), or
    /// empty for the root package.
    pub package: String,
    pub symbol: String,
    pub file: String,
    pub line: usize,
}

impl SymbolRef {
    /// Surface key, e.g. `mongo/options.Client`.
    #[must_use]
    pub fn key(&self) -> String {
        if self.package.is_empty() {
            self.symbol.clone()
        } else {
            format!("{}.{}", self.package, self.symbol)
        }
    }
}

/// Exports a dependency declares stable for one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSurface {
    pub dependency: String,
    pub version: ModuleVersion,
    pub exports: BTreeSet<String>,
}

/// Where declared surfaces come from.
pub trait ApiSurfaceSource: Send + Sync {
    fn surface(&self, dependency: &str, version: &ModuleVersion) -> HarnessResult<ApiSurface>;
}

/// Surfaces stored as `<root>/<dependency>/<version>.json`.
#[derive(Debug, Clone)]
pub struct SurfaceCatalog {
    pub root: PathBuf,
}

impl ApiSurfaceSource for SurfaceCatalog {
    fn surface(&self, dependency: &str, version: &ModuleVersion) -> HarnessResult<ApiSurface> {
        let path = self
            .root
            .join(sanitize(dependency))
            .join(format!("{}.json", sanitize(version.as_str())));
        let body = std::fs::read_to_string(&path).map_err(|e| {
            HarnessError::Infrastructure(format!(
                "no declared surface for {dependency}@{version} at {}: {e}",
                path.display()
            ))
        })?;
        let surface: ApiSurface = serde_json::from_str(&body).map_err(|e| {
            HarnessError::Infrastructure(format!("malformed surface {}: {e}", path.display()))
        })?;
        if surface.dependency != dependency || surface.version != *version {
            return Err(HarnessError::Infrastructure(format!(
                "surface {} describes {}@{}, expected {dependency}@{version}",
                path.display(),
                surface.dependency,
                surface.version
            )));
        }
        Ok(surface)
    }
}

/// Surfaces declared in code.
#[derive(Debug, Clone, Default)]
pub struct InMemorySurfaces {
    surfaces: BTreeMap<(String, String), ApiSurface>,
}

impl InMemorySurfaces {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        dependency: &str,
        version: &str,
        exports: &[&str],
    ) -> HarnessResult<()> {
        let version: ModuleVersion = version.parse()?;
        self.surfaces.insert(
            (dependency.to_string(), version.as_str().to_string()),
            ApiSurface {
                dependency: dependency.to_string(),
                version,
                exports: exports.iter().map(|e| (*e).to_string()).collect(),
            },
        );
        Ok(())
    }
}

impl ApiSurfaceSource for InMemorySurfaces {
    fn surface(&self, dependency: &str, version: &ModuleVersion) -> HarnessResult<ApiSurface> {
        self.surfaces
            .get(&(dependency.to_string(), version.as_str().to_string()))
            .cloned()
            .ok_or_else(|| {
                HarnessError::Infrastructure(format!(
                    "no declared surface for {dependency}@{version}"
                ))
            })
    }
}

/// Outcome of diffing sources against a surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceReport {
    pub dependency: String,
    pub version: String,
    pub checked_files: Vec<String>,
    pub references: usize,
    pub violations: Vec<SymbolRef>,
}

impl SurfaceReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = format!(
            "muzzle {}@{}: {} file(s), {} reference(s), {} violation(s)\n",
            self.dependency,
            self.version,
            self.checked_files.len(),
            self.references,
            self.violations.len()
        );
        for v in &self.violations {
            out.push_str(&format!(
                "  {}:{}: {} not in declared surface\n",
                v.file,
                v.line,
                v.key()
            ));
        }
        out
    }
}

/// Diff every dependency reference in `sources` (file name, contents)
/// against `surface`.
#[must_use]
pub fn check_surface(sources: &[(String, String)], surface: &ApiSurface) -> SurfaceReport {
    let mut references = 0;
    let mut violations = Vec::new();
    for (file, body) in sources {
        for r in extract_references(file, body, &surface.dependency) {
            references += 1;
            if !surface.exports.contains(&r.key()) {
                violations.push(r);
            }
        }
    }
    violations.sort();
    SurfaceReport {
        dependency: surface.dependency.clone(),
        version: surface.version.to_string(),
        checked_files: sources.iter().map(|(f, _)| f.clone()).collect(),
        references,
        violations,
    }
}

/// Exported `alias.Symbol` uses of packages under `dependency` in one file.
#[must_use]
pub fn extract_references(file: &str, source: &str, dependency: &str) -> Vec<SymbolRef> {
    let aliases = import_aliases(source, dependency);
    if aliases.is_empty() {
        return Vec::new();
    }
    let code = strip_comments_and_literals(source);
    let chars: Vec<char> = code.chars().collect();

    let mut refs = Vec::new();
    let mut line = 1;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if !is_ident_start(c) {
            i += 1;
            continue;
        }
        let preceded_by_dot = i > 0 && chars[i - 1] == '.';
        let start = i;
        while i < chars.len() && is_ident_char(chars[i]) {
            i += 1;
        }
        let ident: String = chars[start..i].iter().collect();
        if preceded_by_dot || i >= chars.len() || chars[i] != '.' {
            continue;
        }
        let Some(package) = aliases.get(&ident) else {
            continue;
        };
        let sym_start = i + 1;
        let mut j = sym_start;
        while j < chars.len() && is_ident_char(chars[j]) {
            j += 1;
        }
        let symbol: String = chars[sym_start..j].iter().collect();
        if symbol.starts_with(|c: char| c.is_uppercase()) {
            refs.push(SymbolRef {
                package: package.clone(),
                symbol,
                file: file.to_string(),
                line,
            });
        }
        i = j;
    }
    refs
}

/// Map of local package name to dependency-relative package path.
fn import_aliases(source: &str, dependency: &str) -> BTreeMap<String, String> {
    let mut aliases = BTreeMap::new();
    let mut in_block = false;
    for raw in source.lines() {
        let line = raw.split("//").next().unwrap_or_default().trim();
        let spec = if in_block {
            if line.starts_with(')') {
                in_block = false;
                continue;
            }
            line
        } else if let Some(rest) = line.strip_prefix("import") {
            let rest = rest.trim();
            if rest.starts_with('(') {
                in_block = true;
                rest.trim_start_matches('(').trim()
            } else {
                rest
            }
        } else {
            continue;
        };
        if let Some((alias, path)) = parse_import_spec(spec)
            && let Some(package) = relative_package(&path, dependency)
        {
            let name = alias.unwrap_or_else(|| default_package_name(&path));
            if name != "_" && name != "." {
                aliases.insert(name, package);
            }
        }
    }
    aliases
}

fn parse_import_spec(spec: &str) -> Option<(Option<String>, String)> {
    let open = spec.find('"')?;
    let close = open + 1 + spec[open + 1..].find('"')?;
    let path = spec[open + 1..close].to_string();
    let alias = spec[..open].trim();
    let alias = (!alias.is_empty()).then(|| alias.to_string());
    Some((alias, path))
}

fn relative_package(path: &str, dependency: &str) -> Option<String> {
    if path == dependency {
        return Some(String::new());
    }
    path.strip_prefix(dependency)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}

fn default_package_name(path: &str) -> String {
    let mut segments: Vec<&str> = path.split('/').collect();
    let mut last = segments.pop().unwrap_or(path);
    let is_major =
        |s: &str| s.len() > 1 && s.starts_with('v') && s[1..].bytes().all(|b| b.is_ascii_digit());
    if is_major(last)
        && let Some(prev) = segments.pop()
    {
        last = prev;
    }
    let last = match last.rsplit_once(".v") {
        Some((base, major)) if major.bytes().all(|b| b.is_ascii_digit()) => base,
        _ => last,
    };
    last.replace('-', "_")
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_char(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

/// Blank out comments and string/rune literals, keeping newlines so line
/// numbers survive.
fn strip_comments_and_literals(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match (c, next) {
            ('/', Some('/')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ('/', Some('*')) => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        out.push('\n');
                    }
                    i += 1;
                }
                i += 2;
            }
            ('"' | '\'', _) => {
                i += 1;
                while i < chars.len() && chars[i] != c && chars[i] != '\n' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
                out.push(' ');
            }
            ('`', _) => {
                i += 1;
                while i < chars.len() && chars[i] != '`' {
                    if chars[i] == '\n' {
                        out.push('\n');
                    }
                    i += 1;
                }
                i += 1;
                out.push(' ');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}
