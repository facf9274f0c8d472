//! Append-only case registry.
//!
//! Case modules register through [`CaseRegistry::register`] from an explicit
//! initialization pass (`cases::register_all`). Registration takes `&self`, so
//! independent modules may register from any thread and in any order.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::case::TestCase;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("case '{0}' is already registered")]
    Duplicate(String),
    #[error("case '{case}' declares an empty range: {detail}")]
    InvalidRange { case: String, detail: String },
    #[error("case declaration rejected: {0}")]
    Declaration(String),
}

impl From<crate::error::HarnessError> for RegistryError {
    fn from(err: crate::error::HarnessError) -> Self {
        Self::Declaration(err.to_string())
    }
}

#[derive(Debug, Default)]
pub struct CaseRegistry {
    cases: RwLock<Vec<Arc<TestCase>>>,
}

impl CaseRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a case. Names are unique; bounded ranges must not be inverted.
    pub fn register(&self, case: TestCase) -> Result<(), RegistryError> {
        check_ranges(&case)?;
        let mut cases = self.cases.write();
        if cases.iter().any(|c| c.name == case.name) {
            return Err(RegistryError::Duplicate(case.name));
        }
        cases.push(Arc::new(case));
        Ok(())
    }

    /// Every case in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<TestCase>> {
        self.cases.read().clone()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<TestCase>> {
        self.cases.read().iter().find(|c| c.name == name).cloned()
    }

    /// Position of `name` in insertion order, used for stable report ordering.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.cases.read().iter().position(|c| c.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.read().is_empty()
    }
}

fn check_ranges(case: &TestCase) -> Result<(), RegistryError> {
    if let Some(dep) = &case.dependency
        && let crate::version::VersionBound::Bounded(max) = &dep.max
        && dep.min > *max
    {
        return Err(RegistryError::InvalidRange {
            case: case.name.clone(),
            detail: format!("{} > {max}", dep.min),
        });
    }
    if let Some(max) = case.max_runtime
        && case.min_runtime > max
    {
        return Err(RegistryError::InvalidRange {
            case: case.name.clone(),
            detail: format!("runtime {} > {max}", case.min_runtime),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::behavior;

    fn case(name: &str, min: &str, max: &str) -> TestCase {
        let noop = behavior(|_, _| Ok(()));
        TestCase::general(name, "app", "example.com/dep", min, max, "1.18", "", noop)
            .expect("valid case")
    }

    #[test]
    fn preserves_insertion_order() {
        let reg = CaseRegistry::new();
        reg.register(case("b", "v1.0.0", "v1.1.0")).unwrap();
        reg.register(case("a", "v1.0.0", "v1.1.0")).unwrap();
        let names: Vec<_> = reg.all().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(reg.position("a"), Some(1));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn rejects_duplicate_names() {
        let reg = CaseRegistry::new();
        reg.register(case("dup", "v1.0.0", "v1.1.0")).unwrap();
        let err = reg.register(case("dup", "v1.0.0", "v1.2.0")).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("dup".to_string()));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn rejects_inverted_ranges() {
        let reg = CaseRegistry::new();
        let err = reg.register(case("inv", "v1.5.0", "v1.1.0")).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRange { .. }));
        assert!(reg.is_empty());
        reg.register(case("open", "v1.5.0", "latest")).unwrap();
    }

    #[test]
    fn registration_from_independent_threads() {
        let reg = CaseRegistry::new();
        std::thread::scope(|s| {
            for i in 0..8 {
                let reg = &reg;
                s.spawn(move || reg.register(case(&format!("c{i}"), "v1.0.0", "v1.0.0")));
            }
        });
        assert_eq!(reg.len(), 8);
        assert!(reg.get("c3").is_some());
    }
}
