//! Registered compatibility cases.
//!
//! Each module exposes one `register` function; [`register_all`] is the only
//! initialization pass, and modules never depend on each other's order.

pub mod build;
pub mod mongo;

use crate::registry::{CaseRegistry, RegistryError};

/// Register every case module into `registry`.
pub fn register_all(registry: &CaseRegistry) -> Result<(), RegistryError> {
    build::register(registry)?;
    mongo::register(registry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_module_registers_cleanly() {
        let registry = CaseRegistry::new();
        register_all(&registry).unwrap();
        assert_eq!(registry.len(), build::CASE_COUNT + mongo::CASE_COUNT);
        assert!(register_all(&registry).is_err());
    }
}
