//! mongo-driver cases: CRUD, cursor and batch round trips against a live
//! mongo container, their muzzle checks, and a latest-version regression.

use crate::case::{CaseBehavior, TestCase, behavior};
use crate::provision::ServiceSpec;
use crate::registry::{CaseRegistry, RegistryError};

const DEPENDENCY: &str = "go.mongodb.org/mongo-driver";
const APP: &str = "mongo/v1.11.1";
const MIN_VERSION: &str = "v1.11.1";
const MAX_VERSION: &str = "v1.15.1";
const MIN_RUNTIME: &str = "1.18";

pub(crate) const CASE_COUNT: usize = 7;

/// Instrument `source` + `dsn.go` with debug logging, then run the binary
/// against the provisioned mongo.
fn round_trip(source: &'static str, artifact: &'static str) -> CaseBehavior {
    behavior(move |ctx, env| {
        ctx.use_app(APP)?;
        ctx.instrument(&["-debuglog", "--", source, "dsn.go"])?;
        ctx.run_app(artifact, env)?;
        Ok(())
    })
}

pub fn register(registry: &CaseRegistry) -> Result<(), RegistryError> {
    let general = [
        ("mongo-1.11.1-crud-test", "test_crud_mongo.go", "test_crud_mongo"),
        ("mongo-1.11.1-cursor-test", "test_cursor.go", "test_cursor"),
        ("mongo-1.11.1-batch-test", "test_batch.go", "test_batch"),
    ];
    for (name, source, artifact) in general {
        registry.register(
            TestCase::general(
                name,
                APP,
                DEPENDENCY,
                MIN_VERSION,
                MAX_VERSION,
                MIN_RUNTIME,
                "",
                round_trip(source, artifact),
            )?
            .with_service(ServiceSpec::mongo()),
        )?;
    }

    let muzzle: [(&str, &[&str]); 3] = [
        ("mongo-1.11.1-crud-muzzle", &["test_crud_mongo.go", "dsn.go"]),
        ("mongo-1.11.1-cursor-muzzle", &["test_cursor.go", "dsn.go"]),
        ("mongo-1.11.1-batch-muzzle", &["test_batch.go", "dsn.go"]),
    ];
    for (name, sources) in muzzle {
        registry.register(TestCase::muzzle(
            name,
            APP,
            DEPENDENCY,
            MIN_VERSION,
            MAX_VERSION,
            MIN_RUNTIME,
            "",
            sources,
        )?)?;
    }

    registry.register(
        TestCase::latest_depth(
            "mongo-1.11.1-latestDepth",
            APP,
            DEPENDENCY,
            MIN_VERSION,
            MAX_VERSION,
            MIN_RUNTIME,
            "",
            round_trip("test_crud_mongo.go", "test_crud_mongo"),
        )?
        .with_service(ServiceSpec::mongo()),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{CaseKind, CaseVariant};

    #[test]
    fn declares_the_mongo_matrix() {
        let registry = CaseRegistry::new();
        register(&registry).unwrap();
        assert_eq!(registry.len(), CASE_COUNT);

        let crud = registry.get("mongo-1.11.1-crud-test").unwrap();
        assert_eq!(crud.dependency_name(), Some(DEPENDENCY));
        assert_eq!(crud.service.as_ref().map(|s| s.image.as_str()), Some("mongo:4.0"));

        let muzzle = registry.get("mongo-1.11.1-cursor-muzzle").unwrap();
        match &muzzle.kind {
            CaseKind::Muzzle { sources } => assert_eq!(sources, &["test_cursor.go", "dsn.go"]),
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(muzzle.service.is_none());

        let latest = registry.get("mongo-1.11.1-latestDepth").unwrap();
        assert_eq!(latest.variant(), CaseVariant::LatestDepth);
    }

    #[test]
    fn muzzle_cases_scan_the_sources_of_their_round_trip() {
        let registry = CaseRegistry::new();
        register(&registry).unwrap();
        for scenario in ["crud", "cursor", "batch"] {
            let muzzle = registry.get(&format!("mongo-1.11.1-{scenario}-muzzle")).unwrap();
            let CaseKind::Muzzle { sources } = &muzzle.kind else {
                panic!("{} is not a muzzle case", muzzle.name);
            };
            assert_eq!(sources.len(), 2, "{sources:?}");
            assert!(sources[0].starts_with(&format!("test_{scenario}")), "{sources:?}");
            assert_eq!(sources[1], "dsn.go");
        }
    }
}
