//! Build-project cases: the instrumentation tool against the `build`
//! application with every supported target and rule form.

use crate::case::{TestCase, behavior};
use crate::registry::{CaseRegistry, RegistryError};

const APP: &str = "build";
const MIN_RUNTIME: &str = "1.18";

pub(crate) const CASE_COUNT: usize = 6;

pub fn register(registry: &CaseRegistry) -> Result<(), RegistryError> {
    registry.register(TestCase::toolchain(
        "build-project-targets",
        APP,
        MIN_RUNTIME,
        "",
        behavior(|ctx, _| {
            ctx.use_app(APP)?;
            ctx.instrument(&["--", "-o", "default", "cmd/foo.go"])?;
            ctx.instrument(&["--", "cmd/foo.go"])?;
            ctx.instrument(&["--", "cmd/foo.go", "cmd/bar.go"])?;
            ctx.instrument(&["--", "cmd"])?;
            Ok(())
        }),
    )?)?;

    // An empty target still means the current module.
    registry.register(TestCase::toolchain(
        "build-project-current-module",
        APP,
        MIN_RUNTIME,
        "",
        behavior(|ctx, _| {
            ctx.use_app(APP)?;
            ctx.instrument(&["--", "."])?;
            ctx.instrument(&["--", ""])?;
            Ok(())
        }),
    )?)?;

    registry.register(TestCase::toolchain(
        "build-project-workspace-modules",
        APP,
        MIN_RUNTIME,
        "",
        behavior(|ctx, _| {
            ctx.use_app(APP)?;
            ctx.instrument(&["--", "m1"])?;
            // m2 is not part of go.work.
            ctx.instrument_expecting_failure(&["--", "m2"])?;
            Ok(())
        }),
    )?)?;

    registry.register(TestCase::toolchain(
        "build-project-rule-file",
        APP,
        MIN_RUNTIME,
        "",
        behavior(|ctx, _| {
            ctx.use_app(APP)?;
            ctx.instrument(&["-rule=../../pkg/data/default.json", "--", "m1"])?;
            Ok(())
        }),
    )?)?;

    registry.register(
        TestCase::toolchain(
            "build-project-bad-rule-path",
            APP,
            MIN_RUNTIME,
            "",
            behavior(|ctx, _| {
                ctx.use_app(APP)?;
                ctx.instrument(&["-rule=../../pkg/data/default", "--", "m1"])?;
                Ok(())
            }),
        )?
        .expecting_failure(),
    )?;

    registry.register(TestCase::toolchain(
        "build-project-joined-rules",
        APP,
        MIN_RUNTIME,
        "",
        behavior(|ctx, _| {
            ctx.use_app(APP)?;
            ctx.instrument(&[
                "-rule=../../pkg/data/default.json,../../pkg/data/test_fmt.json",
                "--",
                "m1",
            ])?;
            Ok(())
        }),
    )?)?;

    Ok(())
}
