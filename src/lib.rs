//! # Droidharness
//!
//! Entrypoint inference and harness synthesis for Android applications.
//!
//! The framework instantiates application classes and invokes their
//! callbacks behind the analyst's back; a whole-program analyzer pointed at
//! such a binary sees no path into most of the code. This crate rewrites the
//! application so every framework-driven instantiation and callback becomes
//! an explicit call: it discovers framework-created types and their
//! callbacks, records application-side allocations of callback-bearing
//! objects into synthetic fields, narrows `findViewById`-style lookups
//! through generated typed accessors, and emits one synthetic entry method
//! driving all of it. The result is a single packaged artifact whose call
//! graph an external analyzer can compute soundly from one root.

use log::info;
use std::path::{Path, PathBuf};

pub mod accessors;
pub mod archive;
pub mod emit;
pub mod entrypoints;
pub mod harness;
pub mod hierarchy;
pub mod instrument;
pub mod layout;
pub mod ops;
pub mod toolchain;
pub mod types;

#[cfg(test)]
mod tests;

use accessors::AccessorSurface;
use archive::{Archive, TempArtifact};
use entrypoints::{CallbackPredicate, FrameworkSpec, ManifestApp};
use hierarchy::ClassHierarchy;
use instrument::{FieldNamer, InstrumentationField};
use layout::LayoutElement;
use ops::MethodRef;
use toolchain::Assembler;
use types::{HarnessResult, ObjectIdentifier};

/// Conventional name of the intermediate packaging archive; never survives a
/// completed run.
const INTERMEDIATE_ARCHIVE: &str = "harness-intermediate.zip";

/// Conventional name of the final self-contained artifact.
const OUTPUT_ARCHIVE: &str = "app-harnessed.zip";

/// Everything one synthesis run consumes.
pub struct SynthesisRequest<'a> {
    /// The whole-program class graph from the external front end.
    pub hierarchy: &'a ClassHierarchy,
    /// (owning class, element) pairs from the external layout parser.
    pub layout_seed: &'a [(ObjectIdentifier, LayoutElement)],
    /// Top-level components from the external manifest parser.
    pub manifest: &'a ManifestApp,
    /// The framework model to infer against.
    pub spec: &'a FrameworkSpec,
    /// The target program's generic lookup surface.
    pub surface: AccessorSurface,
    /// Directory tree holding the application's original emitted classes.
    pub app_dir: &'a Path,
    /// Where stubs, the harness and the final artifact are written.
    pub out_dir: &'a Path,
}

/// What a completed run hands back to the driver.
#[derive(Debug)]
pub struct SynthesisOutput {
    /// Sole root for downstream whole-program analysis.
    pub entry: MethodRef,
    pub fields: Vec<InstrumentationField>,
    /// The packaged instrumented-plus-harness artifact.
    pub artifact: PathBuf,
}

/// Runs the whole pipeline, strictly staged: layouts, declared callbacks,
/// specialized accessors (assembled before instrumentation starts),
/// framework-created types, instrumentation, harness generation, packaging.
///
/// Any fatal error aborts the run before the artifact is linked;
/// intermediate archives are cleaned up on every exit path.
pub fn synthesize(
    request: &SynthesisRequest<'_>,
    assembler: &dyn Assembler,
    predicate: &dyn CallbackPredicate,
) -> HarnessResult<SynthesisOutput> {
    let hierarchy = request.hierarchy;

    info!("stage 1/6: resolving layout elements");
    let layouts = layout::resolve_layouts(hierarchy, request.layout_seed)?;

    info!("stage 2/6: collecting declared callbacks");
    let declared = layout::collect_declared_callbacks(hierarchy, &layouts);

    info!("stage 3/6: generating specialized accessors");
    let (_stub_sources, accessor_map) =
        accessors::generate_accessors(&layouts, &request.surface, request.out_dir, assembler)?;

    info!("stage 4/6: resolving framework-created types");
    let (created, owners) = entrypoints::resolve_framework_types(
        hierarchy,
        request.spec,
        request.manifest,
        &declared,
        predicate,
    )?;

    info!("stage 5/6: instrumenting application allocations");
    let mut namer = FieldNamer::default();
    let instrumented = instrument::instrument_application(
        hierarchy,
        &owners,
        &accessor_map,
        &request.spec.callback_interfaces,
        &request.surface,
        harness::HARNESS_CLASS,
        &mut namer,
    );

    info!("stage 6/6: generating and linking the harness");
    let generated = harness::generate_harness(
        hierarchy,
        &created,
        &owners,
        &instrumented.fields,
        &accessor_map,
        &request.surface,
        &request.spec.callback_interfaces,
        request.out_dir,
        assembler,
    )?;

    let artifact = package(request, &instrumented.classes)?;

    Ok(SynthesisOutput {
        entry: generated.entry,
        fields: instrumented.fields,
        artifact,
    })
}

/// Builds the final artifact by disjoint overlay: the original tree is
/// snapshotted unmodified, only edited classes replace their originals, and
/// the assembled stub and harness dex files join the layout. The
/// intermediate archive is removed once the final artifact exists.
fn package(
    request: &SynthesisRequest<'_>,
    edited: &[types::ClassDef],
) -> HarnessResult<PathBuf> {
    let mut program = Archive::from_directory(request.app_dir, |_| true)?;

    let mut overlay = Archive::new();
    for class in edited {
        overlay.insert(
            &emit::class_file_name(class),
            emit::write_class(class).into_bytes(),
        )?;
    }
    program.overlay(overlay);

    // Materialize the instrumented tree for inspection and downstream tools.
    program.write_to_directory(request.out_dir.join("instrumented"))?;

    let intermediate = TempArtifact::new(request.out_dir.join(INTERMEDIATE_ARCHIVE));
    program.write_to_file(intermediate.path())?;

    let mut linked = Archive::from_file(intermediate.path())?;
    for name in ["stubs.dex", "harness.dex"] {
        let path = request.out_dir.join(name);
        if path.exists() {
            linked.insert(name, std::fs::read(&path)?)?;
        }
    }

    let artifact = request.out_dir.join(OUTPUT_ARCHIVE);
    linked.write_to_file(&artifact)?;
    Ok(artifact)
}
