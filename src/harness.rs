//! Generation of the synthetic entry class.
//!
//! The entry method makes every framework-driven instantiation and callback
//! invocation explicit: it constructs each framework-created class and calls
//! its inferred callbacks, and it drives application-allocated objects
//! through the instrumentation fields recorded for them (the harness cannot
//! know how to construct those itself). Callbacks are invoked as an
//! unordered set; no lifecycle sequencing beyond the framework's own
//! guarantees is assumed.

use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::accessors::{AccessorSurface, SpecializedAccessorMap};
use crate::emit;
use crate::entrypoints::{CallbackInterface, CallbackOwnerMap, FrameworkCreatedTypes};
use crate::hierarchy::ClassHierarchy;
use crate::instrument::InstrumentationField;
use crate::ops::{v, DexOp, InvokeKind, MethodRef, Register};
use crate::toolchain::Assembler;
use crate::types::{
    AccessFlags, ClassDef, FieldDef, HarnessResult, MethodDef, MethodSignature, ObjectIdentifier,
    TypeSignature,
};

/// JNI name of the generated entry class.
pub const HARNESS_CLASS: &str = "Lharness/Main;";

/// What the generator hands back to the pipeline.
pub struct GeneratedHarness {
    pub class: ClassDef,
    pub entry: MethodRef,
    pub source_path: PathBuf,
}

/// Emits constant-loading ops for one callback invocation's arguments.
///
/// Object arguments default to null; when a specialized accessor returns
/// exactly the wanted type and the receiver is a valid lookup target, the
/// typed view is fetched through the accessor instead.
fn load_arguments(
    signature: &MethodSignature,
    instance: Register,
    use_accessors: bool,
    accessors: &SpecializedAccessorMap,
    ops: &mut Vec<DexOp>,
) -> (Vec<Register>, u16) {
    let mut registers = vec![instance];
    let mut next: u16 = 1;
    for arg in &signature.args {
        let dest = v(next);
        if arg.is_wide() {
            ops.push(DexOp::ConstWide16 { dest, value: 0 });
            registers.push(dest);
            registers.push(v(next + 1));
            next += 2;
            continue;
        }
        if arg.is_object() {
            let jni = arg.to_jni();
            if use_accessors {
                if let Some((id, accessor)) = accessors.returning(&jni) {
                    // const the id, fetch the typed view, use it as the arg.
                    ops.push(DexOp::Const {
                        dest,
                        value: id.0,
                    });
                    ops.push(DexOp::Invoke {
                        kind: InvokeKind::Static,
                        registers: vec![instance, dest],
                        method: accessor.clone(),
                    });
                    ops.push(DexOp::MoveResultObject { dest });
                    registers.push(dest);
                    next += 1;
                    continue;
                }
            }
            ops.push(DexOp::Const4 { dest, value: 0 });
        } else {
            ops.push(DexOp::Const4 { dest, value: 0 });
        }
        registers.push(dest);
        next += 1;
    }
    (registers, next)
}

fn entry_method_body(
    hierarchy: &ClassHierarchy,
    created: &FrameworkCreatedTypes,
    owners: &CallbackOwnerMap,
    fields: &[InstrumentationField],
    accessors: &SpecializedAccessorMap,
    surface: &AccessorSurface,
    interfaces: &[CallbackInterface],
) -> (Vec<DexOp>, u32) {
    let mut ops = Vec::new();
    let mut max_locals: u16 = 1;
    let instance = v(0);

    // Framework-created classes: instantiate, then drive every callback.
    for jni in created.all() {
        let class = match hierarchy.get(jni) {
            Some(c) => c,
            None => continue,
        };
        if class.default_constructor().is_none() {
            warn!(
                "{} has no accessible zero-argument constructor; harness skips it",
                class.name.as_java_type()
            );
            continue;
        }
        ops.push(DexOp::NewInstance {
            dest: instance,
            class: jni.to_string(),
        });
        ops.push(DexOp::Invoke {
            kind: InvokeKind::Direct,
            registers: vec![instance],
            method: MethodRef::new(jni, "<init>", "()V"),
        });

        let lookup_target = hierarchy.is_subtype_of(jni, &surface.view_lookup.class);
        if let Some(callbacks) = owners.callbacks_of(jni) {
            for callback in callbacks {
                let signature = match MethodSignature::from_jni(&callback.descriptor) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                let (registers, used) =
                    load_arguments(&signature, instance, lookup_target, accessors, &mut ops);
                max_locals = max_locals.max(used);
                ops.push(DexOp::Invoke {
                    kind: InvokeKind::Virtual,
                    registers,
                    method: callback.clone(),
                });
            }
        }
    }

    // Application-allocated objects: drive callbacks through the recorded
    // instrumentation fields, never through fresh instantiation.
    for field in fields {
        let Some(interface) = interfaces.iter().find(|i| i.class == field.interface) else {
            continue;
        };
        ops.push(DexOp::SgetObject {
            dest: instance,
            field: field.field.clone(),
        });
        for method in &interface.methods {
            let signature = match MethodSignature::from_jni(&method.descriptor) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let (registers, used) =
                load_arguments(&signature, instance, false, accessors, &mut ops);
            max_locals = max_locals.max(used);
            ops.push(DexOp::Invoke {
                kind: InvokeKind::Interface,
                registers,
                method: MethodRef::new(&interface.class, &method.name, &method.descriptor),
            });
        }
    }

    ops.push(DexOp::ReturnVoid);
    (ops, max_locals as u32)
}

/// Builds the harness class, writes its smali source under
/// `out_dir/harness/` and assembles it. Assembly failure is fatal: a
/// partially generated harness is never linked.
pub fn generate_harness(
    hierarchy: &ClassHierarchy,
    created: &FrameworkCreatedTypes,
    owners: &CallbackOwnerMap,
    fields: &[InstrumentationField],
    accessors: &SpecializedAccessorMap,
    surface: &AccessorSurface,
    interfaces: &[CallbackInterface],
    out_dir: &Path,
    assembler: &dyn Assembler,
) -> HarnessResult<GeneratedHarness> {
    let (body, locals) = entry_method_body(
        hierarchy, created, owners, fields, accessors, surface, interfaces,
    );

    let field_defs = fields
        .iter()
        .map(|f| {
            Ok(FieldDef {
                name: f.field.name.clone(),
                flags: AccessFlags::PUBLIC | AccessFlags::STATIC,
                signature: TypeSignature::from_jni(&f.field.descriptor)?,
            })
        })
        .collect::<HarnessResult<Vec<_>>>()?;

    let entry_signature = MethodSignature::from_jni("([Ljava/lang/String;)V")?;
    let class = ClassDef {
        name: ObjectIdentifier::from_jni_type(HARNESS_CLASS)?,
        flags: AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::SYNTHETIC,
        super_class: ObjectIdentifier::from_java_type("java.lang.Object"),
        implements: Vec::new(),
        source: None,
        fields: field_defs,
        methods: vec![MethodDef {
            name: "main".to_string(),
            flags: AccessFlags::PUBLIC | AccessFlags::STATIC,
            constructor: false,
            signature: entry_signature.clone(),
            locals,
            body: Some(body),
        }],
        application: false,
        file_path: None,
    };

    let harness_dir = out_dir.join("harness");
    let source_path = harness_dir.join(emit::class_file_name(&class));
    if let Some(parent) = source_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&source_path, emit::write_class(&class))?;

    assembler
        .assemble(&harness_dir, &out_dir.join("harness.dex"))
        .map_err(|e| e.context("assembling synthetic entry class".to_string()))?;

    let entry = MethodRef::new(HARNESS_CLASS, "main", &entry_signature.to_jni());
    info!(
        "harness: {} instantiations driven, {} instrumentation fields read, entry {}",
        created.all().len(),
        fields.len(),
        entry
    );
    Ok(GeneratedHarness {
        class,
        entry,
        source_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entrypoints::{
        resolve_framework_types, FrameworkSpec, ManifestApp, PrefixPredicate,
    };
    use crate::instrument::AllocationSite;
    use crate::ops::FieldRef;
    use crate::tests::fixtures::{activity_base, class, method_stub, method_with_body, NullAssembler};
    use crate::types::AccessFlags;
    use std::collections::BTreeMap;

    fn screen_hierarchy() -> ClassHierarchy {
        let mut screen = class("Lcom/app/Screen1;", "Landroid/app/Activity;", true);
        screen.methods.push(MethodDef {
            name: "<init>".to_string(),
            flags: AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR,
            constructor: true,
            signature: MethodSignature::from_jni("()V").unwrap(),
            locals: 0,
            body: Some(vec![DexOp::ReturnVoid]),
        });
        screen
            .methods
            .push(method_stub("onCreate", "(Landroid/os/Bundle;)V"));
        screen
            .methods
            .push(method_stub("handleTap", "(Landroid/view/View;)V"));
        // A class without an accessible constructor: skipped, not fatal.
        let mut hidden = class("Lcom/app/NoCtor;", "Landroid/app/Activity;", true);
        hidden
            .methods
            .push(method_with_body("onStart", "()V", vec![DexOp::ReturnVoid]));
        ClassHierarchy::from_classes(vec![activity_base(), screen, hidden])
    }

    fn resolve(h: &ClassHierarchy) -> (FrameworkCreatedTypes, CallbackOwnerMap) {
        // handleTap arrives through the layout-declared callback path.
        let mut declared = BTreeMap::new();
        declared.insert(
            "Lcom/app/Screen1;".to_string(),
            std::collections::BTreeSet::from([MethodRef::new(
                "Lcom/app/Screen1;",
                "handleTap",
                "(Landroid/view/View;)V",
            )]),
        );
        resolve_framework_types(
            h,
            FrameworkSpec::android(),
            &ManifestApp::default(),
            &declared,
            &PrefixPredicate::default(),
        )
        .unwrap()
    }

    #[test]
    fn drives_lifecycle_and_instrumented_objects() {
        let h = screen_hierarchy();
        let (created, owners) = resolve(&h);
        let fields = vec![InstrumentationField {
            field: FieldRef::new(HARNESS_CLASS, "cb$0", "Landroid/view/View$OnClickListener;"),
            interface: "Landroid/view/View$OnClickListener;".to_string(),
            site: AllocationSite {
                class: "Lcom/app/Screen1;".to_string(),
                method: "setup".to_string(),
                index: 0,
            },
        }];
        let dir = tempfile::tempdir().unwrap();
        let generated = generate_harness(
            &h,
            &created,
            &owners,
            &fields,
            &SpecializedAccessorMap::default(),
            &AccessorSurface::android(),
            &FrameworkSpec::android().callback_interfaces,
            dir.path(),
            &NullAssembler,
        )
        .unwrap();

        assert_eq!(
            generated.entry,
            MethodRef::new(HARNESS_CLASS, "main", "([Ljava/lang/String;)V")
        );
        assert_eq!(generated.class.fields.len(), 1);

        let body = generated.class.methods[0].body.as_ref().unwrap();
        // Screen1 is instantiated and its callbacks driven.
        assert!(body.iter().any(|op| matches!(
            op,
            DexOp::NewInstance { class, .. } if class == "Lcom/app/Screen1;"
        )));
        assert!(body.iter().any(|op| matches!(
            op,
            DexOp::Invoke { method, .. } if method.name == "onCreate"
        )));
        assert!(body.iter().any(|op| matches!(
            op,
            DexOp::Invoke { method, .. } if method.name == "handleTap"
        )));
        // NoCtor is skipped entirely.
        assert!(!body.iter().any(|op| matches!(
            op,
            DexOp::NewInstance { class, .. } if class == "Lcom/app/NoCtor;"
        )));
        // The recorded allocation is driven through its field, not rebuilt.
        assert!(body.iter().any(|op| matches!(
            op,
            DexOp::SgetObject { field, .. } if field.name == "cb$0"
        )));
        assert!(body.iter().any(|op| matches!(
            op,
            DexOp::Invoke { kind: InvokeKind::Interface, method, .. }
                if method.name == "onClick"
        )));
        assert!(!body.iter().any(|op| matches!(
            op,
            DexOp::NewInstance { class, .. } if class == "Lcom/app/ClickListenerImpl;"
        )));

        // The smali source landed on disk.
        let smali = std::fs::read_to_string(&generated.source_path).unwrap();
        assert!(smali.contains(".class public final synthetic Lharness/Main;"));
        assert!(smali.contains(".field public static cb$0:Landroid/view/View$OnClickListener;"));
    }

    #[test]
    fn typed_views_fetched_through_accessors() {
        let h = screen_hierarchy();
        let (created, owners) = resolve(&h);

        // Build an accessor map whose single accessor returns the exact
        // parameter type of handleTap.
        use crate::layout::{LayoutElement, LayoutId};
        let owner = ObjectIdentifier::from_java_type("com.app.Screen1");
        let lm = crate::layout::resolve_layouts(
            &h,
            &[(
                owner,
                LayoutElement::View {
                    id: LayoutId(0x7f0b0001),
                    class: ObjectIdentifier::from_java_type("android.view.View"),
                    callback: None,
                },
            )],
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (_, accessors) = crate::accessors::generate_accessors(
            &lm,
            &AccessorSurface::android(),
            dir.path(),
            &NullAssembler,
        )
        .unwrap();

        let generated = generate_harness(
            &h,
            &created,
            &owners,
            &[],
            &accessors,
            &AccessorSurface::android(),
            &FrameworkSpec::android().callback_interfaces,
            dir.path(),
            &NullAssembler,
        )
        .unwrap();

        let body = generated.class.methods[0].body.as_ref().unwrap();
        assert!(body.iter().any(|op| matches!(
            op,
            DexOp::Invoke { kind: InvokeKind::Static, method, .. }
                if method.class == crate::accessors::STUBS_CLASS
        )));
    }
}
