//! Synthesis of narrowly-typed accessor stubs.
//!
//! The generic `findViewById`-style lookup returns the base view type, which
//! loses the subtype the layout actually declares. One stub per observed
//! (id, type) pair re-states the exact type; each stub delegates to the
//! generic lookup, so redirecting a call site to it is behavior-preserving.

use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::emit;
use crate::layout::{LayoutElement, LayoutId, LayoutMap};
use crate::ops::{p, v, DexOp, InvokeKind, MethodRef};
use crate::toolchain::Assembler;
use crate::types::{
    AccessFlags, ClassDef, HarnessResult, MethodDef, MethodSignature, ObjectIdentifier,
    TypeSignature,
};

/// JNI name of the generated stubs class.
pub const STUBS_CLASS: &str = "Lharness/ViewStubs;";

/// The generic lookup surface of the target program.
#[derive(Debug, Clone)]
pub struct AccessorSurface {
    /// e.g. `Landroid/app/Activity;->findViewById(I)Landroid/view/View;`
    pub view_lookup: MethodRef,
    /// e.g. `Landroid/app/FragmentManager;->findFragmentById(I)Landroid/app/Fragment;`
    pub fragment_lookup: MethodRef,
}

impl AccessorSurface {
    pub fn android() -> AccessorSurface {
        AccessorSurface {
            view_lookup: MethodRef::new(
                "Landroid/app/Activity;",
                "findViewById",
                "(I)Landroid/view/View;",
            ),
            fragment_lookup: MethodRef::new(
                "Landroid/app/FragmentManager;",
                "findFragmentById",
                "(I)Landroid/app/Fragment;",
            ),
        }
    }
}

/// Which generic lookup an accessor wraps. A call site may only be
/// redirected to an accessor of the matching kind: the two lookups differ in
/// receiver and return types, so crossing them is not behavior-preserving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LookupKind {
    View,
    Fragment,
}

/// (Layout id, lookup kind) → the specialized accessor synthesized for it.
#[derive(Debug, Default)]
pub struct SpecializedAccessorMap {
    by_id: BTreeMap<(LayoutId, LookupKind), MethodRef>,
}

impl SpecializedAccessorMap {
    pub fn get(&self, id: LayoutId, kind: LookupKind) -> Option<&MethodRef> {
        self.by_id.get(&(id, kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayoutId, LookupKind, &MethodRef)> {
        self.by_id.iter().map(|((id, kind), m)| (*id, *kind, m))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The view accessor whose return type is exactly `jni_type`, if one
    /// exists. Fragment accessors are never returned here: their receiver is
    /// the fragment manager, not a view-lookup target.
    pub fn returning(&self, jni_type: &str) -> Option<(LayoutId, &MethodRef)> {
        self.by_id
            .iter()
            .find(|((_, kind), m)| {
                *kind == LookupKind::View && m.descriptor.ends_with(&format!("){jni_type}"))
            })
            .map(|((id, _), m)| (*id, m))
    }
}

fn receiver_of(lookup: &MethodRef) -> String {
    lookup.class.clone()
}

fn accessor_method(
    prefix: &str,
    id: LayoutId,
    suffix: usize,
    lookup: &MethodRef,
    element_type: &ObjectIdentifier,
) -> HarnessResult<MethodDef> {
    let name = if suffix == 0 {
        format!("{prefix}${:08x}", id.0 as u32)
    } else {
        format!("{prefix}${:08x}${suffix}", id.0 as u32)
    };
    let receiver = receiver_of(lookup);
    let signature = MethodSignature {
        args: vec![TypeSignature::from_jni(&receiver)?, TypeSignature::Int],
        result: TypeSignature::object(element_type),
    };
    let body = vec![
        DexOp::Invoke {
            kind: InvokeKind::Virtual,
            registers: vec![p(0), p(1)],
            method: lookup.clone(),
        },
        DexOp::MoveResultObject { dest: v(0) },
        DexOp::CheckCast {
            register: v(0),
            class: element_type.as_jni_type(),
        },
        DexOp::ReturnObject { src: v(0) },
    ];
    Ok(MethodDef {
        name,
        flags: AccessFlags::PUBLIC | AccessFlags::STATIC,
        constructor: false,
        signature,
        locals: 1,
        body: Some(body),
    })
}

/// Generates the stubs class, writes its smali source under
/// `out_dir/stubs/`, assembles it, and returns the emitted source paths plus
/// the id → accessor map.
///
/// Assembly failure is fatal for the run; instrumentation must not start
/// against accessors that do not exist in loadable form.
pub fn generate_accessors(
    layouts: &LayoutMap,
    surface: &AccessorSurface,
    out_dir: &Path,
    assembler: &dyn Assembler,
) -> HarnessResult<(Vec<PathBuf>, SpecializedAccessorMap)> {
    let mut map = SpecializedAccessorMap::default();
    let mut methods: Vec<MethodDef> = Vec::new();
    let mut seen: BTreeMap<(LayoutId, LookupKind), Vec<String>> = BTreeMap::new();

    for element in layouts.elements() {
        let (id, class, kind, prefix, lookup) = match element {
            LayoutElement::View { id, class, .. } => {
                (*id, class, LookupKind::View, "findView", &surface.view_lookup)
            }
            LayoutElement::Fragment { id, class } => (
                *id,
                class,
                LookupKind::Fragment,
                "findFragment",
                &surface.fragment_lookup,
            ),
        };
        let jni = class.as_jni_type();
        let observed = seen.entry((id, kind)).or_default();
        if observed.contains(&jni) {
            continue;
        }
        let suffix = observed.len();
        observed.push(jni);

        let method = accessor_method(prefix, id, suffix, lookup, class)?;
        let reference = MethodRef::new(STUBS_CLASS, &method.name, &method.signature.to_jni());
        if suffix == 0 {
            map.by_id.insert((id, kind), reference);
        } else {
            warn!(
                "layout id {} observed with multiple element types; keeping the first accessor \
                 for call-site redirection",
                id
            );
        }
        methods.push(method);
    }

    if methods.is_empty() {
        info!("no layout elements; skipping accessor stub generation");
        return Ok((Vec::new(), map));
    }

    let stubs = ClassDef {
        name: ObjectIdentifier::from_jni_type(STUBS_CLASS)?,
        flags: AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::SYNTHETIC,
        super_class: ObjectIdentifier::from_java_type("java.lang.Object"),
        implements: Vec::new(),
        source: None,
        fields: Vec::new(),
        methods,
        application: false,
        file_path: None,
    };

    let stubs_dir = out_dir.join("stubs");
    let source_path = stubs_dir.join(emit::class_file_name(&stubs));
    if let Some(parent) = source_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&source_path, emit::write_class(&stubs))?;

    assembler
        .assemble(&stubs_dir, &out_dir.join("stubs.dex"))
        .map_err(|e| e.context("assembling specialized accessor stubs".to_string()))?;

    info!(
        "generated {} specialized accessors across {} ids",
        stubs.methods.len(),
        map.len()
    );
    Ok((vec![source_path], map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::ClassHierarchy;
    use crate::layout::resolve_layouts;
    use crate::tests::fixtures::{activity_base, class, NullAssembler};

    fn layouts(elements: Vec<LayoutElement>) -> LayoutMap {
        let screen = class("Lcom/app/Screen1;", "Landroid/app/Activity;", true);
        let h = ClassHierarchy::from_classes(vec![activity_base(), screen]);
        let owner = ObjectIdentifier::from_java_type("com.app.Screen1");
        let seed: Vec<_> = elements.into_iter().map(|e| (owner.clone(), e)).collect();
        resolve_layouts(&h, &seed).unwrap()
    }

    #[test]
    fn distinct_ids_get_distinct_accessors() {
        let lm = layouts(vec![
            LayoutElement::View {
                id: LayoutId(0x7f0b0001),
                class: ObjectIdentifier::from_java_type("android.widget.Button"),
                callback: None,
            },
            LayoutElement::View {
                id: LayoutId(0x7f0b0002),
                class: ObjectIdentifier::from_java_type("android.widget.TextView"),
                callback: None,
            },
        ]);
        let dir = tempfile::tempdir().unwrap();
        let (paths, map) =
            generate_accessors(&lm, &AccessorSurface::android(), dir.path(), &NullAssembler)
                .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(map.len(), 2);
        let a = map.get(LayoutId(0x7f0b0001), LookupKind::View).unwrap();
        let b = map.get(LayoutId(0x7f0b0002), LookupKind::View).unwrap();
        assert_ne!(a, b);
        assert!(a.descriptor.ends_with(")Landroid/widget/Button;"));
        assert!(b.descriptor.ends_with(")Landroid/widget/TextView;"));

        let source = std::fs::read_to_string(&paths[0]).unwrap();
        assert!(source.contains(".class public final synthetic Lharness/ViewStubs;"));
        assert!(source.contains("check-cast v0, Landroid/widget/Button;"));
        assert!(source.contains(
            "invoke-virtual {p0, p1}, Landroid/app/Activity;->findViewById(I)Landroid/view/View;"
        ));
    }

    #[test]
    fn conflicting_types_at_one_id_keep_first() {
        let lm = layouts(vec![
            LayoutElement::View {
                id: LayoutId(7),
                class: ObjectIdentifier::from_java_type("android.widget.Button"),
                callback: None,
            },
            LayoutElement::View {
                id: LayoutId(7),
                class: ObjectIdentifier::from_java_type("android.widget.TextView"),
                callback: None,
            },
        ]);
        let dir = tempfile::tempdir().unwrap();
        let (_, map) =
            generate_accessors(&lm, &AccessorSurface::android(), dir.path(), &NullAssembler)
                .unwrap();
        assert_eq!(map.len(), 1);
        assert!(map
            .get(LayoutId(7), LookupKind::View)
            .unwrap()
            .descriptor
            .ends_with(")Landroid/widget/Button;"));
    }

    #[test]
    fn fragment_accessors_keyed_separately_from_views() {
        let lm = layouts(vec![
            LayoutElement::View {
                id: LayoutId(5),
                class: ObjectIdentifier::from_java_type("android.widget.Button"),
                callback: None,
            },
            LayoutElement::Fragment {
                id: LayoutId(5),
                class: ObjectIdentifier::from_java_type("com.app.DetailsFragment"),
            },
        ]);
        let dir = tempfile::tempdir().unwrap();
        let (_, map) =
            generate_accessors(&lm, &AccessorSurface::android(), dir.path(), &NullAssembler)
                .unwrap();
        assert_eq!(map.len(), 2);

        let view = map.get(LayoutId(5), LookupKind::View).unwrap();
        assert!(view.name.starts_with("findView$"));
        assert!(view.descriptor.starts_with("(Landroid/app/Activity;I)"));

        let fragment = map.get(LayoutId(5), LookupKind::Fragment).unwrap();
        assert!(fragment.name.starts_with("findFragment$"));
        assert!(fragment
            .descriptor
            .starts_with("(Landroid/app/FragmentManager;I)"));

        // Typed-argument lookup never hands out a fragment accessor.
        assert!(map.returning("Lcom/app/DetailsFragment;").is_none());
        assert!(map.returning("Landroid/widget/Button;").is_some());
    }

    #[test]
    fn assembly_failure_is_fatal() {
        use crate::tests::fixtures::FailingAssembler;
        let lm = layouts(vec![LayoutElement::View {
            id: LayoutId(1),
            class: ObjectIdentifier::from_java_type("android.widget.Button"),
            callback: None,
        }]);
        let dir = tempfile::tempdir().unwrap();
        let err = generate_accessors(
            &lm,
            &AccessorSurface::android(),
            dir.path(),
            &FailingAssembler,
        )
        .unwrap_err();
        assert!(err.to_string().contains("assembl"));
    }
}
