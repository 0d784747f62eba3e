//! Discovery of framework-created types and the callbacks the framework will
//! invoke on them.
//!
//! The framework model ([`FrameworkSpec`]) is data, not code: base types with
//! candidate lifecycle signatures plus recognized callback interfaces, all
//! serde-loadable so a per-framework-version catalog can replace the
//! built-in one.

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::fail;
use crate::hierarchy::ClassHierarchy;
use crate::ops::MethodRef;
use crate::types::{HarnessError, HarnessResult};

/// A named method signature, e.g. `onCreate(Landroid/os/Bundle;)V`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackSignature {
    pub name: String,
    pub descriptor: String,
}

impl CallbackSignature {
    pub fn new(name: &str, descriptor: &str) -> CallbackSignature {
        CallbackSignature {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

/// A framework base type whose subclasses the runtime instantiates itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkBaseType {
    /// JNI name, e.g. `Landroid/app/Activity;`.
    pub class: String,
    /// Candidate lifecycle methods a subclass may override.
    pub lifecycle: Vec<CallbackSignature>,
}

/// An interface whose implementors receive framework callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackInterface {
    /// JNI name, e.g. `Landroid/view/View$OnClickListener;`.
    pub class: String,
    /// The callback methods the interface declares.
    pub methods: Vec<CallbackSignature>,
}

/// The framework model driving entrypoint inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkSpec {
    pub base_types: Vec<FrameworkBaseType>,
    pub callback_interfaces: Vec<CallbackInterface>,
}

impl FrameworkSpec {
    pub fn from_json(json: &str) -> HarnessResult<FrameworkSpec> {
        serde_json::from_str(json)
            .map_err(|e| HarnessError::new(format!("invalid framework spec: {e}")))
    }

    /// The built-in Android model.
    pub fn android() -> &'static FrameworkSpec {
        &ANDROID_SPEC
    }

    pub fn interface(&self, jni_name: &str) -> Option<&CallbackInterface> {
        self.callback_interfaces
            .iter()
            .find(|i| i.class == jni_name)
    }
}

static ANDROID_SPEC: Lazy<FrameworkSpec> = Lazy::new(|| FrameworkSpec {
    base_types: vec![
        FrameworkBaseType {
            class: "Landroid/app/Activity;".to_string(),
            lifecycle: vec![
                CallbackSignature::new("onCreate", "(Landroid/os/Bundle;)V"),
                CallbackSignature::new("onStart", "()V"),
                CallbackSignature::new("onRestart", "()V"),
                CallbackSignature::new("onResume", "()V"),
                CallbackSignature::new("onPause", "()V"),
                CallbackSignature::new("onStop", "()V"),
                CallbackSignature::new("onDestroy", "()V"),
            ],
        },
        FrameworkBaseType {
            class: "Landroid/app/Service;".to_string(),
            lifecycle: vec![
                CallbackSignature::new("onCreate", "()V"),
                CallbackSignature::new("onStartCommand", "(Landroid/content/Intent;II)I"),
                CallbackSignature::new(
                    "onBind",
                    "(Landroid/content/Intent;)Landroid/os/IBinder;",
                ),
                CallbackSignature::new("onDestroy", "()V"),
            ],
        },
        FrameworkBaseType {
            class: "Landroid/content/BroadcastReceiver;".to_string(),
            lifecycle: vec![CallbackSignature::new(
                "onReceive",
                "(Landroid/content/Context;Landroid/content/Intent;)V",
            )],
        },
        FrameworkBaseType {
            class: "Landroid/content/ContentProvider;".to_string(),
            lifecycle: vec![CallbackSignature::new("onCreate", "()Z")],
        },
        FrameworkBaseType {
            class: "Landroid/app/Application;".to_string(),
            lifecycle: vec![
                CallbackSignature::new("onCreate", "()V"),
                CallbackSignature::new("onTerminate", "()V"),
            ],
        },
    ],
    callback_interfaces: vec![
        CallbackInterface {
            class: "Landroid/view/View$OnClickListener;".to_string(),
            methods: vec![CallbackSignature::new("onClick", "(Landroid/view/View;)V")],
        },
        CallbackInterface {
            class: "Landroid/view/View$OnLongClickListener;".to_string(),
            methods: vec![CallbackSignature::new(
                "onLongClick",
                "(Landroid/view/View;)Z",
            )],
        },
        CallbackInterface {
            class: "Landroid/view/View$OnTouchListener;".to_string(),
            methods: vec![CallbackSignature::new(
                "onTouch",
                "(Landroid/view/View;Landroid/view/MotionEvent;)Z",
            )],
        },
    ],
});

/// The app description extracted from the manifest by the external parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestApp {
    /// JNI names of the declared top-level components.
    pub components: Vec<String>,
}

impl ManifestApp {
    pub fn from_json(json: &str) -> HarnessResult<ManifestApp> {
        serde_json::from_str(json)
            .map_err(|e| HarnessError::new(format!("invalid manifest description: {e}")))
    }
}

/// Decides whether a bare method name signals a framework callback.
///
/// The default is the `on*` prefix heuristic; swap in an exhaustive
/// per-framework-version catalog without touching the resolver.
pub trait CallbackPredicate {
    fn is_callback_name(&self, name: &str) -> bool;
}

/// The fallback naming-convention heuristic.
pub struct PrefixPredicate {
    prefix: String,
}

impl PrefixPredicate {
    pub fn new(prefix: &str) -> PrefixPredicate {
        PrefixPredicate {
            prefix: prefix.to_string(),
        }
    }
}

impl Default for PrefixPredicate {
    fn default() -> Self {
        PrefixPredicate::new("on")
    }
}

impl CallbackPredicate for PrefixPredicate {
    fn is_callback_name(&self, name: &str) -> bool {
        name.len() > self.prefix.len() && name.starts_with(&self.prefix)
    }
}

/// Mapping from framework base type to the concrete application subclasses
/// the runtime may instantiate.
#[derive(Debug, Default)]
pub struct FrameworkCreatedTypes {
    by_base: BTreeMap<String, BTreeSet<String>>,
}

impl FrameworkCreatedTypes {
    pub fn subclasses_of(&self, base: &str) -> impl Iterator<Item = &str> {
        self.by_base
            .get(base)
            .into_iter()
            .flatten()
            .map(|s| s.as_str())
    }

    /// Union of all discovered framework-created types.
    pub fn all(&self) -> BTreeSet<&str> {
        self.by_base
            .values()
            .flatten()
            .map(|s| s.as_str())
            .collect()
    }

    pub fn contains(&self, jni_name: &str) -> bool {
        self.by_base.values().any(|s| s.contains(jni_name))
    }
}

/// Mapping from application class to every callback method the framework
/// will invoke on its instances. Immutable once the resolver returns it.
#[derive(Debug, Default)]
pub struct CallbackOwnerMap {
    by_owner: BTreeMap<String, BTreeSet<MethodRef>>,
}

impl CallbackOwnerMap {
    pub fn add(&mut self, owner: &str, method: MethodRef) {
        self.by_owner
            .entry(owner.to_string())
            .or_default()
            .insert(method);
    }

    pub fn owners(&self) -> impl Iterator<Item = (&str, &BTreeSet<MethodRef>)> {
        self.by_owner.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn callbacks_of(&self, owner: &str) -> Option<&BTreeSet<MethodRef>> {
        self.by_owner.get(owner)
    }

    /// True when `method` on `owner` is registered as a callback.
    pub fn is_callback(&self, owner: &str, name: &str, descriptor: &str) -> bool {
        self.by_owner
            .get(owner)
            .map(|set| {
                set.iter()
                    .any(|m| m.name == name && m.descriptor == descriptor)
            })
            .unwrap_or(false)
    }
}

/// Resolves framework-created types and seeds the callback-owner map.
///
/// A subclass qualifies only if it is public, concrete and not an inner
/// class, since the harness cannot soundly instantiate anything else.
/// Per subclass the owner map receives: resolved lifecycle overrides,
/// naming-convention matches, and the layout-declared callbacks.
///
/// Every manifest component must turn up in the resolved map; a mismatch
/// means the manifest and the binary disagree about the app's structure and
/// is fatal.
pub fn resolve_framework_types(
    hierarchy: &ClassHierarchy,
    spec: &FrameworkSpec,
    manifest: &ManifestApp,
    declared: &BTreeMap<String, BTreeSet<MethodRef>>,
    predicate: &dyn CallbackPredicate,
) -> HarnessResult<(FrameworkCreatedTypes, CallbackOwnerMap)> {
    let mut created = FrameworkCreatedTypes::default();
    let mut owners = CallbackOwnerMap::default();

    for base in &spec.base_types {
        for class in hierarchy.application_subclasses_of(&base.class) {
            let jni = class.name.as_jni_type();
            if !class.is_public() || !class.is_concrete() || class.name.is_inner_class() {
                debug!(
                    "skipping {}: not instantiable from synthesized code",
                    class.name.as_java_type()
                );
                continue;
            }
            created
                .by_base
                .entry(base.class.clone())
                .or_default()
                .insert(jni.clone());

            // Lifecycle overrides, tolerant of covariant mismatches.
            for candidate in &base.lifecycle {
                if let Some(m) =
                    hierarchy.resolve_override(class, &candidate.name, &candidate.descriptor)
                {
                    owners.add(&jni, MethodRef::new(&jni, &m.name, &m.signature.to_jni()));
                }
            }

            // Naming-convention matches with fully concrete parameter types.
            for m in &class.methods {
                if m.is_private() || m.is_static() || m.constructor {
                    continue;
                }
                if !predicate.is_callback_name(&m.name) {
                    continue;
                }
                let generic_param = m
                    .signature
                    .args
                    .iter()
                    .any(|t| t.to_jni() == "Ljava/lang/Object;");
                if generic_param {
                    debug!(
                        "excluding {}.{}: object-typed parameter",
                        class.name.as_java_type(),
                        m.name
                    );
                    continue;
                }
                owners.add(&jni, MethodRef::new(&jni, &m.name, &m.signature.to_jni()));
            }

            // Layout-declared callbacks for this class.
            if let Some(set) = declared.get(&jni) {
                for m in set {
                    owners.add(&jni, m.clone());
                }
            }
        }
    }

    // The manifest and the resolved hierarchy must agree.
    let all = created.all();
    for component in &manifest.components {
        if !all.contains(component.as_str()) {
            fail!(
                "manifest component {} was not resolved as a framework-created type \
                 (missing, abstract, non-public or inner?)",
                component
            );
        }
    }

    info!(
        "framework-created types: {} across {} base types",
        all.len(),
        created.by_base.len()
    );
    Ok((created, owners))
}
