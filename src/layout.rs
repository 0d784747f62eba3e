//! Layout-declared callbacks: resolution of UI-resource elements against the
//! classes that inflate them, and collection of the callbacks those elements
//! declare inline.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::fail;
use crate::hierarchy::{ClassHierarchy, MethodLookup};
use crate::ops::MethodRef;
use crate::types::{HarnessResult, ObjectIdentifier};

/// Numeric identifier assigned to a layout element by the resource compiler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LayoutId(pub i32);

impl fmt::Display for LayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A parsed UI-resource node, produced by the external layout parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LayoutElement {
    /// A view, optionally carrying an inline-declared callback method name
    /// (e.g. `android:onClick="handleTap"`).
    View {
        id: LayoutId,
        class: ObjectIdentifier,
        callback: Option<String>,
    },
    /// A fragment declaration. Recognized but not modeled.
    Fragment { id: LayoutId, class: ObjectIdentifier },
}

impl LayoutElement {
    pub fn id(&self) -> LayoutId {
        match self {
            LayoutElement::View { id, .. } | LayoutElement::Fragment { id, .. } => *id,
        }
    }

    pub fn class(&self) -> &ObjectIdentifier {
        match self {
            LayoutElement::View { class, .. } | LayoutElement::Fragment { class, .. } => class,
        }
    }
}

/// Mapping from application class to the layout elements it inflates.
#[derive(Debug, Default)]
pub struct LayoutMap {
    by_owner: BTreeMap<String, Vec<LayoutElement>>,
}

impl LayoutMap {
    pub fn owners(&self) -> impl Iterator<Item = (&str, &[LayoutElement])> {
        self.by_owner.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn elements_of(&self, owner_jni: &str) -> &[LayoutElement] {
        self.by_owner
            .get(owner_jni)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Every element in the map, across owners.
    pub fn elements(&self) -> impl Iterator<Item = &LayoutElement> {
        self.by_owner.values().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.by_owner.is_empty()
    }
}

/// Builds the [`LayoutMap`] from the externally produced seed of
/// (owning class, element) pairs, validating inline callback declarations.
///
/// A `View` declaring a callback name must resolve to exactly one method on
/// the owning class; a missing or ambiguous method is fatal since the
/// resource description and the binary disagree. Fragments are accepted but
/// their lifecycle is not modeled; each emits a warning.
pub fn resolve_layouts(
    hierarchy: &ClassHierarchy,
    seed: &[(ObjectIdentifier, LayoutElement)],
) -> HarnessResult<LayoutMap> {
    let mut map = LayoutMap::default();
    for (owner, element) in seed {
        let owner_jni = owner.as_jni_type();
        let owner_class = match hierarchy.get(&owner_jni) {
            Some(c) => c,
            None => {
                fail!(
                    "layout element {} is owned by unresolvable class {}",
                    element.id(),
                    owner.as_java_type()
                );
            }
        };

        match element {
            LayoutElement::View {
                id,
                callback: Some(name),
                ..
            } => match hierarchy.lookup_method_by_name(owner_class, name) {
                MethodLookup::Unique(_) => {}
                MethodLookup::Missing => {
                    fail!(
                        "layout id {} declares callback '{}' but {} has no such method",
                        id,
                        name,
                        owner.as_java_type()
                    );
                }
                MethodLookup::Ambiguous(n) => {
                    fail!(
                        "layout id {} declares callback '{}' but {} has {} methods of that name",
                        id,
                        name,
                        owner.as_java_type(),
                        n
                    );
                }
            },
            LayoutElement::Fragment { id, class } => {
                warn!(
                    "fragment {} (layout id {}) in {}: fragment lifecycle is not modeled, skipping",
                    class.as_java_type(),
                    id,
                    owner.as_java_type()
                );
            }
            LayoutElement::View { .. } => {}
        }

        map.by_owner
            .entry(owner_jni)
            .or_default()
            .push(element.clone());
    }
    info!(
        "layout map: {} owning classes",
        map.by_owner.len()
    );
    Ok(map)
}

/// Collects the configuration-declared callbacks out of a resolved
/// [`LayoutMap`]: owning class → set of callback method references.
///
/// Pure function; uniqueness of each named method was already enforced by
/// [`resolve_layouts`], so resolution here cannot fail.
pub fn collect_declared_callbacks(
    hierarchy: &ClassHierarchy,
    layouts: &LayoutMap,
) -> BTreeMap<String, BTreeSet<MethodRef>> {
    let mut out: BTreeMap<String, BTreeSet<MethodRef>> = BTreeMap::new();
    for (owner, elements) in layouts.owners() {
        let owner_class = match hierarchy.get(owner) {
            Some(c) => c,
            None => continue,
        };
        for element in elements {
            if let LayoutElement::View {
                callback: Some(name),
                ..
            } = element
            {
                if let MethodLookup::Unique(m) =
                    hierarchy.lookup_method_by_name(owner_class, name)
                {
                    out.entry(owner.to_string()).or_default().insert(
                        MethodRef::new(owner, &m.name, &m.signature.to_jni()),
                    );
                }
            }
        }
    }
    out
}
