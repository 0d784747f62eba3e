//! Rewriting of the application binary: allocation recording, accessor
//! redirection and callback visibility widening.
//!
//! The pass never edits in place. It clones only the classes it actually
//! changes; the caller overlays those onto an unmodified snapshot of the
//! program, so every untouched class stays byte-identical.

use log::{debug, info, warn};
use std::collections::BTreeMap;

use crate::accessors::{AccessorSurface, LookupKind, SpecializedAccessorMap};
use crate::entrypoints::{CallbackInterface, CallbackOwnerMap};
use crate::hierarchy::ClassHierarchy;
use crate::layout::LayoutId;
use crate::ops::{DexOp, FieldRef, InvokeKind, MethodRef, Register};
use crate::types::{ClassDef, MethodDef};

/// Where an instrumented allocation occurs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationSite {
    /// JNI name of the declaring class.
    pub class: String,
    pub method: String,
    /// Index of the `new-instance` op in the original body.
    pub index: usize,
}

/// A synthetic static field on the harness class recording one allocation of
/// a callback-bearing object.
#[derive(Debug, Clone)]
pub struct InstrumentationField {
    pub field: FieldRef,
    /// The callback interface the recorded object implements.
    pub interface: String,
    pub site: AllocationSite,
}

/// Run-scoped source of globally unique field names. Threaded explicitly
/// through the pass rather than held in process state, so two sites in the
/// same class (or in different classes) can never collide.
#[derive(Debug, Default)]
pub struct FieldNamer {
    next: u32,
}

impl FieldNamer {
    pub fn fresh(&mut self) -> String {
        let n = self.next;
        self.next += 1;
        format!("cb${n}")
    }
}

/// The instrumenter's output: only the classes that changed, plus the field
/// descriptors the harness must declare and drive.
#[derive(Debug, Default)]
pub struct Instrumented {
    pub classes: Vec<ClassDef>,
    pub fields: Vec<InstrumentationField>,
}

struct MethodEdits {
    replacements: BTreeMap<usize, DexOp>,
    insertions: BTreeMap<usize, Vec<DexOp>>,
}

impl MethodEdits {
    fn is_empty(&self) -> bool {
        self.replacements.is_empty() && self.insertions.is_empty()
    }

    fn apply(mut self, body: Vec<DexOp>) -> Vec<DexOp> {
        let mut out = Vec::with_capacity(body.len() + self.insertions.len());
        for (i, op) in body.into_iter().enumerate() {
            let op = self.replacements.remove(&i).unwrap_or(op);
            out.push(op);
            if let Some(extra) = self.insertions.remove(&i) {
                out.extend(extra);
            }
        }
        out
    }
}

fn matches_lookup(hierarchy: &ClassHierarchy, method: &MethodRef, lookup: &MethodRef) -> bool {
    method.name == lookup.name
        && method.descriptor == lookup.descriptor
        && (method.class == lookup.class || hierarchy.is_subtype_of(&method.class, &lookup.class))
}

/// Finds the constructor call completing the creation expression started by
/// a `new-instance` into `dest`. Dalvik splits allocation from `<init>`, and
/// the reference is only initialized (and verifier-storable) after the
/// constructor runs.
fn constructor_index(body: &[DexOp], start: usize, dest: Register, class: &str) -> Option<usize> {
    body.iter().enumerate().skip(start + 1).find_map(|(j, op)| match op {
        DexOp::Invoke {
            kind: InvokeKind::Direct,
            registers,
            method,
        } if method.name == "<init>"
            && method.class == class
            && registers.first() == Some(&dest) =>
        {
            Some(j)
        }
        _ => None,
    })
}

fn already_recorded(body: &[DexOp], after: usize, harness_class: &str) -> bool {
    matches!(
        body.get(after + 1),
        Some(DexOp::SputObject { field, .. }) if field.class == harness_class
    )
}

fn scan_method(
    hierarchy: &ClassHierarchy,
    class: &ClassDef,
    method: &MethodDef,
    body: &[DexOp],
    accessors: &SpecializedAccessorMap,
    surface: &AccessorSurface,
    interfaces: &[CallbackInterface],
    harness_class: &str,
    namer: &mut FieldNamer,
    fields: &mut Vec<InstrumentationField>,
) -> MethodEdits {
    let mut edits = MethodEdits {
        replacements: BTreeMap::new(),
        insertions: BTreeMap::new(),
    };
    // Last known narrow integer constant per register, invalidated on write.
    let mut constants: BTreeMap<Register, i64> = BTreeMap::new();

    for (i, op) in body.iter().enumerate() {
        match op {
            DexOp::NewInstance { dest, class: created } => {
                let implemented = hierarchy.implemented_interfaces(created);
                let recognized: Vec<&CallbackInterface> = interfaces
                    .iter()
                    .filter(|iface| implemented.contains(&iface.class))
                    .collect();
                if !recognized.is_empty() {
                    match constructor_index(body, i, *dest, created) {
                        Some(j) => {
                            if already_recorded(body, j, harness_class) {
                                debug!(
                                    "{}.{}: allocation of {} already recorded",
                                    class.name.as_java_type(),
                                    method.name,
                                    created
                                );
                            } else {
                                for iface in recognized {
                                    let field = FieldRef::new(
                                        harness_class,
                                        &namer.fresh(),
                                        &iface.class,
                                    );
                                    edits.insertions.entry(j).or_default().push(
                                        DexOp::SputObject {
                                            src: *dest,
                                            field: field.clone(),
                                        },
                                    );
                                    fields.push(InstrumentationField {
                                        field,
                                        interface: iface.class.clone(),
                                        site: AllocationSite {
                                            class: class.name.as_jni_type(),
                                            method: method.name.clone(),
                                            index: i,
                                        },
                                    });
                                }
                            }
                        }
                        None => {
                            warn!(
                                "{}.{}: no constructor call found for allocation of {}, \
                                 leaving site unrecorded",
                                class.name.as_java_type(),
                                method.name,
                                created
                            );
                        }
                    }
                }
            }
            DexOp::Invoke {
                kind: InvokeKind::Virtual,
                registers,
                method: target,
            } if matches_lookup(hierarchy, target, &surface.view_lookup)
                || matches_lookup(hierarchy, target, &surface.fragment_lookup) =>
            {
                // Only an accessor of the matching kind preserves the call
                // site's receiver and return types.
                let lookup_kind = if matches_lookup(hierarchy, target, &surface.view_lookup) {
                    LookupKind::View
                } else {
                    LookupKind::Fragment
                };
                let id_register = registers.get(1);
                let literal = id_register.and_then(|r| constants.get(r).copied());
                match literal.and_then(|value| accessors.get(LayoutId(value as i32), lookup_kind))
                {
                    Some(specialized) => {
                        edits.replacements.insert(
                            i,
                            DexOp::Invoke {
                                kind: InvokeKind::Static,
                                registers: registers.clone(),
                                method: specialized.clone(),
                            },
                        );
                    }
                    None if literal.is_none() => {
                        // Documented unsoundness: dynamic ids stay generic.
                        debug!(
                            "{}.{}: non-literal id at lookup call site {}, not redirected",
                            class.name.as_java_type(),
                            method.name,
                            i
                        );
                    }
                    None => {}
                }
            }
            _ => {}
        }

        if let Some(written) = op.written_register() {
            constants.remove(&written);
        }
        if let Some((dest, value)) = op.const_literal() {
            constants.insert(dest, value);
        }
    }

    edits
}

/// Runs the instrumentation pass over every application class.
///
/// Classes or methods whose instruction stream is unavailable are skipped
/// with a warning; partial coverage is acceptable. Methods registered in the
/// callback-owner map are widened to public so the harness can invoke them.
pub fn instrument_application(
    hierarchy: &ClassHierarchy,
    owners: &CallbackOwnerMap,
    accessors: &SpecializedAccessorMap,
    interfaces: &[CallbackInterface],
    surface: &AccessorSurface,
    harness_class: &str,
    namer: &mut FieldNamer,
) -> Instrumented {
    let mut out = Instrumented::default();

    for class in hierarchy.application_classes() {
        let jni = class.name.as_jni_type();
        let mut edited: Option<ClassDef> = None;

        for (m_idx, method) in class.methods.iter().enumerate() {
            // Visibility widening for callbacks invoked from the harness.
            if owners.is_callback(&jni, &method.name, &method.signature.to_jni())
                && !method.is_public()
            {
                let target = edited.get_or_insert_with(|| class.clone());
                target.methods[m_idx].flags = method.flags.widened_to_public();
                debug!(
                    "widened {}.{} to public",
                    class.name.as_java_type(),
                    method.name
                );
            }

            let body = match &method.body {
                Some(b) => b,
                None => {
                    warn!(
                        "{}.{}: instruction stream unavailable, skipping",
                        class.name.as_java_type(),
                        method.name
                    );
                    continue;
                }
            };

            let edits = scan_method(
                hierarchy,
                class,
                method,
                body,
                accessors,
                surface,
                interfaces,
                harness_class,
                namer,
                &mut out.fields,
            );
            if !edits.is_empty() {
                let target = edited.get_or_insert_with(|| class.clone());
                let body = target.methods[m_idx]
                    .body
                    .take()
                    .unwrap_or_else(|| body.clone());
                target.methods[m_idx].body = Some(edits.apply(body));
            }
        }

        if let Some(c) = edited {
            out.classes.push(c);
        }
    }

    info!(
        "instrumentation: {} classes rewritten, {} fields created",
        out.classes.len(),
        out.fields.len()
    );
    out
}
