//! Read-only view of every class visible to analysis.
//!
//! Built once per run from the external front end's class definitions and
//! never mutated afterwards; every pass borrows it immutably.

use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{ClassDef, MethodDef};

/// Outcome of a by-name method lookup on a single class.
#[derive(Debug)]
pub enum MethodLookup<'a> {
    Unique(&'a MethodDef),
    Missing,
    Ambiguous(usize),
}

/// The whole-program class graph, keyed by JNI class name.
pub struct ClassHierarchy {
    classes: BTreeMap<String, ClassDef>,
}

impl ClassHierarchy {
    pub fn from_classes(classes: Vec<ClassDef>) -> ClassHierarchy {
        let mut map = BTreeMap::new();
        for c in classes {
            map.insert(c.name.as_jni_type(), c);
        }
        ClassHierarchy { classes: map }
    }

    pub fn get(&self, jni_name: &str) -> Option<&ClassDef> {
        self.classes.get(jni_name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.values()
    }

    /// Classes belonging to the application under analysis.
    pub fn application_classes(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.values().filter(|c| c.application)
    }

    /// Walks the superclass chain starting at (and excluding) `jni_name`,
    /// stopping when a class is not resolvable. A cycle in the front end's
    /// supertype data terminates the walk instead of looping.
    pub fn superclass_chain(&self, jni_name: &str) -> Vec<&ClassDef> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = self.get(jni_name).map(|c| c.super_class.as_jni_type());
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                break;
            }
            match self.get(&name) {
                Some(c) => {
                    current = Some(c.super_class.as_jni_type());
                    chain.push(c);
                }
                None => break,
            }
        }
        chain
    }

    /// True when `sub` equals `sup` or reaches it through superclasses or
    /// interfaces.
    pub fn is_subtype_of(&self, sub: &str, sup: &str) -> bool {
        if sub == sup {
            return true;
        }
        if self
            .superclass_chain(sub)
            .iter()
            .any(|c| c.name.as_jni_type() == sup)
        {
            return true;
        }
        self.implemented_interfaces(sub).contains(sup)
    }

    /// Every interface `jni_name` implements, transitively: through its own
    /// `implements` list, its superclasses, and interface inheritance.
    pub fn implemented_interfaces(&self, jni_name: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut work: Vec<String> = Vec::new();
        if let Some(c) = self.get(jni_name) {
            work.extend(c.implements.iter().map(|i| i.as_jni_type()));
            for sup in self.superclass_chain(jni_name) {
                work.extend(sup.implements.iter().map(|i| i.as_jni_type()));
            }
        }
        while let Some(iface) = work.pop() {
            if !out.insert(iface.clone()) {
                continue;
            }
            if let Some(c) = self.get(&iface) {
                // Interface inheritance is recorded in `implements` too.
                work.extend(c.implements.iter().map(|i| i.as_jni_type()));
            }
        }
        out
    }

    /// Application classes that transitively extend `base`.
    pub fn application_subclasses_of(&self, base: &str) -> Vec<&ClassDef> {
        self.application_classes()
            .filter(|c| {
                self.superclass_chain(&c.name.as_jni_type())
                    .iter()
                    .any(|s| s.name.as_jni_type() == base)
                    || c.super_class.as_jni_type() == base
            })
            .collect()
    }

    /// Looks up a method on `class` by bare name, reporting ambiguity.
    pub fn lookup_method_by_name<'a>(&'a self, class: &ClassDef, name: &str) -> MethodLookup<'a> {
        let jni = class.name.as_jni_type();
        let found = self
            .get(&jni)
            .map(|c| c.methods_named(name))
            .unwrap_or_default();
        match found.len() {
            0 => MethodLookup::Missing,
            1 => MethodLookup::Unique(found[0]),
            n => MethodLookup::Ambiguous(n),
        }
    }

    /// Resolves a candidate lifecycle/callback override on `class`.
    ///
    /// Searches the class and its application superclasses for a declared
    /// method with the candidate name. A declaration whose descriptor differs
    /// from the candidate (covariant return or parameter mismatch) resolves
    /// to "no override" rather than an error.
    pub fn resolve_override<'a>(
        &'a self,
        class: &'a ClassDef,
        name: &str,
        descriptor: &str,
    ) -> Option<&'a MethodDef> {
        let mut scope: Vec<&ClassDef> = vec![class];
        scope.extend(
            self.superclass_chain(&class.name.as_jni_type())
                .into_iter()
                .filter(|c| c.application),
        );
        for c in scope {
            for m in c.methods_named(name) {
                if m.signature.to_jni() == descriptor {
                    return Some(m);
                }
                debug!(
                    "covariant signature mismatch resolving {}.{}: candidate {} declares {}",
                    class.name.as_java_type(),
                    name,
                    c.name.as_java_type(),
                    m.signature.to_jni()
                );
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{activity_base, class, method_stub};
    use crate::types::AccessFlags;

    fn hierarchy() -> ClassHierarchy {
        let mut screen = class("Lcom/app/Screen1;", "Landroid/app/Activity;", true);
        screen
            .methods
            .push(method_stub("onCreate", "(Landroid/os/Bundle;)V"));
        let mut listener = class("Lcom/app/Listener;", "Ljava/lang/Object;", true);
        listener
            .implements
            .push(crate::types::ObjectIdentifier::from_jni_type("Landroid/view/View$OnClickListener;").unwrap());
        ClassHierarchy::from_classes(vec![activity_base(), screen, listener])
    }

    #[test]
    fn subtype_through_superclass() {
        let h = hierarchy();
        assert!(h.is_subtype_of("Lcom/app/Screen1;", "Landroid/app/Activity;"));
        assert!(!h.is_subtype_of("Landroid/app/Activity;", "Lcom/app/Screen1;"));
    }

    #[test]
    fn interfaces_are_transitive() {
        let h = hierarchy();
        assert!(h
            .implemented_interfaces("Lcom/app/Listener;")
            .contains("Landroid/view/View$OnClickListener;"));
        assert!(h.is_subtype_of("Lcom/app/Listener;", "Landroid/view/View$OnClickListener;"));
    }

    #[test]
    fn override_resolution_falls_back_on_mismatch() {
        let h = hierarchy();
        let screen = h.get("Lcom/app/Screen1;").unwrap();
        assert!(h
            .resolve_override(screen, "onCreate", "(Landroid/os/Bundle;)V")
            .is_some());
        // Covariant mismatch: candidate wants a different descriptor.
        assert!(h.resolve_override(screen, "onCreate", "()V").is_none());
        assert!(h.resolve_override(screen, "onStart", "()V").is_none());
    }

    #[test]
    fn cyclic_superclass_data_terminates() {
        let a = class("Lcom/app/A;", "Lcom/app/B;", true);
        let b = class("Lcom/app/B;", "Lcom/app/A;", true);
        let h = ClassHierarchy::from_classes(vec![a, b]);
        let chain = h.superclass_chain("Lcom/app/A;");
        assert_eq!(chain.len(), 2);
        assert!(h.is_subtype_of("Lcom/app/A;", "Lcom/app/B;"));
        assert!(!h.is_subtype_of("Lcom/app/A;", "Lcom/app/C;"));
    }

    #[test]
    fn ambiguous_lookup_reported() {
        let mut c = class("Lcom/app/Over;", "Ljava/lang/Object;", true);
        c.methods.push(method_stub("handleTap", "()V"));
        let mut dup = method_stub("handleTap", "(Landroid/view/View;)V");
        dup.flags = AccessFlags::PUBLIC;
        c.methods.push(dup);
        let h = ClassHierarchy::from_classes(vec![c]);
        let c = h.get("Lcom/app/Over;").unwrap();
        assert!(matches!(
            h.lookup_method_by_name(c, "handleTap"),
            MethodLookup::Ambiguous(2)
        ));
        assert!(matches!(
            h.lookup_method_by_name(c, "missing"),
            MethodLookup::Missing
        ));
    }
}
