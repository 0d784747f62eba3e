//! Emission of class definitions as smali documents, consumed by the
//! external assembler. Only the constructs the engine generates or rewrites
//! are supported.

use crate::types::ClassDef;

fn write_method(out: &mut String, method: &crate::types::MethodDef) {
    out.push_str(&format!(".method {}", method.flags.to_smali()));
    if method.constructor {
        out.push_str("constructor ");
    }
    out.push_str(&format!("{}{}\n", method.name, method.signature.to_jni()));

    if let Some(ops) = &method.body {
        out.push_str(&format!("    .locals {}\n", method.locals));
        for op in ops {
            out.push_str(&format!("    {op}\n"));
        }
    }

    out.push_str(".end method\n\n");
}

/// Renders a class as a smali document.
pub fn write_class(class: &ClassDef) -> String {
    let mut out = format!(
        ".class {}{}\n",
        class.flags.to_smali(),
        class.name.as_jni_type()
    );
    out.push_str(&format!(".super {}\n", class.super_class.as_jni_type()));
    if let Some(s) = &class.source {
        out.push_str(&format!(".source \"{s}\"\n"));
    }

    if !class.implements.is_empty() {
        out.push_str("\n# interfaces\n");
        for i in &class.implements {
            out.push_str(&format!(".implements {}\n", i.as_jni_type()));
        }
    }

    if !class.fields.is_empty() {
        out.push_str("\n# fields\n");
        for f in &class.fields {
            out.push_str(&format!(
                ".field {}{}:{}\n",
                f.flags.to_smali(),
                f.name,
                f.signature.to_jni()
            ));
        }
    }

    if !class.methods.is_empty() {
        out.push_str("\n# methods\n");
        for m in &class.methods {
            write_method(&mut out, m);
        }
    }

    out
}

/// The conventional file location of a class inside an output tree, e.g.
/// `com/app/Screen1.smali`.
pub fn class_file_name(class: &ClassDef) -> String {
    format!("{}.smali", class.name.as_java_type().replace('.', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{v, DexOp};
    use crate::tests::fixtures::class;
    use crate::types::{AccessFlags, FieldDef, MethodDef, MethodSignature, TypeSignature};

    #[test]
    fn emits_fields_and_methods() {
        let mut c = class("Lharness/Main;", "Ljava/lang/Object;", true);
        c.fields.push(FieldDef {
            name: "cb$0".to_string(),
            flags: AccessFlags::PUBLIC | AccessFlags::STATIC,
            signature: TypeSignature::from_jni("Landroid/view/View$OnClickListener;").unwrap(),
        });
        c.methods.push(MethodDef {
            name: "main".to_string(),
            flags: AccessFlags::PUBLIC | AccessFlags::STATIC,
            constructor: false,
            signature: MethodSignature::from_jni("([Ljava/lang/String;)V").unwrap(),
            locals: 1,
            body: Some(vec![DexOp::ReturnVoid]),
        });
        c.methods.push(MethodDef {
            name: "native0".to_string(),
            flags: AccessFlags::PUBLIC | AccessFlags::NATIVE,
            constructor: false,
            signature: MethodSignature::from_jni("()V").unwrap(),
            locals: 0,
            body: None,
        });

        let smali = write_class(&c);
        assert!(smali.starts_with(".class public Lharness/Main;\n.super Ljava/lang/Object;"));
        assert!(smali.contains(".field public static cb$0:Landroid/view/View$OnClickListener;"));
        assert!(smali.contains(".method public static main([Ljava/lang/String;)V"));
        assert!(smali.contains("    .locals 1\n    return-void\n.end method"));
        // Bodyless methods get no .locals directive.
        assert!(smali.contains(".method public native native0()V\n.end method"));
        assert_eq!(class_file_name(&c), "harness/Main.smali");
    }
}
