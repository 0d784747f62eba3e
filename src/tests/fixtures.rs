//! Shared builders for the unit and scenario tests.

use std::fs;
use std::path::Path;

use crate::ops::DexOp;
use crate::toolchain::Assembler;
use crate::types::{
    AccessFlags, ClassDef, HarnessError, HarnessResult, MethodDef, MethodSignature,
    ObjectIdentifier,
};

pub fn class(jni_name: &str, super_jni: &str, application: bool) -> ClassDef {
    ClassDef {
        name: ObjectIdentifier::from_jni_type(jni_name).unwrap(),
        flags: AccessFlags::PUBLIC,
        super_class: ObjectIdentifier::from_jni_type(super_jni).unwrap(),
        implements: Vec::new(),
        source: None,
        fields: Vec::new(),
        methods: Vec::new(),
        application,
        file_path: None,
    }
}

pub fn activity_base() -> ClassDef {
    class("Landroid/app/Activity;", "Ljava/lang/Object;", false)
}

pub fn click_listener_interface() -> ClassDef {
    let mut c = class(
        "Landroid/view/View$OnClickListener;",
        "Ljava/lang/Object;",
        false,
    );
    c.flags = AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
    c.methods
        .push(method_stub("onClick", "(Landroid/view/View;)V"));
    c
}

pub fn method_stub(name: &str, descriptor: &str) -> MethodDef {
    MethodDef {
        name: name.to_string(),
        flags: AccessFlags::PUBLIC,
        constructor: false,
        signature: MethodSignature::from_jni(descriptor).unwrap(),
        locals: 0,
        body: None,
    }
}

pub fn method_with_body(name: &str, descriptor: &str, body: Vec<DexOp>) -> MethodDef {
    MethodDef {
        body: Some(body),
        locals: 4,
        ..method_stub(name, descriptor)
    }
}

pub fn default_constructor() -> MethodDef {
    MethodDef {
        name: "<init>".to_string(),
        flags: AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR,
        constructor: true,
        signature: MethodSignature::from_jni("()V").unwrap(),
        locals: 0,
        body: Some(vec![DexOp::ReturnVoid]),
    }
}

/// Succeeds without producing any output file.
pub struct NullAssembler;

impl Assembler for NullAssembler {
    fn assemble(&self, _source_dir: &Path, _output: &Path) -> HarnessResult<()> {
        Ok(())
    }
}

/// Succeeds and leaves a placeholder dex file behind, so packaging tests can
/// observe the assembled outputs in the final artifact.
pub struct MarkerAssembler;

impl Assembler for MarkerAssembler {
    fn assemble(&self, _source_dir: &Path, output: &Path) -> HarnessResult<()> {
        fs::write(output, b"dex\n")?;
        Ok(())
    }
}

pub struct FailingAssembler;

impl Assembler for FailingAssembler {
    fn assemble(&self, source_dir: &Path, _output: &Path) -> HarnessResult<()> {
        Err(HarnessError::new(format!(
            "assembler rejected {}",
            source_dir.display()
        )))
    }
}
