/* Core model shared by every pass: JNI descriptors, access flags and the
   class/method/field shape the external dex front end hands us. */

use bitflags::bitflags;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::multi::many0;
use nom::{IResult, Parser};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::PathBuf;

use crate::ops::DexOp;

/// Result alias used throughout the crate.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error raised by any stage of the synthesis pipeline.
///
/// Carries the original message plus a stack of contexts added as the error
/// propagates outward, so a failure deep in instrumentation still names the
/// class and method it occurred in.
#[derive(Debug, PartialEq, Eq)]
pub struct HarnessError {
    msg: String,
    contexts: Vec<String>,
}

impl HarnessError {
    pub fn new(msg: impl Into<String>) -> Self {
        HarnessError {
            msg: msg.into(),
            contexts: Vec::new(),
        }
    }

    pub fn with_context(base: HarnessError, context: String) -> Self {
        let mut contexts = base.contexts;
        contexts.push(context);
        HarnessError {
            msg: base.msg,
            contexts,
        }
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        HarnessError::with_context(self, context.into())
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts {
            write!(f, "{connector}{context}")?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for HarnessError {}

impl From<io::Error> for HarnessError {
    fn from(value: io::Error) -> Self {
        HarnessError::new(format!("I/O error: {value}"))
    }
}

impl From<zip::result::ZipError> for HarnessError {
    fn from(value: zip::result::ZipError) -> Self {
        HarnessError::new(format!("archive error: {value}"))
    }
}

#[macro_export]
macro_rules! fail {
    ($msg:literal) => {
        return Err($crate::types::HarnessError::new($msg))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        return Err($crate::types::HarnessError::new(format!($fmtstr, $($args)*)))
    };
}

/// Represents a Java object identifier, stored in JNI form without the
/// surrounding `L`/`;`.
///
/// # Examples
///
/// ```
/// use droidharness::types::ObjectIdentifier;
///
/// let o = ObjectIdentifier::from_java_type("com.basic.Test");
/// assert_eq!(o.as_java_type(), "com.basic.Test");
/// assert_eq!(o.as_jni_type(), "Lcom/basic/Test;");
/// ```
#[derive(Debug, Clone, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentifier {
    class_name: String,
}

impl PartialEq for ObjectIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.class_name == other.class_name
    }
}

impl Hash for ObjectIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class_name.hash(state);
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_jni_type())
    }
}

impl ObjectIdentifier {
    pub fn from_jni_type(t: &str) -> HarnessResult<ObjectIdentifier> {
        let inner = t
            .strip_prefix('L')
            .and_then(|s| s.strip_suffix(';'))
            .ok_or_else(|| HarnessError::new(format!("not a JNI object type: {t}")))?;
        Ok(ObjectIdentifier {
            class_name: inner.to_string(),
        })
    }

    pub fn from_java_type(t: &str) -> ObjectIdentifier {
        ObjectIdentifier {
            class_name: t.replace('.', "/"),
        }
    }

    pub fn as_jni_type(&self) -> String {
        format!("L{};", self.class_name)
    }

    pub fn as_java_type(&self) -> String {
        self.class_name.replace('/', ".")
    }

    /// The simple (unqualified) class name.
    pub fn simple_name(&self) -> &str {
        self.class_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.class_name)
    }

    /// Inner classes carry a `$` in their simple name.
    pub fn is_inner_class(&self) -> bool {
        self.simple_name().contains('$')
    }
}

/// Represents a Java type: array, object or primitive.
///
/// # Examples
///
/// ```
/// use droidharness::types::TypeSignature;
///
/// let t = TypeSignature::Bool;
/// assert_eq!(t.to_jni(), "Z");
/// ```
#[derive(Debug, Clone, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeSignature {
    Array(Box<TypeSignature>),
    Object(ObjectIdentifier),
    Int,
    Bool,
    Byte,
    Char,
    Short,
    Long,
    Float,
    Double,
    Void,
}

impl PartialEq for TypeSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_jni() == other.to_jni()
    }
}

impl Hash for TypeSignature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_jni().hash(state);
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_jni())
    }
}

impl TypeSignature {
    pub fn from_jni(s: &str) -> HarnessResult<TypeSignature> {
        match parse_typesignature(s) {
            Ok(("", ts)) => Ok(ts),
            Ok((rest, _)) => Err(HarnessError::new(format!(
                "trailing input '{rest}' in type descriptor: {s}"
            ))),
            Err(_) => Err(HarnessError::new(format!("invalid type descriptor: {s}"))),
        }
    }

    pub fn object(class: &ObjectIdentifier) -> TypeSignature {
        TypeSignature::Object(class.clone())
    }

    pub fn to_jni(&self) -> String {
        match self {
            TypeSignature::Array(a) => format!("[{}", a.to_jni()),
            TypeSignature::Object(o) => o.as_jni_type(),
            TypeSignature::Bool => "Z".to_string(),
            TypeSignature::Byte => "B".to_string(),
            TypeSignature::Char => "C".to_string(),
            TypeSignature::Short => "S".to_string(),
            TypeSignature::Int => "I".to_string(),
            TypeSignature::Long => "J".to_string(),
            TypeSignature::Float => "F".to_string(),
            TypeSignature::Double => "D".to_string(),
            TypeSignature::Void => "V".to_string(),
        }
    }

    pub fn to_java(&self) -> String {
        match self {
            TypeSignature::Array(a) => format!("{}[]", a.to_java()),
            TypeSignature::Object(o) => o.as_java_type(),
            TypeSignature::Bool => "boolean".to_string(),
            TypeSignature::Byte => "byte".to_string(),
            TypeSignature::Char => "char".to_string(),
            TypeSignature::Short => "short".to_string(),
            TypeSignature::Int => "int".to_string(),
            TypeSignature::Long => "long".to_string(),
            TypeSignature::Float => "float".to_string(),
            TypeSignature::Double => "double".to_string(),
            TypeSignature::Void => "void".to_string(),
        }
    }

    /// Longs and doubles occupy a register pair.
    pub fn is_wide(&self) -> bool {
        matches!(self, TypeSignature::Long | TypeSignature::Double)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, TypeSignature::Object(_) | TypeSignature::Array(_))
    }
}

/// Represents a method signature: argument types and a return type.
///
/// # Examples
///
/// ```
/// use droidharness::types::{MethodSignature, TypeSignature};
///
/// let m = MethodSignature::from_jni("([I)V").unwrap();
/// assert_eq!(m.result, TypeSignature::Void);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodSignature {
    pub args: Vec<TypeSignature>,
    pub result: TypeSignature,
}

impl MethodSignature {
    pub fn from_jni(s: &str) -> HarnessResult<MethodSignature> {
        match parse_methodsignature(s) {
            Ok(("", m)) => Ok(m),
            _ => Err(HarnessError::new(format!("invalid method descriptor: {s}"))),
        }
    }

    pub fn to_jni(&self) -> String {
        let mut s = String::from("(");
        for t in &self.args {
            s.push_str(&t.to_jni());
        }
        s.push(')');
        s.push_str(&self.result.to_jni());
        s
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_jni())
    }
}

fn parse_typesignature(input: &str) -> IResult<&str, TypeSignature> {
    // Object type
    if let Ok((rest, _)) = tag::<_, _, nom::error::Error<&str>>("L").parse(input) {
        let (rest, name) = take_while1(|c| c != ';')(rest)?;
        let (rest, _) = tag(";")(rest)?;
        return Ok((
            rest,
            TypeSignature::Object(ObjectIdentifier {
                class_name: name.to_string(),
            }),
        ));
    }

    // Array
    if let Ok((rest, _)) = tag::<_, _, nom::error::Error<&str>>("[").parse(input) {
        let (rest, inner) = parse_typesignature(rest)?;
        return Ok((rest, TypeSignature::Array(Box::new(inner))));
    }

    // Primitive
    let (rest, p) = alt((
        tag("Z"),
        tag("B"),
        tag("C"),
        tag("S"),
        tag("I"),
        tag("J"),
        tag("F"),
        tag("D"),
        tag("V"),
    ))
    .parse(input)?;
    let ts = match p {
        "Z" => TypeSignature::Bool,
        "B" => TypeSignature::Byte,
        "C" => TypeSignature::Char,
        "S" => TypeSignature::Short,
        "I" => TypeSignature::Int,
        "J" => TypeSignature::Long,
        "F" => TypeSignature::Float,
        "D" => TypeSignature::Double,
        _ => TypeSignature::Void,
    };
    Ok((rest, ts))
}

fn parse_methodsignature(input: &str) -> IResult<&str, MethodSignature> {
    let (rest, _) = tag("(")(input)?;
    let (rest, args) = many0(parse_typesignature).parse(rest)?;
    let (rest, _) = tag(")")(rest)?;
    let (rest, result) = parse_typesignature(rest)?;
    Ok((rest, MethodSignature { args, result }))
}

bitflags! {
    /// Dalvik access flags as they appear on classes, fields and methods.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
    }
}

impl AccessFlags {
    /// Renders the flags the way a smali document spells them, trailing
    /// space included when non-empty.
    pub fn to_smali(&self) -> String {
        let mut out = String::new();
        for (flag, word) in [
            (AccessFlags::PUBLIC, "public"),
            (AccessFlags::PRIVATE, "private"),
            (AccessFlags::PROTECTED, "protected"),
            (AccessFlags::STATIC, "static"),
            (AccessFlags::FINAL, "final"),
            (AccessFlags::NATIVE, "native"),
            (AccessFlags::INTERFACE, "interface"),
            (AccessFlags::ABSTRACT, "abstract"),
            (AccessFlags::SYNTHETIC, "synthetic"),
            (AccessFlags::ANNOTATION, "annotation"),
            (AccessFlags::ENUM, "enum"),
        ] {
            if self.contains(flag) {
                out.push_str(word);
                out.push(' ');
            }
        }
        out
    }

    /// Widens visibility to public, leaving an already-public item untouched.
    pub fn widened_to_public(self) -> AccessFlags {
        if self.contains(AccessFlags::PUBLIC) {
            self
        } else {
            (self - AccessFlags::PRIVATE - AccessFlags::PROTECTED) | AccessFlags::PUBLIC
        }
    }
}

/// A field as declared by a class.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub flags: AccessFlags,
    pub signature: TypeSignature,
}

/// A method as declared by a class.
///
/// `body` is `None` when the front end could not decode the instruction
/// stream; such methods are skipped by the instrumenter.
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub flags: AccessFlags,
    pub constructor: bool,
    pub signature: MethodSignature,
    /// Number of non-parameter registers the body needs.
    pub locals: u32,
    pub body: Option<Vec<DexOp>>,
}

impl MethodDef {
    pub fn is_public(&self) -> bool {
        self.flags.contains(AccessFlags::PUBLIC)
    }

    pub fn is_private(&self) -> bool {
        self.flags.contains(AccessFlags::PRIVATE)
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(AccessFlags::STATIC)
    }
}

/// A class definition as produced by the external dex front end.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: ObjectIdentifier,
    pub flags: AccessFlags,
    pub super_class: ObjectIdentifier,
    pub implements: Vec<ObjectIdentifier>,
    pub source: Option<String>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
    /// True for classes belonging to the application under analysis, false
    /// for library and framework classes.
    pub application: bool,
    /// Where the original emitted form of this class lives, when it came off
    /// disk. Untouched classes are copied from here byte-for-byte.
    pub file_path: Option<PathBuf>,
}

impl ClassDef {
    pub fn is_public(&self) -> bool {
        self.flags.contains(AccessFlags::PUBLIC)
    }

    /// A class the harness can instantiate: neither abstract nor an
    /// interface, an enum or an annotation.
    pub fn is_concrete(&self) -> bool {
        !self.flags.intersects(
            AccessFlags::ABSTRACT
                | AccessFlags::INTERFACE
                | AccessFlags::ENUM
                | AccessFlags::ANNOTATION,
        )
    }

    pub fn is_interface(&self) -> bool {
        self.flags.contains(AccessFlags::INTERFACE)
    }

    /// Declared methods with the given name.
    pub fn methods_named(&self, name: &str) -> Vec<&MethodDef> {
        self.methods.iter().filter(|m| m.name == name).collect()
    }

    /// The accessible zero-argument constructor, if the class has one.
    pub fn default_constructor(&self) -> Option<&MethodDef> {
        self.methods.iter().find(|m| {
            m.constructor && m.name == "<init>" && m.signature.args.is_empty() && !m.is_private()
        })
    }
}
