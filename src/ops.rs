//! The subset of Dalvik operations the engine inspects and emits.
//!
//! Literal values and symbolic references are stored directly rather than as
//! constant-pool indices, so passes can pattern-match on them without a
//! symbol table at hand. `Display` produces valid smali.

use std::fmt;

/// A Dalvik register, either a method parameter or a local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    Parameter(u16),
    Local(u16),
}

pub fn p(u: u16) -> Register {
    Register::Parameter(u)
}
pub fn v(u: u16) -> Register {
    Register::Local(u)
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Parameter(n) => write!(f, "p{n}"),
            Register::Local(n) => write!(f, "v{n}"),
        }
    }
}

/// A symbolic reference to a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodRef {
    /// The fully qualified class name, e.g. `Lcom/example/MyClass;`.
    pub class: String,
    /// The method name.
    pub name: String,
    /// The method descriptor, e.g. `(I)V`.
    pub descriptor: String,
}

impl MethodRef {
    pub fn new(class: &str, name: &str, descriptor: &str) -> MethodRef {
        MethodRef {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Example: Landroid/app/Activity;->findViewById(I)Landroid/view/View;
        write!(f, "{}->{}{}", self.class, self.name, self.descriptor)
    }
}

/// A symbolic reference to a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef {
    /// The fully qualified class name, e.g. `Lcom/example/MyClass;`.
    pub class: String,
    /// The field name.
    pub name: String,
    /// The field descriptor, e.g. `I`.
    pub descriptor: String,
}

impl FieldRef {
    pub fn new(class: &str, name: &str, descriptor: &str) -> FieldRef {
        FieldRef {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Example: Lcom/example/MyClass;->myField:I
        write!(f, "{}->{}:{}", self.class, self.name, self.descriptor)
    }
}

/// The flavour of an invoke instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    Virtual,
    Direct,
    Static,
    Interface,
    Super,
}

impl InvokeKind {
    fn mnemonic(self) -> &'static str {
        match self {
            InvokeKind::Virtual => "invoke-virtual",
            InvokeKind::Direct => "invoke-direct",
            InvokeKind::Static => "invoke-static",
            InvokeKind::Interface => "invoke-interface",
            InvokeKind::Super => "invoke-super",
        }
    }
}

/// A lifted Dalvik operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DexOp {
    Const4 {
        dest: Register,
        value: i8,
    },
    Const16 {
        dest: Register,
        value: i16,
    },
    Const {
        dest: Register,
        value: i32,
    },
    ConstWide16 {
        dest: Register,
        value: i16,
    },
    ConstString {
        dest: Register,
        value: String,
    },
    NewInstance {
        dest: Register,
        class: String,
    },
    MoveResultObject {
        dest: Register,
    },
    CheckCast {
        register: Register,
        class: String,
    },
    Invoke {
        kind: InvokeKind,
        registers: Vec<Register>,
        method: MethodRef,
    },
    SgetObject {
        dest: Register,
        field: FieldRef,
    },
    SputObject {
        src: Register,
        field: FieldRef,
    },
    ReturnVoid,
    ReturnObject {
        src: Register,
    },
}

impl DexOp {
    /// The integer constant loaded by this op, if it is a narrow const.
    pub fn const_literal(&self) -> Option<(Register, i64)> {
        match self {
            DexOp::Const4 { dest, value } => Some((*dest, *value as i64)),
            DexOp::Const16 { dest, value } => Some((*dest, *value as i64)),
            DexOp::Const { dest, value } => Some((*dest, *value as i64)),
            _ => None,
        }
    }

    /// The register this op writes, if any.
    pub fn written_register(&self) -> Option<Register> {
        match self {
            DexOp::Const4 { dest, .. }
            | DexOp::Const16 { dest, .. }
            | DexOp::Const { dest, .. }
            | DexOp::ConstWide16 { dest, .. }
            | DexOp::ConstString { dest, .. }
            | DexOp::NewInstance { dest, .. }
            | DexOp::MoveResultObject { dest }
            | DexOp::SgetObject { dest, .. } => Some(*dest),
            _ => None,
        }
    }

    /// The method invoked by this op together with its argument registers.
    pub fn invoked_method(&self) -> Option<(&MethodRef, &[Register])> {
        match self {
            DexOp::Invoke {
                registers, method, ..
            } => Some((method, registers)),
            _ => None,
        }
    }
}

fn write_registers(f: &mut fmt::Formatter<'_>, registers: &[Register]) -> fmt::Result {
    write!(f, "{{")?;
    for (i, r) in registers.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{r}")?;
    }
    write!(f, "}}")
}

impl fmt::Display for DexOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DexOp::Const4 { dest, value } => write!(f, "const/4 {dest}, {value:#x}"),
            DexOp::Const16 { dest, value } => write!(f, "const/16 {dest}, {value:#x}"),
            DexOp::Const { dest, value } => write!(f, "const {dest}, {value:#x}"),
            DexOp::ConstWide16 { dest, value } => {
                write!(f, "const-wide/16 {dest}, {value:#x}")
            }
            DexOp::ConstString { dest, value } => {
                write!(f, "const-string {dest}, \"{value}\"")
            }
            DexOp::NewInstance { dest, class } => write!(f, "new-instance {dest}, {class}"),
            DexOp::MoveResultObject { dest } => write!(f, "move-result-object {dest}"),
            DexOp::CheckCast { register, class } => {
                write!(f, "check-cast {register}, {class}")
            }
            DexOp::Invoke {
                kind,
                registers,
                method,
            } => {
                write!(f, "{} ", kind.mnemonic())?;
                write_registers(f, registers)?;
                write!(f, ", {method}")
            }
            DexOp::SgetObject { dest, field } => write!(f, "sget-object {dest}, {field}"),
            DexOp::SputObject { src, field } => write!(f, "sput-object {src}, {field}"),
            DexOp::ReturnVoid => write!(f, "return-void"),
            DexOp::ReturnObject { src } => write!(f, "return-object {src}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_smali() {
        let op = DexOp::NewInstance {
            dest: v(0),
            class: "Lcom/app/ClickListenerImpl;".to_string(),
        };
        assert_eq!(op.to_string(), "new-instance v0, Lcom/app/ClickListenerImpl;");

        let op = DexOp::Invoke {
            kind: InvokeKind::Virtual,
            registers: vec![p(0), v(1)],
            method: MethodRef::new(
                "Landroid/app/Activity;",
                "findViewById",
                "(I)Landroid/view/View;",
            ),
        };
        assert_eq!(
            op.to_string(),
            "invoke-virtual {p0, v1}, Landroid/app/Activity;->findViewById(I)Landroid/view/View;"
        );

        let op = DexOp::SputObject {
            src: v(2),
            field: FieldRef::new("Lharness/Main;", "cb$0", "Landroid/view/View$OnClickListener;"),
        };
        assert_eq!(
            op.to_string(),
            "sput-object v2, Lharness/Main;->cb$0:Landroid/view/View$OnClickListener;"
        );
    }

    #[test]
    fn registers_sort_and_key_maps() {
        let mut tracked = std::collections::BTreeMap::new();
        tracked.insert(v(1), 5i64);
        tracked.insert(p(0), 7i64);
        assert_eq!(tracked.get(&v(1)), Some(&5));

        let mut regs = vec![v(2), v(0), p(1)];
        regs.sort();
        assert_eq!(regs, vec![p(1), v(0), v(2)]);
    }

    #[test]
    fn const_literals() {
        assert_eq!(
            DexOp::Const {
                dest: v(1),
                value: 0x7f0b0001,
            }
            .const_literal(),
            Some((v(1), 0x7f0b0001))
        );
        assert_eq!(DexOp::ReturnVoid.const_literal(), None);
    }
}
