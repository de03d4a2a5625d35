//! Immutable class descriptors as produced by the parser.
//!
//! A `ClassFile` is parsed once per class and never mutated afterwards. The
//! raw constant pool is retained because the interpreter decodes `ldc`,
//! field-ref and method-ref operands against it at run time.

use crate::access::AccessFlags;
use crate::errors::VmError;
use crate::types::{parse_method_descriptor, Signature, Type};

use std::rc::Rc;

/// `CpEntry` represents constant pool entries.
#[derive(Debug, Clone)]
pub enum CpEntry {
    Class {
        name_index: u16,
    },
    FieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    MethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    String {
        string_index: u16,
    },
    Integer {
        bytes: u32,
    },
    Float {
        bytes: u32,
    },
    Long {
        hi_bytes: u32,
        lo_bytes: u32,
    },
    Double {
        hi_bytes: u32,
        lo_bytes: u32,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    Utf8 {
        bytes: String,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    // Fills index 0 and the upper slot of long/double entries.
    Unspecified,
}

/// One row of a method's exception-handler table. `catch_type` of `None`
/// catches everything (a `finally` range).
#[derive(Debug, Clone)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: Option<String>,
}

/// Bytecode body of a method, from the `Code` attribute.
#[derive(Debug, Clone)]
pub struct CodeBody {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytecode: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
}

#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: String,
    pub ty: Type,
    pub flags: AccessFlags,
}

#[derive(Debug, Clone)]
pub struct MethodDesc {
    pub signature: Signature,
    pub flags: AccessFlags,
    pub args: Vec<Type>,
    pub ret: Type,
    /// Absent for `abstract` and `native` declarations.
    pub code: Option<Rc<CodeBody>>,
}

impl MethodDesc {
    /// Number of local-variable slots the declared arguments occupy, with
    /// two-word kinds counted twice. Excludes the receiver.
    pub fn arg_slots(&self) -> usize {
        self.args.iter().map(Type::word_size).sum()
    }
}

/// Immutable record of a parsed class.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<FieldDesc>,
    pub methods: Vec<MethodDesc>,
    pub flags: AccessFlags,
    pub constant_pool: Vec<CpEntry>,
    pub major_version: u16,
    pub minor_version: u16,
}

impl ClassFile {
    /// Builds a descriptor without going through the parser. Used for the
    /// bootstrap classes the table synthesizes when no class file exists on
    /// the class path.
    pub fn synthetic(
        name: &str,
        super_name: Option<&str>,
        interfaces: &[&str],
        fields: Vec<FieldDesc>,
        flags: AccessFlags,
    ) -> Self {
        Self {
            name: name.to_string(),
            super_name: super_name.map(str::to_string),
            interfaces: interfaces.iter().map(|s| (*s).to_string()).collect(),
            fields,
            methods: Vec::new(),
            flags,
            constant_pool: Vec::new(),
            major_version: 52,
            minor_version: 0,
        }
    }

    /// Looks up a declared method by full signature.
    pub fn method(&self, signature: &Signature) -> Option<&MethodDesc> {
        self.methods.iter().find(|m| &m.signature == signature)
    }

    /// Looks up a declared method by bare name; used at the embedding
    /// boundary where the caller supplies no descriptor.
    pub fn method_named(&self, name: &str) -> Option<&MethodDesc> {
        self.methods.iter().find(|m| m.signature.name == name)
    }

    pub fn constant_at(&self, index: u16) -> Result<&CpEntry, VmError> {
        self.constant_pool.get(index as usize).ok_or_else(|| {
            VmError::Internal(format!(
                "constant pool index {index} out of range in {}",
                self.name
            ))
        })
    }

    pub fn utf8_at(&self, index: u16) -> Result<&str, VmError> {
        match self.constant_at(index)? {
            CpEntry::Utf8 { bytes } => Ok(bytes),
            other => Err(self.bad_entry(index, "Utf8", other)),
        }
    }

    pub fn class_name_at(&self, index: u16) -> Result<&str, VmError> {
        match self.constant_at(index)? {
            CpEntry::Class { name_index } => self.utf8_at(*name_index),
            other => Err(self.bad_entry(index, "Class", other)),
        }
    }

    pub fn name_and_type_at(
        &self,
        index: u16,
    ) -> Result<(&str, &str), VmError> {
        match self.constant_at(index)? {
            CpEntry::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8_at(*name_index)?, self.utf8_at(*descriptor_index)?)),
            other => Err(self.bad_entry(index, "NameAndType", other)),
        }
    }

    /// Decodes a field reference into (owner class, field name, field
    /// descriptor).
    pub fn field_ref_at(
        &self,
        index: u16,
    ) -> Result<(&str, &str, &str), VmError> {
        match self.constant_at(index)? {
            CpEntry::FieldRef {
                class_index,
                name_and_type_index,
            } => {
                let owner = self.class_name_at(*class_index)?;
                let (name, descriptor) =
                    self.name_and_type_at(*name_and_type_index)?;
                Ok((owner, name, descriptor))
            }
            other => Err(self.bad_entry(index, "FieldRef", other)),
        }
    }

    /// Decodes a method or interface-method reference into (owner class,
    /// method name, method descriptor).
    pub fn method_ref_at(
        &self,
        index: u16,
    ) -> Result<(&str, &str, &str), VmError> {
        match self.constant_at(index)? {
            CpEntry::MethodRef {
                class_index,
                name_and_type_index,
            }
            | CpEntry::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => {
                let owner = self.class_name_at(*class_index)?;
                let (name, descriptor) =
                    self.name_and_type_at(*name_and_type_index)?;
                Ok((owner, name, descriptor))
            }
            other => Err(self.bad_entry(index, "MethodRef", other)),
        }
    }

    fn bad_entry(&self, index: u16, expected: &str, got: &CpEntry) -> VmError {
        VmError::Internal(format!(
            "constant {index} in {} is not {expected}: {got:?}",
            self.name
        ))
    }
}

/// Convenience constructor for field descriptors, used by the bootstrap
/// classes and tests.
pub fn field(name: &str, ty: Type) -> FieldDesc {
    FieldDesc {
        name: name.to_string(),
        ty,
        flags: AccessFlags::PUBLIC,
    }
}

/// Parses and attaches the argument/return types implied by a method
/// descriptor string.
pub fn method_desc(
    name: &str,
    descriptor: &str,
    flags: AccessFlags,
    code: Option<CodeBody>,
) -> Result<MethodDesc, VmError> {
    let (args, ret) = parse_method_descriptor(descriptor)?;
    Ok(MethodDesc {
        signature: Signature::new(name, descriptor),
        flags,
        args,
        ret,
        code: code.map(Rc::new),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveKind;

    fn sample() -> ClassFile {
        let mut file = ClassFile::synthetic(
            "Sample",
            Some("java/lang/Object"),
            &[],
            vec![field("x", Type::Primitive(PrimitiveKind::Int))],
            AccessFlags::PUBLIC | AccessFlags::SUPER,
        );
        file.constant_pool = vec![
            CpEntry::Unspecified,
            CpEntry::Utf8 {
                bytes: "Sample".into(),
            },
            CpEntry::Class { name_index: 1 },
            CpEntry::Utf8 { bytes: "f".into() },
            CpEntry::Utf8 {
                bytes: "()I".into(),
            },
            CpEntry::NameAndType {
                name_index: 3,
                descriptor_index: 4,
            },
            CpEntry::MethodRef {
                class_index: 2,
                name_and_type_index: 5,
            },
        ];
        file
    }

    #[test]
    fn method_ref_decoding() {
        let file = sample();
        let (owner, name, descriptor) = file.method_ref_at(6).unwrap();
        assert_eq!(owner, "Sample");
        assert_eq!(name, "f");
        assert_eq!(descriptor, "()I");
    }

    #[test]
    fn wrong_entry_kind_is_an_internal_error() {
        let file = sample();
        assert!(file.utf8_at(2).is_err());
        assert!(file.method_ref_at(1).is_err());
        assert!(file.constant_at(40).is_err());
    }

    #[test]
    fn arg_slots_count_wide_kinds_twice() {
        let m = method_desc("m", "(IJD)V", AccessFlags::STATIC, None).unwrap();
        assert_eq!(m.arg_slots(), 5);
    }
}
