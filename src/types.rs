//! Type descriptors: primitive kinds, class types and array types, plus
//! decoding of JVM field and method descriptors.

use crate::errors::VmError;

use regex::Regex;

/// Primitive kinds supported by the bytecode platform.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    Void,
}

impl PrimitiveKind {
    /// Returns the size in heap words of a value of this kind. `long` and
    /// `double` occupy two local-variable slots.
    pub const fn word_size(self) -> usize {
        match self {
            Self::Long | Self::Double => 2,
            Self::Void => 0,
            _ => 1,
        }
    }

    /// Source-level name, as exposed through the primitive-class lookup.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Char => "char",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Void => "void",
        }
    }
}

/// A JVM type: a primitive, a class named in internal slash form, or an
/// array over a component type. Structurally value-equal and cheap to copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Primitive(PrimitiveKind),
    Class(String),
    Array(Box<Type>),
}

impl Type {
    /// Decodes a single field descriptor, e.g. `I`, `[J`,
    /// `Ljava/lang/String;`.
    pub fn parse(descriptor: &str) -> Result<Self, VmError> {
        let (ty, consumed) = Self::parse_prefix(descriptor)?;
        if consumed != descriptor.len() {
            return Err(VmError::MalformedClass(format!(
                "trailing characters in type descriptor {descriptor:?}"
            )));
        }
        Ok(ty)
    }

    /// Decodes the leading type of a descriptor string, returning the type
    /// and the number of bytes consumed.
    pub fn parse_prefix(descriptor: &str) -> Result<(Self, usize), VmError> {
        let bad = || {
            VmError::MalformedClass(format!(
                "invalid type descriptor {descriptor:?}"
            ))
        };
        let first = descriptor.as_bytes().first().ok_or_else(bad)?;
        match first {
            b'Z' => Ok((Self::Primitive(PrimitiveKind::Boolean), 1)),
            b'B' => Ok((Self::Primitive(PrimitiveKind::Byte), 1)),
            b'S' => Ok((Self::Primitive(PrimitiveKind::Short), 1)),
            b'C' => Ok((Self::Primitive(PrimitiveKind::Char), 1)),
            b'I' => Ok((Self::Primitive(PrimitiveKind::Int), 1)),
            b'J' => Ok((Self::Primitive(PrimitiveKind::Long), 1)),
            b'F' => Ok((Self::Primitive(PrimitiveKind::Float), 1)),
            b'D' => Ok((Self::Primitive(PrimitiveKind::Double), 1)),
            b'V' => Ok((Self::Primitive(PrimitiveKind::Void), 1)),
            b'L' => {
                let end = descriptor.find(';').ok_or_else(bad)?;
                Ok((Self::Class(descriptor[1..end].to_string()), end + 1))
            }
            b'[' => {
                let (component, consumed) =
                    Self::parse_prefix(&descriptor[1..])?;
                Ok((Self::Array(Box::new(component)), consumed + 1))
            }
            _ => Err(bad()),
        }
    }

    /// Size in local-variable slots of a value of this type.
    pub fn word_size(&self) -> usize {
        match self {
            Self::Primitive(kind) => kind.word_size(),
            Self::Class(_) | Self::Array(_) => 1,
        }
    }

    /// True for class and array types, whose values are heap references.
    pub const fn is_reference(&self) -> bool {
        matches!(self, Self::Class(_) | Self::Array(_))
    }

    /// Internal name of a class type, `None` otherwise.
    pub fn class_name(&self) -> Option<&str> {
        match self {
            Self::Class(name) => Some(name),
            _ => None,
        }
    }
}

/// A method signature: name plus raw descriptor. Two signatures are equal
/// iff both components are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: String,
    pub descriptor: String,
}

impl Signature {
    pub fn new(name: &str, descriptor: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor)
    }
}

/// Splits a method descriptor such as `(I[J)Ljava/lang/String;` into its
/// ordered parameter types and return type.
pub fn parse_method_descriptor(
    descriptor: &str,
) -> Result<(Vec<Type>, Type), VmError> {
    let re = Regex::new(r"^\(([^)]*)\)(.+)$").map_err(|e| {
        VmError::Internal(format!("descriptor pattern failed to compile: {e}"))
    })?;
    let caps = re.captures(descriptor).ok_or_else(|| {
        VmError::MalformedClass(format!(
            "invalid method descriptor {descriptor:?}"
        ))
    })?;
    let arg_string = caps.get(1).map_or("", |m| m.as_str());
    let return_string = caps.get(2).map_or("", |m| m.as_str());

    let mut args = Vec::new();
    let mut rest = arg_string;
    while !rest.is_empty() {
        let (ty, consumed) = Type::parse_prefix(rest)?;
        args.push(ty);
        rest = &rest[consumed..];
    }
    let ret = Type::parse(return_string)?;
    Ok((args, ret))
}
