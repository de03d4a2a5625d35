//! Runtime values.
//!
//! A value is a tagged union over the four primitive operand kinds plus a
//! heap reference; opcode effects dispatch on the static opcode, never on
//! the runtime tag. `Void` exists only as the unit result of `void`
//! methods.

use crate::errors::VmError;
use crate::types::{PrimitiveKind, Type};

/// Runtime value as held in locals and on the operand stack.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Heap cell index; zero is null.
    Ref(usize),
    /// Unit result of a `void` method.
    Void,
}

impl Value {
    pub const NULL: Self = Self::Ref(0);

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Ref(0))
    }

    /// Number of local-variable slots the value occupies.
    pub const fn word_size(&self) -> usize {
        match self {
            Self::Long(_) | Self::Double(_) => 2,
            _ => 1,
        }
    }

    /// True for the two-word operand category (`long`, `double`).
    pub const fn is_wide(&self) -> bool {
        matches!(self, Self::Long(_) | Self::Double(_))
    }

    pub fn as_int(&self) -> Result<i32, VmError> {
        match self {
            Self::Int(v) => Ok(*v),
            other => Err(type_mismatch("int", other)),
        }
    }

    pub fn as_long(&self) -> Result<i64, VmError> {
        match self {
            Self::Long(v) => Ok(*v),
            other => Err(type_mismatch("long", other)),
        }
    }

    pub fn as_float(&self) -> Result<f32, VmError> {
        match self {
            Self::Float(v) => Ok(*v),
            other => Err(type_mismatch("float", other)),
        }
    }

    pub fn as_double(&self) -> Result<f64, VmError> {
        match self {
            Self::Double(v) => Ok(*v),
            other => Err(type_mismatch("double", other)),
        }
    }

    pub fn as_reference(&self) -> Result<usize, VmError> {
        match self {
            Self::Ref(v) => Ok(*v),
            other => Err(type_mismatch("reference", other)),
        }
    }

    /// Encodes the value into a single heap word. Floats are stored by bit
    /// pattern.
    pub fn to_word(&self) -> i64 {
        match self {
            Self::Int(v) => i64::from(*v),
            Self::Long(v) => *v,
            Self::Float(v) => i64::from(v.to_bits()),
            Self::Double(v) => v.to_bits() as i64,
            Self::Ref(v) => *v as i64,
            Self::Void => 0,
        }
    }

    /// Decodes a heap word under a static type.
    pub fn from_word(ty: &Type, word: i64) -> Self {
        match ty {
            Type::Primitive(kind) => match kind {
                PrimitiveKind::Long => Self::Long(word),
                PrimitiveKind::Float => Self::Float(f32::from_bits(word as u32)),
                PrimitiveKind::Double => {
                    Self::Double(f64::from_bits(word as u64))
                }
                PrimitiveKind::Void => Self::Void,
                _ => Self::Int(word as i32),
            },
            Type::Class(_) | Type::Array(_) => Self::Ref(word as usize),
        }
    }

    /// Zero value of a static type: numeric zero for primitives, null for
    /// references.
    pub fn default_for(ty: &Type) -> Self {
        Self::from_word(ty, 0)
    }

    /// Computes the sum of two values of the same kind. Integer kinds wrap.
    pub fn add(lhs: &Self, rhs: &Self) -> Result<Self, VmError> {
        match (lhs, rhs) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_add(*b))),
            (Self::Long(a), Self::Long(b)) => Ok(Self::Long(a.wrapping_add(*b))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a + b)),
            (Self::Double(a), Self::Double(b)) => Ok(Self::Double(a + b)),
            _ => Err(kind_mismatch("add", lhs, rhs)),
        }
    }

    /// Computes the difference of two values of the same kind.
    pub fn sub(lhs: &Self, rhs: &Self) -> Result<Self, VmError> {
        match (lhs, rhs) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_sub(*b))),
            (Self::Long(a), Self::Long(b)) => Ok(Self::Long(a.wrapping_sub(*b))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a - b)),
            (Self::Double(a), Self::Double(b)) => Ok(Self::Double(a - b)),
            _ => Err(kind_mismatch("sub", lhs, rhs)),
        }
    }

    /// Computes the product of two values of the same kind.
    pub fn mul(lhs: &Self, rhs: &Self) -> Result<Self, VmError> {
        match (lhs, rhs) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_mul(*b))),
            (Self::Long(a), Self::Long(b)) => Ok(Self::Long(a.wrapping_mul(*b))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a * b)),
            (Self::Double(a), Self::Double(b)) => Ok(Self::Double(a * b)),
            _ => Err(kind_mismatch("mul", lhs, rhs)),
        }
    }

    /// Computes the quotient of two values of the same kind. The caller
    /// checks integer division by zero before calling.
    pub fn div(lhs: &Self, rhs: &Self) -> Result<Self, VmError> {
        match (lhs, rhs) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_div(*b))),
            (Self::Long(a), Self::Long(b)) => Ok(Self::Long(a.wrapping_div(*b))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a / b)),
            (Self::Double(a), Self::Double(b)) => Ok(Self::Double(a / b)),
            _ => Err(kind_mismatch("div", lhs, rhs)),
        }
    }

    /// Computes the remainder of two values of the same kind.
    pub fn rem(lhs: &Self, rhs: &Self) -> Result<Self, VmError> {
        match (lhs, rhs) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_rem(*b))),
            (Self::Long(a), Self::Long(b)) => Ok(Self::Long(a.wrapping_rem(*b))),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a % b)),
            (Self::Double(a), Self::Double(b)) => Ok(Self::Double(a % b)),
            _ => Err(kind_mismatch("rem", lhs, rhs)),
        }
    }

    /// Arithmetic negation.
    pub fn neg(&self) -> Result<Self, VmError> {
        match self {
            Self::Int(v) => Ok(Self::Int(v.wrapping_neg())),
            Self::Long(v) => Ok(Self::Long(v.wrapping_neg())),
            Self::Float(v) => Ok(Self::Float(-v)),
            Self::Double(v) => Ok(Self::Double(-v)),
            other => Err(type_mismatch("numeric", other)),
        }
    }

    /// Three-way comparison of two values of the same kind: -1, 0 or 1.
    /// `nan_result` is returned when either float operand is NaN, matching
    /// the `cmpl`/`cmpg` split.
    pub fn compare(
        lhs: &Self,
        rhs: &Self,
        nan_result: i32,
    ) -> Result<i32, VmError> {
        match (lhs, rhs) {
            (Self::Int(a), Self::Int(b)) => Ok(cmp(a, b)),
            (Self::Long(a), Self::Long(b)) => Ok(cmp(a, b)),
            (Self::Float(a), Self::Float(b)) => {
                if a.is_nan() || b.is_nan() {
                    Ok(nan_result)
                } else {
                    Ok(cmp(a, b))
                }
            }
            (Self::Double(a), Self::Double(b)) => {
                if a.is_nan() || b.is_nan() {
                    Ok(nan_result)
                } else {
                    Ok(cmp(a, b))
                }
            }
            _ => Err(kind_mismatch("compare", lhs, rhs)),
        }
    }

    /// Converts to the `int` kind, truncating as the typed conversion
    /// opcodes do.
    pub fn to_int(&self) -> Result<Self, VmError> {
        match self {
            Self::Int(v) => Ok(Self::Int(*v)),
            Self::Long(v) => Ok(Self::Int(*v as i32)),
            Self::Float(v) => Ok(Self::Int(*v as i32)),
            Self::Double(v) => Ok(Self::Int(*v as i32)),
            other => Err(type_mismatch("numeric", other)),
        }
    }

    /// Converts to the `long` kind.
    pub fn to_long(&self) -> Result<Self, VmError> {
        match self {
            Self::Int(v) => Ok(Self::Long(i64::from(*v))),
            Self::Long(v) => Ok(Self::Long(*v)),
            Self::Float(v) => Ok(Self::Long(*v as i64)),
            Self::Double(v) => Ok(Self::Long(*v as i64)),
            other => Err(type_mismatch("numeric", other)),
        }
    }

    /// Converts to the `float` kind.
    pub fn to_float(&self) -> Result<Self, VmError> {
        match self {
            Self::Int(v) => Ok(Self::Float(*v as f32)),
            Self::Long(v) => Ok(Self::Float(*v as f32)),
            Self::Float(v) => Ok(Self::Float(*v)),
            Self::Double(v) => Ok(Self::Float(*v as f32)),
            other => Err(type_mismatch("numeric", other)),
        }
    }

    /// Converts to the `double` kind.
    pub fn to_double(&self) -> Result<Self, VmError> {
        match self {
            Self::Int(v) => Ok(Self::Double(f64::from(*v))),
            Self::Long(v) => Ok(Self::Double(*v as f64)),
            Self::Float(v) => Ok(Self::Double(f64::from(*v))),
            Self::Double(v) => Ok(Self::Double(*v)),
            other => Err(type_mismatch("numeric", other)),
        }
    }
}

fn cmp<T: PartialOrd>(lhs: &T, rhs: &T) -> i32 {
    if lhs < rhs {
        -1
    } else {
        i32::from(lhs > rhs)
    }
}

fn type_mismatch(expected: &str, got: &Value) -> VmError {
    VmError::Internal(format!("expected {expected} operand, got {got:?}"))
}

fn kind_mismatch(op: &str, lhs: &Value, rhs: &Value) -> VmError {
    VmError::Internal(format!("operand kind mismatch in {op}: {lhs:?}, {rhs:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveKind;

    #[test]
    fn arithmetic_on_matching_kinds() {
        let sum = Value::add(&Value::Int(40), &Value::Int(2)).unwrap();
        assert_eq!(sum, Value::Int(42));
        let product = Value::mul(&Value::Long(6), &Value::Long(7)).unwrap();
        assert_eq!(product, Value::Long(42));
    }

    #[test]
    fn integer_arithmetic_wraps() {
        let sum = Value::add(&Value::Int(i32::MAX), &Value::Int(1)).unwrap();
        assert_eq!(sum, Value::Int(i32::MIN));
    }

    #[test]
    fn mixed_kinds_are_rejected() {
        assert!(Value::add(&Value::Int(1), &Value::Long(1)).is_err());
        assert!(Value::compare(&Value::Float(1.0), &Value::Int(1), 1).is_err());
    }

    #[test]
    fn word_round_trips_under_static_type() {
        let double_ty = Type::Primitive(PrimitiveKind::Double);
        let v = Value::Double(3.25);
        assert_eq!(Value::from_word(&double_ty, v.to_word()), v);

        let ref_ty = Type::Class("java/lang/String".into());
        let r = Value::Ref(99);
        assert_eq!(Value::from_word(&ref_ty, r.to_word()), r);
    }

    #[test]
    fn nan_comparison_uses_the_requested_result() {
        let nan = Value::Float(f32::NAN);
        let one = Value::Float(1.0);
        assert_eq!(Value::compare(&nan, &one, 1).unwrap(), 1);
        assert_eq!(Value::compare(&nan, &one, -1).unwrap(), -1);
    }

    #[test]
    fn defaults_are_zero_or_null() {
        assert_eq!(
            Value::default_for(&Type::Primitive(PrimitiveKind::Int)),
            Value::Int(0)
        );
        assert!(Value::default_for(&Type::Class("X".into())).is_null());
    }
}
