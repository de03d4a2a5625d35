//! Error taxonomy for the virtual machine.
//!
//! Two envelopes leave `invoke`: `VmException::Internal` wraps fatal
//! machine-level failures (missing classes, resolution misses, heap
//! exhaustion, interpreter invariant violations), while
//! `VmException::Uncaught` carries a heap exception object that unwound past
//! the entry frame. Tests distinguish the two by envelope variant.

use std::fmt;

/// `VmError` represents the fatal failures that can occur while loading
/// classes or interpreting bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// The class loader returned nothing for a required class.
    ClassNotFound(String),
    /// The parser rejected a class byte stream, or inheritance is cyclic.
    MalformedClass(String),
    /// Method resolution found neither a native trap nor a bytecode body.
    NoSuchMethod { class: String, signature: String },
    /// The heap bump allocator ran past capacity.
    OutOfMemory { requested: usize, available: usize },
    /// Interpreter invariant violation: bad opcode, stack underflow,
    /// operand-type mismatch.
    Internal(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ClassNotFound(name) => {
                write!(f, "class not found: {name}")
            }
            Self::MalformedClass(detail) => {
                write!(f, "malformed class: {detail}")
            }
            Self::NoSuchMethod { class, signature } => {
                write!(f, "no such method: {class}.{signature}")
            }
            Self::OutOfMemory {
                requested,
                available,
            } => {
                write!(
                    f,
                    "out of memory: requested {requested} cells, {available} available"
                )
            }
            Self::Internal(detail) => write!(f, "internal error: {detail}"),
        }
    }
}

impl std::error::Error for VmError {}

/// A heap exception object that unwound past the entry frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncaughtException {
    /// Internal name of the thrown object's runtime class.
    pub class_name: String,
    /// Heap reference of the thrown object.
    pub reference: usize,
}

impl fmt::Display for UncaughtException {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "uncaught exception of class {} (reference {})",
            self.class_name, self.reference
        )
    }
}

/// Envelope surfaced to the caller of `Vm::invoke`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmException {
    /// Machine-level failure; the original cause is preserved.
    Internal(VmError),
    /// A thrown heap object found no handler on any frame.
    Uncaught(UncaughtException),
}

impl fmt::Display for VmException {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(cause) => write!(f, "{cause}"),
            Self::Uncaught(uncaught) => write!(f, "{uncaught}"),
        }
    }
}

impl std::error::Error for VmException {}

impl From<VmError> for VmException {
    fn from(cause: VmError) -> Self {
        Self::Internal(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_are_distinguishable() {
        let internal = VmException::from(VmError::ClassNotFound("A".into()));
        let uncaught = VmException::Uncaught(UncaughtException {
            class_name: "E".into(),
            reference: 17,
        });
        assert!(matches!(internal, VmException::Internal(_)));
        assert!(matches!(uncaught, VmException::Uncaught(_)));
        assert_ne!(internal, uncaught);
    }

    #[test]
    fn display_preserves_cause() {
        let err = VmError::NoSuchMethod {
            class: "Hello".into(),
            signature: "main([Ljava/lang/String;)V".into(),
        };
        let rendered = format!("{}", VmException::from(err));
        assert!(rendered.contains("Hello.main"));
    }
}
