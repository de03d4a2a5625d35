//! Access-flag constants carried by class, field and method descriptors.

use bitflags::bitflags;

bitflags! {
    /// Access flags as encoded in class files. The same closed bit set is
    /// shared by classes, fields and methods; `SUPER` is only meaningful on
    /// classes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
    }
}

impl AccessFlags {
    /// Decodes the raw flag word of a class-file entry, ignoring bits
    /// outside the known set.
    pub const fn decode(raw: u16) -> Self {
        Self::from_bits_truncate(raw)
    }

    pub const fn is_static(self) -> bool {
        self.contains(Self::STATIC)
    }

    pub const fn is_interface(self) -> bool {
        self.contains(Self::INTERFACE)
    }
}
