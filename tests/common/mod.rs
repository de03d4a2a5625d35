//! Shared test support: assembles real class-file byte streams so the
//! end-to-end tests can drive the VM through its public loader interface.

use byteorder::{BigEndian, WriteBytesExt};

use std::collections::HashMap;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_SUPER: u16 = 0x0020;

const MAGIC: u32 = 0xCAFE_BABE;
const MAJOR_VERSION: u16 = 52;

/// Big-endian bytes of a constant-pool index, for splicing into bytecode.
pub fn idx(index: u16) -> [u8; 2] {
    index.to_be_bytes()
}

/// Big-endian bytes of a signed 16-bit branch offset.
pub fn be16(offset: i16) -> [u8; 2] {
    (offset as u16).to_be_bytes()
}

/// Big-endian bytes of a signed 32-bit switch operand.
pub fn be32(value: i32) -> [u8; 4] {
    (value as u32).to_be_bytes()
}

enum PoolItem {
    Utf8(String),
    Integer(i32),
    Long(i64),
    Class(u16),
    Str(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    NameAndType(u16, u16),
}

pub struct Handler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Constant-pool index of the caught class, or 0 for catch-all.
    pub catch_type: u16,
}

struct FieldEntry {
    flags: u16,
    name: u16,
    descriptor: u16,
}

struct MethodEntry {
    flags: u16,
    name: u16,
    descriptor: u16,
    code_name: u16,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
    handlers: Vec<Handler>,
}

/// Builds a class file with a deduplicating constant pool.
pub struct ClassBuilder {
    pool: Vec<PoolItem>,
    next_index: u16,
    utf8_cache: HashMap<String, u16>,
    class_cache: HashMap<String, u16>,
    string_cache: HashMap<String, u16>,
    int_cache: HashMap<i32, u16>,
    long_cache: HashMap<i64, u16>,
    nat_cache: HashMap<(u16, u16), u16>,
    method_ref_cache: HashMap<(u16, u16), u16>,
    field_ref_cache: HashMap<(u16, u16), u16>,
    flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldEntry>,
    methods: Vec<MethodEntry>,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: &str) -> Self {
        let mut builder = Self {
            pool: Vec::new(),
            next_index: 1,
            utf8_cache: HashMap::new(),
            class_cache: HashMap::new(),
            string_cache: HashMap::new(),
            int_cache: HashMap::new(),
            long_cache: HashMap::new(),
            nat_cache: HashMap::new(),
            method_ref_cache: HashMap::new(),
            field_ref_cache: HashMap::new(),
            flags: ACC_PUBLIC | ACC_SUPER,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        };
        builder.this_class = builder.class(name);
        builder.super_class = builder.class(super_name);
        builder
    }

    fn push_item(&mut self, item: PoolItem) -> u16 {
        let index = self.next_index;
        // Long entries occupy two pool slots.
        self.next_index += match item {
            PoolItem::Long(_) => 2,
            _ => 1,
        };
        self.pool.push(item);
        index
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        if let Some(existing) = self.utf8_cache.get(text) {
            return *existing;
        }
        let index = self.push_item(PoolItem::Utf8(text.to_string()));
        self.utf8_cache.insert(text.to_string(), index);
        index
    }

    pub fn class(&mut self, name: &str) -> u16 {
        if let Some(existing) = self.class_cache.get(name) {
            return *existing;
        }
        let name_index = self.utf8(name);
        let index = self.push_item(PoolItem::Class(name_index));
        self.class_cache.insert(name.to_string(), index);
        index
    }

    pub fn string(&mut self, text: &str) -> u16 {
        if let Some(existing) = self.string_cache.get(text) {
            return *existing;
        }
        let utf8_index = self.utf8(text);
        let index = self.push_item(PoolItem::Str(utf8_index));
        self.string_cache.insert(text.to_string(), index);
        index
    }

    pub fn int_const(&mut self, value: i32) -> u16 {
        if let Some(existing) = self.int_cache.get(&value) {
            return *existing;
        }
        let index = self.push_item(PoolItem::Integer(value));
        self.int_cache.insert(value, index);
        index
    }

    pub fn long_const(&mut self, value: i64) -> u16 {
        if let Some(existing) = self.long_cache.get(&value) {
            return *existing;
        }
        let index = self.push_item(PoolItem::Long(value));
        self.long_cache.insert(value, index);
        index
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        if let Some(existing) =
            self.nat_cache.get(&(name_index, descriptor_index))
        {
            return *existing;
        }
        let index = self
            .push_item(PoolItem::NameAndType(name_index, descriptor_index));
        self.nat_cache.insert((name_index, descriptor_index), index);
        index
    }

    pub fn method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> u16 {
        let class_index = self.class(class);
        let nat_index = self.name_and_type(name, descriptor);
        if let Some(existing) =
            self.method_ref_cache.get(&(class_index, nat_index))
        {
            return *existing;
        }
        let index =
            self.push_item(PoolItem::MethodRef(class_index, nat_index));
        self.method_ref_cache.insert((class_index, nat_index), index);
        index
    }

    pub fn field_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> u16 {
        let class_index = self.class(class);
        let nat_index = self.name_and_type(name, descriptor);
        if let Some(existing) =
            self.field_ref_cache.get(&(class_index, nat_index))
        {
            return *existing;
        }
        let index = self.push_item(PoolItem::FieldRef(class_index, nat_index));
        self.field_ref_cache.insert((class_index, nat_index), index);
        index
    }

    pub fn add_interface(&mut self, name: &str) {
        let index = self.class(name);
        self.interfaces.push(index);
    }

    pub fn add_field(&mut self, flags: u16, name: &str, descriptor: &str) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.fields.push(FieldEntry {
            flags,
            name: name_index,
            descriptor: descriptor_index,
        });
    }

    pub fn add_method(
        &mut self,
        flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        handlers: Vec<Handler>,
    ) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let code_name = self.utf8("Code");
        self.methods.push(MethodEntry {
            flags,
            name: name_index,
            descriptor: descriptor_index,
            code_name,
            max_stack,
            max_locals,
            code,
            handlers,
        });
    }

    pub fn build(self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        out.write_u32::<BigEndian>(MAGIC).unwrap();
        out.write_u16::<BigEndian>(0).unwrap();
        out.write_u16::<BigEndian>(MAJOR_VERSION).unwrap();

        out.write_u16::<BigEndian>(self.next_index).unwrap();
        for item in &self.pool {
            match item {
                PoolItem::Utf8(text) => {
                    out.write_u8(1).unwrap();
                    out.write_u16::<BigEndian>(text.len() as u16).unwrap();
                    out.extend_from_slice(text.as_bytes());
                }
                PoolItem::Integer(value) => {
                    out.write_u8(3).unwrap();
                    out.write_u32::<BigEndian>(*value as u32).unwrap();
                }
                PoolItem::Long(value) => {
                    out.write_u8(5).unwrap();
                    out.write_u32::<BigEndian>((*value >> 32) as u32).unwrap();
                    out.write_u32::<BigEndian>(*value as u32).unwrap();
                }
                PoolItem::Class(name) => {
                    out.write_u8(7).unwrap();
                    out.write_u16::<BigEndian>(*name).unwrap();
                }
                PoolItem::Str(utf8) => {
                    out.write_u8(8).unwrap();
                    out.write_u16::<BigEndian>(*utf8).unwrap();
                }
                PoolItem::FieldRef(class, nat) => {
                    out.write_u8(9).unwrap();
                    out.write_u16::<BigEndian>(*class).unwrap();
                    out.write_u16::<BigEndian>(*nat).unwrap();
                }
                PoolItem::MethodRef(class, nat) => {
                    out.write_u8(10).unwrap();
                    out.write_u16::<BigEndian>(*class).unwrap();
                    out.write_u16::<BigEndian>(*nat).unwrap();
                }
                PoolItem::NameAndType(name, descriptor) => {
                    out.write_u8(12).unwrap();
                    out.write_u16::<BigEndian>(*name).unwrap();
                    out.write_u16::<BigEndian>(*descriptor).unwrap();
                }
            }
        }

        out.write_u16::<BigEndian>(self.flags).unwrap();
        out.write_u16::<BigEndian>(self.this_class).unwrap();
        out.write_u16::<BigEndian>(self.super_class).unwrap();

        out.write_u16::<BigEndian>(self.interfaces.len() as u16).unwrap();
        for interface in &self.interfaces {
            out.write_u16::<BigEndian>(*interface).unwrap();
        }

        out.write_u16::<BigEndian>(self.fields.len() as u16).unwrap();
        for field in &self.fields {
            out.write_u16::<BigEndian>(field.flags).unwrap();
            out.write_u16::<BigEndian>(field.name).unwrap();
            out.write_u16::<BigEndian>(field.descriptor).unwrap();
            out.write_u16::<BigEndian>(0).unwrap();
        }

        out.write_u16::<BigEndian>(self.methods.len() as u16).unwrap();
        for method in &self.methods {
            out.write_u16::<BigEndian>(method.flags).unwrap();
            out.write_u16::<BigEndian>(method.name).unwrap();
            out.write_u16::<BigEndian>(method.descriptor).unwrap();
            // One attribute: Code.
            out.write_u16::<BigEndian>(1).unwrap();
            out.write_u16::<BigEndian>(method.code_name).unwrap();
            let attribute_length = 2
                + 2
                + 4
                + method.code.len() as u32
                + 2
                + 8 * method.handlers.len() as u32
                + 2;
            out.write_u32::<BigEndian>(attribute_length).unwrap();
            out.write_u16::<BigEndian>(method.max_stack).unwrap();
            out.write_u16::<BigEndian>(method.max_locals).unwrap();
            out.write_u32::<BigEndian>(method.code.len() as u32).unwrap();
            out.extend_from_slice(&method.code);
            out.write_u16::<BigEndian>(method.handlers.len() as u16).unwrap();
            for handler in &method.handlers {
                out.write_u16::<BigEndian>(handler.start_pc).unwrap();
                out.write_u16::<BigEndian>(handler.end_pc).unwrap();
                out.write_u16::<BigEndian>(handler.handler_pc).unwrap();
                out.write_u16::<BigEndian>(handler.catch_type).unwrap();
            }
            out.write_u16::<BigEndian>(0).unwrap();
        }

        // No class-level attributes.
        out.write_u16::<BigEndian>(0).unwrap();
        out
    }
}
