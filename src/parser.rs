//! Parser and decoder for JVM class files.
//!
//! Decodes a class byte stream into the immutable descriptor shape the
//! class table consumes. Attributes the interpreter has no use for are
//! skipped over by length.

use crate::access::AccessFlags;
use crate::classfile::{
    ClassFile, CodeBody, CpEntry, ExceptionEntry, FieldDesc, MethodDesc,
};
use crate::errors::VmError;
use crate::types::{parse_method_descriptor, Signature, Type};

use byteorder::{BigEndian, ReadBytesExt};

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::rc::Rc;

/// Values of magic bytes of a JVM class file.
const CLASS_FILE_MAGIC: u32 = 0xCAFE_BABE;

const ATTRIBUTE_NAME_CODE: &str = "Code";

/// `ClassParser` namespaces functions that handle parsing of class files.
#[derive(Debug)]
pub struct ClassParser;

impl ClassParser {
    /// Parses a preloaded class byte stream into its descriptor.
    pub fn parse(class_file_bytes: &[u8]) -> Result<ClassFile, VmError> {
        let mut buffer = Cursor::new(class_file_bytes);
        let magic = read_u32(&mut buffer)?;
        if magic != CLASS_FILE_MAGIC {
            return Err(VmError::MalformedClass(format!(
                "bad magic {magic:#010x}"
            )));
        }
        let minor_version = read_u16(&mut buffer)?;
        let major_version = read_u16(&mut buffer)?;

        let constant_pool = parse_constant_pool(&mut buffer)?;

        let flags = AccessFlags::decode(read_u16(&mut buffer)?);
        let this_class = read_u16(&mut buffer)?;
        let super_class = read_u16(&mut buffer)?;

        let interfaces_count = read_u16(&mut buffer)?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            let index = read_u16(&mut buffer)?;
            interfaces.push(pool_class_name(&constant_pool, index)?.to_string());
        }

        let fields = parse_fields(&mut buffer, &constant_pool)?;
        let methods = parse_methods(&mut buffer, &constant_pool)?;
        // Class-level attributes (SourceFile etc.) are irrelevant here.
        skip_attributes(&mut buffer)?;

        let name = pool_class_name(&constant_pool, this_class)?.to_string();
        let super_name = if super_class == 0 {
            None
        } else {
            Some(pool_class_name(&constant_pool, super_class)?.to_string())
        };

        Ok(ClassFile {
            name,
            super_name,
            interfaces,
            fields,
            methods,
            flags,
            constant_pool,
            major_version,
            minor_version,
        })
    }
}

fn parse_constant_pool(
    buffer: &mut Cursor<&[u8]>,
) -> Result<Vec<CpEntry>, VmError> {
    let count = read_u16(buffer)? as usize;
    let mut pool = vec![CpEntry::Unspecified; count.max(1)];
    // The first usable entry is at index 1; long and double entries occupy
    // two slots.
    let mut index = 1;
    while index < count {
        let tag = read_u8(buffer)?;
        let mut wide = false;
        pool[index] = match tag {
            7 => CpEntry::Class {
                name_index: read_u16(buffer)?,
            },
            9 => CpEntry::FieldRef {
                class_index: read_u16(buffer)?,
                name_and_type_index: read_u16(buffer)?,
            },
            10 => CpEntry::MethodRef {
                class_index: read_u16(buffer)?,
                name_and_type_index: read_u16(buffer)?,
            },
            11 => CpEntry::InterfaceMethodRef {
                class_index: read_u16(buffer)?,
                name_and_type_index: read_u16(buffer)?,
            },
            8 => CpEntry::String {
                string_index: read_u16(buffer)?,
            },
            3 => CpEntry::Integer {
                bytes: read_u32(buffer)?,
            },
            4 => CpEntry::Float {
                bytes: read_u32(buffer)?,
            },
            5 => {
                wide = true;
                CpEntry::Long {
                    hi_bytes: read_u32(buffer)?,
                    lo_bytes: read_u32(buffer)?,
                }
            }
            6 => {
                wide = true;
                CpEntry::Double {
                    hi_bytes: read_u32(buffer)?,
                    lo_bytes: read_u32(buffer)?,
                }
            }
            12 => CpEntry::NameAndType {
                name_index: read_u16(buffer)?,
                descriptor_index: read_u16(buffer)?,
            },
            1 => {
                let length = read_u16(buffer)?;
                let mut buf = vec![0u8; length as usize];
                buffer.read_exact(&mut buf).map_err(truncated)?;
                CpEntry::Utf8 {
                    bytes: String::from_utf8(buf).map_err(|e| {
                        VmError::MalformedClass(format!(
                            "constant {index} is not valid UTF-8: {e}"
                        ))
                    })?,
                }
            }
            15 => CpEntry::MethodHandle {
                reference_kind: read_u8(buffer)?,
                reference_index: read_u16(buffer)?,
            },
            16 => CpEntry::MethodType {
                descriptor_index: read_u16(buffer)?,
            },
            17 | 18 => CpEntry::InvokeDynamic {
                bootstrap_method_attr_index: read_u16(buffer)?,
                name_and_type_index: read_u16(buffer)?,
            },
            other => {
                return Err(VmError::MalformedClass(format!(
                    "unexpected constant tag {other} at pool index {index}"
                )))
            }
        };
        index += if wide { 2 } else { 1 };
    }
    Ok(pool)
}

fn parse_fields(
    buffer: &mut Cursor<&[u8]>,
    pool: &[CpEntry],
) -> Result<Vec<FieldDesc>, VmError> {
    let count = read_u16(buffer)?;
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let flags = AccessFlags::decode(read_u16(buffer)?);
        let name_index = read_u16(buffer)?;
        let descriptor_index = read_u16(buffer)?;
        // Field attributes (ConstantValue etc.) carry nothing the runtime
        // layout needs.
        skip_attributes(buffer)?;
        fields.push(FieldDesc {
            name: pool_utf8(pool, name_index)?.to_string(),
            ty: Type::parse(pool_utf8(pool, descriptor_index)?)?,
            flags,
        });
    }
    Ok(fields)
}

fn parse_methods(
    buffer: &mut Cursor<&[u8]>,
    pool: &[CpEntry],
) -> Result<Vec<MethodDesc>, VmError> {
    let count = read_u16(buffer)?;
    let mut methods = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let flags = AccessFlags::decode(read_u16(buffer)?);
        let name_index = read_u16(buffer)?;
        let descriptor_index = read_u16(buffer)?;
        let name = pool_utf8(pool, name_index)?;
        let descriptor = pool_utf8(pool, descriptor_index)?;
        let (args, ret) = parse_method_descriptor(descriptor)?;
        let code = parse_method_attributes(buffer, pool)?;
        methods.push(MethodDesc {
            signature: Signature::new(name, descriptor),
            flags,
            args,
            ret,
            code: code.map(Rc::new),
        });
    }
    Ok(methods)
}

/// Walks a method's attribute list, decoding `Code` and skipping the rest.
fn parse_method_attributes(
    buffer: &mut Cursor<&[u8]>,
    pool: &[CpEntry],
) -> Result<Option<CodeBody>, VmError> {
    let attribute_count = read_u16(buffer)?;
    let mut code = None;
    for _ in 0..attribute_count {
        let attribute_name_index = read_u16(buffer)?;
        let attribute_length = read_u32(buffer)?;
        let attribute_name = pool_utf8(pool, attribute_name_index)?;
        if attribute_name == ATTRIBUTE_NAME_CODE {
            code = Some(parse_code(buffer, pool)?);
        } else {
            skip(buffer, attribute_length)?;
        }
    }
    Ok(code)
}

fn parse_code(
    buffer: &mut Cursor<&[u8]>,
    pool: &[CpEntry],
) -> Result<CodeBody, VmError> {
    let max_stack = read_u16(buffer)?;
    let max_locals = read_u16(buffer)?;
    let code_length = read_u32(buffer)?;
    let mut bytecode = vec![0u8; code_length as usize];
    buffer.read_exact(&mut bytecode).map_err(truncated)?;

    let exception_table_length = read_u16(buffer)?;
    let mut exception_table =
        Vec::with_capacity(exception_table_length as usize);
    for _ in 0..exception_table_length {
        let start_pc = read_u16(buffer)?;
        let end_pc = read_u16(buffer)?;
        let handler_pc = read_u16(buffer)?;
        let catch_index = read_u16(buffer)?;
        let catch_type = if catch_index == 0 {
            None
        } else {
            Some(pool_class_name(pool, catch_index)?.to_string())
        };
        exception_table.push(ExceptionEntry {
            start_pc,
            end_pc,
            handler_pc,
            catch_type,
        });
    }
    // Nested attributes: LineNumberTable, StackMapTable and friends.
    skip_attributes(buffer)?;

    Ok(CodeBody {
        max_stack,
        max_locals,
        bytecode,
        exception_table,
    })
}

/// Skips an attribute list wholesale.
fn skip_attributes(buffer: &mut Cursor<&[u8]>) -> Result<(), VmError> {
    let count = read_u16(buffer)?;
    for _ in 0..count {
        let _name_index = read_u16(buffer)?;
        let length = read_u32(buffer)?;
        skip(buffer, length)?;
    }
    Ok(())
}

fn skip(buffer: &mut Cursor<&[u8]>, length: u32) -> Result<(), VmError> {
    buffer
        .seek(SeekFrom::Current(i64::from(length)))
        .map_err(truncated)?;
    Ok(())
}

fn pool_utf8(pool: &[CpEntry], index: u16) -> Result<&str, VmError> {
    match pool.get(index as usize) {
        Some(CpEntry::Utf8 { bytes }) => Ok(bytes),
        other => Err(VmError::MalformedClass(format!(
            "expected Utf8 constant at pool index {index}, got {other:?}"
        ))),
    }
}

fn pool_class_name(pool: &[CpEntry], index: u16) -> Result<&str, VmError> {
    match pool.get(index as usize) {
        Some(CpEntry::Class { name_index }) => pool_utf8(pool, *name_index),
        other => Err(VmError::MalformedClass(format!(
            "expected Class constant at pool index {index}, got {other:?}"
        ))),
    }
}

fn read_u8(buffer: &mut Cursor<&[u8]>) -> Result<u8, VmError> {
    buffer.read_u8().map_err(truncated)
}

fn read_u16(buffer: &mut Cursor<&[u8]>) -> Result<u16, VmError> {
    buffer.read_u16::<BigEndian>().map_err(truncated)
}

fn read_u32(buffer: &mut Cursor<&[u8]>) -> Result<u32, VmError> {
    buffer.read_u32::<BigEndian>().map_err(truncated)
}

fn truncated(err: std::io::Error) -> VmError {
    VmError::MalformedClass(format!("truncated class file: {err}"))
}
