//! Class table: the transitive resolution cache, runtime classes with
//! dense load-order indices, ancestry sets, field layout, and the subtype
//! relation.

use crate::access::AccessFlags;
use crate::classfile::{field, ClassFile};
use crate::errors::VmError;
use crate::loader::ClassLoader;
use crate::parser::ClassParser;
use crate::types::{PrimitiveKind, Type};
use crate::value::Value;

use tracing::debug;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

pub const OBJECT_CLASS: &str = "java/lang/Object";
pub const STRING_CLASS: &str = "java/lang/String";
pub const CLASS_CLASS: &str = "java/lang/Class";
pub const CLONEABLE_CLASS: &str = "java/lang/Cloneable";
pub const SERIALIZABLE_CLASS: &str = "java/io/Serializable";
pub const THROWABLE_CLASS: &str = "java/lang/Throwable";

/// A named instance-field or static-field slot. For instance fields,
/// `offset` is the cell distance from the object header; for statics it
/// indexes the class's static storage.
#[derive(Debug, Clone)]
pub struct FieldSlot {
    pub name: String,
    pub ty: Type,
    pub offset: usize,
}

/// A class registered in the table: the parsed descriptor plus everything
/// the runtime derives from it. Created exactly once per class name and
/// never destroyed.
#[derive(Debug)]
pub struct RuntimeClass {
    pub file: ClassFile,
    /// Dense index assigned in load order; equals the position in the
    /// by-index registry.
    pub index: usize,
    /// Reflexive transitive closure over the super chain and all
    /// interfaces, by internal name.
    ancestry: HashSet<String>,
    /// Flattened instance-field layout, super-class fields first.
    layout: Vec<FieldSlot>,
    static_layout: Vec<FieldSlot>,
    statics: RefCell<Vec<Value>>,
}

impl RuntimeClass {
    pub fn name(&self) -> &str {
        &self.file.name
    }

    pub fn ancestry(&self) -> &HashSet<String> {
        &self.ancestry
    }

    pub fn is_ancestor(&self, name: &str) -> bool {
        self.ancestry.contains(name)
    }

    /// Heap cells an instance occupies: one header plus one per field.
    pub fn instance_words(&self) -> usize {
        1 + self.layout.len()
    }

    pub fn instance_fields(&self) -> &[FieldSlot] {
        &self.layout
    }

    /// Locates an instance field by name, most-derived declaration first.
    pub fn instance_field(&self, name: &str) -> Option<&FieldSlot> {
        self.layout.iter().rev().find(|slot| slot.name == name)
    }

    /// Locates a static field declared by this class.
    pub fn static_field(&self, name: &str) -> Option<&FieldSlot> {
        self.static_layout.iter().find(|slot| slot.name == name)
    }

    pub fn static_value(&self, slot: usize) -> Value {
        self.statics.borrow()[slot]
    }

    pub fn set_static_value(&self, slot: usize, value: Value) {
        self.statics.borrow_mut()[slot] = value;
    }
}

/// The transitive loader and registry. Injective on class names; indices
/// are assigned densely in load order.
pub struct ClassTable {
    loader: Box<dyn ClassLoader>,
    by_name: HashMap<String, Rc<RuntimeClass>>,
    by_index: Vec<Rc<RuntimeClass>>,
    // Names on the current resolution path, for cycle detection.
    in_progress: HashSet<String>,
}

impl ClassTable {
    pub fn new(loader: Box<dyn ClassLoader>) -> Self {
        Self {
            loader,
            by_name: HashMap::new(),
            by_index: Vec::new(),
            in_progress: HashSet::new(),
        }
    }

    /// Resolves a class by internal name, loading it and its full ancestry
    /// on first use. Idempotent: a second call returns the same
    /// `Rc<RuntimeClass>`.
    pub fn resolve(&mut self, name: &str) -> Result<Rc<RuntimeClass>, VmError> {
        if let Some(existing) = self.by_name.get(name) {
            return Ok(Rc::clone(existing));
        }
        if !self.in_progress.insert(name.to_string()) {
            return Err(VmError::MalformedClass(format!(
                "cyclic inheritance involving {name}"
            )));
        }
        let result = self.resolve_uncached(name);
        self.in_progress.remove(name);
        result
    }

    fn resolve_uncached(
        &mut self,
        name: &str,
    ) -> Result<Rc<RuntimeClass>, VmError> {
        let file = self.load_descriptor(name)?;
        if file.name != name {
            return Err(VmError::MalformedClass(format!(
                "class file for {name} declares itself as {}",
                file.name
            )));
        }

        // Super before sub: ancestry queries never load mid-lookup.
        let super_class = match &file.super_name {
            Some(super_name) => Some(self.resolve(super_name)?),
            None => None,
        };
        let mut ancestry = HashSet::new();
        ancestry.insert(name.to_string());
        if let Some(super_class) = &super_class {
            ancestry.extend(super_class.ancestry.iter().cloned());
        }
        for interface_name in file.interfaces.clone() {
            let interface = self.resolve(&interface_name)?;
            ancestry.extend(interface.ancestry.iter().cloned());
        }

        let mut layout = match &super_class {
            Some(super_class) => super_class.layout.clone(),
            None => Vec::new(),
        };
        for desc in &file.fields {
            if desc.flags.is_static() {
                continue;
            }
            layout.push(FieldSlot {
                name: desc.name.clone(),
                ty: desc.ty.clone(),
                offset: 1 + layout.len(),
            });
        }

        let mut static_layout = Vec::new();
        let mut statics = Vec::new();
        for desc in &file.fields {
            if !desc.flags.is_static() {
                continue;
            }
            static_layout.push(FieldSlot {
                name: desc.name.clone(),
                ty: desc.ty.clone(),
                offset: static_layout.len(),
            });
            statics.push(Value::default_for(&desc.ty));
        }

        let index = self.by_index.len();
        debug!(class = name, index, "registered class");
        let class = Rc::new(RuntimeClass {
            file,
            index,
            ancestry,
            layout,
            static_layout,
            statics: RefCell::new(statics),
        });
        self.by_name.insert(name.to_string(), Rc::clone(&class));
        self.by_index.push(Rc::clone(&class));
        Ok(class)
    }

    fn load_descriptor(&mut self, name: &str) -> Result<ClassFile, VmError> {
        if let Some(bytes) = self.loader.load(name) {
            return ClassParser::parse(&bytes);
        }
        bootstrap_descriptor(name)
            .ok_or_else(|| VmError::ClassNotFound(name.to_string()))
    }

    /// Looks up a class by its load-order index.
    pub fn by_index(&self, index: usize) -> Option<Rc<RuntimeClass>> {
        self.by_index.get(index).map(Rc::clone)
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// The assignability predicate: may a value statically of type `s`
    /// flow into a slot of type `t`? First match wins.
    pub fn is_assignable(
        &mut self,
        s: &Type,
        t: &Type,
    ) -> Result<bool, VmError> {
        match (s, t) {
            (Type::Class(sn), Type::Class(tn)) => {
                Ok(self.resolve(sn)?.is_ancestor(tn))
            }
            (Type::Array(_), Type::Class(tn)) => Ok(tn == OBJECT_CLASS
                || tn == CLONEABLE_CLASS
                || tn == SERIALIZABLE_CLASS),
            (Type::Array(sc), Type::Array(tc)) => match (&**sc, &**tc) {
                (Type::Primitive(a), Type::Primitive(b)) => Ok(a == b),
                (Type::Primitive(_), _) | (_, Type::Primitive(_)) => Ok(false),
                (s_component, t_component) => {
                    self.is_assignable(s_component, t_component)
                }
            },
            _ => Ok(false),
        }
    }
}

/// Minimal descriptors for the core classes a metacircular VM needs even
/// when no JDK class files are on the class path. A loader-provided class
/// file always wins over these.
fn bootstrap_descriptor(name: &str) -> Option<ClassFile> {
    let class_flags = AccessFlags::PUBLIC | AccessFlags::SUPER;
    let interface_flags =
        AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
    let plain = |name: &str, super_name: &str| {
        ClassFile::synthetic(name, Some(super_name), &[], Vec::new(), class_flags)
    };
    Some(match name {
        OBJECT_CLASS => {
            ClassFile::synthetic(name, None, &[], Vec::new(), class_flags)
        }
        STRING_CLASS => ClassFile::synthetic(
            name,
            Some(OBJECT_CLASS),
            &[SERIALIZABLE_CLASS],
            vec![field(
                "value",
                Type::Array(Box::new(Type::Primitive(PrimitiveKind::Char))),
            )],
            class_flags,
        ),
        CLASS_CLASS => ClassFile::synthetic(
            name,
            Some(OBJECT_CLASS),
            &[],
            vec![field("name", Type::Class(STRING_CLASS.to_string()))],
            class_flags,
        ),
        CLONEABLE_CLASS | SERIALIZABLE_CLASS => ClassFile::synthetic(
            name,
            Some(OBJECT_CLASS),
            &[],
            Vec::new(),
            interface_flags,
        ),
        THROWABLE_CLASS => ClassFile::synthetic(
            name,
            Some(OBJECT_CLASS),
            &[SERIALIZABLE_CLASS],
            vec![field(
                "detailMessage",
                Type::Class(STRING_CLASS.to_string()),
            )],
            class_flags,
        ),
        "java/lang/Exception" | "java/lang/Error" => {
            plain(name, THROWABLE_CLASS)
        }
        "java/lang/RuntimeException" => plain(name, "java/lang/Exception"),
        "java/lang/ArithmeticException"
        | "java/lang/ArrayIndexOutOfBoundsException"
        | "java/lang/ClassCastException"
        | "java/lang/NegativeArraySizeException"
        | "java/lang/NullPointerException" => {
            plain(name, "java/lang/RuntimeException")
        }
        "sun/misc/Unsafe"
        | "java/security/AccessController"
        | "sun/reflect/Reflection" => plain(name, OBJECT_CLASS),
        "java/security/PrivilegedAction" => ClassFile::synthetic(
            name,
            Some(OBJECT_CLASS),
            &[],
            Vec::new(),
            interface_flags,
        ),
        _ => return None,
    })
}
