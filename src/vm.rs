//! The embedding surface: a `Vm` owns one heap, one class table, one
//! interning table and one interpreter thread, and exposes `invoke`.
//!
//! `VmState` bundles the mutable machine state so the interpreter and the
//! native bindings can share it; the object and array allocators and the
//! string plumbing live here because they cut across the heap and the
//! class table.

use crate::classes::{ClassTable, RuntimeClass, CLASS_CLASS, STRING_CLASS};
use crate::errors::{VmError, VmException};
use crate::heap::Heap;
use crate::loader::ClassLoader;
use crate::natives::NativeRegistry;
use crate::runtime::Thread;
use crate::strings::StringTable;
use crate::value::Value;

use std::collections::HashMap;
use std::rc::Rc;

/// Host logging callback; receives one line per report.
pub type LogFn = Rc<dyn Fn(&str)>;

/// Mutable machine state shared by the interpreter and native bindings.
pub struct VmState {
    pub heap: Heap,
    pub classes: ClassTable,
    pub strings: StringTable,
    // One java/lang/Class instance per type name handed out so far.
    mirrors: HashMap<String, usize>,
    log: Option<LogFn>,
}

impl VmState {
    pub fn new(loader: Box<dyn ClassLoader>) -> Self {
        Self {
            heap: Heap::new(),
            classes: ClassTable::new(loader),
            strings: StringTable::new(),
            mirrors: HashMap::new(),
            log: None,
        }
    }

    pub fn set_log(&mut self, log: Option<LogFn>) {
        self.log = log;
    }

    /// Reports one line through the host logging callback, if any.
    pub fn log_line(&self, message: &str) {
        if let Some(log) = &self.log {
            log(message);
        }
    }

    /// Allocates a zeroed instance of `class`: one header cell holding the
    /// runtime-class index, then one cell per instance field.
    pub fn allocate_object(
        &mut self,
        class: &RuntimeClass,
    ) -> Result<usize, VmError> {
        let words = class.instance_words();
        let start = self.heap.allocate(words)?;
        self.heap.write(start, class.index as i64)?;
        for offset in 1..words {
            self.heap.write(start + offset, 0)?;
        }
        Ok(start)
    }

    /// Allocates a zeroed array: a length header then `length` element
    /// cells.
    pub fn allocate_array(&mut self, length: usize) -> Result<usize, VmError> {
        let start = self.heap.allocate(1 + length)?;
        self.heap.write(start, length as i64)?;
        for offset in 1..=length {
            self.heap.write(start + offset, 0)?;
        }
        Ok(start)
    }

    /// Reads an object's header and returns its runtime class.
    pub fn class_of(
        &self,
        reference: usize,
    ) -> Result<Rc<RuntimeClass>, VmError> {
        if reference == 0 {
            return Err(VmError::Internal(
                "null dereference reading object header".to_string(),
            ));
        }
        let header = self.heap.read(reference)?;
        usize::try_from(header)
            .ok()
            .and_then(|index| self.classes.by_index(index))
            .ok_or_else(|| {
                VmError::Internal(format!(
                    "cell {reference} header {header} is not a class index"
                ))
            })
    }

    pub fn class_name_of(&self, reference: usize) -> Result<String, VmError> {
        Ok(self.class_of(reference)?.name().to_string())
    }

    /// Reads a named instance field of a heap object.
    pub fn field_value(
        &self,
        reference: usize,
        field: &str,
    ) -> Result<Value, VmError> {
        let class = self.class_of(reference)?;
        let slot = class.instance_field(field).ok_or_else(|| {
            VmError::Internal(format!(
                "class {} has no field {field}",
                class.name()
            ))
        })?;
        let word = self.heap.read(reference + slot.offset)?;
        Ok(Value::from_word(&slot.ty, word))
    }

    /// Writes a named instance field of a heap object.
    pub fn set_field_value(
        &mut self,
        reference: usize,
        field: &str,
        value: Value,
    ) -> Result<(), VmError> {
        let class = self.class_of(reference)?;
        let slot = class.instance_field(field).ok_or_else(|| {
            VmError::Internal(format!(
                "class {} has no field {field}",
                class.name()
            ))
        })?;
        let offset = slot.offset;
        self.heap.write(reference + offset, value.to_word())
    }

    /// Allocates a fresh (uninterned) `java/lang/String` over a new char
    /// array.
    pub fn new_string(&mut self, text: &str) -> Result<usize, VmError> {
        let units: Vec<u16> = text.encode_utf16().collect();
        let chars = self.allocate_array(units.len())?;
        for (i, unit) in units.iter().enumerate() {
            self.heap.write(chars + 1 + i, i64::from(*unit))?;
        }
        let string_class = self.classes.resolve(STRING_CLASS)?;
        let object = self.allocate_object(&string_class)?;
        let offset = string_class
            .instance_field("value")
            .ok_or_else(|| {
                VmError::Internal(
                    "string class lacks its value field".to_string(),
                )
            })?
            .offset;
        self.heap.write(object + offset, chars as i64)?;
        Ok(object)
    }

    /// Extracts the character sequence of a string object.
    pub fn read_string(&self, reference: usize) -> Result<String, VmError> {
        let chars = self.field_value(reference, "value")?.as_reference()?;
        if chars == 0 {
            return Err(VmError::Internal(
                "string object with null character array".to_string(),
            ));
        }
        let length = usize::try_from(self.heap.read(chars)?).map_err(|_| {
            VmError::Internal("negative array length".to_string())
        })?;
        let mut units = Vec::with_capacity(length);
        for i in 0..length {
            units.push(self.heap.read(chars + 1 + i)? as u16);
        }
        String::from_utf16(&units).map_err(|e| {
            VmError::Internal(format!("string holds invalid UTF-16: {e}"))
        })
    }

    /// Returns the canonical reference for `text`, allocating a string
    /// object on first sight.
    pub fn intern_text(&mut self, text: &str) -> Result<usize, VmError> {
        if let Some(existing) = self.strings.lookup(text) {
            return Ok(existing);
        }
        let fresh = self.new_string(text)?;
        Ok(self.strings.canonical(text, fresh))
    }

    /// Interns an existing string object by its character contents.
    pub fn intern_reference(
        &mut self,
        reference: usize,
    ) -> Result<usize, VmError> {
        let text = self.read_string(reference)?;
        Ok(self.strings.canonical(&text, reference))
    }

    /// Returns the unique `java/lang/Class` instance for a type name
    /// (internal class name, array descriptor, or primitive name).
    pub fn mirror(&mut self, type_name: &str) -> Result<usize, VmError> {
        if let Some(existing) = self.mirrors.get(type_name) {
            return Ok(*existing);
        }
        let class_class = self.classes.resolve(CLASS_CLASS)?;
        let object = self.allocate_object(&class_class)?;
        let name_ref = self.intern_text(type_name)?;
        let offset = class_class
            .instance_field("name")
            .ok_or_else(|| {
                VmError::Internal(
                    "class mirror lacks its name field".to_string(),
                )
            })?
            .offset;
        self.heap.write(object + offset, name_ref as i64)?;
        self.mirrors.insert(type_name.to_string(), object);
        Ok(object)
    }
}

/// A virtual machine instance. Construction fixes the class loader, the
/// native-binding table and the logging callback; `invoke` interprets one
/// method at a time on the instance's single thread.
pub struct Vm {
    state: VmState,
    natives: NativeRegistry,
    thread: Thread,
}

impl Vm {
    /// Builds a VM over `loader` with the default native bindings.
    pub fn new(loader: Box<dyn ClassLoader>) -> Self {
        Self {
            state: VmState::new(loader),
            natives: NativeRegistry::with_defaults(),
            thread: Thread::new(),
        }
    }

    /// Replaces the native-binding table.
    pub fn with_bindings(mut self, natives: NativeRegistry) -> Self {
        self.natives = natives;
        self
    }

    /// Installs a host logging callback.
    pub fn with_log(mut self, log: impl Fn(&str) + 'static) -> Self {
        self.state.set_log(Some(Rc::new(log)));
        self
    }

    /// Resolves `class_name`, resolves `method_name` against it, and runs
    /// the method with `args`. Bytecode methods run on the interpreter
    /// thread; trapped natives are applied directly.
    pub fn invoke(
        &mut self,
        class_name: &str,
        method_name: &str,
        args: Vec<Value>,
    ) -> Result<Value, VmException> {
        self.thread
            .invoke(&mut self.state, &self.natives, class_name, method_name, args)
    }

    /// Fixed-width rendering of the live heap prefix.
    pub fn heap_dump(&self) -> String {
        self.state.heap.dump()
    }

    /// Marshals a string reference returned by `invoke` out of the heap.
    pub fn read_string(&self, reference: usize) -> Result<String, VmError> {
        self.state.read_string(reference)
    }

    pub fn state(&self) -> &VmState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut VmState {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MapLoader;

    fn state() -> VmState {
        VmState::new(Box::new(MapLoader::new()))
    }

    #[test]
    fn object_allocation_writes_header_and_zeroes_fields() {
        let mut state = state();
        let throwable =
            state.classes.resolve("java/lang/Throwable").unwrap();
        let reference = state.allocate_object(&throwable).unwrap();
        assert_eq!(
            state.heap.read(reference).unwrap(),
            throwable.index as i64
        );
        assert!(state
            .field_value(reference, "detailMessage")
            .unwrap()
            .is_null());
        assert_eq!(state.class_name_of(reference).unwrap(), "java/lang/Throwable");
    }

    #[test]
    fn string_round_trip_and_interning() {
        let mut state = state();
        let first = state.intern_text("brew").unwrap();
        let second = state.intern_text("brew").unwrap();
        assert_eq!(first, second);
        assert_eq!(state.read_string(first).unwrap(), "brew");

        // Interning an equal but distinct object yields the canonical one.
        let fresh = state.new_string("brew").unwrap();
        assert_ne!(fresh, first);
        assert_eq!(state.intern_reference(fresh).unwrap(), first);
    }

    #[test]
    fn mirrors_are_unique_per_name() {
        let mut state = state();
        let a = state.mirror("java/lang/String").unwrap();
        let b = state.mirror("java/lang/String").unwrap();
        let c = state.mirror("int").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn field_access_by_name() {
        let mut state = state();
        let throwable =
            state.classes.resolve("java/lang/Throwable").unwrap();
        let reference = state.allocate_object(&throwable).unwrap();
        let message = state.intern_text("boom").unwrap();
        state
            .set_field_value(reference, "detailMessage", Value::Ref(message))
            .unwrap();
        assert_eq!(
            state.field_value(reference, "detailMessage").unwrap(),
            Value::Ref(message)
        );
        assert!(state.field_value(reference, "nope").is_err());
    }
}
