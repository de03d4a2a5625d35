//! Native-binding registry: host-implemented methods that shadow bytecode
//! at resolution time.
//!
//! Bindings live in a tree addressed by a `/`-joined path ending in a leaf
//! named `name + descriptor`; path splitting stops at the descriptor's
//! opening parenthesis. Leaves are arity-agnostic: missing trailing
//! arguments are substituted with null and extras are dropped, with every
//! mismatch reported through the logging callback.

use crate::errors::VmError;
use crate::runtime;
use crate::value::Value;
use crate::vm::VmState;

use tracing::warn;

use std::collections::HashMap;
use std::rc::Rc;

use std::time::{SystemTime, UNIX_EPOCH};

/// Host function behind a trapped method. Receives the machine state and
/// the (already arity-adjusted) argument list; the receiver, when there is
/// one, arrives as the first argument.
pub type NativeFn =
    Rc<dyn Fn(&mut NativeCtx, &[Value]) -> Result<Value, VmError>>;

/// Context handed to a native: the machine state, the registry itself (for
/// trampolining back into bytecode) and the invoking class, if known.
pub struct NativeCtx<'a> {
    pub state: &'a mut VmState,
    pub natives: &'a NativeRegistry,
    pub caller: Option<String>,
}

#[derive(Clone)]
pub struct NativeEntry {
    arity: usize,
    func: NativeFn,
}

impl NativeEntry {
    /// Applies the leaf, feeding arguments left to right: extras beyond
    /// the declared arity are dropped, missing positions read as null.
    pub fn apply(
        &self,
        ctx: &mut NativeCtx,
        args: &[Value],
    ) -> Result<Value, VmError> {
        if args.len() != self.arity {
            let message = format!(
                "native arity mismatch: got {} arguments, leaf takes {}",
                args.len(),
                self.arity
            );
            warn!("{message}");
            ctx.state.log_line(&message);
        }
        let mut fed: Vec<Value> =
            args.iter().copied().take(self.arity).collect();
        while fed.len() < self.arity {
            fed.push(Value::NULL);
        }
        (self.func)(ctx, &fed)
    }
}

enum Node {
    Dir(HashMap<String, Node>),
    Leaf(NativeEntry),
}

/// Directory of host-implemented methods, fixed at VM construction time.
pub struct NativeRegistry {
    root: HashMap<String, Node>,
}

impl NativeRegistry {
    /// An empty registry: no method is trapped.
    pub fn new() -> Self {
        Self {
            root: HashMap::new(),
        }
    }

    /// Registers a leaf at `path`, e.g.
    /// `sun/misc/Unsafe/addressSize()I`. A later registration on the same
    /// path replaces the earlier one.
    pub fn trap<F>(&mut self, path: &str, arity: usize, func: F)
    where
        F: Fn(&mut NativeCtx, &[Value]) -> Result<Value, VmError> + 'static,
    {
        self.trap_fn(path, arity, Rc::new(func));
    }

    pub fn trap_fn(&mut self, path: &str, arity: usize, func: NativeFn) {
        let segments = segments(path);
        insert(&mut self.root, &segments, NativeEntry { arity, func });
    }

    /// Looks up the trapped entry for an owner class and signature.
    pub fn lookup(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Option<NativeEntry> {
        self.lookup_path(&format!("{owner}/{name}{descriptor}"))
    }

    pub fn lookup_path(&self, path: &str) -> Option<NativeEntry> {
        let segments = segments(path);
        let (leaf, dirs) = segments.split_last()?;
        let mut map = &self.root;
        for segment in dirs {
            match map.get(*segment)? {
                Node::Dir(children) => map = children,
                Node::Leaf(_) => return None,
            }
        }
        match map.get(*leaf)? {
            Node::Leaf(entry) => Some(entry.clone()),
            Node::Dir(_) => None,
        }
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a binding path on `/`, stopping at the descriptor's opening
/// parenthesis so slashes inside parameter types stay in the leaf name.
fn segments(path: &str) -> Vec<&str> {
    let stop = path.find('(').unwrap_or(path.len());
    let bytes = path.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, byte) in bytes.iter().enumerate().take(stop) {
        if *byte == b'/' {
            parts.push(&path[start..i]);
            start = i + 1;
        }
    }
    parts.push(&path[start..]);
    parts
}

fn insert(map: &mut HashMap<String, Node>, segments: &[&str], entry: NativeEntry) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert((*head).to_string(), Node::Leaf(entry));
        return;
    }
    let child = map
        .entry((*head).to_string())
        .or_insert_with(|| Node::Dir(HashMap::new()));
    if !matches!(child, Node::Dir(_)) {
        *child = Node::Dir(HashMap::new());
    }
    if let Node::Dir(children) = child {
        insert(children, rest, entry);
    }
}

/// Arity-0 no-op native.
pub fn no_op() -> NativeFn {
    Rc::new(|_ctx, _args| Ok(Value::NULL))
}

/// Arity-1 no-op native (receiver only).
pub fn no_op1() -> NativeFn {
    Rc::new(|_ctx, _args| Ok(Value::NULL))
}

/// Arity-2 no-op native.
pub fn no_op2() -> NativeFn {
    Rc::new(|_ctx, _args| Ok(Value::NULL))
}

const PRIMITIVE_NAMES: [&str; 9] = [
    "boolean", "byte", "short", "char", "int", "long", "float", "double",
    "void",
];

fn mirror_name(ctx: &mut NativeCtx, mirror: usize) -> Result<String, VmError> {
    let name_ref = ctx.state.field_value(mirror, "name")?.as_reference()?;
    ctx.state.read_string(name_ref)
}

impl NativeRegistry {
    /// The stock binding set: platform entry points every interpreted
    /// program ends up touching.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.trap_fn("java/lang/Object/registerNatives()V", 0, no_op());
        registry.trap_fn("java/lang/System/registerNatives()V", 0, no_op());
        registry.trap_fn("java/lang/Class/registerNatives()V", 0, no_op());
        registry.trap_fn("java/lang/Object/<init>()V", 1, no_op1());
        registry.trap_fn("java/lang/Object/notify()V", 1, no_op1());
        registry.trap_fn("java/lang/Object/notifyAll()V", 1, no_op1());
        registry.trap_fn("java/lang/Object/wait(J)V", 2, no_op2());
        registry.trap_fn("java/lang/Throwable/<init>()V", 1, no_op1());

        registry.trap("java/lang/Object/hashCode()I", 1, |_ctx, args| {
            Ok(Value::Int(args[0].as_reference()? as i32))
        });
        registry.trap(
            "java/lang/Object/getClass()Ljava/lang/Class;",
            1,
            |ctx, args| {
                let name = ctx.state.class_name_of(args[0].as_reference()?)?;
                Ok(Value::Ref(ctx.state.mirror(&name)?))
            },
        );

        registry.trap(
            "java/lang/Class/getName()Ljava/lang/String;",
            1,
            |ctx, args| {
                let name = mirror_name(ctx, args[0].as_reference()?)?;
                let dotted = name.replace('/', ".");
                Ok(Value::Ref(ctx.state.intern_text(&dotted)?))
            },
        );
        registry.trap("java/lang/Class/isArray()Z", 1, |ctx, args| {
            let name = mirror_name(ctx, args[0].as_reference()?)?;
            Ok(Value::Int(i32::from(name.starts_with('['))))
        });
        registry.trap(
            "java/lang/Class/getDeclaredFields()[Ljava/lang/String;",
            1,
            |ctx, args| {
                let name = mirror_name(ctx, args[0].as_reference()?)?;
                let field_names: Vec<String> = if name.starts_with('[')
                    || PRIMITIVE_NAMES.contains(&name.as_str())
                {
                    Vec::new()
                } else {
                    ctx.state
                        .classes
                        .resolve(&name)?
                        .file
                        .fields
                        .iter()
                        .map(|f| f.name.clone())
                        .collect()
                };
                let array = ctx.state.allocate_array(field_names.len())?;
                for (i, field_name) in field_names.iter().enumerate() {
                    let text = ctx.state.intern_text(field_name)?;
                    ctx.state.heap.write(array + 1 + i, text as i64)?;
                }
                Ok(Value::Ref(array))
            },
        );
        registry.trap(
            "java/lang/Class/getPrimitiveClass(Ljava/lang/String;)Ljava/lang/Class;",
            1,
            |ctx, args| {
                let name = ctx.state.read_string(args[0].as_reference()?)?;
                Ok(Value::Ref(ctx.state.mirror(&name)?))
            },
        );

        registry.trap(
            "java/lang/System/identityHashCode(Ljava/lang/Object;)I",
            1,
            |_ctx, args| Ok(Value::Int(args[0].as_reference()? as i32)),
        );
        registry.trap(
            "java/lang/System/arraycopy(Ljava/lang/Object;ILjava/lang/Object;II)V",
            5,
            |ctx, args| {
                let src = args[0].as_reference()?;
                let src_pos = args[1].as_int()?;
                let dest = args[2].as_reference()?;
                let dest_pos = args[3].as_int()?;
                let length = args[4].as_int()?;
                if src == 0 || dest == 0 {
                    return Err(VmError::Internal(
                        "arraycopy over a null array".to_string(),
                    ));
                }
                if src_pos < 0 || dest_pos < 0 || length < 0 {
                    return Err(VmError::Internal(
                        "arraycopy with negative positions".to_string(),
                    ));
                }
                let (src_pos, dest_pos, length) =
                    (src_pos as usize, dest_pos as usize, length as usize);
                let src_len = ctx.state.heap.read(src)? as usize;
                let dest_len = ctx.state.heap.read(dest)? as usize;
                if src_pos + length > src_len || dest_pos + length > dest_len {
                    return Err(VmError::Internal(
                        "arraycopy past an array end".to_string(),
                    ));
                }
                // Buffer the source range so overlapping copies behave.
                let mut words = Vec::with_capacity(length);
                for i in 0..length {
                    words.push(ctx.state.heap.read(src + 1 + src_pos + i)?);
                }
                for (i, word) in words.into_iter().enumerate() {
                    ctx.state.heap.write(dest + 1 + dest_pos + i, word)?;
                }
                Ok(Value::NULL)
            },
        );
        registry.trap(
            "java/lang/System/currentTimeMillis()J",
            0,
            |_ctx, _args| Ok(Value::Long(epoch_nanos()? / 1_000_000)),
        );
        registry.trap("java/lang/System/nanoTime()J", 0, |_ctx, _args| {
            Ok(Value::Long(epoch_nanos()?))
        });

        registry.trap(
            "java/lang/Float/floatToRawIntBits(F)I",
            1,
            |_ctx, args| Ok(Value::Int(args[0].as_float()?.to_bits() as i32)),
        );
        registry.trap("java/lang/Float/intBitsToFloat(I)F", 1, |_ctx, args| {
            Ok(Value::Float(f32::from_bits(args[0].as_int()? as u32)))
        });
        registry.trap(
            "java/lang/Double/doubleToRawLongBits(D)J",
            1,
            |_ctx, args| {
                Ok(Value::Long(args[0].as_double()?.to_bits() as i64))
            },
        );
        registry.trap(
            "java/lang/Double/longBitsToDouble(J)D",
            1,
            |_ctx, args| {
                Ok(Value::Double(f64::from_bits(args[0].as_long()? as u64)))
            },
        );

        registry.trap(
            "java/lang/String/intern()Ljava/lang/String;",
            1,
            |ctx, args| {
                Ok(Value::Ref(
                    ctx.state.intern_reference(args[0].as_reference()?)?,
                ))
            },
        );

        registry.trap(
            "java/lang/Throwable/fillInStackTrace()Ljava/lang/Throwable;",
            1,
            |_ctx, args| Ok(args[0]),
        );
        registry.trap(
            "java/lang/Throwable/<init>(Ljava/lang/String;)V",
            2,
            |ctx, args| {
                let receiver = args[0].as_reference()?;
                ctx.state.set_field_value(receiver, "detailMessage", args[1])?;
                Ok(Value::NULL)
            },
        );
        registry.trap(
            "java/lang/Throwable/getMessage()Ljava/lang/String;",
            1,
            |ctx, args| {
                ctx.state.field_value(args[0].as_reference()?, "detailMessage")
            },
        );

        registry.trap(
            "java/security/AccessController/doPrivileged(Ljava/security/PrivilegedAction;)Ljava/lang/Object;",
            1,
            |ctx, args| {
                let action = args[0].as_reference()?;
                if action == 0 {
                    return Err(VmError::Internal(
                        "null privileged action".to_string(),
                    ));
                }
                runtime::call_virtual(
                    ctx.state,
                    ctx.natives,
                    action,
                    "run",
                    "()Ljava/lang/Object;",
                )
            },
        );
        registry.trap(
            "sun/reflect/Reflection/getCallerClass()Ljava/lang/Class;",
            0,
            |ctx, _args| match ctx.caller.clone() {
                Some(caller) => Ok(Value::Ref(ctx.state.mirror(&caller)?)),
                None => Ok(Value::NULL),
            },
        );

        registry.trap("sun/misc/Unsafe/addressSize()I", 0, |_ctx, _args| {
            Ok(Value::Int(4))
        });
        registry.trap(
            "sun/misc/Unsafe/compareAndSwapInt(Ljava/lang/Object;JII)Z",
            5,
            |ctx, args| {
                let object = args[1].as_reference()?;
                let offset = usize::try_from(args[2].as_long()?).map_err(
                    |_| {
                        VmError::Internal(
                            "negative field offset in compareAndSwapInt"
                                .to_string(),
                        )
                    },
                )?;
                let expected = args[3].as_int()?;
                let replacement = args[4].as_int()?;
                let cell = object + offset;
                let current = ctx.state.heap.read(cell)? as i32;
                if current == expected {
                    ctx.state.heap.write(cell, i64::from(replacement))?;
                    Ok(Value::Int(1))
                } else {
                    Ok(Value::Int(0))
                }
            },
        );
        registry.trap(
            "sun/misc/Unsafe/objectFieldOffset(Ljava/lang/reflect/Field;)J",
            2,
            |ctx, _args| {
                ctx.state
                    .log_line("objectFieldOffset stub always reports 0");
                Ok(Value::Long(0))
            },
        );

        registry
    }
}

fn epoch_nanos() -> Result<i64, VmError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| VmError::Internal(format!("clock before epoch: {e}")))?;
    Ok(elapsed.as_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MapLoader;

    fn ctx_state() -> VmState {
        VmState::new(Box::new(MapLoader::new()))
    }

    #[test]
    fn path_splitting_stops_at_the_descriptor() {
        let parts =
            segments("java/lang/Class/getPrimitiveClass(Ljava/lang/String;)Ljava/lang/Class;");
        assert_eq!(
            parts,
            vec![
                "java",
                "lang",
                "Class",
                "getPrimitiveClass(Ljava/lang/String;)Ljava/lang/Class;",
            ]
        );
    }

    #[test]
    fn lookup_finds_registered_leaves() {
        let registry = NativeRegistry::with_defaults();
        assert!(registry
            .lookup("sun/misc/Unsafe", "addressSize", "()I")
            .is_some());
        assert!(registry
            .lookup("sun/misc/Unsafe", "addressSize", "()J")
            .is_none());
        assert!(registry.lookup("no/such/Class", "m", "()V").is_none());
    }

    #[test]
    fn arity_overflow_pads_and_truncates() {
        let mut registry = NativeRegistry::new();
        registry.trap("t/Echo/second(II)I", 2, |_ctx, args| Ok(args[1]));
        let entry = registry.lookup("t/Echo", "second", "(II)I").unwrap();

        let mut state = ctx_state();
        let mut ctx = NativeCtx {
            state: &mut state,
            natives: &registry,
            caller: None,
        };
        // Too few arguments: the missing position reads as null.
        let padded = entry.apply(&mut ctx, &[Value::Int(1)]).unwrap();
        assert_eq!(padded, Value::NULL);
        // Too many: extras are dropped.
        let truncated = entry
            .apply(&mut ctx, &[Value::Int(1), Value::Int(2), Value::Int(3)])
            .unwrap();
        assert_eq!(truncated, Value::Int(2));
    }

    #[test]
    fn mismatches_reach_the_logging_callback() {
        use std::cell::RefCell;

        let mut registry = NativeRegistry::new();
        registry.trap_fn("t/N/f()V", 0, no_op());
        let entry = registry.lookup("t/N", "f", "()V").unwrap();

        let lines: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&lines);
        let mut state = ctx_state();
        state.set_log(Some(Rc::new(move |line: &str| {
            sink.borrow_mut().push(line.to_string());
        })));
        let mut ctx = NativeCtx {
            state: &mut state,
            natives: &registry,
            caller: None,
        };
        entry.apply(&mut ctx, &[Value::Int(9)]).unwrap();
        assert_eq!(lines.borrow().len(), 1);
        assert!(lines.borrow()[0].contains("arity mismatch"));
    }

    #[test]
    fn float_bit_bindings_round_trip() {
        let registry = NativeRegistry::with_defaults();
        let to_bits = registry
            .lookup("java/lang/Float", "floatToRawIntBits", "(F)I")
            .unwrap();
        let from_bits = registry
            .lookup("java/lang/Float", "intBitsToFloat", "(I)F")
            .unwrap();
        let mut state = ctx_state();
        let mut ctx = NativeCtx {
            state: &mut state,
            natives: &registry,
            caller: None,
        };
        let bits = to_bits.apply(&mut ctx, &[Value::Float(1.5)]).unwrap();
        let back = from_bits.apply(&mut ctx, &[bits]).unwrap();
        assert_eq!(back, Value::Float(1.5));
    }
}
