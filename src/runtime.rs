//! The interpreter thread: frame stack, operand stacks, instruction
//! dispatch, invocation protocols and exception propagation.

use crate::classfile::{CodeBody, CpEntry, MethodDesc};
use crate::classes::{FieldSlot, RuntimeClass};
use crate::errors::{UncaughtException, VmError, VmException};
use crate::natives::{NativeCtx, NativeEntry, NativeRegistry};
use crate::opcode::OPCode;
use crate::types::{parse_method_descriptor, PrimitiveKind, Signature, Type};
use crate::value::Value;
use crate::vm::VmState;

use tracing::trace;

use std::rc::Rc;

const NPE: &str = "java/lang/NullPointerException";
const ARITHMETIC: &str = "java/lang/ArithmeticException";
const ARRAY_BOUNDS: &str = "java/lang/ArrayIndexOutOfBoundsException";
const CLASS_CAST: &str = "java/lang/ClassCastException";
const NEGATIVE_SIZE: &str = "java/lang/NegativeArraySizeException";

/// Per-invocation record: the executing method's class and code, the
/// program counter, local variables and the operand stack. A frame lives
/// exactly as long as its invocation.
struct Frame {
    class: Rc<RuntimeClass>,
    signature: Signature,
    code: Rc<CodeBody>,
    pc: usize,
    /// Address of the opcode currently executing; exception-handler ranges
    /// are matched against this.
    insn_pc: usize,
    locals: Vec<Value>,
    stack: Vec<Value>,
}

impl Frame {
    fn new(
        class: Rc<RuntimeClass>,
        method: &MethodDesc,
        args: &[Value],
    ) -> Result<Self, VmError> {
        let code = method.code.clone().ok_or_else(|| {
            VmError::Internal(format!(
                "method {} of {} has no bytecode body",
                method.signature,
                class.name()
            ))
        })?;
        let mut locals = vec![Value::Int(0); code.max_locals as usize];
        // Arguments occupy slots 0..k in declaration order, two-word kinds
        // taking two slots.
        let mut slot = 0;
        for value in args {
            let width = value.word_size();
            if locals.len() < slot + width {
                locals.resize(slot + width, Value::Int(0));
            }
            locals[slot] = *value;
            slot += width;
        }
        Ok(Self {
            signature: method.signature.clone(),
            class,
            code,
            pc: 0,
            insn_pc: 0,
            locals,
            stack: Vec::new(),
        })
    }

    fn fetch_u8(&mut self) -> Result<u8, VmError> {
        let byte = self.code.bytecode.get(self.pc).copied().ok_or_else(|| {
            VmError::Internal(format!(
                "pc {} past end of {}",
                self.pc, self.signature
            ))
        })?;
        self.pc += 1;
        Ok(byte)
    }

    fn fetch_u16(&mut self) -> Result<u16, VmError> {
        let hi = self.fetch_u8()?;
        let lo = self.fetch_u8()?;
        Ok(u16::from(hi) << 8 | u16::from(lo))
    }

    fn fetch_i16(&mut self) -> Result<i16, VmError> {
        Ok(self.fetch_u16()? as i16)
    }

    fn fetch_i32(&mut self) -> Result<i32, VmError> {
        let hi = self.fetch_u16()?;
        let lo = self.fetch_u16()?;
        Ok((i32::from(hi) << 16) | i32::from(lo))
    }

    /// Advances the pc to the next 4-byte boundary of the method, where
    /// the switch payloads start.
    fn align_pc(&mut self) {
        while self.pc % 4 != 0 {
            self.pc += 1;
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| {
            VmError::Internal(format!(
                "operand stack underflow in {}",
                self.signature
            ))
        })
    }

    fn pop_int(&mut self) -> Result<i32, VmError> {
        self.pop()?.as_int()
    }

    fn pop_reference(&mut self) -> Result<usize, VmError> {
        self.pop()?.as_reference()
    }

    fn local(&self, index: usize) -> Result<Value, VmError> {
        self.locals.get(index).copied().ok_or_else(|| {
            VmError::Internal(format!(
                "local slot {index} out of range in {}",
                self.signature
            ))
        })
    }

    fn set_local(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        match self.locals.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::Internal(format!(
                "local slot {index} out of range in {}",
                self.signature
            ))),
        }
    }

    /// Relocates the pc by a branch offset relative to the current opcode.
    fn branch(&mut self, offset: i32) {
        self.pc = (self.insn_pc as i64 + i64::from(offset)) as usize;
    }
}

/// Outcome of method resolution: a trapped native shadows bytecode with
/// the same signature.
enum Resolved {
    Native(NativeEntry),
    Bytecode(Rc<RuntimeClass>, MethodDesc),
}

/// Resolves `signature` starting at `owner` and walking the super chain.
/// At every level the native registry is consulted before declared
/// methods, so host bindings win over same-signature bytecode.
fn resolve_method(
    state: &mut VmState,
    natives: &NativeRegistry,
    owner: &Rc<RuntimeClass>,
    signature: &Signature,
) -> Result<Resolved, VmError> {
    let mut current = Some(Rc::clone(owner));
    while let Some(class) = current {
        if let Some(entry) =
            natives.lookup(class.name(), &signature.name, &signature.descriptor)
        {
            return Ok(Resolved::Native(entry));
        }
        if let Some(method) = class.file.method(signature) {
            if method.code.is_some() {
                return Ok(Resolved::Bytecode(
                    Rc::clone(&class),
                    method.clone(),
                ));
            }
        }
        current = match class.file.super_name.clone() {
            Some(super_name) => Some(state.classes.resolve(&super_name)?),
            None => None,
        };
    }
    Err(VmError::NoSuchMethod {
        class: owner.name().to_string(),
        signature: signature.to_string(),
    })
}

/// Finds the signature of a method by bare name, walking the super chain.
/// Used at the embedding boundary where the caller supplies no descriptor.
fn find_named(
    state: &mut VmState,
    owner: &Rc<RuntimeClass>,
    name: &str,
) -> Result<Signature, VmError> {
    let mut current = Some(Rc::clone(owner));
    while let Some(class) = current {
        if let Some(method) = class.file.method_named(name) {
            return Ok(method.signature.clone());
        }
        current = match class.file.super_name.clone() {
            Some(super_name) => Some(state.classes.resolve(&super_name)?),
            None => None,
        };
    }
    Err(VmError::NoSuchMethod {
        class: owner.name().to_string(),
        signature: name.to_string(),
    })
}

enum InvokeKind {
    Static,
    Special,
    Virtual,
}

/// The single interpreter thread: a stack of frames, the topmost current.
/// An empty stack means idle.
pub struct Thread {
    frames: Vec<Frame>,
}

impl Thread {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Entry point of an interpretation: resolves the class and method,
    /// applies a trapped native directly or pushes the entry frame and
    /// runs the dispatch loop to completion.
    pub fn invoke(
        &mut self,
        state: &mut VmState,
        natives: &NativeRegistry,
        class_name: &str,
        method_name: &str,
        args: Vec<Value>,
    ) -> Result<Value, VmException> {
        self.frames.clear();
        let class = state.classes.resolve(class_name)?;
        let signature = find_named(state, &class, method_name)?;
        match resolve_method(state, natives, &class, &signature)? {
            Resolved::Native(entry) => {
                let mut ctx = NativeCtx {
                    state,
                    natives,
                    caller: None,
                };
                Ok(entry.apply(&mut ctx, &args)?)
            }
            Resolved::Bytecode(owner, method) => {
                self.frames.push(Frame::new(owner, &method, &args)?);
                self.run(state, natives)
            }
        }
    }

    fn run(
        &mut self,
        state: &mut VmState,
        natives: &NativeRegistry,
    ) -> Result<Value, VmException> {
        loop {
            if let Some(result) = self.step(state, natives)? {
                return Ok(result);
            }
        }
    }

    fn current(&mut self) -> Result<&mut Frame, VmError> {
        self.frames
            .last_mut()
            .ok_or_else(|| VmError::Internal("empty frame stack".to_string()))
    }

    /// Executes one instruction of the current frame. Returns the entry
    /// frame's result once it is popped by a return.
    fn step(
        &mut self,
        state: &mut VmState,
        natives: &NativeRegistry,
    ) -> Result<Option<Value>, VmException> {
        let op = {
            let frame = self.current()?;
            frame.insn_pc = frame.pc;
            let byte = frame.fetch_u8()?;
            OPCode::decode(byte).ok_or_else(|| {
                VmError::Internal(format!(
                    "unsupported opcode {byte:#04x} at pc {} in {}",
                    frame.insn_pc, frame.signature
                ))
            })?
        };

        match op {
            OPCode::NOP => {}
            OPCode::AConstNull => self.current()?.push(Value::NULL),
            OPCode::IConstM1 => self.current()?.push(Value::Int(-1)),
            OPCode::IConst0 => self.current()?.push(Value::Int(0)),
            OPCode::IConst1 => self.current()?.push(Value::Int(1)),
            OPCode::IConst2 => self.current()?.push(Value::Int(2)),
            OPCode::IConst3 => self.current()?.push(Value::Int(3)),
            OPCode::IConst4 => self.current()?.push(Value::Int(4)),
            OPCode::IConst5 => self.current()?.push(Value::Int(5)),
            OPCode::LConst0 => self.current()?.push(Value::Long(0)),
            OPCode::LConst1 => self.current()?.push(Value::Long(1)),
            OPCode::FConst0 => self.current()?.push(Value::Float(0.)),
            OPCode::FConst1 => self.current()?.push(Value::Float(1.)),
            OPCode::FConst2 => self.current()?.push(Value::Float(2.)),
            OPCode::DConst0 => self.current()?.push(Value::Double(0.)),
            OPCode::DConst1 => self.current()?.push(Value::Double(1.)),
            OPCode::BiPush => {
                let frame = self.current()?;
                let byte = frame.fetch_u8()? as i8;
                frame.push(Value::Int(i32::from(byte)));
            }
            OPCode::SiPush => {
                let frame = self.current()?;
                let short = frame.fetch_i16()?;
                frame.push(Value::Int(i32::from(short)));
            }
            OPCode::Ldc => {
                let index = u16::from(self.current()?.fetch_u8()?);
                self.push_constant(state, index)?;
            }
            OPCode::LdcW | OPCode::Ldc2W => {
                let index = self.current()?.fetch_u16()?;
                self.push_constant(state, index)?;
            }

            // Loads and stores.
            OPCode::ILoad
            | OPCode::LLoad
            | OPCode::FLoad
            | OPCode::DLoad
            | OPCode::ALoad => {
                let frame = self.current()?;
                let index = usize::from(frame.fetch_u8()?);
                let value = frame.local(index)?;
                frame.push(value);
            }
            OPCode::ILoad0
            | OPCode::LLoad0
            | OPCode::FLoad0
            | OPCode::DLoad0
            | OPCode::ALoad0 => self.load_local(0)?,
            OPCode::ILoad1
            | OPCode::LLoad1
            | OPCode::FLoad1
            | OPCode::DLoad1
            | OPCode::ALoad1 => self.load_local(1)?,
            OPCode::ILoad2
            | OPCode::LLoad2
            | OPCode::FLoad2
            | OPCode::DLoad2
            | OPCode::ALoad2 => self.load_local(2)?,
            OPCode::ILoad3
            | OPCode::LLoad3
            | OPCode::FLoad3
            | OPCode::DLoad3
            | OPCode::ALoad3 => self.load_local(3)?,
            OPCode::IStore
            | OPCode::LStore
            | OPCode::FStore
            | OPCode::DStore
            | OPCode::AStore => {
                let frame = self.current()?;
                let index = usize::from(frame.fetch_u8()?);
                let value = frame.pop()?;
                frame.set_local(index, value)?;
            }
            OPCode::IStore0
            | OPCode::LStore0
            | OPCode::FStore0
            | OPCode::DStore0
            | OPCode::AStore0 => self.store_local(0)?,
            OPCode::IStore1
            | OPCode::LStore1
            | OPCode::FStore1
            | OPCode::DStore1
            | OPCode::AStore1 => self.store_local(1)?,
            OPCode::IStore2
            | OPCode::LStore2
            | OPCode::FStore2
            | OPCode::DStore2
            | OPCode::AStore2 => self.store_local(2)?,
            OPCode::IStore3
            | OPCode::LStore3
            | OPCode::FStore3
            | OPCode::DStore3
            | OPCode::AStore3 => self.store_local(3)?,

            // Array loads and stores.
            OPCode::IALoad
            | OPCode::LALoad
            | OPCode::FALoad
            | OPCode::DALoad
            | OPCode::AALoad
            | OPCode::BALoad
            | OPCode::CALoad
            | OPCode::SALoad => {
                let (index, reference) = {
                    let frame = self.current()?;
                    let index = frame.pop_int()?;
                    let reference = frame.pop_reference()?;
                    (index, reference)
                };
                if reference == 0 {
                    self.raise(state, NPE)?;
                    return Ok(None);
                }
                let length = state.heap.read(reference)?;
                if index < 0 || i64::from(index) >= length {
                    self.raise(state, ARRAY_BOUNDS)?;
                    return Ok(None);
                }
                let word = state.heap.read(reference + 1 + index as usize)?;
                self.current()?.push(element_value(op, word)?);
            }
            OPCode::IAStore
            | OPCode::LAStore
            | OPCode::FAStore
            | OPCode::DAStore
            | OPCode::AAStore
            | OPCode::BAStore
            | OPCode::CAStore
            | OPCode::SAStore => {
                let (value, index, reference) = {
                    let frame = self.current()?;
                    let value = frame.pop()?;
                    let index = frame.pop_int()?;
                    let reference = frame.pop_reference()?;
                    (value, index, reference)
                };
                if reference == 0 {
                    self.raise(state, NPE)?;
                    return Ok(None);
                }
                let length = state.heap.read(reference)?;
                if index < 0 || i64::from(index) >= length {
                    self.raise(state, ARRAY_BOUNDS)?;
                    return Ok(None);
                }
                let word = element_word(op, &value)?;
                state.heap.write(reference + 1 + index as usize, word)?;
            }

            // Operand-stack manipulation. `pop2` and the `dup2` family
            // dispatch on the category of the top entry, since two-word
            // values occupy a single stack entry here.
            OPCode::Pop => {
                self.current()?.pop()?;
            }
            OPCode::Pop2 => {
                let frame = self.current()?;
                let top = frame.pop()?;
                if !top.is_wide() {
                    frame.pop()?;
                }
            }
            OPCode::Dup => {
                let frame = self.current()?;
                let top = frame.pop()?;
                frame.push(top);
                frame.push(top);
            }
            OPCode::DupX1 => {
                let frame = self.current()?;
                let a = frame.pop()?;
                let b = frame.pop()?;
                frame.push(a);
                frame.push(b);
                frame.push(a);
            }
            OPCode::DupX2 => {
                let frame = self.current()?;
                let a = frame.pop()?;
                let b = frame.pop()?;
                if b.is_wide() {
                    frame.push(a);
                    frame.push(b);
                    frame.push(a);
                } else {
                    let c = frame.pop()?;
                    frame.push(a);
                    frame.push(c);
                    frame.push(b);
                    frame.push(a);
                }
            }
            OPCode::Dup2 => {
                let frame = self.current()?;
                let a = frame.pop()?;
                if a.is_wide() {
                    frame.push(a);
                    frame.push(a);
                } else {
                    let b = frame.pop()?;
                    frame.push(b);
                    frame.push(a);
                    frame.push(b);
                    frame.push(a);
                }
            }
            OPCode::Dup2X1 => {
                let frame = self.current()?;
                let a = frame.pop()?;
                let b = frame.pop()?;
                if a.is_wide() {
                    frame.push(a);
                    frame.push(b);
                    frame.push(a);
                } else {
                    let c = frame.pop()?;
                    frame.push(b);
                    frame.push(a);
                    frame.push(c);
                    frame.push(b);
                    frame.push(a);
                }
            }
            OPCode::Dup2X2 => {
                let frame = self.current()?;
                let a = frame.pop()?;
                if a.is_wide() {
                    let b = frame.pop()?;
                    if b.is_wide() {
                        frame.push(a);
                        frame.push(b);
                        frame.push(a);
                    } else {
                        let c = frame.pop()?;
                        frame.push(a);
                        frame.push(c);
                        frame.push(b);
                        frame.push(a);
                    }
                } else {
                    let b = frame.pop()?;
                    let c = frame.pop()?;
                    if c.is_wide() {
                        frame.push(b);
                        frame.push(a);
                        frame.push(c);
                        frame.push(b);
                        frame.push(a);
                    } else {
                        let d = frame.pop()?;
                        frame.push(b);
                        frame.push(a);
                        frame.push(d);
                        frame.push(c);
                        frame.push(b);
                        frame.push(a);
                    }
                }
            }
            OPCode::Swap => {
                let frame = self.current()?;
                let a = frame.pop()?;
                let b = frame.pop()?;
                frame.push(a);
                frame.push(b);
            }

            // Arithmetic.
            OPCode::IAdd | OPCode::LAdd | OPCode::FAdd | OPCode::DAdd => {
                self.binary(Value::add)?;
            }
            OPCode::ISub | OPCode::LSub | OPCode::FSub | OPCode::DSub => {
                self.binary(Value::sub)?;
            }
            OPCode::IMul | OPCode::LMul | OPCode::FMul | OPCode::DMul => {
                self.binary(Value::mul)?;
            }
            OPCode::IDiv | OPCode::LDiv | OPCode::IRem | OPCode::LRem => {
                let (lhs, rhs) = {
                    let frame = self.current()?;
                    let rhs = frame.pop()?;
                    let lhs = frame.pop()?;
                    (lhs, rhs)
                };
                if matches!(rhs, Value::Int(0) | Value::Long(0)) {
                    self.raise(state, ARITHMETIC)?;
                    return Ok(None);
                }
                let result = match op {
                    OPCode::IDiv | OPCode::LDiv => Value::div(&lhs, &rhs)?,
                    _ => Value::rem(&lhs, &rhs)?,
                };
                self.current()?.push(result);
            }
            OPCode::FDiv | OPCode::DDiv => self.binary(Value::div)?,
            OPCode::FRem | OPCode::DRem => self.binary(Value::rem)?,
            OPCode::INeg | OPCode::LNeg | OPCode::FNeg | OPCode::DNeg => {
                let frame = self.current()?;
                let value = frame.pop()?;
                frame.push(value.neg()?);
            }
            OPCode::IShl => {
                let frame = self.current()?;
                let shift = frame.pop_int()?;
                let value = frame.pop_int()?;
                frame.push(Value::Int(value << (shift as u32 & 0x1f)));
            }
            OPCode::LShl => {
                let frame = self.current()?;
                let shift = frame.pop_int()?;
                let value = frame.pop()?.as_long()?;
                frame.push(Value::Long(value << (shift as u32 & 0x3f)));
            }
            OPCode::IShr => {
                let frame = self.current()?;
                let shift = frame.pop_int()?;
                let value = frame.pop_int()?;
                frame.push(Value::Int(value >> (shift as u32 & 0x1f)));
            }
            OPCode::LShr => {
                let frame = self.current()?;
                let shift = frame.pop_int()?;
                let value = frame.pop()?.as_long()?;
                frame.push(Value::Long(value >> (shift as u32 & 0x3f)));
            }
            OPCode::IUShr => {
                let frame = self.current()?;
                let shift = frame.pop_int()?;
                let value = frame.pop_int()?;
                frame.push(Value::Int(
                    ((value as u32) >> (shift as u32 & 0x1f)) as i32,
                ));
            }
            OPCode::LUShr => {
                let frame = self.current()?;
                let shift = frame.pop_int()?;
                let value = frame.pop()?.as_long()?;
                frame.push(Value::Long(
                    ((value as u64) >> (shift as u32 & 0x3f)) as i64,
                ));
            }
            OPCode::IAnd | OPCode::LAnd => self.bitwise(op, |a, b| a & b)?,
            OPCode::IOr | OPCode::LOr => self.bitwise(op, |a, b| a | b)?,
            OPCode::IXor | OPCode::LXor => self.bitwise(op, |a, b| a ^ b)?,
            OPCode::IInc => {
                let frame = self.current()?;
                let index = usize::from(frame.fetch_u8()?);
                let delta = frame.fetch_u8()? as i8;
                let old = frame.local(index)?.as_int()?;
                frame.set_local(
                    index,
                    Value::Int(old.wrapping_add(i32::from(delta))),
                )?;
            }

            // Conversions.
            OPCode::L2I | OPCode::F2I | OPCode::D2I => {
                self.convert(Value::to_int)?;
            }
            OPCode::I2L | OPCode::F2L | OPCode::D2L => {
                self.convert(Value::to_long)?;
            }
            OPCode::I2F | OPCode::L2F | OPCode::D2F => {
                self.convert(Value::to_float)?;
            }
            OPCode::I2D | OPCode::L2D | OPCode::F2D => {
                self.convert(Value::to_double)?;
            }
            OPCode::I2B => {
                let frame = self.current()?;
                let value = frame.pop_int()?;
                frame.push(Value::Int(i32::from(value as i8)));
            }
            OPCode::I2C => {
                let frame = self.current()?;
                let value = frame.pop_int()?;
                frame.push(Value::Int(i32::from(value as u16)));
            }
            OPCode::I2S => {
                let frame = self.current()?;
                let value = frame.pop_int()?;
                frame.push(Value::Int(i32::from(value as i16)));
            }

            // Comparisons; the `l`/`g` suffix picks the NaN outcome.
            OPCode::LCmp | OPCode::FCmpL | OPCode::DCmpL => {
                let frame = self.current()?;
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                frame.push(Value::Int(Value::compare(&lhs, &rhs, -1)?));
            }
            OPCode::FCmpG | OPCode::DCmpG => {
                let frame = self.current()?;
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                frame.push(Value::Int(Value::compare(&lhs, &rhs, 1)?));
            }

            // Branches; offsets are relative to the opcode address.
            OPCode::IfEq
            | OPCode::IfNe
            | OPCode::IfLt
            | OPCode::IfGe
            | OPCode::IfGt
            | OPCode::IfLe => {
                let frame = self.current()?;
                let offset = frame.fetch_i16()?;
                let value = frame.pop_int()?;
                let jump = match op {
                    OPCode::IfEq => value == 0,
                    OPCode::IfNe => value != 0,
                    OPCode::IfLt => value < 0,
                    OPCode::IfGe => value >= 0,
                    OPCode::IfGt => value > 0,
                    _ => value <= 0,
                };
                if jump {
                    frame.branch(i32::from(offset));
                }
            }
            OPCode::IfICmpEq
            | OPCode::IfICmpNe
            | OPCode::IfICmpLt
            | OPCode::IfICmpGe
            | OPCode::IfICmpGt
            | OPCode::IfICmpLe => {
                let frame = self.current()?;
                let offset = frame.fetch_i16()?;
                let rhs = frame.pop_int()?;
                let lhs = frame.pop_int()?;
                let jump = match op {
                    OPCode::IfICmpEq => lhs == rhs,
                    OPCode::IfICmpNe => lhs != rhs,
                    OPCode::IfICmpLt => lhs < rhs,
                    OPCode::IfICmpGe => lhs >= rhs,
                    OPCode::IfICmpGt => lhs > rhs,
                    _ => lhs <= rhs,
                };
                if jump {
                    frame.branch(i32::from(offset));
                }
            }
            OPCode::IfACmpEq | OPCode::IfACmpNe => {
                let frame = self.current()?;
                let offset = frame.fetch_i16()?;
                let rhs = frame.pop_reference()?;
                let lhs = frame.pop_reference()?;
                let equal = lhs == rhs;
                if equal == matches!(op, OPCode::IfACmpEq) {
                    frame.branch(i32::from(offset));
                }
            }
            OPCode::IfNull | OPCode::IfNonNull => {
                let frame = self.current()?;
                let offset = frame.fetch_i16()?;
                let reference = frame.pop_reference()?;
                let null = reference == 0;
                if null == matches!(op, OPCode::IfNull) {
                    frame.branch(i32::from(offset));
                }
            }
            OPCode::Goto => {
                let frame = self.current()?;
                let offset = frame.fetch_i16()?;
                frame.branch(i32::from(offset));
            }
            OPCode::TableSwitch => {
                let frame = self.current()?;
                frame.align_pc();
                let default = frame.fetch_i32()?;
                let low = frame.fetch_i32()?;
                let high = frame.fetch_i32()?;
                if high < low {
                    return Err(VmException::Internal(VmError::Internal(
                        format!("tableswitch bounds {low}..{high} inverted"),
                    )));
                }
                let count = (high - low + 1) as usize;
                let mut offsets = Vec::with_capacity(count);
                for _ in 0..count {
                    offsets.push(frame.fetch_i32()?);
                }
                let key = frame.pop_int()?;
                let offset = if key < low || key > high {
                    default
                } else {
                    offsets[(key - low) as usize]
                };
                frame.branch(offset);
            }
            OPCode::LookupSwitch => {
                let frame = self.current()?;
                frame.align_pc();
                let default = frame.fetch_i32()?;
                let npairs = frame.fetch_i32()?;
                let mut pairs = Vec::with_capacity(npairs.max(0) as usize);
                for _ in 0..npairs {
                    let matched = frame.fetch_i32()?;
                    let target = frame.fetch_i32()?;
                    pairs.push((matched, target));
                }
                let key = frame.pop_int()?;
                let offset = pairs
                    .into_iter()
                    .find(|(matched, _)| *matched == key)
                    .map_or(default, |(_, target)| target);
                frame.branch(offset);
            }

            // Returns. The frame's result lands on the caller's operand
            // stack, or surfaces to the embedder from the entry frame.
            OPCode::IReturn
            | OPCode::LReturn
            | OPCode::FReturn
            | OPCode::DReturn
            | OPCode::AReturn => {
                let value = self.current()?.pop()?;
                self.frames.pop();
                trace!(depth = self.frames.len(), "frame returned");
                match self.frames.last_mut() {
                    Some(caller) => caller.push(value),
                    None => return Ok(Some(value)),
                }
            }
            OPCode::Return => {
                self.frames.pop();
                trace!(depth = self.frames.len(), "frame returned void");
                if self.frames.is_empty() {
                    return Ok(Some(Value::Void));
                }
            }

            // Field access.
            OPCode::GetField => {
                let name = {
                    let frame = self.current()?;
                    let index = frame.fetch_u16()?;
                    let (_owner, name, _descriptor) =
                        frame.class.file.field_ref_at(index)?;
                    name.to_string()
                };
                let reference = self.current()?.pop_reference()?;
                if reference == 0 {
                    self.raise(state, NPE)?;
                    return Ok(None);
                }
                let slot = instance_slot(state, reference, &name)?;
                let word = state.heap.read(reference + slot.offset)?;
                self.current()?.push(Value::from_word(&slot.ty, word));
            }
            OPCode::PutField => {
                let name = {
                    let frame = self.current()?;
                    let index = frame.fetch_u16()?;
                    let (_owner, name, _descriptor) =
                        frame.class.file.field_ref_at(index)?;
                    name.to_string()
                };
                let (value, reference) = {
                    let frame = self.current()?;
                    let value = frame.pop()?;
                    let reference = frame.pop_reference()?;
                    (value, reference)
                };
                if reference == 0 {
                    self.raise(state, NPE)?;
                    return Ok(None);
                }
                let slot = instance_slot(state, reference, &name)?;
                state.heap.write(reference + slot.offset, value.to_word())?;
            }
            OPCode::GetStatic => {
                let (owner, name) = self.fetch_field_ref()?;
                let class = state.classes.resolve(&owner)?;
                let (declarer, slot) = find_static(state, &class, &name)?;
                let value = declarer.static_value(slot.offset);
                self.current()?.push(value);
            }
            OPCode::PutStatic => {
                let (owner, name) = self.fetch_field_ref()?;
                let value = self.current()?.pop()?;
                let class = state.classes.resolve(&owner)?;
                let (declarer, slot) = find_static(state, &class, &name)?;
                declarer.set_static_value(slot.offset, value);
            }

            // Allocation.
            OPCode::New => {
                let name = {
                    let frame = self.current()?;
                    let index = frame.fetch_u16()?;
                    frame.class.file.class_name_at(index)?.to_string()
                };
                let class = state.classes.resolve(&name)?;
                let reference = state.allocate_object(&class)?;
                self.current()?.push(Value::Ref(reference));
            }
            OPCode::NewArray => {
                let count = {
                    let frame = self.current()?;
                    let _atype = frame.fetch_u8()?;
                    frame.pop_int()?
                };
                self.push_new_array(state, count)?;
            }
            OPCode::ANewArray => {
                let count = {
                    let frame = self.current()?;
                    let _component = frame.fetch_u16()?;
                    frame.pop_int()?
                };
                self.push_new_array(state, count)?;
            }
            OPCode::ArrayLength => {
                let reference = self.current()?.pop_reference()?;
                if reference == 0 {
                    self.raise(state, NPE)?;
                    return Ok(None);
                }
                let length = state.heap.read(reference)?;
                self.current()?.push(Value::Int(length as i32));
            }

            // Invocation.
            OPCode::InvokeStatic => {
                let (owner, name, descriptor) = self.fetch_method_ref()?;
                self.invoke_site(
                    state,
                    natives,
                    &owner,
                    &name,
                    &descriptor,
                    &InvokeKind::Static,
                )?;
            }
            OPCode::InvokeSpecial => {
                let (owner, name, descriptor) = self.fetch_method_ref()?;
                self.invoke_site(
                    state,
                    natives,
                    &owner,
                    &name,
                    &descriptor,
                    &InvokeKind::Special,
                )?;
            }
            OPCode::InvokeVirtual => {
                let (owner, name, descriptor) = self.fetch_method_ref()?;
                self.invoke_site(
                    state,
                    natives,
                    &owner,
                    &name,
                    &descriptor,
                    &InvokeKind::Virtual,
                )?;
            }
            OPCode::InvokeInterface => {
                let (owner, name, descriptor) = self.fetch_method_ref()?;
                {
                    // Historical count and padding bytes.
                    let frame = self.current()?;
                    let _count = frame.fetch_u8()?;
                    let _zero = frame.fetch_u8()?;
                }
                self.invoke_site(
                    state,
                    natives,
                    &owner,
                    &name,
                    &descriptor,
                    &InvokeKind::Virtual,
                )?;
            }

            // Exceptions.
            OPCode::AThrow => {
                let reference = self.current()?.pop_reference()?;
                if reference == 0 {
                    self.raise(state, NPE)?;
                } else {
                    self.unwind(state, reference)?;
                }
            }

            // Type checks.
            OPCode::CheckCast => {
                let target = self.fetch_check_type()?;
                let reference = self.current()?.pop_reference()?;
                if reference != 0 {
                    let source = Type::Class(state.class_name_of(reference)?);
                    if !state.classes.is_assignable(&source, &target)? {
                        self.raise(state, CLASS_CAST)?;
                        return Ok(None);
                    }
                }
                self.current()?.push(Value::Ref(reference));
            }
            OPCode::InstanceOf => {
                let target = self.fetch_check_type()?;
                let reference = self.current()?.pop_reference()?;
                let result = if reference == 0 {
                    false
                } else {
                    let source = Type::Class(state.class_name_of(reference)?);
                    state.classes.is_assignable(&source, &target)?
                };
                self.current()?.push(Value::Int(i32::from(result)));
            }

            // Monitors are accepted but have no effect on a single thread.
            OPCode::MonitorEnter | OPCode::MonitorExit => {
                let reference = self.current()?.pop_reference()?;
                if reference == 0 {
                    self.raise(state, NPE)?;
                    return Ok(None);
                }
                trace!(reference, "monitor opcode on single thread");
            }
        }
        Ok(None)
    }

    fn load_local(&mut self, index: usize) -> Result<(), VmError> {
        let frame = self.current()?;
        let value = frame.local(index)?;
        frame.push(value);
        Ok(())
    }

    fn store_local(&mut self, index: usize) -> Result<(), VmError> {
        let frame = self.current()?;
        let value = frame.pop()?;
        frame.set_local(index, value)
    }

    fn binary(
        &mut self,
        apply: fn(&Value, &Value) -> Result<Value, VmError>,
    ) -> Result<(), VmError> {
        let frame = self.current()?;
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        frame.push(apply(&lhs, &rhs)?);
        Ok(())
    }

    fn bitwise(
        &mut self,
        op: OPCode,
        apply: fn(i64, i64) -> i64,
    ) -> Result<(), VmError> {
        let frame = self.current()?;
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        let result = match op {
            OPCode::IAnd | OPCode::IOr | OPCode::IXor => Value::Int(apply(
                i64::from(lhs.as_int()?),
                i64::from(rhs.as_int()?),
            )
                as i32),
            _ => Value::Long(apply(lhs.as_long()?, rhs.as_long()?)),
        };
        frame.push(result);
        Ok(())
    }

    fn convert(
        &mut self,
        apply: fn(&Value) -> Result<Value, VmError>,
    ) -> Result<(), VmError> {
        let frame = self.current()?;
        let value = frame.pop()?;
        frame.push(apply(&value)?);
        Ok(())
    }

    fn push_new_array(
        &mut self,
        state: &mut VmState,
        count: i32,
    ) -> Result<(), VmException> {
        if count < 0 {
            self.raise(state, NEGATIVE_SIZE)?;
            return Ok(());
        }
        let reference = state.allocate_array(count as usize)?;
        self.current()?.push(Value::Ref(reference));
        Ok(())
    }

    fn fetch_field_ref(&mut self) -> Result<(String, String), VmError> {
        let frame = self.current()?;
        let index = frame.fetch_u16()?;
        let (owner, name, _descriptor) = frame.class.file.field_ref_at(index)?;
        Ok((owner.to_string(), name.to_string()))
    }

    fn fetch_method_ref(
        &mut self,
    ) -> Result<(String, String, String), VmError> {
        let frame = self.current()?;
        let index = frame.fetch_u16()?;
        let (owner, name, descriptor) =
            frame.class.file.method_ref_at(index)?;
        Ok((owner.to_string(), name.to_string(), descriptor.to_string()))
    }

    /// Decodes a `checkcast`/`instanceof` operand: the named class, or a
    /// full array descriptor when the constant starts with `[`.
    fn fetch_check_type(&mut self) -> Result<Type, VmError> {
        let frame = self.current()?;
        let index = frame.fetch_u16()?;
        let name = frame.class.file.class_name_at(index)?;
        if name.starts_with('[') {
            Type::parse(name)
        } else {
            Ok(Type::Class(name.to_string()))
        }
    }

    /// Loads and pushes a constant-pool entry for the `ldc` family,
    /// materializing string and class constants on the heap.
    fn push_constant(
        &mut self,
        state: &mut VmState,
        index: u16,
    ) -> Result<(), VmError> {
        let class = Rc::clone(&self.current()?.class);
        let value = match class.file.constant_at(index)? {
            CpEntry::Integer { bytes } => Value::Int(*bytes as i32),
            CpEntry::Float { bytes } => Value::Float(f32::from_bits(*bytes)),
            CpEntry::Long { hi_bytes, lo_bytes } => Value::Long(
                (i64::from(*hi_bytes) << 32) | i64::from(*lo_bytes),
            ),
            CpEntry::Double { hi_bytes, lo_bytes } => {
                Value::Double(f64::from_bits(
                    (u64::from(*hi_bytes) << 32) | u64::from(*lo_bytes),
                ))
            }
            CpEntry::String { string_index } => {
                let text = class.file.utf8_at(*string_index)?.to_string();
                Value::Ref(state.intern_text(&text)?)
            }
            CpEntry::Class { name_index } => {
                let name = class.file.utf8_at(*name_index)?.to_string();
                Value::Ref(state.mirror(&name)?)
            }
            other => {
                return Err(VmError::Internal(format!(
                    "constant {index} is not loadable: {other:?}"
                )))
            }
        };
        self.current()?.push(value);
        Ok(())
    }

    /// Shared tail of the four invocation opcodes: pops arguments and
    /// receiver, resolves (virtually for `invokevirtual` and
    /// `invokeinterface`, directly otherwise), then applies a native or
    /// pushes a frame.
    fn invoke_site(
        &mut self,
        state: &mut VmState,
        natives: &NativeRegistry,
        owner: &str,
        name: &str,
        descriptor: &str,
        kind: &InvokeKind,
    ) -> Result<(), VmException> {
        let (arg_types, ret) = parse_method_descriptor(descriptor)?;
        let mut args = Vec::with_capacity(arg_types.len() + 1);
        {
            let frame = self.current()?;
            for _ in 0..arg_types.len() {
                args.push(frame.pop()?);
            }
        }
        args.reverse();

        if !matches!(kind, InvokeKind::Static) {
            let receiver = self.current()?.pop_reference()?;
            if receiver == 0 {
                self.raise(state, NPE)?;
                return Ok(());
            }
            args.insert(0, Value::Ref(receiver));
        }

        let signature = Signature::new(name, descriptor);
        let start = match kind {
            // Virtual dispatch starts at the receiver's runtime class.
            InvokeKind::Virtual => {
                let receiver = args[0].as_reference()?;
                state.class_of(receiver)?
            }
            _ => state.classes.resolve(owner)?,
        };

        match resolve_method(state, natives, &start, &signature)? {
            Resolved::Native(entry) => {
                let caller = Some(self.current()?.class.name().to_string());
                let mut ctx = NativeCtx {
                    state,
                    natives,
                    caller,
                };
                let result = entry.apply(&mut ctx, &args)?;
                if ret != Type::Primitive(PrimitiveKind::Void) {
                    self.current()?.push(result);
                }
            }
            Resolved::Bytecode(class, method) => {
                trace!(
                    class = class.name(),
                    depth = self.frames.len(),
                    "frame pushed"
                );
                self.frames.push(Frame::new(class, &method, &args)?);
            }
        }
        Ok(())
    }

    /// Allocates an instance of a platform exception class and dispatches
    /// it through the regular unwinding machinery.
    fn raise(
        &mut self,
        state: &mut VmState,
        class_name: &str,
    ) -> Result<(), VmException> {
        let class = state.classes.resolve(class_name)?;
        let reference = state.allocate_object(&class)?;
        self.unwind(state, reference)
    }

    /// Walks the frame stack for a handler covering the throwing pc whose
    /// declared type admits the thrown object; clears the operand stack
    /// and transfers control, or pops the frame and keeps walking. An
    /// empty stack surfaces the object as `UncaughtException`.
    fn unwind(
        &mut self,
        state: &mut VmState,
        thrown: usize,
    ) -> Result<(), VmException> {
        let thrown_class = state.class_name_of(thrown)?;
        let thrown_type = Type::Class(thrown_class.clone());
        while !self.frames.is_empty() {
            let (pc, code) = {
                let frame = self.current()?;
                (frame.insn_pc, Rc::clone(&frame.code))
            };
            let mut target = None;
            for entry in &code.exception_table {
                let covers = usize::from(entry.start_pc) <= pc
                    && pc < usize::from(entry.end_pc);
                if !covers {
                    continue;
                }
                let admits = match &entry.catch_type {
                    None => true,
                    Some(catch) => state.classes.is_assignable(
                        &thrown_type,
                        &Type::Class(catch.clone()),
                    )?,
                };
                if admits {
                    target = Some(usize::from(entry.handler_pc));
                    break;
                }
            }
            match target {
                Some(handler_pc) => {
                    let frame = self.current()?;
                    frame.stack.clear();
                    frame.push(Value::Ref(thrown));
                    frame.pc = handler_pc;
                    return Ok(());
                }
                None => {
                    self.frames.pop();
                    trace!(
                        class = thrown_class.as_str(),
                        depth = self.frames.len(),
                        "unwound frame"
                    );
                }
            }
        }
        Err(VmException::Uncaught(UncaughtException {
            class_name: thrown_class,
            reference: thrown,
        }))
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

/// Invokes `name` + `descriptor` virtually on `receiver` over a private
/// frame stack. Used by native bindings that trampoline back into
/// bytecode; an exception escaping the call is reported as an internal
/// error rather than unwinding the outer thread.
pub fn call_virtual(
    state: &mut VmState,
    natives: &NativeRegistry,
    receiver: usize,
    name: &str,
    descriptor: &str,
) -> Result<Value, VmError> {
    let class = state.class_of(receiver)?;
    let signature = Signature::new(name, descriptor);
    match resolve_method(state, natives, &class, &signature)? {
        Resolved::Native(entry) => {
            let mut ctx = NativeCtx {
                state,
                natives,
                caller: None,
            };
            entry.apply(&mut ctx, &[Value::Ref(receiver)])
        }
        Resolved::Bytecode(owner, method) => {
            let mut thread = Thread::new();
            thread
                .frames
                .push(Frame::new(owner, &method, &[Value::Ref(receiver)])?);
            match thread.run(state, natives) {
                Ok(value) => Ok(value),
                Err(VmException::Internal(err)) => Err(err),
                Err(VmException::Uncaught(uncaught)) => {
                    Err(VmError::Internal(format!(
                        "uncaught {} escaping a host-initiated call",
                        uncaught.class_name
                    )))
                }
            }
        }
    }
}

/// Decodes an array-load result word under the opcode's element kind.
fn element_value(op: OPCode, word: i64) -> Result<Value, VmError> {
    match op {
        OPCode::IALoad => Ok(Value::Int(word as i32)),
        OPCode::LALoad => Ok(Value::Long(word)),
        OPCode::FALoad => Ok(Value::Float(f32::from_bits(word as u32))),
        OPCode::DALoad => Ok(Value::Double(f64::from_bits(word as u64))),
        OPCode::AALoad => Ok(Value::Ref(word as usize)),
        OPCode::BALoad => Ok(Value::Int(i32::from(word as i8))),
        OPCode::CALoad => Ok(Value::Int(i32::from(word as u16))),
        OPCode::SALoad => Ok(Value::Int(i32::from(word as i16))),
        other => {
            Err(VmError::Internal(format!("{other} is not an array load")))
        }
    }
}

/// Encodes an array-store operand into its element word, truncating the
/// sub-int kinds.
fn element_word(op: OPCode, value: &Value) -> Result<i64, VmError> {
    match op {
        OPCode::IAStore => Ok(i64::from(value.as_int()?)),
        OPCode::LAStore => value.as_long(),
        OPCode::FAStore => Ok(i64::from(value.as_float()?.to_bits())),
        OPCode::DAStore => Ok(value.as_double()?.to_bits() as i64),
        OPCode::AAStore => Ok(value.as_reference()? as i64),
        OPCode::BAStore => Ok(i64::from(value.as_int()? as i8)),
        OPCode::CAStore => Ok(i64::from(value.as_int()? as u16)),
        OPCode::SAStore => Ok(i64::from(value.as_int()? as i16)),
        other => {
            Err(VmError::Internal(format!("{other} is not an array store")))
        }
    }
}

/// Locates an instance-field slot through an object's runtime class.
fn instance_slot(
    state: &VmState,
    reference: usize,
    name: &str,
) -> Result<FieldSlot, VmError> {
    let class = state.class_of(reference)?;
    class.instance_field(name).cloned().ok_or_else(|| {
        VmError::Internal(format!("class {} has no field {name}", class.name()))
    })
}

/// Locates a static-field slot, walking the super chain from `class`.
fn find_static(
    state: &mut VmState,
    class: &Rc<RuntimeClass>,
    name: &str,
) -> Result<(Rc<RuntimeClass>, FieldSlot), VmError> {
    let mut current = Some(Rc::clone(class));
    while let Some(candidate) = current {
        let found = candidate.static_field(name).cloned();
        if let Some(slot) = found {
            return Ok((candidate, slot));
        }
        current = match candidate.file.super_name.clone() {
            Some(super_name) => Some(state.classes.resolve(&super_name)?),
            None => None,
        };
    }
    Err(VmError::Internal(format!(
        "no static field {name} reachable from {}",
        class.name()
    )))
}
