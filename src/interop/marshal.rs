//! Value marshaling - managed values <-> native slots
//!
//! Design: one exhaustive match per direction over `TypeDescriptor`.
//! Everything a call borrows for its duration (C strings, scratch
//! buffers, out-parameter slots, borrowed containers) lives in a `Frame`
//! that is released once the call has returned. Transfers to native code
//! (owned strings, copies, containers, extra references) are undone by
//! the frame unless the call was actually issued.

use super::types::{NativeSlot, SlotType};
use crate::collections;
use crate::descriptor::{ContainerKind, DestroySlot, Ownership, TypeDescriptor};
use crate::errors::{EngineError, Result};
use crate::lifecycle::Engine;
use crate::ownership::{boxed_argument, boxed_free_fn, release, wrap_boxed};
use crate::trampoline::{self, RegistrationId};
use crate::value::{ReferenceCell, Value};
use smallvec::SmallVec;
use std::ffi::{CStr, CString};
use std::os::raw::c_void;

/// One argument of a native call
#[derive(Debug, Clone)]
pub struct Argument {
    pub descriptor: TypeDescriptor,
    pub value: Value,
    /// The native parameter accepts NULL
    pub optional: bool,
}

impl Argument {
    pub fn new(descriptor: TypeDescriptor, value: impl Into<Value>) -> Self {
        Self {
            descriptor,
            value: value.into(),
            optional: false,
        }
    }

    /// Argument whose native parameter accepts NULL
    pub fn optional(descriptor: TypeDescriptor, value: impl Into<Value>) -> Self {
        Self {
            descriptor,
            value: value.into(),
            optional: true,
        }
    }
}

/// Out-parameter awaiting copy-back
struct OutParam {
    cell: ReferenceCell,
    inner: TypeDescriptor,
    slot: *mut NativeSlot,
    initial: NativeSlot,
}

/// Scratch storage for one native call
#[derive(Default)]
pub(crate) struct Frame {
    strings: Vec<CString>,
    buffers: Vec<Vec<u64>>,
    scratch: Vec<Box<NativeSlot>>,
    out_params: Vec<OutParam>,
    registrations: Vec<RegistrationId>,
    rollbacks: Vec<Box<dyn FnOnce()>>,
    cleanups: Vec<Box<dyn FnOnce()>>,
}

impl Frame {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Keep a C string alive for the call and return its pointer
    fn keep_string(&mut self, s: CString) -> usize {
        let ptr = s.as_ptr() as usize;
        self.strings.push(s);
        ptr
    }

    /// Zeroed, 8-byte aligned scratch buffer
    pub(crate) fn buffer(&mut self, bytes: usize) -> *mut u8 {
        let mut words = vec![0u64; bytes.div_ceil(8).max(1)];
        let ptr = words.as_mut_ptr() as *mut u8;
        self.buffers.push(words);
        ptr
    }

    /// Run `f` once the call is over
    pub(crate) fn defer(&mut self, f: impl FnOnce() + 'static) {
        self.cleanups.push(Box::new(f));
    }

    #[cfg(test)]
    pub(crate) fn lent_strings(&self) -> usize {
        self.strings.len()
    }

    /// Undo a transfer to native code if the call is never issued
    pub(crate) fn on_abort(&mut self, f: impl FnOnce() + 'static) {
        self.rollbacks.push(Box::new(f));
    }

    /// The call was issued: transfers and registrations now belong to
    /// native code
    pub(crate) fn commit(&mut self) {
        self.registrations.clear();
        self.rollbacks.clear();
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // a call that never happened leaves its trampolines unreachable
        for id in self.registrations.drain(..) {
            trampoline::unregister(id);
        }
        while let Some(rollback) = self.rollbacks.pop() {
            rollback();
        }
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
    }
}

fn expect(ty: &TypeDescriptor, optional: bool, value: &Value) -> EngineError {
    let expected = if optional {
        format!("{} or null", ty)
    } else {
        ty.to_string()
    };
    EngineError::marshal(expected, value.describe())
}

/// Marshal a single-slot value
pub(crate) fn to_native(
    engine: &Engine,
    ty: &TypeDescriptor,
    value: &Value,
    optional: bool,
    frame: &mut Frame,
) -> Result<NativeSlot> {
    let slot_type = ty.value_slot();
    match ty {
        TypeDescriptor::Integer { .. } => {
            let i = match value {
                Value::Int(i) => *i,
                Value::Bool(b) => *b as i128,
                other => return Err(expect(ty, false, other)),
            };
            let (lo, hi) = slot_type.int_range();
            if i < lo || i > hi {
                return Err(EngineError::marshal(ty.to_string(), i.to_string()));
            }
            Ok(NativeSlot::from_int(slot_type, i))
        }
        TypeDescriptor::Float { .. } => match value {
            Value::Float(f) => Ok(NativeSlot::from_float(slot_type, *f)),
            Value::Int(i) => Ok(NativeSlot::from_float(slot_type, *i as f64)),
            other => Err(expect(ty, false, other)),
        },
        TypeDescriptor::Boolean => match value {
            Value::Bool(b) => Ok(NativeSlot::from_int(SlotType::I32, *b as i128)),
            Value::Int(i @ (0 | 1)) => Ok(NativeSlot::from_int(SlotType::I32, *i)),
            other => Err(expect(ty, false, other)),
        },
        TypeDescriptor::String { ownership } => match value {
            Value::String(s) => {
                let c = CString::new(s.as_str()).map_err(|_| {
                    EngineError::marshal(ty.to_string(), "string with an interior NUL")
                })?;
                if ownership.is_owned() {
                    // SAFETY: malloc'd copy native code will g_free
                    let copy = unsafe { libc::strdup(c.as_ptr()) };
                    if copy.is_null() {
                        return Err(EngineError::marshal(ty.to_string(), "allocation failure"));
                    }
                    let address = copy as usize;
                    frame.on_abort(move || unsafe { libc::free(address as *mut libc::c_void) });
                    Ok(NativeSlot::from_address(address))
                } else {
                    Ok(NativeSlot::from_address(frame.keep_string(c)))
                }
            }
            Value::Pointer(p) if *p != 0 || optional => Ok(NativeSlot::from_address(*p)),
            Value::Null if optional => Ok(NativeSlot::zeroed()),
            other => Err(expect(ty, optional, other)),
        },
        TypeDescriptor::Object { ownership } => {
            let address = engine
                .objects
                .object_argument(&engine.config, value, *ownership, optional)?;
            if ownership.is_owned() && address != 0 {
                let fns = match value {
                    Value::Object(handle) => handle.refcount_fns(),
                    _ => engine.objects.refcount_fns(&engine.config)?,
                };
                frame.on_abort(move || release(&fns, address));
            }
            Ok(NativeSlot::from_address(address))
        }
        TypeDescriptor::Boxed {
            ownership,
            type_name,
            ..
        } => {
            let address = boxed_argument(&engine.config, value, type_name, *ownership, optional)?;
            if let (true, Value::Boxed(boxed)) = (ownership.is_owned(), value) {
                if let Some(free) = boxed_free_fn(&engine.config, boxed) {
                    // SAFETY: `address` is the copy made for this call
                    frame.on_abort(move || unsafe { free(address as *mut c_void) });
                }
            }
            Ok(NativeSlot::from_address(address))
        }
        TypeDescriptor::Array {
            item_type,
            container_kind,
            ownership,
            ..
        } => match value {
            Value::Array(items) => {
                let (ptr, _) = collections::array_to_native(
                    engine,
                    item_type,
                    *container_kind,
                    *ownership,
                    items,
                    frame,
                )?;
                Ok(NativeSlot::from_address(ptr))
            }
            Value::Null if optional => Ok(NativeSlot::zeroed()),
            other => Err(expect(ty, optional, other)),
        },
        TypeDescriptor::HashTable {
            key_type,
            value_type,
            ownership,
            ..
        } => match value {
            Value::Map(pairs) => {
                let table = collections::hash_to_native(
                    engine, key_type, value_type, *ownership, pairs, frame,
                )?;
                Ok(NativeSlot::from_address(table))
            }
            Value::Null if optional => Ok(NativeSlot::zeroed()),
            other => Err(expect(ty, optional, other)),
        },
        TypeDescriptor::Null => match value {
            Value::Null => Ok(NativeSlot::zeroed()),
            other => Err(expect(ty, false, other)),
        },
        TypeDescriptor::Reference { .. } | TypeDescriptor::Callback { .. } | TypeDescriptor::Void => {
            Err(EngineError::invalid_descriptor(format!(
                "{} does not fit a single value slot",
                ty
            )))
        }
    }
}

/// Unmarshal a single-slot value
pub(crate) fn from_native(engine: &Engine, ty: &TypeDescriptor, slot: NativeSlot) -> Result<Value> {
    from_native_sized(engine, ty, slot, None)
}

/// Unmarshal, with the element count of a sized array when known
pub(crate) fn from_native_sized(
    engine: &Engine,
    ty: &TypeDescriptor,
    slot: NativeSlot,
    length: Option<usize>,
) -> Result<Value> {
    match ty {
        TypeDescriptor::Integer { .. } => Ok(Value::Int(slot.int_value(ty.value_slot()))),
        TypeDescriptor::Float { .. } => Ok(Value::Float(slot.float_value(ty.value_slot()))),
        TypeDescriptor::Boolean => Ok(Value::Bool(slot.int_value(SlotType::I32) != 0)),
        TypeDescriptor::String { ownership } => {
            let ptr = slot.as_ptr() as *const libc::c_char;
            if ptr.is_null() {
                return Ok(Value::Null);
            }
            // SAFETY: descriptor says this is a NUL-terminated string
            let text = unsafe { CStr::from_ptr(ptr) }.to_str().map(str::to_owned);
            if ownership.is_owned() {
                unsafe { libc::free(ptr as *mut libc::c_void) };
            }
            text.map(Value::String)
                .map_err(|_| EngineError::marshal(ty.to_string(), "invalid UTF-8"))
        }
        TypeDescriptor::Object { ownership } => {
            engine
                .objects
                .wrap_object(&engine.config, slot.address(), *ownership)
        }
        TypeDescriptor::Boxed {
            ownership,
            type_name,
            library,
        } => Ok(wrap_boxed(
            &engine.config,
            slot.address(),
            type_name,
            library,
            *ownership,
        )),
        TypeDescriptor::Array {
            item_type,
            container_kind,
            ownership,
            nullable,
        } => collections::array_from_native(
            engine,
            item_type,
            *container_kind,
            *ownership,
            *nullable,
            slot.address(),
            length,
        ),
        TypeDescriptor::HashTable {
            key_type,
            value_type,
            ownership,
            nullable,
        } => collections::hash_from_native(
            engine,
            key_type,
            value_type,
            *ownership,
            *nullable,
            slot.address(),
        ),
        TypeDescriptor::Null | TypeDescriptor::Void => Ok(Value::Null),
        TypeDescriptor::Reference { .. } | TypeDescriptor::Callback { .. } => Err(
            EngineError::invalid_descriptor(format!("{} cannot be produced by native code", ty)),
        ),
    }
}

/// Marshal one call argument into its native slots
pub(crate) fn push_arg(
    engine: &Engine,
    arg: &Argument,
    types: &mut SmallVec<[SlotType; 8]>,
    slots: &mut SmallVec<[NativeSlot; 8]>,
    frame: &mut Frame,
) -> Result<()> {
    let ty = &arg.descriptor;
    match ty {
        TypeDescriptor::Array {
            item_type,
            container_kind: kind @ ContainerKind::SizedArray { .. },
            ownership,
            ..
        } => {
            let (ptr, len) = match &arg.value {
                Value::Array(items) => {
                    collections::array_to_native(engine, item_type, *kind, *ownership, items, frame)?
                }
                Value::Null if arg.optional => (0, 0),
                other => return Err(expect(ty, arg.optional, other)),
            };
            types.extend([SlotType::Pointer, SlotType::Size]);
            slots.extend([NativeSlot::from_address(ptr), NativeSlot::from_address(len)]);
        }
        TypeDescriptor::Reference { inner_type } => {
            let cell = match &arg.value {
                Value::Ref(cell) => cell,
                Value::Null if arg.optional => {
                    types.push(SlotType::Pointer);
                    slots.push(NativeSlot::zeroed());
                    return Ok(());
                }
                other => return Err(expect(ty, arg.optional, other)),
            };
            cell.declare(inner_type)?;

            // the incoming value is only lent to native code
            let current = cell.get();
            let initial = if current.is_null() {
                NativeSlot::zeroed()
            } else {
                to_native(
                    engine,
                    &inner_type.with_ownership(Ownership::Borrowed),
                    &current,
                    true,
                    frame,
                )?
            };

            let mut scratch = Box::new(initial);
            let ptr: *mut NativeSlot = &mut *scratch;
            frame.scratch.push(scratch);
            frame.out_params.push(OutParam {
                cell: cell.clone(),
                inner: (**inner_type).clone(),
                slot: ptr,
                initial,
            });
            types.push(SlotType::Pointer);
            slots.push(NativeSlot::from_ptr(ptr as *mut c_void));
        }
        TypeDescriptor::Callback {
            trampoline_kind,
            arg_types,
            return_type,
        } => {
            let shape = trampoline_kind.shape();
            let slot_types = ty.slot_types();
            match &arg.value {
                Value::Callback(callable) => {
                    let native = trampoline::register(
                        *trampoline_kind,
                        arg_types,
                        return_type,
                        callable.clone(),
                    )?;
                    frame.registrations.push(native.id);
                    slots.push(NativeSlot::from_address(native.code));
                    if shape.user_data_slot {
                        slots.push(NativeSlot::from_address(native.user_data));
                    }
                    if shape.destroy != DestroySlot::None {
                        slots.push(NativeSlot::from_address(native.destroy));
                    }
                }
                Value::Null if arg.optional => {
                    slots.extend(slot_types.iter().map(|_| NativeSlot::zeroed()));
                }
                other => return Err(expect(ty, arg.optional, other)),
            }
            types.extend(slot_types);
        }
        _ => {
            slots.push(to_native(engine, ty, &arg.value, arg.optional, frame)?);
            types.push(ty.value_slot());
        }
    }
    Ok(())
}

/// Copy every out-parameter's final native value back into its cell
///
/// Pointer slots native code left untouched keep the cell's value, since
/// they still point at storage the frame lent out.
pub(crate) fn copy_back(engine: &Engine, frame: &mut Frame) -> Result<()> {
    let out_params = std::mem::take(&mut frame.out_params);
    let mut first_error = None;
    for (i, out) in out_params.into_iter().enumerate() {
        // SAFETY: the scratch slot is owned by the frame
        let after = unsafe { *out.slot };
        let pointer_like = out.inner.value_slot() == SlotType::Pointer;
        if pointer_like && after.address() != 0 && after.address() == out.initial.address() {
            continue;
        }
        match from_native(engine, &out.inner, after) {
            Ok(value) => out.cell.set(value),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e.with_context(format!("out-parameter {}", i)));
                }
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}
