//! Memory accessors - typed reads and writes at a base pointer + offset
//!
//! No bounds checking beyond the descriptor's width: the caller vouches
//! that `base + offset` is valid for the value being accessed.


use crate::descriptor::{Ownership, TypeDescriptor};
use crate::errors::{EngineError, Result};
use crate::interop::marshal::{from_native, to_native, Frame};
use crate::interop::NativeSlot;
use crate::lifecycle::with_engine;
use crate::ownership::{c_free, BoxedHandle, FreeFn};
use crate::value::Value;

/// Descriptors that describe one field of native memory
fn check_field(ty: &TypeDescriptor) -> Result<()> {
    match ty {
        TypeDescriptor::Integer { .. }
        | TypeDescriptor::Float { .. }
        | TypeDescriptor::Boolean
        | TypeDescriptor::String { .. }
        | TypeDescriptor::Object { .. }
        | TypeDescriptor::Boxed { .. } => ty.validate(),
        other => Err(EngineError::invalid_descriptor(format!(
            "{} is not a scalar or boxed field",
            other
        ))),
    }
}

/// Base address of a pointer-like value; NULL is rejected
fn base_address(target: &Value) -> Result<usize> {
    match target.address() {
        Some(address) if address != 0 => Ok(address),
        _ => Err(EngineError::marshal("non-null pointer", target.describe())),
    }
}

/// Read a field of type `ty` at `offset` bytes past `target`
///
/// Pointer-valued fields (strings, objects, boxed) are read as the
/// pointer stored in the field, with the descriptor's ownership applied.
pub fn read(target: &Value, ty: &TypeDescriptor, offset: usize) -> Result<Value> {
    with_engine(|engine| {
        check_field(ty)?;
        let base = base_address(target)?;
        // SAFETY: caller guarantees the field lies within live memory
        let slot = unsafe { NativeSlot::load(ty.value_slot(), (base + offset) as *const u8) };
        from_native(engine, ty, slot)
    })
}

/// Write `value` into the field of type `ty` at `offset` bytes past `target`
///
/// Strings are stored as fresh C allocations; the field's previous
/// contents are not freed.
pub fn write(target: &Value, ty: &TypeDescriptor, offset: usize, value: impl Into<Value>) -> Result<()> {
    let value = value.into();
    with_engine(|engine| {
        check_field(ty)?;
        let base = base_address(target)?;
        let ty = match ty {
            TypeDescriptor::String { .. } => TypeDescriptor::string(Ownership::Owned),
            other => other.clone(),
        };
        let mut frame = Frame::new();
        let slot = to_native(engine, &ty, &value, true, &mut frame)?;
        // SAFETY: caller guarantees the field lies within live memory
        unsafe { slot.store(ty.value_slot(), (base + offset) as *mut u8) };
        frame.commit();
        Ok(())
    })
}

/// Zero-initialized buffer of `size` bytes, owned by the returned handle
///
/// Released with the C allocator; copies are byte copies.
pub fn alloc(size: usize, type_name: &str, library: &str) -> Result<BoxedHandle> {
    with_engine(|_| {
        // SAFETY: plain zeroed allocation
        let ptr = unsafe { libc::calloc(1, size.max(1)) };
        if ptr.is_null() {
            return Err(EngineError::marshal(
                format!("{} bytes for {}", size, type_name),
                "allocation failure",
            ));
        }
        tracing::trace!(
            target: "nativebridge::memory",
            type_name,
            size,
            address = format_args!("{:#x}", ptr as usize),
            "alloc"
        );
        Ok(BoxedHandle::new(
            ptr as usize,
            type_name,
            library,
            Some(size),
            Some(c_free as FreeFn),
            true,
        ))
    })
}
