//! Native entry points of every trampoline

use super::registry::{self, Invocation};
use crate::descriptor::TypeDescriptor;
use crate::errors::{EngineError, Result};
use crate::interop::marshal::{from_native, to_native, Frame};
use crate::interop::{NativeSlot, SlotType};
use crate::lifecycle::{is_running, try_with_engine, Engine};
use crate::value::Value;
use libffi::low::ffi_cif;
use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// libffi closure body shared by all trampoline kinds
pub(crate) unsafe extern "C" fn invoke(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    id: &u64,
) {
    let id = *id;
    *result = 0;

    if !is_running() {
        tracing::warn!(
            target: "nativebridge::trampoline",
            id,
            "trampoline invoked with no engine on this thread, ignoring"
        );
        return;
    }
    let Some(invocation) = registry::lookup(id) else {
        tracing::warn!(
            target: "nativebridge::trampoline",
            id,
            "trampoline invoked after release, ignoring"
        );
        return;
    };

    registry::enter();
    let outcome = catch_unwind(AssertUnwindSafe(|| run(&invocation, args)));
    match outcome {
        Ok(Ok(slot)) => write_result(result, invocation.return_type.value_slot(), slot),
        Ok(Err(e)) => tracing::error!(
            target: "nativebridge::trampoline",
            id,
            kind = invocation.kind.name(),
            error = %e,
            "callback failed"
        ),
        Err(_) => tracing::error!(
            target: "nativebridge::trampoline",
            id,
            kind = invocation.kind.name(),
            "callback panicked"
        ),
    }
    if invocation.kind.shape().one_shot {
        registry::release(id, "one-shot");
    }
    registry::leave();
}

fn run(invocation: &Invocation, args: *const *const c_void) -> Result<NativeSlot> {
    let values = try_with_engine(|engine| native_args(engine, &invocation.arg_types, args))
        .ok_or_else(engine_gone)??;

    let returned = invocation.callable.invoke(&values);
    drop(values);

    try_with_engine(|engine| return_slot(engine, &invocation.return_type, &returned))
        .ok_or_else(engine_gone)?
}

fn engine_gone() -> EngineError {
    EngineError::marshal("running engine", "callback after stop")
}

fn native_args(
    engine: &Engine,
    arg_types: &[TypeDescriptor],
    args: *const *const c_void,
) -> Result<Vec<Value>> {
    arg_types
        .iter()
        .enumerate()
        .map(|(i, ty)| {
            // SAFETY: libffi passes one pointer per declared argument
            let slot = unsafe { NativeSlot::load(ty.value_slot(), *args.add(i) as *const u8) };
            from_native(engine, ty, slot).map_err(|e| e.with_context(format!("callback argument {}", i)))
        })
        .collect()
}

/// Native return slot for a callable's result
///
/// Strings are always handed back as a fresh C allocation; nothing on the
/// managed side could keep a borrowed one alive.
fn return_slot(engine: &Engine, ty: &TypeDescriptor, value: &Value) -> Result<NativeSlot> {
    let ty = match ty {
        TypeDescriptor::Void => return Ok(NativeSlot::zeroed()),
        TypeDescriptor::String { .. } => TypeDescriptor::string(crate::descriptor::Ownership::Owned),
        other => other.clone(),
    };
    let mut frame = Frame::new();
    let slot = to_native(engine, &ty, value, true, &mut frame)?;
    // the value now belongs to the native caller
    frame.commit();
    Ok(slot)
}

/// Widen a return slot into libffi's return register
unsafe fn write_result(result: &mut u64, ty: SlotType, slot: NativeSlot) {
    match ty {
        SlotType::Void => {}
        SlotType::F32 => *(result as *mut u64 as *mut f32) = slot.float_value(SlotType::F32) as f32,
        SlotType::F64 => *(result as *mut u64 as *mut f64) = slot.float_value(SlotType::F64),
        integral => *result = slot.int_value(integral) as i64 as u64,
    }
}

/// `GDestroyNotify` paired with a registration
pub(crate) unsafe extern "C" fn destroy_notify(data: *mut c_void) {
    notify(data as u64, "destroy-notify");
}

/// `GClosureNotify` paired with a signal connection
pub(crate) unsafe extern "C" fn closure_notify(data: *mut c_void, _closure: *mut c_void) {
    notify(data as u64, "closure-notify");
}

/// Registrations live in the engine thread's registry; a notification
/// from anywhere else (or after stop) finds nothing to release
fn notify(id: u64, reason: &'static str) {
    if !registry::release(id, reason) {
        tracing::debug!(
            target: "nativebridge::trampoline",
            id,
            reason,
            "release notification for an unknown registration"
        );
    }
}
