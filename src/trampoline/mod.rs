//! Callback trampolines
//!
//! Every managed callable handed to native code gets its own libffi
//! closure. The closure's userdata is the registration id; the handler
//! looks the callable up by id on each invocation, so a released
//! registration is never dereferenced, only missed.
//!
//! Lifetime of a registration follows its trampoline kind:
//! - `Destroy` and `AsyncReady` are released after their single call
//! - kinds with a destroy slot are released when native code calls it
//! - everything else lives until [`unregister`] or engine stop

mod handler;
mod registry;


use crate::descriptor::{DestroySlot, TrampolineKind, TypeDescriptor};
use crate::errors::Result;
use crate::interop::SlotType;
use crate::logging::log_closure_registered;
use crate::value::Callable;
use libffi::middle::{Cif, Closure};
use registry::{NativeCode, Registration};
use std::fmt;
use std::rc::Rc;

pub(crate) use registry::retire_all;

/// Identifier of one trampoline registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub(crate) u64);

impl RegistrationId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Native-facing half of a registration
///
/// `user_data` is what native code passes back as the trailing `gpointer`;
/// `destroy` is zero for kinds without a destroy slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCallback {
    pub id: RegistrationId,
    pub code: usize,
    pub user_data: usize,
    pub destroy: usize,
}

/// Register `callable` behind a trampoline of `kind`
pub fn register(
    kind: TrampolineKind,
    arg_types: &[TypeDescriptor],
    return_type: &TypeDescriptor,
    callable: Callable,
) -> Result<NativeCallback> {
    TypeDescriptor::callback(kind, arg_types.to_vec(), return_type.clone()).validate()?;
    let shape = kind.shape();

    let mut params: Vec<SlotType> = arg_types.iter().map(TypeDescriptor::value_slot).collect();
    if shape.user_data_param {
        params.push(SlotType::Pointer);
    }
    let cif = Cif::new(
        params.iter().map(|t| t.ffi_type()),
        return_type.value_slot().ffi_type(),
    );

    let id = registry::next_id();
    let userdata = Box::into_raw(Box::new(id));
    // SAFETY: the box is freed only when the closure is dropped with it
    let closure = Closure::new(cif, handler::invoke, unsafe { &*userdata });
    let code = *closure.code_ptr() as usize;

    let destroy = match shape.destroy {
        DestroySlot::None => 0,
        DestroySlot::DestroyNotify => handler::destroy_notify as usize,
        DestroySlot::ClosureNotify => handler::closure_notify as usize,
    };

    registry::insert(
        id,
        Registration {
            callable,
            kind,
            arg_types: Rc::from(arg_types),
            return_type: Rc::new(return_type.clone()),
            code: NativeCode { closure, userdata },
        },
    );
    log_closure_registered(id, kind.name());

    Ok(NativeCallback {
        id: RegistrationId(id),
        code,
        user_data: id as usize,
        destroy,
    })
}

/// Drop a registration explicitly
///
/// Returns `false` if it was already released. Native code must no longer
/// hold the code pointer.
pub fn unregister(id: RegistrationId) -> bool {
    registry::release(id.0, "unregister")
}

/// Registrations currently reachable from native code
pub fn live_closures() -> usize {
    registry::live()
}

/// Live registrations backed by `callable`
pub(crate) fn registrations_of(callable: &Callable) -> Vec<RegistrationId> {
    registry::ids_for(callable.identity())
}
