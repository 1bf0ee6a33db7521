//! Call dispatcher
//!
//! Marshals arguments into native slots, issues the call through a libffi
//! call interface, copies out-parameters back and unmarshals the result.

use super::library::resolve_symbol;
use super::marshal::{copy_back, from_native_sized, push_arg, Argument, Frame};
use super::types::{NativeSlot, SlotType};
use crate::descriptor::{ContainerKind, TypeDescriptor};
use crate::errors::{EngineError, Result};
use crate::lifecycle::{with_engine, Engine};
use crate::logging::{log_marshal_error, log_native_call, perf};
use crate::value::Value;
use libffi::middle::{Arg, Cif, CodePtr};
use smallvec::SmallVec;
use std::os::raw::c_void;
use std::rc::Rc;

/// Key of the call interface cache
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CifKey {
    address: usize,
    args: SmallVec<[SlotType; 8]>,
    ret: SlotType,
}

/// Call `symbol` in `library`
pub fn call(
    library: &str,
    symbol: &str,
    args: &[Argument],
    return_type: &TypeDescriptor,
) -> Result<Value> {
    with_engine(|engine| {
        let address = resolve_symbol(&engine.config, library, symbol)?;
        log_native_call(library, symbol, args.len());
        let _timer = perf::time_call(symbol);
        let result = dispatch(engine, address, args, return_type);
        if let Err(e) = &result {
            if e.is_marshal() {
                log_marshal_error(symbol, &e.to_string());
            }
        }
        result
    })
}

/// Call an already-resolved function pointer
pub fn call_address(address: usize, args: &[Argument], return_type: &TypeDescriptor) -> Result<Value> {
    with_engine(|engine| dispatch(engine, address, args, return_type))
}

/// Shared call path
pub(crate) fn dispatch(
    engine: &Engine,
    address: usize,
    args: &[Argument],
    return_type: &TypeDescriptor,
) -> Result<Value> {
    if address == 0 {
        return Err(EngineError::invalid_descriptor("call through a NULL function pointer"));
    }
    let result = dispatch_inner(engine, address, args, return_type);
    if matches!(result, Err(EngineError::Marshal { .. })) {
        engine.count_marshal_error();
    }
    result
}

fn dispatch_inner(
    engine: &Engine,
    address: usize,
    args: &[Argument],
    return_type: &TypeDescriptor,
) -> Result<Value> {
    return_type.validate_return()?;
    let length_arg = returned_length_arg(args, return_type)?;

    let mut frame = Frame::new();
    let mut types: SmallVec<[SlotType; 8]> = SmallVec::new();
    let mut slots: SmallVec<[NativeSlot; 8]> = SmallVec::new();
    for (i, arg) in args.iter().enumerate() {
        arg.descriptor
            .validate_argument()
            .and_then(|_| push_arg(engine, arg, &mut types, &mut slots, &mut frame))
            .map_err(|e| e.with_context(format!("argument {}", i)))?;
    }

    let ret_slot = return_type.value_slot();
    let cif = engine.cif(CifKey {
        address,
        args: types,
        ret: ret_slot,
    });

    let ffi_args: SmallVec<[Arg; 8]> = slots.iter().map(Arg::new).collect();
    let code = CodePtr(address as *mut c_void);

    engine.count_call();
    // SAFETY: the caller's descriptors are the function's C signature
    let raw = unsafe {
        match ret_slot {
            SlotType::Void => {
                cif.call::<()>(code, &ffi_args);
                NativeSlot::zeroed()
            }
            SlotType::F32 => NativeSlot::from_float(SlotType::F32, cif.call::<f32>(code, &ffi_args) as f64),
            SlotType::F64 => NativeSlot::from_float(SlotType::F64, cif.call::<f64>(code, &ffi_args)),
            // integer returns are widened to a full register by libffi
            integral => NativeSlot::from_int(integral, cif.call::<u64>(code, &ffi_args) as i128),
        }
    };
    frame.commit();
    drop(ffi_args);

    let copied = copy_back(engine, &mut frame);
    let length = match length_arg {
        Some(index) => Some(length_from(&args[index])?),
        None => None,
    };
    let value = from_native_sized(engine, return_type, raw, length)?;
    copied?;
    Ok(value)
}

/// Index of the out-parameter holding a returned sized array's length
fn returned_length_arg(args: &[Argument], return_type: &TypeDescriptor) -> Result<Option<usize>> {
    let TypeDescriptor::Array {
        container_kind: ContainerKind::SizedArray { length_arg },
        ..
    } = return_type
    else {
        return Ok(None);
    };

    let index = length_arg.ok_or_else(|| {
        EngineError::invalid_descriptor("returned sized array needs a length argument")
    })?;
    match args.get(index).map(|a| &a.descriptor) {
        Some(TypeDescriptor::Reference { inner_type })
            if matches!(**inner_type, TypeDescriptor::Integer { .. }) =>
        {
            Ok(Some(index))
        }
        _ => Err(EngineError::invalid_descriptor(format!(
            "length argument {} of a returned sized array must be a Reference<Integer>",
            index
        ))),
    }
}

fn length_from(arg: &Argument) -> Result<usize> {
    let value = arg.value.as_ref_cell().map(|cell| cell.get());
    match value.as_ref().and_then(Value::as_int) {
        Some(n) if n >= 0 => Ok(n as usize),
        _ => Err(EngineError::marshal(
            "non-negative array length",
            value.map_or_else(|| "missing".to_string(), |v| v.describe()),
        )),
    }
}

impl Engine {
    /// Cached call interface for a signature
    pub(crate) fn cif(&self, key: CifKey) -> Rc<Cif> {
        if let Some(cif) = self.cifs.borrow().get(&key) {
            return Rc::clone(cif);
        }
        let cif = Rc::new(Cif::new(
            key.args.iter().map(|t| t.ffi_type()),
            key.ret.ffi_type(),
        ));
        self.cifs.borrow_mut().insert(key, Rc::clone(&cif));
        cif
    }
}
