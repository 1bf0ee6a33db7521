//! Collection marshaler
//!
//! Managed `Array`/`Map` values <-> native flat arrays, GList/GSList,
//! GPtrArray and GHashTable. Element conversion is delegated back to the
//! scalar marshaler with the item descriptor, so ownership of elements
//! follows the item type while ownership of the container structure
//! follows the container descriptor.

pub mod glib;


use crate::descriptor::{ContainerKind, Ownership, TypeDescriptor};
use crate::errors::{EngineError, Result};
use crate::interop::marshal::{from_native, to_native, Frame};
use crate::interop::NativeSlot;
use crate::lifecycle::Engine;
use crate::value::Value;
use glib::{Glib, GList, GPtrArray, GSList};
use std::os::raw::{c_uint, c_void};

/// Pointer-sized container payload for one element (`GINT_TO_POINTER`
/// for integers)
fn value_to_payload(
    engine: &Engine,
    item: &TypeDescriptor,
    value: &Value,
    frame: &mut Frame,
) -> Result<usize> {
    let slot = to_native(engine, item, value, false, frame)?;
    Ok(match item {
        TypeDescriptor::Integer { .. } | TypeDescriptor::Boolean => {
            slot.int_value(item.value_slot()) as isize as usize
        }
        _ => slot.address(),
    })
}

/// Item descriptor used when building a container
///
/// An owned container outlives the call, so borrowed strings in it are
/// duplicated rather than pointing into the call's frame.
fn element_type(item: &TypeDescriptor, container: Ownership) -> TypeDescriptor {
    match item {
        TypeDescriptor::String {
            ownership: Ownership::Borrowed,
        } if container.is_owned() => TypeDescriptor::string(Ownership::Owned),
        other => other.clone(),
    }
}

fn payload_to_value(engine: &Engine, item: &TypeDescriptor, payload: usize) -> Result<Value> {
    let slot = match item {
        TypeDescriptor::Integer { .. } | TypeDescriptor::Boolean => {
            NativeSlot::from_int(item.value_slot(), payload as isize as i128)
        }
        _ => NativeSlot::from_address(payload),
    };
    from_native(engine, item, slot)
}

/// Build a native container for an argument
///
/// Returns the container pointer and the element count. Borrowed
/// containers live until the call's frame is dropped; owned containers
/// are handed to native code.
pub(crate) fn array_to_native(
    engine: &Engine,
    item: &TypeDescriptor,
    kind: ContainerKind,
    ownership: Ownership,
    items: &[Value],
    frame: &mut Frame,
) -> Result<(usize, usize)> {
    let glib = Glib::new(&engine.config);
    let item = &element_type(item, ownership);
    match kind {
        ContainerKind::FlatArray | ContainerKind::SizedArray { .. } | ContainerKind::FixedArray { .. } => {
            if let ContainerKind::FixedArray { length } = kind {
                if items.len() != length {
                    return Err(EngineError::marshal(
                        format!("array of exactly {} elements", length),
                        format!("array of {}", items.len()),
                    ));
                }
            }
            let size = item.native_size();
            let count = match kind {
                ContainerKind::FlatArray => items.len() + 1,
                _ => items.len(),
            };
            let buffer = if ownership.is_owned() {
                // SAFETY: plain allocation handed to native code
                let ptr = unsafe { libc::calloc(count.max(1), size) } as *mut u8;
                if ptr.is_null() {
                    return Err(EngineError::marshal("array", "allocation failure"));
                }
                let address = ptr as usize;
                frame.on_abort(move || unsafe { libc::free(address as *mut libc::c_void) });
                ptr
            } else {
                frame.buffer(count * size)
            };

            for (i, value) in items.iter().enumerate() {
                let slot = to_native(engine, item, value, false, frame)
                    .map_err(|e| e.with_context(format!("element {}", i)))?;
                // SAFETY: the buffer holds `count` elements of `size` bytes
                unsafe { slot.store(item.value_slot(), buffer.add(i * size)) };
            }
            Ok((buffer as usize, items.len()))
        }
        ContainerKind::DoublyLinkedList => {
            let payloads = payloads(engine, item, items, frame)?;
            let mut head: *mut GList = std::ptr::null_mut();
            for payload in payloads.into_iter().rev() {
                // SAFETY: prepending to a list we are building
                head = unsafe { glib.list_prepend(head, payload as *mut c_void)? };
            }
            if !head.is_null() {
                let free = glib.destructor("g_list_free")?;
                release_container(frame, ownership, head as usize, free);
            }
            Ok((head as usize, items.len()))
        }
        ContainerKind::SinglyLinkedList => {
            let payloads = payloads(engine, item, items, frame)?;
            let mut head: *mut GSList = std::ptr::null_mut();
            for payload in payloads.into_iter().rev() {
                // SAFETY: prepending to a list we are building
                head = unsafe { glib.slist_prepend(head, payload as *mut c_void)? };
            }
            if !head.is_null() {
                let free = glib.destructor("g_slist_free")?;
                release_container(frame, ownership, head as usize, free);
            }
            Ok((head as usize, items.len()))
        }
        ContainerKind::PointerArray => {
            let payloads = payloads(engine, item, items, frame)?;
            // SAFETY: building a fresh pointer array
            let array = unsafe {
                let array = glib.ptr_array_sized_new(payloads.len() as c_uint)?;
                for payload in payloads {
                    glib.ptr_array_add(array, payload as *mut c_void)?;
                }
                array
            };
            let unref = glib.destructor("g_ptr_array_unref")?;
            release_container(frame, ownership, array as usize, unref);
            Ok((array as usize, items.len()))
        }
    }
}

/// Borrowed containers go away with the call; owned ones only if the
/// call is never issued
fn release_container(
    frame: &mut Frame,
    ownership: Ownership,
    address: usize,
    free: unsafe extern "C" fn(*mut c_void),
) {
    // SAFETY: `free` is the GLib destructor of the container at `address`
    let release = move || unsafe { free(address as *mut c_void) };
    if ownership.is_owned() {
        frame.on_abort(release);
    } else {
        frame.defer(release);
    }
}

fn payloads(
    engine: &Engine,
    item: &TypeDescriptor,
    items: &[Value],
    frame: &mut Frame,
) -> Result<Vec<usize>> {
    items
        .iter()
        .enumerate()
        .map(|(i, value)| {
            value_to_payload(engine, item, value, frame)
                .map_err(|e| e.with_context(format!("element {}", i)))
        })
        .collect()
}

/// Convert a native container into an `Array` value
///
/// `length` is required for sized arrays. Owned containers have their
/// structure freed after every element has been converted.
pub(crate) fn array_from_native(
    engine: &Engine,
    item: &TypeDescriptor,
    kind: ContainerKind,
    ownership: Ownership,
    nullable: bool,
    address: usize,
    length: Option<usize>,
) -> Result<Value> {
    if address == 0 {
        return Ok(if nullable { Value::Null } else { Value::Array(Vec::new()) });
    }

    let glib = Glib::new(&engine.config);
    let items = match kind {
        ContainerKind::FlatArray | ContainerKind::SizedArray { .. } | ContainerKind::FixedArray { .. } => {
            let count = match kind {
                ContainerKind::FixedArray { length } => Some(length),
                ContainerKind::SizedArray { .. } => Some(length.ok_or_else(|| {
                    EngineError::invalid_descriptor("sized array without a length argument")
                })?),
                _ => None,
            };
            let items = read_elements(engine, item, address as *const u8, count);
            if ownership.is_owned() {
                // SAFETY: owned C arrays are released with the C allocator
                unsafe { libc::free(address as *mut libc::c_void) };
            }
            items?
        }
        ContainerKind::DoublyLinkedList => {
            // SAFETY: descriptor says this is a GList
            let payloads = unsafe { glib::list_payloads(address as *const GList) };
            let items = convert_payloads(engine, item, &payloads);
            if ownership.is_owned() {
                unsafe { glib.list_free(address as *mut GList)? };
            }
            items?
        }
        ContainerKind::SinglyLinkedList => {
            // SAFETY: descriptor says this is a GSList
            let payloads = unsafe { glib::slist_payloads(address as *const GSList) };
            let items = convert_payloads(engine, item, &payloads);
            if ownership.is_owned() {
                unsafe { glib.slist_free(address as *mut GSList)? };
            }
            items?
        }
        ContainerKind::PointerArray => {
            // SAFETY: descriptor says this is a GPtrArray
            let payloads = unsafe { glib::ptr_array_payloads(address as *const GPtrArray) };
            // the array's own free function owns the elements
            let items = convert_payloads(engine, &item.with_ownership(Ownership::Borrowed), &payloads);
            if ownership.is_owned() {
                unsafe { glib.ptr_array_unref(address as *mut GPtrArray)? };
            }
            items?
        }
    };
    Ok(Value::Array(items))
}

fn read_elements(
    engine: &Engine,
    item: &TypeDescriptor,
    base: *const u8,
    count: Option<usize>,
) -> Result<Vec<Value>> {
    let ty = item.value_slot();
    let size = ty.size();
    let mut items = Vec::new();
    let mut i = 0;
    loop {
        if count.is_some_and(|n| i >= n) {
            break;
        }
        // SAFETY: element `i` lies within the array (or before its terminator)
        let slot = unsafe { NativeSlot::load(ty, base.add(i * size)) };
        if count.is_none() && slot.int_value(crate::interop::SlotType::U64) == 0 {
            break;
        }
        items.push(
            from_native(engine, item, slot).map_err(|e| e.with_context(format!("element {}", i)))?,
        );
        i += 1;
    }
    Ok(items)
}

fn convert_payloads(engine: &Engine, item: &TypeDescriptor, payloads: &[usize]) -> Result<Vec<Value>> {
    payloads
        .iter()
        .enumerate()
        .map(|(i, &payload)| {
            payload_to_value(engine, item, payload)
                .map_err(|e| e.with_context(format!("element {}", i)))
        })
        .collect()
}

/// Build a GHashTable for an argument
pub(crate) fn hash_to_native(
    engine: &Engine,
    key_type: &TypeDescriptor,
    value_type: &TypeDescriptor,
    ownership: Ownership,
    pairs: &[(Value, Value)],
    frame: &mut Frame,
) -> Result<usize> {
    let glib = Glib::new(&engine.config);
    let string_keys = matches!(key_type, TypeDescriptor::String { .. });
    let key_type = &element_type(key_type, ownership);
    let value_type = &element_type(value_type, ownership);
    // SAFETY: fresh table, filled with payloads that outlive it
    let table = unsafe { glib.hash_table_new(string_keys)? };
    let unref = glib.destructor("g_hash_table_unref")?;
    release_container(frame, ownership, table as usize, unref);

    for (i, (key, value)) in pairs.iter().enumerate() {
        let k = value_to_payload(engine, key_type, key, frame)
            .map_err(|e| e.with_context(format!("key {}", i)))?;
        let v = value_to_payload(engine, value_type, value, frame)
            .map_err(|e| e.with_context(format!("value {}", i)))?;
        unsafe { glib.hash_table_insert(table, k as *mut c_void, v as *mut c_void)? };
    }
    Ok(table as usize)
}

/// Convert a GHashTable into a `Map` value
///
/// Keys and values are copied out as borrowed: the table's own destroy
/// functions own them.
pub(crate) fn hash_from_native(
    engine: &Engine,
    key_type: &TypeDescriptor,
    value_type: &TypeDescriptor,
    ownership: Ownership,
    nullable: bool,
    address: usize,
) -> Result<Value> {
    if address == 0 {
        return Ok(if nullable { Value::Null } else { Value::Map(Vec::new()) });
    }

    let glib = Glib::new(&engine.config);
    let key_type = key_type.with_ownership(Ownership::Borrowed);
    let value_type = value_type.with_ownership(Ownership::Borrowed);

    // SAFETY: descriptor says this is a GHashTable
    let entries = unsafe { glib.hash_table_entries(address as *mut c_void)? };
    let pairs: Result<Vec<_>> = entries
        .into_iter()
        .map(|(k, v)| {
            Ok((
                payload_to_value(engine, &key_type, k)?,
                payload_to_value(engine, &value_type, v)?,
            ))
        })
        .collect();

    if ownership.is_owned() {
        unsafe { glib.hash_table_unref(address as *mut c_void)? };
    }
    Ok(Value::Map(pairs?))
}
