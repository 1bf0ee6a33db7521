//! Type descriptors - how to marshal one native slot group
//!
//! Design: a closed sum type, matched exhaustively by the dispatcher.
//! Descriptors are pure data; the serde representation is the wire
//! format shared with every descriptor-producing caller.

use crate::errors::{EngineError, Result};
use crate::interop::SlotType;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::fmt;


/// Who releases the native resource after the boundary crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Ownership {
    /// Native code keeps ownership; the managed side must not release
    #[default]
    Borrowed,
    /// The receiving side is responsible for the release
    Owned,
}

impl Ownership {
    #[inline]
    pub const fn is_owned(self) -> bool {
        matches!(self, Self::Owned)
    }
}

/// Integer width in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    pub const fn bits(self) -> u8 {
        match self {
            Self::W8 => 8,
            Self::W16 => 16,
            Self::W32 => 32,
            Self::W64 => 64,
        }
    }
}

impl TryFrom<u8> for IntWidth {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, String> {
        match bits {
            8 => Ok(Self::W8),
            16 => Ok(Self::W16),
            32 => Ok(Self::W32),
            64 => Ok(Self::W64),
            other => Err(format!("unsupported integer width {}", other)),
        }
    }
}

impl From<IntWidth> for u8 {
    fn from(width: IntWidth) -> u8 {
        width.bits()
    }
}

/// Float width in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FloatWidth {
    F32,
    F64,
}

impl TryFrom<u8> for FloatWidth {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, String> {
        match bits {
            32 => Ok(Self::F32),
            64 => Ok(Self::F64),
            other => Err(format!("unsupported float width {}", other)),
        }
    }
}

impl From<FloatWidth> for u8 {
    fn from(width: FloatWidth) -> u8 {
        match width {
            FloatWidth::F32 => 32,
            FloatWidth::F64 => 64,
        }
    }
}

/// Native container shape for `Array` descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ContainerKind {
    /// Zero-terminated C array
    FlatArray,
    /// GSList
    SinglyLinkedList,
    /// GList
    DoublyLinkedList,
    /// GPtrArray (`pdata` + `len` header)
    PointerArray,
    /// C array plus a separate `size_t` length
    SizedArray {
        /// Index of the `Reference<Integer>` argument holding the length
        /// of a returned array
        #[serde(default, rename = "lengthArg")]
        length_arg: Option<usize>,
    },
    /// C array of a compile-time length
    FixedArray { length: usize },
}

impl ContainerKind {
    /// Elements stored as `gpointer` payloads
    pub const fn pointer_payload(self) -> bool {
        matches!(
            self,
            Self::SinglyLinkedList | Self::DoublyLinkedList | Self::PointerArray
        )
    }
}

/// Native callback ABI family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrampolineKind {
    Closure,
    Destroy,
    Source,
    Draw,
    AsyncReady,
    Shortcut,
    /// Call-scoped in practice, but stays registered until `unregister` or stop
    Compare,
    Tick,
    TreeModelCreate,
}

/// Destroy-notify slot installed next to a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroySlot {
    None,
    /// `void (*)(gpointer data)`
    DestroyNotify,
    /// `void (*)(gpointer data, GClosure *closure)`
    ClosureNotify,
}

/// Return value a trampoline kind hands back to native code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    Void,
    Boolean,
    Int32,
    Object,
    /// Whatever the descriptor declares
    Declared,
}

/// Fixed ABI contract of a trampoline kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampolineShape {
    /// Managed-visible argument count; `None` means per-connection
    pub arity: Option<usize>,
    /// Native function receives a trailing `gpointer user_data`
    pub user_data_param: bool,
    /// Caller passes a user data slot after the code pointer
    pub user_data_slot: bool,
    pub destroy: DestroySlot,
    pub returns: ReturnShape,
    /// Released after its first invocation
    pub one_shot: bool,
}

impl TrampolineKind {
    pub const fn shape(self) -> TrampolineShape {
        const fn shape(
            arity: Option<usize>,
            user_data_slot: bool,
            destroy: DestroySlot,
            returns: ReturnShape,
            one_shot: bool,
        ) -> TrampolineShape {
            TrampolineShape {
                arity,
                user_data_param: true,
                user_data_slot,
                destroy,
                returns,
                one_shot,
            }
        }

        match self {
            Self::Closure => shape(None, true, DestroySlot::ClosureNotify, ReturnShape::Declared, false),
            Self::Destroy => shape(Some(0), false, DestroySlot::None, ReturnShape::Void, true),
            Self::Source => shape(Some(0), true, DestroySlot::DestroyNotify, ReturnShape::Boolean, false),
            Self::Draw => shape(Some(4), true, DestroySlot::DestroyNotify, ReturnShape::Void, false),
            Self::AsyncReady => shape(Some(2), true, DestroySlot::None, ReturnShape::Void, true),
            Self::Shortcut => shape(Some(2), true, DestroySlot::DestroyNotify, ReturnShape::Boolean, false),
            Self::Compare => shape(Some(2), true, DestroySlot::None, ReturnShape::Int32, false),
            Self::Tick => shape(Some(2), true, DestroySlot::DestroyNotify, ReturnShape::Boolean, false),
            Self::TreeModelCreate => {
                shape(Some(1), true, DestroySlot::DestroyNotify, ReturnShape::Object, false)
            }
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Closure => "closure",
            Self::Destroy => "destroy",
            Self::Source => "source",
            Self::Draw => "draw",
            Self::AsyncReady => "async-ready",
            Self::Shortcut => "shortcut",
            Self::Compare => "compare",
            Self::Tick => "tick",
            Self::TreeModelCreate => "tree-model-create",
        }
    }
}

/// How to marshal one value across the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TypeDescriptor {
    Integer {
        size: IntWidth,
        signed: bool,
    },
    Float {
        size: FloatWidth,
    },
    /// GLib `gboolean` (32-bit int)
    Boolean,
    String {
        #[serde(default)]
        ownership: Ownership,
    },
    /// Reference-counted native object
    Object {
        #[serde(default)]
        ownership: Ownership,
    },
    /// Opaque native struct identified by name and owning library
    Boxed {
        #[serde(default)]
        ownership: Ownership,
        #[serde(rename = "typeName")]
        type_name: String,
        library: String,
    },
    Array {
        #[serde(rename = "itemType")]
        item_type: Box<TypeDescriptor>,
        #[serde(rename = "containerKind")]
        container_kind: ContainerKind,
        #[serde(default)]
        ownership: Ownership,
        #[serde(default)]
        nullable: bool,
    },
    HashTable {
        #[serde(rename = "keyType")]
        key_type: Box<TypeDescriptor>,
        #[serde(rename = "valueType")]
        value_type: Box<TypeDescriptor>,
        #[serde(default)]
        ownership: Ownership,
        #[serde(default)]
        nullable: bool,
    },
    /// Out or in/out parameter
    Reference {
        #[serde(rename = "innerType")]
        inner_type: Box<TypeDescriptor>,
    },
    Callback {
        #[serde(rename = "trampolineKind")]
        trampoline_kind: TrampolineKind,
        #[serde(default, rename = "argTypes")]
        arg_types: Vec<TypeDescriptor>,
        #[serde(rename = "returnType")]
        return_type: Box<TypeDescriptor>,
    },
    Null,
    Void,
}

impl TypeDescriptor {
    pub fn int(bits: IntWidth, signed: bool) -> Self {
        Self::Integer { size: bits, signed }
    }

    pub fn i32() -> Self {
        Self::int(IntWidth::W32, true)
    }

    pub fn u32() -> Self {
        Self::int(IntWidth::W32, false)
    }

    pub fn i64() -> Self {
        Self::int(IntWidth::W64, true)
    }

    pub fn u64() -> Self {
        Self::int(IntWidth::W64, false)
    }

    pub fn f32() -> Self {
        Self::Float { size: FloatWidth::F32 }
    }

    pub fn f64() -> Self {
        Self::Float { size: FloatWidth::F64 }
    }

    pub fn string(ownership: Ownership) -> Self {
        Self::String { ownership }
    }

    pub fn object(ownership: Ownership) -> Self {
        Self::Object { ownership }
    }

    pub fn boxed(ownership: Ownership, type_name: &str, library: &str) -> Self {
        Self::Boxed {
            ownership,
            type_name: type_name.to_string(),
            library: library.to_string(),
        }
    }

    pub fn array(item: TypeDescriptor, kind: ContainerKind, ownership: Ownership) -> Self {
        Self::Array {
            item_type: Box::new(item),
            container_kind: kind,
            ownership,
            nullable: false,
        }
    }

    pub fn hash_table(key: TypeDescriptor, value: TypeDescriptor, ownership: Ownership) -> Self {
        Self::HashTable {
            key_type: Box::new(key),
            value_type: Box::new(value),
            ownership,
            nullable: false,
        }
    }

    pub fn reference(inner: TypeDescriptor) -> Self {
        Self::Reference {
            inner_type: Box::new(inner),
        }
    }

    pub fn callback(kind: TrampolineKind, args: Vec<TypeDescriptor>, ret: TypeDescriptor) -> Self {
        Self::Callback {
            trampoline_kind: kind,
            arg_types: args,
            return_type: Box::new(ret),
        }
    }

    /// Mark a container descriptor as allowed to unmarshal to `Null`
    pub fn nullable(mut self) -> Self {
        if let Self::Array { nullable, .. } | Self::HashTable { nullable, .. } = &mut self {
            *nullable = true;
        }
        self
    }

    /// Ownership tag, for the variants that carry one
    pub fn ownership(&self) -> Option<Ownership> {
        match self {
            Self::String { ownership }
            | Self::Object { ownership }
            | Self::Boxed { ownership, .. }
            | Self::Array { ownership, .. }
            | Self::HashTable { ownership, .. } => Some(*ownership),
            _ => None,
        }
    }

    /// Same descriptor with the top-level ownership tag replaced
    pub fn with_ownership(&self, new: Ownership) -> Self {
        let mut ty = self.clone();
        if let Self::String { ownership }
        | Self::Object { ownership }
        | Self::Boxed { ownership, .. }
        | Self::Array { ownership, .. }
        | Self::HashTable { ownership, .. } = &mut ty
        {
            *ownership = new;
        }
        ty
    }

    /// Slot type of a value that fits in a single slot
    ///
    /// Pointer-like descriptors (strings, objects, containers, ...) all
    /// lower to `Pointer`.
    pub fn value_slot(&self) -> SlotType {
        match self {
            Self::Integer { size, signed } => match (size, signed) {
                (IntWidth::W8, true) => SlotType::I8,
                (IntWidth::W16, true) => SlotType::I16,
                (IntWidth::W32, true) => SlotType::I32,
                (IntWidth::W64, true) => SlotType::I64,
                (IntWidth::W8, false) => SlotType::U8,
                (IntWidth::W16, false) => SlotType::U16,
                (IntWidth::W32, false) => SlotType::U32,
                (IntWidth::W64, false) => SlotType::U64,
            },
            Self::Float { size: FloatWidth::F32 } => SlotType::F32,
            Self::Float { size: FloatWidth::F64 } => SlotType::F64,
            Self::Boolean => SlotType::I32,
            Self::Void => SlotType::Void,
            _ => SlotType::Pointer,
        }
    }

    /// Bytes this value occupies when stored in native memory
    pub fn native_size(&self) -> usize {
        self.value_slot().size()
    }

    /// Native argument slots this descriptor occupies in a call
    pub fn slot_types(&self) -> SmallVec<[SlotType; 3]> {
        match self {
            Self::Void => SmallVec::new(),
            Self::Array {
                container_kind: ContainerKind::SizedArray { .. },
                ..
            } => smallvec![SlotType::Pointer, SlotType::Size],
            Self::Callback { trampoline_kind, .. } => {
                let shape = trampoline_kind.shape();
                let mut slots = smallvec![SlotType::Pointer];
                if shape.user_data_slot {
                    slots.push(SlotType::Pointer);
                }
                if shape.destroy != DestroySlot::None {
                    slots.push(SlotType::Pointer);
                }
                slots
            }
            other => smallvec![other.value_slot()],
        }
    }

    /// How many native ABI argument slots a value occupies
    pub fn slot_count(&self) -> usize {
        self.slot_types().len()
    }

    /// Descriptor may be stored as a list/pointer-array/hash payload
    fn is_pointer_payload(&self) -> bool {
        !matches!(
            self,
            Self::Float { .. } | Self::Void | Self::Null | Self::Reference { .. } | Self::Callback { .. }
        )
    }

    /// Structural validation, recursive
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Integer { .. }
            | Self::Float { .. }
            | Self::Boolean
            | Self::String { .. }
            | Self::Object { .. }
            | Self::Null
            | Self::Void => Ok(()),
            Self::Boxed { type_name, library, .. } => {
                if type_name.is_empty() {
                    return Err(EngineError::invalid_descriptor("Boxed without a type name"));
                }
                if library.is_empty() {
                    return Err(EngineError::invalid_descriptor(format!(
                        "Boxed {} without an owning library",
                        type_name
                    )));
                }
                Ok(())
            }
            Self::Array {
                item_type,
                container_kind,
                ..
            } => {
                if matches!(
                    **item_type,
                    Self::Void | Self::Null | Self::Reference { .. } | Self::Callback { .. }
                ) {
                    return Err(EngineError::invalid_descriptor(format!(
                        "Array item type {} cannot be stored in a container",
                        item_type
                    )));
                }
                if container_kind.pointer_payload() && !item_type.is_pointer_payload() {
                    return Err(EngineError::invalid_descriptor(format!(
                        "{} does not fit a pointer-sized container payload",
                        item_type
                    )));
                }
                item_type.validate()
            }
            Self::HashTable {
                key_type,
                value_type,
                ..
            } => {
                for part in [key_type, value_type] {
                    if !part.is_pointer_payload() {
                        return Err(EngineError::invalid_descriptor(format!(
                            "{} cannot be a hash table key or value",
                            part
                        )));
                    }
                    part.validate()?;
                }
                Ok(())
            }
            Self::Reference { inner_type } => match **inner_type {
                Self::Void | Self::Null | Self::Reference { .. } | Self::Callback { .. } => {
                    Err(EngineError::invalid_descriptor(format!(
                        "Reference to {} has no storable value",
                        inner_type
                    )))
                }
                _ => inner_type.validate(),
            },
            Self::Callback {
                trampoline_kind,
                arg_types,
                return_type,
            } => validate_callback(*trampoline_kind, arg_types, return_type),
        }
    }

    /// Validation for a descriptor used in argument position
    pub fn validate_argument(&self) -> Result<()> {
        if matches!(self, Self::Void) {
            return Err(EngineError::invalid_descriptor("Void is not a valid argument type"));
        }
        self.validate()
    }

    /// Validation for a descriptor used in return/out/callback-argument position
    pub fn validate_return(&self) -> Result<()> {
        match self {
            Self::Reference { .. } => Err(EngineError::invalid_descriptor(
                "Reference is only valid in argument position",
            )),
            Self::Callback { .. } => Err(EngineError::invalid_descriptor(
                "Callback cannot be unmarshaled from native code",
            )),
            _ => self.validate(),
        }
    }
}

fn validate_callback(
    kind: TrampolineKind,
    arg_types: &[TypeDescriptor],
    return_type: &TypeDescriptor,
) -> Result<()> {
    let shape = kind.shape();
    if let Some(arity) = shape.arity {
        if arg_types.len() != arity {
            return Err(EngineError::invalid_descriptor(format!(
                "{} callbacks take {} arguments, descriptor declares {}",
                kind.name(),
                arity,
                arg_types.len()
            )));
        }
    }

    for arg in arg_types {
        if matches!(arg, TypeDescriptor::Void) {
            return Err(EngineError::invalid_descriptor("Void callback argument"));
        }
        if let TypeDescriptor::Array {
            container_kind: ContainerKind::SizedArray { .. },
            ..
        } = arg
        {
            return Err(EngineError::invalid_descriptor(
                "sized arrays cannot be callback arguments",
            ));
        }
        arg.validate_return()?;
    }

    let ok = match shape.returns {
        ReturnShape::Void => matches!(return_type, TypeDescriptor::Void),
        ReturnShape::Boolean => matches!(return_type, TypeDescriptor::Boolean),
        ReturnShape::Int32 => matches!(
            return_type,
            TypeDescriptor::Integer {
                size: IntWidth::W32,
                signed: true
            }
        ),
        ReturnShape::Object => matches!(return_type, TypeDescriptor::Object { .. }),
        ReturnShape::Declared => true,
    };
    if !ok {
        return Err(EngineError::invalid_descriptor(format!(
            "{} callbacks cannot return {}",
            kind.name(),
            return_type
        )));
    }

    if matches!(
        return_type,
        TypeDescriptor::Array { .. } | TypeDescriptor::HashTable { .. }
    ) {
        return Err(EngineError::invalid_descriptor(
            "callbacks cannot return containers",
        ));
    }
    return_type.validate_return()
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer { size, signed } => write!(
                f,
                "Integer({}, {})",
                size.bits(),
                if *signed { "signed" } else { "unsigned" }
            ),
            Self::Float { size } => write!(f, "Float({})", u8::from(*size)),
            Self::Boolean => write!(f, "Boolean"),
            Self::String { ownership } => write!(f, "String({:?})", ownership),
            Self::Object { ownership } => write!(f, "Object({:?})", ownership),
            Self::Boxed { ownership, type_name, .. } => {
                write!(f, "Boxed({}, {:?})", type_name, ownership)
            }
            Self::Array { item_type, container_kind, .. } => {
                write!(f, "Array<{}>({:?})", item_type, container_kind)
            }
            Self::HashTable { key_type, value_type, .. } => {
                write!(f, "HashTable<{}, {}>", key_type, value_type)
            }
            Self::Reference { inner_type } => write!(f, "Reference<{}>", inner_type),
            Self::Callback { trampoline_kind, .. } => {
                write!(f, "Callback({})", trampoline_kind.name())
            }
            Self::Null => write!(f, "Null"),
            Self::Void => write!(f, "Void"),
        }
    }
}
