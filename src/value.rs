//! Managed values exchanged with the dispatcher

use crate::descriptor::TypeDescriptor;
use crate::errors::{EngineError, Result};
use crate::ownership::{BoxedHandle, ObjectHandle};
use once_cell::unsync::OnceCell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A managed value
///
/// `Object`, `Boxed`, `Ref` and `Callback` compare by identity.
#[derive(Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    String(String),
    /// Raw native address
    Pointer(usize),
    Object(ObjectHandle),
    Boxed(BoxedHandle),
    Array(Vec<Value>),
    /// Insertion-ordered key/value pairs
    Map(Vec<(Value, Value)>),
    Ref(ReferenceCell),
    Callback(Callable),
}

impl Value {
    /// Short kind name used in marshal errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Pointer(_) => "pointer",
            Self::Object(_) => "object",
            Self::Boxed(_) => "boxed",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Ref(_) => "reference",
            Self::Callback(_) => "callback",
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Native address of pointer-like values
    pub fn address(&self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::Pointer(address) => Some(*address),
            Self::Object(object) => Some(object.address()),
            Self::Boxed(boxed) => Some(boxed.address()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i128> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(*b as i128),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_boxed(&self) -> Option<&BoxedHandle> {
        match self {
            Self::Boxed(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Self::Map(pairs) => Some(pairs),
            _ => None,
        }
    }

    pub fn as_ref_cell(&self) -> Option<&ReferenceCell> {
        match self {
            Self::Ref(cell) => Some(cell),
            _ => None,
        }
    }

    /// Render for error messages without dumping whole containers
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) if s.len() <= 32 => format!("{:?}", s),
            Self::String(s) => format!("string of {} bytes", s.len()),
            Self::Pointer(p) => format!("pointer {:#x}", p),
            Self::Array(items) => format!("array of {}", items.len()),
            Self::Map(pairs) => format!("map of {}", pairs.len()),
            other => other.kind().to_string(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({})", b),
            Self::Int(i) => write!(f, "Int({})", i),
            Self::Float(x) => write!(f, "Float({})", x),
            Self::String(s) => write!(f, "String({:?})", s),
            Self::Pointer(p) => write!(f, "Pointer({:#x})", p),
            Self::Object(o) => write!(f, "{:?}", o),
            Self::Boxed(b) => write!(f, "{:?}", b),
            Self::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Self::Map(pairs) => f.debug_tuple("Map").field(pairs).finish(),
            Self::Ref(cell) => write!(f, "Ref({:?})", cell.get()),
            Self::Callback(_) => write!(f, "Callback"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

macro_rules! int_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(i: $t) -> Self {
                Self::Int(i as i128)
            }
        })*
    };
}

int_from!(i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Self::Float(f as f64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<ObjectHandle> for Value {
    fn from(o: ObjectHandle) -> Self {
        Self::Object(o)
    }
}

impl From<BoxedHandle> for Value {
    fn from(b: BoxedHandle) -> Self {
        Self::Boxed(b)
    }
}

impl From<ReferenceCell> for Value {
    fn from(cell: ReferenceCell) -> Self {
        Self::Ref(cell)
    }
}

impl From<Callable> for Value {
    fn from(c: Callable) -> Self {
        Self::Callback(c)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

/// A managed function native code may call back into
#[derive(Clone)]
pub struct Callable(Rc<dyn Fn(&[Value]) -> Value>);

impl Callable {
    pub fn new(f: impl Fn(&[Value]) -> Value + 'static) -> Self {
        Self(Rc::new(f))
    }

    #[inline]
    pub fn invoke(&self, args: &[Value]) -> Value {
        (self.0)(args)
    }

    /// Stable identity of the underlying closure
    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Trampoline registrations currently holding this callable
    pub fn registrations(&self) -> Vec<crate::trampoline::RegistrationId> {
        crate::trampoline::registrations_of(self)
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable({:#x})", self.identity())
    }
}

/// Out/in-out parameter box
///
/// The declared inner type is fixed by the first call that uses the cell;
/// a later call declaring a different type is rejected.
#[derive(Clone)]
pub struct ReferenceCell {
    value: Rc<RefCell<Value>>,
    declared: Rc<OnceCell<TypeDescriptor>>,
}

impl ReferenceCell {
    pub fn new(initial: Value) -> Self {
        Self {
            value: Rc::new(RefCell::new(initial)),
            declared: Rc::new(OnceCell::new()),
        }
    }

    /// Cell whose inner type is fixed up front
    pub fn typed(initial: Value, inner: TypeDescriptor) -> Self {
        let cell = Self::new(initial);
        let _ = cell.declared.set(inner);
        cell
    }

    pub fn get(&self) -> Value {
        self.value.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        *self.value.borrow_mut() = value;
    }

    /// Take the value, leaving `Null`
    pub fn take(&self) -> Value {
        std::mem::take(&mut *self.value.borrow_mut())
    }

    pub fn declared_type(&self) -> Option<&TypeDescriptor> {
        self.declared.get()
    }

    /// Fix the inner type, or check it against the one already fixed
    pub(crate) fn declare(&self, inner: &TypeDescriptor) -> Result<()> {
        let fixed = self.declared.get_or_init(|| inner.clone());
        if fixed != inner {
            return Err(EngineError::marshal(
                format!("Reference<{}>", inner),
                format!("reference cell declared as {}", fixed),
            ));
        }
        Ok(())
    }
}

impl PartialEq for ReferenceCell {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for ReferenceCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceCell")
            .field("value", &*self.value.borrow())
            .field("declared", &self.declared.get())
            .finish()
    }
}

/// Create an out-parameter box holding `initial`
pub fn create_ref(initial: impl Into<Value>) -> ReferenceCell {
    ReferenceCell::new(initial.into())
}
