//! Native slot representation
//!
//! A slot is one C ABI argument or return register: a scalar or a
//! pointer. Every descriptor lowers to zero or more slots.

use libffi::middle::Type;
use std::os::raw::c_void;

/// ABI type of a single native slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotType {
    Void,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Pointer,
    /// `size_t`
    Size,
}

impl SlotType {
    /// Get size of type in bytes
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Void => 0,
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Pointer | Self::Size => core::mem::size_of::<usize>(),
        }
    }

    /// Get alignment requirement
    #[inline]
    pub const fn align(self) -> usize {
        self.size()
    }

    /// Check if type is integral
    #[inline]
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::U8 | Self::U16 | Self::U32
                | Self::U64 | Self::Size
        )
    }

    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    /// Check if type is floating point
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Inclusive integer range representable by this slot
    pub const fn int_range(self) -> (i128, i128) {
        match self {
            Self::I8 => (i8::MIN as i128, i8::MAX as i128),
            Self::I16 => (i16::MIN as i128, i16::MAX as i128),
            Self::I32 => (i32::MIN as i128, i32::MAX as i128),
            Self::I64 => (i64::MIN as i128, i64::MAX as i128),
            Self::U8 => (0, u8::MAX as i128),
            Self::U16 => (0, u16::MAX as i128),
            Self::U32 => (0, u32::MAX as i128),
            Self::U64 => (0, u64::MAX as i128),
            Self::Pointer | Self::Size => (0, usize::MAX as i128),
            Self::Void | Self::F32 | Self::F64 => (0, 0),
        }
    }

    /// libffi type for call interface construction
    pub fn ffi_type(self) -> Type {
        match self {
            Self::Void => Type::void(),
            Self::I8 => Type::i8(),
            Self::I16 => Type::i16(),
            Self::I32 => Type::i32(),
            Self::I64 => Type::i64(),
            Self::U8 => Type::u8(),
            Self::U16 => Type::u16(),
            Self::U32 => Type::u32(),
            Self::U64 => Type::u64(),
            Self::F32 => Type::f32(),
            Self::F64 => Type::f64(),
            Self::Pointer => Type::pointer(),
            Self::Size => Type::usize(),
        }
    }
}

/// Storage for one native slot (untagged union)
///
/// Every field starts at offset 0, so a pointer to the slot is a valid
/// pointer to whichever field was written last.
#[repr(C)]
pub union NativeSlot {
    pub i8: i8,
    pub i16: i16,
    pub i32: i32,
    pub i64: i64,
    pub u8: u8,
    pub u16: u16,
    pub u32: u32,
    pub u64: u64,
    pub f32: f32,
    pub f64: f64,
    pub ptr: *mut c_void,
    pub size: usize,
}

impl NativeSlot {
    /// All-zero slot (NULL, 0, 0.0, FALSE)
    #[inline]
    pub const fn zeroed() -> Self {
        Self { u64: 0 }
    }

    #[inline]
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        let mut slot = Self::zeroed();
        slot.ptr = ptr;
        slot
    }

    #[inline]
    pub fn from_address(address: usize) -> Self {
        Self::from_ptr(address as *mut c_void)
    }

    /// Store an integer already range-checked against `ty`
    pub fn from_int(ty: SlotType, value: i128) -> Self {
        let mut slot = Self::zeroed();
        match ty {
            SlotType::I8 => slot.i8 = value as i8,
            SlotType::I16 => slot.i16 = value as i16,
            SlotType::I32 => slot.i32 = value as i32,
            SlotType::I64 => slot.i64 = value as i64,
            SlotType::U8 => slot.u8 = value as u8,
            SlotType::U16 => slot.u16 = value as u16,
            SlotType::U32 => slot.u32 = value as u32,
            SlotType::U64 => slot.u64 = value as u64,
            SlotType::Pointer | SlotType::Size => slot.size = value as usize,
            SlotType::F32 => slot.f32 = value as f32,
            SlotType::F64 => slot.f64 = value as f64,
            SlotType::Void => {}
        }
        slot
    }

    pub fn from_float(ty: SlotType, value: f64) -> Self {
        let mut slot = Self::zeroed();
        match ty {
            SlotType::F32 => slot.f32 = value as f32,
            _ => slot.f64 = value,
        }
        slot
    }

    /// Read the slot as an integer of type `ty`
    pub fn int_value(&self, ty: SlotType) -> i128 {
        // SAFETY: every bit pattern is a valid integer
        unsafe {
            match ty {
                SlotType::I8 => self.i8 as i128,
                SlotType::I16 => self.i16 as i128,
                SlotType::I32 => self.i32 as i128,
                SlotType::I64 => self.i64 as i128,
                SlotType::U8 => self.u8 as i128,
                SlotType::U16 => self.u16 as i128,
                SlotType::U32 => self.u32 as i128,
                SlotType::U64 => self.u64 as i128,
                SlotType::Pointer | SlotType::Size => self.size as i128,
                SlotType::F32 => self.f32 as i128,
                SlotType::F64 => self.f64 as i128,
                SlotType::Void => 0,
            }
        }
    }

    pub fn float_value(&self, ty: SlotType) -> f64 {
        // SAFETY: every bit pattern is a valid float
        unsafe {
            match ty {
                SlotType::F32 => self.f32 as f64,
                _ => self.f64,
            }
        }
    }

    #[inline]
    pub fn address(&self) -> usize {
        // SAFETY: every bit pattern is a valid usize
        unsafe { self.size }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        self.address() as *mut c_void
    }

    /// Load a slot of type `ty` from raw memory
    ///
    /// # Safety
    /// `src` must be valid for reads of `ty.size()` bytes
    pub unsafe fn load(ty: SlotType, src: *const u8) -> Self {
        let mut slot = Self::zeroed();
        core::ptr::copy_nonoverlapping(src, &mut slot as *mut Self as *mut u8, ty.size());
        slot
    }

    /// Store this slot's `ty`-sized contents into raw memory
    ///
    /// # Safety
    /// `dst` must be valid for writes of `ty.size()` bytes
    pub unsafe fn store(&self, ty: SlotType, dst: *mut u8) {
        core::ptr::copy_nonoverlapping(self as *const Self as *const u8, dst, ty.size());
    }
}

impl Default for NativeSlot {
    #[inline]
    fn default() -> Self {
        Self::zeroed()
    }
}

// Manual implementations for Copy, Clone, and Debug since union doesn't auto-derive
impl Copy for NativeSlot {}
impl Clone for NativeSlot {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl core::fmt::Debug for NativeSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NativeSlot({:#018x})", unsafe { self.u64 })
    }
}
