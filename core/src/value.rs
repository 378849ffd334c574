//! Value categories, identifiers, and raw slot encodings.
//!
//! The operand stack and locals are arrays of untyped 64-bit words; the
//! bytecode stream is the only source of type information. `JValue` exists
//! solely at the embedder boundary (method arguments and results).

use std::num::NonZeroU32;

/// Reference to a heap object: the arena word index of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) NonZeroU32);

impl ObjRef {
    pub(crate) fn from_index(idx: usize) -> ObjRef {
        ObjRef(NonZeroU32::new(idx as u32).expect("object at arena index 0"))
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0.get() as usize
    }

    /// Raw slot bits; null is encoded as 0.
    #[inline]
    pub fn bits(opt: Option<ObjRef>) -> u64 {
        match opt {
            Some(r) => r.0.get() as u64,
            None => 0,
        }
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Option<ObjRef> {
        NonZeroU32::new(bits as u32).map(ObjRef)
    }
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

id_type!(
    /// Index into the registry's klass table.
    KlassId
);
id_type!(
    /// Index into the registry's method table.
    MethodId
);
id_type!(
    /// Index into the registry's constant-pool table.
    PoolId
);

/// Basic (declared) type of a field, array element, or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
    Object,
    Void,
}

impl BasicType {
    /// Decode a `newarray` type operand.
    pub fn from_newarray_code(code: u8) -> Option<BasicType> {
        Some(match code {
            4 => BasicType::Boolean,
            5 => BasicType::Char,
            6 => BasicType::Float,
            7 => BasicType::Double,
            8 => BasicType::Byte,
            9 => BasicType::Short,
            10 => BasicType::Int,
            11 => BasicType::Long,
            _ => return None,
        })
    }

    /// Operand-stack slots a value of this type occupies.
    pub fn slots(self) -> usize {
        match self {
            BasicType::Long | BasicType::Double => 2,
            BasicType::Void => 0,
            _ => 1,
        }
    }

    pub fn tos(self) -> TosState {
        match self {
            BasicType::Boolean => TosState::Ztos,
            BasicType::Char => TosState::Ctos,
            BasicType::Float => TosState::Ftos,
            BasicType::Double => TosState::Dtos,
            BasicType::Byte => TosState::Btos,
            BasicType::Short => TosState::Stos,
            BasicType::Int => TosState::Itos,
            BasicType::Long => TosState::Ltos,
            BasicType::Object => TosState::Atos,
            BasicType::Void => TosState::Vtos,
        }
    }
}

/// Top-of-stack value category. Encoded in constant-pool-cache flags and
/// used to pick load/store width and push/pop convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TosState {
    Btos = 0,
    Ztos = 1,
    Ctos = 2,
    Stos = 3,
    Itos = 4,
    Ltos = 5,
    Ftos = 6,
    Dtos = 7,
    Atos = 8,
    Vtos = 9,
}

impl TosState {
    pub fn from_raw(raw: u8) -> Option<TosState> {
        Some(match raw {
            0 => TosState::Btos,
            1 => TosState::Ztos,
            2 => TosState::Ctos,
            3 => TosState::Stos,
            4 => TosState::Itos,
            5 => TosState::Ltos,
            6 => TosState::Ftos,
            7 => TosState::Dtos,
            8 => TosState::Atos,
            9 => TosState::Vtos,
            _ => return None,
        })
    }

    pub fn is_category2(self) -> bool {
        matches!(self, TosState::Ltos | TosState::Dtos)
    }
}

/// Typed value at the embedder boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Obj(Option<ObjRef>),
}

impl JValue {
    pub fn slots(&self) -> usize {
        match self {
            JValue::Long(_) | JValue::Double(_) => 2,
            _ => 1,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            JValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            JValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<Option<ObjRef>> {
        match self {
            JValue::Obj(v) => Some(*v),
            _ => None,
        }
    }
}

// Slot bit encodings. Category-1 values occupy the low half of a word;
// category-2 values occupy a full word with a filler slot alongside.

#[inline]
pub fn int_bits(v: i32) -> u64 {
    v as u32 as u64
}

#[inline]
pub fn bits_int(bits: u64) -> i32 {
    bits as u32 as i32
}

#[inline]
pub fn long_bits(v: i64) -> u64 {
    v as u64
}

#[inline]
pub fn bits_long(bits: u64) -> i64 {
    bits as i64
}

#[inline]
pub fn float_bits(v: f32) -> u64 {
    v.to_bits() as u64
}

#[inline]
pub fn bits_float(bits: u64) -> f32 {
    f32::from_bits(bits as u32)
}

#[inline]
pub fn double_bits(v: f64) -> u64 {
    v.to_bits()
}

#[inline]
pub fn bits_double(bits: u64) -> f64 {
    f64::from_bits(bits)
}
