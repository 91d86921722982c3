use std::fmt;

/// Value types. Pointers are opaque: what a pointer points to is the job
/// of the type analysis oracle, not of the type itself.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Type {
    F32,
    F64,
    I1,
    I32,
    I64,
    Ptr,
    F64x2,
    F64x4,
}

impl Type {
    pub fn is_float(self) -> bool {
        matches!(self, Type::F32 | Type::F64 | Type::F64x2 | Type::F64x4)
    }

    pub fn is_int(self) -> bool {
        matches!(self, Type::I1 | Type::I32 | Type::I64)
    }

    pub fn is_ptr(self) -> bool {
        self == Type::Ptr
    }

    pub fn is_vector(self) -> bool {
        matches!(self, Type::F64x2 | Type::F64x4)
    }

    /// The type of a single lane. Scalars are their own lane type.
    pub fn lane_ty(self) -> Type {
        match self {
            Type::F64x2 | Type::F64x4 => Type::F64,
            other => other,
        }
    }

    pub fn lanes(self) -> u8 {
        match self {
            Type::F64x2 => 2,
            Type::F64x4 => 4,
            _ => 1,
        }
    }

    /// Size of a stored value of this type in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Type::I1 => 1,
            Type::F32 | Type::I32 => 4,
            Type::F64 | Type::I64 | Type::Ptr => 8,
            Type::F64x2 => 16,
            Type::F64x4 => 32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::F32 => "f32",
            Type::F64 => "f64",
            Type::I1 => "i1",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::Ptr => "ptr",
            Type::F64x2 => "f64x2",
            Type::F64x4 => "f64x4",
        }
    }

    pub fn from_name(name: &str) -> Option<Type> {
        let ty = match name {
            "f32" => Type::F32,
            "f64" => Type::F64,
            "i1" => Type::I1,
            "i32" => Type::I32,
            "i64" => Type::I64,
            "ptr" => Type::Ptr,
            "f64x2" => Type::F64x2,
            "f64x4" => Type::F64x4,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
