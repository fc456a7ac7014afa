use std::fmt::Display;

/// Element type of a [`TensorType`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ElementType {
    Boolean,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    BF16,
    F16,
    F32,
    F64,
}

impl Display for ElementType {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Boolean => write!(formatter, "i1"),
            Self::I8 => write!(formatter, "i8"),
            Self::I16 => write!(formatter, "i16"),
            Self::I32 => write!(formatter, "i32"),
            Self::I64 => write!(formatter, "i64"),
            Self::U8 => write!(formatter, "ui8"),
            Self::U16 => write!(formatter, "ui16"),
            Self::U32 => write!(formatter, "ui32"),
            Self::U64 => write!(formatter, "ui64"),
            Self::BF16 => write!(formatter, "bf16"),
            Self::F16 => write!(formatter, "f16"),
            Self::F32 => write!(formatter, "f32"),
            Self::F64 => write!(formatter, "f64"),
        }
    }
}

/// Statically-shaped, ranked tensor type (rendered as `tensor<8x16xf32>`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TensorType {
    shape: Vec<usize>,
    element_type: ElementType,
}

impl TensorType {
    /// Creates a new [`TensorType`].
    pub fn new<S: Into<Vec<usize>>>(shape: S, element_type: ElementType) -> Self {
        Self { shape: shape.into(), element_type }
    }

    /// Returns the shape of this tensor type.
    pub fn shape(&self) -> &[usize] {
        self.shape.as_slice()
    }

    /// Returns the rank of this tensor type.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Returns the element type of this tensor type.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Returns a copy of this tensor type with the same element type and the provided `shape`.
    pub fn with_shape<S: Into<Vec<usize>>>(&self, shape: S) -> Self {
        Self { shape: shape.into(), element_type: self.element_type }
    }
}

impl Display for TensorType {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "tensor<")?;
        for dimension_size in &self.shape {
            write!(formatter, "{dimension_size}x")?;
        }
        write!(formatter, "{}>", self.element_type)
    }
}
