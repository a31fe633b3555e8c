//! Type tags and in-memory values for data blocks.

/// One-byte tag that prefixes every typed object in a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum DataBlockType {
    Terminate = -1,
    Error = -2,
    Byte = 0,
    Integer = 1,
    Double = 2,
    Boolean = 3,
    String = 4,
    Array = 5,
    List = 6,
    Void = 7,
    Complex = 8,
}

impl DataBlockType {
    // ---

    pub fn from_tag(tag: u8) -> Option<Self> {
        // ---
        let ty = match tag as i8 {
            -1 => Self::Terminate,
            -2 => Self::Error,
            0 => Self::Byte,
            1 => Self::Integer,
            2 => Self::Double,
            3 => Self::Boolean,
            4 => Self::String,
            5 => Self::Array,
            6 => Self::List,
            7 => Self::Void,
            8 => Self::Complex,
            _ => return None,
        };
        Some(ty)
    }

    pub fn tag(self) -> u8 {
        self as i8 as u8
    }

    /// Name used in decode diagnostics.
    pub fn name(self) -> &'static str {
        // ---
        match self {
            Self::Terminate => "terminator",
            Self::Error => "error",
            Self::Byte => "byte",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Array => "array",
            Self::List => "list",
            Self::Void => "void",
            Self::Complex => "complex",
        }
    }

    /// Encoded size of one untagged element, for fixed-width types.
    pub(crate) fn fixed_width(self) -> Option<usize> {
        // ---
        match self {
            Self::Byte | Self::Boolean => Some(1),
            Self::Integer => Some(4),
            Self::Double => Some(8),
            Self::Complex => Some(16),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataBlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

/// Row-major element storage of an [`Array`].
///
/// `List` and `Array` elements nest: each element is a whole list or array
/// stored without its own type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Byte(Vec<u8>),
    Integer(Vec<i32>),
    Double(Vec<f64>),
    Boolean(Vec<bool>),
    String(Vec<String>),
    Complex(Vec<Complex>),
    List(Vec<Vec<Value>>),
    Array(Vec<Array>),
}

impl ArrayData {
    // ---

    pub fn element_type(&self) -> DataBlockType {
        // ---
        match self {
            Self::Byte(_) => DataBlockType::Byte,
            Self::Integer(_) => DataBlockType::Integer,
            Self::Double(_) => DataBlockType::Double,
            Self::Boolean(_) => DataBlockType::Boolean,
            Self::String(_) => DataBlockType::String,
            Self::Complex(_) => DataBlockType::Complex,
            Self::List(_) => DataBlockType::List,
            Self::Array(_) => DataBlockType::Array,
        }
    }

    pub fn len(&self) -> usize {
        // ---
        match self {
            Self::Byte(v) => v.len(),
            Self::Integer(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::Boolean(v) => v.len(),
            Self::String(v) => v.len(),
            Self::Complex(v) => v.len(),
            Self::List(v) => v.len(),
            Self::Array(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// N-dimensional array with row-major element data.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    dims: Vec<usize>,
    data: ArrayData,
}

impl Array {
    // ---

    /// Build an array, checking that `dims` covers exactly `data.len()` elements.
    pub fn new(dims: Vec<usize>, data: ArrayData) -> Option<Self> {
        // ---
        let count = dims.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))?;
        if dims.is_empty() || count != data.len() {
            return None;
        }
        Some(Self { dims, data })
    }

    pub fn one_dim(data: ArrayData) -> Self {
        // ---
        Self {
            dims: vec![data.len()],
            data,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn element_type(&self) -> DataBlockType {
        self.data.element_type()
    }
}

/// Any object that can appear in a data block.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Integer(i32),
    Double(f64),
    Boolean(bool),
    String(String),
    Complex(Complex),
    Void,
    Array(Array),
    List(Vec<Value>),
}

impl Value {
    // ---

    pub fn data_type(&self) -> DataBlockType {
        // ---
        match self {
            Self::Byte(_) => DataBlockType::Byte,
            Self::Integer(_) => DataBlockType::Integer,
            Self::Double(_) => DataBlockType::Double,
            Self::Boolean(_) => DataBlockType::Boolean,
            Self::String(_) => DataBlockType::String,
            Self::Complex(_) => DataBlockType::Complex,
            Self::Void => DataBlockType::Void,
            Self::Array(_) => DataBlockType::Array,
            Self::List(_) => DataBlockType::List,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::Byte(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Complex> for Value {
    fn from(v: Complex) -> Self {
        Self::Complex(v)
    }
}

impl From<Array> for Value {
    fn from(v: Array) -> Self {
        Self::Array(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}
