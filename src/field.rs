//! Field model: what a compiled field is, with no parse/serialize behavior.
//!
//! A [`FieldSpec`] is produced by the [schema compiler](crate::schema) and consumed by the
//! [codec](crate::codec). Widths are either fixed literals or name references to an earlier
//! integer/bits field; references are checked at compile time but resolved per call.

use crate::schema::Schema;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Names a field may not take; they collide with the string width sentinels.
pub const RESERVED_NAMES: [&str; 3] = ["null", "pascal", "pascal16"];

/// Leading character reserved for internal use.
pub const RESERVED_PREFIX: char = '_';

/// Separator for nested dependency paths (`header.length`).
pub const PATH_SEPARATOR: char = '.';

/// Byte order of a multi-byte integer or float.
///
/// `Host` and `Network` are relative tags: the compiler resolves them to `Little`/`Big`
/// so a compiled [`FieldSpec`] only ever carries one of the absolute orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
    Host,
    Network,
}

impl Endianness {
    /// Resolve relative tags to an absolute byte order.
    pub fn resolve(self) -> Endianness {
        match self {
            Endianness::Host if cfg!(target_endian = "big") => Endianness::Big,
            Endianness::Host => Endianness::Little,
            Endianness::Network => Endianness::Big,
            other => other,
        }
    }
}

/// Width (in bytes, or bits for [`FieldKind::Bits`]) or element count of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Width {
    Fixed(usize),
    /// Name (or dotted path) of an earlier integer/bits field holding the width.
    Ref(String),
}

impl Width {
    pub fn as_ref_name(&self) -> Option<&str> {
        match self {
            Width::Ref(name) => Some(name),
            Width::Fixed(_) => None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, Width::Fixed(_))
    }
}

impl From<usize> for Width {
    fn from(n: usize) -> Self {
        Width::Fixed(n)
    }
}

impl From<&str> for Width {
    fn from(name: &str) -> Self {
        Width::Ref(name.to_string())
    }
}

impl From<String> for Width {
    fn from(name: String) -> Self {
        Width::Ref(name)
    }
}

/// Width of a text field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringWidth {
    Fixed(usize),
    Ref(String),
    /// Terminated by exactly one zero byte.
    NullTerminated,
    /// Preceded by a single unsigned length byte.
    LengthPrefixed,
}

impl StringWidth {
    pub fn as_ref_name(&self) -> Option<&str> {
        match self {
            StringWidth::Ref(name) => Some(name),
            _ => None,
        }
    }
}

impl From<usize> for StringWidth {
    fn from(n: usize) -> Self {
        StringWidth::Fixed(n)
    }
}

/// `"null"` and `"pascal"` select the sentinels; any other text is a field reference.
impl From<&str> for StringWidth {
    fn from(s: &str) -> Self {
        match s {
            "null" => StringWidth::NullTerminated,
            "pascal" => StringWidth::LengthPrefixed,
            name => StringWidth::Ref(name.to_string()),
        }
    }
}

impl From<Width> for StringWidth {
    fn from(w: Width) -> Self {
        match w {
            Width::Fixed(n) => StringWidth::Fixed(n),
            Width::Ref(name) => StringWidth::Ref(name),
        }
    }
}

/// Text encoding of a string field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    Ascii,
    #[default]
    Utf8,
}

/// Function applied to a field's value after it is parsed. Not applied on serialize.
#[derive(Clone)]
pub struct Transform(Arc<dyn Fn(Value) -> Value + Send + Sync>);

impl Transform {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Transform(Arc::new(f))
    }

    pub fn apply(&self, v: Value) -> Value {
        (self.0)(v)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transform(..)")
    }
}

/// One compiled field: its name, kind and optional parse transform.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Top-level name; anonymous fields (array elements, union branches) carry their parent's name.
    pub name: String,
    pub kind: FieldKind,
    pub transform: Option<Transform>,
}

#[derive(Debug, Clone)]
pub enum FieldKind {
    /// Unsigned integer of 1, 2, 4 or 8 bytes.
    Integer { width: Width, endianness: Endianness },
    /// IEEE-754 single (4) or double (8).
    Float { width: Width, endianness: Endianness },
    Bytes { width: Width },
    /// Width in bits, packed MSB-first into a shared accumulator.
    Bits { width: Width },
    String { width: StringWidth, encoding: Encoding },
    Array { count: Width, element: Box<FieldSpec> },
    Union {
        discriminant: String,
        cases: BTreeMap<u64, FieldSpec>,
    },
    Nested { schema: Arc<Schema> },
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        FieldSpec {
            name: name.into(),
            kind,
            transform: None,
        }
    }

    pub fn is_bits(&self) -> bool {
        matches!(self.kind, FieldKind::Bits { .. })
    }

    /// True for kinds a width/count/discriminant may reference.
    pub fn is_integral(&self) -> bool {
        matches!(self.kind, FieldKind::Integer { .. } | FieldKind::Bits { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            FieldKind::Integer { .. } => "integer",
            FieldKind::Float { .. } => "float",
            FieldKind::Bytes { .. } => "bytes",
            FieldKind::Bits { .. } => "bits",
            FieldKind::String { .. } => "string",
            FieldKind::Array { .. } => "array",
            FieldKind::Union { .. } => "union",
            FieldKind::Nested { .. } => "nested",
        }
    }

    /// Whether the byte extent of this field is only known at parse/serialize time.
    pub fn has_variable_length(&self) -> bool {
        match &self.kind {
            FieldKind::Integer { width, .. }
            | FieldKind::Float { width, .. }
            | FieldKind::Bytes { width }
            | FieldKind::Bits { width } => !width.is_fixed(),
            FieldKind::String { width, .. } => !matches!(width, StringWidth::Fixed(_)),
            FieldKind::Array { count, element } => {
                !count.is_fixed() || element.has_variable_length()
            }
            FieldKind::Union { .. } => true,
            FieldKind::Nested { schema } => schema.has_variable_length(),
        }
    }

    pub(crate) fn apply_transform(&self, v: Value) -> Value {
        match &self.transform {
            Some(t) => t.apply(v),
            None => v,
        }
    }
}
