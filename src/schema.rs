//! Schema compiler: turns ordered `(name, kind, config)` declarations into an immutable,
//! validated [`Schema`].
//!
//! ## Rules checked at compile time
//!
//! - Names are non-empty, unique per level, contain no `.`, do not start with `_` and are not
//!   one of `null`, `pascal`, `pascal16`.
//! - Fixed integer widths are 1, 2, 4 or 8 bytes; fixed float widths 4 or 8; fixed bits 1..=64.
//! - Every width/count/discriminant reference names a field declared strictly earlier at the
//!   same level (or a dotted path through an earlier nested field), and that field is an
//!   integer or bits field.
//!
//! Array elements and union branches are compiled as anonymous fields: they may reference
//! earlier fields but are never registered as fields of their own.
//!
//! ## Example
//!
//! ```
//! use structwire::{SchemaBuilder, Value};
//!
//! let schema = SchemaBuilder::new()
//!     .integer("id", 1)
//!     .integer("length", 2)
//!     .string("name", "length")
//!     .build()
//!     .unwrap();
//! let values = schema.parse_bytes(&[0x01, 0x05, 0x00, b'h', b'e', b'l', b'l', b'o']).unwrap();
//! assert_eq!(values["name"], Value::Text("hello".into()));
//! ```

use crate::codec::{Codec, CodecError};
use crate::field::*;
use crate::length::{self, IndeterminateLength};
use crate::value::{Value, ValueMap};
use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("field declaration: {0}")]
    FieldDeclaration(String),
    #[error("{field} depends on {dependency}, which is not declared before it")]
    DependencyOrder { field: String, dependency: String },
    #[error("{field} depends on {dependency}, which is not an integer or bits field")]
    DependencyType { field: String, dependency: String },
    #[error("duplicate field name: {0}")]
    DuplicateField(String),
}

/// Kind tag of a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Integer,
    Float,
    Bytes,
    Bits,
    String,
    Array,
    Union,
    Nested,
}

/// Kind-specific configuration of a declaration.
#[derive(Debug, Clone)]
pub enum Config {
    /// Bare width: integer, float, bytes, bits, or string.
    Width(Width),
    /// Integer or float with an explicit byte order.
    Endian(Endianness, Width),
    /// String with an explicit encoding.
    Text(StringWidth, Encoding),
    Array {
        count: Width,
        element_kind: Kind,
        element_config: Box<Config>,
    },
    Union {
        discriminant: String,
        cases: Vec<Case>,
    },
    Nested(Arc<Schema>),
}

/// One union branch: discriminant value and the branch's own declaration.
#[derive(Debug, Clone)]
pub struct Case {
    pub value: u64,
    pub kind: Kind,
    pub config: Config,
    pub transform: Option<Transform>,
}

impl Case {
    pub fn new(value: u64, kind: Kind, config: Config) -> Self {
        Case {
            value,
            kind,
            config,
            transform: None,
        }
    }

    pub fn with_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Transform::new(f));
        self
    }
}

/// One `(name, kind, config)` entry of a schema description.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub name: String,
    pub kind: Kind,
    pub config: Config,
    pub transform: Option<Transform>,
}

impl Declaration {
    pub fn new(name: impl Into<String>, kind: Kind, config: Config) -> Self {
        Declaration {
            name: name.into(),
            kind,
            config,
            transform: None,
        }
    }

    pub fn with_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Transform::new(f));
        self
    }
}

/// Compiled, immutable schema: ordered fields plus the variable-length flag.
///
/// Holds no per-call state, so one instance can be shared (e.g. behind an `Arc`) by any
/// number of concurrent parse/serialize calls.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<FieldSpec>,
    has_variable_length: bool,
}

impl Schema {
    /// Compile declarations with little-endian as the default byte order.
    pub fn compile<I>(declarations: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = Declaration>,
    {
        Compiler::new(Endianness::Little).compile(declarations)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Number of top-level fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_variable_length(&self) -> bool {
        self.has_variable_length
    }

    /// Byte length of every encoding of this schema; see [`length::static_len`].
    pub fn static_len(&self) -> Result<usize, IndeterminateLength> {
        length::static_len(self)
    }

    /// Parse one record from `r` with the default codec configuration.
    pub fn parse<R: Read>(&self, r: &mut R) -> Result<ValueMap, CodecError> {
        Codec::new().parse(self, r)
    }

    pub fn parse_bytes(&self, bytes: &[u8]) -> Result<ValueMap, CodecError> {
        Codec::new().parse_bytes(self, bytes)
    }

    /// Serialize `values` straight to `w`. Bytes written before an error stay written.
    pub fn serialize<W: Write>(&self, values: &ValueMap, w: &mut W) -> Result<(), CodecError> {
        Codec::new().serialize(self, values, w)
    }

    /// Serialize into a fresh buffer; nothing is returned unless every field encoded.
    pub fn to_bytes(&self, values: &ValueMap) -> Result<Vec<u8>, CodecError> {
        Codec::new().to_bytes(self, values)
    }
}

/// Fluent construction of a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    declarations: Vec<Declaration>,
    default_endianness: Endianness,
    error: Option<SchemaError>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte order for integer/float declarations given as a bare width.
    pub fn default_endianness(mut self, endianness: Endianness) -> Self {
        self.default_endianness = endianness;
        self
    }

    pub fn declare(mut self, declaration: Declaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    pub fn integer(self, name: &str, width: impl Into<Width>) -> Self {
        self.declare(Declaration::new(name, Kind::Integer, Config::Width(width.into())))
    }

    pub fn integer_endian(self, name: &str, endianness: Endianness, width: impl Into<Width>) -> Self {
        self.declare(Declaration::new(
            name,
            Kind::Integer,
            Config::Endian(endianness, width.into()),
        ))
    }

    pub fn float(self, name: &str, width: impl Into<Width>) -> Self {
        self.declare(Declaration::new(name, Kind::Float, Config::Width(width.into())))
    }

    pub fn float_endian(self, name: &str, endianness: Endianness, width: impl Into<Width>) -> Self {
        self.declare(Declaration::new(
            name,
            Kind::Float,
            Config::Endian(endianness, width.into()),
        ))
    }

    pub fn bytes(self, name: &str, width: impl Into<Width>) -> Self {
        self.declare(Declaration::new(name, Kind::Bytes, Config::Width(width.into())))
    }

    pub fn bits(self, name: &str, width: impl Into<Width>) -> Self {
        self.declare(Declaration::new(name, Kind::Bits, Config::Width(width.into())))
    }

    /// UTF-8 string; `width` may be a byte count, a field name, `"null"` or `"pascal"`.
    pub fn string(self, name: &str, width: impl Into<StringWidth>) -> Self {
        self.string_encoded(name, width, Encoding::Utf8)
    }

    pub fn string_encoded(self, name: &str, width: impl Into<StringWidth>, encoding: Encoding) -> Self {
        self.declare(Declaration::new(
            name,
            Kind::String,
            Config::Text(width.into(), encoding),
        ))
    }

    pub fn array(self, name: &str, count: impl Into<Width>, element_kind: Kind, element_config: Config) -> Self {
        self.declare(Declaration::new(
            name,
            Kind::Array,
            Config::Array {
                count: count.into(),
                element_kind,
                element_config: Box::new(element_config),
            },
        ))
    }

    pub fn union(self, name: &str, discriminant: &str, cases: Vec<Case>) -> Self {
        self.declare(Declaration::new(
            name,
            Kind::Union,
            Config::Union {
                discriminant: discriminant.to_string(),
                cases,
            },
        ))
    }

    pub fn nested(self, name: &str, schema: Arc<Schema>) -> Self {
        self.declare(Declaration::new(name, Kind::Nested, Config::Nested(schema)))
    }

    /// Attach a parse transform to the most recently declared field.
    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        match self.declarations.last_mut() {
            Some(d) => d.transform = Some(Transform::new(f)),
            None => {
                self.error.get_or_insert(SchemaError::FieldDeclaration(
                    "transform given before any field".to_string(),
                ));
            }
        }
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        Compiler::new(self.default_endianness).compile(self.declarations)
    }
}

/// Compilation state for one schema level.
struct Compiler {
    default_endianness: Endianness,
    fields: Vec<FieldSpec>,
    names: HashSet<String>,
}

impl Compiler {
    fn new(default_endianness: Endianness) -> Self {
        Compiler {
            default_endianness,
            fields: Vec::new(),
            names: HashSet::new(),
        }
    }

    fn compile<I>(mut self, declarations: I) -> Result<Schema, SchemaError>
    where
        I: IntoIterator<Item = Declaration>,
    {
        for d in declarations {
            validate_name(&d.name)?;
            if self.names.contains(&d.name) {
                return Err(SchemaError::DuplicateField(d.name));
            }
            let mut field = self.compile_field(&d.name, d.kind, &d.config)?;
            field.transform = d.transform;
            self.names.insert(d.name);
            self.fields.push(field);
        }
        let has_variable_length = self.fields.iter().any(FieldSpec::has_variable_length);
        tracing::debug!(
            fields = self.fields.len(),
            variable = has_variable_length,
            "compiled schema"
        );
        Ok(Schema {
            fields: self.fields,
            has_variable_length,
        })
    }

    /// Build one field (top-level or anonymous) against the fields compiled so far.
    fn compile_field(&self, name: &str, kind: Kind, config: &Config) -> Result<FieldSpec, SchemaError> {
        let field_kind = match (kind, config) {
            (Kind::Integer, Config::Width(w)) => self.number(name, kind, self.default_endianness, w)?,
            (Kind::Integer, Config::Endian(e, w)) => self.number(name, kind, *e, w)?,
            (Kind::Float, Config::Width(w)) => self.number(name, kind, self.default_endianness, w)?,
            (Kind::Float, Config::Endian(e, w)) => self.number(name, kind, *e, w)?,
            (Kind::Bytes, Config::Width(w)) => {
                self.check_width(name, w)?;
                FieldKind::Bytes { width: w.clone() }
            }
            (Kind::Bits, Config::Width(w)) => {
                if let Width::Fixed(n) = w {
                    if *n == 0 || *n > 64 {
                        return Err(SchemaError::FieldDeclaration(format!(
                            "{}: bits width must be 1..=64, got {}",
                            name, n
                        )));
                    }
                }
                self.check_width(name, w)?;
                FieldKind::Bits { width: w.clone() }
            }
            (Kind::String, Config::Width(w)) => {
                self.string(name, &StringWidth::from(w.clone()), Encoding::default())?
            }
            (Kind::String, Config::Text(w, enc)) => self.string(name, w, *enc)?,
            (
                Kind::Array,
                Config::Array {
                    count,
                    element_kind,
                    element_config,
                },
            ) => {
                self.check_width(name, count)?;
                let element = self.compile_field(name, *element_kind, element_config)?;
                FieldKind::Array {
                    count: count.clone(),
                    element: Box::new(element),
                }
            }
            (Kind::Union, Config::Union { discriminant, cases }) => {
                self.check_dependency(name, discriminant)?;
                let mut compiled = BTreeMap::new();
                for case in cases {
                    let mut branch = self.compile_field(name, case.kind, &case.config)?;
                    branch.transform = case.transform.clone();
                    if compiled.insert(case.value, branch).is_some() {
                        return Err(SchemaError::FieldDeclaration(format!(
                            "{}: duplicate union case {}",
                            name, case.value
                        )));
                    }
                }
                FieldKind::Union {
                    discriminant: discriminant.clone(),
                    cases: compiled,
                }
            }
            (Kind::Nested, Config::Nested(schema)) => FieldKind::Nested {
                schema: Arc::clone(schema),
            },
            (kind, config) => {
                return Err(SchemaError::FieldDeclaration(format!(
                    "{}: configuration {:?} does not apply to {:?}",
                    name, config, kind
                )))
            }
        };
        Ok(FieldSpec::new(name, field_kind))
    }

    fn number(&self, name: &str, kind: Kind, endianness: Endianness, width: &Width) -> Result<FieldKind, SchemaError> {
        let endianness = endianness.resolve();
        match (kind, width) {
            (Kind::Integer, Width::Fixed(n)) if !matches!(n, 1 | 2 | 4 | 8) => {
                Err(SchemaError::FieldDeclaration(format!(
                    "{}: integer width must be 1, 2, 4 or 8 bytes, got {}",
                    name, n
                )))
            }
            (Kind::Float, Width::Fixed(n)) if !matches!(n, 4 | 8) => Err(SchemaError::FieldDeclaration(
                format!("{}: float width must be 4 or 8 bytes, got {}", name, n),
            )),
            (Kind::Float, w) => {
                self.check_width(name, w)?;
                Ok(FieldKind::Float {
                    width: w.clone(),
                    endianness,
                })
            }
            (_, w) => {
                self.check_width(name, w)?;
                Ok(FieldKind::Integer {
                    width: w.clone(),
                    endianness,
                })
            }
        }
    }

    fn string(&self, name: &str, width: &StringWidth, encoding: Encoding) -> Result<FieldKind, SchemaError> {
        if let Some(dep) = width.as_ref_name() {
            self.check_dependency(name, dep)?;
        }
        Ok(FieldKind::String {
            width: width.clone(),
            encoding,
        })
    }

    fn check_width(&self, name: &str, width: &Width) -> Result<(), SchemaError> {
        match width.as_ref_name() {
            Some(dep) => self.check_dependency(name, dep),
            None => Ok(()),
        }
    }

    /// `path` must name an earlier integer/bits field, possibly through nested schemas.
    fn check_dependency(&self, field: &str, path: &str) -> Result<(), SchemaError> {
        let order_err = || SchemaError::DependencyOrder {
            field: field.to_string(),
            dependency: path.to_string(),
        };
        let type_err = || SchemaError::DependencyType {
            field: field.to_string(),
            dependency: path.to_string(),
        };
        let mut segments = path.split(PATH_SEPARATOR);
        let first = segments.next().unwrap_or_default();
        let mut target = self
            .fields
            .iter()
            .find(|f| f.name == first)
            .ok_or_else(order_err)?;
        for segment in segments {
            let FieldKind::Nested { schema } = &target.kind else {
                return Err(type_err());
            };
            target = schema.field(segment).ok_or_else(order_err)?;
        }
        if target.is_integral() {
            Ok(())
        } else {
            Err(type_err())
        }
    }
}

fn validate_name(name: &str) -> Result<(), SchemaError> {
    let reason = if name.is_empty() {
        "field name cannot be empty"
    } else if name.starts_with(RESERVED_PREFIX) {
        "field names cannot start with an underscore"
    } else if RESERVED_NAMES.contains(&name) {
        "a field cannot be named 'null', 'pascal' or 'pascal16'"
    } else if name.contains(PATH_SEPARATOR) {
        "field names cannot contain '.'"
    } else {
        return Ok(());
    };
    Err(SchemaError::FieldDeclaration(format!("{:?}: {}", name, reason)))
}
