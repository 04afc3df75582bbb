//! Parse binary streams into [`ValueMap`]s and serialize them back, driven by a compiled
//! [`Schema`].
//!
//! Each call walks the schema's fields in order with its own [`Context`] and bit
//! accumulator; nothing is cached on the schema. Consecutive `bits` fields share one
//! accumulator, packed most-significant-bit first; any other field (and the end of a
//! schema level) flushes it, so a partially used byte is skipped on parse and zero-filled
//! on serialize.
//!
//! Serialize writes straight to the given stream and is not transactional: on error, bytes
//! already written stay written. Use [`Codec::to_bytes`] to get all-or-nothing output.

use crate::context::Context;
use crate::field::*;
use crate::schema::Schema;
use crate::value::{Value, ValueMap};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use tracing::{debug, trace};

/// Default chunk size for buffered fixed-width text and byte reads.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Largest length a length-prefixed string can carry.
pub const MAX_PREFIXED_LEN: usize = u8::MAX as usize;

const INT_WIDTHS: [u64; 4] = [1, 2, 4, 8];
const FLOAT_WIDTHS: [u64; 2] = [4, 8];
const MAX_BITS: u64 = 64;

// Upper bound on up-front allocation for arrays whose count comes from the stream.
const PREALLOC_LIMIT: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("stream ended while reading {field}; is the schema or the data wrong?")]
    StreamOverflow { field: String },
    #[error("{field}: width {width} taken from {dependency} is not allowed for this field")]
    RuntimeLengthRange {
        field: String,
        dependency: String,
        width: u64,
    },
    #[error("{field}: expected {expected} value, got {found}")]
    ValueType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{field}: array holds {actual} elements but its count is {declared}")]
    CountMismatch {
        field: String,
        declared: usize,
        actual: usize,
    },
    #[error("{field} has a declared width of {declared} bytes/bits, but the value needs {actual}")]
    ValueTooLarge {
        field: String,
        declared: usize,
        actual: usize,
    },
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("missing value for field: {0}")]
    MissingField(String),
    #[error("{field}: no union case for discriminant value {discriminant}")]
    UnionDispatch { field: String, discriminant: u64 },
    #[error("no value at dependency path {0}")]
    Lookup(String),
    #[error("dependency {path} holds a {found} value, not an integer")]
    DependencyType { path: String, found: &'static str },
    #[error("{field}: {reason}")]
    Encoding { field: String, reason: String },
    #[error("{field}: count {count} is too large for elements that consume no input")]
    ZeroWidthElements { field: String, count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Fixed-width text and bytes are read in chunks of at most this many bytes.
    pub chunk_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Stateless parse/serialize engine; per-call state lives on the stack of each call.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CodecConfig) -> Self {
        Codec {
            config: CodecConfig {
                chunk_size: config.chunk_size.max(1),
            },
        }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Parse one record of `schema` from `r`.
    pub fn parse<R: Read>(&self, schema: &Schema, r: &mut R) -> Result<ValueMap, CodecError> {
        let mut src = Counted::new(r);
        let values = self.parse_schema(schema, &mut src)?;
        debug!(fields = values.len(), consumed = src.consumed, "parsed record");
        Ok(values)
    }

    /// Parse one record from the start of `bytes`; trailing bytes are ignored.
    pub fn parse_bytes(&self, schema: &Schema, bytes: &[u8]) -> Result<ValueMap, CodecError> {
        let mut src = Counted::new(Cursor::new(bytes));
        let values = self.parse_schema(schema, &mut src)?;
        debug!(
            fields = values.len(),
            consumed = src.consumed,
            available = bytes.len(),
            "parsed record from bytes"
        );
        Ok(values)
    }

    /// Serialize `values` to `w`. `values` must hold exactly the schema's top-level names.
    pub fn serialize<W: Write>(&self, schema: &Schema, values: &ValueMap, w: &mut W) -> Result<(), CodecError> {
        self.serialize_schema(schema, values, w)?;
        debug!(fields = values.len(), "serialized record");
        Ok(())
    }

    /// Serialize into a new buffer, returned only if every field encoded.
    pub fn to_bytes(&self, schema: &Schema, values: &ValueMap) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.serialize_schema(schema, values, &mut out)?;
        debug!(bytes = out.len(), "serialized record to bytes");
        Ok(out)
    }

    fn parse_schema<R: Read>(&self, schema: &Schema, r: &mut Counted<R>) -> Result<ValueMap, CodecError> {
        let mut ctx = Context::new();
        let mut bits = BitReadState::default();
        for field in schema.fields() {
            if !field.is_bits() {
                bits.reset();
            }
            let v = self.parse_field(field, r, &ctx, &mut bits)?;
            ctx.record(field.name.clone(), v);
        }
        Ok(ctx.into_values())
    }

    /// Parse one field; array elements and union branches recurse here without being recorded.
    fn parse_field<R: Read>(
        &self,
        field: &FieldSpec,
        r: &mut Counted<R>,
        ctx: &Context<'_>,
        bits: &mut BitReadState,
    ) -> Result<Value, CodecError> {
        let name = field.name.as_str();
        let value = match &field.kind {
            FieldKind::Integer { width, endianness } => {
                let w = resolve_width(field, width, ctx, |n| INT_WIDTHS.contains(&n))?;
                trace!(field = name, width = w, "integer");
                let v = if is_big(*endianness) {
                    r.read_uint::<BigEndian>(w)
                } else {
                    r.read_uint::<LittleEndian>(w)
                };
                Value::Int(v.map_err(|e| short_read(name, e))?)
            }
            FieldKind::Float { width, endianness } => {
                let w = resolve_width(field, width, ctx, |n| FLOAT_WIDTHS.contains(&n))?;
                trace!(field = name, width = w, "float");
                let v = match (w, is_big(*endianness)) {
                    (4, true) => r.read_f32::<BigEndian>().map(f64::from),
                    (4, false) => r.read_f32::<LittleEndian>().map(f64::from),
                    (_, true) => r.read_f64::<BigEndian>(),
                    (_, false) => r.read_f64::<LittleEndian>(),
                };
                Value::Float(v.map_err(|e| short_read(name, e))?)
            }
            FieldKind::Bytes { width } => {
                let w = resolve_width(field, width, ctx, |_| true)?;
                trace!(field = name, width = w, "bytes");
                Value::Bytes(self.read_chunked(r, w, name)?)
            }
            FieldKind::Bits { width } => {
                let w = resolve_width(field, width, ctx, |n| (1..=MAX_BITS).contains(&n))?;
                trace!(field = name, bits = w, "bits");
                Value::Int(bits.read(r, w, name)?)
            }
            FieldKind::String { width, encoding } => {
                let raw = match width {
                    StringWidth::NullTerminated => {
                        let mut buf = Vec::new();
                        loop {
                            match r.read_u8().map_err(|e| short_read(name, e))? {
                                0 => break,
                                b => buf.push(b),
                            }
                        }
                        buf
                    }
                    StringWidth::LengthPrefixed => {
                        let n = r.read_u8().map_err(|e| short_read(name, e))?;
                        self.read_chunked(r, n as usize, name)?
                    }
                    StringWidth::Fixed(n) => trim_padding(self.read_chunked(r, *n, name)?),
                    StringWidth::Ref(dep) => {
                        let n = resolve_ref(field, dep, ctx, |_| true)?;
                        trim_padding(self.read_chunked(r, n, name)?)
                    }
                };
                trace!(field = name, len = raw.len(), "string");
                Value::Text(decode_text(name, raw, *encoding)?)
            }
            FieldKind::Array { count, element } => {
                let n = resolve_width(field, count, ctx, |_| true)?;
                trace!(field = name, count = n, "array");
                let mut items = Vec::with_capacity(n.min(PREALLOC_LIMIT));
                while items.len() < n {
                    let mark = (r.consumed, bits.left);
                    items.push(self.parse_field(element, r, ctx, bits)?);
                    // An element that reads no input yields the same value every time; cap such runs.
                    if (r.consumed, bits.left) == mark && n - items.len() > PREALLOC_LIMIT {
                        return Err(CodecError::ZeroWidthElements {
                            field: name.to_string(),
                            count: n,
                        });
                    }
                }
                Value::Array(items)
            }
            FieldKind::Union { discriminant, cases } => {
                let d = ctx.resolve(discriminant)?;
                let branch = cases.get(&d).ok_or_else(|| CodecError::UnionDispatch {
                    field: name.to_string(),
                    discriminant: d,
                })?;
                trace!(field = name, discriminant = d, branch = branch.kind_name(), "union");
                self.parse_field(branch, r, ctx, bits)?
            }
            FieldKind::Nested { schema } => {
                trace!(field = name, "nested");
                Value::Record(self.parse_schema(schema, r)?)
            }
        };
        Ok(field.apply_transform(value))
    }

    fn serialize_schema<W: Write>(&self, schema: &Schema, values: &ValueMap, w: &mut W) -> Result<(), CodecError> {
        if let Some(unknown) = values.keys().find(|k| schema.field(k).is_none()) {
            return Err(CodecError::UnknownField(unknown.clone()));
        }
        if let Some(missing) = schema.names().find(|n| !values.contains_key(*n)) {
            return Err(CodecError::MissingField(missing.to_string()));
        }
        let ctx = Context::borrowed(values);
        let mut bits = BitWriteState::default();
        for field in schema.fields() {
            let value = values
                .get(&field.name)
                .ok_or_else(|| CodecError::MissingField(field.name.clone()))?;
            if !field.is_bits() {
                bits.flush(w)?;
            }
            self.write_field(field, value, w, &ctx, &mut bits)?;
        }
        bits.flush(w)
    }

    fn write_field<W: Write>(
        &self,
        field: &FieldSpec,
        value: &Value,
        out: &mut W,
        ctx: &Context<'_>,
        bits: &mut BitWriteState,
    ) -> Result<(), CodecError> {
        let name = field.name.as_str();
        match &field.kind {
            FieldKind::Integer { width, endianness } => {
                let v = value.as_u64().ok_or_else(|| mismatch(name, "integer", value))?;
                let w = resolve_width(field, width, ctx, |n| INT_WIDTHS.contains(&n))?;
                let needed = byte_len(v);
                if needed > w {
                    return Err(too_large(name, w, needed));
                }
                if is_big(*endianness) {
                    out.write_uint::<BigEndian>(v, w)?;
                } else {
                    out.write_uint::<LittleEndian>(v, w)?;
                }
            }
            FieldKind::Float { width, endianness } => {
                let v = value.as_f64().ok_or_else(|| mismatch(name, "float", value))?;
                let w = resolve_width(field, width, ctx, |n| FLOAT_WIDTHS.contains(&n))?;
                match (w, is_big(*endianness)) {
                    (4, _) if v.is_finite() && v.abs() > f32::MAX as f64 => {
                        return Err(too_large(name, 4, 8));
                    }
                    (4, true) => out.write_f32::<BigEndian>(v as f32)?,
                    (4, false) => out.write_f32::<LittleEndian>(v as f32)?,
                    (_, true) => out.write_f64::<BigEndian>(v)?,
                    (_, false) => out.write_f64::<LittleEndian>(v)?,
                }
            }
            FieldKind::Bytes { width } => {
                let data = value.as_bytes().ok_or_else(|| mismatch(name, "bytes", value))?;
                let w = resolve_width(field, width, ctx, |_| true)?;
                write_padded(out, name, data, w)?;
            }
            FieldKind::Bits { width } => {
                let v = value.as_u64().ok_or_else(|| mismatch(name, "integer", value))?;
                let w = resolve_width(field, width, ctx, |n| (1..=MAX_BITS).contains(&n))?;
                if w < 64 && v >> w != 0 {
                    return Err(too_large(name, w, 64 - v.leading_zeros() as usize));
                }
                bits.write(out, w, v)?;
            }
            FieldKind::String { width, encoding } => {
                let text = value.as_str().ok_or_else(|| mismatch(name, "text", value))?;
                let data = encode_text(name, text, *encoding)?;
                match width {
                    StringWidth::LengthPrefixed => {
                        if data.len() > MAX_PREFIXED_LEN {
                            return Err(too_large(name, MAX_PREFIXED_LEN, data.len()));
                        }
                        out.write_u8(data.len() as u8)?;
                        out.write_all(data)?;
                    }
                    StringWidth::NullTerminated => {
                        if data.contains(&0) {
                            return Err(CodecError::Encoding {
                                field: name.to_string(),
                                reason: "null-terminated text cannot contain a zero byte".to_string(),
                            });
                        }
                        out.write_all(data)?;
                        out.write_u8(0)?;
                    }
                    StringWidth::Fixed(n) => write_padded(out, name, data, *n)?,
                    StringWidth::Ref(dep) => {
                        let n = resolve_ref(field, dep, ctx, |_| true)?;
                        write_padded(out, name, data, n)?;
                    }
                }
            }
            FieldKind::Array { count, element } => {
                let items = value.as_array().ok_or_else(|| mismatch(name, "array", value))?;
                let n = resolve_width(field, count, ctx, |_| true)?;
                if items.len() != n {
                    return Err(CodecError::CountMismatch {
                        field: name.to_string(),
                        declared: n,
                        actual: items.len(),
                    });
                }
                for item in items {
                    self.write_field(element, item, out, ctx, bits)?;
                }
            }
            FieldKind::Union { discriminant, cases } => {
                let d = ctx.resolve(discriminant)?;
                let branch = cases.get(&d).ok_or_else(|| CodecError::UnionDispatch {
                    field: name.to_string(),
                    discriminant: d,
                })?;
                self.write_field(branch, value, out, ctx, bits)?;
            }
            FieldKind::Nested { schema } => {
                let m = value.as_record().ok_or_else(|| mismatch(name, "record", value))?;
                self.serialize_schema(schema, m, out)?;
            }
        }
        trace!(field = name, kind = field.kind_name(), "wrote field");
        Ok(())
    }

    /// Read exactly `n` bytes, growing the buffer one chunk at a time.
    fn read_chunked<R: Read>(&self, r: &mut R, n: usize, field: &str) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(n.min(self.config.chunk_size));
        let mut remaining = n;
        while remaining > 0 {
            let take = remaining.min(self.config.chunk_size);
            let start = buf.len();
            buf.resize(start + take, 0);
            r.read_exact(&mut buf[start..]).map_err(|e| short_read(field, e))?;
            remaining -= take;
        }
        Ok(buf)
    }
}

/// Reader that counts the bytes it hands out.
struct Counted<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> Counted<R> {
    fn new(inner: R) -> Self {
        Counted { inner, consumed: 0 }
    }
}

impl<R: Read> Read for Counted<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

/// Bit accumulator for parse. Bits are consumed MSB-first; a fresh byte is pulled from
/// the stream only when the current one is used up.
#[derive(Clone, Copy, Debug, Default)]
struct BitReadState {
    cur: u8,
    left: u8, // unread bits remaining in `cur`
}

impl BitReadState {
    fn read<R: Read>(&mut self, r: &mut R, n: usize, field: &str) -> Result<u64, CodecError> {
        let mut out = 0u64;
        for _ in 0..n {
            if self.left == 0 {
                self.cur = r.read_u8().map_err(|e| short_read(field, e))?;
                self.left = 8;
            }
            self.left -= 1;
            out = (out << 1) | u64::from((self.cur >> self.left) & 1);
        }
        Ok(out)
    }

    /// Drop the rest of a partially consumed byte.
    fn reset(&mut self) {
        self.left = 0;
    }
}

/// Bit accumulator for serialize, MSB-first; `flush` zero-fills the last partial byte.
#[derive(Clone, Copy, Debug, Default)]
struct BitWriteState {
    cur: u8,
    used: u8,
}

impl BitWriteState {
    fn write<W: Write>(&mut self, w: &mut W, n: usize, value: u64) -> Result<(), CodecError> {
        for i in (0..n).rev() {
            let bit = ((value >> i) & 1) as u8;
            self.cur |= bit << (7 - self.used);
            self.used += 1;
            if self.used == 8 {
                w.write_u8(self.cur)?;
                self.cur = 0;
                self.used = 0;
            }
        }
        Ok(())
    }

    fn flush<W: Write>(&mut self, w: &mut W) -> Result<(), CodecError> {
        if self.used > 0 {
            w.write_u8(self.cur)?;
            self.cur = 0;
            self.used = 0;
        }
        Ok(())
    }
}

fn is_big(e: Endianness) -> bool {
    e.resolve() == Endianness::Big
}

fn resolve_width(
    field: &FieldSpec,
    width: &Width,
    ctx: &Context<'_>,
    allowed: impl Fn(u64) -> bool,
) -> Result<usize, CodecError> {
    match width {
        Width::Fixed(n) => Ok(*n),
        Width::Ref(dep) => resolve_ref(field, dep, ctx, allowed),
    }
}

/// Resolve a reference width and check it against the kind's allowed set.
fn resolve_ref(
    field: &FieldSpec,
    dep: &str,
    ctx: &Context<'_>,
    allowed: impl Fn(u64) -> bool,
) -> Result<usize, CodecError> {
    let n = ctx.resolve(dep)?;
    let out_of_range = || CodecError::RuntimeLengthRange {
        field: field.name.clone(),
        dependency: dep.to_string(),
        width: n,
    };
    if !allowed(n) {
        return Err(out_of_range());
    }
    usize::try_from(n).map_err(|_| out_of_range())
}

fn short_read(field: &str, e: io::Error) -> CodecError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::StreamOverflow {
            field: field.to_string(),
        }
    } else {
        CodecError::Io(e)
    }
}

fn mismatch(field: &str, expected: &'static str, found: &Value) -> CodecError {
    CodecError::ValueType {
        field: field.to_string(),
        expected,
        found: found.kind_name(),
    }
}

fn too_large(field: &str, declared: usize, actual: usize) -> CodecError {
    CodecError::ValueTooLarge {
        field: field.to_string(),
        declared,
        actual,
    }
}

/// Minimal number of bytes holding `v` (0 for zero).
fn byte_len(v: u64) -> usize {
    (64 - v.leading_zeros() as usize + 7) / 8
}

fn write_padded<W: Write>(w: &mut W, field: &str, data: &[u8], width: usize) -> Result<(), CodecError> {
    if data.len() > width {
        return Err(too_large(field, width, data.len()));
    }
    w.write_all(data)?;
    if data.len() < width {
        w.write_all(&vec![0u8; width - data.len()])?;
    }
    Ok(())
}

/// Fixed-width text is zero-padded on the wire; padding is not part of the value.
fn trim_padding(mut buf: Vec<u8>) -> Vec<u8> {
    while buf.last() == Some(&0) {
        buf.pop();
    }
    buf
}

fn decode_text(field: &str, raw: Vec<u8>, encoding: Encoding) -> Result<String, CodecError> {
    if encoding == Encoding::Ascii && !raw.is_ascii() {
        return Err(CodecError::Encoding {
            field: field.to_string(),
            reason: "text is not ASCII".to_string(),
        });
    }
    String::from_utf8(raw).map_err(|e| CodecError::Encoding {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

fn encode_text<'a>(field: &str, text: &'a str, encoding: Encoding) -> Result<&'a [u8], CodecError> {
    if encoding == Encoding::Ascii && !text.is_ascii() {
        return Err(CodecError::Encoding {
            field: field.to_string(),
            reason: "text is not ASCII".to_string(),
        });
    }
    Ok(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Case, Config, Kind, SchemaBuilder};
    use crate::value::value_map;
    use std::sync::Arc;

    #[test]
    fn bits_read_msb_first_across_bytes() {
        let data = [0b1011_0011u8, 0b0100_0000];
        let mut r = Cursor::new(&data[..]);
        let mut st = BitReadState::default();
        assert_eq!(st.read(&mut r, 3, "a").unwrap(), 0b101);
        assert_eq!(st.read(&mut r, 7, "b").unwrap(), 0b1_0011_01);
        st.reset();
        assert!(matches!(st.read(&mut r, 1, "c"), Err(CodecError::StreamOverflow { .. })));
    }

    #[test]
    fn bits_write_msb_first_and_flush_pads() {
        let mut out = Vec::new();
        let mut st = BitWriteState::default();
        st.write(&mut out, 3, 0b101).unwrap();
        st.write(&mut out, 7, 0b1001101).unwrap();
        assert_eq!(out, vec![0b1011_0011]);
        st.flush(&mut out).unwrap();
        assert_eq!(out, vec![0b1011_0011, 0b0100_0000]);
        st.flush(&mut out).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn byte_len_boundaries() {
        assert_eq!(byte_len(0), 0);
        assert_eq!(byte_len(0xff), 1);
        assert_eq!(byte_len(0x100), 2);
        assert_eq!(byte_len(u64::MAX), 8);
    }

    #[test]
    fn integer_endianness_on_the_wire() {
        let s = SchemaBuilder::new()
            .integer("le", 2)
            .integer_endian("be", Endianness::Big, 4)
            .build()
            .unwrap();
        let values = value_map([("le", Value::Int(0x0102)), ("be", Value::Int(0x0a0b0c0d))]);
        let bytes = s.to_bytes(&values).unwrap();
        assert_eq!(bytes, vec![0x02, 0x01, 0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(s.parse_bytes(&bytes).unwrap(), values);
    }

    #[test]
    fn integer_too_large_names_field_and_widths() {
        let s = SchemaBuilder::new().integer("a", 1).build().unwrap();
        let err = s.to_bytes(&value_map([("a", Value::Int(256))])).unwrap_err();
        match err {
            CodecError::ValueTooLarge { field, declared, actual } => {
                assert_eq!(field, "a");
                assert_eq!(declared, 1);
                assert_eq!(actual, 2);
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn float_round_trip_both_widths() {
        let s = SchemaBuilder::new()
            .float("f", 4)
            .float_endian("d", Endianness::Big, 8)
            .build()
            .unwrap();
        let values = value_map([("f", Value::Float(1.5)), ("d", Value::Float(-2.25))]);
        let bytes = s.to_bytes(&values).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[4..], &(-2.25f64).to_be_bytes());
        assert_eq!(s.parse_bytes(&bytes).unwrap(), values);
    }

    #[test]
    fn float_accepts_integer_value() {
        let s = SchemaBuilder::new().float("f", 8).build().unwrap();
        let bytes = s.to_bytes(&value_map([("f", Value::Int(3))])).unwrap();
        assert_eq!(s.parse_bytes(&bytes).unwrap()["f"], Value::Float(3.0));
    }

    #[test]
    fn single_float_rejects_out_of_range_double() {
        let s = SchemaBuilder::new().float("f", 4).build().unwrap();
        let err = s.to_bytes(&value_map([("f", Value::Float(1e300))])).unwrap_err();
        assert!(matches!(err, CodecError::ValueTooLarge { declared: 4, .. }));
    }

    #[test]
    fn variable_integer_width_must_be_allowed() {
        let s = SchemaBuilder::new().integer("w", 1).integer("v", "w").build().unwrap();
        let ok = s.parse_bytes(&[2, 0x34, 0x12]).unwrap();
        assert_eq!(ok["v"], Value::Int(0x1234));
        let err = s.parse_bytes(&[3, 0, 0, 0]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::RuntimeLengthRange { ref field, ref dependency, width: 3 } if field == "v" && dependency == "w"
        ));
        let err = s.to_bytes(&value_map([("w", Value::Int(5)), ("v", Value::Int(1))])).unwrap_err();
        assert!(matches!(err, CodecError::RuntimeLengthRange { width: 5, .. }));
    }

    #[test]
    fn variable_float_width_must_be_four_or_eight() {
        let s = SchemaBuilder::new().integer("w", 1).float("v", "w").build().unwrap();
        assert!(matches!(
            s.parse_bytes(&[2, 0, 0]),
            Err(CodecError::RuntimeLengthRange { width: 2, .. })
        ));
        let bytes = [4, 0, 0, 0x80, 0x3f];
        assert_eq!(s.parse_bytes(&bytes).unwrap()["v"], Value::Float(1.0));
    }

    #[test]
    fn bytes_are_zero_padded_and_bounded() {
        let s = SchemaBuilder::new().bytes("b", 4).build().unwrap();
        let bytes = s.to_bytes(&value_map([("b", Value::Bytes(vec![1, 2]))])).unwrap();
        assert_eq!(bytes, vec![1, 2, 0, 0]);
        // Raw bytes are kept verbatim on parse, padding included.
        assert_eq!(s.parse_bytes(&bytes).unwrap()["b"], Value::Bytes(vec![1, 2, 0, 0]));
        let err = s.to_bytes(&value_map([("b", Value::Bytes(vec![0; 5]))])).unwrap_err();
        assert!(matches!(err, CodecError::ValueTooLarge { declared: 4, actual: 5, .. }));
    }

    #[test]
    fn fixed_string_padding_trimmed_on_parse() {
        let s = SchemaBuilder::new().string("name", 8).build().unwrap();
        let values = value_map([("name", Value::from("hey"))]);
        let bytes = s.to_bytes(&values).unwrap();
        assert_eq!(bytes, b"hey\0\0\0\0\0".to_vec());
        assert_eq!(s.parse_bytes(&bytes).unwrap(), values);
    }

    #[test]
    fn null_terminated_string() {
        let s = SchemaBuilder::new().string("s", "null").integer("after", 1).build().unwrap();
        let values = s.parse_bytes(b"abc\0\x07").unwrap();
        assert_eq!(values["s"], Value::from("abc"));
        assert_eq!(values["after"], Value::Int(7));
        let out = s.to_bytes(&values).unwrap();
        assert_eq!(out, b"abc\0\x07".to_vec());
        assert!(matches!(
            s.parse_bytes(b"abc"),
            Err(CodecError::StreamOverflow { ref field }) if field == "s"
        ));
        let bad = value_map([("s", Value::from("a\0b")), ("after", Value::Int(0))]);
        assert!(matches!(s.to_bytes(&bad), Err(CodecError::Encoding { .. })));
    }

    #[test]
    fn length_prefixed_string() {
        let s = SchemaBuilder::new().string_encoded("s", "pascal", Encoding::Ascii).build().unwrap();
        let bytes = s.to_bytes(&value_map([("s", Value::from("example.com"))])).unwrap();
        assert_eq!(bytes[0], 11);
        assert_eq!(&bytes[1..], b"example.com");
        assert_eq!(s.parse_bytes(&bytes).unwrap()["s"], Value::from("example.com"));
        let long = "x".repeat(256);
        assert!(matches!(
            s.to_bytes(&value_map([("s", Value::from(long))])),
            Err(CodecError::ValueTooLarge { declared: 255, actual: 256, .. })
        ));
    }

    #[test]
    fn ascii_encoding_rejects_non_ascii() {
        let s = SchemaBuilder::new().string_encoded("s", 4, Encoding::Ascii).build().unwrap();
        assert!(matches!(
            s.to_bytes(&value_map([("s", Value::from("é"))])),
            Err(CodecError::Encoding { .. })
        ));
        assert!(matches!(s.parse_bytes(&[0xc3, 0xa9, 0, 0]), Err(CodecError::Encoding { .. })));
        let utf8 = SchemaBuilder::new().string("s", 4).build().unwrap();
        assert_eq!(utf8.parse_bytes(&[0xc3, 0xa9, 0, 0]).unwrap()["s"], Value::from("é"));
    }

    #[test]
    fn chunked_reads_match_single_read() {
        let s = SchemaBuilder::new().string("s", 10).build().unwrap();
        let codec = Codec::with_config(CodecConfig { chunk_size: 3 });
        let values = codec.parse_bytes(&s, b"abcdefghij").unwrap();
        assert_eq!(values["s"], Value::from("abcdefghij"));
        assert!(matches!(
            codec.parse_bytes(&s, b"abcdefg"),
            Err(CodecError::StreamOverflow { .. })
        ));
        assert_eq!(Codec::with_config(CodecConfig { chunk_size: 0 }).config().chunk_size, 1);
    }

    #[test]
    fn bits_flushed_by_following_field() {
        let s = SchemaBuilder::new()
            .bits("a", 3)
            .bits("b", 2)
            .integer("n", 1)
            .bits("c", 4)
            .build()
            .unwrap();
        let values = s.parse_bytes(&[0b1010_1111, 0x42, 0b0110_0000]).unwrap();
        assert_eq!(values["a"], Value::Int(0b101));
        assert_eq!(values["b"], Value::Int(0b01));
        assert_eq!(values["n"], Value::Int(0x42));
        assert_eq!(values["c"], Value::Int(0b0110));
        // Unused low bits come back as zero.
        assert_eq!(s.to_bytes(&values).unwrap(), vec![0b1010_1000, 0x42, 0b0110_0000]);
    }

    #[test]
    fn bits_value_too_large() {
        let s = SchemaBuilder::new().bits("a", 3).build().unwrap();
        assert!(matches!(
            s.to_bytes(&value_map([("a", Value::Int(8))])),
            Err(CodecError::ValueTooLarge { declared: 3, actual: 4, .. })
        ));
    }

    #[test]
    fn bits_with_reference_width() {
        let s = SchemaBuilder::new().integer("n", 1).bits("v", "n").build().unwrap();
        assert_eq!(s.parse_bytes(&[12, 0xab, 0xc0]).unwrap()["v"], Value::Int(0xabc));
        assert!(matches!(
            s.parse_bytes(&[65, 0]),
            Err(CodecError::RuntimeLengthRange { width: 65, .. })
        ));
        assert!(matches!(
            s.parse_bytes(&[0]),
            Err(CodecError::RuntimeLengthRange { width: 0, .. })
        ));
    }

    #[test]
    fn array_of_bits_shares_accumulator() {
        let s = SchemaBuilder::new()
            .array("flags", 4, Kind::Bits, Config::Width(Width::Fixed(2)))
            .integer("tail", 1)
            .build()
            .unwrap();
        let values = s.parse_bytes(&[0b11_10_01_00, 9]).unwrap();
        assert_eq!(
            values["flags"],
            Value::Array(vec![Value::Int(3), Value::Int(2), Value::Int(1), Value::Int(0)])
        );
        assert_eq!(s.to_bytes(&values).unwrap(), vec![0b11_10_01_00, 9]);
    }

    #[test]
    fn array_count_must_match_values() {
        let s = SchemaBuilder::new()
            .integer("count", 1)
            .array("items", "count", Kind::Integer, Config::Width(Width::Fixed(1)))
            .build()
            .unwrap();
        let values = value_map([
            ("count", Value::Int(2)),
            ("items", Value::Array(vec![Value::Int(1)])),
        ]);
        assert!(matches!(
            s.to_bytes(&values),
            Err(CodecError::CountMismatch { declared: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn array_count_from_stream_does_not_preallocate_unbounded() {
        let s = SchemaBuilder::new()
            .integer("count", 4)
            .array("items", "count", Kind::Integer, Config::Width(Width::Fixed(1)))
            .build()
            .unwrap();
        assert!(matches!(
            s.parse_bytes(&[0xff, 0xff, 0xff, 0xff, 1, 2]),
            Err(CodecError::StreamOverflow { ref field }) if field == "items"
        ));
    }

    #[test]
    fn counted_reader_tracks_consumed_bytes() {
        let data = [1u8, 2, 3, 4, 5];
        let mut src = Counted::new(Cursor::new(&data[..]));
        let mut buf = [0u8; 3];
        src.read_exact(&mut buf).unwrap();
        assert_eq!(src.consumed, 3);
        src.read_u8().unwrap();
        assert_eq!(src.consumed, 4);
    }

    #[test]
    fn empty_nested_elements_stop_on_huge_count() {
        let empty = Arc::new(SchemaBuilder::new().build().unwrap());
        let s = SchemaBuilder::new()
            .integer("count", 4)
            .array("items", "count", Kind::Nested, Config::Nested(Arc::clone(&empty)))
            .build()
            .unwrap();
        assert!(matches!(
            s.parse_bytes(&[0xff, 0xff, 0xff, 0xff]),
            Err(CodecError::ZeroWidthElements { ref field, count: 0xffff_ffff }) if field == "items"
        ));
        let values = s.parse_bytes(&[2, 0, 0, 0]).unwrap();
        assert_eq!(
            values["items"],
            Value::Array(vec![Value::Record(ValueMap::new()), Value::Record(ValueMap::new())])
        );
    }

    #[test]
    fn union_dispatch_and_missing_case() {
        let cases = vec![
            Case::new(1, Kind::Integer, Config::Width(Width::Fixed(2))),
            Case::new(2, Kind::String, Config::Text(StringWidth::LengthPrefixed, Encoding::Ascii)),
        ];
        let s = SchemaBuilder::new().integer("tag", 1).union("body", "tag", cases).build().unwrap();
        assert_eq!(s.parse_bytes(&[1, 0x01, 0x02]).unwrap()["body"], Value::Int(0x0201));
        assert_eq!(s.parse_bytes(&[2, 2, b'h', b'i']).unwrap()["body"], Value::from("hi"));
        assert!(matches!(
            s.parse_bytes(&[9, 0, 0]),
            Err(CodecError::UnionDispatch { discriminant: 9, .. })
        ));
        let values = value_map([("tag", Value::Int(9)), ("body", Value::Int(1))]);
        assert!(matches!(s.to_bytes(&values), Err(CodecError::UnionDispatch { discriminant: 9, .. })));
    }

    #[test]
    fn union_branch_transform_applied() {
        let cases = vec![Case::new(1, Kind::Bytes, Config::Width(Width::Fixed(2)))
            .with_transform(|v| match v {
                Value::Bytes(b) => Value::Int(b.len() as u64),
                other => other,
            })];
        let s = SchemaBuilder::new().integer("tag", 1).union("u", "tag", cases).build().unwrap();
        assert_eq!(s.parse_bytes(&[1, 7, 7]).unwrap()["u"], Value::Int(2));
    }

    #[test]
    fn serialize_type_mismatch() {
        let s = SchemaBuilder::new().integer("a", 1).string("b", 2).build().unwrap();
        let values = value_map([("a", Value::from("x")), ("b", Value::from("y"))]);
        assert!(matches!(
            s.to_bytes(&values),
            Err(CodecError::ValueType { expected: "integer", found: "text", .. })
        ));
    }

    #[test]
    fn serialize_unknown_field_writes_nothing() {
        let s = SchemaBuilder::new().integer("a", 1).build().unwrap();
        let values = value_map([("a", Value::Int(1)), ("zzz", Value::Int(2))]);
        let mut out = Vec::new();
        let err = s.serialize(&values, &mut out).unwrap_err();
        assert!(matches!(err, CodecError::UnknownField(n) if n == "zzz"));
        assert!(out.is_empty());
    }

    #[test]
    fn serialize_missing_field() {
        let s = SchemaBuilder::new().integer("a", 1).integer("b", 1).build().unwrap();
        let err = s.to_bytes(&value_map([("a", Value::Int(1))])).unwrap_err();
        assert!(matches!(err, CodecError::MissingField(n) if n == "b"));
    }

    #[test]
    fn serialize_error_keeps_earlier_bytes_on_stream() {
        let s = SchemaBuilder::new().integer("a", 1).integer("b", 1).build().unwrap();
        let values = value_map([("a", Value::Int(7)), ("b", Value::Int(300))]);
        let mut out = Vec::new();
        assert!(s.serialize(&values, &mut out).is_err());
        assert_eq!(out, vec![7]);
    }

    #[test]
    fn nested_record_round_trip() {
        let inner = std::sync::Arc::new(
            SchemaBuilder::new().integer("x", 1).integer("y", 1).build().unwrap(),
        );
        let s = SchemaBuilder::new()
            .nested("point", inner)
            .bytes("tail", "point.y")
            .build()
            .unwrap();
        let values = s.parse_bytes(&[5, 2, 0xaa, 0xbb]).unwrap();
        assert_eq!(
            values["point"],
            Value::Record(value_map([("x", Value::Int(5)), ("y", Value::Int(2))]))
        );
        assert_eq!(values["tail"], Value::Bytes(vec![0xaa, 0xbb]));
        assert_eq!(s.to_bytes(&values).unwrap(), vec![5, 2, 0xaa, 0xbb]);
    }

    #[test]
    fn nested_expects_record_value() {
        let inner = std::sync::Arc::new(SchemaBuilder::new().integer("x", 1).build().unwrap());
        let s = SchemaBuilder::new().nested("n", inner).build().unwrap();
        assert!(matches!(
            s.to_bytes(&value_map([("n", Value::Int(1))])),
            Err(CodecError::ValueType { expected: "record", .. })
        ));
    }

    #[test]
    fn transform_output_used_for_dependency_fails_cleanly() {
        let s = SchemaBuilder::new()
            .integer("len", 1)
            .transform(|v| Value::Text(format!("{:?}", v)))
            .bytes("data", "len")
            .build()
            .unwrap();
        assert!(matches!(
            s.parse_bytes(&[1, 0]),
            Err(CodecError::DependencyType { ref path, found: "text" }) if path == "len"
        ));
    }

    #[test]
    fn io_errors_other_than_eof_pass_through() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            }
        }
        let s = SchemaBuilder::new().integer("a", 1).build().unwrap();
        assert!(matches!(s.parse(&mut Broken), Err(CodecError::Io(_))));
    }
}
