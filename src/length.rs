//! Static byte length of schemas whose every field has a fixed width.
//!
//! Bits are counted the way the codec consumes them: a run of consecutive `bits` fields
//! (or a fixed array of them) is rounded up to whole bytes when the next non-bits field
//! or the end of the schema flushes the accumulator.

use crate::field::{FieldKind, FieldSpec, StringWidth, Width};
use crate::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("the schema uses variable lengths, so its length cannot be determined without parsing")]
pub struct IndeterminateLength;

/// Space taken by one field: whole bytes, or bits that join the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extent {
    Bytes(usize),
    Bits(usize),
}

/// Sum of fixed field widths plus the rounded-up bit runs. A total that overflows `usize`
/// is reported as indeterminate.
pub fn static_len(schema: &Schema) -> Result<usize, IndeterminateLength> {
    if schema.has_variable_length() {
        return Err(IndeterminateLength);
    }
    let mut total = 0usize;
    let mut pending_bits = 0usize;
    for field in schema.fields() {
        if !field.is_bits() {
            total = add(total, pending_bits.div_ceil(8))?;
            pending_bits = 0;
        }
        match extent(field)? {
            Extent::Bytes(n) => total = add(total, n)?,
            Extent::Bits(n) => pending_bits = add(pending_bits, n)?,
        }
    }
    add(total, pending_bits.div_ceil(8))
}

fn extent(field: &FieldSpec) -> Result<Extent, IndeterminateLength> {
    let fixed = |w: &Width| match w {
        Width::Fixed(n) => Ok(*n),
        Width::Ref(_) => Err(IndeterminateLength),
    };
    Ok(match &field.kind {
        FieldKind::Integer { width, .. }
        | FieldKind::Float { width, .. }
        | FieldKind::Bytes { width } => Extent::Bytes(fixed(width)?),
        FieldKind::Bits { width } => Extent::Bits(fixed(width)?),
        FieldKind::String { width, .. } => match width {
            StringWidth::Fixed(n) => Extent::Bytes(*n),
            _ => return Err(IndeterminateLength),
        },
        FieldKind::Array { count, element } => {
            let n = fixed(count)?;
            match extent(element)? {
                Extent::Bytes(b) => Extent::Bytes(mul(n, b)?),
                Extent::Bits(b) => Extent::Bits(mul(n, b)?),
            }
        }
        FieldKind::Union { .. } => return Err(IndeterminateLength),
        FieldKind::Nested { schema } => Extent::Bytes(static_len(schema)?),
    })
}

// A length that does not fit in usize cannot be determined either.
fn add(a: usize, b: usize) -> Result<usize, IndeterminateLength> {
    a.checked_add(b).ok_or(IndeterminateLength)
}

fn mul(a: usize, b: usize) -> Result<usize, IndeterminateLength> {
    a.checked_mul(b).ok_or(IndeterminateLength)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Config, Kind, SchemaBuilder};
    use std::sync::Arc;

    #[test]
    fn sums_fixed_widths() {
        let s = SchemaBuilder::new()
            .integer("a", 1)
            .integer("b", 2)
            .integer("c", 4)
            .build()
            .unwrap();
        assert_eq!(s.static_len(), Ok(7));
    }

    #[test]
    fn bits_rounded_up_per_run() {
        let s = SchemaBuilder::new().bits("a", 4).bits("b", 4).bits("c", 1).build().unwrap();
        assert_eq!(s.static_len(), Ok(2));
        let s = SchemaBuilder::new()
            .bits("a", 3)
            .integer("n", 1)
            .bits("b", 3)
            .build()
            .unwrap();
        assert_eq!(s.static_len(), Ok(3));
    }

    #[test]
    fn nested_and_arrays_contribute() {
        let inner = Arc::new(SchemaBuilder::new().integer("x", 2).string("s", 6).build().unwrap());
        let s = SchemaBuilder::new()
            .nested("inner", inner)
            .array("v", 3, Kind::Integer, Config::Width(Width::Fixed(4)))
            .array("f", 5, Kind::Bits, Config::Width(Width::Fixed(3)))
            .build()
            .unwrap();
        assert_eq!(s.static_len(), Ok(8 + 12 + 2));
    }

    #[test]
    fn variable_schema_is_indeterminate() {
        let s = SchemaBuilder::new().integer("a", 1).string("s", "null").build().unwrap();
        assert_eq!(s.static_len(), Err(IndeterminateLength));
        let s = SchemaBuilder::new().integer("n", 1).bytes("b", "n").build().unwrap();
        assert_eq!(s.static_len(), Err(IndeterminateLength));
    }

    #[test]
    fn overflowing_length_is_indeterminate() {
        let s = SchemaBuilder::new()
            .array("huge", usize::MAX, Kind::Integer, Config::Width(Width::Fixed(2)))
            .build()
            .unwrap();
        assert_eq!(s.static_len(), Err(IndeterminateLength));
        let s = SchemaBuilder::new()
            .bytes("a", usize::MAX)
            .integer("b", 1)
            .build()
            .unwrap();
        assert_eq!(s.static_len(), Err(IndeterminateLength));
    }

    #[test]
    fn empty_schema_has_zero_length() {
        let s = SchemaBuilder::new().build().unwrap();
        assert_eq!(s.static_len(), Ok(0));
    }
}
