//! Per-call value resolution: maps already-produced field names to values so later
//! fields can resolve variable widths, counts and union discriminants.
//!
//! A [`Context`] lives for exactly one parse or serialize call at one schema level and is
//! never stored on the [`Schema`](crate::schema::Schema). On parse it owns the map being
//! built; on serialize it borrows the caller's map.

use crate::codec::CodecError;
use crate::field::PATH_SEPARATOR;
use crate::value::{Value, ValueMap};
use std::borrow::Cow;

#[derive(Debug, Default)]
pub struct Context<'a> {
    values: Cow<'a, ValueMap>,
}

impl Context<'static> {
    pub fn new() -> Self {
        Context {
            values: Cow::Owned(ValueMap::new()),
        }
    }
}

impl<'a> Context<'a> {
    /// Resolve against a caller-supplied map (serialize).
    pub fn borrowed(values: &'a ValueMap) -> Self {
        Context {
            values: Cow::Borrowed(values),
        }
    }

    /// Register a finished top-level field.
    pub fn record(&mut self, name: impl Into<String>, value: Value) {
        self.values.to_mut().insert(name.into(), value);
    }

    /// Integer value at `path`: a plain name, or dot-separated segments descending into
    /// nested records.
    pub fn resolve(&self, path: &str) -> Result<u64, CodecError> {
        let mut segments = path.split(PATH_SEPARATOR);
        let first = segments.next().unwrap_or_default();
        let mut current = self
            .values
            .get(first)
            .ok_or_else(|| CodecError::Lookup(path.to_string()))?;
        for segment in segments {
            current = current
                .as_record()
                .and_then(|m| m.get(segment))
                .ok_or_else(|| CodecError::Lookup(path.to_string()))?;
        }
        current.as_u64().ok_or_else(|| CodecError::DependencyType {
            path: path.to_string(),
            found: current.kind_name(),
        })
    }

    pub fn values(&self) -> &ValueMap {
        &self.values
    }

    pub fn into_values(self) -> ValueMap {
        self.values.into_owned()
    }
}
