//! # structwire: schema-driven binary structure codec
//!
//! Describe a binary layout once as an ordered list of `(name, kind, config)` declarations,
//! compile it into an immutable [`Schema`], then use it to parse byte streams into ordered
//! [`ValueMap`]s and serialize them back with byte-exact layout.
//!
//! ## Field kinds
//!
//! - `integer`: unsigned, 1/2/4/8 bytes, little or big endian (`host`/`network` resolved at compile)
//! - `float`: IEEE-754, 4 or 8 bytes
//! - `bytes`: raw blob, zero-padded to width on serialize
//! - `bits`: packed MSB-first; consecutive bits fields share bytes
//! - `string`: fixed width, width from a field, null-terminated (`"null"`) or one-byte
//!   length prefix (`"pascal"`)
//! - `array`: fixed count or count from a field, one element declaration for every slot
//! - `union`: branch chosen by the value of an earlier integer/bits field
//! - `nested`: another compiled schema
//!
//! Any width or count may name an earlier integer/bits field (`"len"`, or `"header.len"`
//! through a nested field). References are checked when the schema compiles and resolved
//! per call.
//!
//! ## Example
//!
//! ```
//! use structwire::{value_map, SchemaBuilder, Value};
//!
//! let schema = SchemaBuilder::new()
//!     .integer("count", 1)
//!     .array("items", "count", structwire::Kind::Integer, structwire::Config::Width(1.into()))
//!     .build()
//!     .unwrap();
//!
//! let values = schema.parse_bytes(&[0x03, 0x0a, 0x0b, 0x0c]).unwrap();
//! assert_eq!(
//!     values,
//!     value_map([
//!         ("count", Value::Int(3)),
//!         ("items", Value::Array(vec![Value::Int(10), Value::Int(11), Value::Int(12)])),
//!     ])
//! );
//! assert_eq!(schema.to_bytes(&values).unwrap(), vec![0x03, 0x0a, 0x0b, 0x0c]);
//! ```
//!
//! The `socks5` module and the `socks5_proxy` binary show a complete consumer.

pub mod codec;
pub mod context;
pub mod dump;
pub mod field;
pub mod length;
pub mod schema;
pub mod socks5;
pub mod value;

pub use codec::{Codec, CodecConfig, CodecError};
pub use context::Context;
pub use field::{Encoding, Endianness, FieldKind, FieldSpec, StringWidth, Transform, Width};
pub use length::{static_len, IndeterminateLength};
pub use schema::{Case, Config, Declaration, Kind, Schema, SchemaBuilder, SchemaError};
pub use value::{value_map, Value, ValueMap};
