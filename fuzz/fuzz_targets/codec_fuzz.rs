//! Codec fuzz target: feed arbitrary bytes to the SOCKS5 message schemas and to a
//! general schema mixing bits runs, nested records, arrays of arrays, count-referenced
//! arrays and a union with a union branch.
//! Parsing must not panic; it returns Ok(values) or a CodecError. Whatever parses is
//! serialized again, which must not panic either.
//! Build with: cargo fuzz run codec_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;
#[cfg(fuzzing)]
use std::sync::Arc;
#[cfg(fuzzing)]
use structwire::{Case, Config, Encoding, Endianness, Kind, Schema, SchemaBuilder, StringWidth, Width};

#[cfg(fuzzing)]
fn mixed_schema() -> Option<Schema> {
    let header = Arc::new(
        SchemaBuilder::new()
            .bits("version", 3)
            .bits("flags", 5)
            .integer("len", 1)
            .build()
            .ok()?,
    );
    let row = Config::Array {
        count: Width::Fixed(2),
        element_kind: Kind::Bits,
        element_config: Box::new(Config::Width(Width::Fixed(4))),
    };
    let inner = Config::Union {
        discriminant: "header.flags".to_string(),
        cases: vec![
            Case::new(0, Kind::Float, Config::Endian(Endianness::Big, Width::Fixed(4))),
            Case::new(1, Kind::String, Config::Text(StringWidth::NullTerminated, Encoding::Ascii)),
        ],
    };
    SchemaBuilder::new()
        .nested("header", header)
        .array("grid", 2, Kind::Array, row)
        .integer_endian("count", Endianness::Big, 2)
        .array("items", "count", Kind::String, Config::Text(StringWidth::Ref("header.len".to_string()), Encoding::Utf8))
        .union(
            "body",
            "header.version",
            vec![
                Case::new(0, Kind::Union, inner),
                Case::new(1, Kind::Bytes, Config::Width(Width::from("header.len"))),
                Case::new(2, Kind::Bits, Config::Width(Width::from("header.len"))),
            ],
        )
        .build()
        .ok()
}

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let schemas = match structwire::socks5::Socks5Schemas::new() {
        Ok(s) => s,
        Err(_) => return,
    };
    for schema in [
        &schemas.client_handshake,
        &schemas.server_handshake,
        &schemas.server_response,
    ] {
        if let Ok(values) = schema.parse_bytes(data) {
            let _ = schema.to_bytes(&values);
        }
    }
    // Address transforms turn bytes into text, so this one is parse-only.
    let _ = schemas.client_request.parse_bytes(data);

    if let Some(schema) = mixed_schema() {
        if let Ok(values) = schema.parse_bytes(data) {
            let _ = schema.to_bytes(&values);
        }
    }
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run codec_fuzz");
}
