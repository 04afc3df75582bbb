//! Format parsed values for display (text dump with indentation for nested records).

use crate::value::{Value, ValueMap};

/// Space-separated lowercase hex, e.g. `de ad be ef`.
pub fn hex_string(b: &[u8]) -> String {
    b.iter().map(|x| format!("{:02x}", x)).collect::<Vec<_>>().join(" ")
}

/// One-line rendering of a scalar; compound values are summarized.
pub fn format_scalar(v: &Value) -> String {
    match v {
        Value::Int(x) => format!("{}", x),
        Value::Float(x) => format!("{}", x),
        Value::Text(s) => format!("{:?}", s),
        Value::Bytes(b) => format!("hex({})", hex_string(b)),
        Value::Array(items) => format!("[{} items]", items.len()),
        Value::Record(m) => format!("{{{} fields}}", m.len()),
    }
}

/// Multi-line dump of a record, one `name: value` per line, nested records indented.
pub fn dump_values(values: &ValueMap) -> String {
    let mut lines = Vec::new();
    dump_map(values, 0, &mut lines);
    lines.join("\n")
}

fn dump_map(values: &ValueMap, indent: usize, lines: &mut Vec<String>) {
    for (name, v) in values {
        dump_entry(name, v, indent, lines);
    }
}

fn dump_entry(label: &str, v: &Value, indent: usize, lines: &mut Vec<String>) {
    let pad = "  ".repeat(indent);
    match v {
        Value::Record(m) => {
            lines.push(format!("{}{}: {{", pad, label));
            dump_map(m, indent + 1, lines);
            lines.push(format!("{}}}", pad));
        }
        Value::Array(items) if items.iter().all(is_scalar) => {
            let parts: Vec<String> = items.iter().map(format_scalar).collect();
            lines.push(format!("{}{}: [{}]", pad, label, parts.join(", ")));
        }
        Value::Array(items) => {
            lines.push(format!("{}{}: [", pad, label));
            for (i, item) in items.iter().enumerate() {
                dump_entry(&format!("[{}]", i), item, indent + 1, lines);
            }
            lines.push(format!("{}]", pad));
        }
        scalar => lines.push(format!("{}{}: {}", pad, label, format_scalar(scalar))),
    }
}

fn is_scalar(v: &Value) -> bool {
    !matches!(v, Value::Array(_) | Value::Record(_))
}
