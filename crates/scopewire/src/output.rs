use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use scopewire::daemon::Endpoints;
use scopewire_buffer::ArrayData;
use scopewire_rpc::CommandDescriptor;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn print_table(header: Vec<&str>, rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    for row in rows {
        table.add_row(row);
    }
    println!("{table}");
}

/// A `value` reply.
pub fn print_value(value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(value),
        OutputFormat::Table => print_table(vec!["VALUE"], vec![vec![value_text(value)]]),
        OutputFormat::Pretty => println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        ),
        OutputFormat::Raw => println!("{}", value_text(value)),
    }
}

/// A `binary` reply.
pub fn print_binary(data: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Raw => print_raw(data),
        OutputFormat::Json => print_json(&serde_json::json!({ "binary_size": data.len() })),
        OutputFormat::Table => print_table(vec!["BINARY"], vec![vec![format!("{} bytes", data.len())]]),
        OutputFormat::Pretty => println!("<binary {} bytes>", data.len()),
    }
}

#[derive(Serialize)]
struct ArrayOutput<'a> {
    dtype: &'a scopewire_buffer::Dtype,
    shape: &'a [usize],
    size: usize,
    via: &'a str,
    buffer: Option<&'a str>,
}

/// An array fetched through a buffer or packed bytes.
pub fn print_array(array: &ArrayData, fetcher: &str, format: OutputFormat) {
    let meta = array.meta();
    match format {
        OutputFormat::Raw => print_raw(array.bytes()),
        OutputFormat::Json => print_json(&ArrayOutput {
            dtype: &meta.dtype,
            shape: &meta.shape,
            size: array.bytes().len(),
            via: fetcher,
            buffer: array.buffer_name(),
        }),
        OutputFormat::Table => print_table(
            vec!["DTYPE", "SHAPE", "SIZE", "VIA"],
            vec![vec![
                dtype_name(meta),
                format!("{:?}", meta.shape),
                array.bytes().len().to_string(),
                fetcher.to_string(),
            ]],
        ),
        OutputFormat::Pretty => println!(
            "dtype={} shape={:?} size={} via={}",
            dtype_name(meta),
            meta.shape,
            array.bytes().len(),
            fetcher
        ),
    }
}

pub fn print_descriptors(descriptors: &[CommandDescriptor], format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(&descriptors),
        OutputFormat::Table => print_table(
            vec!["PATH", "SIGNATURE", "DOC"],
            descriptors
                .iter()
                .map(|d| vec![d.path.clone(), d.signature.render(), d.doc.clone()])
                .collect(),
        ),
        OutputFormat::Pretty => {
            for d in descriptors {
                if d.doc.is_empty() {
                    println!("{}{}", d.path, d.signature.render());
                } else {
                    println!("{}{}  # {}", d.path, d.signature.render(), d.doc);
                }
            }
        }
    }
}

#[derive(Serialize)]
struct UpdateOutput<'a> {
    name: &'a str,
    value: &'a Value,
    timestamp: String,
}

pub fn print_update(name: &str, value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&UpdateOutput {
            name,
            value,
            timestamp: now_unix_seconds(),
        }),
        OutputFormat::Table => print_table(
            vec!["PROPERTY", "VALUE"],
            vec![vec![name.to_string(), value_text(value)]],
        ),
        OutputFormat::Pretty => println!("{name} = {}", value_text(value)),
        OutputFormat::Raw => println!("{name} {value}"),
    }
}

pub fn print_endpoints(endpoints: &Endpoints, format: OutputFormat) {
    let rows = [
        ("rpc", &endpoints.rpc),
        ("interrupt", &endpoints.interrupt),
        ("property", &endpoints.property),
        ("heartbeat", &endpoints.heartbeat),
    ];
    match format {
        OutputFormat::Json => {
            let map: serde_json::Map<String, Value> = rows
                .iter()
                .map(|(name, endpoint)| (name.to_string(), Value::String(endpoint.to_string())))
                .collect();
            print_json(&map);
        }
        OutputFormat::Table => print_table(
            vec!["SERVICE", "ENDPOINT"],
            rows.iter()
                .map(|(name, endpoint)| vec![name.to_string(), endpoint.to_string()])
                .collect(),
        ),
        OutputFormat::Pretty | OutputFormat::Raw => {
            for (name, endpoint) in rows {
                println!("{name}={endpoint}");
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn dtype_name(meta: &scopewire_buffer::BufferMeta) -> String {
    serde_json::to_value(meta.dtype)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", meta.dtype))
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
