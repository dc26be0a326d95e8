use serde_json::{Map, Value};
use std::fmt;
use std::io::BufRead;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SourceError;

/// One dissected packet as emitted by `tshark -T ek` (or the dotted `-T json` layout, one object per line).
///
/// Only the layers map and the capture time are kept; everything else the
/// dissector outputs is ignored.
#[derive(Debug, Clone)]
pub struct Packet {
    timestamp_ns: u64,
    layers: Map<String, Value>,
}

impl Packet {
    /// Returns `None` for lines that carry no layers, like the bulk index lines written by `-T ek`.
    pub fn from_json(value: Value) -> Option<Self> {
        let mut object = match value {
            Value::Object(object) => object,
            _ => return None,
        };

        // -T json nests everything below _source
        if let Some(Value::Object(source)) = object.remove("_source") {
            object = source;
        }

        let layers = match object.remove("layers") {
            Some(Value::Object(layers)) => layers,
            _ => return None,
        };

        let mut packet = Packet { timestamp_ns: 0, layers };
        let frame_epoch = packet.layer("frame").and_then(|frame| frame.field("frame.time_epoch"));
        let timestamp_ns = frame_epoch
            .and_then(|epoch| parse_epoch_seconds(&epoch))
            .or_else(|| object.get("timestamp").and_then(value_to_string).and_then(|ms| ms.parse::<u64>().ok()).map(|ms| ms * 1_000_000))
            .unwrap_or_else(now_ns);
        packet.timestamp_ns = timestamp_ns;

        Some(packet)
    }

    pub fn new(timestamp_ns: u64, layers: Map<String, Value>) -> Self {
        Packet { timestamp_ns, layers }
    }

    /// Capture time in nanoseconds since the UNIX epoch.
    #[inline]
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn has_layer(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    pub fn layer<'a>(&'a self, name: &'a str) -> Option<Layer<'a>> {
        match self.layers.get(name)? {
            Value::Object(fields) => Some(Layer { name, fields }),
            // a segment carrying several messages of the same protocol
            Value::Array(list) => match list.first()? {
                Value::Object(fields) => Some(Layer { name, fields }),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&String> = self.layers.keys().collect();
        write!(f, "ts: {}ns, layers: {:?}", self.timestamp_ns, names)
    }
}

/// View on the named fields of one protocol layer.
pub struct Layer<'a> {
    name: &'a str,
    fields: &'a Map<String, Value>,
}

impl<'a> Layer<'a> {
    /// Looks a field up by its Wireshark name (`ip.src`), falling back to the
    /// flattened key written by `-T ek` (`ip_ip_src`).
    pub fn field(&self, name: &str) -> Option<String> {
        if let Some(value) = self.fields.get(name) {
            return value_to_string(value);
        }

        let flattened = format!("{}_{}", self.name, name.replace('.', "_"));
        self.fields.get(&flattened).and_then(value_to_string)
    }

    /// Decimal or `0x` prefixed integer field.
    pub fn field_u64(&self, name: &str) -> Option<Result<u64, String>> {
        self.field(name).map(|raw| {
            let parsed = match raw.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => raw.parse::<u64>(),
            };
            parsed.map_err(|e| format!("{:?} is not an integer: {}", raw, e))
        })
    }

    /// Bytes field rendered as hex, with or without `:` separators.
    pub fn field_bytes(&self, name: &str) -> Option<Result<Vec<u8>, String>> {
        self.field(name).map(|raw| {
            let compact: String = raw.chars().filter(|c| *c != ':').collect();
            hex::decode(&compact).map_err(|e| format!("{} is not a hex string: {}", name, e))
        })
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1".to_string() } else { "0".to_string() }),
        Value::Array(list) => list.first().and_then(value_to_string),
        _ => None,
    }
}

/// Parses `seconds.fraction` without going through a float.
fn parse_epoch_seconds(raw: &str) -> Option<u64> {
    let (secs, frac) = match raw.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (raw, ""),
    };

    let secs = secs.parse::<u64>().ok()?;
    let mut nanos = 0u64;
    for (i, digit) in frac.chars().chain(std::iter::repeat('0')).take(9).enumerate() {
        let d = digit.to_digit(10)? as u64;
        nanos += d * 10u64.pow(8 - i as u32);
    }

    secs.checked_mul(1_000_000_000)?.checked_add(nanos)
}

fn now_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

/// Reads newline delimited packets from any buffered reader, in order.
pub struct PacketSource<R> {
    reader: R,
    line: usize,
    buf: String,
}

impl<R: BufRead> PacketSource<R> {
    pub fn new(reader: R) -> Self {
        PacketSource { reader, line: 0, buf: String::new() }
    }
}

impl<R: BufRead> Iterator for PacketSource<R> {
    type Item = Result<Packet, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => self.line += 1,
                Err(e) => return Some(Err(SourceError::Io(e))),
            }

            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(source) => return Some(Err(SourceError::Json { line: self.line, source })),
            };

            if let Some(packet) = Packet::from_json(value) {
                return Some(Ok(packet));
            }
        }
    }
}
