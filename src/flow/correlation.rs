//! MQTT v5 Correlation Data lookup in a raw PUBLISH packet.
//!
//! The dissector does not always expose the property, so the Properties block
//! is walked by hand. Every read is bounds checked and any inconsistency ends
//! the lookup with `None`: correlation data is optional metadata and never
//! makes a packet unusable.

use crate::flow::mqtt::ControlType;

/// Property identifier of Correlation Data.
pub const CORRELATION_DATA: u8 = 0x09;

/// A variable byte integer is at most 4 bytes long.
const MAX_VBI_BYTES: usize = 4;

/// How a property value is laid out, from MQTT v5 section 2.2.2.2
#[derive(Debug, PartialEq)]
enum PropertyKind {
    Byte,
    TwoByteInteger,
    FourByteInteger,
    VariableByteInteger,
    LengthPrefixed, // UTF-8 string or binary data
    StringPair,
}

fn property_kind(id: u8) -> Option<PropertyKind> {
    let kind = match id {
        0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => PropertyKind::Byte,
        0x13 | 0x21 | 0x22 | 0x23 => PropertyKind::TwoByteInteger,
        0x02 | 0x11 | 0x18 | 0x27 => PropertyKind::FourByteInteger,
        0x0B => PropertyKind::VariableByteInteger,
        0x03 | 0x08 | 0x09 | 0x12 | 0x15 | 0x16 | 0x1A | 0x1C | 0x1F => PropertyKind::LengthPrefixed,
        0x26 => PropertyKind::StringPair,
        _ => return None,
    };
    Some(kind)
}

/// Returns the Correlation Data value of a PUBLISH packet, if it carries one.
///
/// `payload` starts at the MQTT fixed header. Only PUBLISH is addressed; the
/// Packet Identifier sits between the topic and the properties when `qos` is 1 or 2.
pub fn find_correlation_data(payload: &[u8], control_type: ControlType, qos: u8) -> Option<Vec<u8>> {
    if control_type != ControlType::Publish {
        return None;
    }

    let mut reader = Reader::new(payload);
    reader.skip(1)?;
    let remaining = reader.variable_byte_integer()? as usize;
    // stay inside this packet when the segment holds several
    let mut packet = Reader::new(reader.take(remaining.min(reader.left()))?);

    let topic_length = packet.u16()? as usize;
    packet.skip(topic_length)?;
    if qos > 0 {
        packet.skip(2)?;
    }

    let properties_length = packet.variable_byte_integer()? as usize;
    let properties = packet.take(properties_length)?;

    find_in_properties(properties)
}

fn find_in_properties(properties: &[u8]) -> Option<Vec<u8>> {
    let mut reader = Reader::new(properties);

    while reader.left() > 0 {
        let id = reader.u8()?;
        match property_kind(id)? {
            PropertyKind::LengthPrefixed if id == CORRELATION_DATA => {
                let length = reader.u16()? as usize;
                return reader.take(length).map(|value| value.to_vec());
            }
            PropertyKind::Byte => reader.skip(1)?,
            PropertyKind::TwoByteInteger => reader.skip(2)?,
            PropertyKind::FourByteInteger => reader.skip(4)?,
            PropertyKind::VariableByteInteger => {
                reader.variable_byte_integer()?;
            }
            PropertyKind::LengthPrefixed => {
                let length = reader.u16()? as usize;
                reader.skip(length)?;
            }
            PropertyKind::StringPair => {
                for _ in 0..2 {
                    let length = reader.u16()? as usize;
                    reader.skip(length)?;
                }
            }
        }
    }

    None
}

/// Decodes a variable byte integer, returning the value and the bytes it used.
pub fn decode_variable_byte_integer(buf: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;

    for (i, byte) in buf.iter().take(MAX_VBI_BYTES).enumerate() {
        value |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }

    None
}

/// Cursor over a byte slice where every read may fail.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    #[inline]
    fn left(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.left() < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn variable_byte_integer(&mut self) -> Option<u32> {
        let (value, size) = decode_variable_byte_integer(&self.buf[self.pos..])?;
        self.pos += size;
        Some(value)
    }
}
