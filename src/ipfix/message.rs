use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use core::convert::TryInto;
use num_traits::FromPrimitive;
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::ExportError;
use crate::ipfix::template::{DataType, FieldType, IeCatalog, InformationElement, Template, MAX_STRING_LENGTH, VARIABLE_LENGTH};

pub const VERSION: u16 = 10;

/// Seconds between the NTP era 0 epoch (1900) and the UNIX epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/******************************** MSG HEADER ********************************/

/// from https://tools.ietf.org/html/rfc7011
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |       Version Number          |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Export Time                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Sequence Number                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Observation Domain ID                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```

#[derive(Debug, PartialEq)]
pub struct Header {
    pub version: u16,     // Version of IPFIX to which this Message conforms
    pub length: u16,      // Total length of the IPFIX Message, measured in octets, including Message Header and Set(s).
    pub export_time: u32, // Time at which the IPFIX Message Header leaves the Exporter expressed in seconds since the UNIX epoch
    pub seq_number: u32,  // Incremental sequence counter modulo 2^32 of all IPFIX Data Record sent in the current stream from the current Observation Domain by the Exporting Process.
    pub domain_id: u32,   // Identifier used to uniquely identify to the Collecting Process the Observation Domain that metered the Flows
}

impl Header {
    pub const SIZE: usize = 16;

    pub fn read(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < Self::SIZE {
            return Err(format!("Not enough space in buffer to read the IPFIX HEADER_SIZE, required {} but received {}", Self::SIZE, buf.len()));
        }

        Ok(Header {
            version: u16::from_be_bytes(buf[0..2].try_into().unwrap()),
            length: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
            export_time: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            seq_number: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            domain_id: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }

    /// Writes the header over the first 16 bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        BigEndian::write_u16(&mut buf[0..2], self.version);
        BigEndian::write_u16(&mut buf[2..4], self.length);
        BigEndian::write_u32(&mut buf[4..8], self.export_time);
        BigEndian::write_u32(&mut buf[8..12], self.seq_number);
        BigEndian::write_u32(&mut buf[12..16], self.domain_id);
    }
}

/******************************** SET HEADER ********************************/

/// from https://tools.ietf.org/html/rfc7011
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          Set ID               |          Length               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```

#[derive(Debug)]
pub struct SetHeader {
    pub id: u16,     // Identifies the Set.
    pub length: u16, // Total length of the Set, in octets, including the Set Header, all records, and the optional padding
}

impl SetHeader {
    pub const SIZE: usize = 4;
    pub const TEMPLATE_SET_ID: u16 = 2;
    pub const MIN_DATA_SET_ID: u16 = 256;

    pub fn read(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < Self::SIZE {
            return Err(format!("Not enough space in buffer to read IPFIX SetHeader, required {} but received {}", Self::SIZE, buf.len()));
        }

        Ok(SetHeader {
            id: u16::from_be_bytes(buf[0..2].try_into().unwrap()),
            length: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
        })
    }

    #[inline]
    pub fn content_size(&self) -> usize {
        (self.length as usize).saturating_sub(Self::SIZE)
    }
}

/******************************** TEMPLATE HEADER ********************************/

/// from https://tools.ietf.org/html/rfc7011
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Template ID (> 255)      |         Field Count           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```

#[derive(Debug)]
pub struct TemplateHeader {
    pub id: u16,          // Each Template Record is given a unique Template ID in the range 256 to 65535
    pub field_count: u16, // Number of fields in this Template Record.
}

impl TemplateHeader {
    pub const SIZE: usize = 4;

    pub fn read(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < Self::SIZE {
            return Err(format!("Not enough space in buffer to read IPFIX TemplateHeader, required {} but received {}", Self::SIZE, buf.len()));
        }

        Ok(TemplateHeader {
            id: u16::from_be_bytes(buf[0..2].try_into().unwrap()),
            field_count: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
        })
    }
}

/********************************  TEMPLATE RECORD FIELD ********************************/

/// from https://tools.ietf.org/html/rfc7011
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |E|  Information Element ident. |        Field Length           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Enterprise Number                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```

#[derive(Debug, PartialEq)]
pub struct TemplateField {
    pub id: u16,                 // Information Element identifier, without the enterprise bit
    pub length: u16,             // The length of the corresponding encoded Information Element, in octets
    pub enterprise: Option<u32>, // Present when the enterprise bit is set
}

impl TemplateField {
    pub const SIZE: usize = 4;
    pub const ENTERPRISE_SIZE: usize = 8;
    const ENTERPRISE_BIT: u16 = 0x8000;

    /// Returns the field and the number of bytes it took.
    pub fn read(buf: &[u8]) -> Result<(Self, usize), String> {
        if buf.len() < Self::SIZE {
            return Err(format!("Not enough space in buffer to read IPFIX TemplateField, required {} but received {}", Self::SIZE, buf.len()));
        }

        let raw_id = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        let length = u16::from_be_bytes(buf[2..4].try_into().unwrap());

        if raw_id & Self::ENTERPRISE_BIT == 0 {
            return Ok((TemplateField { id: raw_id, length, enterprise: None }, Self::SIZE));
        }

        if buf.len() < Self::ENTERPRISE_SIZE {
            return Err(format!("Not enough space in buffer to read IPFIX enterprise TemplateField, required {} but received {}", Self::ENTERPRISE_SIZE, buf.len()));
        }

        Ok((
            TemplateField {
                id: raw_id & !Self::ENTERPRISE_BIT,
                length,
                enterprise: Some(u32::from_be_bytes(buf[4..8].try_into().unwrap())),
            },
            Self::ENTERPRISE_SIZE,
        ))
    }

    /// The identifier as written on the wire, enterprise bit included.
    #[inline]
    pub fn wire_id(&self) -> u16 {
        match self.enterprise {
            Some(_) => self.id | Self::ENTERPRISE_BIT,
            None => self.id,
        }
    }

    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), ExportError> {
        buf.write_u16::<BigEndian>(self.wire_id())?;
        buf.write_u16::<BigEndian>(self.length)?;
        if let Some(pen) = self.enterprise {
            buf.write_u32::<BigEndian>(pen)?;
        }
        Ok(())
    }
}

impl fmt::Display for TemplateField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.enterprise, FieldType::from_u16(self.id)) {
            (Some(pen), _) => write!(f, "{}/{} length: {}", pen, self.id, self.length),
            (None, Some(ftype)) => write!(f, "{:?} length: {}", ftype, self.length),
            (None, None) => write!(f, "{} length: {}", self.id, self.length),
        }
    }
}

/******************************** IPFIX FIELD VALUE ********************************/

/// A value as it travels in a data record. Numeric variants are checked
/// against the declared width of their IE when written.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    DateTimeNanos(u64), // nanoseconds since the UNIX epoch
    Dyn(Vec<u8>),
}

impl FieldValue {
    fn as_unsigned(&self) -> Option<u64> {
        match self {
            FieldValue::U8(v) => Some(*v as u64),
            FieldValue::U16(v) => Some(*v as u64),
            FieldValue::U32(v) => Some(*v as u64),
            FieldValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Encodes the value at the width `ie` declares.
    pub fn write(&self, ie: &InformationElement, buf: &mut Vec<u8>) -> Result<(), ExportError> {
        let overflow = || ExportError::EncodingOverflow { ie: ie.name, width: ie.data_type.length() };
        let mismatch = || ExportError::TypeMismatch { ie: ie.name, expected: ie.data_type };

        match ie.data_type {
            DataType::Unsigned8 => buf.write_u8(self.as_unsigned().ok_or_else(mismatch)?.try_into().map_err(|_| overflow())?)?,
            DataType::Unsigned16 => buf.write_u16::<BigEndian>(self.as_unsigned().ok_or_else(mismatch)?.try_into().map_err(|_| overflow())?)?,
            DataType::Unsigned32 => buf.write_u32::<BigEndian>(self.as_unsigned().ok_or_else(mismatch)?.try_into().map_err(|_| overflow())?)?,
            DataType::Unsigned64 => buf.write_u64::<BigEndian>(self.as_unsigned().ok_or_else(mismatch)?)?,
            DataType::Ipv4Address => match self {
                FieldValue::Ipv4(addr) => buf.extend_from_slice(&addr.octets()),
                _ => return Err(mismatch()),
            },
            DataType::Ipv6Address => match self {
                FieldValue::Ipv6(addr) => buf.extend_from_slice(&addr.octets()),
                _ => return Err(mismatch()),
            },
            DataType::DateTimeNanoseconds => match self {
                FieldValue::DateTimeNanos(ns) => buf.write_u64::<BigEndian>(ntp_from_unix_nanos(*ns))?,
                _ => return Err(mismatch()),
            },
            DataType::String => match self {
                FieldValue::Dyn(bytes) => write_variable_length(bytes, buf)?,
                _ => return Err(mismatch()),
            },
        }

        Ok(())
    }

    /// Decodes one value of `ie`, returning it with the number of bytes read.
    pub fn read(buf: &[u8], ie: &InformationElement) -> Result<(Self, usize), String> {
        let need = |size: usize| {
            if buf.len() < size {
                Err(format!("Not enough space in buffer to read {}, required {} but received {}", ie.name, size, buf.len()))
            } else {
                Ok(())
            }
        };

        match ie.data_type {
            DataType::Unsigned8 => {
                need(1)?;
                Ok((FieldValue::U8(buf[0]), 1))
            }
            DataType::Unsigned16 => {
                need(2)?;
                Ok((FieldValue::U16(u16::from_be_bytes(buf[0..2].try_into().unwrap())), 2))
            }
            DataType::Unsigned32 => {
                need(4)?;
                Ok((FieldValue::U32(u32::from_be_bytes(buf[0..4].try_into().unwrap())), 4))
            }
            DataType::Unsigned64 => {
                need(8)?;
                Ok((FieldValue::U64(u64::from_be_bytes(buf[0..8].try_into().unwrap())), 8))
            }
            DataType::Ipv4Address => {
                need(4)?;
                Ok((FieldValue::Ipv4(Ipv4Addr::from(u32::from_be_bytes(buf[0..4].try_into().unwrap()))), 4))
            }
            DataType::Ipv6Address => {
                need(16)?;
                Ok((FieldValue::Ipv6(Ipv6Addr::from(u128::from_be_bytes(buf[0..16].try_into().unwrap()))), 16))
            }
            DataType::DateTimeNanoseconds => {
                need(8)?;
                Ok((FieldValue::DateTimeNanos(unix_nanos_from_ntp(u64::from_be_bytes(buf[0..8].try_into().unwrap()))), 8))
            }
            DataType::String => {
                need(1)?;
                let (length, prefix) = if buf[0] < 255 {
                    (buf[0] as usize, 1)
                } else {
                    need(3)?;
                    (u16::from_be_bytes(buf[1..3].try_into().unwrap()) as usize, 3)
                };
                need(prefix + length)?;
                Ok((FieldValue::Dyn(buf[prefix..prefix + length].to_vec()), prefix + length))
            }
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FieldValue::U8(v) => fmt::Display::fmt(v, f),
            FieldValue::U16(v) => fmt::Display::fmt(v, f),
            FieldValue::U32(v) => fmt::Display::fmt(v, f),
            FieldValue::U64(v) => fmt::Display::fmt(v, f),
            FieldValue::Ipv4(v) => fmt::Display::fmt(v, f),
            FieldValue::Ipv6(v) => fmt::Display::fmt(v, f),
            FieldValue::DateTimeNanos(v) => write!(f, "{}ns", v),
            FieldValue::Dyn(v) => write!(f, "{:?}", String::from_utf8_lossy(v)),
        }
    }
}

/// RFC 7011 section 7: one length byte below 255, otherwise 255 followed by a 16 bit length.
/// Values are cut to [`MAX_STRING_LENGTH`] bytes first.
fn write_variable_length(bytes: &[u8], buf: &mut Vec<u8>) -> Result<(), ExportError> {
    let bytes = &bytes[..bytes.len().min(MAX_STRING_LENGTH)];
    if bytes.len() < 255 {
        buf.write_u8(bytes.len() as u8)?;
    } else {
        buf.write_u8(255)?;
        buf.write_u16::<BigEndian>(bytes.len() as u16)?;
    }
    buf.extend_from_slice(bytes);
    Ok(())
}

/// dateTimeNanoseconds is an NTP timestamp: 32 bit seconds since 1900 and a 32 bit fraction.
pub fn ntp_from_unix_nanos(ns: u64) -> u64 {
    let secs = (ns / NANOS_PER_SEC + NTP_UNIX_OFFSET) & 0xffff_ffff;
    let fraction = ((ns % NANOS_PER_SEC) << 32) / NANOS_PER_SEC;
    (secs << 32) | fraction
}

pub fn unix_nanos_from_ntp(ntp: u64) -> u64 {
    let secs = (ntp >> 32).saturating_sub(NTP_UNIX_OFFSET);
    let fraction = ntp & 0xffff_ffff;
    secs * NANOS_PER_SEC + ((fraction * NANOS_PER_SEC + (1 << 31)) >> 32)
}

/******************************** MESSAGE ENCODING ********************************/

/// Serialises one message: header, the Template Set announcing `template`,
/// then a Data Set holding a single record built from `values`.
pub fn encode_message(template: &Template, values: &HashMap<&'static str, FieldValue>, export_time: u32, seq_number: u32, domain_id: u32) -> Result<Vec<u8>, ExportError> {
    let mut buf = vec![0u8; Header::SIZE];

    let set_start = begin_set(&mut buf, SetHeader::TEMPLATE_SET_ID)?;
    buf.write_u16::<BigEndian>(template.id)?;
    buf.write_u16::<BigEndian>(template.fields.len() as u16)?;
    for ie in &template.fields {
        ie.template_field().write(&mut buf)?;
    }
    end_set(&mut buf, set_start)?;

    let set_start = begin_set(&mut buf, template.id)?;
    for ie in &template.fields {
        let value = values.get(ie.name).ok_or(ExportError::MissingValue(ie.name))?;
        value.write(ie, &mut buf)?;
    }
    end_set(&mut buf, set_start)?;

    let length = buf.len().try_into().map_err(|_| ExportError::EncodingOverflow { ie: "messageLength", width: 2 })?;
    Header { version: VERSION, length, export_time, seq_number, domain_id }.write(&mut buf[0..Header::SIZE]);

    Ok(buf)
}

fn begin_set(buf: &mut Vec<u8>, id: u16) -> Result<usize, ExportError> {
    let start = buf.len();
    buf.write_u16::<BigEndian>(id)?;
    buf.write_u16::<BigEndian>(0)?; // patched by end_set
    Ok(start)
}

fn end_set(buf: &mut Vec<u8>, start: usize) -> Result<(), ExportError> {
    let length: u16 = (buf.len() - start).try_into().map_err(|_| ExportError::EncodingOverflow { ie: "setLength", width: 2 })?;
    BigEndian::write_u16(&mut buf[start + 2..start + 4], length);
    Ok(())
}

/******************************** MESSAGE DECODING ********************************/

/// One decoded data record, keyed by IE name.
#[derive(Debug)]
pub struct DataSet {
    pub template_id: u16,
    pub fields: HashMap<&'static str, FieldValue>,
}

impl DataSet {
    pub fn read(buf: &[u8], template: &Template) -> Result<(Self, usize), String> {
        let mut fields = HashMap::with_capacity(template.fields.len());
        let mut offset = 0;

        for ie in &template.fields {
            let (value, size) = FieldValue::read(&buf[offset..], ie)?;
            fields.insert(ie.name, value);
            offset += size;
        }

        Ok((DataSet { template_id: template.id, fields }, offset))
    }
}

impl fmt::Display for DataSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut names: Vec<&&str> = self.fields.keys().collect();
        names.sort();
        for name in names {
            write!(f, "{}: {}, ", name, self.fields[*name])?;
        }

        Ok(())
    }
}

/// A decoded message. Templates are resolved against `catalog`, so only
/// known IEs can be read back.
#[derive(Debug)]
pub struct Message {
    pub header: Header,
    pub templates: Vec<Template>,
    pub records: Vec<DataSet>,
}

impl Message {
    pub fn read(buf: &[u8], catalog: &IeCatalog) -> Result<Self, String> {
        let header = Header::read(buf)?;
        if header.version != VERSION {
            return Err(format!("Invalid ipfix version, expected {}, read {}", VERSION, header.version));
        }
        if buf.len() != header.length as usize {
            return Err(format!("Mismatch size read from the ipfix header ({}) and the packet size ({})", header.length, buf.len()));
        }

        let mut templates: Vec<Template> = vec![];
        let mut records = vec![];
        let mut offset = Header::SIZE;

        while offset < buf.len() {
            let set = SetHeader::read(&buf[offset..])?;
            let end = offset + set.length as usize;
            if set.length as usize <= SetHeader::SIZE || end > buf.len() {
                return Err(format!("Invalid set length {} at offset {}", set.length, offset));
            }
            let content = &buf[offset + SetHeader::SIZE..end];

            if set.id == SetHeader::TEMPLATE_SET_ID {
                let mut pos = 0;
                while content.len() - pos >= TemplateHeader::SIZE {
                    let template_header = TemplateHeader::read(&content[pos..])?;
                    pos += TemplateHeader::SIZE;

                    let mut fields = Vec::with_capacity(template_header.field_count as usize);
                    for _ in 0..template_header.field_count {
                        let (field, size) = TemplateField::read(&content[pos..])?;
                        let ie = catalog.by_field(&field).ok_or_else(|| format!("No information element known for field {}", field))?;
                        fields.push(*ie);
                        pos += size;
                    }

                    templates.push(Template { id: template_header.id, fields });
                }
            } else if set.id >= SetHeader::MIN_DATA_SET_ID {
                let template = templates.iter().find(|t| t.id == set.id).ok_or_else(|| format!("No template found for data set {}", set.id))?;
                let mut pos = 0;
                while pos < content.len() {
                    let (record, size) = DataSet::read(&content[pos..], template)?;
                    records.push(record);
                    if size == 0 {
                        break;
                    }
                    pos += size;
                }
            } else {
                return Err(format!("Invalide set_id read : {}", set.id));
            }

            offset = end;
        }

        Ok(Message { header, templates, records })
    }
}
