use num_derive::FromPrimitive;
use serde_derive::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::OnceLock;

use crate::error::ExportError;
use crate::flow::mqtt::ControlType;
use crate::ipfix::message::{FieldValue, TemplateField};

/// Private Enterprise Number carried by every IoT specific IE.
pub const ENTERPRISE_NUMBER: u32 = 9999;

/// Template ids of the two address family variants of the MQTT template.
pub const MQTT_IPV4_TEMPLATE_ID: u16 = 256;
pub const MQTT_IPV6_TEMPLATE_ID: u16 = 257;

/// Strings are exported with a variable length; 65535 announces it in the template.
pub const VARIABLE_LENGTH: u16 = 65535;

/// Longest string value written in a data record.
pub const MAX_STRING_LENGTH: usize = 255;

/******************************** IPFIX FIELD TYPE ********************************/

/// IANA elements used by the IoT templates, from http://www.iana.org/assignments/ipfix/ipfix.xml
#[derive(FromPrimitive, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Copy, Clone)]
#[repr(u16)]
pub enum FieldType {
    ProtocolIdentifier = 4,
    SourceTransportPort = 7,
    SourceIPv4Address = 8,
    DestinationTransportPort = 11,
    DestinationIPv4Address = 12,
    SourceIPv6Address = 27,
    DestinationIPv6Address = 28,
    FlowStartNanoseconds = 156,
    FlowEndNanoseconds = 157,
    FlowDurationMicroseconds = 162,
}

/******************************** ABSTRACT DATA TYPE ********************************/

/// from https://tools.ietf.org/html/rfc7011#section-6.1
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataType {
    Unsigned8,
    Unsigned16,
    Unsigned32,
    Unsigned64,
    Ipv4Address,
    Ipv6Address,
    DateTimeNanoseconds,
    String,
}

impl DataType {
    /// Length announced in the template record.
    pub fn length(&self) -> u16 {
        match self {
            DataType::Unsigned8 => 1,
            DataType::Unsigned16 => 2,
            DataType::Unsigned32 | DataType::Ipv4Address => 4,
            DataType::Unsigned64 | DataType::DateTimeNanoseconds => 8,
            DataType::Ipv6Address => 16,
            DataType::String => VARIABLE_LENGTH,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DataType::Unsigned8 => "unsigned8",
            DataType::Unsigned16 => "unsigned16",
            DataType::Unsigned32 => "unsigned32",
            DataType::Unsigned64 => "unsigned64",
            DataType::Ipv4Address => "ipv4Address",
            DataType::Ipv6Address => "ipv6Address",
            DataType::DateTimeNanoseconds => "dateTimeNanoseconds",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

/******************************** INFORMATION ELEMENT ********************************/

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InformationElement {
    pub name: &'static str,
    pub id: u16,
    pub enterprise: Option<u32>,
    pub data_type: DataType,
}

impl InformationElement {
    const fn iana(name: &'static str, field: FieldType, data_type: DataType) -> Self {
        InformationElement { name, id: field as u16, enterprise: None, data_type }
    }

    const fn vendor(name: &'static str, id: u16, data_type: DataType) -> Self {
        InformationElement { name, id, enterprise: Some(ENTERPRISE_NUMBER), data_type }
    }

    /// Field specifier as written in a template record.
    pub fn template_field(&self) -> TemplateField {
        TemplateField { id: self.id, length: self.data_type.length(), enterprise: self.enterprise }
    }
}

impl fmt::Display for InformationElement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.enterprise {
            Some(pen) => write!(f, "{}({}/{})<{}>", self.name, pen, self.id, self.data_type),
            None => write!(f, "{}({})<{}>", self.name, self.id, self.data_type),
        }
    }
}

static IANA_IES: [InformationElement; 10] = [
    InformationElement::iana("sourceIPv4Address", FieldType::SourceIPv4Address, DataType::Ipv4Address),
    InformationElement::iana("destinationIPv4Address", FieldType::DestinationIPv4Address, DataType::Ipv4Address),
    InformationElement::iana("sourceIPv6Address", FieldType::SourceIPv6Address, DataType::Ipv6Address),
    InformationElement::iana("destinationIPv6Address", FieldType::DestinationIPv6Address, DataType::Ipv6Address),
    InformationElement::iana("protocolIdentifier", FieldType::ProtocolIdentifier, DataType::Unsigned8),
    InformationElement::iana("sourceTransportPort", FieldType::SourceTransportPort, DataType::Unsigned16),
    InformationElement::iana("destinationTransportPort", FieldType::DestinationTransportPort, DataType::Unsigned16),
    InformationElement::iana("flowStartNanoseconds", FieldType::FlowStartNanoseconds, DataType::DateTimeNanoseconds),
    InformationElement::iana("flowEndNanoseconds", FieldType::FlowEndNanoseconds, DataType::DateTimeNanoseconds),
    InformationElement::iana("flowDurationMicroseconds", FieldType::FlowDurationMicroseconds, DataType::Unsigned32),
];

/// The MQTT elements; 32769.. is the element id with the enterprise bit set.
pub const IOT_SPECIFIC_IES: [InformationElement; 7] = [
    InformationElement::vendor("mqttQoS", 1, DataType::Unsigned16),
    InformationElement::vendor("mqttControlType", 2, DataType::Unsigned16),
    InformationElement::vendor("mqttPacketId", 3, DataType::Unsigned16),
    InformationElement::vendor("mqttTopic", 4, DataType::String),
    InformationElement::vendor("mqttSrcClientId", 5, DataType::String),
    InformationElement::vendor("mqttDstClientId", 6, DataType::String),
    InformationElement::vendor("mqttCorrelationData", 7, DataType::String),
];

const STANDARD_FIELDS_TAIL: [&str; 6] = [
    "protocolIdentifier",
    "sourceTransportPort",
    "destinationTransportPort",
    "flowStartNanoseconds",
    "flowEndNanoseconds",
    "flowDurationMicroseconds",
];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl From<&IpAddr> for AddressFamily {
    fn from(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// Ordered IE names of the MQTT template; the data record follows this order.
pub fn template_fields(family: AddressFamily) -> Vec<&'static str> {
    let mut fields = match family {
        AddressFamily::V4 => vec!["sourceIPv4Address", "destinationIPv4Address"],
        AddressFamily::V6 => vec!["sourceIPv6Address", "destinationIPv6Address"],
    };
    fields.extend_from_slice(&STANDARD_FIELDS_TAIL);
    fields.extend(IOT_SPECIFIC_IES.iter().map(|ie| ie.name));
    fields
}

/// Field list of the IPv4 template, the one every IPv4 flow is exported with.
pub fn current_template_fields() -> Vec<&'static str> {
    template_fields(AddressFamily::V4)
}

/******************************** CATALOG ********************************/

/// The IE catalog shared by everything that builds or reads templates.
///
/// IANA elements are always known. The IoT elements are registered once with
/// [`IeCatalog::register_vendor_ies`]; a second registration changes nothing.
#[derive(Debug, Default)]
pub struct IeCatalog {
    vendor: OnceLock<Vec<InformationElement>>,
}

impl IeCatalog {
    pub fn new() -> Self {
        IeCatalog { vendor: OnceLock::new() }
    }

    /// Returns false when the elements were already registered.
    pub fn register_vendor_ies(&self) -> bool {
        let mut registered = false;
        self.vendor.get_or_init(|| {
            registered = true;
            IOT_SPECIFIC_IES.to_vec()
        });
        registered
    }

    pub fn is_registered(&self) -> bool {
        self.vendor.get().is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<&InformationElement> {
        IANA_IES.iter().chain(self.vendor.get().into_iter().flatten()).find(|ie| ie.name == name)
    }

    /// Finds the element behind a field specifier read from the wire.
    pub fn by_field(&self, field: &TemplateField) -> Option<&InformationElement> {
        IANA_IES
            .iter()
            .chain(self.vendor.get().into_iter().flatten())
            .find(|ie| ie.id == field.id && ie.enterprise == field.enterprise)
    }

    pub fn template(&self, family: AddressFamily) -> Result<Template, ExportError> {
        if !self.is_registered() {
            return Err(ExportError::TemplateNotRegistered);
        }

        let fields = template_fields(family)
            .into_iter()
            .map(|name| self.lookup(name).copied().ok_or(ExportError::TemplateNotRegistered))
            .collect::<Result<Vec<_>, _>>()?;

        let id = match family {
            AddressFamily::V4 => MQTT_IPV4_TEMPLATE_ID,
            AddressFamily::V6 => MQTT_IPV6_TEMPLATE_ID,
        };

        Ok(Template { id, fields })
    }
}

/// An ordered list of IEs under a template id.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub id: u16,
    pub fields: Vec<InformationElement>,
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "template {} ({} fields)", self.id, self.fields.len())?;
        for field in &self.fields {
            write!(f, "\n\t{}", field)?;
        }
        Ok(())
    }
}

/******************************** MQTT IPFIX RECORD ********************************/

/// Typed view of one exported MQTT flow, in template order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MqttIpfix {
    pub source_ip_address: Option<IpAddr>,
    pub destination_ip_address: Option<IpAddr>,
    pub protocol_identifier: Option<u8>,
    pub source_transport_port: Option<u16>,
    pub destination_transport_port: Option<u16>,
    pub flow_start_nanoseconds: Option<u64>,
    pub flow_end_nanoseconds: Option<u64>,
    pub flow_duration_microseconds: Option<u64>,
    pub mqtt_qos: Option<u8>,
    pub mqtt_control_type: Option<ControlType>,
    pub mqtt_packet_id: Option<u16>,
    pub mqtt_topic: Option<String>,
    pub mqtt_src_client_id: Option<String>,
    pub mqtt_dst_client_id: Option<String>,
    pub mqtt_correlation_data: Option<Vec<u8>>,
}

impl MqttIpfix {
    /// IE name to value map handed to the encoder. Absent optional fields are
    /// exported as zero or as an empty string.
    pub fn named_values(&self) -> HashMap<&'static str, FieldValue> {
        let mut values = HashMap::with_capacity(15);

        match (self.source_ip_address, self.destination_ip_address) {
            (Some(IpAddr::V6(src)), Some(IpAddr::V6(dst))) => {
                values.insert("sourceIPv6Address", FieldValue::Ipv6(src));
                values.insert("destinationIPv6Address", FieldValue::Ipv6(dst));
            }
            (src, dst) => {
                if let Some(IpAddr::V4(src)) = src {
                    values.insert("sourceIPv4Address", FieldValue::Ipv4(src));
                }
                if let Some(IpAddr::V4(dst)) = dst {
                    values.insert("destinationIPv4Address", FieldValue::Ipv4(dst));
                }
            }
        }

        values.insert("protocolIdentifier", FieldValue::U8(self.protocol_identifier.unwrap_or(0)));
        values.insert("sourceTransportPort", FieldValue::U16(self.source_transport_port.unwrap_or(0)));
        values.insert("destinationTransportPort", FieldValue::U16(self.destination_transport_port.unwrap_or(0)));
        values.insert("flowStartNanoseconds", FieldValue::DateTimeNanos(self.flow_start_nanoseconds.unwrap_or(0)));
        values.insert("flowEndNanoseconds", FieldValue::DateTimeNanos(self.flow_end_nanoseconds.unwrap_or(0)));
        values.insert("flowDurationMicroseconds", FieldValue::U64(self.flow_duration_microseconds.unwrap_or(0)));
        values.insert("mqttQoS", FieldValue::U16(self.mqtt_qos.unwrap_or(0) as u16));
        values.insert("mqttControlType", FieldValue::U16(self.mqtt_control_type.map(|c| c as u16).unwrap_or(0)));
        values.insert("mqttPacketId", FieldValue::U16(self.mqtt_packet_id.unwrap_or(0)));
        values.insert("mqttTopic", FieldValue::Dyn(self.mqtt_topic.clone().unwrap_or_default().into_bytes()));
        values.insert("mqttSrcClientId", FieldValue::Dyn(self.mqtt_src_client_id.clone().unwrap_or_default().into_bytes()));
        values.insert("mqttDstClientId", FieldValue::Dyn(self.mqtt_dst_client_id.clone().unwrap_or_default().into_bytes()));
        values.insert("mqttCorrelationData", FieldValue::Dyn(self.mqtt_correlation_data.clone().unwrap_or_default()));

        values
    }
}

impl fmt::Display for MqttIpfix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn template_field_order() {
        assert_eq!(
            current_template_fields(),
            vec![
                "sourceIPv4Address",
                "destinationIPv4Address",
                "protocolIdentifier",
                "sourceTransportPort",
                "destinationTransportPort",
                "flowStartNanoseconds",
                "flowEndNanoseconds",
                "flowDurationMicroseconds",
                "mqttQoS",
                "mqttControlType",
                "mqttPacketId",
                "mqttTopic",
                "mqttSrcClientId",
                "mqttDstClientId",
                "mqttCorrelationData",
            ]
        );
        assert_eq!(template_fields(AddressFamily::V6)[0], "sourceIPv6Address");
        assert_eq!(template_fields(AddressFamily::V6).len(), 15);
    }

    #[test]
    fn template_requires_registration() {
        let catalog = IeCatalog::new();
        assert!(catalog.lookup("mqttTopic").is_none());
        assert!(matches!(catalog.template(AddressFamily::V4), Err(ExportError::TemplateNotRegistered)));
    }

    #[test]
    fn register_only_once() {
        let catalog = IeCatalog::new();
        assert!(catalog.register_vendor_ies());
        assert!(!catalog.register_vendor_ies());

        let template = catalog.template(AddressFamily::V4).unwrap();
        assert_eq!(template.id, MQTT_IPV4_TEMPLATE_ID);
        assert_eq!(template.fields.len(), 15);
        assert_eq!(template.fields.iter().filter(|ie| ie.name == "mqttQoS").count(), 1);
    }

    #[test]
    fn vendor_field_specifiers() {
        let catalog = IeCatalog::new();
        catalog.register_vendor_ies();

        let topic = catalog.lookup("mqttTopic").unwrap();
        let field = topic.template_field();
        assert_eq!(field, TemplateField { id: 4, length: VARIABLE_LENGTH, enterprise: Some(ENTERPRISE_NUMBER) });
        assert_eq!(field.wire_id(), 32772);
        assert_eq!(catalog.by_field(&field), Some(topic));

        let qos = catalog.lookup("mqttQoS").unwrap().template_field();
        assert_eq!((qos.wire_id(), qos.length), (32769, 2));

        let src = catalog.lookup("sourceIPv4Address").unwrap().template_field();
        assert_eq!(src, TemplateField { id: 8, length: 4, enterprise: None });
    }

    #[test]
    fn named_values_defaults() {
        let values = MqttIpfix::default().named_values();
        assert_eq!(values.get("mqttTopic"), Some(&FieldValue::Dyn(vec![])));
        assert_eq!(values.get("mqttPacketId"), Some(&FieldValue::U16(0)));
        assert!(values.get("sourceIPv4Address").is_none());
    }

    #[test]
    fn display_as_json() {
        let record = MqttIpfix { mqtt_control_type: Some(ControlType::Publish), mqtt_qos: Some(1), ..Default::default() };
        let json = record.to_string();
        assert!(json.contains("\"mqtt_control_type\":3"));
        assert!(json.contains("\"mqtt_qos\":1"));
    }
}
