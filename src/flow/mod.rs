use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::entity::packet::{Layer, Packet};
use crate::error::RecordError;
use crate::ipfix::message::FieldValue;
use crate::ipfix::template::MqttIpfix;

pub mod correlation;
pub mod mqtt;
pub mod table;

#[cfg(test)]
pub mod testing;

use mqtt::{ClientIds, ClientSessions, MqttRecord};

/// The IoT protocols a probe can be started for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Coap,
    Opcua,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Coap => "coap",
            Protocol::Opcua => "opcua",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mqtt" => Ok(Protocol::Mqtt),
            "coap" => Ok(Protocol::Coap),
            "opcua" => Ok(Protocol::Opcua),
            _ => Err(format!("{} protocol is not available, expected mqtt, coap or opcua", s)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name().to_uppercase())
    }
}

/******************************** LAYER 3 AND 4 ********************************/

const IPPROTO_TCP: u8 = 6;

/// Network and transport identity of one packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layer3And4 {
    pub timestamp_ns: u64,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub destination_ip: IpAddr,
    pub destination_port: u16,
    pub protocol: u8, // IANA protocol number
}

impl Layer3And4 {
    pub fn new(packet: &Packet) -> Result<Self, RecordError> {
        let (ip, prefix) = match (packet.layer("ip"), packet.layer("ipv6")) {
            (Some(ip), _) => (ip, "ip"),
            (None, Some(ip)) => (ip, "ipv6"),
            (None, None) => return Err(RecordError::UnsupportedProtocol("packet without an IP layer".to_string())),
        };
        let tcp = packet.layer("tcp").ok_or_else(|| RecordError::UnsupportedProtocol("packet without a TCP layer".to_string()))?;

        let address = |field: &'static str| -> Result<IpAddr, RecordError> {
            let raw = ip.field(&format!("{}.{}", prefix, field)).ok_or_else(|| RecordError::Malformed { field: "ip address", reason: format!("{}.{} missing", prefix, field) })?;
            raw.parse().map_err(|e| RecordError::Malformed { field: "ip address", reason: format!("{:?}: {}", raw, e) })
        };

        Ok(Layer3And4 {
            timestamp_ns: packet.timestamp_ns(),
            source_ip: address("src")?,
            source_port: required_u16(&tcp, "tcp.srcport")?,
            destination_ip: address("dst")?,
            destination_port: required_u16(&tcp, "tcp.dstport")?,
            // ipv6.nxt names the first extension header when there is one, the tcp layer is authoritative
            protocol: IPPROTO_TCP,
        })
    }

    #[inline]
    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.source_ip, self.source_port)
    }

    #[inline]
    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.destination_ip, self.destination_port)
    }
}

fn required_u16(layer: &Layer<'_>, field: &'static str) -> Result<u16, RecordError> {
    match layer.field_u64(field) {
        Some(Ok(v)) if v <= u16::MAX as u64 => Ok(v as u16),
        Some(Ok(v)) => Err(RecordError::Malformed { field, reason: format!("{} is not a port", v) }),
        Some(Err(reason)) => Err(RecordError::Malformed { field, reason }),
        None => Err(RecordError::Malformed { field, reason: "missing".to_string() }),
    }
}

/******************************** RECORD ID ********************************/

/// Key of a flow in the flow table. For MQTT a flow is a publish/subscribe
/// relationship, so several flows share one TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordId {
    Mqtt {
        source_ip: IpAddr,
        destination_ip: IpAddr,
        src_client_id: Option<String>,
        dst_client_id: Option<String>,
        topic: Option<String>,
    },
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordId::Mqtt { source_ip, destination_ip, src_client_id, dst_client_id, topic } => write!(
                f,
                "mqtt {}({}) -> {}({}) topic: {}",
                source_ip,
                src_client_id.as_deref().unwrap_or("-"),
                destination_ip,
                dst_client_id.as_deref().unwrap_or("-"),
                topic.as_deref().unwrap_or("-")
            ),
        }
    }
}

/******************************** FLOW RECORD ********************************/

/// One packet of the selected protocol, ready for the flow table.
#[derive(Debug, Clone)]
pub enum FlowRecord {
    Mqtt(MqttRecord),
}

impl FlowRecord {
    pub fn layer3_and_4(&self) -> &Layer3And4 {
        match self {
            FlowRecord::Mqtt(record) => &record.layer3_and_4,
        }
    }

    pub fn record_id(&self) -> RecordId {
        match self {
            FlowRecord::Mqtt(record) => record.record_id(),
        }
    }

    /// Table capacity the variant asks for.
    pub fn max_flows(&self) -> usize {
        match self {
            FlowRecord::Mqtt(_) => MqttRecord::MAX_FLOWS,
        }
    }

    /// Typed record for this single packet: the flow starts and ends at its capture time.
    pub fn ipfix_record(&self) -> MqttIpfix {
        match self {
            FlowRecord::Mqtt(record) => record.ipfix_record(),
        }
    }

    /// The IE name to value map for the encoder, with the typed record kept for bookkeeping.
    pub fn ipfix_representation(&self) -> (HashMap<&'static str, FieldValue>, MqttIpfix) {
        let ipfix = self.ipfix_record();
        (ipfix.named_values(), ipfix)
    }

    /// Short label of what the packet is, used in logs.
    pub fn kind(&self) -> String {
        match self {
            FlowRecord::Mqtt(record) => record.fixed_header.control_type.to_string(),
        }
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FlowRecord::Mqtt(record) => fmt::Display::fmt(record, f),
        }
    }
}

/// Turns dissected packets into records of the configured protocol.
pub struct RecordBuilder {
    protocol: Protocol,
    include_sys_topics: bool,
    sessions: ClientSessions,
}

impl RecordBuilder {
    pub fn new(protocol: Protocol, include_sys_topics: bool) -> Self {
        RecordBuilder { protocol, include_sys_topics, sessions: ClientSessions::default() }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Must see packets in capture order, before they are dispatched.
    /// The returned ids travel with the packet to [`RecordBuilder::build`].
    pub fn track_sessions(&self, packet: &Packet) -> ClientIds {
        match self.protocol {
            Protocol::Mqtt => self.sessions.track(packet),
            Protocol::Coap | Protocol::Opcua => ClientIds::default(),
        }
    }

    pub fn build(&self, packet: &Packet, clients: ClientIds) -> Result<FlowRecord, RecordError> {
        match self.protocol {
            Protocol::Mqtt => MqttRecord::new(packet, self.include_sys_topics, clients).map(FlowRecord::Mqtt),
            Protocol::Coap | Protocol::Opcua => Err(RecordError::UnsupportedProtocol(format!("{} records are not implemented", self.protocol))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testing;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn packet(layers: serde_json::Value) -> Packet {
        Packet::new(1_000, layers.as_object().unwrap().clone())
    }

    #[test]
    fn read_layer3_and_4() {
        let p = packet(json!({
            "ip": {"ip.src": "192.168.1.10", "ip.dst": "192.168.1.1", "ip.proto": "6"},
            "tcp": {"tcp.srcport": "51000", "tcp.dstport": "1883"}
        }));
        let l34 = Layer3And4::new(&p).unwrap();

        assert_eq!(l34.timestamp_ns, 1_000);
        assert_eq!(l34.source(), "192.168.1.10:51000".parse().unwrap());
        assert_eq!(l34.destination(), "192.168.1.1:1883".parse().unwrap());
        assert_eq!(l34.protocol, 6);
    }

    #[test]
    fn read_ipv6_layer() {
        let p = packet(json!({
            "ipv6": {"ipv6_ipv6_src": "fe80::1", "ipv6_ipv6_dst": "fe80::2", "ipv6_ipv6_nxt": "6"},
            "tcp": {"tcp_tcp_srcport": "40000", "tcp_tcp_dstport": "8883"}
        }));
        let l34 = Layer3And4::new(&p).unwrap();
        assert_eq!(l34.source_ip, "fe80::1".parse::<IpAddr>().unwrap());
        assert_eq!(l34.destination_port, 8883);
    }

    #[test]
    fn protocol_comes_from_transport() {
        let p = packet(json!({
            "ipv6": {"ipv6.src": "fe80::1", "ipv6.dst": "fe80::2", "ipv6.nxt": "0"},
            "tcp": {"tcp.srcport": "40000", "tcp.dstport": "1883"}
        }));
        assert_eq!(Layer3And4::new(&p).unwrap().protocol, 6);

        let p = packet(json!({
            "ip": {"ip.src": "10.0.0.1", "ip.dst": "10.0.0.2"},
            "tcp": {"tcp.srcport": "51000", "tcp.dstport": "1883"}
        }));
        assert_eq!(Layer3And4::new(&p).unwrap().protocol, 6);
    }

    #[test]
    fn missing_transport_is_unsupported() {
        let p = packet(json!({"ip": {"ip.src": "10.0.0.1", "ip.dst": "10.0.0.2"}, "udp": {}}));
        assert!(matches!(Layer3And4::new(&p), Err(RecordError::UnsupportedProtocol(_))));
    }

    #[test]
    fn invalid_port_is_malformed() {
        let p = packet(json!({
            "ip": {"ip.src": "10.0.0.1", "ip.dst": "10.0.0.2"},
            "tcp": {"tcp.srcport": "70000", "tcp.dstport": "1883"}
        }));
        assert!(matches!(Layer3And4::new(&p), Err(RecordError::Malformed { field: "tcp.srcport", .. })));
    }

    #[test]
    fn parse_protocol() {
        assert_eq!("MQTT".parse::<Protocol>(), Ok(Protocol::Mqtt));
        assert_eq!("opcua".parse::<Protocol>(), Ok(Protocol::Opcua));
        assert!("amqp".parse::<Protocol>().is_err());
    }

    #[test]
    fn mqtt_representation() {
        let builder = RecordBuilder::new(Protocol::Mqtt, false);
        let packet = testing::publish(7_000, "192.168.1.10:51000", testing::BROKER, "temp/room1", 1, 5, Some(b"20240101"));
        let record = builder.build(&packet, ClientIds::default()).unwrap();

        assert_eq!(record.kind(), "PUBLISH");
        assert_eq!(record.max_flows(), 1024);

        let (values, ipfix) = record.ipfix_representation();
        assert_eq!(values.len(), 15);
        assert_eq!(values["sourceIPv4Address"], FieldValue::Ipv4("192.168.1.10".parse().unwrap()));
        assert_eq!(values["mqttTopic"], FieldValue::Dyn(b"temp/room1".to_vec()));
        assert_eq!(values["flowStartNanoseconds"], FieldValue::DateTimeNanos(7_000));
        assert_eq!(ipfix.mqtt_packet_id, Some(5));
        assert_eq!(ipfix.mqtt_correlation_data, Some(b"20240101".to_vec()));
    }

    #[test]
    fn unimplemented_protocols_fail_fast() {
        let p = packet(json!({
            "ip": {"ip.src": "10.0.0.1", "ip.dst": "10.0.0.2"},
            "tcp": {"tcp.srcport": "5683", "tcp.dstport": "5683"}
        }));
        for protocol in [Protocol::Coap, Protocol::Opcua] {
            let builder = RecordBuilder::new(protocol, false);
            assert!(matches!(builder.build(&p, ClientIds::default()), Err(RecordError::UnsupportedProtocol(_))));
        }
    }
}
