use log::debug;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde_derive::Serialize;
use serde_repr::Serialize_repr;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

use crate::entity::packet::{Layer, Packet};
use crate::error::RecordError;
use crate::flow::correlation::find_correlation_data;
use crate::flow::{Layer3And4, RecordId};
use crate::ipfix::template::MqttIpfix;

const SYS_TOPIC_PREFIX: &str = "$SYS";

/// MQTT control packet types, from the first nibble of the fixed header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, Serialize_repr)]
#[repr(u8)]
pub enum ControlType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl ControlType {
    /// Acknowledgements sent back to the publisher of a QoS 1 or 2 message.
    pub fn is_publish_ack(&self) -> bool {
        matches!(self, ControlType::Puback | ControlType::Pubrec | ControlType::Pubcomp)
    }

    /// Last packet of a publish exchange.
    pub fn completes_publish(&self) -> bool {
        matches!(self, ControlType::Puback | ControlType::Pubcomp)
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ControlType::Connect => "CONNECT",
            ControlType::Connack => "CONNACK",
            ControlType::Publish => "PUBLISH",
            ControlType::Puback => "PUBACK",
            ControlType::Pubrec => "PUBREC",
            ControlType::Pubrel => "PUBREL",
            ControlType::Pubcomp => "PUBCOMP",
            ControlType::Subscribe => "SUBSCRIBE",
            ControlType::Suback => "SUBACK",
            ControlType::Unsubscribe => "UNSUBSCRIBE",
            ControlType::Unsuback => "UNSUBACK",
            ControlType::Pingreq => "PINGREQ",
            ControlType::Pingresp => "PINGRESP",
            ControlType::Disconnect => "DISCONNECT",
            ControlType::Auth => "AUTH",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SysTopic {
    True,
    False,
    Filtered,
}

impl SysTopic {
    fn classify(topic: Option<&str>, include_sys_topics: bool) -> Self {
        match topic {
            Some(topic) if topic.starts_with(SYS_TOPIC_PREFIX) => {
                if include_sys_topics {
                    SysTopic::True
                } else {
                    SysTopic::Filtered
                }
            }
            _ => SysTopic::False,
        }
    }
}

/******************************** FIXED HEADER ********************************/

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixedHeader {
    pub control_type: ControlType,
    pub qos: u8,
}

impl FixedHeader {
    fn read(mqtt: &Layer<'_>) -> Result<Self, RecordError> {
        let control_type = match mqtt.field_u64("mqtt.msgtype") {
            Some(Ok(value)) => ControlType::from_u64(value).ok_or_else(|| RecordError::Malformed { field: "mqtt.msgtype", reason: format!("unknown control type {}", value) })?,
            Some(Err(reason)) => return Err(RecordError::Malformed { field: "mqtt.msgtype", reason }),
            None => return Err(RecordError::Malformed { field: "mqtt.msgtype", reason: "missing".to_string() }),
        };

        // only PUBLISH carries a QoS, the dissector omits it elsewhere
        let qos = match mqtt.field_u64("mqtt.qos") {
            Some(Ok(qos)) if qos <= 2 => qos as u8,
            Some(Ok(qos)) => return Err(RecordError::Malformed { field: "mqtt.qos", reason: format!("invalid QoS {}", qos) }),
            Some(Err(reason)) => return Err(RecordError::Malformed { field: "mqtt.qos", reason }),
            None => 0,
        };

        Ok(FixedHeader { control_type, qos })
    }
}

/******************************** VARIABLE HEADER ********************************/

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableHeader {
    pub packet_id: Option<u16>,
    pub topic: Option<String>,
    pub src_client_id: Option<String>,
    pub dst_client_id: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub sys_topic: SysTopic,
}

/******************************** RECORD ********************************/

/// One MQTT control packet with its transport identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MqttRecord {
    pub layer3_and_4: Layer3And4,
    pub fixed_header: FixedHeader,
    pub variable_header: VariableHeader,
}

impl MqttRecord {
    pub const MAX_FLOWS: usize = 1024;

    /// `clients` are the ids resolved by [`ClientSessions::track`] when the packet was read.
    pub fn new(packet: &Packet, include_sys_topics: bool, clients: ClientIds) -> Result<Self, RecordError> {
        let mqtt = packet.layer("mqtt").ok_or(RecordError::NotThisProtocol("mqtt"))?;
        let layer3_and_4 = Layer3And4::new(packet)?;
        let fixed_header = FixedHeader::read(&mqtt)?;

        let packet_id = match mqtt.field_u64("mqtt.msgid") {
            Some(Ok(id)) if id <= u16::MAX as u64 => Some(id as u16),
            Some(Ok(id)) => return Err(RecordError::Malformed { field: "mqtt.msgid", reason: format!("{} is not a packet identifier", id) }),
            Some(Err(reason)) => return Err(RecordError::Malformed { field: "mqtt.msgid", reason }),
            None => None,
        };

        let topic = mqtt.field("mqtt.topic");
        let sys_topic = SysTopic::classify(topic.as_deref(), include_sys_topics);
        if sys_topic == SysTopic::Filtered {
            return Err(RecordError::Filtered(format!("system topic {}", topic.unwrap_or_default())));
        }

        let src_client_id = match fixed_header.control_type {
            ControlType::Connect => mqtt.field("mqtt.clientid").or(clients.source),
            _ => clients.source,
        };
        let dst_client_id = clients.destination;

        let correlation_data = if fixed_header.control_type == ControlType::Publish { correlation_data(packet, &fixed_header) } else { None };

        Ok(MqttRecord {
            layer3_and_4,
            fixed_header,
            variable_header: VariableHeader { packet_id, topic, src_client_id, dst_client_id, correlation_data, sys_topic },
        })
    }

    pub fn record_id(&self) -> RecordId {
        RecordId::Mqtt {
            source_ip: self.layer3_and_4.source_ip,
            destination_ip: self.layer3_and_4.destination_ip,
            src_client_id: self.variable_header.src_client_id.clone(),
            dst_client_id: self.variable_header.dst_client_id.clone(),
            topic: self.variable_header.topic.clone(),
        }
    }

    pub fn ipfix_record(&self) -> MqttIpfix {
        let l34 = &self.layer3_and_4;
        let vh = &self.variable_header;

        MqttIpfix {
            source_ip_address: Some(l34.source_ip),
            destination_ip_address: Some(l34.destination_ip),
            protocol_identifier: Some(l34.protocol),
            source_transport_port: Some(l34.source_port),
            destination_transport_port: Some(l34.destination_port),
            flow_start_nanoseconds: Some(l34.timestamp_ns),
            flow_end_nanoseconds: Some(l34.timestamp_ns),
            flow_duration_microseconds: Some(0),
            mqtt_qos: Some(self.fixed_header.qos),
            mqtt_control_type: Some(self.fixed_header.control_type),
            mqtt_packet_id: vh.packet_id,
            mqtt_topic: vh.topic.clone(),
            mqtt_src_client_id: vh.src_client_id.clone(),
            mqtt_dst_client_id: vh.dst_client_id.clone(),
            mqtt_correlation_data: vh.correlation_data.clone(),
        }
    }
}

fn correlation_data(packet: &Packet, fixed_header: &FixedHeader) -> Option<Vec<u8>> {
    let payload = match packet.layer("tcp")?.field_bytes("tcp.payload")? {
        Ok(payload) => payload,
        Err(e) => {
            debug!("Ignoring correlation data: {}", e);
            return None;
        }
    };

    find_correlation_data(&payload, fixed_header.control_type, fixed_header.qos)
}

impl fmt::Display for MqttRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let l34 = &self.layer3_and_4;
        let vh = &self.variable_header;
        write!(
            f,
            "{} qos {} {} -> {} topic: {} packet id: {} clients: {} -> {}",
            self.fixed_header.control_type,
            self.fixed_header.qos,
            l34.source(),
            l34.destination(),
            vh.topic.as_deref().unwrap_or("-"),
            vh.packet_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            vh.src_client_id.as_deref().unwrap_or("-"),
            vh.dst_client_id.as_deref().unwrap_or("-")
        )?;

        if let Some(data) = &vh.correlation_data {
            write!(f, " correlation: {:02X?}", data)?;
        }
        Ok(())
    }
}

/******************************** CLIENT SESSIONS ********************************/

/// Client ids of both ends of a packet, as known when the packet was read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIds {
    pub source: Option<String>,
    pub destination: Option<String>,
}

/// Client identifiers by client socket, learned from CONNECT.
#[derive(Debug, Default)]
pub struct ClientSessions {
    ids: RwLock<HashMap<SocketAddr, String>>,
}

impl ClientSessions {
    /// Resolves the client ids of a packet and updates the bindings: CONNECT binds
    /// its client id to the source socket, DISCONNECT releases it.
    /// Packets must be tracked one at a time, in capture order.
    pub fn track(&self, packet: &Packet) -> ClientIds {
        let mqtt = match packet.layer("mqtt") {
            Some(mqtt) => mqtt,
            None => return ClientIds::default(),
        };
        let l34 = match Layer3And4::new(packet) {
            Ok(l34) => l34,
            Err(e) => {
                debug!("MQTT packet without transport: {}", e);
                return ClientIds::default();
            }
        };

        let control_type = match mqtt.field_u64("mqtt.msgtype") {
            Some(Ok(value)) => ControlType::from_u64(value),
            _ => None,
        };

        if control_type == Some(ControlType::Connect) {
            match mqtt.field("mqtt.clientid") {
                Some(client_id) => {
                    debug!("Client {} connected from {}", client_id, l34.source());
                    self.ids.write().unwrap_or_else(PoisonError::into_inner).insert(l34.source(), client_id);
                }
                None => debug!("CONNECT without client id"),
            }
        }

        let clients = ClientIds { source: self.client_id(&l34.source()), destination: self.client_id(&l34.destination()) };

        if control_type == Some(ControlType::Disconnect) {
            if let Some(id) = &clients.source {
                self.release(&l34.source(), id);
            }
        }

        clients
    }

    pub fn client_id(&self, addr: &SocketAddr) -> Option<String> {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).get(addr).cloned()
    }

    /// Removes the binding, unless the socket was reused by another client meanwhile.
    pub fn release(&self, addr: &SocketAddr, client_id: &str) {
        let mut ids = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        if ids.get(addr).map(|id| id == client_id).unwrap_or(false) {
            ids.remove(addr);
        }
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
