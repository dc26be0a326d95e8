//! Dissected packet builders shared by the unit tests.

use serde_json::{json, Map, Value};
use std::net::SocketAddr;

use crate::entity::packet::Packet;

pub const BROKER: &str = "10.0.0.1:1883";

fn layers(src: &str, dst: &str, mqtt: Value, payload: &[u8]) -> Map<String, Value> {
    let src: SocketAddr = src.parse().unwrap();
    let dst: SocketAddr = dst.parse().unwrap();

    let ip = if src.is_ipv4() {
        json!({"ip": {"ip.src": src.ip().to_string(), "ip.dst": dst.ip().to_string(), "ip.proto": "6"}})
    } else {
        json!({"ipv6": {"ipv6.src": src.ip().to_string(), "ipv6.dst": dst.ip().to_string(), "ipv6.nxt": "6"}})
    };

    let mut layers = ip.as_object().unwrap().clone();
    layers.insert(
        "tcp".to_string(),
        json!({"tcp.srcport": src.port().to_string(), "tcp.dstport": dst.port().to_string(), "tcp.payload": hex::encode(payload)}),
    );
    if !mqtt.is_null() {
        layers.insert("mqtt".to_string(), mqtt);
    }

    layers
}

fn vbi(mut value: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Raw MQTT v5 PUBLISH bytes, with a Correlation Data property when given.
pub fn publish_bytes(topic: &str, qos: u8, packet_id: u16, correlation: Option<&[u8]>) -> Vec<u8> {
    let mut properties = vec![];
    if let Some(value) = correlation {
        properties.push(0x09);
        properties.extend_from_slice(&(value.len() as u16).to_be_bytes());
        properties.extend_from_slice(value);
    }

    let mut body = vec![];
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    if qos > 0 {
        body.extend_from_slice(&packet_id.to_be_bytes());
    }
    vbi(properties.len(), &mut body);
    body.extend_from_slice(&properties);
    body.extend_from_slice(b"21.5");

    let mut packet = vec![0x30 | (qos << 1)];
    vbi(body.len(), &mut packet);
    packet.extend_from_slice(&body);
    packet
}

pub fn connect(ts: u64, src: &str, dst: &str, client_id: &str) -> Packet {
    let mqtt = json!({"mqtt.msgtype": "1", "mqtt.clientid": client_id, "mqtt.clientid_len": client_id.len().to_string()});
    Packet::new(ts, layers(src, dst, mqtt, &[0x10, 0x00]))
}

pub fn disconnect(ts: u64, src: &str, dst: &str) -> Packet {
    Packet::new(ts, layers(src, dst, json!({"mqtt.msgtype": "14"}), &[0xe0, 0x00]))
}

pub fn publish(ts: u64, src: &str, dst: &str, topic: &str, qos: u8, packet_id: u16, correlation: Option<&[u8]>) -> Packet {
    let mut mqtt = json!({"mqtt.msgtype": "3", "mqtt.qos": qos.to_string(), "mqtt.topic": topic});
    if qos > 0 {
        mqtt["mqtt.msgid"] = json!(packet_id.to_string());
    }
    Packet::new(ts, layers(src, dst, mqtt, &publish_bytes(topic, qos, packet_id, correlation)))
}

/// PUBACK (4), PUBREC (5), PUBREL (6) or PUBCOMP (7).
pub fn ack(ts: u64, src: &str, dst: &str, msgtype: u8, packet_id: u16) -> Packet {
    let mqtt = json!({"mqtt.msgtype": msgtype.to_string(), "mqtt.msgid": packet_id.to_string()});
    let mut raw = vec![msgtype << 4, 0x02];
    raw.extend_from_slice(&packet_id.to_be_bytes());
    Packet::new(ts, layers(src, dst, mqtt, &raw))
}

pub fn plain_tcp(ts: u64, src: &str, dst: &str) -> Packet {
    Packet::new(ts, layers(src, dst, Value::Null, &[0x01, 0x02]))
}
