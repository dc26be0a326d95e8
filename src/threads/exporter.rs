use byteorder::{BigEndian, ByteOrder};
use log::info;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ExportError;
use crate::flow::table::{ExportedFlow, FlowExporter};
use crate::ipfix::message::encode_message;
use crate::ipfix::template::{AddressFamily, IeCatalog};

pub const DEFAULT_DOMAIN_ID: u32 = 2;

/// Encodes admitted flows and sends one IPFIX message per flow to the collector.
pub struct Exporter {
    socket: UdpSocket,
    collector: SocketAddr,
    catalog: Arc<IeCatalog>,
    seq_number: AtomicU32,
    domain_id: u32,
}

impl Exporter {
    pub fn new(collector: SocketAddr, catalog: Arc<IeCatalog>, domain_id: u32) -> Result<Self, ExportError> {
        let local = if collector.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)?;
        info!("Exporting IPFIX messages from {} to {}", socket.local_addr()?, collector);

        Ok(Exporter { socket, collector, catalog, seq_number: AtomicU32::new(0), domain_id })
    }

    pub fn collector(&self) -> SocketAddr {
        self.collector
    }

    /// Number of data records exported so far, modulo 2^32.
    pub fn seq_number(&self) -> u32 {
        self.seq_number.load(Ordering::Relaxed)
    }

    /// Encodes one message for `flow`. The sequence number is only taken once
    /// the encoding succeeded.
    pub fn build_message(&self, flow: &ExportedFlow, export_time: u32) -> Result<Vec<u8>, ExportError> {
        let family = AddressFamily::from(&flow.record.layer3_and_4().source_ip);
        let template = self.catalog.template(family)?;
        let (values, _) = flow.ipfix_representation();

        let mut message = encode_message(&template, &values, export_time, 0, self.domain_id)?;
        let seq_number = self.seq_number.fetch_add(1, Ordering::Relaxed);
        BigEndian::write_u32(&mut message[8..12], seq_number);

        Ok(message)
    }
}

impl FlowExporter for Exporter {
    fn export(&self, flow: &ExportedFlow) -> Result<(), ExportError> {
        let message = self.build_message(flow, export_time())?;
        self.socket.send_to(&message, self.collector)?;
        info!("IPFIX message ({}) sent to {}", flow.record.kind(), self.collector);

        Ok(())
    }
}

fn export_time() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}
