use config::{Config, ConfigError, File};
use log::LevelFilter;
use serde_derive::Deserialize;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

use crate::flow::table::OverflowPolicy;
use crate::flow::Protocol;
use crate::threads::exporter::DEFAULT_DOMAIN_ID;

/// Command line, every value overrides the config file.
#[derive(Debug, StructOpt)]
#[structopt(name = "iotflow", about = "Exports flows of dissected IoT packets as IPFIX")]
pub struct Opt {
    /// Config file (toml, yaml, json or ini)
    #[structopt(short, long, parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// IPFIX collector host
    #[structopt(long)]
    pub collector: Option<String>,

    /// IPFIX collector UDP port
    #[structopt(short, long)]
    pub port: Option<u16>,

    /// mqtt, coap or opcua
    #[structopt(long)]
    pub protocol: Option<Protocol>,

    /// Export $SYS topics too
    #[structopt(long)]
    pub sys_topic: bool,

    /// Flow table capacity, defaults to the protocol's own limit
    #[structopt(long)]
    pub max_flows: Option<usize>,

    /// reject or evict-oldest
    #[structopt(long)]
    pub overflow: Option<OverflowPolicy>,

    /// Log every exported record and the latency summary
    #[structopt(short, long)]
    pub benchmark: bool,

    #[structopt(short, long)]
    pub workers: Option<usize>,

    /// IPFIX Observation Domain ID
    #[structopt(long)]
    pub domain_id: Option<u32>,

    #[structopt(long)]
    pub log_level: Option<String>,

    /// Dissected packets, one JSON object per line. Reads stdin when absent
    #[structopt(short, long, parse(from_os_str))]
    pub input: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub level: String,
}

#[derive(Debug, Deserialize)]
pub struct Collector {
    pub host: String,
    pub port: u16,
    pub domain_id: u32,
}

#[derive(Debug, Deserialize)]
pub struct Probe {
    pub protocol: Protocol,
    pub sys_topic: bool,
    #[serde(default)]
    pub max_flows: Option<usize>,
    pub overflow: OverflowPolicy,
    pub benchmark: bool,
    pub workers: usize,
    pub queue_size: usize,
    #[serde(default)]
    pub input: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub log: Log,
    pub collector: Collector,
    pub probe: Probe,
}

impl Settings {
    pub fn init(opt: &Opt) -> Result<Self, ConfigError> {
        let mut s = Config::new();

        s.set_default("log.level", "info")?;
        s.set_default("collector.host", "127.0.0.1")?;
        s.set_default("collector.port", 4739i64)?;
        s.set_default("collector.domain_id", DEFAULT_DOMAIN_ID as i64)?;
        s.set_default("probe.protocol", "mqtt")?;
        s.set_default("probe.sys_topic", false)?;
        s.set_default("probe.overflow", "evict-oldest")?;
        s.set_default("probe.benchmark", false)?;
        s.set_default("probe.workers", 4i64)?;
        s.set_default("probe.queue_size", 1024i64)?;

        // surcharge the default config with the user config
        match &opt.config {
            Some(path) => {
                s.merge(File::from(path.clone()))?;
            }
            None => println!("No config provided, launching the app with the default configuration"),
        }

        // freeze the configuration
        let mut settings: Settings = s.try_into()?;
        settings.apply(opt);

        if settings.probe.max_flows == Some(0) {
            return Err(ConfigError::Message("probe.max_flows must be at least 1".to_string()));
        }
        Ok(settings)
    }

    fn apply(&mut self, opt: &Opt) {
        if let Some(host) = &opt.collector {
            self.collector.host = host.clone();
        }
        if let Some(port) = opt.port {
            self.collector.port = port;
        }
        if let Some(domain_id) = opt.domain_id {
            self.collector.domain_id = domain_id;
        }
        if let Some(protocol) = opt.protocol {
            self.probe.protocol = protocol;
        }
        if opt.sys_topic {
            self.probe.sys_topic = true;
        }
        if opt.max_flows.is_some() {
            self.probe.max_flows = opt.max_flows;
        }
        if let Some(overflow) = opt.overflow {
            self.probe.overflow = overflow;
        }
        if opt.benchmark {
            self.probe.benchmark = true;
        }
        if let Some(workers) = opt.workers {
            self.probe.workers = workers;
        }
        if let Some(level) = &opt.log_level {
            self.log.level = level.clone();
        }
        if opt.input.is_some() {
            self.probe.input = opt.input.clone();
        }
    }

    pub fn collector_addr(&self) -> io::Result<SocketAddr> {
        (self.collector.host.as_str(), self.collector.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for collector {}", self.collector.host)))
    }
}

pub fn init_logger(level: &str) {
    let mut logger = env_logger::Builder::new();
    logger.format_timestamp_millis();
    logger.filter(None, LevelFilter::from_str(level).unwrap_or(LevelFilter::Info));
    logger.init();
}
