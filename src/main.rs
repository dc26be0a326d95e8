use log::{error, info, warn};
use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use structopt::StructOpt;

use iotflow::entity::packet::PacketSource;
use iotflow::flow::table::FlowTable;
use iotflow::flow::{Protocol, RecordBuilder};
use iotflow::ipfix::template::IeCatalog;
use iotflow::stats::Stats;
use iotflow::threads::exporter::Exporter;
use iotflow::threads::listener;
use iotflow::threads::workers::WorkerPool;
use iotflow::utils::{self, Opt, Settings};

fn main() {
    let opt = Opt::from_args();

    // read config from file and command line
    let settings = match Settings::init(&opt) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    // init the env logger
    utils::init_logger(&settings.log.level);

    warn! {"Starting APP"}

    if let Err(e) = run(settings) {
        error!("{}", e);
        process::exit(1);
    }

    info! {"Closing APP"}
}

fn run(settings: Settings) -> Result<(), Box<dyn Error>> {
    if settings.probe.protocol != Protocol::Mqtt {
        warn!("{} records are not implemented yet, every packet will be skipped", settings.probe.protocol);
    }

    let catalog = Arc::new(IeCatalog::new());
    catalog.register_vendor_ies();

    let exporter = Arc::new(Exporter::new(settings.collector_addr()?, catalog, settings.collector.domain_id)?);
    let stats = Arc::new(Stats::new());
    let builder = RecordBuilder::new(settings.probe.protocol, settings.probe.sys_topic);
    let table = FlowTable::new(builder, settings.probe.max_flows, settings.probe.overflow, exporter, stats.clone()).with_benchmark(settings.probe.benchmark);
    let table = Arc::new(table);

    let input: Box<dyn BufRead + Send> = match &settings.probe.input {
        Some(path) => {
            info!("Reading packets from {}", path.display());
            Box::new(BufReader::new(File::open(path)?))
        }
        None => Box::new(BufReader::new(io::stdin())),
    };

    let pool = WorkerPool::new(settings.probe.workers, settings.probe.queue_size)?;
    let listener_stats = stats.clone();
    let listener = thread::Builder::new().name("listener".to_string()).spawn(move || {
        let stop = AtomicBool::new(false);
        listener::listen(PacketSource::new(input), table, &pool, &listener_stats, &stop);
        // in-flight packets are exported before the pool goes away
        pool.join();
    })?;

    listener.join().map_err(|_| "listener thread panicked")?;

    if settings.probe.benchmark {
        stats.log_summary();
    }

    Ok(())
}
