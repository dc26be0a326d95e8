use log::{debug, error, info};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::entity::packet::PacketSource;
use crate::error::SourceError;
use crate::flow::table::FlowTable;
use crate::stats::{Counter, Stats};
use crate::threads::workers::WorkerPool;

/// Reads packets in capture order and hands one task per packet to the pool.
/// Returns the number of dispatched packets once the input ends, a read fails
/// or `stop` is raised.
pub fn listen<R: BufRead>(source: PacketSource<R>, table: Arc<FlowTable>, pool: &WorkerPool, stats: &Stats, stop: &AtomicBool) -> u64 {
    info!("Reading {} packets, {} workers", table.builder().protocol(), pool.size());
    let mut dispatched = 0;

    for packet in source {
        if stop.load(Ordering::Relaxed) {
            info!("Stop requested, closing the input");
            break;
        }

        let packet = match packet {
            Ok(packet) => packet,
            Err(e @ SourceError::Json { .. }) => {
                error!("{}", e);
                continue;
            }
            Err(e) => {
                error!("Error while reading packets: {}", e);
                break;
            }
        };
        stats.incr(Counter::Received);
        debug!("Received {}", packet);

        // client ids are resolved here, workers build packets in any order
        let clients = table.builder().track_sessions(&packet);

        let table = table.clone();
        if let Err(e) = pool.execute(move || {
            table.process_tracked(&packet, clients);
        }) {
            error!("{}", e);
            break;
        }
        dispatched += 1;
    }

    info!("Input closed after {} packets", dispatched);
    dispatched
}
