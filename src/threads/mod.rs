pub mod exporter;
pub mod listener;
pub mod workers;
