pub mod entity;
pub mod error;
pub mod flow;
pub mod ipfix;
pub mod stats;
pub mod threads;
pub mod utils;
