use std::io;

use thiserror::Error;

use crate::ipfix::template::DataType;

/// Reasons a dissected packet could not be turned into a flow record.
#[derive(Error, Debug, PartialEq)]
pub enum RecordError {
    /// The packet does not carry the selected protocol; callers drop it silently.
    #[error("packet does not belong to the {0} protocol")]
    NotThisProtocol(&'static str),

    /// No extraction path exists for this packet or protocol.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// A layer is present but one of its fields cannot be read.
    #[error("malformed field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },

    /// Dropped on purpose, e.g. a `$SYS/` topic while those are excluded.
    #[error("filtered: {0}")]
    Filtered(String),
}

/// Errors raised while encoding or sending an IPFIX message.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("vendor information elements were not registered before building the template")]
    TemplateNotRegistered,

    #[error("value of {ie} does not fit in {width} bytes")]
    EncodingOverflow { ie: &'static str, width: u16 },

    #[error("{ie} expects a {expected} value")]
    TypeMismatch { ie: &'static str, expected: DataType },

    #[error("no value provided for {0}")]
    MissingValue(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Flow table admission failures.
#[derive(Error, Debug, PartialEq)]
pub enum TableError {
    #[error("flow table is full ({max_flows} flows)")]
    CapacityExceeded { max_flows: usize },
}

/// Failures while reading dissected packets from the input stream.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid packet on line {line}: {source}")]
    Json { line: usize, source: serde_json::Error },
}
