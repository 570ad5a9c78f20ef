pub mod log_record;

pub use log_record::{LogPayload, LogRecord, LogStream, Lsn, INVALID_LSN};
