//! Chunked, encrypted, resumable transfer pipeline.

pub mod chunker;
pub mod receiver;
pub mod sender;

pub use receiver::IncomingTransfers;
pub use sender::{prepare_backup, send_backup, transfer_id, AckEvent, AckRouter};
