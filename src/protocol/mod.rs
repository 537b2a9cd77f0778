//! SCP wire protocol.
//!
//! Half-duplex per unit over a full-duplex channel: whoever sends a control
//! line or a content block waits for one status byte before sending the
//! next unit.

pub mod ack;
pub mod channel;
pub mod record;
pub mod request;

pub use ack::{AckStatus, ACK_FATAL, ACK_OK, ACK_WARNING};
pub use channel::{ScpChannel, TransferStats, BLOCK_SIZE, MAX_LINE_LEN};
pub use record::{is_valid_name, ControlRecord, Severity, MODE_MASK};
pub use request::{Role, TransferRequest};
