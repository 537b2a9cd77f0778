//! SCP wire protocol responder.
//!
//! Drives the classic rcp/scp exchange over an already-established byte
//! stream: text control lines describe files and directories, single status
//! bytes pace each unit, and raw bytes carry file content. The responder
//! acts as the receiving side (`-t`, [`sink`]) or the sending side (`-f`,
//! [`source`]); [`server::Dispatcher`] picks one from the channel's
//! open-time descriptor.
//!
//! Authentication, path authorization and channel multiplexing belong to
//! the caller.

pub mod config;
pub mod error;
pub mod guard;
pub mod observer;
pub mod protocol;
pub mod server;
pub mod sink;
pub mod source;

pub use config::{ListingOrder, ResponderConfig};
pub use error::{Result, ScpError};
pub use guard::OpGuard;
pub use observer::{NullObserver, TracingObserver, TransferObserver};
pub use protocol::{ControlRecord, Role, ScpChannel, TransferRequest, TransferStats};
pub use server::Dispatcher;
