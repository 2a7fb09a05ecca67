pub mod config;
pub mod deadline;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use config::Config;
pub use deadline::{with_deadline, DeadlineExceeded};
pub use error::{Error, Result};
pub use message::{InboundMessage, OutboundMessage};
pub use paths::Paths;
pub use types::{ElementSnapshot, FailureReason, Outcome, WatchRequest};
