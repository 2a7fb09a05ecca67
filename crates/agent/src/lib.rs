pub mod bus;
pub mod command;
pub mod dispatcher;
pub mod registry;
pub mod watch;

pub use bus::MessageBus;
pub use command::Command;
pub use dispatcher::{format_outcome, WatchDispatcher};
pub use registry::{
    ActiveWatch, AdmissionError, NoActiveSession, SessionLease, SessionRegistry, WatchRegistry,
};
pub use watch::{AttemptError, Decision, WatchReport, WatchSession, WatchSettings};
