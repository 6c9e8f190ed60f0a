pub mod connection;
pub mod dispatcher;
pub mod keepalive;
pub mod registry;
pub mod server;

pub use connection::{
    AcceptedToken, ConnectionController, ConnectionSnapshot, ControllerContext, ControllerHandle,
    SendStatus,
};
pub use dispatcher::{DispatchOutcome, OutboundDispatcher};
pub use keepalive::{KeepAliveState, KeepAliveStats};
pub use registry::ControllerRegistry;
pub use server::{AstmServer, InstrumentStatus, ServerStatus};
