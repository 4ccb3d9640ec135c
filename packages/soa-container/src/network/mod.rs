//! TCP transport: framing, connection tracking, shutdown control and the
//! server loop.

pub mod codec;
pub mod connection;
pub mod server;
pub mod shutdown;

pub use codec::{FrameCodec, FrameError};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionRegistry, OutboundMessage};
pub use server::{ServerSettings, SoaServer};
pub use shutdown::{InFlightGuard, ServingState, ShutdownController};
