//! Realtime socket infrastructure.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: owns the single active conversation socket, retries, self-heals
//!   and fans inbound frames out to listeners
//! - [`SocketTransport`]: opens sockets; [`raw::RawTransport`] passes frames through,
//!   [`cable::CableTransport`] speaks the ActionCable consumer protocol
//! - [`protocol`]: the subscribe / unsubscribe / message command frames

#[cfg(feature = "cable")]
pub mod cable;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub(crate) mod listener;
pub mod protocol;
#[cfg(feature = "raw")]
pub mod raw;
pub(crate) mod retry;
#[cfg(any(feature = "raw", feature = "cable"))]
pub(crate) mod socket;
pub mod traits;

pub use connection::ConnectionManager;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use listener::Listener;
pub use traits::*;
