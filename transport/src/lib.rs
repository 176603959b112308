pub mod constants;
pub mod error;
pub mod net;
pub mod state;

// Re-export commonly used types
pub use error::TransportError;
pub use net::{
    resolver::{Resolver, SystemResolver},
    tcp_transport::{TcpTransport, TransportConfig},
};
pub use state::{ConnectionState, Incoming};
