pub mod resolver;
pub mod tcp_transport;
