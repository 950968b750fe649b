//! Network transports for the server

pub mod frame;
pub mod tcp;

pub use tcp::TcpTransport;
