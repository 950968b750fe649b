// Main library module for the Cumulus server
// Hosts a single cluster member on a TCP transport

pub mod metrics; // Metric descriptions
pub mod model; // Command line and configuration loading
pub mod startup; // Logging and shutdown
pub mod transport; // TCP transport

pub use model::config::{Cli, load_configuration};
pub use transport::TcpTransport;
