pub mod config;
pub mod logging;
pub mod metrics_server;
pub mod node;
pub mod service;

pub use config::NodeConfig;
pub use node::LabchainNode;
