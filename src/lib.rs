pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod reassembly;
pub mod service;
pub mod util;
pub mod test_util;
