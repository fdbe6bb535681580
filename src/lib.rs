pub mod config;
pub mod server;

pub use config::{get_config_path, get_sigrelay_dir, Config};
pub use server::SignalServer;
pub use sigrelay_relay::{Inbound, Outbound, Registry, RelayState};
