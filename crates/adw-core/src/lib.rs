pub mod config;
pub mod models;
pub mod naming;
pub mod paths;
pub mod ports;
pub mod results;
pub mod retry;
pub mod state;
pub mod stream;
pub mod types;

pub use config::Config;
pub use models::{ModelChoice, ModelTable};
pub use paths::RunPaths;
pub use ports::{PortAllocator, PortPair, PortRanges};
pub use retry::RetryPolicy;
pub use state::{RunState, RunStateUpdate, StateStore};
pub use types::*;
