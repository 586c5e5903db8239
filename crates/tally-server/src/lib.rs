pub mod client;
pub mod hub;
pub mod poller;
pub mod server;
pub mod wire;

pub use hub::{BroadcastHub, DeliveryReport, HubStats};
pub use poller::{PollStats, PollStatsSnapshot, Poller};
pub use server::{AppState, ServerConfig, ServerHandle, build_router, start};
