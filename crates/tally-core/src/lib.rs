pub mod errors;
pub mod ids;
pub mod tally;

pub use errors::{ConnectError, DeliveryError, QueryError};
pub use ids::{ChannelName, ConnectionId};
pub use tally::{CategorySet, Tally};
