pub mod aggregate;
pub mod connector;
pub mod database;
pub mod error;
pub mod schema;

pub use aggregate::{Aggregator, VoteSource};
pub use connector::{Acquired, Connect, ConnectorState, RetryPolicy, SqliteConnector, StoreConnector};
pub use database::Database;
pub use error::StoreError;
