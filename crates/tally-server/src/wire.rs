use serde::{Deserialize, Serialize};
use tally_core::{ChannelName, Tally};

/// Server → client envelope: `{ "event": <kind>, "data": <payload> }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once to a new connection.
    Welcome { text: String },
    /// The tally as a JSON-encoded string, e.g. `"{\"a\":3,\"b\":5}"`.
    Scores(String),
}

impl ServerMessage {
    pub fn scores(tally: &Tally) -> Result<Self, serde_json::Error> {
        Ok(Self::Scores(tally.to_json()?))
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client → server envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channel: ChannelName },
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
