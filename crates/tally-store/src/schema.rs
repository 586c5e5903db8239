/// Aggregate table read by the poller. Idempotent: safe on every startup.
pub const CREATE_VOTES: &str = r#"
CREATE TABLE IF NOT EXISTS votes (
    id TEXT NOT NULL UNIQUE,
    vote TEXT NOT NULL
);
"#;

pub const COUNT_BY_CATEGORY: &str = "SELECT vote, COUNT(id) AS count FROM votes GROUP BY vote";

pub const PING: &str = "SELECT 1";

pub const PRAGMAS: &str = r#"
PRAGMA busy_timeout = 5000;
"#;
