use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tally_core::ConnectError;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::database::Database;
use crate::error::StoreError;

/// Backend-specific half of acquisition: how to open a handle and how to
/// ensure the aggregate table exists on it.
///
/// Implementations backed by blocking clients must keep that work off the
/// async runtime threads.
#[async_trait]
pub trait Connect: Send + Sync {
    type Conn: Send + Sync + 'static;

    async fn open(&self) -> Result<Self::Conn, StoreError>;

    async fn ensure_schema(&self, conn: &Self::Conn) -> Result<(), StoreError>;
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Database(format!("store task: {e}")))?
}

/// Opens the SQLite votes database at a fixed path.
#[derive(Clone, Debug)]
pub struct SqliteConnector {
    pub path: PathBuf,
    pub create_if_missing: bool,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>, create_if_missing: bool) -> Self {
        Self {
            path: path.into(),
            create_if_missing,
        }
    }
}

#[async_trait]
impl Connect for SqliteConnector {
    type Conn = Database;

    async fn open(&self) -> Result<Database, StoreError> {
        let path = self.path.clone();
        let create_if_missing = self.create_if_missing;
        run_blocking(move || {
            let db = Database::open(&path, create_if_missing)?;
            db.ping()?;
            Ok(db)
        })
        .await
    }

    async fn ensure_schema(&self, conn: &Database) -> Result<(), StoreError> {
        let db = conn.clone();
        run_blocking(move || db.ensure_schema()).await
    }
}

/// Fixed-interval retry bound for acquisition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1000,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of the store connection.
///
/// `Connecting` loops on transient failures; `Fatal` is terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    Fatal,
}

impl ConnectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected => "connected",
            Self::Fatal => "fatal",
        }
    }
}

/// A live handle plus how many attempts it took.
#[derive(Debug)]
pub struct Acquired<C> {
    pub conn: C,
    pub attempts: u32,
}

/// Owns acquisition of the store connection and publishes its state.
pub struct StoreConnector<C: Connect> {
    connect: C,
    policy: RetryPolicy,
    state: watch::Sender<ConnectorState>,
    fatal: Mutex<Option<ConnectError>>,
}

impl<C: Connect> StoreConnector<C> {
    pub fn new(connect: C, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectorState::Disconnected);
        Self {
            connect,
            policy,
            state,
            fatal: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectorState {
        self.state.borrow().clone()
    }

    /// Watch state transitions (used by the health endpoint).
    pub fn subscribe(&self) -> watch::Receiver<ConnectorState> {
        self.state.subscribe()
    }

    /// Record that the current handle stopped working. No-op once fatal.
    pub fn mark_disconnected(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, ConnectorState::Fatal) {
                return false;
            }
            *state = ConnectorState::Disconnected;
            true
        });
    }

    /// Open a connection, retrying transient failures, then ensure the schema.
    ///
    /// Schema failures are never retried. Once fatal, every later call
    /// returns the same error without touching the store.
    pub async fn acquire(&self) -> Result<Acquired<C::Conn>, ConnectError> {
        if let Some(err) = self.fatal.lock().clone() {
            return Err(err);
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.state.send_replace(ConnectorState::Connecting { attempt });

            let conn = match self.connect.open().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "waiting for store");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.retry_interval).await;
                    }
                    continue;
                }
            };

            info!(attempt, "connected to store");

            if let Err(e) = self.connect.ensure_schema(&conn).await {
                error!(error = %e, "schema precondition failed, polling will not start");
                return Err(self.fail(ConnectError::Schema(e.to_string())));
            }
            info!("votes table ready");

            self.state.send_replace(ConnectorState::Connected);
            return Ok(Acquired {
                conn,
                attempts: attempt,
            });
        }

        error!(attempts = max_attempts, error = %last_error, "giving up on store");
        Err(self.fail(ConnectError::Exhausted {
            attempts: max_attempts,
            last_error,
        }))
    }

    fn fail(&self, err: ConnectError) -> ConnectError {
        *self.fatal.lock() = Some(err.clone());
        self.state.send_replace(ConnectorState::Fatal);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Fails `open` a fixed number of times, then succeeds.
    struct Scripted {
        failures: u32,
        schema_ok: bool,
        opens: AtomicU32,
        schema_calls: AtomicU32,
    }

    impl Scripted {
        fn new(failures: u32, schema_ok: bool) -> Self {
            Self {
                failures,
                schema_ok,
                opens: AtomicU32::new(0),
                schema_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Connect for Scripted {
        type Conn = u32;

        async fn open(&self) -> Result<u32, StoreError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(StoreError::Unavailable(format!("refused #{n}")))
            } else {
                Ok(n)
            }
        }

        async fn ensure_schema(&self, _conn: &u32) -> Result<(), StoreError> {
            self.schema_calls.fetch_add(1, Ordering::SeqCst);
            if self.schema_ok {
                Ok(())
            } else {
                Err(StoreError::Database("permission denied".into()))
            }
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(Level, String)>>>);

    struct MessageVisitor(String);

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: Subscriber> Layer<S> for Recorder {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.0.lock().push((*event.metadata().level(), visitor.0));
        }
    }

    impl Recorder {
        fn count(&self, message: &str) -> usize {
            self.0.lock().iter().filter(|(_, m)| m == message).count()
        }

        fn messages(&self) -> Vec<String> {
            self.0.lock().iter().map(|(_, m)| m.clone()).collect()
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            retry_interval: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_connects() {
        let recorder = Recorder::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(recorder.clone()),
        );

        let connector = StoreConnector::new(Scripted::new(3, true), policy(10));
        let started = tokio::time::Instant::now();
        let acquired = connector.acquire().await.unwrap();

        assert_eq!(acquired.attempts, 4);
        assert_eq!(acquired.conn, 4);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(connector.state(), ConnectorState::Connected);

        assert_eq!(recorder.count("waiting for store"), 3);
        assert_eq!(recorder.count("connected to store"), 1);
        assert_eq!(recorder.count("giving up on store"), 0);

        // Retries come first, then the connect event, then the schema check.
        let messages = recorder.messages();
        let connected = messages.iter().position(|m| m == "connected to store").unwrap();
        let ready = messages.iter().position(|m| m == "votes table ready").unwrap();
        assert!(messages[..connected].iter().all(|m| m == "waiting for store" || m.is_empty()));
        assert!(ready > connected);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_fatal() {
        let recorder = Recorder::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(recorder.clone()),
        );

        let connector = StoreConnector::new(Scripted::new(u32::MAX, true), policy(3));
        let err = connector.acquire().await.unwrap_err();

        assert_eq!(
            err,
            ConnectError::Exhausted {
                attempts: 3,
                last_error: "store unavailable: refused #3".into(),
            }
        );
        assert_eq!(connector.state(), ConnectorState::Fatal);
        assert_eq!(recorder.count("waiting for store"), 3);
        assert_eq!(recorder.count("giving up on store"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn schema_failure_is_fatal_and_not_retried() {
        let scripted = Scripted::new(0, false);
        let connector = StoreConnector::new(scripted, policy(10));

        let err = connector.acquire().await.unwrap_err();
        assert_eq!(err, ConnectError::Schema("database error: permission denied".into()));
        assert_eq!(connector.state(), ConnectorState::Fatal);
        assert_eq!(connector.connect.opens.load(Ordering::SeqCst), 1);
        assert_eq!(connector.connect.schema_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_is_terminal() {
        let connector = StoreConnector::new(Scripted::new(0, false), policy(10));
        let first = connector.acquire().await.unwrap_err();

        connector.mark_disconnected();
        assert_eq!(connector.state(), ConnectorState::Fatal);

        let second = connector.acquire().await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(connector.connect.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reacquire_after_disconnect() {
        let connector = StoreConnector::new(Scripted::new(0, true), policy(10));
        let first = connector.acquire().await.unwrap();
        connector.mark_disconnected();
        assert_eq!(connector.state(), ConnectorState::Disconnected);

        let second = connector.acquire().await.unwrap();
        assert_eq!(second.attempts, 1);
        assert_ne!(first.conn, second.conn);
        assert_eq!(connector.connect.schema_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn state_changes_are_observable() {
        let connector = StoreConnector::new(Scripted::new(1, true), policy(5));
        let rx = connector.subscribe();
        assert_eq!(*rx.borrow(), ConnectorState::Disconnected);

        connector.acquire().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectorState::Connected);
        assert_eq!(ConnectorState::Connected.as_str(), "connected");
    }

    #[tokio::test]
    async fn sqlite_connector_creates_schema() {
        let dir = std::env::temp_dir().join(format!("tally-connector-{}", uuid::Uuid::now_v7()));
        let connector =
            StoreConnector::new(SqliteConnector::new(dir.join("votes.db"), true), policy(1));

        let acquired = connector.acquire().await.unwrap();
        assert_eq!(acquired.attempts, 1);
        assert!(acquired.conn.count_by_category().unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn sqlite_connector_waits_for_missing_file() {
        let dir = std::env::temp_dir().join(format!("tally-connector-{}", uuid::Uuid::now_v7()));
        let connector = StoreConnector::new(
            SqliteConnector::new(dir.join("votes.db"), false),
            RetryPolicy {
                max_attempts: 2,
                retry_interval: Duration::from_millis(10),
            },
        );

        let err = connector.acquire().await.unwrap_err();
        assert_eq!(err.error_kind(), "exhausted");
        assert!(!dir.exists());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn locked_store_does_not_stall_the_runtime() {
        let dir = std::env::temp_dir().join(format!("tally-connector-{}", uuid::Uuid::now_v7()));
        let path = dir.join("votes.db");
        let holder = Database::open(&path, true).unwrap();
        holder
            .with_conn(|conn| {
                conn.execute_batch("BEGIN EXCLUSIVE")?;
                Ok(())
            })
            .unwrap();
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            holder
                .with_conn(|conn| {
                    conn.execute_batch("COMMIT")?;
                    Ok(())
                })
                .unwrap();
        });

        let max_gap = Arc::new(Mutex::new(Duration::ZERO));
        let ticker_gap = Arc::clone(&max_gap);
        let ticker = tokio::spawn(async move {
            let mut last = std::time::Instant::now();
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let now = std::time::Instant::now();
                let mut gap = ticker_gap.lock();
                *gap = (*gap).max(now - last);
                last = now;
            }
        });

        let connector = StoreConnector::new(SqliteConnector::new(&path, false), policy(1));
        let acquired = connector.acquire().await.unwrap();
        ticker.abort();
        release.join().unwrap();

        assert_eq!(acquired.attempts, 1);
        let gap = *max_gap.lock();
        assert!(gap < Duration::from_millis(200), "runtime stalled for {gap:?}");

        drop(acquired);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
