//! A single pooled session and its physical connection.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_postgres::error::{DbError, SqlState};
use tokio_postgres::types::ToSql;
use tokio_postgres::{AsyncMessage, Client, NoTls, Row};
use tracing::{Span, debug, warn};

use crate::error::{PgError, PgResult, describe, sanitize_message};
use crate::failover::FailoverCallback;
use crate::statement::{PreparedStatements, StatementSet};

/// Lifecycle of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No physical connection.
    Disconnected,
    /// Connected, bring-up not finished.
    Connecting,
    /// Initialized and usable.
    Ready,
    /// A fault was detected and reconnection is in progress.
    Reconnecting,
    /// Reconnection was given up; every use fails.
    PermanentlyFailed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::PermanentlyFailed => "permanently failed",
        };
        f.write_str(name)
    }
}

/// A live client plus the task driving its socket.
pub(crate) struct RawConnection {
    client: Client,
    notices: Option<mpsc::UnboundedReceiver<DbError>>,
    driver: JoinHandle<()>,
}

impl RawConnection {
    /// Connect and spawn the connection driver. Server notices are buffered
    /// until a forwarder is attached.
    pub(crate) async fn open(config: &tokio_postgres::Config) -> Result<Self, tokio_postgres::Error> {
        let (client, mut connection) = config.connect(NoTls).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notice(notice)) => {
                        let _ = tx.send(notice);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %describe(&e), "PostgreSQL connection terminated");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client,
            notices: Some(rx),
            driver,
        })
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Drop the client and wait for the driver to finish the shutdown
    /// handshake.
    pub(crate) async fn close(self) {
        let Self { client, driver, .. } = self;
        drop(client);
        let _ = driver.await;
    }
}

/// One physical database session occupying a pool slot.
///
/// Sessions are used exclusively by whoever leased them. Faults are detected
/// on use: a closed connection triggers the bound failover callback inline,
/// and a session whose callback gave up reports
/// [`PgError::ReconnectExhausted`] on every later call.
pub struct Session {
    slot: usize,
    state: SessionState,
    conn: Option<RawConnection>,
    statements: PreparedStatements,
    compilations: u32,
    failover: Option<Arc<Mutex<FailoverCallback>>>,
}

impl Session {
    /// Open a session for `slot`.
    pub(crate) async fn open(slot: usize, config: &tokio_postgres::Config) -> PgResult<Self> {
        let mut session = Self::disconnected(slot);
        session.state = SessionState::Connecting;
        let raw = RawConnection::open(config)
            .await
            .map_err(|e| PgError::connection(describe(&e)))?;
        session.conn = Some(raw);
        Ok(session)
    }

    pub(crate) fn disconnected(slot: usize) -> Self {
        Self {
            slot,
            state: SessionState::Disconnected,
            conn: None,
            statements: PreparedStatements::default(),
            compilations: 0,
            failover: None,
        }
    }

    /// Pool slot of this session. Slot 0 is the primary.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if the session is usable right now.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Statements compiled on the current connection.
    pub fn prepared(&self) -> &PreparedStatements {
        &self.statements
    }

    /// How many times the statement set has been compiled on this slot:
    /// once at bring-up plus once per successful reconnection.
    pub fn compilations(&self) -> u32 {
        self.compilations
    }

    /// Check if a failover callback is bound.
    pub fn has_failover(&self) -> bool {
        self.failover.is_some()
    }

    /// Raw client access without fault handling, used during bring-up.
    pub(crate) fn client(&self) -> PgResult<&Client> {
        self.conn
            .as_ref()
            .map(RawConnection::client)
            .ok_or_else(|| PgError::connection(format!("session {} is not connected", self.slot)))
    }

    pub(crate) fn bind_failover(&mut self, callback: Arc<Mutex<FailoverCallback>>) {
        self.failover = Some(callback);
    }

    /// Route buffered and future server notices to `log` at debug level.
    pub(crate) fn forward_notices(&mut self, log: Span) {
        let Some(mut notices) = self.conn.as_mut().and_then(|c| c.notices.take()) else {
            return;
        };
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                debug!(
                    parent: &log,
                    severity = notice.severity(),
                    "{}",
                    sanitize_message(notice.message())
                );
            }
        });
    }

    pub(crate) async fn compile_statements(&mut self, set: &StatementSet) -> PgResult<()> {
        let compiled = set.compile(self.client()?).await?;
        self.statements = compiled;
        self.compilations += 1;
        Ok(())
    }

    pub(crate) fn mark_ready(&mut self) {
        self.state = SessionState::Ready;
    }

    /// Swap in a fresh physical connection. Compiled statements belonged to
    /// the old one and are discarded.
    pub(crate) fn replace_connection(&mut self, raw: RawConnection) {
        // The old connection is already broken; dropping it is enough.
        self.conn = Some(raw);
        self.statements = PreparedStatements::default();
    }

    /// Make sure the session can be used, reconnecting inline if the
    /// connection was found closed.
    ///
    /// A failover interrupted by a dropped caller leaves the session
    /// `Reconnecting`; the next use resumes it with the same strategy.
    /// The call that runs a failover to exhaustion gets a `Connection`
    /// error; later calls get [`PgError::ReconnectExhausted`].
    pub async fn ensure_ready(&mut self) -> PgResult<()> {
        match self.state {
            SessionState::PermanentlyFailed => Err(self.exhausted().await),
            SessionState::Ready => {
                let closed = self.conn.as_ref().is_none_or(|c| c.client.is_closed());
                if !closed {
                    return Ok(());
                }
                warn!(slot = self.slot, "Session connection found closed");
                self.recover().await
            }
            SessionState::Reconnecting => {
                warn!(slot = self.slot, "Resuming interrupted failover");
                self.recover().await
            }
            state => Err(PgError::connection(format!(
                "session {} is {}",
                self.slot, state
            ))),
        }
    }

    async fn recover(&mut self) -> PgResult<()> {
        match self.fail_over().await {
            Ok(()) => Ok(()),
            Err(failover) => {
                warn!(slot = self.slot, error = %failover, "Session failover failed");
                Err(PgError::connection(format!(
                    "session {} lost its connection",
                    self.slot
                )))
            }
        }
    }

    async fn exhausted(&self) -> PgError {
        let attempts = match &self.failover {
            Some(callback) => callback.lock().await.attempts_made(),
            None => 0,
        };
        PgError::ReconnectExhausted {
            slot: self.slot,
            attempts,
        }
    }

    /// Run the bound failover callback. Without one, the first fault is final.
    async fn fail_over(&mut self) -> PgResult<()> {
        self.state = SessionState::Reconnecting;
        self.conn = None;
        self.statements = PreparedStatements::default();

        let Some(callback) = self.failover.clone() else {
            self.state = SessionState::PermanentlyFailed;
            return Err(PgError::ReconnectExhausted {
                slot: self.slot,
                attempts: 0,
            });
        };

        let mut callback = callback.lock().await;
        match callback.reconnect(self).await {
            Ok(()) => {
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.conn = None;
                self.state = SessionState::PermanentlyFailed;
                Err(e)
            }
        }
    }

    /// Turn a driver error into a [`PgError`], failing over first when the
    /// error means the connection is gone. The call itself is not replayed.
    async fn check<T>(&mut self, result: Result<T, tokio_postgres::Error>) -> PgResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let client_closed = self.conn.as_ref().is_none_or(|c| c.client.is_closed());
                if is_connection_fault(&e, client_closed) {
                    let message = describe(&e);
                    warn!(slot = self.slot, error = %message, "Connection fault detected");
                    if let Err(failover) = self.fail_over().await {
                        warn!(slot = self.slot, error = %failover, "Session failover failed");
                    }
                    return Err(PgError::Connection(message));
                }
                Err(PgError::from(e))
            }
        }
    }

    /// Execute a query and return all rows.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> PgResult<Vec<Row>> {
        self.ensure_ready().await?;
        debug!(slot = self.slot, sql = %sql, "Executing query");
        let result = self.client()?.query(sql, params).await;
        self.check(result).await
    }

    /// Execute a query and return exactly one row.
    pub async fn query_one(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<Row> {
        self.ensure_ready().await?;
        debug!(slot = self.slot, sql = %sql, "Executing query_one");
        let result = self.client()?.query_one(sql, params).await;
        self.check(result).await
    }

    /// Execute a query and return zero or one row.
    pub async fn query_opt(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> PgResult<Option<Row>> {
        self.ensure_ready().await?;
        debug!(slot = self.slot, sql = %sql, "Executing query_opt");
        let result = self.client()?.query_opt(sql, params).await;
        self.check(result).await
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> PgResult<u64> {
        self.ensure_ready().await?;
        debug!(slot = self.slot, sql = %sql, "Executing statement");
        let result = self.client()?.execute(sql, params).await;
        self.check(result).await
    }

    /// Execute a batch of statements in a single round-trip.
    pub async fn batch_execute(&mut self, sql: &str) -> PgResult<()> {
        self.ensure_ready().await?;
        debug!(slot = self.slot, "Executing batch");
        let result = self.client()?.batch_execute(sql).await;
        self.check(result).await
    }

    /// Run a compiled statement and return all rows.
    pub async fn query_prepared(
        &mut self,
        name: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> PgResult<Vec<Row>> {
        self.ensure_ready().await?;
        let statement = self.statements.require(name)?.clone();
        let result = self.client()?.query(&statement, params).await;
        self.check(result).await
    }

    /// Run a compiled statement and return the number of affected rows.
    pub async fn execute_prepared(
        &mut self,
        name: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> PgResult<u64> {
        self.ensure_ready().await?;
        let statement = self.statements.require(name)?.clone();
        let result = self.client()?.execute(&statement, params).await;
        self.check(result).await
    }

    /// Server process id backing this session.
    pub async fn backend_pid(&mut self) -> PgResult<i32> {
        let row = self.query_one("SELECT pg_backend_pid()", &[]).await?;
        Ok(row.get(0))
    }

    /// Close the physical connection.
    pub async fn close(mut self) {
        self.state = SessionState::Disconnected;
        if let Some(raw) = self.conn.take() {
            raw.close().await;
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("slot", &self.slot)
            .field("state", &self.state)
            .field("prepared", &self.statements.len())
            .field("failover", &self.failover.is_some())
            .finish()
    }
}

/// Whether a driver error means the physical connection is unusable.
fn is_connection_fault(err: &tokio_postgres::Error, client_closed: bool) -> bool {
    if err.is_closed() || client_closed {
        return true;
    }
    err.code().is_some_and(is_connection_state)
}

fn is_connection_state(code: &SqlState) -> bool {
    code.code().starts_with("08")
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PgOptions;
    use crate::failover::{FailoverCallbackHolder, FailoverCoordinator, ReconnectOptions};
    use crate::initializer::SessionInitializer;
    use crate::reconnect::KTimesReconnectionStrategyFactory;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_connection_states() {
        assert!(is_connection_state(&SqlState::ADMIN_SHUTDOWN));
        assert!(is_connection_state(&SqlState::CONNECTION_FAILURE));
        assert!(is_connection_state(&SqlState::CONNECTION_EXCEPTION));
        assert!(!is_connection_state(&SqlState::UNIQUE_VIOLATION));
        assert!(!is_connection_state(&SqlState::UNDEFINED_OBJECT));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::PermanentlyFailed.to_string(), "permanently failed");
        assert_eq!(SessionState::Ready.to_string(), "ready");
    }

    #[tokio::test]
    async fn test_disconnected_session_is_not_usable() {
        let mut session = Session::disconnected(2);
        assert_eq!(session.slot(), 2);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.has_failover());
        assert!(matches!(
            session.ensure_ready().await,
            Err(PgError::Connection(_))
        ));
        assert!(session.client().is_err());
    }

    #[tokio::test]
    async fn test_ready_session_without_failover_fails_permanently() {
        let mut session = Session::disconnected(0);
        session.mark_ready();

        let err = session.ensure_ready().await.unwrap_err();
        assert!(matches!(err, PgError::Connection(_)));
        assert_eq!(session.state(), SessionState::PermanentlyFailed);

        let err = session.query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err, PgError::ReconnectExhausted { slot: 0, attempts: 0 });
    }

    fn session_with_failover(attempts: u32, delay: Duration) -> (Session, FailoverCallbackHolder) {
        // Nothing listens on port 1, so every attempt is refused.
        let options =
            PgOptions::parse("host=127.0.0.1 port=1 user=postgres dbname=ledger", "x").unwrap();
        let mut coordinator = FailoverCoordinator::new(
            Arc::new(KTimesReconnectionStrategyFactory::with_delay(attempts, delay)),
            &options,
            ReconnectOptions {
                connect_timeout: Duration::from_secs(1),
                attempt_timeout: Duration::from_secs(2),
            },
            Span::none(),
        )
        .unwrap();
        let initializer = SessionInitializer::new(Arc::new(StatementSet::empty()), Span::none());

        let mut session = Session::disconnected(0);
        coordinator.attach(&mut session, initializer).unwrap();
        session.mark_ready();
        (session, coordinator.into_holder())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_failover_resumes_on_next_use() {
        let (mut session, holder) = session_with_failover(2, Duration::from_secs(2));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), session.ensure_ready()).await;
        assert!(cancelled.is_err());
        assert_eq!(session.state(), SessionState::Reconnecting);
        assert_eq!(holder.attempts().await, vec![(0, 1)]);

        // The resumed failover spends the remaining attempt and gives up.
        let err = session.ensure_ready().await.unwrap_err();
        assert!(matches!(err, PgError::Connection(_)));
        assert_eq!(session.state(), SessionState::PermanentlyFailed);
        assert_eq!(holder.attempts().await, vec![(0, 2)]);

        let err = session.ensure_ready().await.unwrap_err();
        assert_eq!(err, PgError::ReconnectExhausted { slot: 0, attempts: 2 });
    }
}
