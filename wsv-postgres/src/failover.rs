//! Per-session failover.
//!
//! Every pooled session gets a [`FailoverCallback`] that owns everything it
//! needs to bring the session back: the reconnection target, its own
//! strategy instance, a copy of the session initializer and a child logger.
//! The callback runs inline on whichever task found the connection broken.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{Span, error, info, info_span, warn};

use crate::config::PgOptions;
use crate::error::{PgError, PgResult, describe};
use crate::initializer::{InitConnection, InitDatabase, SessionInitializer};
use crate::reconnect::{Decision, ReconnectionStrategy, ReconnectionStrategyFactory};
use crate::session::{RawConnection, Session};

/// Timeouts applied while re-establishing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectOptions {
    /// Driver-level connect timeout for the new physical connection.
    pub connect_timeout: Duration,
    /// Upper bound for one whole attempt (connect plus restore).
    pub attempt_timeout: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Reconnection state bound to one session.
pub struct FailoverCallback {
    slot: usize,
    strategy: Box<dyn ReconnectionStrategy>,
    target: tokio_postgres::Config,
    attempt_timeout: Duration,
    restore: SessionInitializer,
    log: Span,
}

impl FailoverCallback {
    /// Slot of the bound session.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Attempts granted by the strategy so far.
    pub fn attempts_made(&self) -> u32 {
        self.strategy.attempts_made()
    }

    /// Re-establish `session`, consulting the strategy before every attempt.
    pub(crate) async fn reconnect(&mut self, session: &mut Session) -> PgResult<()> {
        warn!(parent: &self.log, slot = self.slot, "Connection broken, reconnecting");
        let mut restore = SessionRestore {
            session,
            target: &self.target,
            initializer: &self.restore,
        };
        run_reconnect(
            &mut restore,
            self.strategy.as_mut(),
            self.attempt_timeout,
            self.slot,
            &self.log,
        )
        .await
    }
}

impl std::fmt::Debug for FailoverCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverCallback")
            .field("slot", &self.slot)
            .field("strategy", &self.strategy)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

/// One reconnection attempt.
pub(crate) trait Reconnect {
    async fn attempt(&mut self) -> PgResult<()>;
}

struct SessionRestore<'a> {
    session: &'a mut Session,
    target: &'a tokio_postgres::Config,
    initializer: &'a SessionInitializer,
}

impl Reconnect for SessionRestore<'_> {
    async fn attempt(&mut self) -> PgResult<()> {
        let raw = RawConnection::open(self.target)
            .await
            .map_err(|e| PgError::connection(describe(&e)))?;
        self.session.replace_connection(raw);
        self.initializer
            .initialize(self.session, InitConnection::None, InitDatabase::None)
            .await
    }
}

/// Attempt reconnection until `target` succeeds or the strategy gives up.
pub(crate) async fn run_reconnect<R: Reconnect>(
    target: &mut R,
    strategy: &mut dyn ReconnectionStrategy,
    attempt_timeout: Duration,
    slot: usize,
    log: &Span,
) -> PgResult<()> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let delay = match strategy.decide(attempt) {
            Decision::Retry { delay } => delay,
            Decision::GiveUp => {
                let attempts = strategy.attempts_made();
                error!(parent: log, slot, attempts, "Reconnection given up, session is unusable");
                return Err(PgError::ReconnectExhausted { slot, attempts });
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(attempt_timeout, target.attempt()).await {
            Ok(Ok(())) => {
                info!(parent: log, slot, attempt, "Session reconnected");
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!(parent: log, slot, attempt, error = %e, "Reconnection attempt failed");
            }
            Err(_) => {
                warn!(
                    parent: log,
                    slot,
                    attempt,
                    timeout = ?attempt_timeout,
                    "Reconnection attempt timed out"
                );
            }
        }
    }
}

/// Owns every failover callback of a pool.
#[derive(Debug, Default)]
pub struct FailoverCallbackHolder {
    callbacks: Vec<Arc<Mutex<FailoverCallback>>>,
}

impl FailoverCallbackHolder {
    /// Number of callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Check if no callback has been attached.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Reconnection attempts per slot, in slot order.
    pub async fn attempts(&self) -> Vec<(usize, u32)> {
        let mut attempts = Vec::with_capacity(self.callbacks.len());
        for callback in &self.callbacks {
            let callback = callback.lock().await;
            attempts.push((callback.slot(), callback.attempts_made()));
        }
        attempts
    }
}

/// Builds and binds a failover callback for each session of a pool.
pub struct FailoverCoordinator {
    factory: Arc<dyn ReconnectionStrategyFactory>,
    target: tokio_postgres::Config,
    attempt_timeout: Duration,
    log: Span,
    holder: FailoverCallbackHolder,
}

impl FailoverCoordinator {
    /// Create a coordinator reconnecting to `options`' database.
    pub fn new(
        factory: Arc<dyn ReconnectionStrategyFactory>,
        options: &PgOptions,
        reconnect: ReconnectOptions,
        log: Span,
    ) -> PgResult<Self> {
        Ok(Self {
            factory,
            target: options.to_reconnection_config(reconnect.connect_timeout)?,
            attempt_timeout: reconnect.attempt_timeout,
            log,
            holder: FailoverCallbackHolder::default(),
        })
    }

    /// Bind a new callback to `session`.
    pub(crate) fn attach(&mut self, session: &mut Session, restore: SessionInitializer) -> PgResult<()> {
        if session.has_failover() {
            return Err(PgError::connection(format!(
                "session {} already has a failover callback",
                session.slot()
            )));
        }

        let slot = session.slot();
        let callback = Arc::new(Mutex::new(FailoverCallback {
            slot,
            strategy: self.factory.create(),
            target: self.target.clone(),
            attempt_timeout: self.attempt_timeout,
            restore,
            log: info_span!(parent: &self.log, "connection", slot),
        }));
        session.bind_failover(callback.clone());
        self.holder.callbacks.push(callback);
        Ok(())
    }

    /// Finish attaching and hand the callbacks over.
    pub fn into_holder(self) -> FailoverCallbackHolder {
        self.holder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::{ExponentialBackoffStrategy, KTimesReconnectionStrategy};
    use pretty_assertions::assert_eq;

    /// Fails the first `failures` attempts, then succeeds.
    struct Flaky {
        failures: u32,
        calls: u32,
        hang: bool,
    }

    impl Reconnect for Flaky {
        async fn attempt(&mut self) -> PgResult<()> {
            self.calls += 1;
            if self.hang {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.calls <= self.failures {
                Err(PgError::connection("connection refused"))
            } else {
                Ok(())
            }
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures,
            calls: 0,
            hang: false,
        }
    }

    #[tokio::test]
    async fn test_zero_attempts_fails_without_trying() {
        let mut target = flaky(0);
        let mut strategy = KTimesReconnectionStrategy::new(0);

        let err = run_reconnect(&mut target, &mut strategy, Duration::from_secs(1), 0, &Span::none())
            .await
            .unwrap_err();

        assert_eq!(err, PgError::ReconnectExhausted { slot: 0, attempts: 0 });
        assert_eq!(target.calls, 0);
    }

    #[tokio::test]
    async fn test_single_attempt_succeeds() {
        let mut target = flaky(0);
        let mut strategy = KTimesReconnectionStrategy::new(1);

        run_reconnect(&mut target, &mut strategy, Duration::from_secs(1), 0, &Span::none())
            .await
            .unwrap();

        assert_eq!(target.calls, 1);
        assert_eq!(strategy.attempts_made(), 1);
    }

    #[tokio::test]
    async fn test_failed_attempts_consult_strategy_again() {
        let mut target = flaky(2);
        let mut strategy = KTimesReconnectionStrategy::new(4);

        run_reconnect(&mut target, &mut strategy, Duration::from_secs(1), 4, &Span::none())
            .await
            .unwrap();
        assert_eq!(target.calls, 3);

        // One attempt left in the budget; the next fault exhausts it.
        let mut target = flaky(5);
        let err = run_reconnect(&mut target, &mut strategy, Duration::from_secs(1), 4, &Span::none())
            .await
            .unwrap_err();
        assert_eq!(err, PgError::ReconnectExhausted { slot: 4, attempts: 4 });
        assert_eq!(target.calls, 1);
    }

    #[tokio::test]
    async fn test_attempts_are_time_bounded() {
        let mut target = Flaky {
            failures: 0,
            calls: 0,
            hang: true,
        };
        let mut strategy = ExponentialBackoffStrategy::new(
            2,
            Duration::from_millis(1),
            Duration::from_millis(2),
        );

        let err = run_reconnect(&mut target, &mut strategy, Duration::from_millis(20), 1, &Span::none())
            .await
            .unwrap_err();

        assert_eq!(err, PgError::ReconnectExhausted { slot: 1, attempts: 2 });
        assert_eq!(target.calls, 2);
    }

    #[test]
    fn test_coordinator_targets_database() {
        let options =
            PgOptions::parse("host=localhost user=postgres dbname=ledger", "unused").unwrap();
        let coordinator = FailoverCoordinator::new(
            Arc::new(crate::reconnect::KTimesReconnectionStrategyFactory::new(1)),
            &options,
            ReconnectOptions::default(),
            Span::none(),
        )
        .unwrap();

        assert_eq!(coordinator.target.get_dbname(), Some("ledger"));
        assert_eq!(
            coordinator.target.get_connect_timeout(),
            Some(&Duration::from_secs(10))
        );
        assert!(coordinator.into_holder().is_empty());
    }

    #[tokio::test]
    async fn test_attach_binds_once() {
        let options = PgOptions::parse("host=localhost dbname=ledger", "unused").unwrap();
        let mut coordinator = FailoverCoordinator::new(
            Arc::new(crate::reconnect::KTimesReconnectionStrategyFactory::new(2)),
            &options,
            ReconnectOptions::default(),
            Span::none(),
        )
        .unwrap();
        let initializer = SessionInitializer::new(
            Arc::new(crate::statement::StatementSet::empty()),
            Span::none(),
        );

        let mut session = Session::disconnected(0);
        coordinator.attach(&mut session, initializer.clone()).unwrap();
        assert!(session.has_failover());
        assert!(coordinator.attach(&mut session, initializer).is_err());

        let holder = coordinator.into_holder();
        assert_eq!(holder.len(), 1);
        assert_eq!(holder.attempts().await, vec![(0, 0)]);
    }
}
