//! In-memory driver for exercising tenant pools without a database.
//!
//! Every connection the fake hands out is journaled together with the tag it
//! carries, and failures can be injected per connection. Connection ids are
//! driver-side: the first acquired connection is `1`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{ConnectionSource, RawConnection};
use crate::TxConfig;

/// One observable action of the fake driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    Acquired(u64),
    Tagged { conn: u64, tenant: String },
    Untagged(u64),
    Statement { conn: u64, sql: String },
    Begin { conn: u64, sql: String },
    Commit(u64),
    Rollback(u64),
    Released(u64),
    Closed(u64),
    Discarded(u64),
}

impl FakeEvent {
    /// Driver connection the event happened on.
    #[must_use]
    pub fn conn(&self) -> u64 {
        match self {
            FakeEvent::Acquired(c)
            | FakeEvent::Untagged(c)
            | FakeEvent::Commit(c)
            | FakeEvent::Rollback(c)
            | FakeEvent::Released(c)
            | FakeEvent::Closed(c)
            | FakeEvent::Discarded(c) => *c,
            FakeEvent::Tagged { conn, .. }
            | FakeEvent::Statement { conn, .. }
            | FakeEvent::Begin { conn, .. } => *conn,
        }
    }
}

/// Row returned by the fake: which connection and tenant tag served it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRow {
    pub conn: u64,
    pub tenant: Option<String>,
    pub sql: String,
}

#[derive(Default)]
struct Faults {
    fail_acquire: bool,
    fail_tag: HashSet<u64>,
    fail_untag: HashSet<u64>,
    fail_close: HashSet<u64>,
    fail_commit: HashSet<u64>,
    delay: Option<Duration>,
}

#[derive(Default)]
struct FakeState {
    next_conn: u64,
    journal: Vec<FakeEvent>,
    sessions: HashMap<u64, Option<String>>,
    live: HashSet<u64>,
    faults: Faults,
}

/// Fake driver pool. Clones share one journal.
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<Mutex<FakeState>>,
}

impl std::fmt::Debug for FakeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeSource")
            .field("live", &self.state().live.len())
            .finish_non_exhaustive()
    }
}

impl FakeSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following `acquire` fail.
    pub fn fail_acquire(&self, fail: bool) {
        self.state().faults.fail_acquire = fail;
    }

    /// Reject the tag statement on driver connection `conn`.
    pub fn fail_tag_for(&self, conn: u64) {
        self.state().faults.fail_tag.insert(conn);
    }

    /// Reject the untag statement on driver connection `conn`.
    pub fn fail_untag_for(&self, conn: u64) {
        self.state().faults.fail_untag.insert(conn);
    }

    /// Make physically closing driver connection `conn` fail.
    pub fn fail_close_for(&self, conn: u64) {
        self.state().faults.fail_close.insert(conn);
    }

    pub fn fail_commit_for(&self, conn: u64) {
        self.state().faults.fail_commit.insert(conn);
    }

    /// Delay every statement (including tag and untag) by `delay`.
    pub fn set_statement_delay(&self, delay: Option<Duration>) {
        self.state().faults.delay = delay;
    }

    #[must_use]
    pub fn journal(&self) -> Vec<FakeEvent> {
        self.state().journal.clone()
    }

    /// Journal entries for driver connection `conn`, in order.
    #[must_use]
    pub fn events_for(&self, conn: u64) -> Vec<FakeEvent> {
        self.state()
            .journal
            .iter()
            .filter(|e| e.conn() == conn)
            .cloned()
            .collect()
    }

    /// Number of connections handed out so far.
    #[must_use]
    pub fn acquired(&self) -> u64 {
        self.state().next_conn
    }

    /// Connections neither released, closed nor discarded yet.
    #[must_use]
    pub fn live(&self) -> usize {
        self.state().live.len()
    }

    /// Tenant tag currently set on driver connection `conn`.
    #[must_use]
    pub fn session_tenant(&self, conn: u64) -> Option<String> {
        self.state().sessions.get(&conn).cloned().flatten()
    }

    fn record(&self, event: FakeEvent) {
        self.state().journal.push(event);
    }

    fn delay(&self) -> Option<Duration> {
        self.state().faults.delay
    }
}

#[async_trait]
impl ConnectionSource for FakeSource {
    type Conn = FakeConn;

    async fn acquire(&self) -> Result<FakeConn, sqlx::Error> {
        let mut state = self.state();
        if state.faults.fail_acquire {
            return Err(sqlx::Error::PoolTimedOut);
        }
        state.next_conn += 1;
        let id = state.next_conn;
        state.live.insert(id);
        state.sessions.insert(id, None);
        state.journal.push(FakeEvent::Acquired(id));
        drop(state);
        Ok(FakeConn {
            id,
            source: self.clone(),
        })
    }
}

/// Connection handed out by [`FakeSource`].
#[derive(Debug)]
pub struct FakeConn {
    id: u64,
    source: FakeSource,
}

impl FakeConn {
    /// Driver-side id of this connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    async fn pause(&self) {
        if let Some(delay) = self.source.delay() {
            tokio::time::sleep(delay).await;
        }
    }

    fn row(&self, sql: &str) -> FakeRow {
        FakeRow {
            conn: self.id,
            tenant: self.source.session_tenant(self.id),
            sql: sql.to_owned(),
        }
    }

    fn finish(self, event: FakeEvent) {
        let mut state = self.source.state();
        state.live.remove(&self.id);
        state.journal.push(event);
    }
}

fn injected(what: &str, conn: u64) -> sqlx::Error {
    sqlx::Error::Protocol(format!("injected {what} failure on connection {conn}"))
}

#[async_trait]
impl RawConnection for FakeConn {
    type Row = FakeRow;
    type Arguments = Vec<String>;
    type Done = u64;

    async fn session_statement(&mut self, sql: &str, param: Option<&str>) -> Result<(), sqlx::Error> {
        self.pause().await;
        let mut state = self.source.state();
        match param {
            Some(tenant) => {
                if state.faults.fail_tag.contains(&self.id) {
                    return Err(injected("tag", self.id));
                }
                state.sessions.insert(self.id, Some(tenant.to_owned()));
                state.journal.push(FakeEvent::Tagged {
                    conn: self.id,
                    tenant: tenant.to_owned(),
                });
            }
            None => {
                if state.faults.fail_untag.contains(&self.id) {
                    return Err(injected("untag", self.id));
                }
                tracing::trace!(conn = self.id, sql, "fake untag");
                state.sessions.insert(self.id, None);
                state.journal.push(FakeEvent::Untagged(self.id));
            }
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str, _args: Vec<String>) -> Result<u64, sqlx::Error> {
        self.pause().await;
        self.source.record(FakeEvent::Statement {
            conn: self.id,
            sql: sql.to_owned(),
        });
        Ok(1)
    }

    async fn fetch_all(&mut self, sql: &str, _args: Vec<String>) -> Result<Vec<FakeRow>, sqlx::Error> {
        self.pause().await;
        self.source.record(FakeEvent::Statement {
            conn: self.id,
            sql: sql.to_owned(),
        });
        Ok(vec![self.row(sql)])
    }

    /// Returns no row when `sql` contains `where false`.
    async fn fetch_optional(
        &mut self,
        sql: &str,
        _args: Vec<String>,
    ) -> Result<Option<FakeRow>, sqlx::Error> {
        self.pause().await;
        self.source.record(FakeEvent::Statement {
            conn: self.id,
            sql: sql.to_owned(),
        });
        if sql.to_ascii_lowercase().contains("where false") {
            Ok(None)
        } else {
            Ok(Some(self.row(sql)))
        }
    }

    async fn begin(&mut self, cfg: &TxConfig) -> Result<(), sqlx::Error> {
        self.pause().await;
        self.source.record(FakeEvent::Begin {
            conn: self.id,
            sql: cfg.begin_statement(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.pause().await;
        if self.source.state().faults.fail_commit.contains(&self.id) {
            return Err(injected("commit", self.id));
        }
        self.source.record(FakeEvent::Commit(self.id));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.pause().await;
        self.source.record(FakeEvent::Rollback(self.id));
        Ok(())
    }

    fn release(self) {
        let id = self.id;
        self.finish(FakeEvent::Released(id));
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        let id = self.id;
        let failed = self.source.state().faults.fail_close.contains(&id);
        self.finish(FakeEvent::Closed(id));
        if failed {
            return Err(injected("close", id));
        }
        Ok(())
    }

    fn discard(self) {
        let id = self.id;
        self.finish(FakeEvent::Discarded(id));
    }
}
