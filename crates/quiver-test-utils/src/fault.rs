//! Fault injection for the transactional store.
//!
//! [`FaultInjectingStore`] wraps any store and fails chosen calls with a
//! chosen [`FailureKind`] a fixed number of times, so retry bounds can be
//! exercised deterministically. Every executed statement name is recorded.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quiver_core::store::{
    FailureKind, IsolationLevel, QueryResult, Statement, StoreError, StoreResult,
    StoreTransaction, TransactionalStore,
};
use rand::Rng;

/// Where an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// Opening a transaction.
    Begin,
    /// Executing the statement with this name.
    Statement(&'static str),
    /// Committing a transaction.
    Commit,
}

#[derive(Debug, Clone)]
struct Fault {
    point: FaultPoint,
    kind: FailureKind,
    remaining: u32,
}

#[derive(Debug, Default)]
struct FaultState {
    faults: Vec<Fault>,
    statements: Vec<&'static str>,
    injected: u32,
    commits: u32,
}

impl FaultState {
    fn trip(&mut self, point: FaultPoint) -> Option<StoreError> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.point == point && f.remaining > 0)?;
        fault.remaining -= 1;
        self.injected += 1;
        tracing::debug!(?point, kind = %fault.kind, remaining = fault.remaining, "injecting store failure");
        let err = StoreError::new(fault.kind, format!("injected {} at {point:?}", fault.kind));
        Some(match point {
            FaultPoint::Statement(name) => err.with_statement(name),
            FaultPoint::Begin | FaultPoint::Commit => err,
        })
    }
}

/// A store wrapper that injects classified failures.
#[derive(Clone)]
pub struct FaultInjectingStore {
    inner: Arc<dyn TransactionalStore>,
    state: Arc<Mutex<FaultState>>,
    max_latency: Option<Duration>,
}

impl std::fmt::Debug for FaultInjectingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjectingStore")
            .field("state", &self.state)
            .field("max_latency", &self.max_latency)
            .finish_non_exhaustive()
    }
}

impl FaultInjectingStore {
    /// Wraps `inner` with no faults configured.
    #[must_use]
    pub fn new(inner: Arc<dyn TransactionalStore>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(FaultState::default())),
            max_latency: None,
        }
    }

    /// Adds a random delay of up to `max` before every statement, to shake
    /// out interleavings in contention tests.
    #[must_use]
    pub fn with_latency(mut self, max: Duration) -> Self {
        self.max_latency = Some(max);
        self
    }

    /// Fails the next `times` calls at `point` with `kind`.
    pub fn inject(&self, point: FaultPoint, kind: FailureKind, times: u32) {
        self.state.lock().expect("lock").faults.push(Fault {
            point,
            kind,
            remaining: times,
        });
    }

    /// Removes all pending faults.
    pub fn clear_faults(&self) {
        self.state.lock().expect("lock").faults.clear();
    }

    /// Returns how many failures have been injected so far.
    pub fn injected(&self) -> u32 {
        self.state.lock().expect("lock").injected
    }

    /// Returns how many transactions committed successfully.
    pub fn commits(&self) -> u32 {
        self.state.lock().expect("lock").commits
    }

    /// Returns the names of all executed statements, in order.
    pub fn statements(&self) -> Vec<&'static str> {
        self.state.lock().expect("lock").statements.clone()
    }

    /// Returns how many times the statement `name` was executed.
    pub fn statement_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .expect("lock")
            .statements
            .iter()
            .filter(|s| **s == name)
            .count()
    }

    /// Clears the recorded statements.
    pub fn clear_statements(&self) {
        self.state.lock().expect("lock").statements.clear();
    }
}

#[async_trait]
impl TransactionalStore for FaultInjectingStore {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn StoreTransaction>> {
        let injected = self.state.lock().expect("lock").trip(FaultPoint::Begin);
        if let Some(err) = injected {
            return Err(err);
        }
        let inner = self.inner.begin(isolation).await?;
        Ok(Box::new(FaultTransaction {
            inner,
            state: Arc::clone(&self.state),
            max_latency: self.max_latency,
        }))
    }
}

struct FaultTransaction {
    inner: Box<dyn StoreTransaction>,
    state: Arc<Mutex<FaultState>>,
    max_latency: Option<Duration>,
}

#[async_trait]
impl StoreTransaction for FaultTransaction {
    fn isolation(&self) -> IsolationLevel {
        self.inner.isolation()
    }

    async fn execute(&mut self, statement: &Statement) -> StoreResult<QueryResult> {
        if let Some(max) = self.max_latency {
            let cap = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
            let delay = rand::thread_rng().gen_range(0..=cap);
            tokio::time::sleep(Duration::from_micros(delay)).await;
        }
        let injected = {
            let mut state = self.state.lock().expect("lock");
            state.statements.push(statement.name());
            state.trip(FaultPoint::Statement(statement.name()))
        };
        match injected {
            Some(err) => Err(err),
            None => self.inner.execute(statement).await,
        }
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let injected = self.state.lock().expect("lock").trip(FaultPoint::Commit);
        if let Some(err) = injected {
            self.inner.rollback().await?;
            return Err(err);
        }
        self.inner.commit().await?;
        self.state.lock().expect("lock").commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.inner.rollback().await
    }
}
