// Request Context
//
// Per-request bundle: at most one open store transaction, deferred cache
// invalidation, cancellation/deadline, a logging span and the caller identity.
// Engines and handlers reach the store only through this type.

use crate::application::worker::ShutdownToken;
use crate::domain::Affinity;
use crate::error::{AppError, Result};
use crate::port::{CacheInvalidator, Store, StoreTx, TxMode};
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Authenticated caller attached to a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub roles: Vec<String>,
}

impl Identity {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Handle returned by [`RequestContext::enter_tx`]; pass it back to
/// [`RequestContext::exit_tx`].
#[must_use = "a transaction scope must be closed with exit_tx"]
#[derive(Debug)]
pub struct TxScope {
    /// This scope opened the transaction and must close it
    opened: bool,
    /// A reader was closed to make room for a writer; reopen it on exit
    reopen_reader: bool,
}

impl TxScope {
    fn borrowed() -> Self {
        Self {
            opened: false,
            reopen_reader: false,
        }
    }

    pub fn opened(&self) -> bool {
        self.opened
    }
}

fn mode_for(affinity: Affinity) -> Option<TxMode> {
    match affinity {
        Affinity::SafeReader => Some(TxMode::Read),
        Affinity::SafeWriter => Some(TxMode::Write),
        Affinity::ExclusiveWriter => Some(TxMode::Exclusive),
        Affinity::Manual | Affinity::DbUnused => None,
    }
}

pub struct RequestContext {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheInvalidator>,
    tx: Option<Box<dyn StoreTx>>,
    staged_busts: BTreeSet<String>,
    request_id: String,
    span: Span,
    cancel: ShutdownToken,
    deadline: Option<Instant>,
    identity: Option<Identity>,
    err: Option<AppError>,
}

impl RequestContext {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn CacheInvalidator>,
        request_id: impl Into<String>,
    ) -> Self {
        let request_id = request_id.into();
        Self {
            store,
            cache,
            tx: None,
            staged_busts: BTreeSet::new(),
            span: info_span!("rc", request_id = %request_id),
            request_id,
            cancel: ShutdownToken::never(),
            deadline: None,
            identity: None,
            err: None,
        }
    }

    /// Tie the request to a parent cancellation token
    pub fn with_cancel(mut self, cancel: ShutdownToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Rename the request; the logging span follows
    pub fn set_request_id(&mut self, request_id: impl Into<String>) {
        self.request_id = request_id.into();
        self.span = info_span!("rc", request_id = %self.request_id);
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the parent is cancelled or the deadline passed
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_shutdown() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the request is cancelled or its deadline passes
    pub fn cancelled(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = cancel.wait() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => cancel.wait().await,
            }
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Mode of the open transaction, if any
    pub fn tx_mode(&self) -> Option<TxMode> {
        self.tx.as_ref().map(|tx| tx.mode())
    }

    /// The open transaction
    pub fn tx(&mut self) -> Result<&mut (dyn StoreTx + 'static)> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| AppError::InvalidState("no open transaction".to_string()))
    }

    /// Make sure a transaction compatible with `affinity` is open.
    ///
    /// A compatible transaction already held is reused and the returned
    /// scope does not close it. A held reader is closed when a writer is
    /// needed and reopened by `exit_tx`. `Manual` and `DbUnused` open
    /// nothing.
    pub async fn enter_tx(&mut self, affinity: Affinity) -> Result<TxScope> {
        let Some(wanted) = mode_for(affinity) else {
            return Ok(TxScope::borrowed());
        };

        if let Some(held) = self.tx_mode() {
            if held.satisfies(wanted) {
                return Ok(TxScope::borrowed());
            }
            if held.is_writable() {
                return Err(AppError::InvalidState(format!(
                    "{wanted:?} transaction requested inside a {held:?} transaction"
                )));
            }
        }

        if self.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let mut reopen_reader = false;
        if let Some(reader) = self.tx.take() {
            reader.rollback().await?;
            reopen_reader = true;
        }

        let tx = self.store.begin(wanted).instrument(self.span.clone()).await?;
        self.span.in_scope(|| debug!(mode = ?wanted, "transaction opened"));
        self.tx = Some(tx);
        Ok(TxScope {
            opened: true,
            reopen_reader,
        })
    }

    /// Close a scope opened by `enter_tx`: commit when `result` is `Ok`,
    /// roll back otherwise. Writer scopes flush the staged cache busts.
    pub async fn exit_tx<T>(&mut self, scope: TxScope, result: Result<T>) -> Result<T> {
        if !scope.opened {
            return result;
        }

        let result = match self.tx.take() {
            Some(tx) => {
                let writable = tx.mode().is_writable();
                let result = match result {
                    Ok(value) => tx.commit().await.map(|_| value),
                    Err(err) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            self.span.in_scope(|| {
                                warn!(error = %rollback_err, "transaction rollback failed")
                            });
                        }
                        Err(err)
                    }
                };
                if writable {
                    self.flush_busts();
                }
                result
            }
            // Closed early by the callee
            None => result,
        };

        if scope.reopen_reader {
            let reader = self.store.begin(TxMode::Read).await?;
            self.tx = Some(reader);
        }
        result
    }

    /// Run `f` inside a transaction compatible with `affinity`
    ///
    /// # Example
    /// ```text
    /// rc.in_tx(Affinity::SafeWriter, move |rc| Box::pin(async move {
    ///     rc.tx()?.put_job(&job).await
    /// })).await?;
    /// ```
    pub async fn in_tx<T, F>(&mut self, affinity: Affinity, f: F) -> Result<T>
    where
        F: for<'r> FnOnce(&'r mut RequestContext) -> BoxFuture<'r, Result<T>>,
    {
        let scope = self.enter_tx(affinity).await?;
        let span = self.span.clone();
        let result = f(self).instrument(span).await;
        self.exit_tx(scope, result).await
    }

    /// Close a reader transaction early
    pub async fn done_reading(&mut self) -> Result<()> {
        match self.tx_mode() {
            Some(TxMode::Read) => {
                if let Some(tx) = self.tx.take() {
                    tx.rollback().await?;
                }
                Ok(())
            }
            Some(mode) => Err(AppError::InvalidState(format!(
                "done_reading called inside a {mode:?} transaction"
            ))),
            None => Ok(()),
        }
    }

    /// Roll back whatever a handler left open
    pub async fn abandon_tx(&mut self) {
        if let Some(tx) = self.tx.take() {
            let writable = tx.mode().is_writable();
            if let Err(err) = tx.rollback().await {
                self.span
                    .in_scope(|| warn!(error = %err, "abandoned transaction rollback failed"));
            }
            if writable {
                self.flush_busts();
            }
        }
    }

    // ------------------------------------------------------------------
    // Cache invalidation
    // ------------------------------------------------------------------

    /// Invalidate cache keys. Inside a writer transaction the keys are
    /// staged and flushed once when the transaction ends.
    pub fn bust_cache<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = keys.into_iter().map(Into::into);
        if self.tx_mode().is_some_and(TxMode::is_writable) {
            self.staged_busts.extend(keys);
        } else {
            let keys: Vec<String> = keys.collect();
            if !keys.is_empty() {
                self.cache.invalidate(&keys);
            }
        }
    }

    pub fn staged_busts(&self) -> impl Iterator<Item = &str> {
        self.staged_busts.iter().map(String::as_str)
    }

    fn flush_busts(&mut self) {
        if self.staged_busts.is_empty() {
            return;
        }
        let keys: Vec<String> = std::mem::take(&mut self.staged_busts).into_iter().collect();
        self.cache.invalidate(&keys);
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Record a request failure. The first error sticks.
    pub fn fail(&mut self, err: AppError) {
        self.span.in_scope(|| {
            if err.is_client_network() {
                info!(error = %err, "request failed (client went away)");
            } else {
                warn!(error = %err, "request failed");
            }
        });
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    pub fn err(&self) -> Option<&AppError> {
        self.err.as_ref()
    }

    pub fn take_err(&mut self) -> Option<AppError> {
        self.err.take()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("tx", &self.tx_mode())
            .field("staged_busts", &self.staged_busts.len())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Builds request contexts sharing one store and cache
#[derive(Clone)]
pub struct ContextFactory {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheInvalidator>,
}

impl ContextFactory {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self { store, cache }
    }

    pub fn new_context(&self, request_id: impl Into<String>) -> RequestContext {
        RequestContext::new(self.store.clone(), self.cache.clone(), request_id)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::shutdown_channel;
    use crate::port::cache::mocks::RecordingCache;
    use crate::port::store::mocks::NoStore;
    use std::time::Duration;

    fn context(cache: Arc<RecordingCache>) -> RequestContext {
        RequestContext::new(Arc::new(NoStore), cache, "test")
    }

    #[tokio::test]
    async fn test_bust_outside_tx_is_immediate() {
        let cache = Arc::new(RecordingCache::new());
        let mut rc = context(cache.clone());

        rc.bust_cache(["user:1", "user:2"]);
        rc.bust_cache(Vec::<String>::new());

        assert_eq!(cache.batches(), vec![vec!["user:1".to_string(), "user:2".to_string()]]);
    }

    #[tokio::test]
    async fn test_db_unused_runs_without_store() {
        let cache = Arc::new(RecordingCache::new());
        let mut rc = context(cache);

        let value = rc
            .in_tx(Affinity::DbUnused, |rc| {
                Box::pin(async move {
                    assert!(rc.tx().is_err());
                    Ok(7)
                })
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let mut rc = context(Arc::new(RecordingCache::new()));
        let err = rc
            .in_tx(Affinity::SafeReader, |_rc| Box::pin(async { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancelled_context_refuses_tx() {
        let (tx, token) = shutdown_channel();
        let mut rc = context(Arc::new(RecordingCache::new())).with_cancel(token);
        tx.shutdown();

        let err = rc.enter_tx(Affinity::SafeWriter).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert!(rc.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_resolves_cancelled() {
        let rc = context(Arc::new(RecordingCache::new()))
            .with_deadline(Instant::now() + Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(1), rc.cancelled())
            .await
            .expect("deadline should fire");
        assert!(rc.is_cancelled());
    }

    #[test]
    fn test_fail_keeps_first_error() {
        let mut rc = context(Arc::new(RecordingCache::new()));
        rc.fail(AppError::Validation("first".into()));
        rc.fail(AppError::Internal("second".into()));
        assert!(matches!(rc.err(), Some(AppError::Validation(m)) if m == "first"));
    }

    #[test]
    fn test_identity_roles() {
        let rc = context(Arc::new(RecordingCache::new())).with_identity(Identity {
            subject: "u1".into(),
            roles: vec!["admin".into()],
        });
        assert!(rc.identity().unwrap().has_role("admin"));
        assert!(!rc.identity().unwrap().has_role("owner"));
    }
}
