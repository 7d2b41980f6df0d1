// Job Schema - registry of kinds and their handlers
//
// Handlers are stored type-erased: parameters are decoded from JSON inside
// the erased wrapper so the engine only ever deals with encoded rows.

use crate::application::context::RequestContext;
use crate::domain::{Behaviour, JobKind, JobParams, KindOptions, Persistence};
use crate::error::{AppError, Result};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Handler taking the encoded params and the row's name
pub type ErasedHandler = Arc<
    dyn for<'r> Fn(&'r mut RequestContext, &str, &str) -> BoxFuture<'r, Result<()>> + Send + Sync,
>;

fn erase<F>(f: F) -> ErasedHandler
where
    F: for<'r> Fn(&'r mut RequestContext, &str, &str) -> BoxFuture<'r, Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
struct RegisteredKind {
    kind: Arc<JobKind>,
    handler: Option<ErasedHandler>,
}

/// Set of job kinds known to the engines
#[derive(Clone, Default)]
pub struct Schema {
    kinds: BTreeMap<String, RegisteredKind>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, kind: JobKind, handler: Option<ErasedHandler>) {
        assert!(
            !self.kinds.contains_key(&kind.name),
            "job kind {} defined twice",
            kind.name
        );
        self.kinds.insert(
            kind.name.clone(),
            RegisteredKind {
                kind: Arc::new(kind),
                handler,
            },
        );
    }

    /// Define a persistent kind
    ///
    /// # Arguments
    /// * `name` - Globally unique kind name
    /// * `opts` - Behaviour (idempotent or repeatable), affinity and backoff
    /// * `handler` - Receives the decoded params
    ///
    /// # Panics
    /// On a duplicate name or a cron behaviour (use [`Schema::cron`]).
    pub fn define<P, F>(&mut self, name: &str, opts: KindOptions, handler: F) -> &mut Self
    where
        P: JobParams,
        F: for<'r> Fn(&'r mut RequestContext, P) -> BoxFuture<'r, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        assert!(
            opts.behaviour != Behaviour::Cron,
            "kind {name}: cron kinds are defined with Schema::cron"
        );
        let kind = JobKind::new(name, Persistence::Persistent, opts, None);
        let erased = erase(move |rc, params, job_name| {
            let raw = if params.is_empty() { "{}" } else { params };
            match serde_json::from_str::<P>(raw) {
                Ok(mut decoded) => {
                    decoded.set_job_name(job_name);
                    handler(rc, decoded)
                }
                Err(e) => {
                    let err = AppError::Serialization(e);
                    Box::pin(async move { Err(err) })
                }
            }
        });
        self.register(kind, Some(erased));
        self
    }

    /// Define a cron kind: empty params, never named, re-queued at
    /// `now + interval` after every run.
    pub fn cron<F>(&mut self, name: &str, interval: Duration, opts: KindOptions, handler: F) -> &mut Self
    where
        F: for<'r> Fn(&'r mut RequestContext) -> BoxFuture<'r, Result<()>> + Send + Sync + 'static,
    {
        let opts = KindOptions {
            behaviour: Behaviour::Cron,
            ..opts
        };
        let kind = JobKind::new(name, Persistence::Persistent, opts, Some(interval));
        self.register(kind, Some(erase(move |rc, _params, _name| handler(rc))));
        self
    }

    /// Define an ephemeral kind; the closure is supplied per enqueue
    pub fn ephemeral(&mut self, name: &str, opts: KindOptions) -> &mut Self {
        let kind = JobKind::new(name, Persistence::Ephemeral, opts, None);
        self.register(kind, None);
        self
    }

    /// Fold another schema in
    ///
    /// # Panics
    /// If both schemas define the same kind name.
    pub fn merge(&mut self, other: Schema) -> &mut Self {
        for (_, registered) in other.kinds {
            assert!(
                !self.kinds.contains_key(&registered.kind.name),
                "job kind {} defined twice",
                registered.kind.name
            );
            self.kinds.insert(registered.kind.name.clone(), registered);
        }
        self
    }

    pub fn kind(&self, name: &str) -> Option<&Arc<JobKind>> {
        self.kinds.get(name).map(|r| &r.kind)
    }

    pub fn handler(&self, name: &str) -> Option<&ErasedHandler> {
        self.kinds.get(name).and_then(|r| r.handler.as_ref())
    }

    /// Persistent kind or a validation error
    pub fn persistent_kind(&self, name: &str) -> Result<&Arc<JobKind>> {
        match self.kind(name) {
            Some(kind) if kind.persistence == Persistence::Persistent => Ok(kind),
            Some(_) => Err(AppError::Validation(format!(
                "kind {name} is ephemeral, not persistent"
            ))),
            None => Err(AppError::NotFound(format!("job kind {name}"))),
        }
    }

    /// Ephemeral kind or a validation error
    pub fn ephemeral_kind(&self, name: &str) -> Result<&Arc<JobKind>> {
        match self.kind(name) {
            Some(kind) if kind.persistence == Persistence::Ephemeral => Ok(kind),
            Some(_) => Err(AppError::Validation(format!(
                "kind {name} is persistent, not ephemeral"
            ))),
            None => Err(AppError::NotFound(format!("job kind {name}"))),
        }
    }

    /// Names of persistent kinds, sorted
    pub fn persistent_kind_names(&self) -> Vec<String> {
        self.kinds
            .values()
            .filter(|r| r.kind.persistence == Persistence::Persistent)
            .map(|r| r.kind.name.clone())
            .collect()
    }

    pub fn cron_kinds(&self) -> Vec<Arc<JobKind>> {
        self.kinds
            .values()
            .filter(|r| r.kind.is_cron())
            .map(|r| r.kind.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kinds.keys()).finish()
    }
}
