//! Scoped acquisition of the bot's shared clients.
//!
//! A [`ResourceStack`] records a release action for every resource it
//! acquires and runs them in reverse order when the scope ends. [`compose`]
//! wraps a scope body with that stack so releases happen on every exit path:
//! normal return, error, panic, failed acquisition, or the scope future being
//! dropped. [`use_all`] is the composition used by the bot itself.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{error, info, warn};

use crate::clients::db::close_db_pool;
use crate::clients::{create_db_pool, create_http_client, OpenAiClient, StatsClient};
use crate::config::Settings;
use crate::di::ServiceContainer;
use crate::entity::{LifecycleError, ReleaseFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Acquiring,
    Active,
    ReleasingAll,
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::NotStarted => "not started",
            LifecycleState::Acquiring => "acquiring",
            LifecycleState::Active => "active",
            LifecycleState::ReleasingAll => "releasing",
            LifecycleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct PendingRelease {
    resource: &'static str,
    start: Option<ReleaseFn>,
    running: Option<BoxFuture<'static, anyhow::Result<()>>>,
}

impl PendingRelease {
    /// Release future, started on first use and kept until it completes
    fn future(&mut self) -> &mut BoxFuture<'static, anyhow::Result<()>> {
        let start = self.start.take();
        self.running.get_or_insert_with(|| match start {
            Some(start) => start(),
            None => futures::future::ok(()).boxed(),
        })
    }
}

/// Where a batch goes when it is dropped before finishing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fallback {
    /// Spawn the rest on the current runtime, if there is one
    Spawn,
    /// Finish the rest on a helper thread with its own runtime
    Thread,
    /// Nothing left to try; log what is lost
    Abandon,
}

/// Releases still owed, last element first.
///
/// A release stays in the batch until its future completes, so dropping the
/// batch mid-release hands the in-flight future on instead of losing it.
struct ReleaseBatch {
    items: Vec<PendingRelease>,
    fallback: Fallback,
}

impl ReleaseBatch {
    async fn run(mut self) -> Vec<ReleaseFailure> {
        let mut failures = Vec::new();
        while let Some(next) = self.items.last_mut() {
            let outcome = AssertUnwindSafe(next.future()).catch_unwind().await;
            let resource = next.resource;
            self.items.pop();

            let error = match outcome {
                Ok(Ok(())) => {
                    info!("Released {}", resource);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => anyhow!("release panicked"),
            };
            error!("Failed to release {}: {:#}", resource, error);
            failures.push(ReleaseFailure { resource, error });
        }
        failures
    }

    fn names(&self) -> Vec<&'static str> {
        self.items.iter().rev().map(|p| p.resource).collect()
    }

    fn finish_on_thread(self) {
        let worker = std::thread::Builder::new()
            .name("resource-release".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => {
                        runtime.block_on(self.run());
                    }
                    Err(e) => error!("Failed to start release runtime: {}", e),
                }
            });

        match worker {
            Ok(worker) => {
                if worker.join().is_err() {
                    error!("Resource release thread panicked");
                }
            }
            Err(e) => error!("Failed to spawn resource release thread: {}", e),
        }
    }
}

impl Drop for ReleaseBatch {
    fn drop(&mut self) {
        if self.items.is_empty() {
            return;
        }

        let mut rest = ReleaseBatch {
            items: std::mem::take(&mut self.items),
            fallback: Fallback::Abandon,
        };
        match self.fallback {
            Fallback::Spawn => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    warn!(
                        "Releasing {:?} in background after the scope was dropped",
                        rest.names()
                    );
                    // A runtime that is shutting down drops the task unpolled; the
                    // dropped batch then moves on to the helper thread
                    rest.fallback = Fallback::Thread;
                    handle.spawn(rest.run());
                }
                Err(_) => {
                    warn!("Releasing {:?} without a runtime", rest.names());
                    rest.finish_on_thread();
                }
            },
            Fallback::Thread => {
                warn!("Releasing {:?} on a helper thread", rest.names());
                rest.finish_on_thread();
            }
            Fallback::Abandon => {
                error!("Resources dropped unreleased: {:?}", rest.names());
                rest.items.clear();
            }
        }
    }
}

/// Defer stack of release actions, one per acquired resource
pub struct ResourceStack {
    state: LifecycleState,
    pending: Vec<PendingRelease>,
}

impl Default for ResourceStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceStack {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::NotStarted,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Number of resources still waiting to be released
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Acquire a resource and schedule `release` for it.
    ///
    /// Nothing is scheduled when `acquire` fails; resources entered earlier
    /// stay on the stack and are released by `close`.
    pub async fn enter<T, A, R, RFut>(
        &mut self,
        resource: &'static str,
        acquire: A,
        release: R,
    ) -> Result<T, LifecycleError>
    where
        T: Clone + Send + 'static,
        A: Future<Output = anyhow::Result<T>>,
        R: FnOnce(T) -> RFut + Send + 'static,
        RFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match self.state {
            LifecycleState::NotStarted => self.state = LifecycleState::Acquiring,
            LifecycleState::Acquiring => {}
            state => {
                return Err(LifecycleError::InvalidState {
                    operation: "acquire",
                    state,
                })
            }
        }

        let value = acquire
            .await
            .map_err(|source| LifecycleError::Acquire { resource, source })?;
        info!("Acquired {}", resource);

        let held = value.clone();
        self.pending.push(PendingRelease {
            resource,
            start: Some(Box::new(move || release(held).boxed())),
            running: None,
        });

        Ok(value)
    }

    /// Mark acquisition as finished
    pub fn activate(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            LifecycleState::NotStarted | LifecycleState::Acquiring => {
                self.state = LifecycleState::Active;
                Ok(())
            }
            state => Err(LifecycleError::InvalidState {
                operation: "activate",
                state,
            }),
        }
    }

    /// Release every resource in reverse acquisition order.
    ///
    /// A failing release never stops the remaining ones; all failures are
    /// returned together. Closing an already closed stack does nothing. If
    /// the returned future is dropped part way, the unfinished releases,
    /// including the one in progress, still run.
    pub async fn close(&mut self) -> Result<(), LifecycleError> {
        if self.state == LifecycleState::Closed {
            return Ok(());
        }
        self.state = LifecycleState::ReleasingAll;

        let failures = self.drain().run().await;
        self.state = LifecycleState::Closed;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Release(failures))
        }
    }

    fn drain(&mut self) -> ReleaseBatch {
        ReleaseBatch {
            items: std::mem::take(&mut self.pending),
            fallback: Fallback::Spawn,
        }
    }
}

impl fmt::Debug for ResourceStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending: Vec<_> = self.pending.iter().map(|p| p.resource).collect();
        f.debug_struct("ResourceStack")
            .field("state", &self.state)
            .field("pending", &pending)
            .finish()
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        warn!(
            "Lifecycle scope dropped while {} with {} unreleased resources",
            self.state,
            self.pending.len()
        );
        self.state = LifecycleState::Closed;
        drop(self.drain());
    }
}

/// Run `body` inside a scope whose resources are acquired by `acquire`.
///
/// Error precedence is acquisition, then body, then release. Release errors
/// that lose to an earlier error are logged. A panicking body is resumed
/// after every resource has been released.
pub async fn compose<C, T, A, B, BFut>(acquire: A, body: B) -> Result<T, LifecycleError>
where
    A: for<'s> FnOnce(&'s mut ResourceStack) -> BoxFuture<'s, Result<C, LifecycleError>>,
    B: FnOnce(C) -> BFut,
    BFut: Future<Output = anyhow::Result<T>>,
{
    let mut stack = ResourceStack::new();

    let context = match acquire(&mut stack).await {
        Ok(context) => context,
        Err(e) => {
            if let Err(release_err) = stack.close().await {
                error!("Cleanup after failed acquisition: {}", release_err);
            }
            return Err(e);
        }
    };
    stack.activate()?;

    let outcome = AssertUnwindSafe(async move { body(context).await })
        .catch_unwind()
        .await;
    let released = stack.close().await;

    match outcome {
        Ok(Ok(value)) => released.map(|()| value),
        Ok(Err(e)) => {
            if let Err(release_err) = released {
                error!("Cleanup after failed scope body: {}", release_err);
            }
            Err(LifecycleError::Body(e))
        }
        Err(panic) => {
            if let Err(release_err) = released {
                error!("Cleanup after panicked scope body: {}", release_err);
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// Acquire every shared client, publish it, run `body`, then release them all.
///
/// Order: database pool, HTTP client, OpenAI client, telemetry.
pub async fn use_all<T, F, Fut>(settings: &Settings, body: F) -> Result<T, LifecycleError>
where
    F: FnOnce(Arc<ServiceContainer>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let settings = settings.clone();
    compose(move |stack| acquire_all(settings, stack).boxed(), body).await
}

async fn acquire_all(
    settings: Settings,
    stack: &mut ResourceStack,
) -> Result<Arc<ServiceContainer>, LifecycleError> {
    let container = Arc::new(ServiceContainer::new());

    let pool = stack
        .enter(
            "database pool",
            create_db_pool(&settings.postgres_dsn),
            close_db_pool,
        )
        .await?;
    container.publish_db(pool)?;

    let http_client = stack
        .enter(
            "HTTP client",
            async { create_http_client() },
            |client: reqwest::Client| async move {
                drop(client);
                Ok::<(), anyhow::Error>(())
            },
        )
        .await?;
    container.publish_http_client(http_client)?;

    let openai_client = stack
        .enter(
            "OpenAI client",
            async {
                OpenAiClient::new(
                    &settings.openai_api_key,
                    &settings.openai_base_url,
                    settings.proxy.as_deref(),
                )
            },
            |client: OpenAiClient| async move {
                client.close();
                Ok::<(), anyhow::Error>(())
            },
        )
        .await?;
    container.publish_openai_client(openai_client)?;

    let telemetry = stack
        .enter(
            "telemetry client",
            StatsClient::connect(&settings.statsd_addr(), settings.statsd_prefix.as_deref()),
            |client: StatsClient| async move { client.close() },
        )
        .await?;
    container.publish_telemetry(telemetry)?;

    Ok(container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn record(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    async fn enter_tracked(
        stack: &mut ResourceStack,
        journal: &Journal,
        name: &'static str,
    ) -> Result<&'static str, LifecycleError> {
        let releases = journal.clone();
        journal.record(format!("acquire {}", name));
        stack
            .enter(name, async move { Ok(name) }, move |value| async move {
                releases.record(format!("release {}", value));
                Ok::<(), anyhow::Error>(())
            })
            .await
    }

    async fn explode(_: ()) -> anyhow::Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn state_moves_through_the_lifecycle() {
        let journal = Journal::default();
        let mut stack = ResourceStack::new();
        assert_eq!(stack.state(), LifecycleState::NotStarted);

        enter_tracked(&mut stack, &journal, "a").await.unwrap();
        assert_eq!(stack.state(), LifecycleState::Acquiring);

        stack.activate().unwrap();
        assert_eq!(stack.state(), LifecycleState::Active);
        assert!(matches!(
            enter_tracked(&mut stack, &journal, "late").await,
            Err(LifecycleError::InvalidState {
                state: LifecycleState::Active,
                ..
            })
        ));

        stack.close().await.unwrap();
        assert_eq!(stack.state(), LifecycleState::Closed);
        assert!(stack.activate().is_err());
    }

    #[tokio::test]
    async fn close_releases_in_reverse_order_once() {
        let journal = Journal::default();
        let mut stack = ResourceStack::new();
        for name in ["a", "b", "c"] {
            enter_tracked(&mut stack, &journal, name).await.unwrap();
        }

        stack.close().await.unwrap();
        stack.close().await.unwrap();

        assert_eq!(
            journal.entries(),
            vec![
                "acquire a",
                "acquire b",
                "acquire c",
                "release c",
                "release b",
                "release a"
            ]
        );
        assert_eq!(stack.pending(), 0);
    }

    #[tokio::test]
    async fn failed_acquire_schedules_nothing() {
        let mut stack = ResourceStack::new();

        let result = stack
            .enter(
                "broken",
                async { Err::<u8, _>(anyhow!("connection refused")) },
                |_| async { Ok::<(), anyhow::Error>(()) },
            )
            .await;

        assert!(matches!(
            result,
            Err(LifecycleError::Acquire {
                resource: "broken",
                ..
            })
        ));
        assert_eq!(stack.pending(), 0);
    }

    #[tokio::test]
    async fn failing_and_panicking_releases_do_not_stop_the_rest() {
        let journal = Journal::default();
        let mut stack = ResourceStack::new();
        enter_tracked(&mut stack, &journal, "a").await.unwrap();
        stack
            .enter("flaky", async { Ok(()) }, |_| async {
                Err::<(), _>(anyhow!("socket already closed"))
            })
            .await
            .unwrap();
        stack
            .enter("explosive", async { Ok(()) }, explode)
            .await
            .unwrap();

        let err = stack.close().await.unwrap_err();

        match err {
            LifecycleError::Release(failures) => {
                let names: Vec<_> = failures.iter().map(|f| f.resource).collect();
                assert_eq!(names, vec!["explosive", "flaky"]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(journal.entries(), vec!["acquire a", "release a"]);
    }

    #[tokio::test]
    async fn release_in_progress_when_close_is_dropped_still_finishes() {
        let journal = Journal::default();
        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();
        let mut stack = ResourceStack::new();
        enter_tracked(&mut stack, &journal, "a").await.unwrap();
        let releases = journal.clone();
        stack
            .enter("slow", async { Ok(()) }, move |()| async move {
                releases.record("release slow started".to_string());
                let _ = resume_rx.await;
                releases.record("release slow finished".to_string());
                Ok::<(), anyhow::Error>(())
            })
            .await
            .unwrap();

        let interrupted = tokio::time::timeout(Duration::from_millis(20), stack.close()).await;
        assert!(interrupted.is_err());
        resume_tx.send(()).unwrap();

        for _ in 0..100 {
            if journal.entries().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            journal.entries(),
            vec![
                "acquire a",
                "release slow started",
                "release slow finished",
                "release a"
            ]
        );
    }

    #[test]
    fn stack_dropped_outside_any_runtime_still_releases() {
        let journal = Journal::default();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let stack = runtime.block_on(async {
            let mut stack = ResourceStack::new();
            enter_tracked(&mut stack, &journal, "a").await.unwrap();
            enter_tracked(&mut stack, &journal, "b").await.unwrap();
            stack
        });
        drop(runtime);

        drop(stack);

        assert_eq!(
            journal.entries(),
            vec!["acquire a", "acquire b", "release b", "release a"]
        );
    }
}
