//! Keeps the [`Writer`] in step with the cluster.
//!
//! The loop lists everything once, then watches from the listing's resource
//! version. A relist (resync) happens when the resync timer fires, when the
//! checkpoint has expired, or after the watch stream failed. Each relist is
//! reconciled against the cache, so anything missed while disconnected shows
//! up as synthetic add, update or delete transitions.

use std::{collections::HashSet, sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    cluster::{ApiError, ClusterApi, WatchEvent},
    config::ControllerConfig,
    dispatcher::Dispatcher,
    resource::{IngressGroup, QualifiedName, KIND, PLURAL},
    store::{Change, Transition, Writer},
};

/// How a watch session ended.
enum WatchExit {
    Relist,
    Cancelled,
}

pub struct ListWatcher<A> {
    api: Arc<A>,
    writer: Writer,
    dispatcher: Dispatcher,
    resync_period: Duration,
    backoff: ExponentialBackoff,
}

impl<A: ClusterApi> ListWatcher<A> {
    pub fn new(
        api: Arc<A>,
        writer: Writer,
        dispatcher: Dispatcher,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            api,
            writer,
            dispatcher,
            resync_period: config.resync_period,
            backoff: config.backoff.build(),
        }
    }

    /// Runs until `cancel` fires.
    ///
    /// `on_synced` is called once, after the first listing has been applied
    /// and the first watch stream is open.
    pub async fn run(mut self, cancel: CancellationToken, on_synced: impl FnOnce() + Send) {
        let mut on_synced = Some(on_synced);

        loop {
            let Some(resource_version) = self.relist(&cancel).await else {
                break;
            };

            match self.watch(&cancel, resource_version, &mut on_synced).await {
                WatchExit::Relist => continue,
                WatchExit::Cancelled => break,
            }
        }

        log::debug!("List-watch loop for {PLURAL} stopped");
    }

    /// Lists until it succeeds, then reconciles the cache against the result.
    /// Returns the checkpoint to watch from, or `None` if cancelled.
    async fn relist(&mut self, cancel: &CancellationToken) -> Option<String> {
        loop {
            let listed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                listed = self.api.list() => listed,
            };

            match listed {
                Ok(list) => {
                    log::debug!(
                        "Listed {} {PLURAL} at resource version {}",
                        list.items.len(),
                        list.resource_version
                    );
                    self.reconcile(list.items);
                    return Some(list.resource_version);
                }
                Err(err) => {
                    log::warn!("Failed to list {PLURAL}: {err}");
                    if !self.wait_backoff(cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    fn reconcile(&mut self, items: Vec<kube_core::DynamicObject>) {
        let mut valid = Vec::with_capacity(items.len());
        let mut retain = HashSet::new();

        for obj in items {
            let key = QualifiedName::from_meta(&obj.metadata);
            match IngressGroup::try_from(obj) {
                Ok(obj) => valid.push(obj),
                Err(err) => {
                    log::warn!("Skipping invalid {KIND} {}: {err}", display(key.as_ref()));
                    retain.extend(key);
                }
            }
        }

        for transition in self.writer.reconcile(valid, &retain) {
            self.dispatch(&transition);
        }
    }

    async fn watch(
        &mut self,
        cancel: &CancellationToken,
        mut resource_version: String,
        on_synced: &mut Option<impl FnOnce()>,
    ) -> WatchExit {
        let resync_at =
            (!self.resync_period.is_zero()).then(|| Instant::now() + self.resync_period);

        loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WatchExit::Cancelled,
                _ = sleep_until(resync_at) => return WatchExit::Relist,
                opened = self.api.watch(&resource_version) => opened,
            };

            let mut stream = match opened {
                Ok(stream) => stream,
                Err(ApiError::Expired) => {
                    log::info!("Resource version {resource_version} expired, relisting {PLURAL}");
                    return WatchExit::Relist;
                }
                Err(err) => {
                    log::warn!("Failed to watch {PLURAL} from {resource_version}: {err}");
                    if !self.wait_backoff(cancel).await {
                        return WatchExit::Cancelled;
                    }
                    continue;
                }
            };

            if let Some(on_synced) = on_synced.take() {
                log::info!("{KIND} cache synced with {} entries", self.writer.as_reader().len());
                on_synced();
            }

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return WatchExit::Cancelled,
                    _ = sleep_until(resync_at) => {
                        log::debug!("Periodic resync of {PLURAL}");
                        return WatchExit::Relist;
                    }
                    event = stream.next() => event,
                };

                match event {
                    Some(Ok(event)) => {
                        self.backoff.reset();
                        if let Some(version) = event.resource_version() {
                            resource_version = version.to_owned();
                        }
                        self.handle(event);
                    }
                    Some(Err(ApiError::Expired)) => {
                        log::info!(
                            "Resource version {resource_version} expired, relisting {PLURAL}"
                        );
                        return WatchExit::Relist;
                    }
                    Some(Err(err)) => {
                        log::warn!("Watch of {PLURAL} failed: {err}");
                        if !self.wait_backoff(cancel).await {
                            return WatchExit::Cancelled;
                        }
                        return WatchExit::Relist;
                    }
                    None => {
                        self.backoff.reset();
                        log::debug!("Watch of {PLURAL} closed, reopening from {resource_version}");
                        break;
                    }
                }
            }
        }
    }

    fn handle(&mut self, event: WatchEvent) {
        let change = match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let key = QualifiedName::from_meta(&obj.metadata);
                match IngressGroup::try_from(obj) {
                    Ok(obj) => Change::Upsert(obj),
                    Err(err) => {
                        log::warn!("Skipping invalid {KIND} {}: {err}", display(key.as_ref()));
                        return;
                    }
                }
            }
            WatchEvent::Deleted(obj) => match QualifiedName::from_meta(&obj.metadata) {
                Some(key) => Change::Remove(key),
                None => {
                    log::warn!("Ignoring deletion of unnamed {KIND}");
                    return;
                }
            },
            WatchEvent::Bookmark { .. } => return,
        };

        if let Some(transition) = self.writer.apply(change) {
            self.dispatch(&transition);
        }
    }

    fn dispatch(&self, transition: &Transition) {
        log::debug!(
            "{} {}",
            match transition {
                Transition::Added(_) => "Added",
                Transition::Updated { .. } => "Updated",
                Transition::Deleted(_) => "Deleted",
            },
            display(QualifiedName::from_resource(transition.object()).as_ref())
        );
        self.dispatcher.dispatch(transition);
    }

    /// Sleeps for the next backoff interval. Returns `false` if cancelled first.
    ///
    /// The schedule only resets once a watch stream has proven healthy, so a
    /// stream that keeps failing right after a good listing still backs off.
    async fn wait_backoff(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval);
        log::debug!("Retrying in {delay:?}");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn display(key: Option<&QualifiedName>) -> String {
    key.map_or_else(|| "<unnamed>".to_owned(), ToString::to_string)
}
