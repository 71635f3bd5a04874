use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use futures::{stream, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube_core::DynamicObject;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    cluster::{ApiError, ClusterApi, ObjectList, WatchEvent, WatchStream},
    dispatcher::HandlerResult,
    registrar::{self, Registration},
    resource::schema,
    BackoffConfig, Controller, ControllerConfig, EventHandler, IngressGroup, IngressGroupSpec,
    Phase, QualifiedName, RunError, ServiceItem,
};

type WatchScript = Result<Vec<Result<WatchEvent, ApiError>>, ApiError>;

#[derive(Default)]
struct Inner {
    schemas: Mutex<BTreeMap<String, CustomResourceDefinition>>,
    reject_schema: bool,
    hold_schema: bool,
    lists: Mutex<VecDeque<Result<ObjectList, ApiError>>>,
    watches: Mutex<VecDeque<WatchScript>>,
    list_calls: Mutex<usize>,
    watched_from: Mutex<Vec<String>>,
}

/// Serves scripted list and watch responses in order. Once a script runs
/// out, list blocks forever and watch yields a stream that never ends.
#[derive(Clone, Default)]
struct FakeCluster(Arc<Inner>);

impl FakeCluster {
    fn rejecting_schema() -> Self {
        Self(Arc::new(Inner {
            reject_schema: true,
            ..Inner::default()
        }))
    }

    /// Definitions are created but never become ready.
    fn holding_schema() -> Self {
        Self(Arc::new(Inner {
            hold_schema: true,
            ..Inner::default()
        }))
    }

    fn list(self, resource_version: &str, items: Vec<DynamicObject>) -> Self {
        self.0.lists.lock().push_back(Ok(ObjectList {
            items,
            resource_version: resource_version.to_owned(),
        }));
        self
    }

    fn list_error(self, err: ApiError) -> Self {
        self.0.lists.lock().push_back(Err(err));
        self
    }

    fn watch(self, events: Vec<Result<WatchEvent, ApiError>>) -> Self {
        self.0.watches.lock().push_back(Ok(events));
        self
    }

    fn watch_error(self, err: ApiError) -> Self {
        self.0.watches.lock().push_back(Err(err));
        self
    }

    fn list_calls(&self) -> usize {
        *self.0.list_calls.lock()
    }

    fn watched_from(&self) -> Vec<String> {
        self.0.watched_from.lock().clone()
    }
}

impl ClusterApi for FakeCluster {
    async fn create_schema(&self, definition: &CustomResourceDefinition) -> Result<(), ApiError> {
        if self.0.reject_schema {
            return Err(ApiError::Disconnected("connection refused".to_owned()));
        }

        let name = definition.metadata.name.clone().unwrap_or_default();
        let mut schemas = self.0.schemas.lock();
        if schemas.contains_key(&name) {
            return Err(ApiError::AlreadyExists);
        }
        schemas.insert(name, definition.clone());
        Ok(())
    }

    async fn await_schema(&self, name: &str) -> Result<(), ApiError> {
        if self.0.hold_schema {
            return std::future::pending().await;
        }
        if self.0.schemas.lock().contains_key(name) {
            Ok(())
        } else {
            Err(ApiError::Timeout(name.to_owned()))
        }
    }

    async fn list(&self) -> Result<ObjectList, ApiError> {
        *self.0.list_calls.lock() += 1;
        let next = self.0.lists.lock().pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, ApiError> {
        self.0.watched_from.lock().push(resource_version.to_owned());
        let next = self.0.watches.lock().pop_front();
        match next {
            Some(Ok(events)) => Ok(stream::iter(events).boxed()),
            Some(Err(err)) => Err(err),
            None => Ok(stream::pending().boxed()),
        }
    }
}

fn object(name: &str, version: &str, services: &[&str]) -> DynamicObject {
    let mut obj = IngressGroup::new(
        "default",
        name,
        IngressGroupSpec {
            services: services
                .iter()
                .map(|&svc| ServiceItem::new("default", svc))
                .collect(),
        },
    );
    obj.metadata.resource_version = Some(version.to_owned());
    obj.to_dynamic()
}

fn invalid_object(name: &str, version: &str) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &IngressGroup::api_resource())
        .within("default")
        .data(json!({"spec": {"services": [{"name": "svc1"}]}}));
    obj.metadata.resource_version = Some(version.to_owned());
    obj
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Add(String, Vec<String>),
    Update {
        name: String,
        prior: Vec<String>,
        current: Vec<String>,
    },
    Delete(String),
}

fn services(obj: &IngressGroup) -> Vec<String> {
    obj.spec.services.iter().map(|svc| svc.name.clone()).collect()
}

fn name(obj: &IngressGroup) -> String {
    obj.metadata.name.clone().unwrap_or_default()
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Seen>>>);

impl Recorder {
    fn seen(&self) -> Vec<Seen> {
        self.0.lock().clone()
    }
}

impl EventHandler for Recorder {
    fn on_add(&self, obj: &IngressGroup) -> HandlerResult {
        self.0.lock().push(Seen::Add(name(obj), services(obj)));
        Ok(())
    }

    fn on_update(&self, prior: &IngressGroup, current: &IngressGroup) -> HandlerResult {
        self.0.lock().push(Seen::Update {
            name: name(current),
            prior: services(prior),
            current: services(current),
        });
        Ok(())
    }

    fn on_delete(&self, obj: &IngressGroup) -> HandlerResult {
        self.0.lock().push(Seen::Delete(name(obj)));
        Ok(())
    }
}

struct PanicOnAdd;

impl EventHandler for PanicOnAdd {
    fn on_add(&self, _obj: &IngressGroup) -> HandlerResult {
        panic!("handler bug");
    }
}

fn fast_config() -> ControllerConfig {
    ControllerConfig::default().backoff(BackoffConfig {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: 0.0,
    })
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct Running {
    recorder: Recorder,
    store: crate::Store,
    phase: crate::PhaseWatch,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), RunError>>,
}

impl Running {
    async fn stop(self) -> Result<(), RunError> {
        self.cancel.cancel();
        self.handle.await.unwrap()
    }
}

fn start(cluster: FakeCluster, config: ControllerConfig) -> Running {
    let recorder = Recorder::default();
    let mut controller = Controller::new(cluster, config);
    controller.register_handler(PanicOnAdd);
    controller.register_handler(recorder.clone());

    let store = controller.store();
    let phase = controller.phase();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(controller.run(cancel.clone()));

    Running {
        recorder,
        store,
        phase,
        cancel,
        handle,
    }
}

#[tokio::test]
async fn update_is_delivered_once_with_both_sides() {
    let cluster = FakeCluster::default()
        .list("100", vec![object("g1", "100", &["svc1"])])
        .watch(vec![Ok(WatchEvent::Modified(object(
            "g1",
            "101",
            &["svc1", "svc2"],
        )))]);
    let mut running = start(cluster.clone(), fast_config());

    assert!(running.phase.wait_synced().await);
    eventually(|| cluster.watched_from().len() == 2).await;

    assert_eq!(
        running.recorder.seen(),
        vec![
            Seen::Add("g1".to_owned(), vec!["svc1".to_owned()]),
            Seen::Update {
                name: "g1".to_owned(),
                prior: vec!["svc1".to_owned()],
                current: vec!["svc1".to_owned(), "svc2".to_owned()],
            },
        ]
    );

    let cached = running
        .store
        .get(&QualifiedName::new("default", "g1"))
        .unwrap();
    assert_eq!(cached.resource_version(), Some("101"));
    assert_eq!(services(&cached), vec!["svc1", "svc2"]);

    // a closed stream resumes from the last seen version without relisting
    assert_eq!(cluster.watched_from(), vec!["100", "101"]);
    assert_eq!(cluster.list_calls(), 1);

    let mut phase = running.phase.clone();
    running.stop().await.unwrap();
    phase.wait_stopped().await;
    assert_eq!(phase.current(), Phase::Stopped);
}

#[tokio::test]
async fn stream_error_resyncs_and_deletes_missing_entries() {
    let cluster = FakeCluster::default()
        .list(
            "10",
            vec![object("g1", "1", &["svc1"]), object("g2", "2", &["svc2"])],
        )
        .watch(vec![Err(ApiError::Disconnected("reset by peer".to_owned()))])
        .list("12", vec![object("g1", "1", &["svc1"])]);
    let running = start(cluster.clone(), fast_config());

    eventually(|| running.recorder.seen().len() == 3).await;
    eventually(|| cluster.watched_from().len() == 2).await;

    assert_eq!(
        running.recorder.seen(),
        vec![
            Seen::Add("g1".to_owned(), vec!["svc1".to_owned()]),
            Seen::Add("g2".to_owned(), vec!["svc2".to_owned()]),
            Seen::Delete("g2".to_owned()),
        ]
    );
    assert!(running
        .store
        .get(&QualifiedName::new("default", "g2"))
        .is_none());
    assert_eq!(running.store.len(), 1);
    assert_eq!(cluster.watched_from(), vec!["10", "12"]);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn redelivered_events_are_not_misclassified() {
    let cluster = FakeCluster::default()
        .list("100", vec![object("g1", "100", &["svc1"])])
        .watch(vec![
            Ok(WatchEvent::Added(object("g1", "100", &["svc1"]))),
            Ok(WatchEvent::Modified(object("g1", "101", &["svc1", "svc2"]))),
            Ok(WatchEvent::Modified(object("g1", "101", &["svc1", "svc2"]))),
            Ok(WatchEvent::Deleted(object("unknown", "102", &[]))),
            Ok(WatchEvent::Bookmark {
                resource_version: "150".to_owned(),
            }),
        ]);
    let running = start(cluster.clone(), fast_config());

    eventually(|| cluster.watched_from().len() == 2).await;

    let seen = running.recorder.seen();
    assert_eq!(seen.len(), 2, "{seen:?}");
    assert!(matches!(seen[0], Seen::Add(..)));
    assert!(matches!(seen[1], Seen::Update { .. }));
    assert_eq!(cluster.watched_from(), vec!["100", "150"]);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_objects_are_skipped() {
    let cluster = FakeCluster::default()
        .list(
            "5",
            vec![object("g1", "1", &["svc1"]), invalid_object("bad", "2")],
        )
        .watch(vec![
            Ok(WatchEvent::Added(invalid_object("worse", "6"))),
            Ok(WatchEvent::Added(object("g3", "7", &[]))),
        ]);
    let running = start(cluster.clone(), fast_config());

    eventually(|| cluster.watched_from().len() == 2).await;

    assert_eq!(
        running.recorder.seen(),
        vec![
            Seen::Add("g1".to_owned(), vec!["svc1".to_owned()]),
            Seen::Add("g3".to_owned(), vec![]),
        ]
    );
    assert!(running
        .store
        .get(&QualifiedName::new("default", "bad"))
        .is_none());
    assert!(running
        .store
        .get(&QualifiedName::new("default", "worse"))
        .is_none());
    assert_eq!(cluster.watched_from(), vec!["5", "7"]);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn expired_checkpoint_falls_back_to_list() {
    let cluster = FakeCluster::default()
        .list("1", vec![object("g1", "1", &[])])
        .watch_error(ApiError::Expired)
        .list("5", vec![object("g1", "1", &[]), object("g2", "5", &[])])
        .watch(vec![Err(ApiError::Expired)])
        .list("9", vec![object("g2", "5", &[])]);
    let running = start(cluster.clone(), fast_config());

    eventually(|| cluster.watched_from().len() == 3).await;

    assert_eq!(
        running.recorder.seen(),
        vec![
            Seen::Add("g1".to_owned(), vec![]),
            Seen::Add("g2".to_owned(), vec![]),
            Seen::Delete("g1".to_owned()),
        ]
    );
    assert_eq!(cluster.watched_from(), vec!["1", "5", "9"]);
    assert_eq!(cluster.list_calls(), 3);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let cluster = FakeCluster::default()
        .list_error(ApiError::Disconnected("no route to host".to_owned()))
        .list("3", vec![object("g1", "3", &[])])
        .watch_error(ApiError::Disconnected("connection reset".to_owned()))
        .watch(vec![Ok(WatchEvent::Added(object("g2", "4", &[])))]);
    let mut running = start(cluster.clone(), fast_config());

    assert!(running.phase.wait_synced().await);
    eventually(|| running.recorder.seen().len() == 2).await;

    assert_eq!(cluster.list_calls(), 2);
    assert_eq!(cluster.watched_from()[..2], ["3", "3"]);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn periodic_resync_reconciles_cache() {
    let cluster = FakeCluster::default()
        .list("1", vec![object("g1", "1", &[]), object("g2", "1", &[])])
        .list("2", vec![object("g1", "2", &["svc1"])]);
    let config = fast_config().resync_period(Duration::from_millis(20));
    let running = start(cluster.clone(), config);

    eventually(|| running.recorder.seen().len() == 4).await;

    assert_eq!(
        running.recorder.seen(),
        vec![
            Seen::Add("g1".to_owned(), vec![]),
            Seen::Add("g2".to_owned(), vec![]),
            Seen::Update {
                name: "g1".to_owned(),
                prior: vec![],
                current: vec!["svc1".to_owned()],
            },
            Seen::Delete("g2".to_owned()),
        ]
    );

    running.stop().await.unwrap();
}

#[tokio::test]
async fn cancellation_interrupts_pending_list() {
    let cluster = FakeCluster::default();
    let mut running = start(cluster.clone(), fast_config());

    eventually(|| cluster.list_calls() == 1).await;
    assert_eq!(running.phase.current(), Phase::Syncing);

    let mut phase = running.phase.clone();
    running.stop().await.unwrap();
    assert!(!phase.wait_synced().await);
    assert_eq!(phase.current(), Phase::Stopped);
}

#[tokio::test]
async fn repeated_stream_failures_back_off_exponentially() {
    let mut cluster = FakeCluster::default();
    for version in ["1", "2", "3", "4"] {
        cluster = cluster
            .list(version, vec![object("g1", "1", &[])])
            .watch(vec![Err(ApiError::Disconnected("reset by peer".to_owned()))]);
    }
    let cluster = cluster.list("5", vec![object("g1", "1", &[])]);
    let config = ControllerConfig::default().backoff(BackoffConfig {
        initial: Duration::from_millis(20),
        max: Duration::from_secs(1),
        multiplier: 2.0,
        jitter: 0.0,
    });

    let started = std::time::Instant::now();
    let running = start(cluster.clone(), config);
    eventually(|| cluster.watched_from().len() == 5).await;

    // 20 + 40 + 80 + 160ms; a schedule reset by every relist would take 80ms
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert_eq!(cluster.list_calls(), 5);
    assert_eq!(cluster.watched_from(), vec!["1", "2", "3", "4", "5"]);
    assert_eq!(running.recorder.seen().len(), 1);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let cluster =
        FakeCluster::default().list_error(ApiError::Disconnected("no route to host".to_owned()));
    let config = ControllerConfig::default().backoff(BackoffConfig {
        initial: Duration::from_secs(60),
        max: Duration::from_secs(60),
        multiplier: 2.0,
        jitter: 0.0,
    });
    let running = start(cluster.clone(), config);

    eventually(|| cluster.list_calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut phase = running.phase.clone();
    tokio::time::timeout(Duration::from_secs(1), running.stop())
        .await
        .expect("run did not return while backing off")
        .unwrap();
    assert_eq!(phase.current(), Phase::Stopped);
    assert!(!phase.wait_synced().await);
    assert_eq!(cluster.list_calls(), 1);
}

#[tokio::test]
async fn cancellation_during_registration_stops_cleanly() {
    let cluster = FakeCluster::holding_schema().list("1", vec![object("g1", "1", &[])]);
    let running = start(cluster.clone(), fast_config());

    eventually(|| cluster.0.schemas.lock().len() == 1).await;
    assert_eq!(running.phase.current(), Phase::Registering);

    let mut phase = running.phase.clone();
    tokio::time::timeout(Duration::from_secs(1), running.stop())
        .await
        .expect("run did not return while registering")
        .unwrap();
    assert_eq!(phase.current(), Phase::Stopped);
    assert!(!phase.wait_synced().await);
    assert_eq!(cluster.list_calls(), 0);
}

#[tokio::test]
async fn schema_registration_is_idempotent() {
    let cluster = FakeCluster::default();
    let definition = schema::definition();

    assert_eq!(
        registrar::register(&cluster, &definition).await.unwrap(),
        Registration::Created
    );
    assert_eq!(
        registrar::register(&cluster, &definition).await.unwrap(),
        Registration::AlreadyExists
    );
    assert_eq!(cluster.0.schemas.lock().len(), 1);

    // a controller starting against an existing definition proceeds normally
    let cluster = cluster.list("1", vec![object("g1", "1", &[])]);
    let mut running = start(cluster, fast_config());
    assert!(running.phase.wait_synced().await);
    assert_eq!(running.store.len(), 1);
    running.stop().await.unwrap();
}

#[tokio::test]
async fn registration_failure_is_fatal() {
    let cluster = FakeCluster::rejecting_schema().list("1", vec![object("g1", "1", &[])]);
    let mut running = start(cluster.clone(), fast_config());

    assert!(!running.phase.wait_synced().await);
    let err = running.handle.await.unwrap().unwrap_err();
    assert!(matches!(err, RunError::Register(_)), "{err}");
    assert_eq!(cluster.list_calls(), 0);
}
