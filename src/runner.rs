use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    cluster::ClusterApi,
    config::ControllerConfig,
    dispatcher::{Dispatcher, EventHandler},
    list_watch::ListWatcher,
    registrar::{self, RegisterError},
    resource::schema,
    store::{Store, Writer},
};

/// Lifecycle of a [`Controller`], in the order it moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Created,
    Registering,
    /// Waiting for the first listing and watch.
    Syncing,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct State {
    phase: Phase,
    synced: bool,
}

/// Observes the phase of a running [`Controller`] from another task.
#[derive(Debug, Clone)]
pub struct PhaseWatch(watch::Receiver<State>);

impl PhaseWatch {
    pub fn current(&self) -> Phase {
        self.0.borrow().phase
    }

    /// Resolves once the cache has synced. Returns `false` if the controller
    /// stopped without ever syncing.
    pub async fn wait_synced(&mut self) -> bool {
        let synced = match self
            .0
            .wait_for(|state| state.synced || state.phase == Phase::Stopped)
            .await
        {
            Ok(state) => Some(state.synced),
            Err(_) => None,
        };
        synced.unwrap_or_else(|| self.0.borrow().synced)
    }

    /// Resolves once the controller has stopped.
    pub async fn wait_stopped(&mut self) {
        let _ = self
            .0
            .wait_for(|state| state.phase == Phase::Stopped)
            .await;
    }
}

/// Registers the `IngressGroup` definition, then mirrors all instances into a
/// [`Store`] and notifies registered handlers of every transition.
pub struct Controller<A> {
    api: Arc<A>,
    config: ControllerConfig,
    writer: Writer,
    dispatcher: Dispatcher,
    state: watch::Sender<State>,
}

impl<A: ClusterApi> Controller<A> {
    pub fn new(api: A, config: ControllerConfig) -> Self {
        let (state, _) = watch::channel(State {
            phase: Phase::Created,
            synced: false,
        });

        Self {
            api: Arc::new(api),
            config,
            writer: Writer::new(),
            dispatcher: Dispatcher::new(),
            state,
        }
    }

    /// Adds a handler. Handlers are notified in registration order.
    pub fn register_handler(&mut self, handler: impl EventHandler + 'static) -> &mut Self {
        self.dispatcher.register(handler);
        self
    }

    /// A read handle to the cache, usable from any task.
    pub fn store(&self) -> Store {
        self.writer.as_reader()
    }

    pub fn phase(&self) -> PhaseWatch {
        PhaseWatch(self.state.subscribe())
    }

    /// Runs until `cancel` fires.
    ///
    /// Fails only if the definition cannot be registered; every later error
    /// is retried inside the list-watch loop.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RunError> {
        let Self {
            api,
            config,
            writer,
            dispatcher,
            state,
        } = self;

        let set_phase = |phase: Phase| {
            log::info!("Controller phase: {phase:?}");
            state.send_modify(|state| state.phase = phase);
        };

        set_phase(Phase::Registering);
        let definition = schema::definition();
        let registered = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            registered = registrar::register(&*api, &definition) => Some(registered),
        };

        match registered {
            Some(Ok(_)) => {
                set_phase(Phase::Syncing);
                log::info!("Starting {} handler(s)", dispatcher.len());
                ListWatcher::new(api, writer, dispatcher, &config)
                    .run(cancel, || {
                        state.send_modify(|state| state.synced = true);
                        set_phase(Phase::Running);
                    })
                    .await;
            }
            Some(Err(err)) => {
                set_phase(Phase::Stopped);
                return Err(RunError::Register(err));
            }
            None => log::info!("Cancelled before registration completed"),
        }

        // Handlers run inline on the list-watch task, so nothing is in flight
        // once it has returned.
        set_phase(Phase::Stopping);
        set_phase(Phase::Stopped);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("schema registration failed: {0}")]
    Register(#[from] RegisterError),
}
