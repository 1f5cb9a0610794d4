//! The client actor.
//!
//! [`Client`] runs a [`SyncEngine`] and an [`EventManager`] on one tokio
//! task. The task selects over caller commands, transport events and the
//! next timer deadline, so engine operations never interleave. The engine's
//! virtual clock follows the task's monotonic clock.

use crate::config::EngineConfig;
use crate::core::{
    EventManager, ListenOptions, ListenerId, MemorySharedClientState, QueryListener, SyncEngine, ViewSnapshot,
};
use crate::error::{EngineError, EngineResult};
use crate::local::QueryResult;
use crate::remote::{stream_event_channel, Connection, CredentialsProvider, StreamEventReceiver};
use docsync_model::{DocumentKey, MaybeDocument, Mutation, Query, User};
use docsync_storage::Persistence;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<EngineResult<T>>;

enum ClientCommand {
    Listen {
        query: Query,
        options: ListenOptions,
        reply: Reply<QuerySubscription>,
    },
    Unlisten {
        listener_id: ListenerId,
        reply: Reply<()>,
    },
    Write {
        mutations: Vec<Mutation>,
        reply: Reply<oneshot::Receiver<EngineResult<()>>>,
    },
    WaitForPendingWrites {
        reply: Reply<oneshot::Receiver<EngineResult<()>>>,
    },
    ReadDocument {
        key: DocumentKey,
        reply: Reply<Option<MaybeDocument>>,
    },
    ExecuteQuery {
        query: Query,
        reply: Reply<QueryResult>,
    },
    SnapshotsInSync {
        reply: Reply<mpsc::UnboundedReceiver<()>>,
    },
    EnableNetwork {
        reply: Reply<()>,
    },
    DisableNetwork {
        reply: Reply<()>,
    },
    CredentialChange {
        user: User,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Snapshots of one listened query.
#[derive(Debug)]
pub struct QuerySubscription {
    /// Pass to [`Client::unlisten`] to stop listening.
    pub listener_id: ListenerId,
    /// Snapshots, or the error that ended the listen.
    pub snapshots: mpsc::UnboundedReceiver<EngineResult<ViewSnapshot>>,
}

/// Handle to a running client.
///
/// Share it behind an `Arc` to issue commands from several tasks.
#[derive(Debug)]
pub struct Client {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl Client {
    /// Starts a primary client on the current tokio runtime.
    pub fn start(
        persistence: Arc<dyn Persistence>,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        config: &EngineConfig,
        user: User,
    ) -> EngineResult<Self> {
        let (stream_sender, stream_events) = stream_event_channel();
        let mut engine = SyncEngine::new(
            persistence,
            connection,
            credentials,
            Arc::new(MemorySharedClientState::new()),
            config,
            user,
            stream_sender,
        );
        engine.start()?;
        info!("client started");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = ClientActor {
            engine,
            event_manager: EventManager::new(),
            started: Instant::now(),
        };
        tokio::spawn(actor.run(command_rx, stream_events));
        Ok(Self { commands })
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> ClientCommand) -> EngineResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::Shutdown)?;
        response.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Listens to `query`.
    pub async fn listen(&self, query: Query, options: ListenOptions) -> EngineResult<QuerySubscription> {
        self.request(|reply| ClientCommand::Listen { query, options, reply })
            .await
    }

    /// Stops a listener.
    pub async fn unlisten(&self, listener_id: ListenerId) -> EngineResult<()> {
        self.request(|reply| ClientCommand::Unlisten { listener_id, reply })
            .await
    }

    /// Writes a batch and waits until the backend accepts or rejects it.
    ///
    /// Listeners see the write before this returns.
    pub async fn write(&self, mutations: Vec<Mutation>) -> EngineResult<()> {
        let acknowledged = self
            .request(|reply| ClientCommand::Write { mutations, reply })
            .await?;
        acknowledged.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Waits until every batch written so far is acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> EngineResult<()> {
        let done = self
            .request(|reply| ClientCommand::WaitForPendingWrites { reply })
            .await?;
        done.await.map_err(|_| EngineError::Shutdown)?
    }

    /// The local view of one document, without contacting the backend.
    pub async fn read_document(&self, key: DocumentKey) -> EngineResult<Option<MaybeDocument>> {
        self.request(|reply| ClientCommand::ReadDocument { key, reply })
            .await
    }

    /// Runs `query` against the local cache.
    pub async fn execute_query(&self, query: Query) -> EngineResult<QueryResult> {
        self.request(|reply| ClientCommand::ExecuteQuery { query, reply })
            .await
    }

    /// A channel that ticks whenever all listeners have seen consistent
    /// snapshots.
    pub async fn snapshots_in_sync(&self) -> EngineResult<mpsc::UnboundedReceiver<()>> {
        self.request(|reply| ClientCommand::SnapshotsInSync { reply })
            .await
    }

    /// Re-enables the network.
    pub async fn enable_network(&self) -> EngineResult<()> {
        self.request(|reply| ClientCommand::EnableNetwork { reply })
            .await
    }

    /// Disables the network; listeners see cached results.
    pub async fn disable_network(&self) -> EngineResult<()> {
        self.request(|reply| ClientCommand::DisableNetwork { reply })
            .await
    }

    /// Switches to another user.
    pub async fn handle_credential_change(&self, user: User) -> EngineResult<()> {
        self.request(|reply| ClientCommand::CredentialChange { user, reply })
            .await
    }

    /// Stops the client. Pending waits fail and later calls return
    /// [`EngineError::Shutdown`].
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.request(|reply| ClientCommand::Shutdown { reply }).await
    }
}

struct ClientActor {
    engine: SyncEngine,
    event_manager: EventManager,
    started: Instant,
}

impl ClientActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
        mut stream_events: StreamEventReceiver,
    ) {
        loop {
            self.catch_up_clock();
            let deadline = self.engine.next_deadline().map(|deadline| self.started + deadline);

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("all client handles dropped");
                        self.shutdown();
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(event) = stream_events.recv() => {
                    if let Err(err) = self.engine.handle_stream_event(event) {
                        warn!(error = %err, "failed to handle stream event");
                    }
                }
                _ = sleep_until(deadline.unwrap_or(self.started)), if deadline.is_some() => {}
            }
            self.dispatch_events();
        }
        debug!("client task stopped");
    }

    /// Runs timers that are due in real time.
    fn catch_up_clock(&mut self) {
        if let Err(err) = self.engine.advance_to(self.started.elapsed()) {
            warn!(error = %err, "delayed operation failed");
        }
        self.dispatch_events();
    }

    fn dispatch_events(&mut self) {
        let events = self.engine.drain_events();
        if !events.is_empty() {
            self.event_manager.handle_events(events);
        }
    }

    /// Returns false once the client shut down.
    fn handle_command(&mut self, command: ClientCommand) -> bool {
        match command {
            ClientCommand::Listen { query, options, reply } => {
                let (observer, snapshots) = mpsc::unbounded_channel();
                let listener = QueryListener::new(query, options, Box::new(observer));
                // Earlier events must reach existing listeners before the
                // new listener's first snapshot.
                self.dispatch_events();
                let result = self
                    .event_manager
                    .listen(&mut self.engine, listener)
                    .map(|listener_id| QuerySubscription { listener_id, snapshots });
                let _ = reply.send(result);
            }
            ClientCommand::Unlisten { listener_id, reply } => {
                let _ = reply.send(self.event_manager.unlisten(&mut self.engine, listener_id));
            }
            ClientCommand::Write { mutations, reply } => {
                let _ = reply.send(self.engine.write(mutations));
            }
            ClientCommand::WaitForPendingWrites { reply } => {
                let _ = reply.send(self.engine.wait_for_pending_writes());
            }
            ClientCommand::ReadDocument { key, reply } => {
                let _ = reply.send(self.engine.local_store().read_document(&key));
            }
            ClientCommand::ExecuteQuery { query, reply } => {
                let _ = reply.send(self.engine.execute_query(&query, false));
            }
            ClientCommand::SnapshotsInSync { reply } => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.event_manager.add_snapshots_in_sync_listener(tx);
                let _ = reply.send(Ok(rx));
            }
            ClientCommand::EnableNetwork { reply } => {
                let _ = reply.send(self.engine.enable_network());
            }
            ClientCommand::DisableNetwork { reply } => {
                let _ = reply.send(self.engine.disable_network());
            }
            ClientCommand::CredentialChange { user, reply } => {
                let _ = reply.send(self.engine.handle_credential_change(user));
            }
            ClientCommand::Shutdown { reply } => {
                let _ = reply.send(self.shutdown());
                return false;
            }
        }
        true
    }

    fn shutdown(&mut self) -> EngineResult<()> {
        let result = self.engine.shutdown();
        self.dispatch_events();
        info!("client shut down");
        result
    }
}
