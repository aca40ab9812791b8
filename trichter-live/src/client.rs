//! Client synchronization agent.
//!
//! ```text
//!  commands (connect, reconnect, online, …)
//!        │
//!        ▼
//!  ┌─────────────┐  actions   ┌────────────────────────────────┐
//!  │ Reconnector │ ─────────► │ driver task                    │
//!  └─────────────┘            │  opening: transport.open()     │
//!        ▲                    │  session: frame stream         │──► RunsStore
//!        │ opened / failed /  │  idle:    silence deadline     │
//!        │ retry elapsed      │  retry:   backoff timer        │
//!        └────────────────────└────────────────────────────────┘
//!                                        │
//!                                        ▼
//!                               watch<ConnectionStatus>
//! ```
//!
//! [`LiveClient`] spawns one driver task that owns the transport session
//! and the retry timer. The controller decides; the driver only executes
//! the returned actions, so a cancelled timer or a torn-down session can
//! never deliver a late result. A session that stays silent (no frame and
//! no heartbeat) past the idle timeout is treated as failed; this catches
//! half-open connections that never report an error.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

use crate::reconnect::{Action, ConnectionState, ReconnectPolicy, Reconnector};
use crate::replica::{ConnectionQuality, RunsStore};
use crate::transport::{FrameStream, Inbound, Transport, TransportError};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub policy: ReconnectPolicy,
    /// Re-fetch the full snapshot after every reconnection
    pub resync_on_reconnect: bool,
    /// Events older than this make the connection quality `Poor`
    pub quality_window: Duration,
    /// A connected session with no inbound traffic for this long is
    /// failed. Keep it at about twice the server keepalive interval.
    pub idle_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            resync_on_reconnect: true,
            quality_window: Duration::from_secs(60),
            // Server keepalive defaults to 15s.
            idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Connection status published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    /// Retries are spent; only a manual reconnect resumes
    pub exhausted: bool,
    pub online: bool,
}

impl ConnectionStatus {
    fn of(machine: &Reconnector) -> Self {
        Self {
            state: machine.state(),
            attempts: machine.attempts(),
            exhausted: machine.is_exhausted(),
            online: machine.is_online(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
    Reconnect,
    NetworkOnline,
    NetworkOffline,
    VisibilityRestored,
    Shutdown,
}

/// Handle to a running sync agent.
pub struct LiveClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    store: RunsStore,
    config: ClientConfig,
    task: JoinHandle<()>,
}

impl LiveClient {
    /// Start the driver task. Nothing connects until [`connect`](Self::connect).
    pub fn spawn(transport: Arc<dyn Transport>, store: RunsStore, config: ClientConfig) -> Self {
        let machine = Reconnector::new(config.policy);
        let (status_tx, status) = watch::channel(ConnectionStatus::of(&machine));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            machine,
            transport,
            store: store.clone(),
            resync_on_reconnect: config.resync_on_reconnect,
            idle_timeout: config.idle_timeout,
            status: status_tx,
            has_connected: false,
        };
        let task = tokio::spawn(driver.run(command_rx));

        Self {
            commands,
            status,
            store,
            config,
            task,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("Sync agent already stopped, dropping {command:?}");
        }
    }

    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    pub fn network_online(&self) {
        self.send(Command::NetworkOnline);
    }

    pub fn network_offline(&self) {
        self.send(Command::NetworkOffline);
    }

    pub fn visibility_restored(&self) {
        self.send(Command::VisibilityRestored);
    }

    /// Disconnect and wait for the driver task to finish.
    pub async fn shutdown(self) {
        self.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            log::warn!("Sync agent task ended abnormally: {e}");
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn store(&self) -> &RunsStore {
        &self.store
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        self.store.connection_quality(self.config.quality_window)
    }
}

enum Event {
    Command(Option<Command>),
    Opened(Result<FrameStream, TransportError>),
    Inbound(Option<Result<Inbound, TransportError>>),
    IdleElapsed,
    RetryElapsed,
}

#[derive(Default)]
struct Links {
    opening: Option<BoxFuture<'static, Result<FrameStream, TransportError>>>,
    session: Option<FrameStream>,
    idle: Option<Pin<Box<Sleep>>>,
    retry: Option<Pin<Box<Sleep>>>,
}

struct Driver {
    machine: Reconnector,
    transport: Arc<dyn Transport>,
    store: RunsStore,
    resync_on_reconnect: bool,
    idle_timeout: Option<Duration>,
    status: watch::Sender<ConnectionStatus>,
    has_connected: bool,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut links = Links::default();

        loop {
            let event = {
                let Links {
                    opening,
                    session,
                    idle,
                    retry,
                } = &mut links;
                tokio::select! {
                    cmd = commands.recv() => Event::Command(cmd),

                    result = async {
                        match opening.as_mut() {
                            Some(fut) => fut.await,
                            None => std::future::pending().await,
                        }
                    }, if opening.is_some() => Event::Opened(result),

                    item = async {
                        match session.as_mut() {
                            Some(stream) => stream.next().await,
                            None => std::future::pending().await,
                        }
                    }, if session.is_some() => Event::Inbound(item),

                    _ = async {
                        match idle.as_mut() {
                            Some(sleep) => sleep.as_mut().await,
                            None => std::future::pending().await,
                        }
                    }, if idle.is_some() => Event::IdleElapsed,

                    _ = async {
                        match retry.as_mut() {
                            Some(sleep) => sleep.as_mut().await,
                            None => std::future::pending().await,
                        }
                    }, if retry.is_some() => Event::RetryElapsed,
                }
            };

            let actions = match event {
                Event::Command(None) | Event::Command(Some(Command::Shutdown)) => {
                    let actions = self.machine.disconnect();
                    self.apply(actions, &mut links);
                    log::debug!("Sync agent stopped");
                    break;
                }
                Event::Command(Some(command)) => self.handle_command(command),
                Event::Opened(Ok(stream)) => {
                    links.opening = None;
                    let actions = self.machine.opened();
                    if self.machine.state() == ConnectionState::Connected {
                        links.session = Some(stream);
                        self.arm_idle(&mut links);
                        self.on_connected();
                    }
                    actions
                }
                Event::Opened(Err(e)) => {
                    links.opening = None;
                    log::warn!("Failed to open event stream: {e}");
                    self.machine.failed()
                }
                Event::Inbound(Some(Ok(inbound))) => {
                    self.arm_idle(&mut links);
                    if let Inbound::Frame(frame) = inbound {
                        self.store.apply_frame(&frame);
                    }
                    Vec::new()
                }
                Event::Inbound(Some(Err(e))) => {
                    log::warn!("Event stream failed: {e}");
                    links.session = None;
                    links.idle = None;
                    self.machine.failed()
                }
                Event::Inbound(None) => {
                    log::warn!("Event stream closed by server");
                    links.session = None;
                    links.idle = None;
                    self.machine.failed()
                }
                Event::IdleElapsed => {
                    log::warn!(
                        "Event stream silent for {:?}, dropping it",
                        self.idle_timeout.unwrap_or_default()
                    );
                    links.session = None;
                    links.idle = None;
                    self.machine.failed()
                }
                Event::RetryElapsed => {
                    links.retry = None;
                    self.machine.retry_elapsed()
                }
            };
            self.apply(actions, &mut links);
        }
    }

    fn handle_command(&mut self, command: Command) -> Vec<Action> {
        match command {
            Command::Connect => self.machine.connect(),
            Command::Disconnect => self.machine.disconnect(),
            Command::Reconnect => self.machine.reconnect(),
            Command::NetworkOnline => self.machine.network_online(),
            Command::NetworkOffline => self.machine.network_offline(),
            Command::VisibilityRestored => self.machine.visibility_restored(),
            Command::Shutdown => Vec::new(),
        }
    }

    /// Push the silence deadline out from now.
    fn arm_idle(&self, links: &mut Links) {
        links.idle = self
            .idle_timeout
            .map(|timeout| Box::pin(tokio::time::sleep(timeout)));
    }

    fn on_connected(&mut self) {
        log::info!("Event stream connected");
        // Frames keep flowing during the resync; the store replays them
        // over the snapshot.
        if self.has_connected && self.resync_on_reconnect {
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.load_if_needed(true).await {
                    log::warn!("Resync after reconnect failed: {e}");
                }
            });
        }
        self.has_connected = true;
    }

    fn apply(&mut self, actions: Vec<Action>, links: &mut Links) {
        for action in actions {
            match action {
                Action::Open => links.opening = Some(self.transport.open()),
                Action::Teardown => {
                    links.opening = None;
                    links.session = None;
                    links.idle = None;
                }
                Action::CancelTimer => links.retry = None,
                Action::ScheduleRetry { delay, .. } => {
                    links.retry = Some(Box::pin(tokio::time::sleep(delay)));
                }
                Action::Exhausted { attempts } => {
                    log::error!("Live updates stopped after {attempts} failed attempts");
                }
            }
        }
        self.status.send_replace(ConnectionStatus::of(&self.machine));
    }
}
