//! Tunnel controller
//!
//! [`TunnelController`] drives one tunnel attempt at a time: pick a gateway,
//! start the obfuscation transport when the route needs it, open the
//! engine's control channel, answer the engine's interface requests and
//! bring the interface up once the engine reports a connection.
//!
//! Each attempt runs in its own task which owns every resource it created
//! (transport process, control session, interface) and is the only writer
//! of the connection state while it runs. The caller talks to it through
//! [`disconnect`](TunnelController::disconnect) and
//! [`abort`](TunnelController::abort), and observes it through
//! [`subscribe`](TunnelController::subscribe) and
//! [`state_changes`](TunnelController::state_changes).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hop_mgmt::{Command, ConnectionLevel, Event, InterfaceParam, LogLevel, Signal, StatusUpdate};
use hop_tun::{InterfaceConfigBuilder, InterfaceConfigurator, Route, TunnelInterface};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::{ChannelConfig, ChannelMode, Config};
use crate::connector::{ChannelConnector, TcpConnector};
use crate::error::{Error, Result};
use crate::event::{ConnectionState, FailureKind, TunnelEvent};
use crate::gateway::{Gateway, GatewayCatalog, GatewayScorer, SelectionCriteria, Transport};
use crate::script::{NoopConfigurator, ScriptConfigurator};
use crate::session::ControlSession;
use crate::transport::{Obfs4Params, TransportExit, TransportProcess, TransportSupervisor};

const EVENT_CAPACITY: usize = 128;

/// Upper bound for the termination command on a channel being torn down
const SIGNAL_TIMEOUT: Duration = Duration::from_millis(500);

/// State and events shared between the controller and its attempt task
struct Shared {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TunnelEvent>,
}

impl Shared {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: watch::Sender::new(ConnectionState::Idle),
            events,
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `new` if the state machine allows it
    fn transition(&self, new: ConnectionState, detail: impl Into<String>, failure: Option<FailureKind>) -> bool {
        let mut old = None;
        self.state.send_if_modified(|state| {
            if *state == new || !state.can_transition_to(new) {
                return false;
            }
            old = Some(*state);
            *state = new;
            true
        });

        let Some(old) = old else {
            let current = self.current();
            if current != new {
                log::warn!("Ignoring illegal state transition {:?} -> {:?}", current, new);
            }
            return false;
        };

        log::debug!("State {:?} -> {:?}", old, new);
        self.emit(TunnelEvent::StateChanged {
            old,
            new,
            detail: detail.into(),
            failure,
        });
        true
    }

    fn emit(&self, event: TunnelEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Caller request delivered to a running attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Disconnect,
    Abort,
}

struct Attempt {
    interrupts: mpsc::Sender<Interrupt>,
    task: JoinHandle<()>,
}

/// Connects to gateways and keeps the tunnel's lifecycle
pub struct TunnelController {
    config: Config,
    catalog: Arc<RwLock<GatewayCatalog>>,
    scorer: Arc<dyn GatewayScorer>,
    supervisor: TransportSupervisor,
    connector: Arc<dyn ChannelConnector>,
    configurator: Arc<dyn InterfaceConfigurator>,
    shared: Arc<Shared>,
    attempt: Mutex<Option<Attempt>>,
}

impl TunnelController {
    /// Create a controller from a validated configuration
    ///
    /// The catalog starts with the configured gateways. The control channel
    /// connector follows `channel.mode` and the interface is configured by
    /// the `interface` scripts, or not at all when `on_up` is unset.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let connector: Arc<dyn ChannelConnector> = match config.channel.mode {
            ChannelMode::Tcp => Arc::new(TcpConnector::default()),
            #[cfg(unix)]
            ChannelMode::Unix => {
                let socket = config
                    .channel
                    .management_socket
                    .clone()
                    .ok_or_else(|| Error::Config("management_socket is not set".into()))?;
                Arc::new(crate::connector::UnixSocketConnector::new(socket))
            }
            #[cfg(not(unix))]
            ChannelMode::Unix => {
                return Err(Error::Config(
                    "management sockets are not supported on this platform".into(),
                ))
            }
        };

        let configurator: Arc<dyn InterfaceConfigurator> = match config.interface.on_up {
            Some(ref on_up) => Arc::new(
                ScriptConfigurator::new(on_up.clone(), config.interface.on_down.clone())
                    .with_timeout(config.interface.script_timeout()),
            ),
            None => Arc::new(NoopConfigurator),
        };

        let mut catalog = GatewayCatalog::new();
        let added = catalog.extend(config.gateways.iter().cloned());
        if added < config.gateways.len() {
            log::warn!(
                "Ignored {} duplicate gateway(s) in configuration",
                config.gateways.len() - added
            );
        }

        Ok(Self {
            scorer: config.selection.scorer(),
            supervisor: TransportSupervisor::new(config.transport.clone()),
            catalog: Arc::new(RwLock::new(catalog)),
            connector,
            configurator,
            shared: Arc::new(Shared::new()),
            attempt: Mutex::new(None),
            config,
        })
    }

    /// Use a different control channel connector
    pub fn with_connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Use a different interface configurator
    pub fn with_configurator(mut self, configurator: Arc<dyn InterfaceConfigurator>) -> Self {
        self.configurator = configurator;
        self
    }

    /// Use a different gateway ranking
    pub fn with_scorer(mut self, scorer: Arc<dyn GatewayScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Selection criteria from the configuration
    pub fn default_criteria(&self) -> SelectionCriteria {
        self.config.selection.criteria()
    }

    /// Replace every known gateway, returning how many were kept
    pub async fn replace_gateways(&self, gateways: impl IntoIterator<Item = Gateway>) -> usize {
        let mut catalog = self.catalog.write().await;
        catalog.replace_all(gateways);
        catalog.len()
    }

    /// Add gateways from a JSON document, returning how many were new
    pub async fn load_gateways_json(&self, json: &str) -> Result<usize> {
        self.catalog.write().await.extend_from_json(json)
    }

    /// Snapshot of the known gateways, closest first
    pub async fn gateways(&self) -> Vec<Gateway> {
        let catalog = self.catalog.read().await;
        catalog.select_closest(catalog.len(), self.scorer.as_ref())
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.current()
    }

    /// Receive tunnel events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// Watch the connection state
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the state is Idle, Connected or Failed
    pub async fn wait_until_settled(&self) -> ConnectionState {
        let mut rx = self.shared.state.subscribe();
        let settled = match rx.wait_for(|s| s.is_settled()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }

    /// Start a tunnel attempt towards the closest gateway matching `criteria`
    ///
    /// Returns once the attempt is under way; follow it through the events
    /// or [`wait_until_settled`](Self::wait_until_settled). Only accepted
    /// while Idle. A selection failure is returned directly and leaves the
    /// state untouched.
    pub async fn connect(&self, criteria: SelectionCriteria) -> Result<()> {
        let mut attempt = self.attempt.lock().await;

        match self.state() {
            ConnectionState::Idle => {}
            ConnectionState::Failed => {
                return Err(Error::InvalidState(
                    "the last attempt failed, disconnect before connecting again".into(),
                ))
            }
            _ => return Err(Error::AlreadyRunning),
        }

        if let Some(previous) = attempt.take() {
            let _ = previous.task.await;
        }

        let (gateway, route) = {
            let catalog = self.catalog.read().await;
            catalog.select(&criteria, self.scorer.as_ref())?
        };

        log::info!(
            "Connecting to {} ({}) {}",
            gateway.label(),
            gateway.ip_address,
            if route.is_obfuscated() { "through obfs4" } else { "directly" }
        );

        let first = if route.is_obfuscated() {
            ConnectionState::AwaitingTransport
        } else {
            ConnectionState::ChannelConnecting
        };
        self.shared
            .transition(first, format!("gateway {}", gateway.label()), None);

        let (interrupts, interrupt_rx) = mpsc::channel(1);
        let runner = Runner {
            shared: self.shared.clone(),
            channel: self.config.channel.clone(),
            fallback_to_direct: self.config.selection.fallback_to_direct,
            interface_name: self.config.interface.name.clone(),
            supervisor: self.supervisor.clone(),
            connector: self.connector.clone(),
            configurator: self.configurator.clone(),
            pending: InterfaceConfigBuilder::new().session(gateway.label()),
            gateway,
            interrupts: interrupt_rx,
            transport: None,
            session: None,
            interface: None,
            pending_applied: false,
            connected: false,
        };
        let task = tokio::spawn(runner.run(route));

        *attempt = Some(Attempt { interrupts, task });
        Ok(())
    }

    /// Shut the tunnel down
    ///
    /// A connected tunnel is closed gracefully: the engine is told to stop,
    /// then the interface is released and the transport stopped. An attempt
    /// that has not connected yet is aborted. After a failure this returns
    /// the controller to Idle. Does nothing while Idle.
    pub async fn disconnect(&self) -> Result<()> {
        self.interrupt(Interrupt::Disconnect).await
    }

    /// Tear the current attempt down immediately and return to Idle
    pub async fn abort(&self) -> Result<()> {
        self.interrupt(Interrupt::Abort).await
    }

    async fn interrupt(&self, interrupt: Interrupt) -> Result<()> {
        let mut attempt = self.attempt.lock().await;

        if let Some(current) = attempt.take() {
            // fails when the attempt already ended on its own
            let _ = current.interrupts.send(interrupt).await;

            if let Err(e) = current.task.await {
                log::error!("Tunnel attempt task ended abnormally: {}", e);
            }
        }

        match self.state() {
            ConnectionState::Idle => {}
            ConnectionState::Failed => {
                self.shared
                    .transition(ConnectionState::Idle, "cleared after failure", None);
            }
            other => {
                log::warn!("Attempt ended in {:?}, forcing Idle", other);
                self.shared
                    .transition(ConnectionState::Idle, "attempt ended unexpectedly", None);
            }
        }
        Ok(())
    }
}

/// How an attempt ended
enum Outcome {
    Disconnected,
    Aborted,
    Failed(Error),
}

impl From<Error> for Outcome {
    fn from(e: Error) -> Self {
        Outcome::Failed(e)
    }
}

impl From<hop_tun::Error> for Outcome {
    fn from(e: hop_tun::Error) -> Self {
        Outcome::Failed(e.into())
    }
}

type Step<T> = std::result::Result<T, Outcome>;

/// One tunnel attempt, owned by its task
struct Runner {
    shared: Arc<Shared>,
    channel: ChannelConfig,
    fallback_to_direct: bool,
    interface_name: Option<String>,
    supervisor: TransportSupervisor,
    connector: Arc<dyn ChannelConnector>,
    configurator: Arc<dyn InterfaceConfigurator>,
    gateway: Gateway,
    interrupts: mpsc::Receiver<Interrupt>,

    transport: Option<TransportProcess>,
    session: Option<ControlSession>,
    interface: Option<TunnelInterface>,
    /// Interface parameters pushed by the engine so far
    pending: InterfaceConfigBuilder,
    /// `pending` is what the current interface was set up with
    pending_applied: bool,
    connected: bool,
}

impl Runner {
    async fn run(mut self, route: Transport) {
        let outcome = match self.establish(route).await {
            Ok(()) => self.supervise().await,
            Err(outcome) => outcome,
        };

        self.teardown().await;

        match outcome {
            Outcome::Disconnected => {
                log::info!("Disconnected from {}", self.gateway.label());
                self.shared
                    .transition(ConnectionState::Idle, "disconnected", None);
            }
            Outcome::Aborted => {
                log::info!("Attempt towards {} aborted", self.gateway.label());
                self.shared.transition(ConnectionState::Idle, "aborted", None);
            }
            Outcome::Failed(e) => {
                log::error!("Tunnel to {} failed: {}", self.gateway.label(), e);
                self.shared
                    .transition(ConnectionState::Failed, e.to_string(), Some(e.failure_kind()));
            }
        }
    }

    /// Everything up to a running control session
    async fn establish(&mut self, route: Transport) -> Step<()> {
        let target = self.open_route(route).await?;

        let session = self.open_channel(target).await?;
        let session = self.session.insert(session);

        self.shared.transition(
            ConnectionState::Negotiating,
            format!("control channel open to {}", target),
            None,
        );

        session.send(&Command::state_on()).await?;
        if self.channel.bytecount_interval > 0 {
            session
                .send(&Command::bytecount(self.channel.bytecount_interval))
                .await?;
        }
        session.send(&Command::hold_release()).await?;
        Ok(())
    }

    /// Address the control channel is opened to
    async fn open_route(&mut self, route: Transport) -> Step<SocketAddr> {
        let (remote, params) = match route {
            Transport::Direct { addr } => return Ok(addr),
            Transport::Obfs4 { remote, params } => (remote, params),
        };

        let started = self.start_transport(remote, &params).await;

        match started {
            Ok(port) => {
                let local = SocketAddr::from(([127, 0, 0, 1], port));
                self.shared.transition(
                    ConnectionState::ChannelConnecting,
                    format!("transport listening on {}", local),
                    None,
                );
                Ok(local)
            }
            Err(Outcome::Failed(e)) if self.fallback_to_direct => match self.gateway.direct_addr() {
                Some(addr) => {
                    log::warn!("Transport failed ({}), connecting to {} directly", e, addr);
                    if let Some(transport) = self.transport.take() {
                        transport.stop().await;
                    }
                    self.shared.transition(
                        ConnectionState::ChannelConnecting,
                        format!("transport failed, falling back to {}", addr),
                        None,
                    );
                    Ok(addr)
                }
                None => Err(e.into()),
            },
            Err(outcome) => Err(outcome),
        }
    }

    async fn start_transport(&mut self, remote: SocketAddr, params: &Obfs4Params) -> Step<u16> {
        let process = self
            .supervisor
            .start(&remote.ip().to_string(), remote.port(), params)
            .await?;
        let process = self.transport.insert(process);
        let timeout = self.supervisor.config().discovery_timeout();

        tokio::select! {
            port = process.await_local_port(timeout) => Ok(port?),
            _ = self.interrupts.recv() => Err(Outcome::Aborted),
        }
    }

    async fn open_channel(&mut self, target: SocketAddr) -> Step<ControlSession> {
        let attempts = self.channel.connect_attempts;
        let mut reason = String::new();

        for attempt in 1..=attempts {
            let connected = tokio::select! {
                result = self.connector.connect(target) => result,
                _ = self.interrupts.recv() => return Err(Outcome::Aborted),
            };

            match connected {
                Ok(stream) => {
                    log::info!("Control channel connected to {}", target);
                    return Ok(ControlSession::open(stream));
                }
                Err(e) => {
                    log::debug!(
                        "Control channel attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        target,
                        e
                    );
                    reason = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.channel.retry_delay()) => {}
                    _ = self.interrupts.recv() => return Err(Outcome::Aborted),
                }
            }
        }

        Err(Error::ChannelConnectFailed {
            target: target.to_string(),
            attempts,
            reason,
        }
        .into())
    }

    /// Process engine events until the attempt ends
    async fn supervise(&mut self) -> Outcome {
        let timeout = self.channel.negotiation_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let Some(session) = self.session.as_mut() else {
                return Error::ChannelClosed.into();
            };

            tokio::select! {
                interrupt = self.interrupts.recv() => {
                    return match interrupt {
                        Some(Interrupt::Disconnect) if self.connected => self.close_gracefully().await,
                        _ => Outcome::Aborted,
                    };
                }
                _ = tokio::time::sleep_until(deadline), if !self.connected => {
                    return Error::NegotiationTimeout(timeout).into();
                }
                exit = transport_exited(self.transport.as_ref()) => {
                    return match exit {
                        TransportExit::Crashed(reason) => Error::TransportCrashed(reason).into(),
                        TransportExit::Stopped => Error::TransportStopped.into(),
                    };
                }
                event = session.next_event() => {
                    let Some(event) = event else {
                        return Error::ChannelClosed.into();
                    };
                    if let Err(outcome) = self.handle_event(event).await {
                        return outcome;
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Step<()> {
        match event {
            Event::Status(status) => self.on_status(status).await,
            Event::ByteCount {
                bytes_in,
                bytes_out,
            } => {
                self.shared.emit(TunnelEvent::Traffic {
                    bytes_in,
                    bytes_out,
                });
                Ok(())
            }
            Event::Log { level, message } => {
                self.shared.emit(TunnelEvent::EngineLog {
                    level,
                    message: message.clone(),
                });
                if level == LogLevel::Fatal {
                    return Err(Error::EngineFailure(message).into());
                }
                Ok(())
            }
            Event::NeedsUserInput { kind, prompt } => {
                self.shared.emit(TunnelEvent::UserInputRequired {
                    kind: kind.clone(),
                    prompt: prompt.clone(),
                });
                if self.connected {
                    log::warn!("Engine asks for {} while connected: {}", kind, prompt);
                    return Ok(());
                }
                Err(Error::UserInputRequired { kind, prompt }.into())
            }
            Event::InterfaceParam(param) => self.on_interface_param(param).await,
            Event::Hold { message } => {
                log::debug!("Engine on hold: {}", message);
                self.send(&Command::hold_release()).await
            }
            Event::Reply { ok, message } => {
                if ok {
                    log::debug!("<- SUCCESS: {}", message);
                } else {
                    log::warn!("Engine rejected a command: {}", message);
                }
                Ok(())
            }
            Event::Raw(line) => {
                log::trace!("<- {}", line);
                Ok(())
            }
        }
    }

    async fn on_status(&mut self, status: StatusUpdate) -> Step<()> {
        match status.level {
            ConnectionLevel::Connected => {
                // parameters pushed without OPENTUN, first time or after a reconnect
                if self.interface.is_none() || (!self.pending_applied && self.pending.has_address()) {
                    self.bring_up_interface().await?;
                }
                if self.connected {
                    return Ok(());
                }

                self.connected = true;
                let detail = match status.remote_ip {
                    Some(remote) => format!("{} via {}", self.gateway.label(), remote),
                    None => self.gateway.label().to_string(),
                };
                self.shared
                    .transition(ConnectionState::Connected, detail, None);
                Ok(())
            }
            level if level.is_failure() => Err(Error::EngineFailure(format!(
                "engine reported {} {}",
                status.state, status.detail
            ))
            .into()),
            level => {
                log::info!("Engine state: {} ({}) {}", status.state, level, status.detail);
                Ok(())
            }
        }
    }

    async fn on_interface_param(&mut self, param: InterfaceParam) -> Step<()> {
        let kind = param.kind();

        if self.pending_applied {
            // the engine is pushing a new configuration, start over
            self.pending = InterfaceConfigBuilder::new().session(self.gateway.label());
            self.pending_applied = false;
        }

        match param {
            InterfaceParam::Address { ip, netmask, mtu } => {
                let mut pending = std::mem::take(&mut self.pending).ipv4_netmask(ip, netmask);
                if let Some(mtu) = mtu {
                    pending = pending.mtu(mtu);
                }
                self.pending = pending;
            }
            InterfaceParam::Route { network, netmask } => {
                let route = Route::from_netmask(network, netmask)?;
                self.pending = std::mem::take(&mut self.pending).route(route);
            }
            InterfaceParam::DnsServer(server) => {
                self.pending = std::mem::take(&mut self.pending).dns(server);
            }
            InterfaceParam::SearchDomain(domain) => {
                self.pending = std::mem::take(&mut self.pending).search_domain(domain);
            }
            InterfaceParam::OpenTun => self.bring_up_interface().await?,
        }

        self.send(&Command::needok(kind, true)).await
    }

    async fn bring_up_interface(&mut self) -> Step<()> {
        if !self.pending.has_address() {
            return Err(Error::InterfaceConfigFailed("engine did not push an interface address".into()).into());
        }

        let mut builder = self.pending.clone();
        if let Some(ref name) = self.interface_name {
            builder = builder.name(name.clone());
        }
        let config = builder
            .build()
            .map_err(|e| Error::InterfaceConfigFailed(e.to_string()))?;

        if let Some(previous) = self.interface.take() {
            log::info!("Replacing interface {} with a new configuration", previous.name);
            self.release_interface(previous).await;
        }

        let established = tokio::select! {
            result = self.configurator.establish(&config) => result,
            _ = self.interrupts.recv() => return Err(Outcome::Aborted),
        };
        let interface = established.map_err(|e| Error::InterfaceConfigFailed(e.to_string()))?;

        log::info!("Interface {} configured with {}", interface.name, interface.address);
        self.shared.emit(TunnelEvent::InterfaceUp {
            name: interface.name.clone(),
            address: interface.address,
        });
        self.interface = Some(interface);
        self.pending_applied = true;
        Ok(())
    }

    async fn release_interface(&self, interface: TunnelInterface) {
        match self.configurator.release(&interface).await {
            Ok(()) => log::info!("Interface {} released", interface.name),
            Err(e) => log::warn!("Failed to release interface {}: {}", interface.name, e),
        }
    }

    async fn send(&mut self, command: &Command) -> Step<()> {
        match self.session.as_mut() {
            Some(session) => Ok(session.send(command).await?),
            None => Err(Error::ChannelClosed.into()),
        }
    }

    async fn close_gracefully(&mut self) -> Outcome {
        self.shared
            .transition(ConnectionState::Disconnecting, "disconnect requested", None);

        if let Some(mut session) = self.session.take() {
            match session.send(&Command::signal(Signal::Sigint)).await {
                Ok(()) => {
                    if !session.wait_closed(self.channel.close_grace()).await {
                        log::debug!(
                            "Engine kept the control channel open for {:?}, closing it",
                            self.channel.close_grace()
                        );
                    }
                }
                Err(e) => log::debug!("Could not ask the engine to stop: {}", e),
            }
            session.close().await;
        }

        Outcome::Disconnected
    }

    /// Release everything the attempt holds
    ///
    /// Interface first, then the control channel, then the transport the
    /// channel runs through.
    async fn teardown(&mut self) {
        if let Some(interface) = self.interface.take() {
            self.release_interface(interface).await;
        }

        if let Some(mut session) = self.session.take() {
            let signal = Command::signal(Signal::Sigint);
            if tokio::time::timeout(SIGNAL_TIMEOUT, session.send(&signal)).await.is_err() {
                log::debug!("Timed out asking the engine to stop");
            }
            session.close().await;
        }

        if let Some(transport) = self.transport.take() {
            transport.stop().await;
        }
    }
}

async fn transport_exited(transport: Option<&TransportProcess>) -> TransportExit {
    match transport {
        Some(transport) => transport.exited().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::BoxedStream;
    use crate::gateway::TransportSpec;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Hands out one end of an in-memory pipe per connection
    struct PipeConnector {
        engines: StdMutex<Vec<DuplexStream>>,
        dialed: StdMutex<Vec<SocketAddr>>,
        refuse: bool,
    }

    impl PipeConnector {
        fn new() -> Self {
            Self {
                engines: StdMutex::new(Vec::new()),
                dialed: StdMutex::new(Vec::new()),
                refuse: false,
            }
        }

        fn refusing() -> Self {
            Self {
                refuse: true,
                ..Self::new()
            }
        }

        fn take_engine(&self) -> Option<DuplexStream> {
            self.engines.lock().unwrap().pop()
        }
    }

    #[async_trait]
    impl ChannelConnector for PipeConnector {
        async fn connect(&self, target: SocketAddr) -> io::Result<BoxedStream> {
            self.dialed.lock().unwrap().push(target);
            if self.refuse {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (ours, theirs) = tokio::io::duplex(4096);
            self.engines.lock().unwrap().push(theirs);
            Ok(Box::new(ours))
        }
    }

    fn direct_gateway() -> Gateway {
        Gateway {
            host: "gw1.example.org".into(),
            ip_address: "192.0.2.10".parse().unwrap(),
            name: "gw1".into(),
            location: None,
            timezone: Some(0),
            transports: vec![TransportSpec::Direct { ports: vec![1194] }],
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.channel.connect_attempts = 2;
        config.channel.retry_delay_ms = 10;
        config.channel.close_grace_ms = 200;
        config.gateways = vec![direct_gateway()];
        config
    }

    async fn engine(connector: &PipeConnector) -> DuplexStream {
        for _ in 0..100 {
            if let Some(engine) = connector.take_engine() {
                return engine;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("controller never dialed");
    }

    #[test]
    fn test_transition_rules() {
        let shared = Shared::new();
        let mut events = shared.events.subscribe();

        assert!(!shared.transition(ConnectionState::Connected, "", None));
        assert_eq!(shared.current(), ConnectionState::Idle);

        assert!(shared.transition(ConnectionState::ChannelConnecting, "dial", None));
        assert!(!shared.transition(ConnectionState::ChannelConnecting, "again", None));

        match events.try_recv().unwrap() {
            TunnelEvent::StateChanged { old, new, detail, .. } => {
                assert_eq!(old, ConnectionState::Idle);
                assert_eq!(new, ConnectionState::ChannelConnecting);
                assert_eq!(detail, "dial");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_rejected_while_active() {
        let connector = Arc::new(PipeConnector::new());
        let controller = TunnelController::new(config())
            .unwrap()
            .with_connector(connector.clone());

        controller.connect(SelectionCriteria::default()).await.unwrap();
        assert!(controller.state().is_active());

        let second = controller.connect(SelectionCriteria::default()).await;
        assert!(matches!(second, Err(Error::AlreadyRunning)));

        controller.abort().await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_empty_catalog_keeps_idle() {
        let mut config = config();
        config.gateways.clear();
        let controller = TunnelController::new(config).unwrap();

        let result = controller.connect(SelectionCriteria::default()).await;
        assert!(matches!(result, Err(Error::NoGatewayAvailable(_))));
        assert_eq!(controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_channel_connect_exhaustion() {
        let connector = Arc::new(PipeConnector::refusing());
        let controller = TunnelController::new(config())
            .unwrap()
            .with_connector(connector.clone());
        let mut events = controller.subscribe();

        controller.connect(SelectionCriteria::default()).await.unwrap();
        assert_eq!(controller.wait_until_settled().await, ConnectionState::Failed);
        assert_eq!(connector.dialed.lock().unwrap().len(), 2);

        let mut failure = None;
        while let Ok(event) = events.try_recv() {
            if let TunnelEvent::StateChanged { failure: Some(kind), .. } = event {
                failure = Some(kind);
            }
        }
        assert_eq!(failure, Some(FailureKind::ChannelConnect));

        // Failed needs an explicit disconnect
        assert!(matches!(
            controller.connect(SelectionCriteria::default()).await,
            Err(Error::InvalidState(_))
        ));
        controller.disconnect().await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_session_handshake_and_acks() {
        let connector = Arc::new(PipeConnector::new());
        let controller = TunnelController::new(config())
            .unwrap()
            .with_connector(connector.clone());

        controller.connect(SelectionCriteria::default()).await.unwrap();
        let engine = engine(&connector).await;
        let (read, mut write) = tokio::io::split(engine);
        let mut lines = BufReader::new(read).lines();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "state on");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "bytecount 5");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "hold release");
        assert_eq!(controller.state(), ConnectionState::Negotiating);

        write
            .write_all(b">NEED-OK:Need 'IFCONFIG' confirmation MSG:10.8.0.2 255.255.255.0 1500\n")
            .await
            .unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "needok IFCONFIG ok");

        write.write_all(b">HOLD:Waiting for hold release\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "hold release");

        write
            .write_all(b">STATE:1700000000,CONNECTED,SUCCESS,10.8.0.2,192.0.2.10\n")
            .await
            .unwrap();
        assert_eq!(controller.wait_until_settled().await, ConnectionState::Connected);

        let disconnect = async {
            controller.disconnect().await.unwrap();
        };
        let engine_side = async move {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "signal SIGINT");
            // engine exits and closes the channel
            drop(lines);
            drop(write);
        };
        tokio::join!(disconnect, engine_side);
        assert_eq!(controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_negotiation_timeout() {
        let mut config = config();
        config.channel.negotiation_timeout_secs = 1;
        let connector = Arc::new(PipeConnector::new());
        let controller = TunnelController::new(config)
            .unwrap()
            .with_connector(connector.clone());

        controller.connect(SelectionCriteria::default()).await.unwrap();
        let _engine = engine(&connector).await;

        let settled = tokio::time::timeout(Duration::from_secs(3), controller.wait_until_settled())
            .await
            .unwrap();
        assert_eq!(settled, ConnectionState::Failed);
    }
}
