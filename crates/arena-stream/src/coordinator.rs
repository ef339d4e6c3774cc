//! Session coordinator.
//!
//! A single dispatch task owns every piece of session state: the current run,
//! the agent → pacer map, the connection state machine and the reconnect timer.
//! Callers talk to it through [`StreamCoordinator`], whose methods enqueue
//! commands into the same loop that routes transport events, so a pause or
//! stop always lands between two event deliveries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument as _, debug, error, info, info_span, trace, warn};

use crate::agent::{AgentId, RunId};
use crate::backoff::Backoff;
use crate::config::CoordinatorConfig;
use crate::errors::{CoordinatorError, SelectionError, TransportError};
use crate::event::{ConnectionState, LinkStatus, TransportEvent};
use crate::pacer::{Emission, Pacer, PacerOutput};
use crate::selection::{RunPhase, SelectionBackend, SelectionGateway};
use crate::sink::RenderSink;
use crate::transport::{OpenRequest, TransportAdapter};

/// Point-in-time view of the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: uuid::Uuid,
    pub run_id: Option<RunId>,
    pub phase: Option<RunPhase>,
    pub state: ConnectionState,
    /// Agents with a live pacer, sorted.
    pub agents: Vec<AgentId>,
}

enum Command {
    Start {
        run_id: RunId,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Pause(Option<AgentId>),
    Resume(Option<AgentId>),
    ClearAll,
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// What a link task reports about its connection.
enum LinkSignal {
    Event(TransportEvent),
    Malformed(TransportError),
    Failed(TransportError),
}

struct LinkMessage {
    connection_id: u64,
    signal: LinkSignal,
}

/// Builder for a [`StreamCoordinator`].
#[derive(Default)]
pub struct CoordinatorBuilder {
    adapter: Option<Arc<dyn TransportAdapter>>,
    sink: Option<Arc<dyn RenderSink>>,
    selection: Option<Arc<dyn SelectionBackend>>,
    config: CoordinatorConfig,
}

impl CoordinatorBuilder {
    /// Sets the transport variant used for every run.
    pub fn transport(mut self, adapter: Arc<dyn TransportAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Sets the rendering sink receiving paced output.
    pub fn sink(mut self, sink: Arc<dyn RenderSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Overrides the selection backend (defaults to the transport's).
    pub fn selection_backend(mut self, backend: Arc<dyn SelectionBackend>) -> Self {
        self.selection = Some(backend);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the builder and spawns the dispatch task on the current
    /// tokio runtime.
    pub fn build(self) -> Result<StreamCoordinator, CoordinatorError> {
        let adapter = self
            .adapter
            .ok_or_else(|| CoordinatorError::Config("a transport adapter is required".into()))?;
        let sink = self
            .sink
            .ok_or_else(|| CoordinatorError::Config("a render sink is required".into()))?;
        self.config.pacer.validate().map_err(CoordinatorError::Config)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CoordinatorError::Config("coordinator must be built inside a tokio runtime".into())
        })?;

        let selection = self
            .selection
            .or_else(|| adapter.selection_backend())
            .map(SelectionGateway::new);
        let session_id = uuid::Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (pacer_tx, pacer_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            session_id,
            adapter,
            sink,
            config: self.config,
            state: ConnectionState::Disconnected,
            run: None,
            pacers: HashMap::new(),
            next_epoch: 0,
            next_connection_id: 0,
            link_tx,
            pacer_tx,
        };
        let span = info_span!("coordinator", session_id = %session_id);
        runtime.spawn(dispatch_loop(dispatcher, command_rx, link_rx, pacer_rx).instrument(span));

        Ok(StreamCoordinator {
            session_id,
            commands: command_tx,
            selection,
        })
    }
}

/// Control surface for one session. Cheap to clone; the dispatch task stops
/// (with stop semantics) once every handle is dropped.
#[derive(Clone)]
pub struct StreamCoordinator {
    session_id: uuid::Uuid,
    commands: mpsc::UnboundedSender<Command>,
    selection: Option<SelectionGateway>,
}

impl StreamCoordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Tears down any current run and starts streaming `run_id`.
    pub async fn start(&self, run_id: impl Into<RunId>) -> Result<(), CoordinatorError> {
        let run_id = run_id.into();
        if run_id.is_blank() {
            return Err(CoordinatorError::Validation(
                "run id must not be empty".into(),
            ));
        }
        let (reply, done) = oneshot::channel();
        self.send(Command::Start { run_id, reply })?;
        done.await.map_err(|_| CoordinatorError::Closed)
    }

    /// Closes the transport, destroys every pacer and cancels any pending
    /// reconnect. Returns once all of that has happened.
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Stop { reply })?;
        done.await.map_err(|_| CoordinatorError::Closed)
    }

    /// Pauses one agent, or every live agent when `agent_id` is `None`.
    pub fn pause(&self, agent_id: Option<AgentId>) -> Result<(), CoordinatorError> {
        self.send(Command::Pause(agent_id))
    }

    /// Resumes one agent, or every live agent when `agent_id` is `None`.
    pub fn resume(&self, agent_id: Option<AgentId>) -> Result<(), CoordinatorError> {
        self.send(Command::Resume(agent_id))
    }

    /// Destroys every pacer without touching the run's connection.
    pub fn clear_all(&self) -> Result<(), CoordinatorError> {
        self.send(Command::ClearAll)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, CoordinatorError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        done.await.map_err(|_| CoordinatorError::Closed)
    }

    /// Commits `agent_id` as the winner of `run_id`.
    ///
    /// Accepted only for the active or just-completed run. Exactly one
    /// outbound call is made; failures are returned, never retried.
    pub async fn select(
        &self,
        run_id: impl Into<RunId>,
        agent_id: impl Into<AgentId>,
    ) -> Result<(), SelectionError> {
        let run_id = run_id.into();
        let agent_id = agent_id.into();
        let Some(gateway) = self.selection.as_ref() else {
            return Err(SelectionError::Transport(
                "no selection backend configured".into(),
            ));
        };
        let snapshot = self
            .snapshot()
            .await
            .map_err(|e| SelectionError::Transport(e.to_string()))?;
        let current = snapshot.run_id.as_ref().zip(snapshot.phase);
        gateway.select(current, &run_id, &agent_id).await
    }

    fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.commands
            .send(command)
            .map_err(|_| CoordinatorError::Closed)
    }
}

struct ActiveRun {
    run_id: RunId,
    phase: RunPhase,
    connection_id: u64,
    link: Option<JoinHandle<()>>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    /// Newest backend timestamp seen; sent as the resume cursor on reconnect.
    resume_after: Option<DateTime<Utc>>,
    completed_agents: HashSet<AgentId>,
}

impl ActiveRun {
    fn cancel_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.abort();
        }
        self.reconnect_at = None;
    }
}

struct Dispatcher {
    session_id: uuid::Uuid,
    adapter: Arc<dyn TransportAdapter>,
    sink: Arc<dyn RenderSink>,
    config: CoordinatorConfig,
    state: ConnectionState,
    run: Option<ActiveRun>,
    pacers: HashMap<AgentId, Pacer>,
    next_epoch: u64,
    next_connection_id: u64,
    link_tx: mpsc::UnboundedSender<LinkMessage>,
    pacer_tx: mpsc::UnboundedSender<PacerOutput>,
}

async fn dispatch_loop(
    mut dispatcher: Dispatcher,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut links: mpsc::UnboundedReceiver<LinkMessage>,
    mut pacers: mpsc::UnboundedReceiver<PacerOutput>,
) {
    debug!(transport = dispatcher.adapter.name(), "dispatch loop started");
    loop {
        let reconnect_at = dispatcher.reconnect_at();
        tokio::select! {
            biased;
            command = commands.recv() => {
                let Some(command) = command else {
                    dispatcher.stop_run();
                    dispatcher.set_state(ConnectionState::Disconnected);
                    debug!("all coordinator handles dropped; dispatch loop exiting");
                    return;
                };
                dispatcher.handle_command(command);
            }
            Some(message) = links.recv() => dispatcher.handle_link(message),
            Some(output) = pacers.recv() => dispatcher.handle_pacer_output(output),
            () = sleep_until(reconnect_at), if reconnect_at.is_some() => dispatcher.reconnect(),
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    fn reconnect_at(&self) -> Option<Instant> {
        self.run.as_ref().and_then(|run| run.reconnect_at)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { run_id, reply } => {
                self.stop_run();
                self.set_state(ConnectionState::Disconnected);
                self.start_run(run_id);
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.stop_run();
                self.set_state(ConnectionState::Disconnected);
                let _ = reply.send(());
            }
            Command::Pause(agent_id) => self.for_each_pacer(agent_id.as_ref(), Pacer::pause),
            Command::Resume(agent_id) => self.for_each_pacer(agent_id.as_ref(), Pacer::resume),
            Command::ClearAll => {
                let cleared = self.destroy_pacers();
                debug!(cleared, "cleared all agent output");
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn start_run(&mut self, run_id: RunId) {
        info!(run_id = %run_id, transport = self.adapter.name(), "starting run");
        let connection_id = self.bump_connection_id();
        let mut run = ActiveRun {
            run_id: run_id.clone(),
            phase: RunPhase::Active,
            connection_id,
            link: None,
            backoff: Backoff::new(self.adapter.reconnect_policy()),
            reconnect_at: None,
            resume_after: None,
            completed_agents: HashSet::new(),
        };
        self.set_state(ConnectionState::Connecting);
        run.link = Some(self.spawn_link(OpenRequest::new(run_id), connection_id));
        self.run = Some(run);
    }

    /// Stop semantics: link, reconnect timer and pacers are all cancelled
    /// before this returns.
    fn stop_run(&mut self) {
        if let Some(mut run) = self.run.take() {
            run.cancel_link();
            info!(run_id = %run.run_id, "run torn down");
        }
        self.destroy_pacers();
    }

    fn destroy_pacers(&mut self) -> usize {
        let count = self.pacers.len();
        for (_, pacer) in self.pacers.drain() {
            pacer.destroy();
        }
        count
    }

    fn for_each_pacer(&self, agent_id: Option<&AgentId>, apply: fn(&Pacer)) {
        match agent_id {
            Some(agent_id) => match self.pacers.get(agent_id) {
                Some(pacer) => apply(pacer),
                None => debug!(agent_id = %agent_id, "no live pacer for agent"),
            },
            None => self.pacers.values().for_each(apply),
        }
    }

    fn bump_connection_id(&mut self) -> u64 {
        self.next_connection_id += 1;
        self.next_connection_id
    }

    fn spawn_link(&self, request: OpenRequest, connection_id: u64) -> JoinHandle<()> {
        let adapter = self.adapter.clone();
        let tx = self.link_tx.clone();
        tokio::spawn(
            link_task(adapter, request, connection_id, tx).in_current_span(),
        )
    }

    fn reconnect(&mut self) {
        let connection_id = self.bump_connection_id();
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.reconnect_at = None;
        run.connection_id = connection_id;
        let request = OpenRequest {
            run_id: run.run_id.clone(),
            resume_after: run.resume_after,
            attempt: run.backoff.attempt(),
        };
        info!(run_id = %run.run_id, attempt = request.attempt, "reconnecting");
        let link = self.spawn_link(request, connection_id);
        if let Some(run) = self.run.as_mut() {
            run.link = Some(link);
        }
    }

    fn handle_link(&mut self, message: LinkMessage) {
        let current = self.run.as_ref().is_some_and(|run| {
            run.connection_id == message.connection_id && run.phase == RunPhase::Active
        });
        if !current {
            trace!(connection_id = message.connection_id, "dropping signal from stale connection");
            return;
        }
        match message.signal {
            LinkSignal::Event(event) => self.route(event),
            LinkSignal::Malformed(err) => {
                warn!(error = %err, "dropping malformed transport event");
            }
            LinkSignal::Failed(err) => self.handle_failure(err),
        }
    }

    fn route(&mut self, event: TransportEvent) {
        trace!(kind = %event.kind(), "routing transport event");
        if let (Some(ts), Some(run)) = (event.timestamp(), self.run.as_mut()) {
            if run.resume_after.is_none_or(|seen| ts > seen) {
                run.resume_after = Some(ts);
            }
        }
        match event {
            TransportEvent::Output {
                agent_id, content, ..
            } => self.route_output(agent_id, content),
            TransportEvent::Error { agent_id, message } => {
                debug!(agent_id = %agent_id, "agent error forwarded unpaced");
                self.sink.on_error(&agent_id, &message);
            }
            TransportEvent::Status(LinkStatus::Connected) => {
                if let Some(run) = self.run.as_mut() {
                    run.backoff.reset();
                }
                self.set_state(ConnectionState::Connected);
            }
            TransportEvent::Status(LinkStatus::Degraded { reason }) => {
                warn!(reason = %reason, "transport degraded");
                self.set_state(ConnectionState::Connecting);
            }
            TransportEvent::Heartbeat => {
                if self.state == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Connected);
                }
            }
            TransportEvent::AgentComplete { agent_id } => self.complete_agent(agent_id),
            TransportEvent::RunComplete => self.complete_run(),
        }
    }

    fn route_output(&mut self, agent_id: AgentId, content: String) {
        let completed = self
            .run
            .as_ref()
            .is_some_and(|run| run.completed_agents.contains(&agent_id));
        if completed {
            debug!(agent_id = %agent_id, "output after agent completion dropped");
            return;
        }
        if !self.pacers.contains_key(&agent_id) {
            self.next_epoch += 1;
            debug!(agent_id = %agent_id, epoch = self.next_epoch, "creating pacer");
            let pacer = Pacer::spawn(
                agent_id.clone(),
                self.next_epoch,
                &self.config.pacer,
                self.pacer_tx.clone(),
            );
            self.pacers.insert(agent_id.clone(), pacer);
        }
        if let Some(pacer) = self.pacers.get(&agent_id) {
            pacer.add(content);
        }
    }

    fn complete_agent(&mut self, agent_id: AgentId) {
        if let Some(run) = self.run.as_mut() {
            run.completed_agents.insert(agent_id.clone());
        }
        match self.pacers.get(&agent_id) {
            Some(pacer) => pacer.mark_complete(),
            None => self.sink.on_complete(&agent_id),
        }
    }

    fn complete_run(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        info!(run_id = %run.run_id, agents = self.pacers.len(), "run complete");
        run.phase = RunPhase::Completed;
        run.cancel_link();
        for pacer in self.pacers.values() {
            pacer.mark_complete();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_failure(&mut self, err: TransportError) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.link = None;
        if !err.is_retryable() {
            error!(run_id = %run.run_id, error = %err, "transport open failed");
            self.set_state(ConnectionState::Error);
            return;
        }
        match run.backoff.next_delay() {
            Some(delay) => {
                warn!(
                    run_id = %run.run_id,
                    error = %err,
                    attempt = run.backoff.attempt(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "transport failed; scheduling reconnect"
                );
                run.reconnect_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Connecting);
            }
            None => {
                error!(
                    run_id = %run.run_id,
                    error = %err,
                    max_attempts = run.backoff.policy().max_attempts,
                    "reconnect attempts exhausted"
                );
                self.set_state(ConnectionState::Error);
            }
        }
    }

    fn handle_pacer_output(&mut self, output: PacerOutput) {
        let live = self
            .pacers
            .get(&output.agent_id)
            .is_some_and(|pacer| pacer.epoch() == output.epoch);
        if !live {
            trace!(agent_id = %output.agent_id, epoch = output.epoch, "dropping output of destroyed pacer");
            return;
        }
        match output.emission {
            Emission::Chunk(text) => self.sink.on_chunk(&output.agent_id, &text),
            Emission::Final(text) => {
                if !text.is_empty() {
                    self.sink.on_chunk(&output.agent_id, &text);
                }
                self.pacers.remove(&output.agent_id);
                self.sink.on_complete(&output.agent_id);
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, to = %state, "connection state changed");
        self.state = state;
        self.sink.on_connection_state_change(state);
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut agents: Vec<AgentId> = self.pacers.keys().cloned().collect();
        agents.sort();
        SessionSnapshot {
            session_id: self.session_id,
            run_id: self.run.as_ref().map(|run| run.run_id.clone()),
            phase: self.run.as_ref().map(|run| run.phase),
            state: self.state,
            agents,
        }
    }
}

/// Owns one physical connection attempt and forwards what it yields.
async fn link_task(
    adapter: Arc<dyn TransportAdapter>,
    request: OpenRequest,
    connection_id: u64,
    tx: mpsc::UnboundedSender<LinkMessage>,
) {
    let send = |signal: LinkSignal| {
        tx.send(LinkMessage {
            connection_id,
            signal,
        })
        .is_ok()
    };

    let mut connection = match adapter.open(request).await {
        Ok(connection) => connection,
        Err(err) => {
            send(LinkSignal::Failed(err));
            return;
        }
    };
    loop {
        let signal = match connection.next_event().await {
            Some(Ok(event)) => {
                let run_complete = event == TransportEvent::RunComplete;
                if !send(LinkSignal::Event(event)) || run_complete {
                    connection.close();
                    return;
                }
                continue;
            }
            Some(Err(err)) if !err.is_fatal() => LinkSignal::Malformed(err),
            Some(Err(err)) => {
                send(LinkSignal::Failed(err));
                return;
            }
            None => {
                send(LinkSignal::Failed(TransportError::Ended));
                return;
            }
        };
        if !send(signal) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectPolicy;
    use crate::config::PacerConfig;
    use crate::selection::tests::RecordingBackend;
    use crate::sink::{ChannelSink, SinkEvent};
    use crate::transport::TransportConnection;
    use futures::StreamExt as _;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    type Item = Result<TransportEvent, TransportError>;

    enum Script {
        Fail(TransportError),
        /// Yields the items, then the stream ends.
        Finite(Vec<Item>),
        /// Yields the items, then stays open forever.
        Open(Vec<Item>),
        /// Yields whatever the test pushes into the channel.
        Live(mpsc::UnboundedReceiver<Item>),
    }

    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        opens: Mutex<Vec<(OpenRequest, Instant)>>,
        policy: ReconnectPolicy,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                opens: Mutex::new(Vec::new()),
                policy: ReconnectPolicy::new(
                    Duration::from_millis(100),
                    Duration::from_millis(300),
                    3,
                ),
            })
        }

        fn opens(&self) -> Vec<(OpenRequest, Instant)> {
            self.opens.lock().map(|o| o.clone()).unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl TransportAdapter for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn reconnect_policy(&self) -> ReconnectPolicy {
            self.policy
        }

        async fn open(&self, request: OpenRequest) -> Result<TransportConnection, TransportError> {
            if let Ok(mut opens) = self.opens.lock() {
                opens.push((request.clone(), Instant::now()));
            }
            let script = self.scripts.lock().ok().and_then(|mut s| s.pop_front());
            let stream: crate::transport::EventStream = match script {
                None => return Err(TransportError::connect("no more scripts")),
                Some(Script::Fail(err)) => return Err(err),
                Some(Script::Finite(items)) => Box::pin(stream::iter(items)),
                Some(Script::Open(items)) => {
                    Box::pin(stream::iter(items).chain(stream::pending()))
                }
                Some(Script::Live(rx)) => Box::pin(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })),
            };
            Ok(TransportConnection::new(request.run_id, stream))
        }
    }

    fn output(agent: &str, text: &str) -> Item {
        Ok(TransportEvent::Output {
            agent_id: AgentId::new(agent),
            content: text.to_string(),
            timestamp: None,
        })
    }

    fn connected() -> Item {
        Ok(TransportEvent::Status(LinkStatus::Connected))
    }

    fn coordinator(
        transport: Arc<ScriptedTransport>,
    ) -> (StreamCoordinator, mpsc::UnboundedReceiver<SinkEvent>) {
        let (sink, rx) = ChannelSink::new();
        let coordinator = StreamCoordinator::builder()
            .transport(transport)
            .sink(Arc::new(sink))
            .config(CoordinatorConfig::default().pacer(PacerConfig::default()))
            .build()
            .expect("coordinator");
        (coordinator, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> SinkEvent {
        tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("sink event before timeout")
            .expect("sink open")
    }

    async fn wait_for_state(rx: &mut mpsc::UnboundedReceiver<SinkEvent>, state: ConnectionState) {
        loop {
            if next_event(rx).await == SinkEvent::ConnectionState(state) {
                return;
            }
        }
    }

    /// Collects per-agent text until `agents` agents have completed.
    async fn collect_until_complete(
        rx: &mut mpsc::UnboundedReceiver<SinkEvent>,
        agents: usize,
    ) -> (HashMap<AgentId, String>, Vec<SinkEvent>) {
        let mut text: HashMap<AgentId, String> = HashMap::new();
        let mut seen = Vec::new();
        let mut completed = 0;
        while completed < agents {
            let event = next_event(rx).await;
            match &event {
                SinkEvent::Chunk { agent_id, text: chunk } => {
                    text.entry(agent_id.clone()).or_default().push_str(chunk);
                }
                SinkEvent::Complete { .. } => completed += 1,
                _ => {}
            }
            seen.push(event);
        }
        (text, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn demultiplexes_agents_into_independent_paced_streams() {
        let transport = ScriptedTransport::new(vec![Script::Open(vec![
            connected(),
            output("a1", "Hello wor"),
            output("a2", "Bonjour le "),
            Ok(TransportEvent::Heartbeat),
            output("a1", "ld, again "),
            output("a2", "monde"),
            Ok(TransportEvent::RunComplete),
        ])]);
        let (coordinator, mut rx) = coordinator(transport);
        coordinator.start("r1").await.expect("start");

        let (text, seen) = collect_until_complete(&mut rx, 2).await;
        assert_eq!(text[&AgentId::new("a1")], "Hello world, again ");
        assert_eq!(text[&AgentId::new("a2")], "Bonjour le monde");

        let states: Vec<ConnectionState> = seen
            .iter()
            .filter_map(|e| match e {
                SinkEvent::ConnectionState(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );

        let snapshot = coordinator.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.run_id, Some(RunId::new("r1")));
        assert_eq!(snapshot.phase, Some(RunPhase::Completed));
        assert!(snapshot.agents.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn agent_errors_bypass_pacing() {
        let transport = ScriptedTransport::new(vec![Script::Open(vec![
            connected(),
            output("a1", "slow words "),
            Ok(TransportEvent::Error {
                agent_id: AgentId::new("a1"),
                message: "model overloaded".into(),
            }),
        ])]);
        let (coordinator, mut rx) = coordinator(transport);
        coordinator.start("r1").await.expect("start");
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        let first = next_event(&mut rx).await;
        assert_eq!(
            first,
            SinkEvent::Error {
                agent_id: AgentId::new("a1"),
                message: "model overloaded".into()
            }
        );
        let second = next_event(&mut rx).await;
        assert!(matches!(second, SinkEvent::Chunk { ref text, .. } if text == "slow "));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_events_are_dropped_without_affecting_the_run() {
        let transport = ScriptedTransport::new(vec![Script::Open(vec![
            connected(),
            Err(TransportError::malformed("garbage")),
            output("a1", "fine "),
            Ok(TransportEvent::AgentComplete {
                agent_id: AgentId::new("a1"),
            }),
            output("a1", "too late "),
            Ok(TransportEvent::AgentComplete {
                agent_id: AgentId::new("a9"),
            }),
        ])]);
        let (coordinator, mut rx) = coordinator(transport);
        coordinator.start("r1").await.expect("start");

        let (text, _) = collect_until_complete(&mut rx, 2).await;
        assert_eq!(text[&AgentId::new("a1")], "fine ");
        assert!(!text.contains_key(&AgentId::new("a9")));
        let snapshot = coordinator.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_link_reports_connecting_until_it_recovers() {
        let transport = ScriptedTransport::new(vec![Script::Open(vec![
            connected(),
            Ok(TransportEvent::Status(LinkStatus::Degraded {
                reason: "poll failed".into(),
            })),
            connected(),
            output("a1", "still here "),
            Ok(TransportEvent::AgentComplete {
                agent_id: AgentId::new("a1"),
            }),
        ])]);
        let (coordinator, mut rx) = coordinator(transport.clone());
        coordinator.start("r1").await.expect("start");

        let (text, seen) = collect_until_complete(&mut rx, 1).await;
        assert_eq!(text[&AgentId::new("a1")], "still here ");
        let states: Vec<ConnectionState> = seen
            .iter()
            .filter_map(|e| match e {
                SinkEvent::ConnectionState(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
        // Degradation is not a failure: the link is never reopened.
        assert_eq!(transport.opens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_back_off_exponentially_then_error() {
        let transport = ScriptedTransport::new(vec![
            Script::Fail(TransportError::connect("refused")),
            Script::Fail(TransportError::connect("refused")),
            Script::Fail(TransportError::connect("refused")),
            Script::Fail(TransportError::connect("refused")),
        ]);
        let (coordinator, mut rx) = coordinator(transport.clone());
        coordinator.start("r1").await.expect("start");
        wait_for_state(&mut rx, ConnectionState::Error).await;

        let opens = transport.opens();
        assert_eq!(opens.len(), 4);
        let gaps: Vec<u128> = opens
            .windows(2)
            .map(|w| (w[1].1 - w[0].1).as_millis())
            .collect();
        assert_eq!(gaps, vec![100, 200, 300]);
        let attempts: Vec<u32> = opens.iter().map(|(req, _)| req.attempt).collect();
        assert_eq!(attempts, vec![0, 1, 2, 3]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.opens().len(), 4);
        let snapshot = coordinator.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.state, ConnectionState::Error);

        coordinator.stop().await.expect("stop");
        wait_for_state(&mut rx, ConnectionState::Disconnected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_the_attempt_counter() {
        let stamped = Ok(TransportEvent::Output {
            agent_id: AgentId::new("a1"),
            content: "x".into(),
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
        });
        let transport = ScriptedTransport::new(vec![
            Script::Finite(vec![connected(), stamped]),
            Script::Fail(TransportError::connect("refused")),
            Script::Finite(vec![connected()]),
            Script::Open(vec![connected()]),
        ]);
        let (coordinator, mut rx) = coordinator(transport.clone());
        coordinator.start("r1").await.expect("start");

        while transport.opens().len() < 4 {
            next_event(&mut rx).await;
        }
        let opens = transport.opens();
        let gaps: Vec<u128> = opens
            .windows(2)
            .map(|w| (w[1].1 - w[0].1).as_millis())
            .collect();
        assert_eq!(gaps, vec![100, 200, 100]);
        assert!(opens[1].0.resume_after.is_some());
        assert_eq!(opens[1].0.resume_after, opens[3].0.resume_after);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_open_failure_is_terminal_immediately() {
        let transport = ScriptedTransport::new(vec![Script::Fail(TransportError::Status {
            code: 404,
            body: "unknown run".into(),
        })]);
        let (coordinator, mut rx) = coordinator(transport.clone());
        coordinator.start("r404").await.expect("start");
        wait_for_state(&mut rx, ConnectionState::Error).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.opens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect_and_pacers() {
        let transport = ScriptedTransport::new(vec![
            Script::Finite(vec![connected(), output("a1", "unfinished")]),
            Script::Open(vec![connected()]),
        ]);
        let (coordinator, mut rx) = coordinator(transport.clone());
        coordinator.start("r1").await.expect("start");
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        wait_for_state(&mut rx, ConnectionState::Connecting).await;

        coordinator.stop().await.expect("stop");
        let snapshot = coordinator.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.run_id, None);
        assert!(snapshot.agents.is_empty());
        assert_eq!(snapshot.state, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.opens().len(), 1);
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, SinkEvent::Chunk { .. }), "late chunk: {event:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_hold_and_release_output() {
        let transport = ScriptedTransport::new(vec![Script::Open(vec![
            connected(),
            output("a1", "alpha beta gamma delta "),
            output("a2", "other agent "),
        ])]);
        let (coordinator, mut rx) = coordinator(transport);
        coordinator.start("r1").await.expect("start");

        let mut a1 = String::new();
        let mut a2 = String::new();
        let mut record = |event: SinkEvent, a1: &mut String| {
            if let SinkEvent::Chunk { agent_id, text } = event {
                match agent_id.as_str() {
                    "a1" => a1.push_str(&text),
                    _ => a2.push_str(&text),
                }
            }
        };
        while a1.is_empty() {
            record(next_event(&mut rx).await, &mut a1);
        }
        assert_eq!(a1, "alpha ");
        coordinator.pause(Some(AgentId::new("a1"))).expect("pause");
        tokio::time::sleep(Duration::from_secs(5)).await;
        while let Ok(event) = rx.try_recv() {
            record(event, &mut a1);
        }
        assert_eq!(a1, "alpha ", "paused agent emitted");
        assert_eq!(a2, "other agent ");

        coordinator.resume(None).expect("resume");
        while a1 != "alpha beta gamma delta " {
            if let SinkEvent::Chunk { agent_id, text } = next_event(&mut rx).await {
                assert_eq!(agent_id.as_str(), "a1");
                a1.push_str(&text);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_resets_output_but_keeps_the_connection() {
        let (feed, live) = mpsc::unbounded_channel();
        let transport = ScriptedTransport::new(vec![Script::Live(live)]);
        let (coordinator, mut rx) = coordinator(transport.clone());
        coordinator.start("r1").await.expect("start");
        feed.send(connected()).expect("feed");
        feed.send(output("a1", "first words here ")).expect("feed");
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        assert!(matches!(
            next_event(&mut rx).await,
            SinkEvent::Chunk { ref text, .. } if text == "first "
        ));

        coordinator.clear_all().expect("clear");
        assert!(coordinator.snapshot().await.expect("snapshot").agents.is_empty());

        feed.send(output("a1", "second ")).expect("feed");
        let next = next_event(&mut rx).await;
        assert_eq!(
            next,
            SinkEvent::Chunk {
                agent_id: AgentId::new("a1"),
                text: "second ".into()
            }
        );
        let snapshot = coordinator.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(transport.opens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_a_new_run_tears_down_the_old_one() {
        let (old_feed, old_live) = mpsc::unbounded_channel();
        let transport = ScriptedTransport::new(vec![
            Script::Live(old_live),
            Script::Open(vec![connected(), output("b1", "new run ")]),
        ]);
        let (coordinator, mut rx) = coordinator(transport.clone());
        coordinator.start("r1").await.expect("start r1");
        old_feed.send(connected()).expect("feed");
        old_feed.send(output("a1", "old text that never finishes")).expect("feed");
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        coordinator.start("r2").await.expect("start r2");
        // The old link is aborted; whatever it still had is never delivered.
        let _ = old_feed.send(output("a1", "more old "));

        let mut seen_b1 = String::new();
        while seen_b1 != "new run " {
            match next_event(&mut rx).await {
                SinkEvent::Chunk { agent_id, text } => {
                    assert_eq!(agent_id.as_str(), "b1");
                    seen_b1.push_str(&text);
                }
                SinkEvent::Error { .. } | SinkEvent::Complete { .. } => panic!("unexpected"),
                SinkEvent::ConnectionState(_) => {}
            }
        }
        let snapshot = coordinator.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.run_id, Some(RunId::new("r2")));
        assert_eq!(snapshot.agents, vec![AgentId::new("b1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn selection_requires_the_current_run() {
        let transport = ScriptedTransport::new(vec![Script::Open(vec![
            connected(),
            output("a1", "done "),
            Ok(TransportEvent::RunComplete),
        ])]);
        let backend = Arc::new(RecordingBackend::default());
        let (sink, mut rx) = ChannelSink::new();
        let coordinator = StreamCoordinator::builder()
            .transport(transport)
            .sink(Arc::new(sink))
            .selection_backend(backend.clone())
            .build()
            .expect("coordinator");

        let err = coordinator.select("r1", "a2").await.expect_err("no run yet");
        assert!(matches!(err, SelectionError::NoActiveRun { .. }));

        coordinator.start("r1").await.expect("start");
        let err = coordinator.select("r0", "a2").await.expect_err("stale run");
        assert!(matches!(err, SelectionError::NoActiveRun { .. }));
        coordinator.select("r1", "a2").await.expect("active run");
        assert_eq!(backend.calls().len(), 1);

        collect_until_complete(&mut rx, 1).await;
        coordinator.select("r1", "a1").await.expect("just completed run");
        assert_eq!(backend.calls().len(), 2);

        coordinator.stop().await.expect("stop");
        let err = coordinator.select("r1", "a1").await.expect_err("stopped");
        assert!(matches!(err, SelectionError::NoActiveRun { .. }));
        assert_eq!(
            backend.calls(),
            vec![
                (RunId::new("r1"), AgentId::new("a2")),
                (RunId::new("r1"), AgentId::new("a1"))
            ]
        );
    }

    #[tokio::test]
    async fn builder_requires_transport_and_sink() {
        let (sink, _rx) = ChannelSink::new();
        let missing_transport = StreamCoordinator::builder().sink(Arc::new(sink)).build();
        assert!(matches!(missing_transport, Err(CoordinatorError::Config(_))));
        let missing_sink = StreamCoordinator::builder()
            .transport(ScriptedTransport::new(vec![]))
            .build();
        assert!(matches!(missing_sink, Err(CoordinatorError::Config(_))));
    }

    #[tokio::test]
    async fn blank_run_id_is_rejected() {
        let (coordinator, _rx) = coordinator(ScriptedTransport::new(vec![]));
        assert!(matches!(
            coordinator.start("  ").await,
            Err(CoordinatorError::Validation(_))
        ));
    }
}
