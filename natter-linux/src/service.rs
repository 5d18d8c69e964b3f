//! Background service loop: owns the core, the scan task, dial tasks and per-link tasks.
//!
//! Everything that mutates state runs on this one task, fed by two channels: commands from
//! front ends and events from the tasks it spawned. Consumers watch [`ChatSnapshot`]s.
//! History is written by a separate saver task that only ever keeps the latest copy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use natter_core::{
    ChatSnapshot, ConversationStore, CoreConfig, DialId, LinkError, LinkId, LinkVerdict,
    MessageId, NatterCore, Origin, OutboundAction, PeerAddress, SendError, Sighting,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::radio::{Link, Radio};
use crate::transport::{self, LinkReport, OutboundFrame};

const SIGHTING_BUFFER: usize = 32;
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub scan_duration: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_grace: Duration,
    pub core: CoreConfig,
    /// Where history is persisted; `None` keeps it in memory only.
    pub data_file: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(12),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            core: CoreConfig::default(),
            data_file: None,
        }
    }
}

#[derive(Debug)]
pub enum Command {
    StartScan,
    StopScan,
    Connect(PeerAddress),
    Disconnect(PeerAddress),
    Send {
        peer: PeerAddress,
        body: String,
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    },
    DeleteMessage {
        peer: PeerAddress,
        id: MessageId,
    },
    DeleteConversation(PeerAddress),
    MarkRead(PeerAddress),
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

enum Event {
    Sighting {
        cycle: u64,
        sighting: Sighting,
    },
    ScanEnded {
        cycle: u64,
        result: Result<(), LinkError>,
    },
    DialDone {
        peer: PeerAddress,
        dial: DialId,
        result: Result<Link, LinkError>,
    },
    /// The tasks of a closed link were stopped.
    Closed {
        peer: PeerAddress,
        link: LinkId,
    },
    Incoming {
        peer: PeerAddress,
        link: Link,
    },
    Link(LinkReport),
}

/// Front-end side of the service. Cheap to clone; every clone talks to the same loop.
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChatSnapshot>,
}

impl ServiceHandle {
    pub fn start_scan(&self) {
        self.submit(Command::StartScan);
    }

    pub fn stop_scan(&self) {
        self.submit(Command::StopScan);
    }

    pub fn connect(&self, peer: impl Into<PeerAddress>) {
        self.submit(Command::Connect(peer.into()));
    }

    pub fn disconnect(&self, peer: impl Into<PeerAddress>) {
        self.submit(Command::Disconnect(peer.into()));
    }

    pub fn delete_message(&self, peer: impl Into<PeerAddress>, id: MessageId) {
        self.submit(Command::DeleteMessage {
            peer: peer.into(),
            id,
        });
    }

    pub fn delete_conversation(&self, peer: impl Into<PeerAddress>) {
        self.submit(Command::DeleteConversation(peer.into()));
    }

    pub fn mark_read(&self, peer: impl Into<PeerAddress>) {
        self.submit(Command::MarkRead(peer.into()));
    }

    /// Queue `body` for `peer`. Resolves once the message is in history and handed to the
    /// link writer; delivery is reported through the state stream.
    pub async fn send_message(
        &self,
        peer: impl Into<PeerAddress>,
        body: impl Into<String>,
    ) -> Result<MessageId, SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                peer: peer.into(),
                body: body.into(),
                reply,
            })
            .map_err(|_| SendError::ServiceStopped)?;
        rx.await.map_err(|_| SendError::ServiceStopped)?
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.state.clone()
    }

    /// Stop scanning, close every link and wait for the loop to finish. Safe to call twice.
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { ack }).is_ok() {
            let _ = rx.await;
        }
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("Service stopped; command dropped");
        }
    }
}

struct LinkTasks {
    link: LinkId,
    queue: mpsc::UnboundedSender<OutboundFrame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LinkTasks {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Writes history off the service task. Unsaved copies are replaced, never queued.
struct Saver {
    latest: watch::Sender<Option<ConversationStore>>,
    task: JoinHandle<()>,
}

impl Saver {
    fn spawn(path: PathBuf) -> Self {
        let (latest, mut rx) = watch::channel(None::<ConversationStore>);
        let task = tokio::spawn(async move {
            // Still sees a copy sent just before the sender was dropped.
            while rx.changed().await.is_ok() {
                let latest = rx.borrow_and_update().clone();
                let Some(store) = latest else {
                    continue;
                };
                let path = path.clone();
                match tokio::task::spawn_blocking(move || store.save(&path)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!("Cannot save conversations: {}", e),
                    Err(e) => log::error!("Save task failed: {}", e),
                }
            }
        });
        Self { latest, task }
    }

    fn save(&self, store: &ConversationStore) {
        self.latest.send_replace(Some(store.clone()));
    }

    /// Wait until the last copy handed over is on disk.
    async fn finish(self) {
        let Saver { latest, task } = self;
        drop(latest);
        if let Err(e) = task.await {
            log::error!("Save task failed: {}", e);
        }
    }
}

struct Service {
    core: NatterCore,
    radio: Arc<dyn Radio>,
    settings: ServiceSettings,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Sender<ChatSnapshot>,
    saver: Option<Saver>,
    scan: Option<JoinHandle<()>>,
    dials: HashMap<PeerAddress, (DialId, JoinHandle<()>)>,
    links: HashMap<PeerAddress, LinkTasks>,
}

/// Start the service loop on the current runtime. It runs until `ServiceHandle::shutdown`
/// or until every handle is dropped.
pub fn spawn(
    radio: Arc<dyn Radio>,
    store: ConversationStore,
    settings: ServiceSettings,
) -> (ServiceHandle, JoinHandle<()>) {
    let core = NatterCore::with_store(store, settings.core.clone());
    let (state, state_rx) = watch::channel(core.snapshot());
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();
    let saver = settings.data_file.clone().map(Saver::spawn);
    let service = Service {
        core,
        radio,
        settings,
        events,
        state,
        saver,
        scan: None,
        dials: HashMap::new(),
        links: HashMap::new(),
    };
    let task = tokio::spawn(service.run(commands_rx, events_rx));
    (
        ServiceHandle {
            commands,
            state: state_rx,
        },
        task,
    )
}

impl Service {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        log::info!("Messaging service started");
        let acceptor = self.spawn_acceptor();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { ack }) => {
                        self.shutdown(&mut events).await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown(&mut events).await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
            }
            self.settle();
        }
        acceptor.abort();
        // Late shutdown requests still get an answer.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Shutdown { ack } => {
                    let _ = ack.send(());
                }
                Command::Send { reply, .. } => {
                    let _ = reply.send(Err(SendError::ServiceStopped));
                }
                _ => {}
            }
        }
        log::info!("Messaging service stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::StartScan => {
                let actions = self.core.start_scan();
                self.perform(actions);
            }
            Command::StopScan => {
                let actions = self.core.stop_scan();
                self.perform(actions);
            }
            Command::Connect(peer) => {
                let actions = self.core.connect(&peer);
                self.perform(actions);
            }
            Command::Disconnect(peer) => {
                let actions = self.core.disconnect(&peer);
                self.perform(actions);
            }
            Command::Send { peer, body, reply } => {
                let _ = reply.send(self.send(&peer, &body));
            }
            Command::DeleteMessage { peer, id } => {
                self.core.delete_message(&peer, id);
            }
            Command::DeleteConversation(peer) => {
                self.core.delete_conversation(&peer);
            }
            Command::MarkRead(peer) => {
                self.core.mark_read(&peer);
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn send(&mut self, peer: &PeerAddress, body: &str) -> Result<MessageId, SendError> {
        let out = self.core.send_message(peer, body, Utc::now())?;
        let queued = self
            .links
            .get(peer)
            .filter(|tasks| tasks.link == out.link)
            .map(|tasks| {
                tasks
                    .queue
                    .send(OutboundFrame {
                        id: out.id,
                        bytes: out.frame,
                    })
                    .is_ok()
            })
            .unwrap_or(false);
        if !queued {
            // The writer is gone even though the link has not been reported down yet.
            self.core
                .on_write_complete(peer, out.id, Err(LinkError::NotConnected));
            return Err(SendError::NotConnected(peer.clone()));
        }
        Ok(out.id)
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Sighting { cycle, sighting } => {
                self.core.on_sighting(cycle, sighting, Utc::now());
            }
            Event::ScanEnded { cycle, result } => {
                if self.core.on_scan_ended(cycle, result, Utc::now()) {
                    self.scan = None;
                }
            }
            Event::DialDone { peer, dial, result } => {
                if matches!(self.dials.get(&peer), Some((current, _)) if *current == dial) {
                    self.dials.remove(&peer);
                }
                match result {
                    Ok(link) => self.link_up(peer, link, Origin::Outgoing(dial)),
                    Err(reason) => {
                        if self.core.on_dial_failed(&peer, dial, reason.clone()) {
                            log::warn!("Connect to {} failed: {}", peer, reason);
                        } else {
                            log::debug!("Ignoring result of abandoned dial to {}", peer);
                        }
                    }
                }
            }
            Event::Closed { peer, link } => {
                if self.core.on_link_closed(&peer, link) {
                    log::info!("Disconnected from {}", peer);
                }
            }
            Event::Incoming { peer, link } => self.link_up(peer, link, Origin::Incoming),
            Event::Link(LinkReport::Frame { peer, link, frame }) => {
                self.core.on_frame(&peer, link, frame, Utc::now());
            }
            Event::Link(LinkReport::Written { peer, id, result }) => {
                self.core.on_write_complete(&peer, id, result);
            }
            Event::Link(LinkReport::Down { peer, link, reason }) => {
                if self.core.on_link_down(&peer, link, reason.clone()) {
                    log::warn!("Link to {} lost: {}", peer, reason);
                    if let Some(tasks) = self.take_link(&peer, link) {
                        tasks.abort();
                    }
                }
            }
        }
    }

    fn link_up(&mut self, peer: PeerAddress, stream: Link, origin: Origin) {
        match self.core.on_link_up(&peer, origin) {
            LinkVerdict::Accept { link, cancel_dial } => {
                if cancel_dial {
                    if let Some((_, dial)) = self.dials.remove(&peer) {
                        dial.abort();
                    }
                }
                log::info!("Connected to {} ({:?})", peer, origin);
                let tasks = self.spawn_link(peer.clone(), link, stream);
                if let Some(old) = self.links.insert(peer, tasks) {
                    old.abort();
                }
            }
            LinkVerdict::Reject => {
                log::info!("Dropping extra {:?} link for {}", origin, peer);
            }
        }
    }

    fn perform(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::BeginScan { cycle } => {
                    let scan = self.spawn_scan(cycle);
                    if let Some(old) = self.scan.replace(scan) {
                        old.abort();
                    }
                }
                OutboundAction::CancelScan { cycle } => {
                    log::debug!("Cancelling scan cycle {}", cycle);
                    if let Some(scan) = self.scan.take() {
                        scan.abort();
                    }
                }
                OutboundAction::Dial { peer, dial } => {
                    let task = self.spawn_dial(peer.clone(), dial);
                    if let Some((_, old)) = self.dials.insert(peer, (dial, task)) {
                        old.abort();
                    }
                }
                OutboundAction::CancelDial(peer) => {
                    if let Some((_, dial)) = self.dials.remove(&peer) {
                        dial.abort();
                    }
                }
                OutboundAction::Close { peer, link } => self.close(peer, link),
            }
        }
    }

    /// Stop the link's tasks, then report `Closed` once both have ended. Disconnecting is
    /// published in between.
    fn close(&mut self, peer: PeerAddress, link: LinkId) {
        let tasks = self.take_link(&peer, link);
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Some(tasks) = tasks {
                tasks.abort();
                let _ = tasks.reader.await;
                let _ = tasks.writer.await;
            }
            let _ = events.send(Event::Closed { peer, link });
        });
    }

    fn take_link(&mut self, peer: &PeerAddress, link: LinkId) -> Option<LinkTasks> {
        if self.links.get(peer).map(|t| t.link) == Some(link) {
            self.links.remove(peer)
        } else {
            None
        }
    }

    fn spawn_scan(&self, cycle: u64) -> JoinHandle<()> {
        let radio = self.radio.clone();
        let events = self.events.clone();
        let duration = self.settings.scan_duration;
        tokio::spawn(async move {
            log::debug!("Scan cycle {} started", cycle);
            let result = async {
                radio.ensure_ready().await?;
                let (tx, mut rx) = mpsc::channel(SIGHTING_BUFFER);
                let forward = async {
                    while let Some(sighting) = rx.recv().await {
                        if events.send(Event::Sighting { cycle, sighting }).is_err() {
                            break;
                        }
                    }
                };
                let (scanned, ()) = tokio::join!(tokio::time::timeout(duration, radio.scan(tx)), forward);
                // Reaching the ceiling is the normal end of a cycle.
                scanned.unwrap_or(Ok(()))
            }
            .await;
            let _ = events.send(Event::ScanEnded { cycle, result });
        })
    }

    fn spawn_dial(&self, peer: PeerAddress, dial: DialId) -> JoinHandle<()> {
        let radio = self.radio.clone();
        let events = self.events.clone();
        let timeout = self.settings.connect_timeout;
        tokio::spawn(async move {
            log::debug!("Dialing {}", peer);
            let result = match tokio::time::timeout(timeout, radio.connect(&peer)).await {
                Ok(result) => result,
                Err(_) => Err(LinkError::ConnectTimeout),
            };
            let _ = events.send(Event::DialDone { peer, dial, result });
        })
    }

    fn spawn_acceptor(&self) -> JoinHandle<()> {
        let radio = self.radio.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match radio.accept().await {
                    Ok((peer, link)) => {
                        if events.send(Event::Incoming { peer, link }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        log::warn!("Cannot accept links: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        })
    }

    fn spawn_link(&self, peer: PeerAddress, link: LinkId, stream: Link) -> LinkTasks {
        let (reader, writer) = tokio::io::split(stream);
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let read_events = self.events.clone();
        let reader = tokio::spawn(transport::read_loop(
            peer.clone(),
            link,
            reader,
            self.core.max_frame_len(),
            move |report| read_events.send(Event::Link(report)).is_ok(),
        ));
        let write_events = self.events.clone();
        let writer = tokio::spawn(transport::write_loop(
            peer,
            link,
            writer,
            queue_rx,
            self.settings.write_timeout,
            move |report| write_events.send(Event::Link(report)).is_ok(),
        ));
        LinkTasks {
            link,
            queue,
            reader,
            writer,
        }
    }

    /// Give writers the grace period to flush what is queued, then close everything.
    async fn shutdown(&mut self, events: &mut mpsc::UnboundedReceiver<Event>) {
        log::info!("Shutting down messaging service");
        let links: Vec<LinkTasks> = self.links.drain().map(|(_, tasks)| tasks).collect();
        let deadline = tokio::time::Instant::now() + self.settings.shutdown_grace;
        for tasks in links {
            let LinkTasks {
                queue,
                reader,
                mut writer,
                ..
            } = tasks;
            drop(queue);
            if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
                log::warn!("Writer did not finish in time; closing link forcibly");
                writer.abort();
            }
            reader.abort();
        }
        while let Ok(event) = events.try_recv() {
            if let Event::Link(LinkReport::Written { peer, id, result }) = event {
                self.core.on_write_complete(&peer, id, result);
            }
        }
        for (_, (_, dial)) in self.dials.drain() {
            dial.abort();
        }
        let actions = self.core.shutdown();
        self.perform(actions);
        self.settle();
        if let Some(saver) = self.saver.take() {
            saver.finish().await;
        }
    }

    /// Hand history to the saver if anything changed and publish the new state.
    fn settle(&mut self) {
        if self.core.take_dirty() {
            if let Some(saver) = &self.saver {
                saver.save(self.core.store());
            }
        }
        let snapshot = self.core.snapshot();
        self.state.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
