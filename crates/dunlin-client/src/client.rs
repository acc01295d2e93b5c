//! The client facade and its control task
//!
//! A single control task owns every piece of mutable session state: the hub
//! session and peer directory, the connection table, the slot pool, the
//! share index and the download registry. User API calls and worker results
//! all arrive as typed messages on its channels; event callbacks run on the
//! control task in observation order.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tiger::Digest;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};

use data_encoding::BASE32_NOPAD;
use dunlin_core::adc::{AdcBody, AdcHeader, AdcMessage};
use dunlin_core::conn::{FramedConn, NetStream};
use dunlin_core::error::{DcError, Result};
use dunlin_core::nmdc::NmdcMessage;
use dunlin_core::tls::TlsContext;
use dunlin_core::types::{Dialect, Direction, EncryptionMode, Peer, SearchQuery, SearchResult};

use crate::config::{ClientConfig, HubUrl};
use crate::download::{DownloadConf, DownloadError, DownloadRegistry};
use crate::events::Callbacks;
use crate::hub::{HubEvent, HubIdentity, HubSession, SearchReply};
use crate::peer::{ConnEvent, ConnRole, IdentifyAck, PeerCmd, PeerTaskConfig};
use crate::share::{scan_root, ShareIndex};
use crate::upload::{self, SlotPool, Upload, UploadPlan, UploadRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HUB_REFRESH_INTERVAL: Duration = Duration::from_secs(120);
const CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Commands posted into the control task by the embedder.
enum Command {
    HubConnect,
    Close,
    ShareAdd { alias: String, path: PathBuf },
    MessagePublic(String),
    MessagePrivate { nick: String, text: String },
    Search(SearchQuery),
    Download(DownloadConf),
    Safe {
        f: Box<dyn FnOnce(&Handle) + Send>,
        done: Option<oneshot::Sender<()>>,
    },
}

/// Cheap cloneable handle for issuing API calls; every method posts a
/// command to the control task. Calls fail synchronously with
/// [`DcError::ConnClosed`] once the client has terminated.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::UnboundedSender<Command>,
}

impl Handle {
    fn post(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| DcError::ConnClosed)
    }

    /// Dial the hub; needed only with `manual_hub_connect`.
    pub fn hub_connect(&self) -> Result<()> {
        self.post(Command::HubConnect)
    }

    /// Request termination. `run()` returns once everything wound down.
    pub fn close(&self) -> Result<()> {
        self.post(Command::Close)
    }

    /// Scan `path` and share it under `alias`.
    pub fn share_add(&self, alias: impl Into<String>, path: impl Into<PathBuf>) -> Result<()> {
        self.post(Command::ShareAdd {
            alias: alias.into(),
            path: path.into(),
        })
    }

    pub fn message_public(&self, text: impl Into<String>) -> Result<()> {
        self.post(Command::MessagePublic(text.into()))
    }

    pub fn message_private(
        &self,
        nick: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<()> {
        self.post(Command::MessagePrivate {
            nick: nick.into(),
            text: text.into(),
        })
    }

    pub fn search(&self, query: SearchQuery) -> Result<()> {
        self.post(Command::Search(query))
    }

    /// Queue a download; completion arrives through the callbacks.
    pub fn download(&self, conf: DownloadConf) -> Result<()> {
        self.post(Command::Download(conf))
    }

    /// Like [`Handle::download`] but writes to `conf.save_path`, which must
    /// be set.
    pub fn download_file(&self, conf: DownloadConf) -> Result<()> {
        if conf.save_path.is_none() {
            return Err(DcError::ConfigInvalid(
                "download_file needs a save path".into(),
            ));
        }
        self.post(Command::Download(conf))
    }

    /// Run a closure on the control task, serialized with every callback.
    pub fn safe(&self, f: impl FnOnce(&Handle) + Send + 'static) -> Result<()> {
        self.post(Command::Safe {
            f: Box::new(f),
            done: None,
        })
    }

    /// Like [`Handle::safe`] but waits until the closure ran. Must not be
    /// called from inside a callback; that would deadlock the control task.
    pub async fn safe_wait(&self, f: impl FnOnce(&Handle) + Send + 'static) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::Safe {
            f: Box::new(f),
            done: Some(tx),
        })?;
        rx.await.map_err(|_| DcError::ConnClosed)
    }
}

/// Everything flowing into the control task from its worker tasks.
enum Internal {
    HubStream {
        stream: NetStream,
        local_ip: Option<IpAddr>,
    },
    HubFrame(Vec<u8>),
    HubClosed(DcError),
    /// A peer connection is ready to be driven (accepted or dialed).
    PeerStream {
        conn: FramedConn,
        dialect: Dialect,
        role: ConnRole,
        token: Option<String>,
    },
    Udp(Vec<u8>),
    ScanDone {
        alias: String,
        cache: crate::share::HashCache,
        result: Result<crate::share::ShareRoot>,
    },
}

struct ConnEntry {
    nick: Option<String>,
    direction: Option<Direction>,
    cmd_tx: mpsc::Sender<PeerCmd>,
    /// Set between a slot grant and the matching completion report, so the
    /// slot is released exactly once even if the connection dies mid-upload.
    active_upload: Option<UploadRequest>,
}

struct Invite {
    created: Instant,
    token: Option<String>,
}

pub struct Client {
    conf: ClientConfig,
    url: HubUrl,
    callbacks: Callbacks,
    handle: Handle,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl Client {
    pub fn new(conf: ClientConfig) -> Result<Client> {
        let url = conf.validate()?;
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        Ok(Client {
            conf,
            url,
            callbacks: Callbacks::default(),
            handle: Handle { tx },
            cmd_rx,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Register event callbacks before calling [`Client::run`].
    pub fn callbacks(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    /// Drive the client until it terminates via [`Handle::close`] or a hub
    /// failure. No callback fires after this returns.
    pub async fn run(mut self) -> Result<()> {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let tls = if self.url.tls || self.conf.encryption != EncryptionMode::DisableEncryption {
            Some(Arc::new(TlsContext::new()?))
        } else {
            None
        };

        let mut pid = [0u8; 24];
        rand::thread_rng().fill(&mut pid[..]);

        let mut state = ControlState {
            conf: self.conf.clone(),
            url: self.url.clone(),
            handle: self.handle.clone(),
            internal_tx,
            conn_tx,
            shutdown_tx,
            tls,
            pid,
            cid_b32: BASE32_NOPAD.encode(&tiger::Tiger::digest(pid)),
            share: ShareIndex::default(),
            scan_busy: false,
            pending_scans: VecDeque::new(),
            hub: None,
            hub_writer: None,
            hub_refreshed: Instant::now(),
            downloads: DownloadRegistry::default(),
            slots: SlotPool::new(self.conf.upload_slots),
            conns: HashMap::new(),
            next_conn_id: 0,
            invites: HashMap::new(),
            adc_tokens: HashMap::new(),
            next_token: 0,
            udp: None,
            tasks: Vec::new(),
            closing: false,
            result: Ok(()),
        };

        state.start_listeners().await?;
        self.callbacks.initialized(&state.handle);
        if !state.conf.manual_hub_connect {
            state.hub_connect();
        }

        let mut cmd_rx = self.cmd_rx;
        let mut internal_rx = internal_rx;
        let mut conn_rx = conn_rx;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !(state.closing && state.conns.is_empty()) {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => state.handle_command(cmd, &mut self.callbacks),
                    None => state.begin_close(&mut self.callbacks),
                },
                Some(event) = internal_rx.recv() => {
                    state.handle_internal(event, &mut self.callbacks);
                }
                Some(event) = conn_rx.recv() => {
                    state.handle_conn_event(event, &mut self.callbacks);
                }
                _ = ticker.tick() => state.handle_tick(),
            }
            if state.closing && state.conns.is_empty() {
                break;
            }
        }

        // drain the remaining workers; they were all signalled
        let deadline = Instant::now() + CLOSE_GRACE;
        while !state.conns.is_empty() && Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(100), conn_rx.recv()).await {
                Ok(Some(event)) => state.handle_conn_event(event, &mut self.callbacks),
                _ => break,
            }
        }
        for task in state.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        state.result
    }
}

struct ControlState {
    conf: ClientConfig,
    url: HubUrl,
    handle: Handle,
    internal_tx: mpsc::UnboundedSender<Internal>,
    conn_tx: mpsc::UnboundedSender<ConnEvent>,
    shutdown_tx: watch::Sender<bool>,
    tls: Option<Arc<TlsContext>>,
    pid: [u8; 24],
    cid_b32: String,
    share: ShareIndex,
    scan_busy: bool,
    pending_scans: VecDeque<(String, PathBuf)>,
    hub: Option<HubSession>,
    hub_writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    hub_refreshed: Instant,
    downloads: DownloadRegistry,
    slots: SlotPool,
    conns: HashMap<u64, ConnEntry>,
    next_conn_id: u64,
    invites: HashMap<String, Invite>,
    /// ADC connect tokens we issued, mapped back to the peer's nick.
    adc_tokens: HashMap<String, String>,
    next_token: u64,
    udp: Option<Arc<UdpSocket>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    closing: bool,
    result: Result<()>,
}

impl ControlState {
    // ---- startup ----

    async fn start_listeners(&mut self) -> Result<()> {
        if self.conf.passive {
            return Ok(());
        }
        let plain = TcpListener::bind(("0.0.0.0", self.conf.tcp_port))
            .await
            .map_err(|e| DcError::NetworkUnreachable(format!("tcp listen: {}", e)))?;
        self.spawn_accept_loop(plain, None);

        if self.conf.encryption != EncryptionMode::DisableEncryption {
            let tls = self
                .tls
                .clone()
                .ok_or_else(|| DcError::Internal("tls context missing".into()))?;
            let listener = TcpListener::bind(("0.0.0.0", self.conf.tcp_tls_port))
                .await
                .map_err(|e| DcError::NetworkUnreachable(format!("tls listen: {}", e)))?;
            self.spawn_accept_loop(listener, Some(tls));
        }

        let udp = UdpSocket::bind(("0.0.0.0", self.conf.udp_port))
            .await
            .map_err(|e| DcError::NetworkUnreachable(format!("udp listen: {}", e)))?;
        let udp = Arc::new(udp);
        self.udp = Some(udp.clone());
        let internal = self.internal_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|v| *v) => break,
                    res = udp.recv_from(&mut buf) => match res {
                        Ok((n, _)) => {
                            let _ = internal.send(Internal::Udp(buf[..n].to_vec()));
                        }
                        Err(e) => {
                            tracing::warn!("udp receive: {}", e);
                            break;
                        }
                    },
                }
            }
        }));
        Ok(())
    }

    fn spawn_accept_loop(&mut self, listener: TcpListener, tls: Option<Arc<TlsContext>>) {
        let internal = self.internal_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let hub_dialect = self.url.dialect;
        let timeouts = (self.conf.read_timeout(), self.conf.write_timeout());
        self.tasks.push(tokio::spawn(async move {
            loop {
                let (tcp, addr) = tokio::select! {
                    _ = shutdown.wait_for(|v| *v) => break,
                    res = listener.accept() => match res {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("accept: {}", e);
                            continue;
                        }
                    },
                };
                tracing::debug!("inbound peer connection from {}", addr);
                let internal = internal.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match prepare_inbound(tcp, tls, hub_dialect, timeouts).await {
                        Ok((conn, dialect)) => {
                            let _ = internal.send(Internal::PeerStream {
                                conn,
                                dialect,
                                role: ConnRole::Inbound,
                                token: None,
                            });
                        }
                        Err(e) => tracing::info!("inbound peer setup failed: {}", e),
                    }
                });
            }
        }));
    }

    // ---- command handling ----

    fn handle_command(&mut self, cmd: Command, callbacks: &mut Callbacks) {
        if self.closing {
            return;
        }
        match cmd {
            Command::HubConnect => self.hub_connect(),
            Command::Close => self.begin_close(callbacks),
            Command::ShareAdd { alias, path } => self.share_add(alias, path),
            Command::MessagePublic(text) => {
                if let Some(hub) = &mut self.hub {
                    hub.chat_public(&text);
                } else {
                    tracing::info!("dropping chat message, hub not connected");
                }
            }
            Command::MessagePrivate { nick, text } => {
                if let Some(hub) = &mut self.hub {
                    if let Err(e) = hub.chat_private(&nick, &text) {
                        tracing::info!("private message to {} failed: {}", nick, e);
                    }
                }
            }
            Command::Search(query) => {
                if let Some(hub) = &mut self.hub {
                    hub.search(&query);
                }
            }
            Command::Download(conf) => self.start_download(conf, callbacks),
            Command::Safe { f, done } => {
                f(&self.handle);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }

    fn hub_connect(&mut self) {
        if self.hub.is_some() || self.closing {
            return;
        }
        let internal = self.internal_tx.clone();
        let url = self.url.clone();
        let tls = self.tls.clone();
        self.tasks.push(tokio::spawn(async move {
            let result = async {
                let tcp = tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    TcpStream::connect((url.host.as_str(), url.port)),
                )
                .await
                .map_err(|_| DcError::Timeout)?
                .map_err(|e| DcError::NetworkUnreachable(e.to_string()))?;
                let local_ip = tcp.local_addr().ok().map(|a| a.ip());
                let stream = if url.tls {
                    let tls = tls.ok_or_else(|| DcError::Internal("tls context missing".into()))?;
                    tls.connect(&url.host, tcp).await?
                } else {
                    NetStream::Plain(tcp)
                };
                Ok::<_, DcError>((stream, local_ip))
            }
            .await;
            let _ = match result {
                Ok((stream, local_ip)) => internal.send(Internal::HubStream { stream, local_ip }),
                Err(e) => internal.send(Internal::HubClosed(e)),
            };
        }));
    }

    fn share_add(&mut self, alias: String, path: PathBuf) {
        if self.scan_busy {
            self.pending_scans.push_back((alias, path));
            return;
        }
        self.scan_busy = true;
        let mut cache = self.share.take_cache();
        let max_leaves = self.conf.tth_max_leaves;
        let internal = self.internal_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let handle = tokio::task::spawn_blocking(move || {
                tracing::info!("share scan of {} started", path.display());
                let result = scan_root(&alias, &path, &mut cache, max_leaves);
                (alias, cache, result)
            });
            if let Ok((alias, cache, result)) = handle.await {
                let _ = internal.send(Internal::ScanDone {
                    alias,
                    cache,
                    result,
                });
            }
        }));
    }

    fn start_download(&mut self, conf: DownloadConf, callbacks: &mut Callbacks) {
        let nick = conf.peer.clone();
        let id = self.downloads.queue(conf);

        // reuse an idle download-elected connection to the same peer
        if let Some((_, entry)) = self
            .conns
            .iter()
            .find(|(_, e)| e.nick.as_deref() == Some(nick.as_str()) && e.direction == Some(Direction::Download))
        {
            let _ = entry.cmd_tx.try_send(PeerCmd::Assign);
            return;
        }
        if self.invites.contains_key(&nick) {
            // a connection towards this peer is already in flight
            self.downloads.mark_connecting(id);
            return;
        }

        match self.invite_peer(&nick) {
            Ok(()) => self.downloads.mark_connecting(id),
            Err(e) => self.fail_download(id, e, callbacks),
        }
    }

    /// Ask the hub to broker a connection towards `nick`: a connect-to-me
    /// when we listen, a reverse one when we are passive.
    fn invite_peer(&mut self, nick: &str) -> std::result::Result<(), DcError> {
        let Some(hub) = &self.hub else {
            return Err(DcError::NotFound(format!("peer {}", nick)));
        };
        let Some(peer) = hub.peer(nick).cloned() else {
            return Err(DcError::NotFound(format!("peer {}", nick)));
        };
        if self.conf.passive && !peer.is_active {
            return Err(DcError::ProtocolSemantic("both sides are passive".into()));
        }
        // legacy peers do not advertise TLS capability up front; requiring
        // encryption means offering it and letting the handshake fail
        let tls = match self.conf.encryption {
            EncryptionMode::RequireEncryption => true,
            EncryptionMode::PreferEncryption => peer.supports_tls,
            EncryptionMode::DisableEncryption => false,
        };

        self.next_token += 1;
        let token = format!("T{}", self.next_token);
        let Some(hub) = self.hub.as_mut() else {
            return Err(DcError::NotFound(format!("peer {}", nick)));
        };
        if self.conf.passive {
            // ask the active side to send a connect-to-me back
            hub.send_rev_connect_to_me(nick, tls, &token)?;
        } else {
            let port = if tls {
                self.conf.tcp_tls_port
            } else {
                self.conf.tcp_port
            };
            hub.send_connect_to_me(nick, port, tls, &token)?;
        }
        self.invites.insert(
            nick.to_string(),
            Invite {
                created: Instant::now(),
                token: Some(token.clone()),
            },
        );
        self.adc_tokens.insert(token, nick.to_string());
        Ok(())
    }

    fn fail_download(&mut self, id: u64, error: DcError, callbacks: &mut Callbacks) {
        if let Some(conf) = self.downloads.complete(id) {
            callbacks.download_error(&self.handle, &DownloadError { conf, error });
        }
    }

    /// The direction tiebreakers collided; the connection was dropped by
    /// both sides. Invite the peer again when we still want something from
    /// it (the new handshake rolls fresh numbers).
    fn redial_after_tie(&mut self, nick: Option<String>, callbacks: &mut Callbacks) {
        let Some(nick) = nick else { return };
        if !self.downloads.has_pending_for(&nick) || self.invites.contains_key(&nick) {
            return;
        }
        tracing::debug!("redialing {} after tiebreaker collision", nick);
        if let Err(e) = self.invite_peer(&nick) {
            for id in self.downloads.ids_pending_for(&nick) {
                self.fail_download(id, crate::peer::clone_err(&e), callbacks);
            }
        }
    }

    // ---- internal events ----

    fn handle_internal(&mut self, event: Internal, callbacks: &mut Callbacks) {
        match event {
            Internal::HubStream { stream, local_ip } => {
                self.install_hub(stream, local_ip, callbacks)
            }
            Internal::HubFrame(frame) => {
                let events = match self.hub.as_mut() {
                    Some(hub) => match hub.handle_frame(&frame) {
                        Ok(events) => events,
                        Err(e) => {
                            self.hub_failed(e, callbacks);
                            return;
                        }
                    },
                    None => return,
                };
                for event in events {
                    self.handle_hub_event(event, callbacks);
                }
            }
            Internal::HubClosed(e) => {
                if !self.closing {
                    self.hub_failed(e, callbacks);
                }
            }
            Internal::PeerStream {
                conn,
                dialect,
                role,
                token,
            } => self.spawn_peer(conn, dialect, role, token),
            Internal::Udp(datagram) => self.handle_udp(datagram, callbacks),
            Internal::ScanDone {
                alias,
                cache,
                result,
            } => {
                self.scan_busy = false;
                self.share.restore_cache(cache);
                match result {
                    Ok(root) => {
                        self.share.install(root);
                        tracing::info!(
                            "share \"{}\" indexed, total {} bytes",
                            alias,
                            self.share.total_size()
                        );
                        if let Some(hub) = &mut self.hub {
                            hub.update_share(
                                self.share.total_size(),
                                self.slots.total(),
                                self.slots.available(),
                            );
                        }
                        callbacks.share_indexed(&self.handle);
                    }
                    Err(e) => tracing::error!("share scan of \"{}\" failed: {}", alias, e),
                }
                if let Some((alias, path)) = self.pending_scans.pop_front() {
                    self.share_add(alias, path);
                }
            }
        }
    }

    fn install_hub(
        &mut self,
        stream: NetStream,
        local_ip: Option<IpAddr>,
        callbacks: &mut Callbacks,
    ) {
        if self.closing {
            return;
        }
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let identity = HubIdentity {
            nick: self.conf.nick.clone(),
            password: self.conf.password.clone(),
            description: String::new(),
            passive: self.conf.passive,
            tls_capable: self.conf.encryption != EncryptionMode::DisableEncryption,
            udp_port: self.conf.udp_port,
        };
        let mut session = HubSession::new(self.url.dialect, identity, self.pid, writer_tx.clone());
        session.advertised_ip = self.conf.ip.or(local_ip);
        session.update_share(
            self.share.total_size(),
            self.slots.total(),
            self.slots.available(),
        );

        let conn = FramedConn::with_timeouts(
            stream,
            self.url.dialect.delimiter(),
            self.conf.read_timeout(),
            self.conf.write_timeout(),
        );
        let (mut reader, mut writer) = conn.split();

        // writer task: owns the write half; terminates when the session
        // drops the sender
        let internal = self.internal_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = writer.write_frame(&frame).await {
                    let _ = internal.send(Internal::HubClosed(e));
                    break;
                }
            }
            writer.close().await;
        }));

        // reader pump: frames in, errors terminate the session
        let internal = self.internal_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|v| *v) => break,
                    res = reader.read_frame() => match res {
                        Ok(frame) => {
                            let _ = internal.send(Internal::HubFrame(frame));
                        }
                        Err(e) => {
                            let _ = internal.send(Internal::HubClosed(e));
                            break;
                        }
                    },
                }
            }
        }));

        session.start();
        self.hub = Some(session);
        self.hub_writer = Some(writer_tx);
        self.hub_refreshed = Instant::now();
        callbacks.hub_connected(&self.handle);
    }

    fn hub_failed(&mut self, error: DcError, callbacks: &mut Callbacks) {
        tracing::error!("hub session failed: {}", error);
        callbacks.hub_error(&self.handle, &error);
        self.result = Err(error);
        self.begin_close(callbacks);
    }

    fn handle_hub_event(&mut self, event: HubEvent, callbacks: &mut Callbacks) {
        match event {
            HubEvent::Registered => {
                tracing::info!("hub registration complete");
            }
            HubEvent::Operating => {
                tracing::debug!("hub user list received");
            }
            HubEvent::HubName(name) => {
                tracing::info!("hub name: {}", name);
                callbacks.hub_name(&self.handle, &name);
            }
            HubEvent::PeerConnected(peer) => callbacks.peer_connected(&self.handle, &peer),
            HubEvent::PeerUpdated(peer) => callbacks.peer_updated(&self.handle, &peer),
            HubEvent::PeerDisconnected(peer) => {
                self.invites.remove(&peer.nick);
                callbacks.peer_disconnected(&self.handle, &peer);
            }
            HubEvent::ChatPublic { nick, text } => {
                let peer = self.peer_or_stub(&nick);
                callbacks.message_public(&self.handle, &peer, &text);
            }
            HubEvent::ChatPrivate { nick, text } => {
                let peer = self.peer_or_stub(&nick);
                callbacks.message_private(&self.handle, &peer, &text);
            }
            HubEvent::SearchRequest { reply, query } => self.answer_search(reply, query),
            HubEvent::SearchResult(result) => callbacks.search_result(&self.handle, &result),
            HubEvent::ConnectToMe {
                nick,
                addr,
                tls,
                token,
            } => self.dial_peer(nick, addr, tls, token),
            HubEvent::RevConnectToMe { nick, token } => self.answer_rcm(nick, token),
        }
    }

    fn peer_or_stub(&self, nick: &str) -> Peer {
        self.hub
            .as_ref()
            .and_then(|h| h.peer(nick))
            .cloned()
            .unwrap_or_else(|| Peer {
                nick: nick.to_string(),
                ..Peer::default()
            })
    }

    fn answer_search(&mut self, reply: SearchReply, query: SearchQuery) {
        let hits = self.share.search(&query);
        if hits.is_empty() {
            return;
        }
        let free_slots = self.slots.available();
        let total_slots = self.slots.total();
        let Some(hub) = &mut self.hub else { return };
        let mut datagrams = Vec::new();
        for hit in hits {
            let result = SearchResult {
                peer_nick: self.conf.nick.clone(),
                path: hit.path,
                size: hit.size,
                is_directory: hit.is_directory,
                tth: hit.tth,
                free_slots,
                total_slots,
            };
            match &reply {
                SearchReply::Hub(target) => hub.search_reply_via_hub(target, &result),
                SearchReply::Udp(addr) => {
                    datagrams.push((hub.search_reply_datagram(&result), *addr));
                }
            }
        }
        for (datagram, addr) in datagrams {
            self.send_udp(datagram, addr);
        }
    }

    fn send_udp(&self, datagram: Vec<u8>, addr: SocketAddr) {
        let Some(udp) = self.udp.clone() else {
            tracing::debug!("no udp socket, dropping search reply to {}", addr);
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = udp.send_to(&datagram, addr).await {
                tracing::debug!("udp send to {}: {}", addr, e);
            }
        });
    }

    /// A peer (or the hub on its behalf) asked us to dial `addr`.
    fn dial_peer(&mut self, nick: Option<String>, addr: SocketAddr, tls: bool, token: Option<String>) {
        if self.closing {
            return;
        }
        if tls && self.tls.is_none() {
            tracing::info!("ignoring encrypted connect-to-me, tls disabled");
            return;
        }
        if !tls && self.conf.encryption == EncryptionMode::RequireEncryption {
            tracing::info!("ignoring plain connect-to-me, encryption required");
            return;
        }
        let internal = self.internal_tx.clone();
        let tls_ctx = self.tls.clone();
        let dialect = self.url.dialect;
        let timeouts = (self.conf.read_timeout(), self.conf.write_timeout());
        self.tasks.push(tokio::spawn(async move {
            let result = async {
                let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                    .await
                    .map_err(|_| DcError::Timeout)?
                    .map_err(|e| DcError::NetworkUnreachable(e.to_string()))?;
                let stream = if tls {
                    let ctx = tls_ctx.ok_or_else(|| DcError::Internal("tls missing".into()))?;
                    ctx.connect(&addr.ip().to_string(), tcp).await?
                } else {
                    NetStream::Plain(tcp)
                };
                Ok::<_, DcError>(FramedConn::with_timeouts(
                    stream,
                    dialect.delimiter(),
                    timeouts.0,
                    timeouts.1,
                ))
            }
            .await;
            match result {
                Ok(conn) => {
                    let _ = internal.send(Internal::PeerStream {
                        conn,
                        dialect,
                        role: ConnRole::Outbound { nick_hint: nick },
                        token,
                    });
                }
                Err(e) => tracing::info!("peer dial {} failed: {}", addr, e),
            }
        }));
    }

    /// A passive peer wants us to invite it.
    fn answer_rcm(&mut self, nick: String, token: Option<String>) {
        if self.conf.passive {
            tracing::info!("cannot answer reverse connect from {}: we are passive", nick);
            return;
        }
        let Some(hub) = &mut self.hub else { return };
        let supports_tls = hub.peer(&nick).map(|p| p.supports_tls).unwrap_or(false);
        let tls = match self.conf.encryption {
            EncryptionMode::RequireEncryption => true,
            EncryptionMode::PreferEncryption => supports_tls,
            EncryptionMode::DisableEncryption => false,
        };
        let port = if tls {
            self.conf.tcp_tls_port
        } else {
            self.conf.tcp_port
        };
        let token = token.unwrap_or_else(|| {
            self.next_token += 1;
            format!("T{}", self.next_token)
        });
        if hub.send_connect_to_me(&nick, port, tls, &token).is_ok() {
            self.invites.insert(
                nick.clone(),
                Invite {
                    created: Instant::now(),
                    token: Some(token.clone()),
                },
            );
            self.adc_tokens.insert(token, nick);
        }
    }

    fn spawn_peer(
        &mut self,
        conn: FramedConn,
        dialect: Dialect,
        role: ConnRole,
        token: Option<String>,
    ) {
        if self.closing {
            return;
        }
        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        self.conns.insert(
            conn_id,
            ConnEntry {
                nick: None,
                direction: None,
                cmd_tx,
                active_upload: None,
            },
        );
        let cfg = PeerTaskConfig {
            conn_id,
            dialect,
            our_nick: self.conf.nick.clone(),
            disable_compression: self.conf.disable_compression,
            idle_timeout: self.conf.idle_timeout(),
            token,
            cid_b32: self.cid_b32.clone(),
        };
        let events = self.conn_tx.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(crate::peer::run_peer_conn(
            cfg, conn, role, events, cmd_rx, shutdown,
        )));
    }

    // ---- connection events ----

    fn handle_conn_event(&mut self, event: ConnEvent, callbacks: &mut Callbacks) {
        match event {
            ConnEvent::Identified {
                conn_id,
                nick,
                cid,
                token,
                reply,
            } => {
                let resolved = nick
                    .or_else(|| token.as_ref().and_then(|t| self.adc_tokens.get(t).cloned()))
                    .or_else(|| {
                        let cid = cid?;
                        self.hub
                            .as_ref()
                            .and_then(|h| h.peer_by_cid(&cid).map(|p| p.nick.clone()))
                    });
                let accept = !self.closing && resolved.is_some();
                let want_download = resolved
                    .as_deref()
                    .map(|n| self.downloads.has_pending_for(n))
                    .unwrap_or(false);
                let token_invited = token
                    .as_ref()
                    .is_some_and(|t| self.adc_tokens.contains_key(t));
                let mut invited = token_invited;
                if let Some(nick) = &resolved {
                    if let Some(invite) = self.invites.remove(nick) {
                        invited = true;
                        if let Some(token) = invite.token {
                            self.adc_tokens.remove(&token);
                        }
                    }
                    if let Some(entry) = self.conns.get_mut(&conn_id) {
                        entry.nick = Some(nick.clone());
                    }
                }
                let _ = reply.send(IdentifyAck {
                    nick: resolved,
                    accept,
                    want_download,
                    invited,
                });
            }
            ConnEvent::Elected { conn_id, direction } => {
                if let Some(entry) = self.conns.get_mut(&conn_id) {
                    entry.direction = Some(direction);
                }
            }
            ConnEvent::NextDownload { conn_id, reply } => {
                let job = self
                    .conns
                    .get(&conn_id)
                    .and_then(|e| e.nick.clone())
                    .and_then(|nick| self.downloads.assign_for_peer(&nick, conn_id));
                let _ = reply.send(job);
            }
            ConnEvent::StartUpload {
                conn_id,
                request,
                reply,
            } => {
                let _ = reply.send(self.grant_upload(conn_id, request, callbacks));
            }
            ConnEvent::UploadDone { conn_id, upload } => {
                if let Some(entry) = self.conns.get_mut(&conn_id) {
                    if entry.active_upload.take().is_some() {
                        self.slots.release();
                        self.push_slot_update();
                    }
                }
                callbacks.upload_completed(&self.handle, &upload);
            }
            ConnEvent::DownloadDone {
                conn_id: _,
                job,
                result,
            } => {
                let Some(conf) = self.downloads.complete(job.id) else {
                    return;
                };
                match result {
                    Ok(download) => callbacks.download_successful(&self.handle, &download),
                    Err(error) => {
                        callbacks.download_error(&self.handle, &DownloadError { conf, error })
                    }
                }
            }
            ConnEvent::Closed {
                conn_id,
                error,
                reroll,
            } => {
                let entry = self.conns.remove(&conn_id);
                let nick = entry.as_ref().and_then(|e| e.nick.clone());
                if let Some(entry) = entry {
                    if let Some(request) = entry.active_upload {
                        // connection died mid-upload; the slot still comes back
                        self.slots.release();
                        self.push_slot_update();
                        callbacks.upload_completed(
                            &self.handle,
                            &Upload {
                                peer: entry.nick.clone().unwrap_or_default(),
                                request,
                                sent: 0,
                                length: 0,
                                result: Err(if self.closing {
                                    DcError::Cancelled
                                } else {
                                    DcError::ConnClosed
                                }),
                            },
                        );
                    }
                }
                for id in self.downloads.ids_by_conn(conn_id) {
                    if self.closing {
                        self.fail_download(id, DcError::Cancelled, callbacks);
                    } else if let Some(e) = &error {
                        self.fail_download(id, crate::peer::clone_err(e), callbacks);
                    } else {
                        self.downloads.requeue(id);
                    }
                }
                if reroll && !self.closing {
                    self.redial_after_tie(nick, callbacks);
                }
            }
        }
    }

    fn grant_upload(
        &mut self,
        conn_id: u64,
        request: UploadRequest,
        callbacks: &mut Callbacks,
    ) -> std::result::Result<UploadPlan, DcError> {
        if self.closing {
            return Err(DcError::Cancelled);
        }
        if !callbacks.upload_requested(&self.handle, &request) {
            return Err(DcError::NoSlots);
        }
        if self.slots.available() == 0 {
            return Err(DcError::NoSlots);
        }
        let plan = upload::resolve(&self.share, &request, !self.conf.disable_compression)?;
        if !self.slots.try_acquire() {
            return Err(DcError::NoSlots);
        }
        if let Some(entry) = self.conns.get_mut(&conn_id) {
            entry.active_upload = Some(request);
        }
        self.push_slot_update();
        Ok(plan)
    }

    fn push_slot_update(&mut self) {
        if let Some(hub) = &mut self.hub {
            hub.update_share(
                self.share.total_size(),
                self.slots.total(),
                self.slots.available(),
            );
        }
    }

    fn handle_udp(&mut self, datagram: Vec<u8>, callbacks: &mut Callbacks) {
        let Some(hub) = &self.hub else { return };
        let trimmed = match self.url.dialect {
            Dialect::Nmdc => datagram.strip_suffix(b"|").unwrap_or(&datagram),
            Dialect::Adc => datagram.strip_suffix(b"\n").unwrap_or(&datagram),
        };
        match self.url.dialect {
            Dialect::Nmdc => {
                if let Ok(NmdcMessage::SearchResult {
                    nick,
                    path,
                    size,
                    is_directory,
                    free_slots,
                    total_slots,
                    tth,
                    ..
                }) = NmdcMessage::decode(trimmed)
                {
                    callbacks.search_result(
                        &self.handle,
                        &SearchResult {
                            peer_nick: nick,
                            path,
                            size,
                            is_directory,
                            tth,
                            free_slots,
                            total_slots,
                        },
                    );
                }
            }
            Dialect::Adc => {
                if let Ok(AdcMessage {
                    header: AdcHeader::Udp { cid },
                    body:
                        AdcBody::Res {
                            path,
                            size,
                            free_slots,
                            tth,
                            ..
                        },
                }) = AdcMessage::decode(trimmed)
                {
                    let Some(peer) = hub.peer_by_cid(&cid) else {
                        return;
                    };
                    callbacks.search_result(
                        &self.handle,
                        &SearchResult {
                            peer_nick: peer.nick.clone(),
                            path,
                            size,
                            is_directory: false,
                            tth,
                            free_slots,
                            total_slots: 0,
                        },
                    );
                }
            }
        }
    }

    // ---- ticks and close ----

    fn handle_tick(&mut self) {
        let timeout = self.conf.invite_timeout();
        let expired: Vec<String> = self
            .invites
            .iter()
            .filter(|(_, inv)| inv.created.elapsed() > timeout)
            .map(|(nick, _)| nick.clone())
            .collect();
        for nick in expired {
            tracing::debug!("peer invite for {} expired", nick);
            if let Some(invite) = self.invites.remove(&nick) {
                if let Some(token) = invite.token {
                    self.adc_tokens.remove(&token);
                }
            }
        }
        if self.hub_refreshed.elapsed() >= HUB_REFRESH_INTERVAL {
            self.hub_refreshed = Instant::now();
            if let Some(hub) = &mut self.hub {
                hub.refresh();
            }
        }
    }

    fn begin_close(&mut self, callbacks: &mut Callbacks) {
        if self.closing {
            return;
        }
        tracing::info!("client closing");
        self.closing = true;
        let _ = self.shutdown_tx.send(true);
        if let Some(hub) = &mut self.hub {
            hub.close();
        }
        // dropping the writer sender terminates the hub writer task
        self.hub_writer = None;
        self.hub = None;

        // every outstanding download, queued or in flight, reports Cancelled
        for conf in self.downloads.drain() {
            callbacks.download_error(
                &self.handle,
                &DownloadError {
                    conf,
                    error: DcError::Cancelled,
                },
            );
        }
        self.invites.clear();
        self.adc_tokens.clear();
    }
}

/// Sniff the dialect of an inbound connection from its opening bytes:
/// legacy peers lead with `$MyNick`, the newer dialect with `CSUP`.
async fn prepare_inbound(
    tcp: TcpStream,
    tls: Option<Arc<TlsContext>>,
    hub_dialect: Dialect,
    timeouts: (Duration, Duration),
) -> Result<(FramedConn, Dialect)> {
    use tokio::io::AsyncReadExt;
    let mut stream = match tls {
        Some(ctx) => ctx.accept(tcp).await?,
        None => NetStream::Plain(tcp),
    };
    let mut first = [0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut first))
        .await
        .map_err(|_| DcError::Timeout)??;
    if n == 0 {
        return Err(DcError::ConnClosed);
    }
    let dialect = match first[0] {
        b'$' => Dialect::Nmdc,
        b'C' => Dialect::Adc,
        _ => hub_dialect,
    };
    let mut conn = FramedConn::with_timeouts(stream, dialect.delimiter(), timeouts.0, timeouts.1);
    conn.unread(&first[..n]);
    Ok((conn, dialect))
}
