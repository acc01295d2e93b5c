//! Peer connection state machine
//!
//! One task per direct connection, inbound or outbound, plain or TLS. The
//! task owns its framed connection exclusively: it performs the handshake
//! and direction election, then services either uploads or downloads,
//! round-tripping every shared-state decision (identity, slot grants, job
//! assignment) to the control task through typed request events.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};

use dunlin_core::adc::{sta_codes, AdcBody, AdcHeader, AdcMessage};
use dunlin_core::conn::FramedConn;
use dunlin_core::error::{DcError, Result};
use dunlin_core::nmdc::NmdcMessage;
use dunlin_core::tiger::{LeafVerifier, TreeLeaves};
use dunlin_core::types::{Dialect, Direction};

use crate::download::{Download, DownloadJob, DownloadSink, LENGTH_TO_END};
use crate::upload::{Upload, UploadPlan, UploadRequest, UploadSource, UPLOAD_CHUNK};

const PEER_LOCK: &str = "EXTENDEDPROTOCOLABCABCABCABCABCABC";
const NMDC_CONN_SUPPORTS: &[&str] = &["MiniSlots", "XmlBZList", "ADCGet", "TTHL", "TTHF", "ZLIG"];
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// How this connection came to exist.
#[derive(Debug, Clone)]
pub(crate) enum ConnRole {
    Inbound,
    /// We dialed, usually in response to a connect-to-me.
    Outbound { nick_hint: Option<String> },
}

/// Commands the control task sends to a connection.
#[derive(Debug)]
pub(crate) enum PeerCmd {
    /// A download for this connection's peer was queued; wake up.
    Assign,
}

/// Answer to an identification round-trip.
#[derive(Debug)]
pub(crate) struct IdentifyAck {
    /// Resolved nickname; for ADC connections the control task maps the
    /// token or CID back to a hub peer.
    pub nick: Option<String>,
    /// Reject duplicates or unknown peers.
    pub accept: bool,
    /// We hold queued downloads for this peer.
    pub want_download: bool,
    /// The connection matches an invite we issued; in the newer dialect the
    /// inviting side is the one that gets to fetch.
    pub invited: bool,
}

/// Requests and reports from connection tasks to the control task.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    Identified {
        conn_id: u64,
        nick: Option<String>,
        cid: Option<String>,
        token: Option<String>,
        reply: oneshot::Sender<IdentifyAck>,
    },
    /// Direction election finished.
    Elected { conn_id: u64, direction: Direction },
    NextDownload {
        conn_id: u64,
        reply: oneshot::Sender<Option<DownloadJob>>,
    },
    StartUpload {
        conn_id: u64,
        request: UploadRequest,
        reply: oneshot::Sender<std::result::Result<UploadPlan, DcError>>,
    },
    UploadDone { conn_id: u64, upload: Upload },
    DownloadDone {
        conn_id: u64,
        job: DownloadJob,
        result: std::result::Result<Download, DcError>,
    },
    Closed {
        conn_id: u64,
        error: Option<DcError>,
        /// The direction tiebreakers collided; redial with fresh numbers.
        reroll: bool,
    },
}

pub(crate) struct PeerTaskConfig {
    pub conn_id: u64,
    pub dialect: Dialect,
    pub our_nick: String,
    pub disable_compression: bool,
    pub idle_timeout: Duration,
    /// ADC connect token, when this dial answers a CTM.
    pub token: Option<String>,
    pub cid_b32: String,
}

/// Messages either dialect can carry on a peer connection.
#[derive(Debug)]
enum PeerMsg {
    MyNick(String),
    Lock(String),
    Supports,
    Direction { direction: Direction, tiebreaker: u32 },
    Key,
    Sup,
    Inf { cid: Option<String>, token: Option<String> },
    Get {
        kind: String,
        path: String,
        start: u64,
        length: i64,
        compress: bool,
    },
    Snd {
        kind: String,
        path: String,
        start: u64,
        length: u64,
        compress: bool,
    },
    NoSlots,
    Error(String),
    Other,
}

fn parse_peer_frame(dialect: Dialect, raw: &[u8]) -> Result<PeerMsg> {
    match dialect {
        Dialect::Nmdc => Ok(match NmdcMessage::decode(raw)? {
            NmdcMessage::MyNick { nick } => PeerMsg::MyNick(nick),
            NmdcMessage::Lock { lock, .. } => PeerMsg::Lock(lock),
            NmdcMessage::Supports { .. } => PeerMsg::Supports,
            NmdcMessage::Direction {
                direction,
                tiebreaker,
            } => PeerMsg::Direction {
                direction,
                tiebreaker,
            },
            NmdcMessage::Key { .. } => PeerMsg::Key,
            NmdcMessage::AdcGet {
                kind,
                path,
                start,
                length,
                compress,
            } => PeerMsg::Get {
                kind,
                path,
                start,
                length,
                compress,
            },
            NmdcMessage::AdcSnd {
                kind,
                path,
                start,
                length,
                compress,
            } => PeerMsg::Snd {
                kind,
                path,
                start,
                length,
                compress,
            },
            NmdcMessage::MaxedOut => PeerMsg::NoSlots,
            NmdcMessage::Error { text } => PeerMsg::Error(text),
            _ => PeerMsg::Other,
        }),
        Dialect::Adc => {
            let msg = AdcMessage::decode(raw)?;
            Ok(match msg.body {
                AdcBody::Sup { .. } => PeerMsg::Sup,
                AdcBody::Inf { fields } => PeerMsg::Inf {
                    cid: AdcMessage::inf_field(&fields, "ID").map(str::to_string),
                    token: AdcMessage::inf_field(&fields, "TO").map(str::to_string),
                },
                AdcBody::Get {
                    kind,
                    path,
                    start,
                    length,
                    compress,
                } => PeerMsg::Get {
                    kind,
                    path,
                    start,
                    length,
                    compress,
                },
                AdcBody::Snd {
                    kind,
                    path,
                    start,
                    length,
                    compress,
                } => PeerMsg::Snd {
                    kind,
                    path,
                    start,
                    length,
                    compress,
                },
                AdcBody::Sta { code, text } => {
                    if code == sta_codes::SLOTS_FULL {
                        PeerMsg::NoSlots
                    } else {
                        PeerMsg::Error(text)
                    }
                }
                _ => PeerMsg::Other,
            })
        }
    }
}

/// Direction election. Disagreeing preferences satisfy both sides; equal
/// preferences go to the larger tiebreaker. An exact tie yields `None`:
/// both ends drop the connection and redial with fresh numbers, so every
/// completed election is a total order both sides agree on.
fn elect(mine: Direction, my_tb: u32, theirs: Direction, their_tb: u32) -> Option<Direction> {
    if mine != theirs {
        return Some(mine);
    }
    if my_tb == their_tb {
        return None;
    }
    if my_tb > their_tb {
        Some(mine)
    } else {
        Some(mine.flip())
    }
}

/// Everything the state machine needs while running.
struct PeerTask {
    cfg: PeerTaskConfig,
    conn: FramedConn,
    events: mpsc::UnboundedSender<ConnEvent>,
    commands: mpsc::Receiver<PeerCmd>,
    nick: Option<String>,
    /// The election tied; the control task should redial this peer.
    reroll: bool,
}

/// Entry point: drives the connection to completion and always reports
/// `Closed` exactly once. Cancellation comes through the shutdown watch.
pub(crate) async fn run_peer_conn(
    cfg: PeerTaskConfig,
    conn: FramedConn,
    role: ConnRole,
    events: mpsc::UnboundedSender<ConnEvent>,
    commands: mpsc::Receiver<PeerCmd>,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn_id = cfg.conn_id;
    let events_out = events.clone();
    let mut task = PeerTask {
        cfg,
        conn,
        events,
        commands,
        nick: None,
        reroll: false,
    };

    let result = tokio::select! {
        biased;
        _ = shutdown.wait_for(|v| *v) => Err(DcError::Cancelled),
        r = task.drive(role) => r,
    };

    task.conn.close().await;
    let error = match result {
        Ok(()) => None,
        Err(e) => Some(e),
    };
    if let Some(e) = &error {
        if !matches!(e, DcError::Cancelled) {
            tracing::info!("peer connection {} closed: {}", conn_id, e);
        }
    }
    let _ = events_out.send(ConnEvent::Closed {
        conn_id,
        error,
        reroll: task.reroll,
    });
}

impl PeerTask {
    async fn drive(&mut self, role: ConnRole) -> Result<()> {
        let direction = match self.cfg.dialect {
            Dialect::Nmdc => self.handshake_nmdc(&role).await?,
            Dialect::Adc => self.handshake_adc(&role).await?,
        };
        let Some(direction) = direction else {
            // both sides picked the same tiebreaker; drop the connection
            // and let the control task redial with new numbers
            tracing::debug!(
                "direction tiebreakers collided with {}, reconnecting",
                self.nick.as_deref().unwrap_or("?")
            );
            self.reroll = true;
            return Ok(());
        };
        let _ = self.events.send(ConnEvent::Elected {
            conn_id: self.cfg.conn_id,
            direction,
        });
        tracing::debug!(
            "peer {} handshake done, we {}",
            self.nick.as_deref().unwrap_or("?"),
            match direction {
                Direction::Upload => "upload",
                Direction::Download => "download",
            }
        );
        match direction {
            Direction::Download => self.download_loop().await,
            Direction::Upload => self.upload_loop().await,
        }
    }

    // ---- handshake ----

    async fn handshake_nmdc(&mut self, role: &ConnRole) -> Result<Option<Direction>> {
        if let ConnRole::Outbound { .. } = role {
            self.send_nmdc(NmdcMessage::MyNick {
                nick: self.cfg.our_nick.clone(),
            })
            .await?;
            self.send_nmdc(NmdcMessage::Lock {
                lock: PEER_LOCK.into(),
                pk: "DUNLIN".into(),
            })
            .await?;
        }

        let mut want_download = false;
        let mut my_pref = Direction::Upload;
        let my_tb: u32 = rand::thread_rng().gen();
        let mut sent_batch = false;
        let mut their_direction: Option<(Direction, u32)> = None;
        let mut got_key = false;

        loop {
            let frame = self.conn.read_frame().await?;
            match parse_peer_frame(Dialect::Nmdc, &frame)? {
                PeerMsg::MyNick(nick) => {
                    let ack = self.identify(Some(nick.clone()), None, None).await?;
                    if !ack.accept {
                        return Err(DcError::ProtocolSemantic(format!(
                            "duplicate connection from {}",
                            nick
                        )));
                    }
                    want_download = ack.want_download;
                    self.nick = Some(nick);
                }
                PeerMsg::Lock(lock) => {
                    if self.nick.is_none() {
                        return Err(DcError::ProtocolSemantic("lock before nick".into()));
                    }
                    if let ConnRole::Inbound = role {
                        self.send_nmdc(NmdcMessage::MyNick {
                            nick: self.cfg.our_nick.clone(),
                        })
                        .await?;
                        self.send_nmdc(NmdcMessage::Lock {
                            lock: PEER_LOCK.into(),
                            pk: "DUNLIN".into(),
                        })
                        .await?;
                    }
                    my_pref = if want_download {
                        Direction::Download
                    } else {
                        Direction::Upload
                    };
                    self.send_nmdc(NmdcMessage::Supports {
                        features: NMDC_CONN_SUPPORTS.iter().map(|s| s.to_string()).collect(),
                    })
                    .await?;
                    self.send_nmdc(NmdcMessage::Direction {
                        direction: my_pref,
                        tiebreaker: my_tb,
                    })
                    .await?;
                    self.send_nmdc(NmdcMessage::Key {
                        key: dunlin_core::nmdc::key_from_lock(lock.as_bytes()),
                    })
                    .await?;
                    sent_batch = true;
                }
                PeerMsg::Direction {
                    direction,
                    tiebreaker,
                } => {
                    their_direction = Some((direction, tiebreaker));
                }
                PeerMsg::Key => got_key = true,
                PeerMsg::Supports => {}
                PeerMsg::Error(text) => return Err(DcError::ProtocolSemantic(text)),
                _ => {}
            }
            if sent_batch && got_key {
                if let Some((their_pref, their_tb)) = their_direction {
                    return Ok(elect(my_pref, my_tb, their_pref, their_tb));
                }
            }
        }
    }

    async fn handshake_adc(&mut self, role: &ConnRole) -> Result<Option<Direction>> {
        let sup = AdcMessage::new(
            AdcHeader::Client,
            AdcBody::Sup {
                add: vec!["BASE".into(), "TIGR".into(), "ZLIG".into()],
                remove: vec![],
            },
        );
        let nick_hint = match role {
            ConnRole::Outbound { nick_hint } => nick_hint.clone(),
            ConnRole::Inbound => None,
        };
        if matches!(role, ConnRole::Outbound { .. }) {
            self.send_adc(sup.clone()).await?;
        }

        let mut sent_inf = false;
        loop {
            let frame = self.conn.read_frame().await?;
            match parse_peer_frame(Dialect::Adc, &frame)? {
                PeerMsg::Sup => {
                    if matches!(role, ConnRole::Inbound) {
                        self.send_adc(sup.clone()).await?;
                    }
                    let mut fields = vec![("ID".into(), self.cfg.cid_b32.clone())];
                    if let Some(token) = &self.cfg.token {
                        fields.push(("TO".into(), token.clone()));
                    }
                    self.send_adc(AdcMessage::new(
                        AdcHeader::Client,
                        AdcBody::Inf { fields },
                    ))
                    .await?;
                    sent_inf = true;
                }
                PeerMsg::Inf { cid, token } => {
                    if !sent_inf {
                        return Err(DcError::ProtocolSemantic("INF before SUP".into()));
                    }
                    // the connecting party carries the token; whichever side
                    // issued it is the inviting one
                    let token = token.or_else(|| self.cfg.token.clone());
                    let ack = self.identify(nick_hint.clone(), cid, token).await?;
                    if !ack.accept {
                        return Err(DcError::ProtocolSemantic(
                            "unknown or duplicate peer".into(),
                        ));
                    }
                    self.nick = ack.nick;
                    // no direction exchange in this dialect: the side whose
                    // invite established the connection is the fetcher
                    return Ok(Some(if ack.invited && ack.want_download {
                        Direction::Download
                    } else {
                        Direction::Upload
                    }));
                }
                PeerMsg::Error(text) => return Err(DcError::ProtocolSemantic(text)),
                _ => {}
            }
        }
    }

    async fn identify(
        &mut self,
        nick: Option<String>,
        cid: Option<String>,
        token: Option<String>,
    ) -> Result<IdentifyAck> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(ConnEvent::Identified {
                conn_id: self.cfg.conn_id,
                nick,
                cid,
                token,
                reply: tx,
            })
            .map_err(|_| DcError::ConnClosed)?;
        rx.await.map_err(|_| DcError::ConnClosed)
    }

    // ---- download side ----

    async fn download_loop(&mut self) -> Result<()> {
        loop {
            let (tx, rx) = oneshot::channel();
            self.events
                .send(ConnEvent::NextDownload {
                    conn_id: self.cfg.conn_id,
                    reply: tx,
                })
                .map_err(|_| DcError::ConnClosed)?;
            let job = rx.await.map_err(|_| DcError::ConnClosed)?;

            let Some(job) = job else {
                // nothing queued: stay connected until assigned or idle
                match tokio::time::timeout(self.cfg.idle_timeout, self.commands.recv()).await {
                    Ok(Some(PeerCmd::Assign)) => continue,
                    Ok(None) => return Ok(()),
                    Err(_) => return Ok(()),
                }
            };

            let result = self.run_download(&job).await;
            let fatal = matches!(
                &result,
                Err(DcError::Integrity(_)) | Err(DcError::ConnClosed) | Err(DcError::Timeout)
            );
            let failed = result.is_err();
            let _ = self.events.send(ConnEvent::DownloadDone {
                conn_id: self.cfg.conn_id,
                job,
                result,
            });
            if fatal {
                // close defensively; the peer's stream position is unknown
                return Err(DcError::ConnClosed);
            }
            if failed {
                continue;
            }
        }
    }

    async fn run_download(&mut self, job: &DownloadJob) -> Result<Download> {
        let conf = &job.conf;
        let want_zlib = !self.cfg.disable_compression;
        let subject = format!("TTH/{}", conf.tth);

        // whole-file transfers fetch the leaf list first for verification
        let whole_file = conf.start == 0 && conf.length == LENGTH_TO_END;
        let leaf_bytes = if conf.verify && whole_file {
            Some(self.fetch_leaves(&subject, want_zlib).await?)
        } else {
            None
        };

        self.send_get("file", &subject, conf.start, conf.length, want_zlib)
            .await?;
        let (length, compress) = self.expect_snd("file", &subject, conf.start).await?;
        if compress {
            self.conn.activate_read_zlib();
        }

        let mut verifier = match leaf_bytes {
            Some(bytes) => Some(LeafVerifier::new(TreeLeaves::from_wire(
                &bytes, length, &conf.tth,
            )?)),
            None => None,
        };

        let mut sink = DownloadSink::open(conf).await?;
        let counters = self.conn.counters();
        counters.pull_read();
        let mut received: u64 = 0;
        let mut last_report = Instant::now();
        while received < length {
            let chunk = self.conn.read_binary().await?;
            let take = (length - received).min(chunk.len() as u64) as usize;
            sink.write(&chunk[..take]).await?;
            if let Some(v) = verifier.as_mut() {
                v.update(&chunk[..take])?;
            }
            received += take as u64;
            if take < chunk.len() {
                self.conn.unread(&chunk[take..]);
            }
            if last_report.elapsed() >= PROGRESS_INTERVAL {
                let rate = counters.pull_read() as f64 / last_report.elapsed().as_secs_f64();
                last_report = Instant::now();
                tracing::info!(
                    "received {}/{} from {} ({:.0} B/s)",
                    received,
                    length,
                    self.nick.as_deref().unwrap_or("?"),
                    rate
                );
            }
        }
        if let Some(v) = verifier.take() {
            v.finish()?;
        }
        let content = sink.finish().await?;
        tracing::info!(
            "download finished: {} ({} bytes) from {}",
            conf.tth,
            received,
            self.nick.as_deref().unwrap_or("?")
        );
        Ok(Download {
            conf: conf.clone(),
            size: received,
            content,
        })
    }

    async fn fetch_leaves(&mut self, subject: &str, want_zlib: bool) -> Result<Vec<u8>> {
        self.send_get("tthl", subject, 0, LENGTH_TO_END, want_zlib)
            .await?;
        let (length, compress) = self.expect_snd("tthl", subject, 0).await?;
        if compress {
            self.conn.activate_read_zlib();
        }
        let mut bytes = Vec::with_capacity(length as usize);
        while (bytes.len() as u64) < length {
            let chunk = self.conn.read_binary().await?;
            let take = (length as usize - bytes.len()).min(chunk.len());
            bytes.extend_from_slice(&chunk[..take]);
            if take < chunk.len() {
                self.conn.unread(&chunk[take..]);
            }
        }
        Ok(bytes)
    }

    async fn send_get(
        &mut self,
        kind: &str,
        path: &str,
        start: u64,
        length: i64,
        compress: bool,
    ) -> Result<()> {
        match self.cfg.dialect {
            Dialect::Nmdc => {
                self.send_nmdc(NmdcMessage::AdcGet {
                    kind: kind.into(),
                    path: path.into(),
                    start,
                    length,
                    compress,
                })
                .await
            }
            Dialect::Adc => {
                self.send_adc(AdcMessage::new(
                    AdcHeader::Client,
                    AdcBody::Get {
                        kind: kind.into(),
                        path: path.into(),
                        start,
                        length,
                        compress,
                    },
                ))
                .await
            }
        }
    }

    async fn expect_snd(&mut self, kind: &str, path: &str, start: u64) -> Result<(u64, bool)> {
        let frame = self.conn.read_frame().await?;
        match parse_peer_frame(self.cfg.dialect, &frame)? {
            PeerMsg::Snd {
                kind: k,
                path: p,
                start: s,
                length,
                compress,
            } => {
                if k != kind || p != path || s != start {
                    return Err(DcError::ProtocolSemantic(format!(
                        "mismatched reply for {} {}",
                        kind, path
                    )));
                }
                Ok((length, compress))
            }
            PeerMsg::NoSlots => Err(DcError::NoSlots),
            PeerMsg::Error(text) => Err(DcError::NotFound(text)),
            other => Err(DcError::ProtocolSemantic(format!(
                "expected transfer reply, got {:?}",
                other
            ))),
        }
    }

    // ---- upload side ----

    async fn upload_loop(&mut self) -> Result<()> {
        loop {
            let frame =
                match tokio::time::timeout(self.cfg.idle_timeout, self.conn.read_frame()).await {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Ok(()),
                };
            let msg = parse_peer_frame(self.cfg.dialect, &frame)?;
            let PeerMsg::Get {
                kind,
                path,
                start,
                length,
                compress,
            } = msg
            else {
                continue;
            };
            let nick = self.nick.clone().unwrap_or_default();
            let request = match UploadRequest::parse(&nick, &kind, &path, start, length, compress)
            {
                Ok(r) => r,
                Err(e) => {
                    self.send_upload_error(&e).await?;
                    continue;
                }
            };

            let (tx, rx) = oneshot::channel();
            self.events
                .send(ConnEvent::StartUpload {
                    conn_id: self.cfg.conn_id,
                    request: request.clone(),
                    reply: tx,
                })
                .map_err(|_| DcError::ConnClosed)?;
            let plan = match rx.await.map_err(|_| DcError::ConnClosed)? {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::info!("upload rejected for {}: {}", request.describe(), e);
                    self.send_upload_error(&e).await?;
                    continue;
                }
            };

            tracing::info!(
                "upload request {} from {} (start={} length={})",
                request.describe(),
                nick,
                start,
                plan.length
            );
            let result = self.run_upload(&kind, &path, start, &plan).await;
            let sent = match &result {
                Ok(sent) => *sent,
                Err(_) => 0,
            };
            let done = Upload {
                peer: nick,
                request,
                sent,
                length: plan.length,
                result: result.as_ref().map(|_| ()).map_err(clone_err),
            };
            let failed = done.result.is_err();
            let _ = self.events.send(ConnEvent::UploadDone {
                conn_id: self.cfg.conn_id,
                upload: done,
            });
            if failed {
                return result.map(|_| ());
            }
        }
    }

    async fn run_upload(
        &mut self,
        kind: &str,
        path: &str,
        start: u64,
        plan: &UploadPlan,
    ) -> Result<u64> {
        match self.cfg.dialect {
            Dialect::Nmdc => {
                self.send_nmdc(NmdcMessage::AdcSnd {
                    kind: kind.into(),
                    path: path.into(),
                    start,
                    length: plan.length,
                    compress: plan.compress,
                })
                .await?
            }
            Dialect::Adc => {
                self.send_adc(AdcMessage::new(
                    AdcHeader::Client,
                    AdcBody::Snd {
                        kind: kind.into(),
                        path: path.into(),
                        start,
                        length: plan.length,
                        compress: plan.compress,
                    },
                ))
                .await?
            }
        }

        self.conn.set_write_zlib(plan.compress).await?;
        let counters = self.conn.counters();
        counters.pull_write();
        let mut sent: u64 = 0;
        let mut last_report = Instant::now();

        match &plan.source {
            UploadSource::Bytes(bytes) => {
                for chunk in bytes.chunks(UPLOAD_CHUNK) {
                    self.conn.write_binary(chunk).await?;
                    sent += chunk.len() as u64;
                }
            }
            UploadSource::File { path, start } => {
                use tokio::io::{AsyncReadExt, AsyncSeekExt};
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(*start)).await?;
                let mut buf = vec![0u8; UPLOAD_CHUNK];
                while sent < plan.length {
                    let want = (plan.length - sent).min(UPLOAD_CHUNK as u64) as usize;
                    let n = file.read(&mut buf[..want]).await?;
                    if n == 0 {
                        return Err(DcError::ConnClosed);
                    }
                    self.conn.write_binary(&buf[..n]).await?;
                    sent += n as u64;
                    if last_report.elapsed() >= PROGRESS_INTERVAL {
                        let rate =
                            counters.pull_write() as f64 / last_report.elapsed().as_secs_f64();
                        last_report = Instant::now();
                        tracing::info!(
                            "sent {}/{} to {} ({:.0} B/s)",
                            sent,
                            plan.length,
                            self.nick.as_deref().unwrap_or("?"),
                            rate
                        );
                    }
                }
            }
        }

        self.conn.set_write_zlib(false).await?;
        tracing::info!(
            "upload finished: {} bytes to {}",
            sent,
            self.nick.as_deref().unwrap_or("?")
        );
        Ok(sent)
    }

    async fn send_upload_error(&mut self, err: &DcError) -> Result<()> {
        match self.cfg.dialect {
            Dialect::Nmdc => match err {
                DcError::NoSlots => self.send_nmdc(NmdcMessage::MaxedOut).await,
                _ => {
                    self.send_nmdc(NmdcMessage::Error {
                        text: err.to_string(),
                    })
                    .await
                }
            },
            Dialect::Adc => {
                let code = match err {
                    DcError::NoSlots => sta_codes::SLOTS_FULL,
                    _ => sta_codes::FILE_NOT_AVAILABLE,
                };
                self.send_adc(AdcMessage::new(
                    AdcHeader::Client,
                    AdcBody::Sta {
                        code: code.to_string(),
                        text: err.to_string(),
                    },
                ))
                .await
            }
        }
    }

    async fn send_nmdc(&mut self, msg: NmdcMessage) -> Result<()> {
        self.conn.write_frame(&msg.encode()).await
    }

    async fn send_adc(&mut self, msg: AdcMessage) -> Result<()> {
        self.conn.write_frame(&msg.encode()).await
    }
}

pub(crate) fn clone_err(e: &DcError) -> DcError {
    match e {
        DcError::Timeout => DcError::Timeout,
        DcError::NoSlots => DcError::NoSlots,
        DcError::Cancelled => DcError::Cancelled,
        DcError::ConnClosed => DcError::ConnClosed,
        DcError::UnsupportedRange => DcError::UnsupportedRange,
        DcError::RangeTooBig => DcError::RangeTooBig,
        DcError::AuthRejected => DcError::AuthRejected,
        DcError::ConfigInvalid(s) => DcError::ConfigInvalid(s.clone()),
        DcError::NetworkUnreachable(s) => DcError::NetworkUnreachable(s.clone()),
        DcError::TlsHandshake(s) => DcError::TlsHandshake(s.clone()),
        DcError::ProtocolFraming(s) => DcError::ProtocolFraming(s.clone()),
        DcError::ProtocolSyntax(s) => DcError::ProtocolSyntax(s.clone()),
        DcError::ProtocolSemantic(s) => DcError::ProtocolSemantic(s.clone()),
        DcError::NotFound(s) => DcError::NotFound(s.clone()),
        DcError::Integrity(s) => DcError::Integrity(s.clone()),
        DcError::Internal(s) => DcError::Internal(s.clone()),
        DcError::Io(e) => DcError::Internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dunlin_core::conn::NetStream;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn election_total_order() {
        use Direction::*;
        // disagreeing preferences: the downloader wins on both sides
        assert_eq!(elect(Download, 1, Upload, 9).unwrap(), Download);
        assert_eq!(elect(Upload, 9, Download, 1).unwrap(), Upload);
        // agreeing preferences: larger tiebreaker keeps its wish
        assert_eq!(elect(Download, 5, Download, 3).unwrap(), Download);
        assert_eq!(elect(Download, 3, Download, 5).unwrap(), Upload);
        assert_eq!(elect(Upload, 9, Upload, 4).unwrap(), Upload);
        assert_eq!(elect(Upload, 4, Upload, 9).unwrap(), Download);
        // both sides always elect complementary roles
        for (a, b) in [(Download, Download), (Upload, Upload), (Download, Upload)] {
            let left = elect(a, 7, b, 2).unwrap();
            let right = elect(b, 2, a, 7).unwrap();
            assert_ne!(left, right);
        }
        // an exact tie decides nothing; both sides reconnect instead
        assert!(elect(Download, 5, Download, 5).is_none());
        assert!(elect(Upload, 5, Upload, 5).is_none());
    }

    #[test]
    fn sta_codes_map_to_errors() {
        let frame = b"CSTA 153 no\\sslots";
        match parse_peer_frame(Dialect::Adc, frame).unwrap() {
            PeerMsg::NoSlots => {}
            other => panic!("unexpected: {:?}", other),
        }
        let frame = b"CSTA 151 gone";
        assert!(matches!(
            parse_peer_frame(Dialect::Adc, frame).unwrap(),
            PeerMsg::Error(_)
        ));
    }

    async fn tcp_pair() -> (FramedConn, FramedConn) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (
            FramedConn::new(NetStream::Plain(client), b'|'),
            FramedConn::new(NetStream::Plain(server), b'|'),
        )
    }

    fn task_config(conn_id: u64, nick: &str) -> PeerTaskConfig {
        PeerTaskConfig {
            conn_id,
            dialect: Dialect::Nmdc,
            our_nick: nick.into(),
            disable_compression: false,
            idle_timeout: Duration::from_millis(300),
            token: None,
            cid_b32: String::new(),
        }
    }

    /// Answers control-task requests the way the client would, with no
    /// downloads queued on either side.
    async fn idle_control(mut rx: mpsc::UnboundedReceiver<ConnEvent>) -> Vec<Direction> {
        let mut elected = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ConnEvent::Identified { nick, reply, .. } => {
                    let _ = reply.send(IdentifyAck {
                        nick,
                        accept: true,
                        want_download: false,
                        invited: false,
                    });
                }
                ConnEvent::NextDownload { reply, .. } => {
                    let _ = reply.send(None);
                }
                ConnEvent::Elected { direction, .. } => elected.push(direction),
                ConnEvent::Closed { .. } => break,
                _ => {}
            }
        }
        elected
    }

    #[tokio::test]
    async fn nmdc_handshake_elects_complementary_roles() {
        let (conn_a, conn_b) = tcp_pair().await;
        let (ev_a_tx, ev_a_rx) = mpsc::unbounded_channel();
        let (ev_b_tx, ev_b_rx) = mpsc::unbounded_channel();
        let (_cmd_a_tx, cmd_a_rx) = mpsc::channel(4);
        let (_cmd_b_tx, cmd_b_rx) = mpsc::channel(4);
        let (_shut_tx, shut_rx) = watch::channel(false);

        let a = tokio::spawn(run_peer_conn(
            task_config(1, "alice"),
            conn_a,
            ConnRole::Outbound { nick_hint: None },
            ev_a_tx,
            cmd_a_rx,
            shut_rx.clone(),
        ));
        let b = tokio::spawn(run_peer_conn(
            task_config(2, "bob"),
            conn_b,
            ConnRole::Inbound,
            ev_b_tx,
            cmd_b_rx,
            shut_rx,
        ));
        let (roles_a, roles_b) = tokio::join!(idle_control(ev_a_rx), idle_control(ev_b_rx));
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(roles_a.len(), 1);
        assert_eq!(roles_b.len(), 1);
        assert_ne!(roles_a[0], roles_b[0]);
    }
}
