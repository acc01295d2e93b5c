//! Hub session state machine
//!
//! Owned by the control task. A pump task feeds raw frames in; the session
//! mutates its peer directory, queues outbound frames on the writer channel,
//! and returns the events the client surfaces or acts on. Both dialects are
//! driven through the same typed event set.

use std::net::{IpAddr, SocketAddr};

use data_encoding::BASE32_NOPAD;
use tiger::{Digest, Tiger};
use tokio::sync::mpsc;

use dunlin_core::adc::{AdcBody, AdcHeader, AdcMessage, AdcSearch};
use dunlin_core::error::{DcError, Result};
use dunlin_core::nmdc::{self, NmdcMessage, SearchOrigin};
use dunlin_core::tiger::TigerHash;
use dunlin_core::types::{Dialect, Peer, SearchQuery, SearchResult};

const NMDC_SUPPORTS: &[&str] = &["NoHello", "NoGetINFO", "UserIP2", "TTHSearch"];
const ADC_FEATURES: &[&str] = &["BASE", "TIGR"];
const CLIENT_TAG: &str = concat!("dunlin V:", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HubState {
    Handshaking,
    Authenticating,
    Registered,
    Operating,
    Closed,
}

/// Where a search reply should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SearchReply {
    /// Active requester, direct UDP datagram.
    Udp(SocketAddr),
    /// Passive requester, routed back through the hub. Carries the nick on
    /// legacy hubs and the session id on ADC.
    Hub(String),
}

#[derive(Debug)]
pub(crate) enum HubEvent {
    /// Registration finished; the session may now use the hub.
    Registered,
    /// The full user list arrived.
    Operating,
    PeerConnected(Peer),
    PeerUpdated(Peer),
    PeerDisconnected(Peer),
    ChatPublic { nick: String, text: String },
    ChatPrivate { nick: String, text: String },
    SearchRequest { reply: SearchReply, query: SearchQuery },
    SearchResult(SearchResult),
    /// A peer asks us to dial it.
    ConnectToMe {
        nick: Option<String>,
        addr: SocketAddr,
        tls: bool,
        token: Option<String>,
    },
    /// A passive peer asks us to send a connect-to-me back.
    RevConnectToMe { nick: String, token: Option<String> },
    HubName(String),
}

/// Static parts of the session identity.
pub(crate) struct HubIdentity {
    pub nick: String,
    pub password: String,
    pub description: String,
    pub passive: bool,
    pub tls_capable: bool,
    pub udp_port: u16,
}

pub(crate) struct HubSession {
    dialect: Dialect,
    state: HubState,
    identity: HubIdentity,
    /// Address advertised to peers, set once the hub socket reveals it.
    pub advertised_ip: Option<IpAddr>,
    share_size: u64,
    slots_total: u32,
    slots_free: u32,
    peers: Vec<Peer>,
    hub_name: String,
    my_sid: String,
    cid: [u8; 24],
    pid: [u8; 24],
    search_token: u32,
    writer: mpsc::UnboundedSender<Vec<u8>>,
}

impl HubSession {
    /// `pid` is the client's private id; the public `cid` derives from it
    /// and must match the one peer connections present.
    pub fn new(
        dialect: Dialect,
        identity: HubIdentity,
        pid: [u8; 24],
        writer: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let cid: [u8; 24] = Tiger::digest(pid).into();
        HubSession {
            dialect,
            state: HubState::Handshaking,
            identity,
            advertised_ip: None,
            share_size: 0,
            slots_total: 1,
            slots_free: 1,
            peers: Vec::new(),
            hub_name: String::new(),
            my_sid: String::new(),
            cid,
            pid,
            search_token: 0,
            writer,
        }
    }

    pub fn state(&self) -> HubState {
        self.state
    }

    pub fn hub_name(&self) -> &str {
        &self.hub_name
    }

    pub fn nick(&self) -> &str {
        &self.identity.nick
    }

    pub fn peer(&self, nick: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.nick == nick)
    }

    /// Match an ADC client id as presented on a direct connection or a UDP
    /// search reply.
    pub fn peer_by_cid(&self, cid: &str) -> Option<&Peer> {
        self.peers
            .iter()
            .find(|p| !p.adc_cid.is_empty() && p.adc_cid == cid)
    }

    pub fn update_share(&mut self, share_size: u64, slots_total: u32, slots_free: u32) {
        self.share_size = share_size;
        self.slots_total = slots_total;
        self.slots_free = slots_free;
        if self.state == HubState::Operating {
            self.send_my_info();
        }
    }

    /// Periodic keepalive; hubs drop silent clients.
    pub fn refresh(&mut self) {
        if self.state == HubState::Operating {
            self.send_my_info();
        }
    }

    /// Kick off the client side of the handshake. Legacy hubs speak first.
    pub fn start(&mut self) {
        if self.dialect == Dialect::Adc {
            self.send_adc(AdcMessage::new(
                AdcHeader::Hub,
                AdcBody::Sup {
                    add: ADC_FEATURES.iter().map(|s| s.to_string()).collect(),
                    remove: vec![],
                },
            ));
        }
    }

    pub fn close(&mut self) {
        self.state = HubState::Closed;
    }

    // ---- outbound operations ----

    pub fn chat_public(&mut self, text: &str) {
        match self.dialect {
            Dialect::Nmdc => self.send_nmdc(NmdcMessage::ChatPublic {
                nick: self.identity.nick.clone(),
                text: text.to_string(),
            }),
            Dialect::Adc => self.send_adc(AdcMessage::new(
                AdcHeader::Broadcast {
                    sid: self.my_sid.clone(),
                },
                AdcBody::Msg {
                    text: text.to_string(),
                    pm: None,
                },
            )),
        }
    }

    pub fn chat_private(&mut self, to: &str, text: &str) -> Result<()> {
        match self.dialect {
            Dialect::Nmdc => {
                self.send_nmdc(NmdcMessage::PrivateMessage {
                    to: to.to_string(),
                    from: self.identity.nick.clone(),
                    text: text.to_string(),
                });
                Ok(())
            }
            Dialect::Adc => {
                let sid = self.sid_of(to)?;
                let msg = AdcMessage::new(
                    AdcHeader::Direct {
                        from: self.my_sid.clone(),
                        to: sid,
                    },
                    AdcBody::Msg {
                        text: text.to_string(),
                        pm: Some(self.my_sid.clone()),
                    },
                );
                self.send_adc(msg);
                Ok(())
            }
        }
    }

    pub fn search(&mut self, query: &SearchQuery) {
        match self.dialect {
            Dialect::Nmdc => {
                let origin = if self.identity.passive {
                    SearchOrigin::Passive(self.identity.nick.clone())
                } else if let Some(ip) = self.advertised_ip {
                    SearchOrigin::Active(SocketAddr::new(ip, self.identity.udp_port))
                } else {
                    SearchOrigin::Passive(self.identity.nick.clone())
                };
                self.send_nmdc(NmdcMessage::Search {
                    origin,
                    query: query.clone(),
                });
            }
            Dialect::Adc => {
                self.search_token += 1;
                let token = format!("S{}", self.search_token);
                let body = match query {
                    SearchQuery::Tth(tth) => AdcBody::Sch(AdcSearch {
                        tth: Some(*tth),
                        token: Some(token),
                        ..Default::default()
                    }),
                    SearchQuery::Name {
                        text,
                        min_size,
                        max_size,
                    } => AdcBody::Sch(AdcSearch {
                        includes: text.split_whitespace().map(str::to_string).collect(),
                        min_size: *min_size,
                        max_size: *max_size,
                        tth: None,
                        token: Some(token),
                    }),
                };
                let msg = AdcMessage::new(
                    AdcHeader::Broadcast {
                        sid: self.my_sid.clone(),
                    },
                    body,
                );
                self.send_adc(msg);
            }
        }
    }

    /// Reply to a passive requester through the hub.
    pub fn search_reply_via_hub(&mut self, target: &str, hit: &SearchResult) {
        match self.dialect {
            Dialect::Nmdc => {
                let msg = self.nmdc_search_result(hit, Some(target.to_string()));
                self.send_nmdc(msg);
            }
            Dialect::Adc => {
                let msg = AdcMessage::new(
                    AdcHeader::Direct {
                        from: self.my_sid.clone(),
                        to: target.to_string(),
                    },
                    AdcBody::Res {
                        path: hit.path.clone(),
                        size: hit.size,
                        free_slots: hit.free_slots,
                        tth: hit.tth,
                        token: None,
                    },
                );
                self.send_adc(msg);
            }
        }
    }

    /// Datagram for an active requester, sent by the caller over UDP.
    pub fn search_reply_datagram(&self, hit: &SearchResult) -> Vec<u8> {
        match self.dialect {
            Dialect::Nmdc => {
                let mut bytes = self.nmdc_search_result(hit, None).encode();
                bytes.push(b'|');
                bytes
            }
            Dialect::Adc => {
                let mut bytes = AdcMessage::new(
                    AdcHeader::Udp {
                        cid: BASE32_NOPAD.encode(&self.cid),
                    },
                    AdcBody::Res {
                        path: hit.path.clone(),
                        size: hit.size,
                        free_slots: hit.free_slots,
                        tth: hit.tth,
                        token: None,
                    },
                )
                .encode();
                bytes.push(b'\n');
                bytes
            }
        }
    }

    fn nmdc_search_result(&self, hit: &SearchResult, target: Option<String>) -> NmdcMessage {
        NmdcMessage::SearchResult {
            nick: self.identity.nick.clone(),
            path: hit.path.clone(),
            size: hit.size,
            is_directory: hit.is_directory,
            free_slots: hit.free_slots,
            total_slots: hit.total_slots,
            tth: hit.tth,
            hub_name: if hit.tth.is_some() {
                String::new()
            } else {
                self.hub_name.clone()
            },
            target_nick: target,
        }
    }

    /// Ask `nick` to dial us at `addr`.
    pub fn send_connect_to_me(&mut self, nick: &str, port: u16, tls: bool, token: &str) -> Result<()> {
        match self.dialect {
            Dialect::Nmdc => {
                let ip = self
                    .advertised_ip
                    .ok_or_else(|| DcError::Internal("no advertised ip".into()))?;
                self.send_nmdc(NmdcMessage::ConnectToMe {
                    target: nick.to_string(),
                    address: SocketAddr::new(ip, port),
                    tls,
                });
                Ok(())
            }
            Dialect::Adc => {
                let sid = self.sid_of(nick)?;
                let proto = if tls { "ADCS/0.10" } else { "ADC/1.0" };
                let msg = AdcMessage::new(
                    AdcHeader::Direct {
                        from: self.my_sid.clone(),
                        to: sid,
                    },
                    AdcBody::Ctm {
                        proto: proto.to_string(),
                        port,
                        token: token.to_string(),
                    },
                );
                self.send_adc(msg);
                Ok(())
            }
        }
    }

    /// Ask active `nick` to send a connect-to-me back to us.
    pub fn send_rev_connect_to_me(&mut self, nick: &str, tls: bool, token: &str) -> Result<()> {
        match self.dialect {
            Dialect::Nmdc => {
                self.send_nmdc(NmdcMessage::RevConnectToMe {
                    from: self.identity.nick.clone(),
                    to: nick.to_string(),
                });
                Ok(())
            }
            Dialect::Adc => {
                let sid = self.sid_of(nick)?;
                let proto = if tls { "ADCS/0.10" } else { "ADC/1.0" };
                let msg = AdcMessage::new(
                    AdcHeader::Direct {
                        from: self.my_sid.clone(),
                        to: sid,
                    },
                    AdcBody::Rcm {
                        proto: proto.to_string(),
                        token: token.to_string(),
                    },
                );
                self.send_adc(msg);
                Ok(())
            }
        }
    }

    // ---- inbound ----

    pub fn handle_frame(&mut self, raw: &[u8]) -> Result<Vec<HubEvent>> {
        match self.dialect {
            Dialect::Nmdc => {
                let msg = NmdcMessage::decode(raw)?;
                self.handle_nmdc(msg)
            }
            Dialect::Adc => {
                let msg = AdcMessage::decode(raw)?;
                self.handle_adc(msg)
            }
        }
    }

    fn handle_nmdc(&mut self, msg: NmdcMessage) -> Result<Vec<HubEvent>> {
        let mut events = Vec::new();
        match msg {
            NmdcMessage::Lock { lock, .. } => {
                self.send_nmdc(NmdcMessage::Supports {
                    features: NMDC_SUPPORTS.iter().map(|s| s.to_string()).collect(),
                });
                self.send_nmdc(NmdcMessage::Key {
                    key: nmdc::key_from_lock(lock.as_bytes()),
                });
                self.send_nmdc(NmdcMessage::ValidateNick {
                    nick: self.identity.nick.clone(),
                });
            }
            NmdcMessage::GetPass => {
                if self.identity.password.is_empty() {
                    return Err(DcError::AuthRejected);
                }
                self.state = HubState::Authenticating;
                self.send_nmdc(NmdcMessage::MyPass {
                    password: self.identity.password.clone(),
                });
            }
            NmdcMessage::BadPass => return Err(DcError::AuthRejected),
            NmdcMessage::ValidateDenide { .. } => return Err(DcError::AuthRejected),
            NmdcMessage::Hello { nick } => {
                if nick == self.identity.nick {
                    self.send_nmdc(NmdcMessage::Version {
                        version: "1,0091".into(),
                    });
                    self.send_nmdc(NmdcMessage::GetNickList);
                    self.send_my_info();
                    self.state = HubState::Registered;
                    events.push(HubEvent::Registered);
                } else if self.peer(&nick).is_none() {
                    // mode unknown until the info message arrives
                    let peer = Peer {
                        nick,
                        is_active: true,
                        ..Peer::default()
                    };
                    self.peers.push(peer.clone());
                    events.push(HubEvent::PeerConnected(peer));
                }
            }
            NmdcMessage::MyInfo {
                nick,
                description,
                client_tag,
                email,
                share_size,
                ..
            } => {
                if nick == self.identity.nick {
                    return Ok(events);
                }
                let is_active = !client_tag.contains("M:P");
                match self.peers.iter_mut().find(|p| p.nick == nick) {
                    Some(peer) => {
                        peer.description = description;
                        peer.client_tag = client_tag;
                        peer.email = email;
                        peer.share_size = share_size;
                        peer.is_active = is_active;
                        events.push(HubEvent::PeerUpdated(peer.clone()));
                    }
                    None => {
                        let peer = Peer {
                            nick,
                            description,
                            client_tag,
                            email,
                            share_size,
                            is_active,
                            ..Peer::default()
                        };
                        self.peers.push(peer.clone());
                        events.push(HubEvent::PeerConnected(peer));
                    }
                }
            }
            NmdcMessage::NickList { nicks } => {
                for nick in nicks {
                    if nick != self.identity.nick && self.peer(&nick).is_none() {
                        let peer = Peer {
                            nick,
                            is_active: true,
                            ..Peer::default()
                        };
                        self.peers.push(peer.clone());
                        events.push(HubEvent::PeerConnected(peer));
                    }
                }
                if self.state == HubState::Registered {
                    self.state = HubState::Operating;
                    events.push(HubEvent::Operating);
                }
            }
            NmdcMessage::OpList { nicks } => {
                for nick in nicks {
                    if let Some(peer) = self.peers.iter_mut().find(|p| p.nick == nick) {
                        if !peer.is_operator {
                            peer.is_operator = true;
                            events.push(HubEvent::PeerUpdated(peer.clone()));
                        }
                    }
                }
            }
            NmdcMessage::Quit { nick } => {
                if let Some(pos) = self.peers.iter().position(|p| p.nick == nick) {
                    events.push(HubEvent::PeerDisconnected(self.peers.remove(pos)));
                }
            }
            NmdcMessage::HubName { name } => {
                self.hub_name = name.clone();
                events.push(HubEvent::HubName(name));
            }
            NmdcMessage::ChatPublic { nick, text } => {
                events.push(HubEvent::ChatPublic { nick, text });
            }
            NmdcMessage::PrivateMessage { from, text, .. } => {
                events.push(HubEvent::ChatPrivate { nick: from, text });
            }
            NmdcMessage::Search { origin, query } => {
                let reply = match origin {
                    SearchOrigin::Passive(nick) => {
                        if nick == self.identity.nick {
                            return Ok(events);
                        }
                        SearchReply::Hub(nick)
                    }
                    SearchOrigin::Active(addr) => {
                        if Some(addr.ip()) == self.advertised_ip
                            && addr.port() == self.identity.udp_port
                        {
                            return Ok(events);
                        }
                        SearchReply::Udp(addr)
                    }
                };
                events.push(HubEvent::SearchRequest { reply, query });
            }
            NmdcMessage::SearchResult {
                nick,
                path,
                size,
                is_directory,
                free_slots,
                total_slots,
                tth,
                ..
            } => {
                events.push(HubEvent::SearchResult(SearchResult {
                    peer_nick: nick,
                    path,
                    size,
                    is_directory,
                    tth,
                    free_slots,
                    total_slots,
                }));
            }
            NmdcMessage::ConnectToMe { target, address, tls } => {
                if target == self.identity.nick {
                    events.push(HubEvent::ConnectToMe {
                        nick: None,
                        addr: address,
                        tls,
                        token: None,
                    });
                }
            }
            NmdcMessage::RevConnectToMe { from, to } => {
                if to == self.identity.nick {
                    events.push(HubEvent::RevConnectToMe {
                        nick: from,
                        token: None,
                    });
                }
            }
            NmdcMessage::Supports { .. } | NmdcMessage::Version { .. } => {}
            other => {
                tracing::debug!("unhandled hub message: {:?}", other);
            }
        }
        Ok(events)
    }

    fn handle_adc(&mut self, msg: AdcMessage) -> Result<Vec<HubEvent>> {
        let mut events = Vec::new();
        match (&msg.header, msg.body) {
            (AdcHeader::Info, AdcBody::Sup { .. }) => {}
            (AdcHeader::Info, AdcBody::Sid { sid }) => {
                self.my_sid = sid;
                self.send_own_inf();
            }
            (AdcHeader::Info, AdcBody::Gpa { data }) => {
                if self.identity.password.is_empty() {
                    return Err(DcError::AuthRejected);
                }
                self.state = HubState::Authenticating;
                let nonce = BASE32_NOPAD
                    .decode(data.as_bytes())
                    .map_err(|_| DcError::ProtocolSyntax("bad GPA data".into()))?;
                let mut hasher = Tiger::new();
                hasher.update(self.identity.password.as_bytes());
                hasher.update(&nonce);
                let digest: [u8; 24] = hasher.finalize().into();
                let msg = AdcMessage::new(
                    AdcHeader::Hub,
                    AdcBody::Pas {
                        hash: BASE32_NOPAD.encode(&digest),
                    },
                );
                self.send_adc(msg);
            }
            (AdcHeader::Info, AdcBody::Sta { code, text }) => {
                if code.starts_with('2') {
                    return Err(if code.starts_with("23") {
                        DcError::AuthRejected
                    } else {
                        DcError::ProtocolSemantic(text)
                    });
                }
                tracing::debug!("hub status {}: {}", code, text);
            }
            (AdcHeader::Info, AdcBody::Inf { fields }) => {
                if let Some(name) = AdcMessage::inf_field(&fields, "NI") {
                    self.hub_name = name.to_string();
                    events.push(HubEvent::HubName(name.to_string()));
                }
            }
            (AdcHeader::Broadcast { sid }, AdcBody::Inf { fields }) => {
                let sid = sid.clone();
                if sid == self.my_sid {
                    if self.state == HubState::Handshaking
                        || self.state == HubState::Authenticating
                    {
                        self.state = HubState::Operating;
                        events.push(HubEvent::Registered);
                        events.push(HubEvent::Operating);
                    }
                    return Ok(events);
                }
                events.extend(self.upsert_adc_peer(&sid, &fields));
            }
            (AdcHeader::Info, AdcBody::Qui { sid })
            | (AdcHeader::Broadcast { .. }, AdcBody::Qui { sid }) => {
                if let Some(pos) = self.peers.iter().position(|p| p.adc_sid == sid) {
                    events.push(HubEvent::PeerDisconnected(self.peers.remove(pos)));
                }
            }
            (AdcHeader::Broadcast { sid }, AdcBody::Msg { text, .. }) => {
                if let Some(peer) = self.peers.iter().find(|p| p.adc_sid == *sid) {
                    events.push(HubEvent::ChatPublic {
                        nick: peer.nick.clone(),
                        text,
                    });
                } else if *sid == self.my_sid {
                    events.push(HubEvent::ChatPublic {
                        nick: self.identity.nick.clone(),
                        text,
                    });
                }
            }
            (AdcHeader::Direct { from, .. } | AdcHeader::Echo { from, .. }, AdcBody::Msg { text, pm }) => {
                if pm.is_some() {
                    if let Some(peer) = self.peers.iter().find(|p| p.adc_sid == *from) {
                        events.push(HubEvent::ChatPrivate {
                            nick: peer.nick.clone(),
                            text,
                        });
                    }
                }
            }
            (
                AdcHeader::Broadcast { sid } | AdcHeader::Feature { sid, .. },
                AdcBody::Sch(search),
            ) => {
                if *sid == self.my_sid {
                    return Ok(events);
                }
                let Some(peer) = self.peers.iter().find(|p| p.adc_sid == *sid) else {
                    return Ok(events);
                };
                let query = if let Some(tth) = search.tth {
                    SearchQuery::Tth(tth)
                } else {
                    SearchQuery::Name {
                        text: search.includes.join(" "),
                        min_size: search.min_size,
                        max_size: search.max_size,
                    }
                };
                let reply = match (peer.ip, peer.udp_port) {
                    (Some(ip), port) if port != 0 => {
                        SearchReply::Udp(SocketAddr::new(ip, port))
                    }
                    _ => SearchReply::Hub(sid.clone()),
                };
                events.push(HubEvent::SearchRequest { reply, query });
            }
            (AdcHeader::Direct { from, .. }, AdcBody::Res { path, size, free_slots, tth, .. }) => {
                if let Some(peer) = self.peers.iter().find(|p| p.adc_sid == *from) {
                    events.push(HubEvent::SearchResult(SearchResult {
                        peer_nick: peer.nick.clone(),
                        path,
                        size,
                        is_directory: false,
                        tth,
                        free_slots,
                        total_slots: 0,
                    }));
                }
            }
            (AdcHeader::Direct { from, .. }, AdcBody::Ctm { proto, port, token }) => {
                if let Some(peer) = self.peers.iter().find(|p| p.adc_sid == *from) {
                    let Some(ip) = peer.ip else {
                        return Ok(events);
                    };
                    events.push(HubEvent::ConnectToMe {
                        nick: Some(peer.nick.clone()),
                        addr: SocketAddr::new(ip, port),
                        tls: proto.starts_with("ADCS"),
                        token: Some(token),
                    });
                }
            }
            (AdcHeader::Direct { from, .. }, AdcBody::Rcm { token, .. }) => {
                if let Some(peer) = self.peers.iter().find(|p| p.adc_sid == *from) {
                    events.push(HubEvent::RevConnectToMe {
                        nick: peer.nick.clone(),
                        token: Some(token),
                    });
                }
            }
            (_, body) => {
                tracing::debug!("unhandled hub message: {:?}", body);
            }
        }
        Ok(events)
    }

    fn upsert_adc_peer(&mut self, sid: &str, fields: &[(String, String)]) -> Vec<HubEvent> {
        let get = |k: &str| AdcMessage::inf_field(fields, k).map(str::to_string);
        let existing = self.peers.iter_mut().find(|p| p.adc_sid == sid);
        match existing {
            Some(peer) => {
                if let Some(ni) = get("NI") {
                    peer.nick = ni;
                }
                apply_adc_fields(peer, fields);
                vec![HubEvent::PeerUpdated(peer.clone())]
            }
            None => {
                let Some(nick) = get("NI") else {
                    return vec![];
                };
                let mut peer = Peer {
                    nick,
                    adc_sid: sid.to_string(),
                    adc_cid: get("ID").unwrap_or_default(),
                    ..Peer::default()
                };
                apply_adc_fields(&mut peer, fields);
                self.peers.push(peer.clone());
                vec![HubEvent::PeerConnected(peer)]
            }
        }
    }

    // ---- helpers ----

    fn sid_of(&self, nick: &str) -> Result<String> {
        self.peer(nick)
            .filter(|p| !p.adc_sid.is_empty())
            .map(|p| p.adc_sid.clone())
            .ok_or_else(|| DcError::NotFound(format!("peer {}", nick)))
    }

    fn send_my_info(&mut self) {
        match self.dialect {
            Dialect::Nmdc => {
                let mode = if self.identity.passive { "P" } else { "A" };
                let tag = format!(
                    "{},M:{},H:1/0/0,S:{}",
                    CLIENT_TAG, mode, self.slots_total
                );
                let msg = NmdcMessage::MyInfo {
                    nick: self.identity.nick.clone(),
                    description: self.identity.description.clone(),
                    client_tag: tag,
                    speed: "100".into(),
                    email: String::new(),
                    share_size: self.share_size,
                };
                self.send_nmdc(msg);
            }
            Dialect::Adc => self.send_own_inf(),
        }
    }

    fn send_own_inf(&mut self) {
        let mut fields: Vec<(String, String)> = vec![
            ("ID".into(), BASE32_NOPAD.encode(&self.cid)),
            ("PD".into(), BASE32_NOPAD.encode(&self.pid)),
            ("NI".into(), self.identity.nick.clone()),
            ("VE".into(), CLIENT_TAG.into()),
            ("SS".into(), self.share_size.to_string()),
            ("SL".into(), self.slots_total.to_string()),
            ("FS".into(), self.slots_free.to_string()),
        ];
        if !self.identity.description.is_empty() {
            fields.push(("DE".into(), self.identity.description.clone()));
        }
        if !self.identity.passive {
            let mut su = vec!["TCP4", "UDP4"];
            if self.identity.tls_capable {
                su.push("ADCS");
            }
            fields.push(("SU".into(), su.join(",")));
            if let Some(ip) = self.advertised_ip {
                fields.push(("I4".into(), ip.to_string()));
            }
            fields.push(("U4".into(), self.identity.udp_port.to_string()));
        } else if self.identity.tls_capable {
            fields.push(("SU".into(), "ADCS".into()));
        }
        let msg = AdcMessage::new(
            AdcHeader::Broadcast {
                sid: self.my_sid.clone(),
            },
            AdcBody::Inf { fields },
        );
        self.send_adc(msg);
    }

    fn send_nmdc(&mut self, msg: NmdcMessage) {
        let _ = self.writer.send(msg.encode());
    }

    fn send_adc(&mut self, msg: AdcMessage) {
        let _ = self.writer.send(msg.encode());
    }
}

fn apply_adc_fields(peer: &mut Peer, fields: &[(String, String)]) {
    for (key, value) in fields {
        match key.as_str() {
            "DE" => peer.description = value.clone(),
            "EM" => peer.email = value.clone(),
            "VE" => peer.client_tag = value.clone(),
            "SS" => peer.share_size = value.parse().unwrap_or(0),
            "I4" | "I6" => peer.ip = value.parse().ok(),
            "U4" => peer.udp_port = value.parse().unwrap_or(0),
            "SU" => {
                peer.supports_tls = value.split(',').any(|f| f == "ADCS" || f == "ADC0");
                peer.is_active = value.split(',').any(|f| f == "TCP4" || f == "TCP6");
            }
            "OP" => peer.is_operator = value != "0",
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dunlin_core::tiger::root_of;

    fn identity(passive: bool) -> HubIdentity {
        HubIdentity {
            nick: "me".into(),
            password: String::new(),
            description: String::new(),
            passive,
            tls_capable: false,
            udp_port: 3000,
        }
    }

    fn nmdc_session() -> (HubSession, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut s = HubSession::new(Dialect::Nmdc, identity(false), [7u8; 24], tx);
        s.advertised_ip = Some("10.0.0.1".parse().unwrap());
        (s, rx)
    }

    fn adc_session() -> (HubSession, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut s = HubSession::new(Dialect::Adc, identity(false), [7u8; 24], tx);
        s.advertised_ip = Some("10.0.0.1".parse().unwrap());
        s.start();
        (s, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(String::from_utf8_lossy(&frame).into_owned());
        }
        out
    }

    #[test]
    fn nmdc_handshake_to_operating() {
        let (mut s, mut rx) = nmdc_session();

        s.handle_frame(b"$Lock EXTENDEDPROTOCOL_code Pk=hub").unwrap();
        let sent = drain(&mut rx);
        assert!(sent.iter().any(|m| m.starts_with("$Supports ")));
        assert!(sent.iter().any(|m| m.starts_with("$Key ")));
        assert!(sent.contains(&"$ValidateNick me".to_string()));

        let events = s.handle_frame(b"$Hello me").unwrap();
        assert!(matches!(events.as_slice(), [HubEvent::Registered]));
        assert_eq!(s.state(), HubState::Registered);
        let sent = drain(&mut rx);
        assert!(sent.iter().any(|m| m.starts_with("$Version ")));
        assert!(sent.iter().any(|m| m.starts_with("$MyINFO $ALL me ")));

        let events = s.handle_frame(b"$NickList other1$$other2$$me$$").unwrap();
        assert_eq!(s.state(), HubState::Operating);
        let nicks: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                HubEvent::PeerConnected(p) => Some(p.nick.clone()),
                _ => None,
            })
            .collect();
        // join order preserved, self excluded
        assert_eq!(nicks, vec!["other1", "other2"]);
        assert!(matches!(events.last(), Some(HubEvent::Operating)));
    }

    #[test]
    fn nmdc_password_flow() {
        let (mut s, mut rx) = nmdc_session();
        s.identity.password = "testpa$ss".into();
        s.handle_frame(b"$Lock EXTENDEDPROTOCOL_x Pk=y").unwrap();
        drain(&mut rx);
        s.handle_frame(b"$GetPass").unwrap();
        let sent = drain(&mut rx);
        assert_eq!(sent, vec!["$MyPass testpa&#36;ss".to_string()]);
        assert!(matches!(
            s.handle_frame(b"$BadPass"),
            Err(DcError::AuthRejected)
        ));
    }

    #[test]
    fn nmdc_password_missing_rejects() {
        let (mut s, _rx) = nmdc_session();
        assert!(matches!(
            s.handle_frame(b"$GetPass"),
            Err(DcError::AuthRejected)
        ));
    }

    #[test]
    fn nmdc_peer_lifecycle() {
        let (mut s, _rx) = nmdc_session();
        let events = s
            .handle_frame(b"$MyINFO $ALL buddy desc<tag V:1,M:P,H:1/0/0,S:2>$ $100$$5000$")
            .unwrap();
        assert!(matches!(&events[..], [HubEvent::PeerConnected(p)] if p.nick == "buddy"));
        let peer = s.peer("buddy").unwrap();
        assert!(!peer.is_active);
        assert_eq!(peer.share_size, 5000);

        let events = s
            .handle_frame(b"$MyINFO $ALL buddy newdesc<tag V:1,M:A,H:1/0/0,S:2>$ $100$$6000$")
            .unwrap();
        assert!(matches!(&events[..], [HubEvent::PeerUpdated(p)] if p.share_size == 6000));

        let events = s.handle_frame(b"$Quit buddy").unwrap();
        assert!(matches!(&events[..], [HubEvent::PeerDisconnected(p)] if p.nick == "buddy"));
        assert!(s.peer("buddy").is_none());
    }

    #[test]
    fn nmdc_search_request_routing() {
        let (mut s, _rx) = nmdc_session();
        let events = s.handle_frame(b"$Search 10.9.8.7:412 F?F?0?1?movie").unwrap();
        match &events[..] {
            [HubEvent::SearchRequest { reply, query }] => {
                assert_eq!(*reply, SearchReply::Udp("10.9.8.7:412".parse().unwrap()));
                assert!(matches!(query, SearchQuery::Name { text, .. } if text == "movie"));
            }
            other => panic!("unexpected events: {:?}", other),
        }

        // our own search comes back from the hub and is ignored
        let events = s.handle_frame(b"$Search 10.0.0.1:3000 F?F?0?1?movie").unwrap();
        assert!(events.is_empty());
        let events = s.handle_frame(b"$Search Hub:me F?F?0?1?movie").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn nmdc_ctm_only_for_us() {
        let (mut s, _rx) = nmdc_session();
        let events = s.handle_frame(b"$ConnectToMe me 1.2.3.4:5000S").unwrap();
        match &events[..] {
            [HubEvent::ConnectToMe { addr, tls, .. }] => {
                assert_eq!(*addr, "1.2.3.4:5000".parse().unwrap());
                assert!(tls);
            }
            other => panic!("unexpected events: {:?}", other),
        }
        let events = s.handle_frame(b"$ConnectToMe someoneelse 1.2.3.4:5000").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn adc_handshake_to_operating() {
        let (mut s, mut rx) = adc_session();
        let sent = drain(&mut rx);
        assert!(sent.iter().any(|m| m.starts_with("HSUP ")));

        s.handle_frame(b"ISUP ADBASE ADTIGR").unwrap();
        s.handle_frame(b"ISID MYSD").unwrap();
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("BINF MYSD "));
        assert!(sent[0].contains(" NIme"));
        assert!(sent[0].contains(" SU"));

        let events = s
            .handle_frame(b"BINF OTHR IDX NIbuddy I410.1.1.1 U43111 SUTCP4,UDP4 SS9000")
            .unwrap();
        assert!(matches!(&events[..], [HubEvent::PeerConnected(p)] if p.nick == "buddy"));

        let events = s.handle_frame(b"BINF MYSD NIme").unwrap();
        assert!(matches!(
            &events[..],
            [HubEvent::Registered, HubEvent::Operating]
        ));
        assert_eq!(s.state(), HubState::Operating);
    }

    #[test]
    fn adc_password_challenge() {
        let (mut s, mut rx) = adc_session();
        s.identity.password = "secret".into();
        s.handle_frame(b"ISID MYSD").unwrap();
        drain(&mut rx);
        let nonce = BASE32_NOPAD.encode(b"random-nonce-bytes");
        s.handle_frame(format!("IGPA {}", nonce).as_bytes()).unwrap();
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        let expected: [u8; 24] = {
            let mut h = Tiger::new();
            h.update(b"secret");
            h.update(b"random-nonce-bytes");
            h.finalize().into()
        };
        assert_eq!(sent[0], format!("HPAS {}", BASE32_NOPAD.encode(&expected)));
    }

    #[test]
    fn adc_search_and_ctm() {
        let (mut s, _rx) = adc_session();
        s.handle_frame(b"ISID MYSD").unwrap();
        s.handle_frame(b"BINF OTHR NIbuddy I410.1.1.1 U43111 SUTCP4,UDP4,ADCS")
            .unwrap();

        let tth = root_of(b"x");
        let events = s
            .handle_frame(format!("BSCH OTHR TR{} TOtok", tth).as_bytes())
            .unwrap();
        match &events[..] {
            [HubEvent::SearchRequest { reply, query }] => {
                assert_eq!(*reply, SearchReply::Udp("10.1.1.1:3111".parse().unwrap()));
                assert!(matches!(query, SearchQuery::Tth(t) if *t == tth));
            }
            other => panic!("unexpected events: {:?}", other),
        }

        let events = s.handle_frame(b"DCTM OTHR MYSD ADCS/0.10 4321 tok2").unwrap();
        match &events[..] {
            [HubEvent::ConnectToMe { nick, addr, tls, token }] => {
                assert_eq!(nick.as_deref(), Some("buddy"));
                assert_eq!(*addr, "10.1.1.1:4321".parse().unwrap());
                assert!(tls);
                assert_eq!(token.as_deref(), Some("tok2"));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn chat_routing_both_dialects() {
        let (mut s, mut rx) = nmdc_session();
        s.chat_public("hello all");
        assert_eq!(drain(&mut rx), vec!["<me> hello all".to_string()]);
        let events = s.handle_frame(b"<buddy> hi bot").unwrap();
        assert!(
            matches!(&events[..], [HubEvent::ChatPublic { nick, text }] if nick == "buddy" && text == "hi bot")
        );

        let (mut s, mut rx) = adc_session();
        s.handle_frame(b"ISID MYSD").unwrap();
        s.handle_frame(b"BINF OTHR NIbuddy").unwrap();
        drain(&mut rx);
        s.chat_private("buddy", "psst").unwrap();
        let sent = drain(&mut rx);
        assert_eq!(sent, vec!["DMSG MYSD OTHR psst PMMYSD".to_string()]);
        let events = s.handle_frame(b"DMSG OTHR MYSD secret PMOTHR").unwrap();
        assert!(
            matches!(&events[..], [HubEvent::ChatPrivate { nick, text }] if nick == "buddy" && text == "secret")
        );
    }
}
