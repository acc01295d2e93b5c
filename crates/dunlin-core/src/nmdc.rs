//! Legacy dialect codec
//!
//! Messages are `$Command payload` lines delimited by `|`; public chat lines
//! carry no command prefix. Payload bytes that collide with the delimiter
//! set travel through an HTML-entity style escape mapping, and the handshake
//! key is derived from the hub's lock string.

use std::fmt;
use std::net::SocketAddr;

use crate::error::{DcError, Result};
use crate::tiger::TigerHash;
use crate::types::{Direction, SearchQuery};

/// Escape a payload so it survives the `|` framing and `$` command syntax.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '$' => out.push_str("&#36;"),
            '|' => out.push_str("&#124;"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(s: &str) -> String {
    s.replace("&#124;", "|")
        .replace("&#36;", "$")
        .replace("&amp;", "&")
}

/// Derive the `$Key` reply from a `$Lock` challenge.
pub fn key_from_lock(lock: &[u8]) -> Vec<u8> {
    if lock.len() < 2 {
        return Vec::new();
    }
    let n = lock.len();
    let mut key = Vec::with_capacity(n);
    key.push(lock[0] ^ lock[n - 1] ^ lock[n - 2] ^ 5);
    for i in 1..n {
        key.push(lock[i] ^ lock[i - 1]);
    }
    let mut out = Vec::with_capacity(n);
    for b in key {
        let swapped = (b << 4) | (b >> 4);
        match swapped {
            0 | 5 | 36 | 96 | 124 | 126 => {
                out.extend_from_slice(format!("/%DCN{:03}%/", swapped).as_bytes())
            }
            b => out.push(b),
        }
    }
    out
}

/// Where a search request wants its results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOrigin {
    /// Active requester; results go to this UDP address.
    Active(SocketAddr),
    /// Passive requester; results go back through the hub.
    Passive(String),
}

/// Typed messages of the legacy dialect. Unknown commands decode to
/// [`NmdcMessage::Other`] and never fail the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum NmdcMessage {
    Lock { lock: String, pk: String },
    Key { key: Vec<u8> },
    Supports { features: Vec<String> },
    ValidateNick { nick: String },
    ValidateDenide { nick: String },
    GetPass,
    MyPass { password: String },
    BadPass,
    Hello { nick: String },
    Version { version: String },
    GetNickList,
    MyInfo {
        nick: String,
        description: String,
        client_tag: String,
        speed: String,
        email: String,
        share_size: u64,
    },
    NickList { nicks: Vec<String> },
    OpList { nicks: Vec<String> },
    HubName { name: String },
    Quit { nick: String },
    ChatPublic { nick: String, text: String },
    PrivateMessage { to: String, from: String, text: String },
    Search { origin: SearchOrigin, query: SearchQuery },
    SearchResult {
        nick: String,
        path: String,
        size: u64,
        is_directory: bool,
        free_slots: u32,
        total_slots: u32,
        tth: Option<TigerHash>,
        hub_name: String,
        /// Present when relayed through the hub to a passive requester.
        target_nick: Option<String>,
    },
    ConnectToMe {
        target: String,
        address: SocketAddr,
        tls: bool,
    },
    RevConnectToMe { from: String, to: String },
    MyNick { nick: String },
    Direction { direction: Direction, tiebreaker: u32 },
    MaxedOut,
    Error { text: String },
    AdcGet {
        kind: String,
        path: String,
        start: u64,
        length: i64,
        compress: bool,
    },
    AdcSnd {
        kind: String,
        path: String,
        start: u64,
        length: u64,
        compress: bool,
    },
    Other { command: String, payload: String },
}

fn syntax(cmd: &str, payload: &str) -> DcError {
    DcError::ProtocolSyntax(format!("malformed ${}: {}", cmd, payload))
}

fn parse_socket_addr(s: &str) -> Result<SocketAddr> {
    s.parse()
        .map_err(|_| DcError::ProtocolSyntax(format!("bad address: {}", s)))
}

impl NmdcMessage {
    pub fn encode(&self) -> Vec<u8> {
        // key material is raw bytes; everything else is text
        if let NmdcMessage::Key { key } = self {
            let mut out = b"$Key ".to_vec();
            out.extend_from_slice(key);
            return out;
        }
        self.to_string().into_bytes()
    }

    pub fn decode(line: &[u8]) -> Result<NmdcMessage> {
        let line = String::from_utf8_lossy(line);
        if let Some(rest) = line.strip_prefix('$') {
            let (cmd, payload) = match rest.split_once(' ') {
                Some((c, p)) => (c, p),
                None => (rest, ""),
            };
            Self::decode_command(cmd, payload)
        } else if let Some(rest) = line.strip_prefix('<') {
            let (nick, text) = rest
                .split_once("> ")
                .ok_or_else(|| DcError::ProtocolSyntax(format!("malformed chat: {}", line)))?;
            Ok(NmdcMessage::ChatPublic {
                nick: nick.to_string(),
                text: unescape(text),
            })
        } else {
            // hubs emit bare informational lines before the handshake
            Ok(NmdcMessage::Other {
                command: String::new(),
                payload: line.into_owned(),
            })
        }
    }

    fn decode_command(cmd: &str, payload: &str) -> Result<NmdcMessage> {
        Ok(match cmd {
            "Lock" => {
                let (lock, rest) = payload.split_once(' ').unwrap_or((payload, ""));
                let pk = rest.strip_prefix("Pk=").unwrap_or(rest);
                NmdcMessage::Lock {
                    lock: lock.to_string(),
                    pk: pk.to_string(),
                }
            }
            "Key" => NmdcMessage::Key {
                key: payload.as_bytes().to_vec(),
            },
            "Supports" => NmdcMessage::Supports {
                features: payload.split_whitespace().map(str::to_string).collect(),
            },
            "ValidateNick" => NmdcMessage::ValidateNick {
                nick: payload.to_string(),
            },
            "ValidateDenide" => NmdcMessage::ValidateDenide {
                nick: payload.to_string(),
            },
            "GetPass" => NmdcMessage::GetPass,
            "MyPass" => NmdcMessage::MyPass {
                password: unescape(payload),
            },
            "BadPass" => NmdcMessage::BadPass,
            "Hello" => NmdcMessage::Hello {
                nick: payload.to_string(),
            },
            "Version" => NmdcMessage::Version {
                version: payload.to_string(),
            },
            "GetNickList" => NmdcMessage::GetNickList,
            "MyINFO" => Self::decode_myinfo(payload)?,
            "NickList" => NmdcMessage::NickList {
                nicks: split_nicks(payload),
            },
            "OpList" => NmdcMessage::OpList {
                nicks: split_nicks(payload),
            },
            "HubName" => NmdcMessage::HubName {
                name: unescape(payload),
            },
            "Quit" => NmdcMessage::Quit {
                nick: payload.to_string(),
            },
            "To:" => Self::decode_private_message(payload)?,
            "Search" => Self::decode_search(payload)?,
            "SR" => Self::decode_search_result(payload)?,
            "ConnectToMe" => {
                let (target, addr) = payload.split_once(' ').ok_or_else(|| syntax(cmd, payload))?;
                let (addr, tls) = match addr.strip_suffix('S') {
                    Some(a) => (a, true),
                    None => (addr, false),
                };
                NmdcMessage::ConnectToMe {
                    target: target.to_string(),
                    address: parse_socket_addr(addr)?,
                    tls,
                }
            }
            "RevConnectToMe" => {
                let (from, to) = payload.split_once(' ').ok_or_else(|| syntax(cmd, payload))?;
                NmdcMessage::RevConnectToMe {
                    from: from.to_string(),
                    to: to.to_string(),
                }
            }
            "MyNick" => NmdcMessage::MyNick {
                nick: payload.to_string(),
            },
            "Direction" => {
                let (dir, num) = payload.split_once(' ').ok_or_else(|| syntax(cmd, payload))?;
                let direction = match dir {
                    "Upload" => Direction::Upload,
                    "Download" => Direction::Download,
                    _ => return Err(syntax(cmd, payload)),
                };
                NmdcMessage::Direction {
                    direction,
                    tiebreaker: num.parse().map_err(|_| syntax(cmd, payload))?,
                }
            }
            "MaxedOut" => NmdcMessage::MaxedOut,
            "Error" => NmdcMessage::Error {
                text: unescape(payload),
            },
            "ADCGET" => {
                let (kind, path, start, length, compress) = Self::decode_adc_transfer(payload)?;
                NmdcMessage::AdcGet {
                    kind,
                    path,
                    start,
                    length,
                    compress,
                }
            }
            "ADCSND" => {
                let (kind, path, start, length, compress) = Self::decode_adc_transfer(payload)?;
                NmdcMessage::AdcSnd {
                    kind,
                    path,
                    start,
                    length: u64::try_from(length).map_err(|_| syntax("ADCSND", payload))?,
                    compress,
                }
            }
            other => NmdcMessage::Other {
                command: other.to_string(),
                payload: payload.to_string(),
            },
        })
    }

    // $ALL <nick> <description><tag>$ $<speed>$<email>$<share>$
    fn decode_myinfo(payload: &str) -> Result<NmdcMessage> {
        let rest = payload
            .strip_prefix("$ALL ")
            .ok_or_else(|| syntax("MyINFO", payload))?;
        let (nick, rest) = rest.split_once(' ').ok_or_else(|| syntax("MyINFO", payload))?;
        let mut fields = rest.split('$');
        let desc_field = fields.next().unwrap_or_default();
        let _ = fields.next(); // connection-flag field, always a single space
        let speed = fields.next().unwrap_or_default();
        let email = fields.next().unwrap_or_default();
        let share = fields.next().unwrap_or_default();
        let (description, client_tag) = match desc_field.rfind('<') {
            Some(i) if desc_field.ends_with('>') => (
                desc_field[..i].trim_end().to_string(),
                desc_field[i + 1..desc_field.len() - 1].to_string(),
            ),
            _ => (desc_field.to_string(), String::new()),
        };
        Ok(NmdcMessage::MyInfo {
            nick: nick.to_string(),
            description: unescape(&description),
            client_tag,
            speed: speed.trim_end_matches(|c: char| c.is_control()).to_string(),
            email: unescape(email),
            share_size: share.trim().parse().unwrap_or(0),
        })
    }

    // $To: <to> From: <from> $<<from>> <text>
    fn decode_private_message(payload: &str) -> Result<NmdcMessage> {
        let (to, rest) = payload
            .split_once(" From: ")
            .ok_or_else(|| syntax("To:", payload))?;
        let (from, text) = rest.split_once(" $").ok_or_else(|| syntax("To:", payload))?;
        let text = match text.strip_prefix('<') {
            Some(t) => t.split_once("> ").map(|(_, t)| t).unwrap_or(t),
            None => text,
        };
        Ok(NmdcMessage::PrivateMessage {
            to: to.to_string(),
            from: from.to_string(),
            text: unescape(text),
        })
    }

    // $Search <ip>:<port> F?T?0?9?TTH:<hash>  |  $Search Hub:<nick> <...>
    fn decode_search(payload: &str) -> Result<NmdcMessage> {
        let (origin, query) = payload.split_once(' ').ok_or_else(|| syntax("Search", payload))?;
        let origin = match origin.strip_prefix("Hub:") {
            Some(nick) => SearchOrigin::Passive(nick.to_string()),
            None => SearchOrigin::Active(parse_socket_addr(origin)?),
        };
        let mut parts = query.splitn(5, '?');
        let size_restricted = parts.next() == Some("T");
        let is_max = parts.next() == Some("T");
        let size: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let kind = parts.next().ok_or_else(|| syntax("Search", payload))?;
        let pattern = parts.next().ok_or_else(|| syntax("Search", payload))?;
        let query = if kind == "9" {
            let tth = pattern
                .strip_prefix("TTH:")
                .ok_or_else(|| syntax("Search", payload))?;
            SearchQuery::Tth(TigerHash::from_base32(tth)?)
        } else {
            // '$' stands for a space in search patterns; a literal dollar
            // arrives escaped, so substitute before unescaping
            let text = unescape(&pattern.replace('$', " "));
            let (min_size, max_size) = match (size_restricted, is_max) {
                (true, false) => (Some(size), None),
                (true, true) => (None, Some(size)),
                _ => (None, None),
            };
            SearchQuery::Name {
                text,
                min_size,
                max_size,
            }
        };
        Ok(NmdcMessage::Search { origin, query })
    }

    // $SR <nick> <path>\x05<size> <free>/<total>\x05<TTH or hubname> (<hub>)[\x05<target>]
    fn decode_search_result(payload: &str) -> Result<NmdcMessage> {
        let (nick, rest) = payload.split_once(' ').ok_or_else(|| syntax("SR", payload))?;
        let mut sections = rest.split('\x05');
        let path_part = sections.next().ok_or_else(|| syntax("SR", payload))?;
        let slots_part = sections.next().ok_or_else(|| syntax("SR", payload))?;

        let (path, size, slots, is_directory) = match slots_part.split_once(' ') {
            // file form: path\x05size free/total
            Some((size_str, slots)) if size_str.parse::<u64>().is_ok() => (
                path_part.to_string(),
                size_str.parse::<u64>().unwrap_or(0),
                slots,
                false,
            ),
            // directory form: path\x05free/total
            _ => (path_part.to_string(), 0, slots_part, true),
        };
        let (slots, hub_section) = slots.split_once('\x05').unwrap_or((slots, ""));
        let (free, total) = slots
            .split_once('/')
            .and_then(|(f, t)| Some((f.parse().ok()?, t.parse().ok()?)))
            .unwrap_or((0, 0));

        let hub_section = if hub_section.is_empty() {
            sections.next().unwrap_or_default()
        } else {
            hub_section
        };
        let (hub_label, _) = hub_section.split_once(" (").unwrap_or((hub_section, ""));
        let tth = hub_label
            .strip_prefix("TTH:")
            .and_then(|h| TigerHash::from_base32(h).ok());
        let hub_name = if tth.is_some() {
            String::new()
        } else {
            hub_label.to_string()
        };
        let target_nick = sections.next().map(str::to_string);

        Ok(NmdcMessage::SearchResult {
            nick: nick.to_string(),
            path: unescape(&path),
            size,
            is_directory,
            free_slots: free,
            total_slots: total,
            tth,
            hub_name,
            target_nick,
        })
    }

    // <kind> <path> <start> <length>[ ZL1]
    fn decode_adc_transfer(payload: &str) -> Result<(String, String, u64, i64, bool)> {
        let mut parts: Vec<&str> = payload.split(' ').collect();
        let compress = parts.last() == Some(&"ZL1");
        if compress {
            parts.pop();
        }
        if parts.len() < 4 {
            return Err(syntax("ADCGET", payload));
        }
        let length: i64 = parts[parts.len() - 1]
            .parse()
            .map_err(|_| syntax("ADCGET", payload))?;
        let start: u64 = parts[parts.len() - 2]
            .parse()
            .map_err(|_| syntax("ADCGET", payload))?;
        let kind = parts[0].to_string();
        let path = parts[1..parts.len() - 2].join(" ");
        Ok((kind, path, start, length, compress))
    }
}

fn split_nicks(payload: &str) -> Vec<String> {
    payload
        .split("$$")
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn fmt_ip(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

impl fmt::Display for NmdcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NmdcMessage::Lock { lock, pk } => write!(f, "$Lock {} Pk={}", lock, pk),
            NmdcMessage::Key { key } => {
                write!(f, "$Key {}", String::from_utf8_lossy(key))
            }
            NmdcMessage::Supports { features } => write!(f, "$Supports {}", features.join(" ")),
            NmdcMessage::ValidateNick { nick } => write!(f, "$ValidateNick {}", nick),
            NmdcMessage::ValidateDenide { nick } => write!(f, "$ValidateDenide {}", nick),
            NmdcMessage::GetPass => write!(f, "$GetPass"),
            NmdcMessage::MyPass { password } => write!(f, "$MyPass {}", escape(password)),
            NmdcMessage::BadPass => write!(f, "$BadPass"),
            NmdcMessage::Hello { nick } => write!(f, "$Hello {}", nick),
            NmdcMessage::Version { version } => write!(f, "$Version {}", version),
            NmdcMessage::GetNickList => write!(f, "$GetNickList"),
            NmdcMessage::MyInfo {
                nick,
                description,
                client_tag,
                speed,
                email,
                share_size,
            } => {
                let desc = if client_tag.is_empty() {
                    escape(description)
                } else {
                    format!("{}<{}>", escape(description), client_tag)
                };
                write!(
                    f,
                    "$MyINFO $ALL {} {}$ ${}${}${}$",
                    nick,
                    desc,
                    speed,
                    escape(email),
                    share_size
                )
            }
            NmdcMessage::NickList { nicks } => write!(f, "$NickList {}$$", nicks.join("$$")),
            NmdcMessage::OpList { nicks } => {
                if nicks.is_empty() {
                    write!(f, "$OpList ")
                } else {
                    write!(f, "$OpList {}$$", nicks.join("$$"))
                }
            }
            NmdcMessage::HubName { name } => write!(f, "$HubName {}", escape(name)),
            NmdcMessage::Quit { nick } => write!(f, "$Quit {}", nick),
            NmdcMessage::ChatPublic { nick, text } => write!(f, "<{}> {}", nick, escape(text)),
            NmdcMessage::PrivateMessage { to, from, text } => write!(
                f,
                "$To: {} From: {} $<{}> {}",
                to,
                from,
                from,
                escape(text)
            ),
            NmdcMessage::Search { origin, query } => {
                let origin = match origin {
                    SearchOrigin::Active(addr) => fmt_ip(addr),
                    SearchOrigin::Passive(nick) => format!("Hub:{}", nick),
                };
                match query {
                    SearchQuery::Tth(tth) => write!(f, "$Search {} F?T?0?9?TTH:{}", origin, tth),
                    SearchQuery::Name {
                        text,
                        min_size,
                        max_size,
                    } => {
                        let (restricted, is_max, size) = match (min_size, max_size) {
                            (Some(n), _) => ("T", "F", *n),
                            (None, Some(x)) => ("T", "T", *x),
                            (None, None) => ("F", "F", 0),
                        };
                        write!(
                            f,
                            "$Search {} {}?{}?{}?1?{}",
                            origin,
                            restricted,
                            is_max,
                            size,
                            escape(text).replace(' ', "$")
                        )
                    }
                }
            }
            NmdcMessage::SearchResult {
                nick,
                path,
                size,
                is_directory,
                free_slots,
                total_slots,
                tth,
                hub_name,
                target_nick,
            } => {
                let label = match tth {
                    Some(tth) => format!("TTH:{}", tth),
                    None => hub_name.clone(),
                };
                if *is_directory {
                    write!(
                        f,
                        "$SR {} {}\x05{}/{}\x05{} (0.0.0.0:0)",
                        nick,
                        escape(path),
                        free_slots,
                        total_slots,
                        label
                    )?;
                } else {
                    write!(
                        f,
                        "$SR {} {}\x05{} {}/{}\x05{} (0.0.0.0:0)",
                        nick,
                        escape(path),
                        size,
                        free_slots,
                        total_slots,
                        label
                    )?;
                }
                if let Some(target) = target_nick {
                    write!(f, "\x05{}", target)?;
                }
                Ok(())
            }
            NmdcMessage::ConnectToMe {
                target,
                address,
                tls,
            } => write!(
                f,
                "$ConnectToMe {} {}{}",
                target,
                fmt_ip(address),
                if *tls { "S" } else { "" }
            ),
            NmdcMessage::RevConnectToMe { from, to } => {
                write!(f, "$RevConnectToMe {} {}", from, to)
            }
            NmdcMessage::MyNick { nick } => write!(f, "$MyNick {}", nick),
            NmdcMessage::Direction {
                direction,
                tiebreaker,
            } => {
                let dir = match direction {
                    Direction::Upload => "Upload",
                    Direction::Download => "Download",
                };
                write!(f, "$Direction {} {}", dir, tiebreaker)
            }
            NmdcMessage::MaxedOut => write!(f, "$MaxedOut"),
            NmdcMessage::Error { text } => write!(f, "$Error {}", escape(text)),
            NmdcMessage::AdcGet {
                kind,
                path,
                start,
                length,
                compress,
            } => write!(
                f,
                "$ADCGET {} {} {} {}{}",
                kind,
                path,
                start,
                length,
                if *compress { " ZL1" } else { "" }
            ),
            NmdcMessage::AdcSnd {
                kind,
                path,
                start,
                length,
                compress,
            } => write!(
                f,
                "$ADCSND {} {} {} {}{}",
                kind,
                path,
                start,
                length,
                if *compress { " ZL1" } else { "" }
            ),
            NmdcMessage::Other { command, payload } => {
                if command.is_empty() {
                    write!(f, "{}", payload)
                } else if payload.is_empty() {
                    write!(f, "${}", command)
                } else {
                    write!(f, "${} {}", command, payload)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: NmdcMessage) {
        let encoded = msg.encode();
        let decoded = NmdcMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded, "wire form: {}", String::from_utf8_lossy(&encoded));
    }

    #[test]
    fn key_derivation_small_vector() {
        // hand-computed: key[0]=A^C^B^5 -> 0x45, nibble-swapped 0x54
        assert_eq!(key_from_lock(b"ABC"), vec![0x54, 0x30, 0x10]);
    }

    #[test]
    fn key_escapes_reserved_bytes() {
        // lock crafted so one derived byte nibble-swaps to zero
        let key = key_from_lock(b"\x10\x10\x15");
        let text = String::from_utf8_lossy(&key);
        assert!(text.contains("/%DCN000%/"), "got {:?}", text);
    }

    #[test]
    fn escape_is_lossless() {
        let raw = "a|b$c&d &#36; plain";
        assert_eq!(unescape(&escape(raw)), raw);
    }

    #[test]
    fn chat_roundtrip() {
        roundtrip(NmdcMessage::ChatPublic {
            nick: "someone".into(),
            text: "pipes | and $ dollars".into(),
        });
    }

    #[test]
    fn private_message_roundtrip() {
        roundtrip(NmdcMessage::PrivateMessage {
            to: "bob".into(),
            from: "alice".into(),
            text: "hi there".into(),
        });
    }

    #[test]
    fn myinfo_roundtrip() {
        roundtrip(NmdcMessage::MyInfo {
            nick: "tester".into(),
            description: "desc".into(),
            client_tag: "dunlin V:0.1,M:A,H:1/0/0,S:2".into(),
            speed: "100".into(),
            email: "".into(),
            share_size: 123456,
        });
    }

    #[test]
    fn search_tth_roundtrip() {
        roundtrip(NmdcMessage::Search {
            origin: SearchOrigin::Active("10.0.0.1:412".parse().unwrap()),
            query: SearchQuery::Tth(
                TigerHash::from_base32("LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ").unwrap(),
            ),
        });
    }

    #[test]
    fn search_name_roundtrip() {
        roundtrip(NmdcMessage::Search {
            origin: SearchOrigin::Passive("pnick".into()),
            query: SearchQuery::Name {
                text: "some file".into(),
                min_size: Some(1024),
                max_size: None,
            },
        });
    }

    #[test]
    fn search_result_roundtrip() {
        roundtrip(NmdcMessage::SearchResult {
            nick: "peer1".into(),
            path: "share\\test file.txt".into(),
            size: 10000,
            is_directory: false,
            free_slots: 2,
            total_slots: 3,
            tth: Some(TigerHash::from_base32("UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY").unwrap()),
            hub_name: String::new(),
            target_nick: Some("me".into()),
        });
    }

    #[test]
    fn connect_to_me_tls_suffix() {
        let msg = NmdcMessage::ConnectToMe {
            target: "bob".into(),
            address: "1.2.3.4:3000".parse().unwrap(),
            tls: true,
        };
        assert_eq!(msg.to_string(), "$ConnectToMe bob 1.2.3.4:3000S");
        roundtrip(msg);
    }

    #[test]
    fn adcget_with_spaces_in_path() {
        roundtrip(NmdcMessage::AdcGet {
            kind: "file".into(),
            path: "files.xml.bz2".into(),
            start: 0,
            length: -1,
            compress: true,
        });
        let parsed =
            NmdcMessage::decode(b"$ADCGET file TTH/UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY 0 10000")
                .unwrap();
        match parsed {
            NmdcMessage::AdcGet { kind, start, length, compress, .. } => {
                assert_eq!(kind, "file");
                assert_eq!(start, 0);
                assert_eq!(length, 10000);
                assert!(!compress);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_command_is_opaque() {
        let msg = NmdcMessage::decode(b"$UserCommand 1 2 whatever").unwrap();
        assert!(matches!(msg, NmdcMessage::Other { .. }));
    }

    #[test]
    fn direction_roundtrip() {
        roundtrip(NmdcMessage::Direction {
            direction: Direction::Download,
            tiebreaker: 12345,
        });
    }

    #[test]
    fn nick_lists() {
        let msg = NmdcMessage::decode(b"$NickList alice$$bob$$carol$$").unwrap();
        assert_eq!(
            msg,
            NmdcMessage::NickList {
                nicks: vec!["alice".into(), "bob".into(), "carol".into()],
            }
        );
    }
}
