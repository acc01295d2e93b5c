//! Newer dialect codec
//!
//! Messages are space-separated token sequences delimited by `\n`; the first
//! token is a one-letter routing type plus a four-letter command. Values
//! escape spaces, newlines and backslashes. Named parameters are two-letter
//! keys glued to their value.

use std::fmt;

use crate::error::{DcError, Result};
use crate::tiger::TigerHash;

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Routing prefix of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdcHeader {
    /// `H`: client to hub only.
    Hub,
    /// `I`: hub to client only.
    Info,
    /// `C`: direct client connection, no addressing.
    Client,
    /// `B`: broadcast from `sid`.
    Broadcast { sid: String },
    /// `D`: from `from` to `to`, routed by the hub.
    Direct { from: String, to: String },
    /// `E`: like `D` but echoed back to the sender.
    Echo { from: String, to: String },
    /// `F`: feature broadcast from `sid` filtered by `features` (`+X`/`-X`).
    Feature { sid: String, features: Vec<String> },
    /// `U`: UDP datagram from `cid`.
    Udp { cid: String },
}

/// A name-based or hash-based search.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdcSearch {
    pub includes: Vec<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub tth: Option<TigerHash>,
    pub token: Option<String>,
}

/// Typed command bodies. Unknown commands decode to [`AdcBody::Other`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdcBody {
    Sup { add: Vec<String>, remove: Vec<String> },
    Sid { sid: String },
    Inf { fields: Vec<(String, String)> },
    Sta { code: String, text: String },
    Sch(AdcSearch),
    Res {
        path: String,
        size: u64,
        free_slots: u32,
        tth: Option<TigerHash>,
        token: Option<String>,
    },
    Msg { text: String, pm: Option<String> },
    Ctm { proto: String, port: u16, token: String },
    Rcm { proto: String, token: String },
    Gpa { data: String },
    Pas { hash: String },
    Qui { sid: String },
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
    Gfi { kind: String, path: String },
    Other { command: String, params: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdcMessage {
    pub header: AdcHeader,
    pub body: AdcBody,
}

/// Severity+code pairs used by this client.
pub mod sta_codes {
    pub const GENERIC_ERROR: &str = "100";
    pub const FILE_NOT_AVAILABLE: &str = "151";
    pub const SLOTS_FULL: &str = "153";
}

fn syntax(line: &str) -> DcError {
    DcError::ProtocolSyntax(format!("malformed adc message: {}", line))
}

impl AdcMessage {
    pub fn new(header: AdcHeader, body: AdcBody) -> Self {
        AdcMessage { header, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn decode(line: &[u8]) -> Result<AdcMessage> {
        let text = String::from_utf8_lossy(line);
        let mut tokens = text.split(' ');
        let head = tokens.next().filter(|t| t.len() == 4).ok_or_else(|| syntax(&text))?;
        let (kind, command) = head.split_at(1);
        let mut tokens = tokens.peekable();

        let header = match kind {
            "H" => AdcHeader::Hub,
            "I" => AdcHeader::Info,
            "C" => AdcHeader::Client,
            "B" => AdcHeader::Broadcast {
                sid: tokens.next().ok_or_else(|| syntax(&text))?.to_string(),
            },
            "D" | "E" => {
                let from = tokens.next().ok_or_else(|| syntax(&text))?.to_string();
                let to = tokens.next().ok_or_else(|| syntax(&text))?.to_string();
                if kind == "D" {
                    AdcHeader::Direct { from, to }
                } else {
                    AdcHeader::Echo { from, to }
                }
            }
            "F" => {
                let sid = tokens.next().ok_or_else(|| syntax(&text))?.to_string();
                let mut features = Vec::new();
                while let Some(tok) = tokens.peek() {
                    if tok.starts_with('+') || tok.starts_with('-') {
                        features.push(tokens.next().unwrap_or_default().to_string());
                    } else {
                        break;
                    }
                }
                AdcHeader::Feature { sid, features }
            }
            "U" => AdcHeader::Udp {
                cid: tokens.next().ok_or_else(|| syntax(&text))?.to_string(),
            },
            _ => return Err(syntax(&text)),
        };

        let params: Vec<&str> = tokens.collect();
        let body = Self::decode_body(command, &params, &text)?;
        Ok(AdcMessage { header, body })
    }

    fn decode_body(command: &str, params: &[&str], line: &str) -> Result<AdcBody> {
        Ok(match command {
            "SUP" => {
                let mut add = Vec::new();
                let mut remove = Vec::new();
                for p in params {
                    if let Some(f) = p.strip_prefix("AD") {
                        add.push(f.to_string());
                    } else if let Some(f) = p.strip_prefix("RM") {
                        remove.push(f.to_string());
                    }
                }
                AdcBody::Sup { add, remove }
            }
            "SID" => AdcBody::Sid {
                sid: params.first().ok_or_else(|| syntax(line))?.to_string(),
            },
            "INF" => AdcBody::Inf {
                fields: params
                    .iter()
                    .filter(|p| p.len() >= 2)
                    .map(|p| (p[..2].to_string(), unescape(&p[2..])))
                    .collect(),
            },
            "STA" => {
                let code = params.first().ok_or_else(|| syntax(line))?.to_string();
                let text = params.get(1).map(|t| unescape(t)).unwrap_or_default();
                AdcBody::Sta { code, text }
            }
            "SCH" => {
                let mut search = AdcSearch::default();
                for p in params {
                    if p.len() < 2 {
                        continue;
                    }
                    let (key, value) = p.split_at(2);
                    match key {
                        "AN" => search.includes.push(unescape(value)),
                        "GE" => search.min_size = value.parse().ok(),
                        "LE" => search.max_size = value.parse().ok(),
                        "TR" => search.tth = TigerHash::from_base32(value).ok(),
                        "TO" => search.token = Some(value.to_string()),
                        _ => {}
                    }
                }
                AdcBody::Sch(search)
            }
            "RES" => {
                let mut path = String::new();
                let mut size = 0u64;
                let mut free_slots = 0u32;
                let mut tth = None;
                let mut token = None;
                for p in params {
                    if p.len() < 2 {
                        continue;
                    }
                    let (key, value) = p.split_at(2);
                    match key {
                        "FN" => path = unescape(value),
                        "SI" => size = value.parse().unwrap_or(0),
                        "SL" => free_slots = value.parse().unwrap_or(0),
                        "TR" => tth = TigerHash::from_base32(value).ok(),
                        "TO" => token = Some(value.to_string()),
                        _ => {}
                    }
                }
                AdcBody::Res {
                    path,
                    size,
                    free_slots,
                    tth,
                    token,
                }
            }
            "MSG" => {
                let text = params.first().map(|t| unescape(t)).unwrap_or_default();
                let pm = params
                    .iter()
                    .skip(1)
                    .find_map(|p| p.strip_prefix("PM").map(str::to_string));
                AdcBody::Msg { text, pm }
            }
            "CTM" => {
                if params.len() < 3 {
                    return Err(syntax(line));
                }
                AdcBody::Ctm {
                    proto: params[0].to_string(),
                    port: params[1].parse().map_err(|_| syntax(line))?,
                    token: params[2].to_string(),
                }
            }
            "RCM" => {
                if params.len() < 2 {
                    return Err(syntax(line));
                }
                AdcBody::Rcm {
                    proto: params[0].to_string(),
                    token: params[1].to_string(),
                }
            }
            "GPA" => AdcBody::Gpa {
                data: params.first().ok_or_else(|| syntax(line))?.to_string(),
            },
            "PAS" => AdcBody::Pas {
                hash: params.first().ok_or_else(|| syntax(line))?.to_string(),
            },
            "QUI" => AdcBody::Qui {
                sid: params.first().ok_or_else(|| syntax(line))?.to_string(),
            },
            "GET" | "SND" => {
                let mut params = params.to_vec();
                let compress = params.last() == Some(&"ZL1");
                if compress {
                    params.pop();
                }
                if params.len() < 4 {
                    return Err(syntax(line));
                }
                let kind = params[0].to_string();
                let path = unescape(&params[1..params.len() - 2].join(" "));
                let start: u64 = params[params.len() - 2].parse().map_err(|_| syntax(line))?;
                let length: i64 = params[params.len() - 1].parse().map_err(|_| syntax(line))?;
                if command == "GET" {
                    AdcBody::Get {
                        kind,
                        path,
                        start,
                        length,
                        compress,
                    }
                } else {
                    AdcBody::Snd {
                        kind,
                        path,
                        start,
                        length: u64::try_from(length).map_err(|_| syntax(line))?,
                        compress,
                    }
                }
            }
            "GFI" => {
                if params.len() < 2 {
                    return Err(syntax(line));
                }
                AdcBody::Gfi {
                    kind: params[0].to_string(),
                    path: unescape(params[1]),
                }
            }
            other => AdcBody::Other {
                command: other.to_string(),
                params: params.iter().map(|p| p.to_string()).collect(),
            },
        })
    }

    /// Look up a named INF field.
    pub fn inf_field<'a>(fields: &'a [(String, String)], key: &str) -> Option<&'a str> {
        fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

impl AdcBody {
    fn command(&self) -> &'static str {
        match self {
            AdcBody::Sup { .. } => "SUP",
            AdcBody::Sid { .. } => "SID",
            AdcBody::Inf { .. } => "INF",
            AdcBody::Sta { .. } => "STA",
            AdcBody::Sch(_) => "SCH",
            AdcBody::Res { .. } => "RES",
            AdcBody::Msg { .. } => "MSG",
            AdcBody::Ctm { .. } => "CTM",
            AdcBody::Rcm { .. } => "RCM",
            AdcBody::Gpa { .. } => "GPA",
            AdcBody::Pas { .. } => "PAS",
            AdcBody::Qui { .. } => "QUI",
            AdcBody::Get { .. } => "GET",
            AdcBody::Snd { .. } => "SND",
            AdcBody::Gfi { .. } => "GFI",
            AdcBody::Other { .. } => "OTH",
        }
    }
}

impl fmt::Display for AdcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, header_params) = match &self.header {
            AdcHeader::Hub => ("H", Vec::new()),
            AdcHeader::Info => ("I", Vec::new()),
            AdcHeader::Client => ("C", Vec::new()),
            AdcHeader::Broadcast { sid } => ("B", vec![sid.clone()]),
            AdcHeader::Direct { from, to } => ("D", vec![from.clone(), to.clone()]),
            AdcHeader::Echo { from, to } => ("E", vec![from.clone(), to.clone()]),
            AdcHeader::Feature { sid, features } => {
                let mut v = vec![sid.clone()];
                v.extend(features.iter().cloned());
                ("F", v)
            }
            AdcHeader::Udp { cid } => ("U", vec![cid.clone()]),
        };
        let command = match &self.body {
            AdcBody::Other { command, .. } => command.as_str(),
            body => body.command(),
        };
        write!(f, "{}{}", kind, command)?;
        for p in header_params {
            write!(f, " {}", p)?;
        }
        match &self.body {
            AdcBody::Sup { add, remove } => {
                for a in add {
                    write!(f, " AD{}", a)?;
                }
                for r in remove {
                    write!(f, " RM{}", r)?;
                }
            }
            AdcBody::Sid { sid } => write!(f, " {}", sid)?,
            AdcBody::Inf { fields } => {
                for (k, v) in fields {
                    write!(f, " {}{}", k, escape(v))?;
                }
            }
            AdcBody::Sta { code, text } => write!(f, " {} {}", code, escape(text))?,
            AdcBody::Sch(s) => {
                for inc in &s.includes {
                    write!(f, " AN{}", escape(inc))?;
                }
                if let Some(n) = s.min_size {
                    write!(f, " GE{}", n)?;
                }
                if let Some(n) = s.max_size {
                    write!(f, " LE{}", n)?;
                }
                if let Some(tth) = &s.tth {
                    write!(f, " TR{}", tth)?;
                }
                if let Some(t) = &s.token {
                    write!(f, " TO{}", t)?;
                }
            }
            AdcBody::Res {
                path,
                size,
                free_slots,
                tth,
                token,
            } => {
                write!(f, " FN{} SI{} SL{}", escape(path), size, free_slots)?;
                if let Some(tth) = tth {
                    write!(f, " TR{}", tth)?;
                }
                if let Some(t) = token {
                    write!(f, " TO{}", t)?;
                }
            }
            AdcBody::Msg { text, pm } => {
                write!(f, " {}", escape(text))?;
                if let Some(sid) = pm {
                    write!(f, " PM{}", sid)?;
                }
            }
            AdcBody::Ctm { proto, port, token } => write!(f, " {} {} {}", proto, port, token)?,
            AdcBody::Rcm { proto, token } => write!(f, " {} {}", proto, token)?,
            AdcBody::Gpa { data } => write!(f, " {}", data)?,
            AdcBody::Pas { hash } => write!(f, " {}", hash)?,
            AdcBody::Qui { sid } => write!(f, " {}", sid)?,
            AdcBody::Get {
                kind,
                path,
                start,
                length,
                compress,
            } => write!(
                f,
                " {} {} {} {}{}",
                kind,
                escape(path),
                start,
                length,
                if *compress { " ZL1" } else { "" }
            )?,
            AdcBody::Snd {
                kind,
                path,
                start,
                length,
                compress,
            } => write!(
                f,
                " {} {} {} {}{}",
                kind,
                escape(path),
                start,
                length,
                if *compress { " ZL1" } else { "" }
            )?,
            AdcBody::Gfi { kind, path } => write!(f, " {} {}", kind, escape(path))?,
            AdcBody::Other { params, .. } => {
                for p in params {
                    write!(f, " {}", p)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: AdcMessage) {
        let encoded = msg.encode();
        let decoded = AdcMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded, "wire form: {}", String::from_utf8_lossy(&encoded));
    }

    #[test]
    fn escape_is_lossless() {
        let raw = "with space\\and\nnewline";
        assert_eq!(unescape(&escape(raw)), raw);
    }

    #[test]
    fn sup_roundtrip() {
        roundtrip(AdcMessage::new(
            AdcHeader::Hub,
            AdcBody::Sup {
                add: vec!["BASE".into(), "TIGR".into()],
                remove: vec![],
            },
        ));
    }

    #[test]
    fn inf_roundtrip_with_spaces() {
        roundtrip(AdcMessage::new(
            AdcHeader::Broadcast { sid: "ABCD".into() },
            AdcBody::Inf {
                fields: vec![
                    ("NI".into(), "my nick".into()),
                    ("DE".into(), "a description".into()),
                    ("SS".into(), "12345".into()),
                ],
            },
        ));
    }

    #[test]
    fn msg_pm_roundtrip() {
        roundtrip(AdcMessage::new(
            AdcHeader::Direct {
                from: "AAAA".into(),
                to: "BBBB".into(),
            },
            AdcBody::Msg {
                text: "private words".into(),
                pm: Some("AAAA".into()),
            },
        ));
    }

    #[test]
    fn sch_roundtrip() {
        roundtrip(AdcMessage::new(
            AdcHeader::Broadcast { sid: "AAAA".into() },
            AdcBody::Sch(AdcSearch {
                includes: vec!["test".into(), "file".into()],
                min_size: Some(100),
                max_size: None,
                tth: None,
                token: Some("tok1".into()),
            }),
        ));
    }

    #[test]
    fn res_roundtrip() {
        roundtrip(AdcMessage::new(
            AdcHeader::Direct {
                from: "AAAA".into(),
                to: "BBBB".into(),
            },
            AdcBody::Res {
                path: "share/test file.txt".into(),
                size: 10000,
                free_slots: 3,
                tth: Some(
                    TigerHash::from_base32("UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY").unwrap(),
                ),
                token: Some("tok1".into()),
            },
        ));
    }

    #[test]
    fn ctm_rcm_roundtrip() {
        roundtrip(AdcMessage::new(
            AdcHeader::Direct {
                from: "AAAA".into(),
                to: "BBBB".into(),
            },
            AdcBody::Ctm {
                proto: "ADCS/0.10".into(),
                port: 3000,
                token: "tok2".into(),
            },
        ));
        roundtrip(AdcMessage::new(
            AdcHeader::Direct {
                from: "BBBB".into(),
                to: "AAAA".into(),
            },
            AdcBody::Rcm {
                proto: "ADC/1.0".into(),
                token: "tok3".into(),
            },
        ));
    }

    #[test]
    fn get_snd_roundtrip() {
        roundtrip(AdcMessage::new(
            AdcHeader::Client,
            AdcBody::Get {
                kind: "file".into(),
                path: "TTH/UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY".into(),
                start: 0,
                length: -1,
                compress: false,
            },
        ));
        roundtrip(AdcMessage::new(
            AdcHeader::Client,
            AdcBody::Snd {
                kind: "tthl".into(),
                path: "TTH/UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY".into(),
                start: 0,
                length: 960,
                compress: true,
            },
        ));
    }

    #[test]
    fn feature_header_roundtrip() {
        roundtrip(AdcMessage::new(
            AdcHeader::Feature {
                sid: "AAAA".into(),
                features: vec!["+TCP4".into(), "-NAT0".into()],
            },
            AdcBody::Sch(AdcSearch {
                includes: vec!["movie".into()],
                ..Default::default()
            }),
        ));
    }

    #[test]
    fn unknown_command_is_opaque() {
        let msg = AdcMessage::decode(b"HCMD param1 param2").unwrap();
        assert!(matches!(msg.body, AdcBody::Other { .. }));
    }

    #[test]
    fn garbage_is_syntax_error() {
        assert!(matches!(
            AdcMessage::decode(b"xy"),
            Err(DcError::ProtocolSyntax(_))
        ));
    }
}
