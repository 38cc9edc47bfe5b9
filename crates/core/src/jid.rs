use crate::error::{Error, ErrorKind, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const NEWSLETTER_SERVER: &str = "newsletter";

/// Content length caps enforced by the dispatch pipeline.
pub const MAX_TEXT_LEN: usize = 4096;
pub const MAX_CAPTION_LEN: usize = 1024;
pub const MAX_FILENAME_LEN: usize = 255;

fn e164_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("static regex"))
}

/// Normalized WhatsApp identifier, `<user>@<server>`. The device suffix a
/// client appends (`user:device@server`) is stripped on construction, so two
/// `Jid`s for the same account always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(String);

impl Jid {
    pub fn parse(raw: &str) -> Result<Self> {
        let cleaned = clean_jid(raw);
        if cleaned.is_empty() {
            return Err(Error::invalid_input("empty JID"));
        }
        let Some((user, server)) = cleaned.split_once('@') else {
            return Err(Error::invalid_input(format!("malformed JID: {}", raw)));
        };
        if user.is_empty() || server.is_empty() {
            return Err(Error::invalid_input(format!("malformed JID: {}", raw)));
        }
        Ok(Self(cleaned))
    }

    pub fn from_phone(phone: &PhoneNumber) -> Self {
        Self(format!(
            "{}@{}",
            phone.as_str().trim_start_matches('+'),
            DEFAULT_USER_SERVER
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn user(&self) -> &str {
        self.0.split_once('@').map(|(u, _)| u).unwrap_or(&self.0)
    }

    pub fn server(&self) -> &str {
        self.0.split_once('@').map(|(_, s)| s).unwrap_or("")
    }

    pub fn is_group(&self) -> bool {
        self.server() == GROUP_SERVER
    }

    pub fn is_broadcast(&self) -> bool {
        self.server() == BROADCAST_SERVER
    }

    /// WhatsApp channels ride on the newsletter server.
    pub fn is_newsletter(&self) -> bool {
        self.server() == NEWSLETTER_SERVER
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip the device suffix from the user part: `user:device@domain` becomes
/// `user@domain`. Idempotent; inputs without a suffix pass through unchanged.
pub fn clean_jid(raw: &str) -> String {
    let raw = raw.trim();
    match raw.split_once('@') {
        Some((user, server)) => {
            let user = user.split_once(':').map(|(u, _)| u).unwrap_or(user);
            format!("{}@{}", user, server)
        }
        None => raw.to_string(),
    }
}

/// E.164 phone number: `+`, leading non-zero digit, 2–15 digits total.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if !e164_regex().is_match(trimmed) {
            return Err(Error::new(
                ErrorKind::InvalidPhoneNumber,
                format!("not an E.164 phone number: {}", raw),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
