//! Shared value objects used across the session core

use super::error::UaError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;
use uuid::Uuid;

/// Session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP Call-ID; the key every dialog-scoped event is routed by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh Call-ID scoped to `host`
    pub fn generate(host: &str) -> Self {
        let random: u64 = rand::thread_rng().gen();
        Self(format!("{:016x}@{}", random, host))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction ID - uniquely identifies a transaction
/// Based on branch parameter in Via header
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    /// Create transaction ID from branch parameter
    pub fn from_branch(branch: &str) -> Self {
        Self(branch.to_string())
    }

    /// Generate a new transaction ID
    pub fn generate() -> Self {
        let random: u64 = rand::thread_rng().gen();
        Self(format!("z9hG4bK{:x}", random))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Random From/To tag
pub fn generate_tag() -> String {
    let random: u32 = rand::thread_rng().gen();
    format!("{:08x}", random)
}

/// SIP URI value object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    user: Option<String>,
    /// Domain or IP address; IPv6 is kept without brackets
    host: String,
    port: Option<u16>,
}

/// Stands in for a bracketed IPv6 reference while rsip tokenizes the rest
const IPV6_PLACEHOLDER: &str = "ipv6-reference.invalid";

impl SipUri {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            user: Some(user.into()),
            host: host.into(),
            port,
        }
    }

    /// URI naming only a host, as servers and gateways often send
    pub fn host_only(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            user: None,
            host: host.into(),
            port,
        }
    }

    /// Parse a `sip:` or `sips:` URI, tolerating angle brackets and
    /// trailing URI parameters.
    pub fn parse(uri: &str) -> Result<Self, UaError> {
        let uri = uri.trim().trim_start_matches('<').trim_end_matches('>');

        // rsip splits host and port at the first ':'
        let (text, ipv6) = match (uri.find('['), uri.find(']')) {
            (Some(open), Some(close)) if open < close => {
                let address: Ipv6Addr = uri[open + 1..close]
                    .parse()
                    .map_err(|_| UaError::InvalidUri(format!("{}: bad IPv6 reference", uri)))?;
                let text = format!("{}{}{}", &uri[..open], IPV6_PLACEHOLDER, &uri[close + 1..]);
                (text, Some(address))
            }
            _ => (uri.to_string(), None),
        };

        let parsed = rsip::Uri::try_from(text.as_str())
            .map_err(|e| UaError::InvalidUri(format!("{}: {}", uri, e)))?;
        let mut sip_uri = Self::try_from(&parsed)
            .map_err(|e| UaError::InvalidUri(format!("{}: {}", uri, e)))?;
        if let Some(address) = ipv6 {
            sip_uri.host = address.to_string();
        }
        Ok(sip_uri)
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl TryFrom<&rsip::Uri> for SipUri {
    type Error = UaError;

    fn try_from(uri: &rsip::Uri) -> Result<Self, Self::Error> {
        match &uri.scheme {
            Some(rsip::Scheme::Sip) | Some(rsip::Scheme::Sips) => {}
            _ => return Err(UaError::InvalidUri("not a sip: URI".to_string())),
        }

        let host = uri.host().to_string();
        // rsip leaves a user containing '.' in front of the host
        let (user, host) = match (uri.user(), host.split_once('@')) {
            (None, Some((user, host))) => (Some(user.to_string()), host.to_string()),
            (user, _) => (user.map(str::to_string), host),
        };
        if user.as_deref() == Some("") {
            return Err(UaError::InvalidUri("empty user part".to_string()));
        }
        if host.is_empty() {
            return Err(UaError::InvalidUri("empty host".to_string()));
        }

        Ok(Self {
            user,
            host,
            port: uri.port().map(|p| *p.value()),
        })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Remote party of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    uri: SipUri,
    display_name: Option<String>,
}

impl PeerProfile {
    pub fn new(uri: SipUri, display_name: Option<String>) -> Self {
        Self { uri, display_name }
    }

    pub fn uri(&self) -> &SipUri {
        &self.uri
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }
}

impl From<SipUri> for PeerProfile {
    fn from(uri: SipUri) -> Self {
        Self::new(uri, None)
    }
}

/// Digest credentials handed to the transport when a request is challenged
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// The local identity a session group acts for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipProfile {
    uri: SipUri,
    display_name: Option<String>,
    credentials: Credentials,
    /// Keep the NAT binding alive even when the local address looks public
    send_keepalive: bool,
}

impl SipProfile {
    pub fn new(uri: SipUri, password: impl Into<String>) -> Self {
        let username = uri.user().unwrap_or_default().to_string();
        Self {
            uri,
            display_name: None,
            credentials: Credentials {
                username,
                password: password.into(),
            },
            send_keepalive: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Authenticate as a user other than the one in the address-of-record
    pub fn with_auth_username(mut self, username: impl Into<String>) -> Self {
        self.credentials.username = username.into();
        self
    }

    pub fn with_send_keepalive(mut self, send_keepalive: bool) -> Self {
        self.send_keepalive = send_keepalive;
        self
    }

    pub fn uri(&self) -> &SipUri {
        &self.uri
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn send_keepalive(&self) -> bool {
        self.send_keepalive
    }
}
