use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a session id in canonical hyphenated UUID form.
pub const SESSION_ID_LEN: usize = 36;

const SEPARATOR: u8 = b':';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedKey {
    #[error("key is too short ({0} bytes)")]
    TooShort(usize),
    #[error("unknown keyspace tag {0:#04x}")]
    UnknownKeyspace(u8),
    #[error("missing ':' separator at offset {0}")]
    MissingSeparator(usize),
    #[error("malformed session segment")]
    MalformedSession,
    #[error("keyspace {0:?} requires a session id")]
    MissingSession(Keyspace),
    #[error("keyspace {0:?} does not carry a session id")]
    UnexpectedSession(Keyspace),
}

/// Logical partition of the shared store namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    /// Session payload, owned by whoever holds the session lock.
    SessionData,
    /// Session record: lock state, offload flags, forwarding pointer, processed requests.
    SessionMetadata,
    /// Per-node indicators.
    Node,
    /// Runtime configuration flags of this node.
    Config,
    /// The infrastructure tree.
    Infrastructure,
}

impl Keyspace {
    pub const ALL: [Keyspace; 5] = [
        Keyspace::SessionData,
        Keyspace::SessionMetadata,
        Keyspace::Node,
        Keyspace::Config,
        Keyspace::Infrastructure,
    ];

    pub fn tag(self) -> u8 {
        match self {
            Keyspace::SessionData => b'S',
            Keyspace::SessionMetadata => b'M',
            Keyspace::Node => b'N',
            Keyspace::Config => b'C',
            Keyspace::Infrastructure => b'I',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|keyspace| keyspace.tag() == tag)
    }

    pub fn is_session_scoped(self) -> bool {
        matches!(self, Keyspace::SessionData | Keyspace::SessionMetadata)
    }
}

/// Identifier of a session, always in canonical 36-character UUID form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random (v4) session id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().hyphenated().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, MalformedKey> {
        if raw.len() != SESSION_ID_LEN || uuid::Uuid::parse_str(raw).is_err() {
            return Err(MalformedKey::MalformedSession);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = MalformedKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = MalformedKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// A key in the shared store.
///
/// Equality and hashing cover the keyspace, the session id and the sub-key, so the same
/// sub-key under two sessions never collides. An empty sub-key and an absent one are the
/// same key: both encode to the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    keyspace: Keyspace,
    session_id: Option<SessionId>,
    sub_key: Vec<u8>,
}

impl StoreKey {
    /// Builds a key, checking that the session id is present exactly when the keyspace is
    /// session-scoped.
    pub fn new(
        keyspace: Keyspace,
        session_id: Option<SessionId>,
        sub_key: impl Into<Vec<u8>>,
    ) -> Result<Self, MalformedKey> {
        match (keyspace.is_session_scoped(), session_id.is_some()) {
            (true, false) => return Err(MalformedKey::MissingSession(keyspace)),
            (false, true) => return Err(MalformedKey::UnexpectedSession(keyspace)),
            _ => {}
        }

        Ok(Self {
            keyspace,
            session_id,
            sub_key: sub_key.into(),
        })
    }

    pub fn session_data(session_id: &SessionId, sub_key: impl Into<Vec<u8>>) -> Self {
        Self {
            keyspace: Keyspace::SessionData,
            session_id: Some(session_id.clone()),
            sub_key: sub_key.into(),
        }
    }

    pub fn session_metadata(session_id: &SessionId, sub_key: impl Into<Vec<u8>>) -> Self {
        Self {
            keyspace: Keyspace::SessionMetadata,
            session_id: Some(session_id.clone()),
            sub_key: sub_key.into(),
        }
    }

    pub fn node(sub_key: impl Into<Vec<u8>>) -> Self {
        Self::unscoped(Keyspace::Node, sub_key)
    }

    pub fn config(sub_key: impl Into<Vec<u8>>) -> Self {
        Self::unscoped(Keyspace::Config, sub_key)
    }

    pub fn infrastructure(sub_key: impl Into<Vec<u8>>) -> Self {
        Self::unscoped(Keyspace::Infrastructure, sub_key)
    }

    fn unscoped(keyspace: Keyspace, sub_key: impl Into<Vec<u8>>) -> Self {
        Self {
            keyspace,
            session_id: None,
            sub_key: sub_key.into(),
        }
    }

    pub fn keyspace(&self) -> Keyspace {
        self.keyspace
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn sub_key(&self) -> Option<&[u8]> {
        if self.sub_key.is_empty() {
            None
        } else {
            Some(&self.sub_key)
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let session_len = self.session_id.as_ref().map_or(0, |_| SESSION_ID_LEN + 1);
        let mut out = Vec::with_capacity(2 + session_len + self.sub_key.len());

        out.push(self.keyspace.tag());
        out.push(SEPARATOR);
        if let Some(session_id) = &self.session_id {
            out.extend_from_slice(session_id.as_str().as_bytes());
            out.push(SEPARATOR);
        }
        out.extend_from_slice(&self.sub_key);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedKey> {
        if bytes.len() < 2 {
            return Err(MalformedKey::TooShort(bytes.len()));
        }

        let keyspace = Keyspace::from_tag(bytes[0]).ok_or(MalformedKey::UnknownKeyspace(bytes[0]))?;
        if bytes[1] != SEPARATOR {
            return Err(MalformedKey::MissingSeparator(1));
        }

        if !keyspace.is_session_scoped() {
            return Ok(Self::unscoped(keyspace, &bytes[2..]));
        }

        let session_end = 2 + SESSION_ID_LEN;
        if bytes.len() <= session_end {
            return Err(MalformedKey::MalformedSession);
        }
        let raw_session = std::str::from_utf8(&bytes[2..session_end])
            .map_err(|_| MalformedKey::MalformedSession)?;
        let session_id = SessionId::parse(raw_session)?;
        if bytes[session_end] != SEPARATOR {
            return Err(MalformedKey::MissingSeparator(session_end));
        }

        Ok(Self {
            keyspace,
            session_id: Some(session_id),
            sub_key: bytes[session_end + 1..].to_vec(),
        })
    }

    /// Glob matching every key of a keyspace, e.g. `N:*`.
    pub fn keyspace_pattern(keyspace: Keyspace) -> Vec<u8> {
        vec![keyspace.tag(), SEPARATOR, b'*']
    }

    /// Glob matching every key of one session inside a session-scoped keyspace.
    pub fn session_pattern(keyspace: Keyspace, session_id: &SessionId) -> Vec<u8> {
        let mut pattern = Self::session_data(session_id, Vec::new()).encode();
        pattern[0] = keyspace.tag();
        pattern.push(b'*');
        pattern
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.encode()))
    }
}
