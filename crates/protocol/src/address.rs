//! Channel naming and composite addresses.
//!
//! A client announces who it is through the name of the channel it opens.
//! The host decodes that name, combines it with the session the channel
//! arrived from, and files the connection under the resulting [`Address`].
//!
//! ## Grammar
//!
//! ```text
//! portlink-<logicalName>                                   session-scoped
//! portlink.nosession-<logicalName>                         session-agnostic
//! portlink.nosession-<logicalName>-<sessionId>             session-agnostic, suffixed
//! portlink-[frame:<frameLocator>:frame]<logicalName>       frame-scoped
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix of session-scoped channel names.
pub const SESSION_PREFIX: &str = "portlink-";

/// Prefix of session-agnostic channel names.
pub const AGNOSTIC_PREFIX: &str = "portlink.nosession-";

/// Opens the frame locator inside a session-scoped name.
pub const FRAME_MARKER: &str = "[frame:";

/// Closes the frame locator inside a session-scoped name.
pub const FRAME_END_MARKER: &str = ":frame]";

/// Frame id of the primary context.
pub const BASE_FRAME: &str = "base";

/// Identifier of the addressable unit a client channel is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(SessionId)
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        SessionId(value)
    }
}

/// Identifier of a sub-context within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(String);

impl FrameId {
    /// The primary context's frame id.
    pub fn base() -> Self {
        FrameId(BASE_FRAME.to_string())
    }

    /// Whether this is the primary context.
    pub fn is_base(&self) -> bool {
        self.0 == BASE_FRAME
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FrameId {
    fn default() -> Self {
        Self::base()
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FrameId {
    fn from(value: &str) -> Self {
        FrameId(value.to_string())
    }
}

impl From<String> for FrameId {
    fn from(value: String) -> Self {
        FrameId(value)
    }
}

/// Composite key identifying one registered channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Caller-chosen name.
    pub logical_name: String,
    /// Session the channel is bound to, if any.
    pub session_id: Option<SessionId>,
    /// Sub-context within the session.
    pub frame_id: FrameId,
}

impl Address {
    /// Address of the base frame.
    pub fn new(logical_name: impl Into<String>, session_id: Option<SessionId>) -> Self {
        Self {
            logical_name: logical_name.into(),
            session_id,
            frame_id: FrameId::base(),
        }
    }

    /// The same address in another frame.
    pub fn with_frame(mut self, frame_id: impl Into<FrameId>) -> Self {
        self.frame_id = frame_id.into();
        self
    }

    /// The same address in the base frame.
    pub fn base(&self) -> Self {
        self.clone().with_frame(FrameId::base())
    }

    /// Key shared by every frame of this logical name and session.
    pub fn key(&self) -> String {
        match self.session_id {
            Some(session) => format!("{}-{}", self.logical_name, session),
            None => self.logical_name.clone(),
        }
    }

    pub fn is_base(&self) -> bool {
        self.frame_id.is_base()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_base() {
            f.write_str(&self.key())
        } else {
            write!(f, "{}#{}", self.key(), self.frame_id)
        }
    }
}

/// Which address scheme a channel name uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameScheme {
    /// The channel's ambient session becomes part of the address.
    SessionScoped,
    /// The address never carries a session.
    SessionAgnostic,
}

/// A decoded (or to-be-encoded) handshake name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelName {
    pub scheme: NameScheme,
    pub logical_name: String,
    /// Opaque frame locator, only for session-scoped names.
    pub frame: Option<String>,
}

impl ChannelName {
    pub fn session_scoped(logical_name: impl Into<String>) -> Self {
        Self {
            scheme: NameScheme::SessionScoped,
            logical_name: logical_name.into(),
            frame: None,
        }
    }

    pub fn session_agnostic(logical_name: impl Into<String>) -> Self {
        Self {
            scheme: NameScheme::SessionAgnostic,
            logical_name: logical_name.into(),
            frame: None,
        }
    }

    /// Session-agnostic name carrying an externally supplied session as suffix.
    ///
    /// The suffix stays part of the logical name, so the resulting key is the
    /// same as the key of `(logical_name, session_id)`.
    pub fn with_session_suffix(logical_name: &str, session_id: SessionId) -> Self {
        Self::session_agnostic(format!("{logical_name}-{session_id}"))
    }

    /// Session-scoped name for a sub-context identified by `locator`.
    pub fn framed(logical_name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            scheme: NameScheme::SessionScoped,
            logical_name: logical_name.into(),
            frame: Some(locator.into()),
        }
    }

    /// Render the wire name.
    pub fn encode(&self) -> String {
        match (self.scheme, &self.frame) {
            (NameScheme::SessionAgnostic, _) => format!("{AGNOSTIC_PREFIX}{}", self.logical_name),
            (NameScheme::SessionScoped, None) => format!("{SESSION_PREFIX}{}", self.logical_name),
            (NameScheme::SessionScoped, Some(locator)) => format!(
                "{SESSION_PREFIX}{FRAME_MARKER}{locator}{FRAME_END_MARKER}{}",
                self.logical_name
            ),
        }
    }

    /// Decode a wire name. Returns `None` for names that are not ours.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(rest) = raw.strip_prefix(AGNOSTIC_PREFIX) {
            return (!rest.is_empty()).then(|| Self::session_agnostic(rest));
        }

        let rest = raw.strip_prefix(SESSION_PREFIX)?;
        let parsed = match rest.strip_prefix(FRAME_MARKER) {
            Some(framed) => {
                let end = framed.find(FRAME_END_MARKER)?;
                let locator = &framed[..end];
                let name = &framed[end + FRAME_END_MARKER.len()..];
                if locator.is_empty() {
                    return None;
                }
                Self::framed(name, locator)
            }
            None => Self::session_scoped(rest),
        };

        (!parsed.logical_name.is_empty()).then_some(parsed)
    }

    /// Combine with the session the channel arrived from.
    pub fn address(&self, channel_session: Option<SessionId>) -> Address {
        let session_id = match self.scheme {
            NameScheme::SessionScoped => channel_session,
            NameScheme::SessionAgnostic => None,
        };
        let address = Address::new(self.logical_name.clone(), session_id);
        match &self.frame {
            Some(locator) => address.with_frame(locator.as_str()),
            None => address,
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_scoped_roundtrip() {
        let name = ChannelName::session_scoped("content");
        assert_eq!(name.encode(), "portlink-content");
        assert_eq!(ChannelName::parse("portlink-content"), Some(name));
    }

    #[test]
    fn test_session_agnostic_drops_channel_session() {
        let name = ChannelName::parse("portlink.nosession-popup").unwrap();
        assert_eq!(name.scheme, NameScheme::SessionAgnostic);
        let address = name.address(Some(SessionId(12)));
        assert_eq!(address.session_id, None);
        assert_eq!(address.key(), "popup");
    }

    #[test]
    fn test_session_scoped_uses_channel_session() {
        let name = ChannelName::parse("portlink-content").unwrap();
        let address = name.address(Some(SessionId(12)));
        assert_eq!(address.session_id, Some(SessionId(12)));
        assert_eq!(address.key(), "content-12");
        assert!(address.is_base());
    }

    #[test]
    fn test_suffixed_name_shares_key_with_session_address() {
        let name = ChannelName::with_session_suffix("panel", SessionId(7));
        assert_eq!(name.encode(), "portlink.nosession-panel-7");
        let decoded = ChannelName::parse(&name.encode()).unwrap();
        assert_eq!(
            decoded.address(None).key(),
            Address::new("panel", Some(SessionId(7))).key()
        );
    }

    #[test]
    fn test_framed_roundtrip() {
        let name = ChannelName::framed("widget", "https://example.com/embed?a=1");
        let wire = name.encode();
        assert_eq!(
            wire,
            "portlink-[frame:https://example.com/embed?a=1:frame]widget"
        );

        let decoded = ChannelName::parse(&wire).unwrap();
        assert_eq!(decoded, name);

        let address = decoded.address(Some(SessionId(3)));
        assert_eq!(address.key(), "widget-3");
        assert_eq!(address.frame_id.as_str(), "https://example.com/embed?a=1");
        assert!(!address.is_base());
    }

    #[test]
    fn test_foreign_names_are_ignored() {
        assert_eq!(ChannelName::parse("devtools-page"), None);
        assert_eq!(ChannelName::parse("portlink"), None);
        assert_eq!(ChannelName::parse(""), None);
    }

    #[test]
    fn test_empty_logical_name_is_ignored() {
        assert_eq!(ChannelName::parse("portlink-"), None);
        assert_eq!(ChannelName::parse("portlink.nosession-"), None);
        assert_eq!(ChannelName::parse("portlink-[frame:x:frame]"), None);
    }

    #[test]
    fn test_unterminated_frame_marker_is_ignored() {
        assert_eq!(ChannelName::parse("portlink-[frame:https://x/widget"), None);
        assert_eq!(ChannelName::parse("portlink-[frame::frame]widget"), None);
    }

    #[test]
    fn test_address_display() {
        let base = Address::new("content", Some(SessionId(5)));
        assert_eq!(base.to_string(), "content-5");
        let framed = base.clone().with_frame("ad-slot");
        assert_eq!(framed.to_string(), "content-5#ad-slot");
        assert_eq!(framed.base(), base);
    }

    #[test]
    fn test_session_id_parse_and_serde() {
        let id: SessionId = "42".parse().unwrap();
        assert_eq!(id, SessionId(42));
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        assert!("tab".parse::<SessionId>().is_err());
    }
}
