//! Hierarchical channel identifiers and glob matching.
//!
//! Channels form slash-separated paths. A trailing `*` segment matches any
//! channel exactly one level below the prefix; a trailing `**` matches any
//! channel strictly below the prefix at any depth. Wildcards are only valid
//! as the last segment.

use std::fmt;

use crate::error::MessageError;

/// Channel for the handshake exchange.
pub const META_HANDSHAKE: &str = "/meta/handshake";
/// Channel for the long-poll connect exchange.
pub const META_CONNECT: &str = "/meta/connect";
/// Channel for subscription requests.
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
/// Channel for unsubscription requests.
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";
/// Channel for the disconnect exchange.
pub const META_DISCONNECT: &str = "/meta/disconnect";

/// A parsed channel id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    name: String,
    segments: Vec<String>,
}

impl ChannelId {
    /// Parse a channel name.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::InvalidChannel`] when the name does not start
    /// with `/`, contains empty segments, or uses a wildcard in a non-final
    /// segment.
    pub fn parse(name: &str) -> Result<Self, MessageError> {
        let invalid = || MessageError::InvalidChannel(name.to_string());
        let rest = name.strip_prefix('/').ok_or_else(invalid)?;
        if rest.is_empty() || rest.ends_with('/') {
            return Err(invalid());
        }
        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        for (index, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(invalid());
            }
            let wild = segment == "*" || segment == "**";
            if wild && index != segments.len() - 1 {
                return Err(invalid());
            }
        }
        Ok(Self {
            name: name.to_string(),
            segments,
        })
    }

    /// The full channel name, including the leading `/`.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Number of path segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether this is a `/meta/*` channel.
    pub fn is_meta(&self) -> bool {
        self.segments.first().map(String::as_str) == Some("meta")
    }

    /// Whether this is a `/service/*` channel.
    pub fn is_service(&self) -> bool {
        self.segments.first().map(String::as_str) == Some("service")
    }

    /// Whether this is an application broadcast channel.
    pub fn is_broadcast(&self) -> bool {
        !self.is_meta() && !self.is_service()
    }

    /// Whether the last segment is a wildcard.
    pub fn is_wild(&self) -> bool {
        matches!(self.segments.last().map(String::as_str), Some("*" | "**"))
    }

    /// Whether the last segment is the recursive wildcard.
    pub fn is_deep_wild(&self) -> bool {
        self.segments.last().map(String::as_str) == Some("**")
    }

    /// Whether this channel matches `other`.
    ///
    /// A concrete channel matches only itself. A shallow glob matches
    /// channels exactly one level below its prefix; a deep glob matches any
    /// channel strictly below its prefix.
    pub fn matches(&self, other: &ChannelId) -> bool {
        if !self.is_wild() {
            return self == other;
        }
        let prefix = &self.segments[..self.segments.len() - 1];
        if other.segments.len() <= prefix.len() || other.segments[..prefix.len()] != *prefix {
            return false;
        }
        self.is_deep_wild() || other.segments.len() == prefix.len() + 1
    }

    /// The wildcard channels that match this concrete channel, in dispatch
    /// order: the shallow glob of the immediate parent first, then the deep
    /// globs from the deepest prefix up to `/**`.
    pub fn wilds(&self) -> Vec<String> {
        let count = self.segments.len();
        let mut wilds = Vec::with_capacity(count + 1);
        for level in (0..count).rev() {
            let prefix: String = self.segments[..level]
                .iter()
                .map(|segment| format!("/{segment}"))
                .collect();
            if level == count - 1 {
                wilds.push(format!("{prefix}/*"));
            }
            wilds.push(format!("{prefix}/**"));
        }
        wilds
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
