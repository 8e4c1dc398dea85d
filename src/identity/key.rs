//! Session keys and the override grammar.
//!
//! A key is `owner,suffix`. Requesters normally work in `self,channel`; an
//! override may name a different suffix and, within the ownership rules, a
//! different owner.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::types::{EvalError, Result};
use crate::identity::name::FoldedName;

/// Suffix used for requests that did not come from a channel.
pub const PRIVATE_CHANNEL: &str = "_priv";

/// `[owner,][suffix]`: printable ASCII without comma or space, suffix also
/// allows characters from U+00A0 up and is at most 64 characters.
static OVERRIDE_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([!-+\--~]*),)?([!-+\--~\x{a0}-\x{10FFFF}]{1,64})?$")
        .unwrap_or_else(|e| panic!("invalid session key grammar: {}", e))
});

/// Canonical identifier of one persisted interpreter state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(FoldedName);

impl SessionKey {
    pub fn new(owner: &str, suffix: &str) -> Result<Self> {
        if owner.contains(',') {
            return Err(EvalError::InvalidKey(format!("owner {:?} contains a comma", owner)));
        }
        Ok(Self(FoldedName::new(format!("{},{}", owner, suffix))))
    }

    /// Parse a displayed key back; everything before the first comma is the owner.
    pub fn parse(text: &str) -> Result<Self> {
        match text.split_once(',') {
            Some((owner, suffix)) => Self::new(owner, suffix),
            None => Err(EvalError::InvalidKey(format!("{:?} has no owner part", text))),
        }
    }

    pub fn owner(&self) -> &str {
        self.as_str().split_once(',').map_or("", |(owner, _)| owner)
    }

    pub fn suffix(&self) -> &str {
        self.as_str().split_once(',').map_or("", |(_, suffix)| suffix)
    }

    /// Keys with an empty owner are shared by everyone.
    pub fn is_shared(&self) -> bool {
        self.owner().is_empty()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who is asking, and from where.
#[derive(Clone, Debug)]
pub struct Requester {
    pub user: String,
    pub channel: Option<String>,
    pub admin: bool,
}

impl Requester {
    pub fn new(user: impl Into<String>, channel: Option<&str>) -> Self {
        Self {
            user: user.into(),
            channel: channel.map(str::to_string),
            admin: false,
        }
    }

    pub fn with_admin(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    /// The channel, or [`PRIVATE_CHANNEL`] for private requests.
    pub fn channel_or_private(&self) -> &str {
        self.channel.as_deref().unwrap_or(PRIVATE_CHANNEL)
    }
}

/// Expand a user-supplied override into a full key.
///
/// Owner resolution: no owner part means the requester; `read_only`
/// lookups may name anyone; an empty owner is the shared namespace; the
/// requester's own name (any case) is allowed; admins may name anyone.
/// Everything else is [`EvalError::PermissionDenied`].
pub fn expand_session_key(requester: &Requester, override_key: &str, read_only: bool) -> Result<SessionKey> {
    let channel = requester.channel_or_private();
    if requester.user.contains(',') {
        return Err(EvalError::InvalidKey(format!(
            "requester {:?} contains a comma",
            requester.user
        )));
    }
    if channel.contains(',') {
        return Err(EvalError::InvalidKey(format!("channel {:?} contains a comma", channel)));
    }

    let captures = OVERRIDE_GRAMMAR.captures(override_key).ok_or_else(|| {
        EvalError::PermissionDenied(format!("malformed session key {:?}", override_key))
    })?;
    let suffix = captures.get(2).map_or(channel, |m| m.as_str());

    let owner = match captures.get(1).map(|m| m.as_str()) {
        None => requester.user.as_str(),
        Some(owner) if read_only => owner,
        Some("") => "",
        Some(owner) if FoldedName::new(owner).eq_str(&requester.user) => requester.user.as_str(),
        Some(owner) if requester.admin => owner,
        Some(owner) => {
            return Err(EvalError::PermissionDenied(format!(
                "{} may not write sessions owned by {}",
                requester.user, owner
            )))
        }
    };
    SessionKey::new(owner, suffix)
}

/// The key a requester works in until told otherwise.
pub fn default_session_key(requester: &Requester) -> Result<SessionKey> {
    expand_session_key(requester, "", false)
}
