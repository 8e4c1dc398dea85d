//! Per-requester working sessions and held continuation lines.

use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::config::types::{EvalError, Result, WorkingConfig};
use crate::identity::key::{default_session_key, expand_session_key, Requester, SessionKey};
use crate::identity::name::FoldedName;
use crate::store::lru::BoundedLruCache;

fn non_zero(value: usize, what: &str) -> Result<NonZeroUsize> {
    NonZeroUsize::new(value).ok_or_else(|| EvalError::Config(format!("{} must be positive", what)))
}

type ChannelMap = BoundedLruCache<FoldedName, SessionKey>;

/// Remembers which session each requester is working in, per channel.
pub struct WorkingSessions {
    users: BoundedLruCache<FoldedName, Arc<ChannelMap>>,
    per_user: NonZeroUsize,
}

impl WorkingSessions {
    pub fn new(config: &WorkingConfig) -> Result<Self> {
        Ok(Self {
            users: BoundedLruCache::with_capacity(non_zero(config.max_users, "working.max_users")?),
            per_user: non_zero(config.max_per_user, "working.max_per_user")?,
        })
    }

    fn channels(&self, requester: &Requester) -> Arc<ChannelMap> {
        let per_user = self.per_user;
        self.users.get_or_insert_with(FoldedName::new(requester.user.as_str()), || {
            Arc::new(BoundedLruCache::with_capacity(per_user))
        })
    }

    /// The requester's current key on their channel, or the default.
    pub fn current(&self, requester: &Requester) -> Result<SessionKey> {
        let channel = FoldedName::new(requester.channel_or_private());
        match self.channels(requester).get(&channel) {
            Some(key) => Ok(key),
            None => default_session_key(requester),
        }
    }

    /// Switch to the session named by `override_key` and return its key.
    pub fn set_working(&self, requester: &Requester, override_key: &str) -> Result<SessionKey> {
        let key = expand_session_key(requester, override_key, false)?;
        let channel = FoldedName::new(requester.channel_or_private());
        self.channels(requester).set(channel, key.clone());
        Ok(key)
    }

    /// Go back to the default key.
    pub fn reset(&self, requester: &Requester) -> Result<SessionKey> {
        self.set_working(requester, "")
    }
}

type HoldKey = (FoldedName, Option<FoldedName>);

fn hold_key(requester: &Requester) -> HoldKey {
    (
        FoldedName::new(requester.user.as_str()),
        requester.channel.as_deref().map(FoldedName::new),
    )
}

/// Lines held back to be prepended to a requester's next request.
pub struct HoldBuffer {
    holds: BoundedLruCache<HoldKey, Vec<String>>,
    max_lines: usize,
    max_line_chars: usize,
}

/// Result of [`HoldBuffer::hold`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hold {
    Kept,
    /// Line limit passed; everything held was forgotten
    TooMany,
    /// Line longer than the per-line limit; everything held was forgotten
    TooLong,
}

impl HoldBuffer {
    pub fn new(config: &WorkingConfig) -> Result<Self> {
        Ok(Self {
            holds: BoundedLruCache::with_capacity(non_zero(config.max_holds, "working.max_holds")?),
            max_lines: config.max_held_lines,
            max_line_chars: config.max_held_line_chars,
        })
    }

    /// Hold one line. A rejected line also drops whatever was already held,
    /// so a partial definition never runs.
    pub fn hold(&self, requester: &Requester, line: &str) -> Hold {
        if line.chars().count() > self.max_line_chars {
            self.holds.delete(&hold_key(requester));
            return Hold::TooLong;
        }
        let line = line.to_string();
        let max_lines = self.max_lines;
        self.holds.update(hold_key(requester), Vec::new, |lines| {
            lines.push(line);
            if lines.len() > max_lines {
                lines.clear();
                Hold::TooMany
            } else {
                Hold::Kept
            }
        })
    }

    /// Remove and return everything held for the requester.
    pub fn take(&self, requester: &Requester) -> Vec<String> {
        self.holds.delete(&hold_key(requester)).unwrap_or_default()
    }

    /// Held lines followed by `command`, ready to submit. Empty when there is
    /// nothing to run.
    pub fn batch(&self, requester: &Requester, command: &str) -> Vec<String> {
        let mut lines = self.take(requester);
        if lines.is_empty() && command.trim().is_empty() {
            return lines;
        }
        lines.push(command.to_string());
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkingConfig {
        WorkingConfig {
            max_users: 2,
            max_per_user: 2,
            max_holds: 4,
            max_held_lines: 3,
            max_held_line_chars: 5,
        }
    }

    #[test]
    fn test_current_defaults_then_follows_set() {
        let working = WorkingSessions::new(&config()).unwrap();
        let alice = Requester::new("alice", Some("#j"));
        assert_eq!(working.current(&alice).unwrap().as_str(), "alice,#j");

        let key = working.set_working(&alice, "proj").unwrap();
        assert_eq!(key.as_str(), "alice,proj");
        assert_eq!(working.current(&Requester::new("ALICE", Some("#J"))).unwrap(), key);

        // other channel unaffected
        assert_eq!(
            working.current(&Requester::new("alice", None)).unwrap().as_str(),
            "alice,_priv"
        );
        assert_eq!(working.reset(&alice).unwrap().as_str(), "alice,#j");
    }

    #[test]
    fn test_set_working_enforces_ownership() {
        let working = WorkingSessions::new(&config()).unwrap();
        let alice = Requester::new("alice", Some("#j"));
        assert!(matches!(
            working.set_working(&alice, "bob,proj"),
            Err(EvalError::PermissionDenied(_))
        ));
        assert_eq!(working.current(&alice).unwrap().as_str(), "alice,#j");
    }

    #[test]
    fn test_least_recent_user_forgotten() {
        let working = WorkingSessions::new(&config()).unwrap();
        for user in ["a", "b", "c"] {
            working.set_working(&Requester::new(user, None), "custom").unwrap();
        }
        assert_eq!(working.current(&Requester::new("a", None)).unwrap().as_str(), "a,_priv");
        assert_eq!(working.current(&Requester::new("c", None)).unwrap().as_str(), "c,custom");
    }

    #[test]
    fn test_hold_and_take() {
        let holds = HoldBuffer::new(&config()).unwrap();
        let alice = Requester::new("alice", Some("#j"));
        assert_eq!(holds.hold(&alice, "f=:1"), Hold::Kept);
        assert_eq!(holds.hold(&alice, "y + 1"), Hold::Kept);
        assert_eq!(holds.batch(&alice, ")"), vec!["f=:1", "y + 1", ")"]);
        assert!(holds.take(&alice).is_empty());
    }

    #[test]
    fn test_hold_overflow_discards_everything() {
        let holds = HoldBuffer::new(&config()).unwrap();
        let bob = Requester::new("bob", None);
        for _ in 0..3 {
            assert_eq!(holds.hold(&bob, "x"), Hold::Kept);
        }
        assert_eq!(holds.hold(&bob, "x"), Hold::TooMany);
        assert!(holds.take(&bob).is_empty());
    }

    #[test]
    fn test_overlong_held_line_rejected_not_cut() {
        let holds = HoldBuffer::new(&config()).unwrap();
        let bob = Requester::new("bob", None);
        assert_eq!(holds.hold(&bob, "f=:1"), Hold::Kept);
        assert_eq!(holds.hold(&bob, "123456"), Hold::TooLong);
        assert!(holds.take(&bob).is_empty());
        // exactly at the limit is fine
        assert_eq!(holds.hold(&bob, "12345"), Hold::Kept);
        assert_eq!(holds.take(&bob), vec!["12345"]);
    }

    #[test]
    fn test_blank_batch_without_holds_is_empty() {
        let holds = HoldBuffer::new(&config()).unwrap();
        let bob = Requester::new("bob", None);
        assert!(holds.batch(&bob, "   ").is_empty());
        holds.hold(&bob, "1");
        assert_eq!(holds.batch(&bob, ""), vec!["1", ""]);
    }
}
