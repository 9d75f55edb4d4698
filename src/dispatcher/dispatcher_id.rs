use std::fmt::{Debug, Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

/// A dispatcher's identity: a short prefix naming the machine / worker, and a suffix that makes
///  the id unique per process lifetime.
///
/// The suffix is the start time in millis since the epoch, zero-padded to a fixed width. That
///  way, ids of dispatchers with the same prefix sort by start time, and the *last* id matching a
///  prefix belongs to the most recently started dispatcher.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DispatcherId {
    prefix: String,
    suffix: String,
}

impl DispatcherId {
    pub fn new(prefix: &str) -> DispatcherId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self::with_suffix(prefix, format!("{:013}", millis))
    }

    pub fn with_suffix(prefix: &str, suffix: impl Into<String>) -> DispatcherId {
        DispatcherId {
            prefix: prefix.to_string(),
            suffix: suffix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// the id's representation on the wire and in HTTP headers
    pub fn full(&self) -> String {
        format!("{} {}", self.prefix, self.suffix)
    }
}

impl Display for DispatcherId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.prefix, self.suffix)
    }
}

impl Debug for DispatcherId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dispatcher {}", self.prefix)
    }
}

/// The suffix part of a full id as it travels on the wire, used to order remotes by start time
pub fn suffix_of(full_id: &str) -> &str {
    full_id.split_once(' ')
        .map(|(_, suffix)| suffix)
        .unwrap_or(full_id)
}
