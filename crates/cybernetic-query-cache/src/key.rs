//! Cache keys and invalidation patterns.

use serde::{Deserialize, Serialize};

/// Key of a cached query result.
///
/// `query` names the derived query (and any parameters beyond triple
/// positions); the optional positions let writes invalidate precisely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub query: String,
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<String>,
}

impl QueryKey {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            subject: None,
            predicate: None,
            object: None,
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    pub fn object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }
}

/// Which cached entries to drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationPattern {
    /// Entries keyed on this subject
    Subject(String),
    /// Entries keyed on this predicate
    Predicate(String),
    /// Entries keyed on this object
    Object(String),
    /// Entries whose result could contain this triple: every bound
    /// position of the key agrees with it
    Triple {
        subject: String,
        predicate: String,
        object: String,
    },
    /// Everything
    AllQueries,
}

fn agrees(bound: &Option<String>, value: &str) -> bool {
    bound.as_deref().map_or(true, |b| b == value)
}

impl InvalidationPattern {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            InvalidationPattern::Subject(s) => key.subject.as_deref() == Some(s.as_str()),
            InvalidationPattern::Predicate(p) => key.predicate.as_deref() == Some(p.as_str()),
            InvalidationPattern::Object(o) => key.object.as_deref() == Some(o.as_str()),
            InvalidationPattern::Triple {
                subject,
                predicate,
                object,
            } => {
                agrees(&key.subject, subject)
                    && agrees(&key.predicate, predicate)
                    && agrees(&key.object, object)
            }
            InvalidationPattern::AllQueries => true,
        }
    }
}
