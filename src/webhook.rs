//! Push event payload structures

use serde::Deserialize;

/// Length of the commit id prefix used in logs and responses
pub const SHORT_COMMIT_LEN: usize = 7;

const UNKNOWN_COMMIT: &str = "unknown";
const NO_MESSAGE: &str = "No message";
const UNKNOWN_AUTHOR: &str = "Unknown";

/// Head commit details of a GitHub push payload. The branch comes from
/// `filter::should_deploy`, so `ref` is not read here.
///
/// Absent fields fall back to defaults, but a field present with the wrong
/// JSON type is a decoding error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushEvent {
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeadCommit {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author: Option<CommitAuthor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitAuthor {
    #[serde(default)]
    pub name: Option<String>,
}

impl PushEvent {
    pub fn from_value(value: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    /// Head commit id, or `"unknown"`
    pub fn commit_id(&self) -> &str {
        self.head_commit
            .as_ref()
            .and_then(|c| c.id.as_deref())
            .unwrap_or(UNKNOWN_COMMIT)
    }

    /// First seven characters of the head commit id
    pub fn short_commit_id(&self) -> String {
        self.commit_id().chars().take(SHORT_COMMIT_LEN).collect()
    }

    pub fn commit_message(&self) -> &str {
        self.head_commit
            .as_ref()
            .and_then(|c| c.message.as_deref())
            .unwrap_or(NO_MESSAGE)
    }

    pub fn author_name(&self) -> &str {
        self.head_commit
            .as_ref()
            .and_then(|c| c.author.as_ref())
            .and_then(|a| a.name.as_deref())
            .unwrap_or(UNKNOWN_AUTHOR)
    }
}
