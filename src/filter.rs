//! Decides whether a delivery warrants a deployment

use serde_json::Value;

pub const PUSH_EVENT: &str = "push";
pub const BRANCH_REF_PREFIX: &str = "refs/heads/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed { branch: String },
    IgnoredWrongEvent { event: String },
    IgnoredWrongBranch { branch: String },
}

/// Strips `refs/heads/` from a git reference. Tags and other refs are
/// returned unchanged and so never match a branch name.
pub fn branch_from_ref(reference: &str) -> &str {
    reference
        .strip_prefix(BRANCH_REF_PREFIX)
        .unwrap_or(reference)
}

/// Pure decision over the `X-GitHub-Event` header and the decoded payload.
/// A missing header counts as an empty event type.
pub fn should_deploy(
    event_type: Option<&str>,
    payload: &Value,
    allowed_branches: &[String],
) -> Decision {
    let event = event_type.unwrap_or_default();
    if event != PUSH_EVENT {
        return Decision::IgnoredWrongEvent {
            event: event.to_string(),
        };
    }

    let reference = payload.get("ref").and_then(Value::as_str).unwrap_or_default();
    let branch = branch_from_ref(reference);

    if allowed_branches.iter().any(|b| b == branch) {
        Decision::Proceed {
            branch: branch.to_string(),
        }
    } else {
        Decision::IgnoredWrongBranch {
            branch: branch.to_string(),
        }
    }
}
