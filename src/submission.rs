//! Saved executions and the store that keeps them.

use serde_derive::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};

/// Identity of an authenticated caller, as handed over by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(pub String);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubmission {
    pub code: String,
    pub language: String,
    pub file_name: String,
    pub owner: CallerId,
    pub output: String,
    pub error: String,
    pub execution_time: String,
    pub graph: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: SubmissionId,
    pub code: String,
    pub language: String,
    pub file_name: String,
    pub owner: CallerId,
    pub output: String,
    pub error: String,
    pub execution_time: String,
    pub graph: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub submitted_at: u64,
}

impl Submission {
    pub fn is_owned_by(&self, caller: &CallerId) -> bool {
        &self.owner == caller
    }
}

/// Where finished executions are kept. Running code never depends on it.
pub trait SubmissionStore: Send + Sync {
    fn save(&self, submission: NewSubmission) -> Submission;

    /// All submissions of `owner`, newest first.
    fn list_for_owner(&self, owner: &CallerId) -> Vec<Submission>;

    fn get(&self, id: SubmissionId) -> Option<Submission>;

    /// Returns the removed submission, if there was one.
    fn delete(&self, id: SubmissionId) -> Option<Submission>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    next_id: AtomicU64,
    submissions: Mutex<HashMap<SubmissionId, Submission>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn submissions(&self) -> std::sync::MutexGuard<'_, HashMap<SubmissionId, Submission>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.submissions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SubmissionStore for MemoryStore {
    fn save(&self, new: NewSubmission) -> Submission {
        let id = SubmissionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let submitted_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let submission = Submission {
            id,
            code: new.code,
            language: new.language,
            file_name: new.file_name,
            owner: new.owner,
            output: new.output,
            error: new.error,
            execution_time: new.execution_time,
            graph: new.graph,
            submitted_at,
        };

        self.submissions().insert(id, submission.clone());
        submission
    }

    fn list_for_owner(&self, owner: &CallerId) -> Vec<Submission> {
        let mut found: Vec<_> = self
            .submissions()
            .values()
            .filter(|s| s.is_owned_by(owner))
            .cloned()
            .collect();

        // Ids are handed out in order, so they break timestamp ties.
        found.sort_by(|a, b| (b.submitted_at, b.id).cmp(&(a.submitted_at, a.id)));
        found
    }

    fn get(&self, id: SubmissionId) -> Option<Submission> {
        self.submissions().get(&id).cloned()
    }

    fn delete(&self, id: SubmissionId) -> Option<Submission> {
        self.submissions().remove(&id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_submission(owner: &str, code: &str) -> NewSubmission {
        NewSubmission {
            code: code.to_string(),
            language: "Python".to_string(),
            file_name: "Untitled".to_string(),
            owner: CallerId(owner.to_string()),
            output: String::new(),
            error: String::new(),
            execution_time: "0 ms".to_string(),
            graph: None,
        }
    }

    #[test]
    fn ids_are_distinct() {
        let store = MemoryStore::new();
        let a = store.save(new_submission("alice", "1"));
        let b = store.save(new_submission("alice", "2"));
        assert_ne!(a.id, b.id);
        assert_eq!(store.get(a.id).unwrap().code, "1");
    }

    #[test]
    fn listing_is_per_owner_and_newest_first() {
        let store = MemoryStore::new();
        store.save(new_submission("alice", "first"));
        store.save(new_submission("bob", "other"));
        store.save(new_submission("alice", "second"));

        let codes: Vec<_> = store
            .list_for_owner(&CallerId("alice".to_string()))
            .into_iter()
            .map(|s| s.code)
            .collect();
        assert_eq!(codes, vec!["second", "first"]);
    }

    #[test]
    fn delete_removes_once() {
        let store = MemoryStore::new();
        let saved = store.save(new_submission("alice", "x"));

        assert_eq!(store.delete(saved.id), Some(saved.clone()));
        assert_eq!(store.delete(saved.id), None);
        assert!(store.get(saved.id).is_none());
    }
}
