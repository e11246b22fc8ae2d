//! Review thread fingerprints.
//!
//! Fingerprints are cheap summaries of unresolved review threads: enough for
//! classification and fix planning without fetching every comment body in
//! full. Full bodies are fetched lazily, only for threads the classifier
//! flags as needing context.

use serde::{Deserialize, Serialize};

use crate::collab::ReviewThread;
use crate::util::{digest_str, excerpt};

const EXCERPT_LEN: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentFingerprint {
    /// Provider comment id; absent on threads the provider cannot address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub digest: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadFingerprint {
    pub thread_id: String,
    /// The commented code has since changed.
    pub is_outdated: bool,
    pub comments: Vec<CommentFingerprint>,
}

impl ThreadFingerprint {
    /// Id of the first comment, used for acknowledgement replies.
    pub fn first_comment_id(&self) -> Option<&str> {
        self.comments.iter().find_map(|c| c.id.as_deref())
    }
}

pub fn fingerprint_thread(thread: &ReviewThread) -> ThreadFingerprint {
    ThreadFingerprint {
        thread_id: thread.id.clone(),
        is_outdated: thread.is_outdated,
        comments: thread
            .comments
            .iter()
            .map(|c| CommentFingerprint {
                id: c.id.clone(),
                path: c.path.clone(),
                line: c.line,
                digest: digest_str(&c.body),
                excerpt: excerpt(&c.body, EXCERPT_LEN),
            })
            .collect(),
    }
}
