//! Version-controlled workspace for a claimed unit.
//!
//! Threads map to branches deterministically, uncommitted work survives
//! branch switches through labelled stashes, and pushes merge (never rebase)
//! when the remote has moved ahead.

mod git;

pub use git::{CommitOutcome, GitWorkspace, PushOutcome, STASH_PREFIX, changed_paths};

use sha2::{Digest, Sha256};

const MAX_SLUG_LEN: usize = 60;

/// Convert an identifier to a ref-safe slug, limited to `max_len` characters.
pub fn slugify(text: &str, max_len: usize) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Branch name for a thread: `thread-{threadId}`.
///
/// Ids that are not already ref-safe are slugged and get a short digest
/// suffix, so two ids never collapse onto one branch.
pub fn branch_for_thread(thread_id: &str) -> String {
    let slug = slugify(thread_id, MAX_SLUG_LEN);
    if !slug.is_empty() && slug == thread_id {
        return format!("thread-{}", slug);
    }
    let digest = format!("{:x}", Sha256::digest(thread_id.as_bytes()));
    let suffix = &digest[..8];
    if slug.is_empty() {
        format!("thread-{}", suffix)
    } else {
        format!("thread-{}-{}", slug, suffix)
    }
}
