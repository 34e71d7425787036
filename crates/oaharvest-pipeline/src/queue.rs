//! Entry work queue with resume filtering.
//!
//! Workers claim entry ids lock-free through an atomic cursor. The queue
//! is built straight from the state store: construction drops every entry
//! with nothing left to do, so a resumed run only touches real work.

use std::sync::atomic::{AtomicUsize, Ordering};

use oaharvest_store::StateStore;

use crate::entry::{Entry, StageStatus};
use crate::orchestrator::RunOptions;

/// Whether this stage should execute in this run.
pub(crate) fn stage_needs_run(status: StageStatus, attempts: u32, retry_cap: u32) -> bool {
    match status {
        StageStatus::Pending | StageStatus::InProgress => true,
        StageStatus::Success { .. } => false,
        StageStatus::Failed { reason } => reason.is_retryable() && attempts < retry_cap,
    }
}

/// Whether any stage of the entry has runnable work under the options.
pub fn needs_work(entry: &Entry, options: &RunOptions, retry_cap: u32) -> bool {
    let status = &entry.status;
    let attempts = &entry.attempts;

    if stage_needs_run(status.metadata, attempts.metadata, retry_cap) {
        return true;
    }
    if !status.metadata.is_success() {
        // terminal metadata failure blocks everything downstream
        return false;
    }
    if stage_needs_run(status.pdf, attempts.pdf, retry_cap) {
        return true;
    }
    if stage_needs_run(status.jats, attempts.jats, retry_cap) {
        return true;
    }
    if options.grobid
        && entry.artifacts.pdf
        && stage_needs_run(status.tei_pdf, attempts.tei_pdf, retry_cap)
    {
        return true;
    }
    if options.thumbnail && entry.artifacts.pdf && !entry.artifacts.thumbnails {
        return true;
    }
    if options.annotation && entry.artifacts.pdf && !entry.artifacts.ref_annotations {
        return true;
    }
    false
}

/// Lock-free queue of entry ids still carrying runnable work.
pub struct EntryQueue {
    ids: Vec<String>,
    cursor: AtomicUsize,
}

impl EntryQueue {
    /// Build the queue from candidate ids, keeping only entries the state
    /// store knows and that still have a runnable stage.
    pub fn resumable(
        ids: Vec<String>,
        store: &StateStore<Entry>,
        options: &RunOptions,
        retry_cap: u32,
    ) -> Self {
        let ids: Vec<String> = ids
            .into_iter()
            .filter(|id| {
                store
                    .get(id)
                    .is_some_and(|entry| needs_work(&entry, options, retry_cap))
            })
            .collect();
        log::debug!("{} entries in work queue", ids.len());
        Self {
            ids,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Claim the next entry id (lock-free).
    pub fn claim(&self) -> Option<&str> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.ids.get(i).map(String::as_str)
    }

    /// Entries left after resume filtering.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{FailureReason, Identifiers};

    #[test]
    fn stage_needs_run_rules() {
        assert!(stage_needs_run(StageStatus::Pending, 0, 3));
        assert!(stage_needs_run(StageStatus::InProgress, 0, 3));
        assert!(!stage_needs_run(StageStatus::success(), 0, 3));
        assert!(stage_needs_run(
            StageStatus::Failed {
                reason: FailureReason::HttpError
            },
            1,
            3
        ));
        // attempts at the cap: leave it failed
        assert!(!stage_needs_run(
            StageStatus::Failed {
                reason: FailureReason::HttpError
            },
            3,
            3
        ));
        // terminal reasons never re-run on plain resume
        assert!(!stage_needs_run(
            StageStatus::Failed {
                reason: FailureReason::InvalidContent
            },
            0,
            3
        ));
    }

    #[test]
    fn needs_work_blocked_by_terminal_metadata() {
        let mut entry = Entry::new("aaaabbbb".into(), Identifiers::default());
        entry.status.metadata = StageStatus::Failed {
            reason: FailureReason::Unresolved,
        };
        assert!(!needs_work(&entry, &RunOptions::default(), 3));
    }

    #[test]
    fn needs_work_sees_optional_stages() {
        let mut entry = Entry::new("aaaabbbb".into(), Identifiers::default());
        entry.status.metadata = StageStatus::success();
        entry.status.pdf = StageStatus::success();
        entry.status.jats = StageStatus::success();
        entry.artifacts.pdf = true;

        let plain = RunOptions::default();
        assert!(!needs_work(&entry, &plain, 3));

        let with_grobid = RunOptions {
            grobid: true,
            ..Default::default()
        };
        assert!(needs_work(&entry, &with_grobid, 3));

        entry.status.tei_pdf = StageStatus::success();
        entry.artifacts.tei_from_pdf = true;
        assert!(!needs_work(&entry, &with_grobid, 3));

        let with_thumbs = RunOptions {
            thumbnail: true,
            ..Default::default()
        };
        assert!(needs_work(&entry, &with_thumbs, 3));
    }

    fn store_with(dir: &std::path::Path, entries: &[Entry]) -> StateStore<Entry> {
        let store = StateStore::open(&dir.join("map.jsonl")).unwrap();
        for entry in entries {
            store.update(entry).unwrap();
        }
        store
    }

    #[test]
    fn resumable_drops_finished_and_unknown_entries() {
        let dir = tempfile::tempdir().unwrap();

        let fresh = Entry::new("aaaa0001".into(), Identifiers::default());

        let mut done = Entry::new("bbbb0002".into(), Identifiers::default());
        done.status.metadata = StageStatus::success();
        done.status.pdf = StageStatus::success();
        done.status.jats = StageStatus::success();

        let mut dead = Entry::new("cccc0003".into(), Identifiers::default());
        dead.status.metadata = StageStatus::Failed {
            reason: FailureReason::Unresolved,
        };

        let store = store_with(dir.path(), &[fresh, done, dead]);
        let queue = EntryQueue::resumable(
            vec![
                "aaaa0001".into(),
                "bbbb0002".into(),
                "cccc0003".into(),
                "not-in-store".into(),
            ],
            &store,
            &RunOptions::default(),
            3,
        );

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.claim(), Some("aaaa0001"));
        assert_eq!(queue.claim(), None);
    }

    #[test]
    fn claim_drains_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = Entry::new("aaaa0001".into(), Identifiers::default());
        let b = Entry::new("bbbb0002".into(), Identifiers::default());
        let store = store_with(dir.path(), &[a, b]);

        let queue = EntryQueue::resumable(
            vec!["aaaa0001".into(), "bbbb0002".into()],
            &store,
            &RunOptions::default(),
            3,
        );
        assert!(!queue.is_empty());
        assert_eq!(queue.claim(), Some("aaaa0001"));
        assert_eq!(queue.claim(), Some("bbbb0002"));
        assert_eq!(queue.claim(), None);
        assert_eq!(queue.claim(), None);
    }
}
