//! Transaction manager: at most one open transaction, disposed exactly once.

use crate::backend::{ConfigBackend, TransactionId};
use crate::document::ConfigDocument;
use crate::error::SyncError;

pub struct TransactionManager {
    backend: Box<dyn ConfigBackend>,
    active: Option<TransactionId>,
}

impl TransactionManager {
    pub fn new(backend: Box<dyn ConfigBackend>) -> Self {
        Self {
            backend,
            active: None,
        }
    }

    pub fn active(&self) -> Option<TransactionId> {
        self.active
    }

    pub fn start_transaction(&mut self) -> Result<TransactionId, SyncError> {
        if let Some(id) = self.active {
            return Err(SyncError::TransactionActive { id });
        }
        let id = self.backend.start_transaction()?;
        self.active = Some(id);
        Ok(id)
    }

    /// Document of the in-flight transaction.
    pub fn active_view(&mut self) -> Result<&mut ConfigDocument, SyncError> {
        let id = self.active.ok_or(SyncError::NoActiveTransaction)?;
        self.backend.document_mut(id)
    }

    /// Commit the in-flight transaction. The active id is cleared only on
    /// success; a failed commit is left for [`dispose`](Self::dispose).
    pub fn commit(&mut self) -> Result<bool, SyncError> {
        let id = self.active.ok_or(SyncError::NoActiveTransaction)?;
        let changed = self.backend.commit_transaction(id)?;
        self.active = None;
        Ok(changed)
    }

    /// Discard whatever transaction commit did not clear. No-op otherwise.
    pub fn dispose(&mut self) {
        let Some(id) = self.active.take() else {
            return;
        };
        tracing::debug!("disposing transaction {id}");
        if let Err(e) = self.backend.delete_transaction(id) {
            tracing::warn!("failed to delete transaction {id}: {e}");
        }
    }

    /// Open a transaction wrapped in a guard that disposes it when dropped.
    pub fn begin(&mut self) -> Result<TransactionGuard<'_>, SyncError> {
        let id = self.start_transaction()?;
        Ok(TransactionGuard { manager: self, id })
    }
}

/// Scope of one open transaction. Dropping the guard runs
/// [`TransactionManager::dispose`], so every exit path of a cycle discards an
/// uncommitted transaction.
pub struct TransactionGuard<'a> {
    manager: &'a mut TransactionManager,
    id: TransactionId,
}

impl TransactionGuard<'_> {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn view(&mut self) -> Result<&mut ConfigDocument, SyncError> {
        self.manager.active_view()
    }

    pub fn commit(&mut self) -> Result<bool, SyncError> {
        self.manager.commit()
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.manager.dispose();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory backend recording every call, with switchable failures.
    #[derive(Default)]
    pub(crate) struct MemoryBackend {
        pub(crate) journal: Arc<Mutex<Vec<String>>>,
        pub(crate) fail_start: bool,
        pub(crate) fail_commit: bool,
        pub(crate) next: u64,
        pub(crate) docs: std::collections::BTreeMap<TransactionId, ConfigDocument>,
        pub(crate) committed: Arc<Mutex<Option<String>>>,
    }

    impl MemoryBackend {
        fn log(&self, entry: String) {
            self.journal.lock().unwrap().push(entry);
        }
    }

    impl ConfigBackend for MemoryBackend {
        fn start_transaction(&mut self) -> Result<TransactionId, SyncError> {
            if self.fail_start {
                self.log("start failed".into());
                return Err(SyncError::NoActiveTransaction);
            }
            self.next += 1;
            let id = TransactionId(self.next);
            self.docs
                .insert(id, ConfigDocument::parse("global\n    daemon\n"));
            self.log(format!("start {id}"));
            Ok(id)
        }

        fn document(&self, id: TransactionId) -> Result<&ConfigDocument, SyncError> {
            self.docs.get(&id).ok_or(SyncError::UnknownTransaction { id })
        }

        fn document_mut(&mut self, id: TransactionId) -> Result<&mut ConfigDocument, SyncError> {
            self.docs
                .get_mut(&id)
                .ok_or(SyncError::UnknownTransaction { id })
        }

        fn commit_transaction(&mut self, id: TransactionId) -> Result<bool, SyncError> {
            if self.fail_commit {
                self.log(format!("commit {id} failed"));
                return Err(SyncError::Validation {
                    path: "memory".into(),
                    status: "exit status: 1".into(),
                    stderr: "rejected".into(),
                });
            }
            let doc = self
                .docs
                .remove(&id)
                .ok_or(SyncError::UnknownTransaction { id })?;
            *self.committed.lock().unwrap() = Some(doc.render());
            self.log(format!("commit {id}"));
            Ok(true)
        }

        fn delete_transaction(&mut self, id: TransactionId) -> Result<(), SyncError> {
            self.docs
                .remove(&id)
                .ok_or(SyncError::UnknownTransaction { id })?;
            self.log(format!("delete {id}"));
            Ok(())
        }
    }

    fn manager(backend: MemoryBackend) -> (TransactionManager, Arc<Mutex<Vec<String>>>) {
        let journal = Arc::clone(&backend.journal);
        (TransactionManager::new(Box::new(backend)), journal)
    }

    #[test]
    fn only_one_transaction_at_a_time() {
        let (mut tm, _) = manager(MemoryBackend::default());
        let id = tm.start_transaction().unwrap();
        assert!(matches!(
            tm.start_transaction(),
            Err(SyncError::TransactionActive { id: active }) if active == id
        ));
    }

    #[test]
    fn view_requires_an_open_transaction() {
        let (mut tm, _) = manager(MemoryBackend::default());
        assert!(matches!(
            tm.active_view(),
            Err(SyncError::NoActiveTransaction)
        ));
        assert!(matches!(tm.commit(), Err(SyncError::NoActiveTransaction)));
    }

    #[test]
    fn commit_clears_active_and_dispose_is_then_a_no_op() {
        let (mut tm, journal) = manager(MemoryBackend::default());
        {
            let mut tx = tm.begin().unwrap();
            tx.view()
                .unwrap()
                .set_section("backend web", vec!["server s1 10.0.0.1:80".into()]);
            assert!(tx.commit().unwrap());
        }
        assert!(tm.active().is_none());
        assert_eq!(*journal.lock().unwrap(), vec!["start 1", "commit 1"]);
    }

    #[test]
    fn guard_disposes_uncommitted_transaction() {
        let (mut tm, journal) = manager(MemoryBackend::default());
        {
            let _tx = tm.begin().unwrap();
        }
        assert!(tm.active().is_none());
        assert_eq!(*journal.lock().unwrap(), vec!["start 1", "delete 1"]);
        tm.start_transaction().unwrap();
    }

    #[test]
    fn failed_commit_is_disposed_by_the_guard() {
        let backend = MemoryBackend {
            fail_commit: true,
            ..MemoryBackend::default()
        };
        let (mut tm, journal) = manager(backend);
        {
            let mut tx = tm.begin().unwrap();
            assert!(tx.commit().is_err());
        }
        assert!(tm.active().is_none());
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["start 1", "commit 1 failed", "delete 1"]
        );
    }
}
