use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use anyhow::Result;
use tracing::{debug, warn};

use crate::api::ProgressBackend;
use crate::session::{ProgressRecord, UserChoice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    /// Same (frequency, position) as the last successful save and nothing
    /// newly completing; the network call was skipped entirely.
    SkippedDuplicate,
    /// The server already holds completed=true for this frequency; a
    /// non-completing write must never downgrade it.
    SkippedCompleted,
    /// Another save was in flight. Dropped, not queued.
    DroppedBusy,
}

/// Per-session progress adapter. The busy flag and dedupe key live on the
/// instance, so independent sessions (and tests) cannot contaminate each
/// other.
pub struct ProgressStore<B: ProgressBackend> {
    backend: B,
    in_flight: AtomicBool,
    last_saved: Mutex<Option<(String, usize)>>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<B: ProgressBackend> ProgressStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            in_flight: AtomicBool::new(false),
            last_saved: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Persist the cursor. At most one save is in flight at a time; a
    /// concurrent attempt is dropped rather than queued, so progress is
    /// eventually consistent, not every-increment-durable.
    pub async fn save_progress(
        &self,
        user_id: &str,
        frequency: &str,
        position: usize,
        completed: bool,
    ) -> Result<SaveOutcome> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!(frequency, position, "progress save already in flight; dropping");
            return Ok(SaveOutcome::DroppedBusy);
        }
        let _busy = BusyGuard(&self.in_flight);

        if !completed && self.is_duplicate(frequency, position) {
            return Ok(SaveOutcome::SkippedDuplicate);
        }

        if !completed {
            // Monotonic completion: re-read before a non-completing write
            // and refuse to flip a finished transmission back to open.
            match self.backend.read_progress(user_id, frequency).await {
                Ok(Some(record)) if record.completed => {
                    debug!(frequency, "refusing to downgrade completed progress");
                    self.remember(frequency, position);
                    return Ok(SaveOutcome::SkippedCompleted);
                }
                Ok(_) => {}
                Err(err) => {
                    // Unreadable server state: write anyway, the store is
                    // idempotent per write and the next save re-checks.
                    debug!(?err, frequency, "progress pre-read failed");
                }
            }
        }

        self.backend
            .write_progress(
                user_id,
                frequency,
                ProgressRecord {
                    position,
                    completed,
                },
            )
            .await?;
        self.remember(frequency, position);
        Ok(SaveOutcome::Written)
    }

    /// Upsert one (frequency, choiceId) record. Failures are logged and
    /// swallowed; the in-memory choice already drives branch resolution.
    pub async fn save_user_choice(&self, user_id: &str, choice: &UserChoice) {
        if let Err(err) = self.backend.write_choice(user_id, choice).await {
            warn!(
                ?err,
                frequency = %choice.frequency,
                choice_id = %choice.choice_id,
                "choice save failed; continuing with local record"
            );
        }
    }

    fn is_duplicate(&self, frequency: &str, position: usize) -> bool {
        self.last_saved
            .lock()
            .map(|last| {
                last.as_ref()
                    .is_some_and(|(freq, pos)| freq == frequency && *pos == position)
            })
            .unwrap_or(false)
    }

    fn remember(&self, frequency: &str, position: usize) {
        if let Ok(mut last) = self.last_saved.lock() {
            *last = Some((frequency.to_owned(), position));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ProgressStore, SaveOutcome};
    use crate::api::ProgressBackend;
    use crate::session::{ProgressRecord, UserChoice};
    use anyhow::{anyhow, Result};
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    #[derive(Default)]
    struct MockBackend {
        progress: Mutex<HashMap<String, ProgressRecord>>,
        choices: Mutex<Vec<UserChoice>>,
        write_count: AtomicUsize,
        fail_writes: AtomicBool,
        write_delay: Option<Duration>,
    }

    impl ProgressBackend for MockBackend {
        async fn read_progress(
            &self,
            _user_id: &str,
            frequency: &str,
        ) -> Result<Option<ProgressRecord>> {
            Ok(self.progress.lock().unwrap().get(frequency).copied())
        }

        async fn write_progress(
            &self,
            _user_id: &str,
            frequency: &str,
            record: ProgressRecord,
        ) -> Result<()> {
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(anyhow!("server unavailable"));
            }
            self.write_count.fetch_add(1, Ordering::SeqCst);
            self.progress
                .lock()
                .unwrap()
                .insert(frequency.to_owned(), record);
            Ok(())
        }

        async fn write_choice(&self, _user_id: &str, choice: &UserChoice) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(anyhow!("server unavailable"));
            }
            let mut choices = self.choices.lock().unwrap();
            // Server-side upsert: delete-then-insert per (frequency, choiceId).
            choices.retain(|existing| {
                !(existing.frequency == choice.frequency
                    && existing.choice_id == choice.choice_id)
            });
            choices.push(choice.clone());
            Ok(())
        }
    }

    fn choice(option_id: &str) -> UserChoice {
        UserChoice {
            frequency: "A".to_owned(),
            choice_id: "c1".to_owned(),
            option_id: option_id.to_owned(),
            text: option_id.to_uppercase(),
        }
    }

    #[tokio::test]
    async fn duplicate_save_is_suppressed() {
        let store = ProgressStore::new(MockBackend::default());
        let first = store.save_progress("u1", "A", 5, false).await.unwrap();
        let second = store.save_progress("u1", "A", 5, false).await.unwrap();
        assert_eq!(first, SaveOutcome::Written);
        assert_eq!(second, SaveOutcome::SkippedDuplicate);
        assert_eq!(store.backend().write_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_position_writes_again() {
        let store = ProgressStore::new(MockBackend::default());
        store.save_progress("u1", "A", 5, false).await.unwrap();
        let outcome = store.save_progress("u1", "A", 6, false).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Written);
        assert_eq!(store.backend().write_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn completed_record_is_never_downgraded() {
        let backend = MockBackend::default();
        backend.progress.lock().unwrap().insert(
            "A".to_owned(),
            ProgressRecord {
                position: 9,
                completed: true,
            },
        );
        let store = ProgressStore::new(backend);

        let outcome = store.save_progress("u1", "A", 2, false).await.unwrap();
        assert_eq!(outcome, SaveOutcome::SkippedCompleted);
        let record = store.backend().progress.lock().unwrap()["A"];
        assert!(record.completed);
        assert_eq!(record.position, 9);
    }

    #[tokio::test]
    async fn completing_save_always_goes_through() {
        let store = ProgressStore::new(MockBackend::default());
        store.save_progress("u1", "A", 5, false).await.unwrap();
        // Same position, but newly completing: not a duplicate.
        let outcome = store.save_progress("u1", "A", 5, true).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Written);
        assert!(store.backend().progress.lock().unwrap()["A"].completed);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_save_is_dropped_not_queued() {
        let store = std::sync::Arc::new(ProgressStore::new(MockBackend {
            write_delay: Some(Duration::from_secs(5)),
            ..MockBackend::default()
        }));

        let slow = {
            let store = store.clone();
            tokio::spawn(async move { store.save_progress("u1", "A", 1, false).await })
        };
        // Let the first save reach its backend write.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let second = store.save_progress("u1", "A", 2, false).await.unwrap();
        assert_eq!(second, SaveOutcome::DroppedBusy);

        let first = slow.await.unwrap().unwrap();
        assert_eq!(first, SaveOutcome::Written);
        assert_eq!(store.backend().write_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_write_releases_busy_flag() {
        let backend = MockBackend::default();
        backend.fail_writes.store(true, Ordering::SeqCst);
        let store = ProgressStore::new(backend);

        assert!(store.save_progress("u1", "A", 1, false).await.is_err());
        store.backend().fail_writes.store(false, Ordering::SeqCst);
        let outcome = store.save_progress("u1", "A", 1, false).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Written);
    }

    #[tokio::test]
    async fn choice_upsert_keeps_one_record_per_choice_id() {
        let store = ProgressStore::new(MockBackend::default());
        store.save_user_choice("u1", &choice("x")).await;
        store.save_user_choice("u1", &choice("x")).await;
        store.save_user_choice("u1", &choice("y")).await;

        let choices = store.backend().choices.lock().unwrap();
        assert_eq!(choices.len(), 1);
        assert_eq!(choices[0].option_id, "y");
    }

    #[tokio::test]
    async fn failed_choice_save_is_swallowed() {
        let backend = MockBackend::default();
        backend.fail_writes.store(true, Ordering::SeqCst);
        let store = ProgressStore::new(backend);
        // Must not panic or propagate.
        store.save_user_choice("u1", &choice("x")).await;
        assert!(store.backend().choices.lock().unwrap().is_empty());
    }
}
