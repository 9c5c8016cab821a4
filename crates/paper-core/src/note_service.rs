//! Server-side note store.
//!
//! Applies client patches under an optimistic-concurrency hash check, keeps
//! empty notes out of the backing store, and implements the recursive tree
//! operations. Every operation, reads included, takes one turn on a single FIFO
//! queue, so a mutation never observes a half-finished one. Events are emitted
//! inside the turn after the write has been persisted.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::diff3::{apply_patch, create_patch, Patch};
use crate::error::NoteError;
use crate::events::{EventBus, NoteEvent};
use crate::hash::{utf16_len, ContentHash};
use crate::path;
use crate::store::KeyValueStore;

pub type Result<T> = std::result::Result<T, NoteError>;

/// Maximum note length in UTF-16 code units.
pub const DEFAULT_MAX_NOTE_SIZE: usize = 100_000;

pub struct NoteService<S> {
    store: S,
    /// FIFO turn for every operation; tokio's Mutex is fair
    queue: Mutex<()>,
    max_size: usize,
    events: Arc<EventBus>,
}

impl<S: KeyValueStore> NoteService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            queue: Mutex::new(()),
            max_size: DEFAULT_MAX_NOTE_SIZE,
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bus carrying `NoteChanged` / `TreeChanged` events.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Current content of `id`, empty if the note does not exist.
    pub async fn get(&self, id: &str) -> Result<String> {
        let _turn = self.queue.lock().await;
        self.read(id).await
    }

    /// Apply a client patch, verifying the resulting content against `hash`.
    pub async fn apply_patch(
        &self,
        id: &str,
        patch: &Patch,
        hash: ContentHash,
        origin: Option<&str>,
    ) -> Result<()> {
        let _turn = self.queue.lock().await;

        let current = self.read(id).await?;
        let result = apply_patch(&current, patch)
            .filter(|result| ContentHash::of(result) == hash)
            .ok_or_else(|| NoteError::HashMismatch(id.to_string()))?;
        self.check_size(id, &result)?;

        if result == current {
            debug!("Patch for {} leaves content unchanged", id);
            return Ok(());
        }

        self.write(id, &current, &result, patch.clone(), hash, origin)
            .await
    }

    /// Replace the content of `id` with `text`. No-op if unchanged.
    pub async fn set_content(&self, id: &str, text: &str, origin: Option<&str>) -> Result<()> {
        let _turn = self.queue.lock().await;
        self.check_size(id, text)?;
        self.set_locked(id, text, origin).await
    }

    /// Existing notes in the notebook `id` belongs to: the root itself and
    /// everything under `{root}/`. Ids ending in `/` are skipped.
    pub async fn list_tree_ids(&self, id: &str) -> Result<Vec<String>> {
        let _turn = self.queue.lock().await;

        let root = path::root_id(id);
        if root.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        if self.store.get(root).await?.is_some() {
            ids.push(root.to_string());
        }
        ids.extend(
            self.store
                .keys_with_prefix(&format!("{root}/"))
                .await?
                .into_iter()
                .filter(|key| !key.ends_with('/')),
        );
        Ok(ids)
    }

    /// Existing notes strictly under `id`.
    pub async fn list_descendant_ids(&self, id: &str) -> Result<Vec<String>> {
        let _turn = self.queue.lock().await;
        self.descendants(id).await
    }

    /// Empty `id` and every existing note under it. Returns the emptied ids.
    pub async fn delete_recursively(&self, id: &str, origin: Option<&str>) -> Result<Vec<String>> {
        let _turn = self.queue.lock().await;

        let ids = self.subtree(id).await?;
        for note_id in &ids {
            self.set_locked(note_id, "", origin).await?;
        }
        if !ids.is_empty() {
            info!("Deleted {} note(s) under {}", ids.len(), id);
        }
        Ok(ids)
    }

    /// Move `from` and its subtree to `to`. Returns the `(from, to)` pairs moved.
    ///
    /// All checks run before the first write. Targets are written before any
    /// source is emptied.
    pub async fn move_recursively(
        &self,
        from: &str,
        to: &str,
        origin: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        let _turn = self.queue.lock().await;

        if path::is_within(to, from) || path::descendant_prefix(to).is_none() {
            return Err(NoteError::InvalidOperation {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let sources = self.subtree(from).await?;
        if sources.is_empty() {
            return Err(NoteError::NoteNotFound(from.to_string()));
        }
        if let Some(existing) = self.subtree(to).await?.into_iter().next() {
            return Err(NoteError::TargetAlreadyExists(existing));
        }

        let mut moves = Vec::with_capacity(sources.len());
        for source in sources {
            let content = self.read(&source).await?;
            let target = path::rebase(&source, from, to);
            moves.push((source, target, content));
        }

        for (_, target, content) in &moves {
            self.set_locked(target, content, origin).await?;
        }
        for (source, _, _) in &moves {
            self.set_locked(source, "", origin).await?;
        }

        info!("Moved {} note(s) from {} to {}", moves.len(), from, to);
        Ok(moves
            .into_iter()
            .map(|(source, target, _)| (source, target))
            .collect())
    }

    async fn read(&self, id: &str) -> Result<String> {
        Ok(self.store.get(id).await?.unwrap_or_default())
    }

    fn check_size(&self, id: &str, text: &str) -> Result<()> {
        let len = utf16_len(text);
        if len > self.max_size {
            return Err(NoteError::ExceededMaxSize {
                id: id.to_string(),
                len,
                max: self.max_size,
            });
        }
        Ok(())
    }

    async fn set_locked(&self, id: &str, text: &str, origin: Option<&str>) -> Result<()> {
        let current = self.read(id).await?;
        if current == text {
            return Ok(());
        }
        let patch = create_patch(&current, text);
        self.write(id, &current, text, patch, ContentHash::of(text), origin)
            .await
    }

    async fn write(
        &self,
        id: &str,
        before: &str,
        after: &str,
        patch: Patch,
        hash: ContentHash,
        origin: Option<&str>,
    ) -> Result<()> {
        if after.is_empty() {
            self.store.remove(id).await?;
        } else {
            self.store.upsert(id, after).await?;
        }
        debug!("Note {} updated ({})", id, hash);

        self.events.emit(NoteEvent::NoteChanged {
            id: id.to_string(),
            hash,
            patch,
            origin: origin.map(str::to_string),
        });
        if before.is_empty() != after.is_empty() {
            self.events.emit(NoteEvent::TreeChanged {
                root_id: path::root_id(id).to_string(),
            });
        }
        Ok(())
    }

    /// `id` (if it exists) followed by its existing descendants.
    async fn subtree(&self, id: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !id.is_empty() && self.store.get(id).await?.is_some() {
            ids.push(id.to_string());
        }
        ids.extend(self.descendants(id).await?);
        Ok(ids)
    }

    async fn descendants(&self, id: &str) -> Result<Vec<String>> {
        match path::descendant_prefix(id) {
            Some(prefix) => Ok(self.store.keys_with_prefix(&prefix).await?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StoreError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::timeout;

    fn service() -> NoteService<Arc<InMemoryStore>> {
        NoteService::new(Arc::new(InMemoryStore::new()))
    }

    async fn save(service: &NoteService<Arc<InMemoryStore>>, id: &str, text: &str) -> Result<()> {
        let current = service.get(id).await?;
        service
            .apply_patch(id, &create_patch(&current, text), ContentHash::of(text), None)
            .await
    }

    fn record(service: &NoteService<Arc<InMemoryStore>>) -> (Arc<StdMutex<Vec<NoteEvent>>>, crate::events::Subscription) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = service
            .events()
            .subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        (seen, sub)
    }

    /// Fails the first upsert, then behaves like `InMemoryStore`.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStore,
        failed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> crate::store::Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn upsert(&self, key: &str, value: &str) -> crate::store::Result<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Io("disk full".into()));
            }
            self.inner.upsert(key, value).await
        }

        async fn remove(&self, key: &str) -> crate::store::Result<()> {
            self.inner.remove(key).await
        }

        async fn keys_with_prefix(&self, prefix: &str) -> crate::store::Result<Vec<String>> {
            self.inner.keys_with_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_releases_the_queue() {
        let service = NoteService::new(FlakyStore::default());
        let (seen, _sub) = {
            let seen = Arc::new(StdMutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let sub = service
                .events()
                .subscribe(move |event| sink.lock().unwrap().push(event.clone()));
            (seen, sub)
        };

        let err = service
            .apply_patch("nb/a", &create_patch("", "first"), ContentHash::of("first"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NoteError::Store(StoreError::Io(_))));
        assert!(seen.lock().unwrap().is_empty());

        let wait = Duration::from_secs(5);
        let content = timeout(wait, service.get("nb/a")).await.unwrap().unwrap();
        assert_eq!(content, "");

        timeout(
            wait,
            service.apply_patch("nb/a", &create_patch("", "second"), ContentHash::of("second"), None),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(service.get("nb/a").await.unwrap(), "second");
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_note_reads_empty() {
        let service = service();
        assert_eq!(service.get("nothing/here").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_apply_patch_persists_and_notifies() {
        let service = service();
        let (seen, _sub) = record(&service);

        let patch = create_patch("", "hello");
        service
            .apply_patch("nb/a", &patch, ContentHash::of("hello"), Some("client-1"))
            .await
            .unwrap();

        assert_eq!(service.get("nb/a").await.unwrap(), "hello");
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            NoteEvent::NoteChanged {
                id: "nb/a".into(),
                hash: ContentHash::of("hello"),
                patch,
                origin: Some("client-1".into()),
            }
        );
        assert_eq!(
            seen[1],
            NoteEvent::TreeChanged {
                root_id: "nb".into()
            }
        );
    }

    #[tokio::test]
    async fn test_stale_hash_is_rejected_and_content_unchanged() {
        let service = service();
        save(&service, "n", "version 1").await.unwrap();

        // Patch computed against a base the server no longer has
        let stale = create_patch("version 0", "version 0!");
        let err = service
            .apply_patch("n", &stale, ContentHash::of("version 0!"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NoteError::HashMismatch(_)));

        // Patch applies but the client's hash is wrong
        let patch = create_patch("version 1", "version 2");
        let err = service
            .apply_patch("n", &patch, ContentHash::of("something else"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NoteError::HashMismatch(_)));

        assert_eq!(service.get("n").await.unwrap(), "version 1");
    }

    #[tokio::test]
    async fn test_oversized_content_never_persists() {
        let service = service().with_max_size(10);
        save(&service, "n", "short").await.unwrap();

        let err = save(&service, "n", "this is far too long").await.unwrap_err();
        assert!(matches!(err, NoteError::ExceededMaxSize { max: 10, .. }));
        assert_eq!(service.get("n").await.unwrap(), "short");

        let err = service.set_content("n", "also far too long", None).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ExceededMaxSize);
        assert_eq!(service.get("n").await.unwrap(), "short");
    }

    #[tokio::test]
    async fn test_size_limit_counts_utf16_units() {
        let service = service().with_max_size(4);
        // Two emoji are four UTF-16 units
        save(&service, "n", "😀😀").await.unwrap();
        assert!(save(&service, "n", "😀😀a").await.is_err());
    }

    #[tokio::test]
    async fn test_emptying_removes_row_and_notifies_tree() {
        let store = Arc::new(InMemoryStore::new());
        let service = NoteService::new(Arc::clone(&store));
        save(&service, "nb/x", "content").await.unwrap();
        assert_eq!(store.len(), 1);

        let (seen, _sub) = record(&service);
        save(&service, "nb/x", "").await.unwrap();
        assert!(store.is_empty());
        assert!(seen.lock().unwrap().contains(&NoteEvent::TreeChanged {
            root_id: "nb".into()
        }));
    }

    #[tokio::test]
    async fn test_edit_without_existence_flip_has_no_tree_event() {
        let service = service();
        save(&service, "nb/x", "one").await.unwrap();

        let (seen, _sub) = record(&service);
        save(&service, "nb/x", "two").await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], NoteEvent::NoteChanged { .. }));
    }

    #[tokio::test]
    async fn test_noop_patch_is_silent() {
        let service = service();
        save(&service, "n", "same").await.unwrap();

        let (seen, _sub) = record(&service);
        save(&service, "n", "same").await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_patches_on_same_base_one_wins() {
        let service = Arc::new(service());
        save(&service, "n", "base").await.unwrap();

        let a = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .apply_patch("n", &create_patch("base", "base A"), ContentHash::of("base A"), None)
                    .await
            })
        };
        let b = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .apply_patch("n", &create_patch("base", "base B"), ContentHash::of("base B"), None)
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let content = service.get("n").await.unwrap();
        assert!(content == "base A" || content == "base B");
    }

    #[tokio::test]
    async fn test_list_tree_ids() {
        let service = service();
        for id in ["nb", "nb/a", "nb/a/b", "nb2", "other/nb"] {
            save(&service, id, "x").await.unwrap();
        }

        assert_eq!(service.list_tree_ids("nb/a/b").await.unwrap(), vec!["nb", "nb/a", "nb/a/b"]);
        assert_eq!(service.list_tree_ids("nb2").await.unwrap(), vec!["nb2"]);
        assert!(service.list_tree_ids("").await.unwrap().is_empty());
        assert!(service.list_tree_ids("/nb").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_tree_ids_skips_trailing_slash_keys() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert("nb/dir/", "x").await.unwrap();
        store.upsert("nb/file", "x").await.unwrap();
        let service = NoteService::new(store);
        assert_eq!(service.list_tree_ids("nb").await.unwrap(), vec!["nb/file"]);
    }

    #[tokio::test]
    async fn test_list_descendant_ids() {
        let service = service();
        for id in ["x", "x/a", "x/a/b", "xy/c"] {
            save(&service, id, "x").await.unwrap();
        }

        assert_eq!(service.list_descendant_ids("x").await.unwrap(), vec!["x/a", "x/a/b"]);
        assert_eq!(service.list_descendant_ids("x/a").await.unwrap(), vec!["x/a/b"]);
        assert!(service.list_descendant_ids("x/").await.unwrap().is_empty());
        assert!(service.list_descendant_ids("/x").await.unwrap().is_empty());
        assert!(service.list_descendant_ids("/x/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_recursively_leaves_siblings() {
        let service = service();
        for (id, text) in [("root", "r"), ("root/a", "a"), ("root/a/b", "b"), ("root2", "sibling")] {
            save(&service, id, text).await.unwrap();
        }

        let deleted = service.delete_recursively("root", None).await.unwrap();
        assert_eq!(deleted, vec!["root", "root/a", "root/a/b"]);

        for id in ["root", "root/a", "root/a/b"] {
            assert_eq!(service.get(id).await.unwrap(), "");
        }
        assert_eq!(service.get("root2").await.unwrap(), "sibling");
    }

    #[tokio::test]
    async fn test_delete_recursively_nothing_is_noop() {
        let service = service();
        let (seen, _sub) = record(&service);
        assert!(service.delete_recursively("ghost", None).await.unwrap().is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_move_recursively() {
        let service = service();
        save(&service, "src", "parent text").await.unwrap();
        save(&service, "src/child", "child text").await.unwrap();

        let moved = service.move_recursively("src", "dst", None).await.unwrap();
        assert_eq!(
            moved,
            vec![
                ("src".to_string(), "dst".to_string()),
                ("src/child".to_string(), "dst/child".to_string()),
            ]
        );

        assert_eq!(service.get("dst").await.unwrap(), "parent text");
        assert_eq!(service.get("dst/child").await.unwrap(), "child text");
        assert_eq!(service.get("src").await.unwrap(), "");
        assert_eq!(service.get("src/child").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_move_only_descendants() {
        let service = service();
        save(&service, "src/only", "text").await.unwrap();

        service.move_recursively("src", "dst", None).await.unwrap();
        assert_eq!(service.get("dst/only").await.unwrap(), "text");
        assert_eq!(service.get("dst").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_move_into_own_subtree_is_invalid() {
        let service = service();
        save(&service, "a", "A").await.unwrap();
        save(&service, "a/b", "B").await.unwrap();

        let err = service.move_recursively("a", "a/b", None).await.unwrap_err();
        assert!(matches!(err, NoteError::InvalidOperation { .. }));
        let err = service.move_recursively("a", "a", None).await.unwrap_err();
        assert!(matches!(err, NoteError::InvalidOperation { .. }));

        assert_eq!(service.get("a").await.unwrap(), "A");
        assert_eq!(service.get("a/b").await.unwrap(), "B");
    }

    #[tokio::test]
    async fn test_move_missing_source_is_not_found() {
        let service = service();
        let err = service.move_recursively("ghost", "dst", None).await.unwrap_err();
        assert!(matches!(err, NoteError::NoteNotFound(_)));
    }

    #[tokio::test]
    async fn test_move_onto_existing_target_fails_before_writing() {
        let service = service();
        save(&service, "src", "s").await.unwrap();
        save(&service, "dst/deep", "d").await.unwrap();

        let err = service.move_recursively("src", "dst", None).await.unwrap_err();
        assert!(matches!(err, NoteError::TargetAlreadyExists(id) if id == "dst/deep"));
        assert_eq!(service.get("src").await.unwrap(), "s");
        assert_eq!(service.get("dst").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_move_to_parent_collides_with_itself() {
        let service = service();
        save(&service, "a/b", "B").await.unwrap();
        let err = service.move_recursively("a/b", "a", None).await.unwrap_err();
        assert!(matches!(err, NoteError::TargetAlreadyExists(_)));
    }
}
