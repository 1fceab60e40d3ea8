use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use creel_crypto::{KEY_SIZE, decrypt_message, encrypt_message, keys::derive_conversation_key};
use creel_store::Database;
use creel_types::api::MessageView;
use creel_types::events::RealtimeEvent;
use creel_types::models::{Message, Namespace};

use crate::{EngineError, Result};

/// Shown in place of a body that fails authentication on decrypt. The
/// failure never propagates out of a load; presentation code only ever
/// sees this string.
pub const DECRYPT_PLACEHOLDER: &str = "[unable to decrypt]";

type PairKey = (Uuid, Uuid);

/// Orchestrates the store, the cipher and event publication for all
/// sessions of one process.
pub struct ThreadEngine {
    db: Arc<Database>,
    events: broadcast::Sender<RealtimeEvent>,
    /// Conversation keys, derived once per account pair and reused for
    /// every message between them.
    keys: Mutex<HashMap<PairKey, [u8; KEY_SIZE]>>,
}

impl ThreadEngine {
    pub fn new(db: Arc<Database>, events: broadcast::Sender<RealtimeEvent>) -> Self {
        Self {
            db,
            events,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn key_for(&self, a: Uuid, b: Uuid) -> Result<[u8; KEY_SIZE]> {
        let pair = if a <= b { (a, b) } else { (b, a) };

        if let Ok(cache) = self.keys.lock() {
            if let Some(key) = cache.get(&pair) {
                return Ok(*key);
            }
        }

        let key = derive_conversation_key(a, b)?;
        if let Ok(mut cache) = self.keys.lock() {
            cache.insert(pair, key);
        }
        Ok(key)
    }

    /// Decrypt a single stored message into its presentation shape,
    /// substituting the placeholder on any failure (fail-closed).
    pub fn decrypt_one(&self, message: &Message) -> MessageView {
        let content = self
            .key_for(message.sender, message.recipient)
            .and_then(|key| {
                decrypt_message(&key, &message.ciphertext, &message.nonce)
                    .map_err(EngineError::from)
            })
            .and_then(|bytes| {
                String::from_utf8(bytes).map_err(|_| EngineError::DecryptionFailed)
            });

        let content = match content {
            Ok(text) => text,
            Err(_) => {
                warn!("failed to decrypt message {}", message.id);
                DECRYPT_PLACEHOLDER.to_string()
            }
        };

        view_of(message, content)
    }

    /// Batch-decrypt stored rows in order. One bad row yields a placeholder
    /// entry; it never fails the batch.
    pub fn decrypt_batch(&self, messages: &[Message]) -> Vec<MessageView> {
        messages.iter().map(|m| self.decrypt_one(m)).collect()
    }

    /// One decrypted summary row per thread visible to the account,
    /// newest first.
    pub async fn list_conversations(
        &self,
        account: Uuid,
        namespace: Namespace,
        include_archived: bool,
    ) -> Result<Vec<MessageView>> {
        let db = self.db.clone();
        let rows = run_blocking(move || db.list_conversations(account, namespace, include_archived))
            .await?;
        Ok(self.decrypt_batch(&rows))
    }

    /// Full decrypted history of a thread from the account's point of
    /// view: rows the account has soft-deleted are filtered out.
    pub async fn load_thread(&self, account: Uuid, thread_root: Uuid) -> Result<Vec<MessageView>> {
        let db = self.db.clone();
        let rows = run_blocking(move || db.load_thread(thread_root)).await?;
        let visible: Vec<Message> = rows
            .into_iter()
            .filter(|m| !m.deleted_by(account))
            .collect();
        Ok(self.decrypt_batch(&visible))
    }

    /// Encrypt and append a message. With no `thread_root` this starts a
    /// new conversation whose root id becomes the thread root; with one,
    /// the recipient is resolved from the thread and the `recipient`
    /// argument is ignored.
    pub async fn send(
        &self,
        sender: Uuid,
        recipient: Uuid,
        namespace: Namespace,
        thread_root: Option<Uuid>,
        content: &str,
    ) -> Result<MessageView> {
        if content.trim().is_empty() {
            return Err(EngineError::InvalidInput("empty message content".into()));
        }

        let message = match thread_root {
            None => {
                if sender == recipient {
                    return Err(EngineError::InvalidInput(
                        "sender and recipient are the same account".into(),
                    ));
                }
                let key = self.key_for(sender, recipient)?;
                let (ciphertext, nonce) = encrypt_message(&key, content.as_bytes())?;
                let db = self.db.clone();
                run_blocking(move || {
                    db.create_root(sender, recipient, namespace, &ciphertext, &nonce)
                })
                .await?
            }
            Some(root_id) => {
                let db = self.db.clone();
                let root = run_blocking(move || db.get_message(root_id)).await?;
                // Outsiders learn nothing about foreign threads.
                let recipient = root
                    .other_party(sender)
                    .ok_or(EngineError::NotFound)?;
                if root.namespace != namespace {
                    return Err(EngineError::NotFound);
                }

                let key = self.key_for(sender, recipient)?;
                let (ciphertext, nonce) = encrypt_message(&key, content.as_bytes())?;
                let db = self.db.clone();
                // Any message id in the thread resolves to its root.
                let root_id = root.thread_root;
                run_blocking(move || {
                    db.append_reply(root_id, sender, recipient, &ciphertext, &nonce)
                })
                .await?
            }
        };

        let _ = self.events.send(RealtimeEvent::MessageCreated {
            message: message.clone(),
        });

        Ok(view_of(&message, content.to_string()))
    }

    /// Mark every unread message addressed to the account in a thread as
    /// read. Best-effort: one failed row is logged and skipped, the rest
    /// still get marked. Returns the number of messages newly marked.
    pub async fn mark_thread_read(&self, account: Uuid, thread_root: Uuid) -> Result<usize> {
        let db = self.db.clone();
        let rows = run_blocking(move || db.load_thread(thread_root)).await?;

        let mut marked = 0;
        for msg in rows {
            if msg.recipient != account || msg.is_read {
                continue;
            }
            match self.mark_read(msg.id, account).await {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(e) => warn!("mark_read failed for message {}: {e}", msg.id),
            }
        }
        Ok(marked)
    }

    /// Mark a single message read. Idempotent; publishes a `MessageRead`
    /// event only when this call actually flipped the flag.
    pub async fn mark_read(&self, message_id: Uuid, reader: Uuid) -> Result<bool> {
        let db = self.db.clone();
        let read_at = run_blocking(move || db.mark_read(message_id, reader)).await?;

        let Some(read_at) = read_at else {
            return Ok(false);
        };

        let db = self.db.clone();
        match run_blocking(move || db.get_message(message_id)).await {
            Ok(msg) => {
                let _ = self.events.send(RealtimeEvent::MessageRead {
                    message_id,
                    thread_root: msg.thread_root,
                    namespace: msg.namespace,
                    sender: msg.sender,
                    recipient: msg.recipient,
                    read_at,
                });
            }
            Err(e) => warn!("read event skipped for message {message_id}: {e}"),
        }
        Ok(true)
    }

    /// Archive or unarchive the whole thread containing the given message,
    /// for the acting participant only. Reversible.
    pub async fn set_archived(&self, message_id: Uuid, actor: Uuid, value: bool) -> Result<()> {
        let db = self.db.clone();
        let msg = run_blocking(move || db.get_message(message_id)).await?;
        if !msg.is_participant(actor) {
            return Err(EngineError::NotFound);
        }

        let db = self.db.clone();
        run_blocking(move || db.set_archived_thread(msg.thread_root, actor, value)).await?;
        Ok(())
    }

    /// Soft-delete the actor's side of a thread; messages discarded by
    /// both sides are purged for good. Returns the purge count.
    pub async fn delete_thread(&self, thread_root: Uuid, actor: Uuid) -> Result<usize> {
        let db = self.db.clone();
        Ok(run_blocking(move || db.set_deleted(thread_root, actor)).await?)
    }

    pub async fn count_unread(&self, account: Uuid, namespace: Namespace) -> Result<u64> {
        let db = self.db.clone();
        Ok(run_blocking(move || db.count_unread(account, namespace)).await?)
    }
}

fn view_of(message: &Message, content: String) -> MessageView {
    MessageView {
        id: message.id,
        sender: message.sender,
        recipient: message.recipient,
        namespace: message.namespace,
        thread_root: message.thread_root,
        parent: message.parent,
        content,
        created_at: message.created_at,
        read_at: message.read_at,
        is_read: message.is_read,
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> creel_store::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::StoreUnavailable(format!("blocking task failed: {e}")))?
        .map_err(EngineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<ThreadEngine> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (tx, _) = broadcast::channel(64);
        Arc::new(ThreadEngine::new(db, tx))
    }

    #[tokio::test]
    async fn send_then_read_round_trip() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let sent = eng
            .send(a, b, Namespace::Site, None, "hello")
            .await
            .unwrap();
        assert_eq!(sent.thread_root, sent.id);

        let thread = eng.load_thread(b, sent.thread_root).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].content, "hello");
    }

    #[tokio::test]
    async fn unread_count_scenario() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let sent = eng
            .send(a, b, Namespace::Site, None, "hello")
            .await
            .unwrap();
        assert_eq!(eng.count_unread(b, Namespace::Site).await.unwrap(), 1);

        // B opens the thread
        let marked = eng.mark_thread_read(b, sent.thread_root).await.unwrap();
        assert_eq!(marked, 1);
        assert_eq!(eng.count_unread(b, Namespace::Site).await.unwrap(), 0);

        let thread = eng.load_thread(b, sent.thread_root).await.unwrap();
        assert!(thread[0].is_read);
    }

    #[tokio::test]
    async fn reply_resolves_recipient_from_thread() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let root = eng
            .send(a, b, Namespace::Forum, None, "salut")
            .await
            .unwrap();
        // The recipient argument is ignored on replies; the thread decides.
        let reply = eng
            .send(b, Uuid::new_v4(), Namespace::Forum, Some(root.id), "noroc")
            .await
            .unwrap();

        assert_eq!(reply.recipient, a);
        assert_eq!(reply.thread_root, root.id);
        assert_eq!(reply.parent, Some(root.id));
    }

    #[tokio::test]
    async fn outsider_cannot_reply() {
        let eng = engine();
        let (a, b, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let root = eng.send(a, b, Namespace::Site, None, "hi").await.unwrap();

        let err = eng
            .send(outsider, a, Namespace::Site, Some(root.id), "let me in")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound));
    }

    #[tokio::test]
    async fn empty_content_rejected_before_io() {
        let eng = engine();
        let err = eng
            .send(Uuid::new_v4(), Uuid::new_v4(), Namespace::Site, None, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn namespaces_never_mix() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let root = eng.send(a, b, Namespace::Site, None, "site-side").await.unwrap();

        // Replying into the same thread from the other namespace fails
        let err = eng
            .send(b, a, Namespace::Forum, Some(root.id), "forum-side")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound));

        assert_eq!(
            eng.list_conversations(b, Namespace::Forum, false).await.unwrap().len(),
            0
        );
        assert_eq!(
            eng.list_conversations(b, Namespace::Site, false).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn undecryptable_row_becomes_placeholder() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (tx, _) = broadcast::channel(64);
        let eng = ThreadEngine::new(db.clone(), tx);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        // A row whose ciphertext never came from our cipher
        let bogus = db
            .create_root(a, b, Namespace::Site, b"not-a-ciphertext", b"bad nonce 12")
            .unwrap();

        let thread = eng.load_thread(b, bogus.id).await.unwrap();
        assert_eq!(thread[0].content, DECRYPT_PLACEHOLDER);
    }

    #[tokio::test]
    async fn mutual_delete_scenario() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let root = eng.send(a, b, Namespace::Site, None, "hi").await.unwrap();

        eng.delete_thread(root.id, a).await.unwrap();
        // B still sees the conversation
        assert_eq!(
            eng.list_conversations(b, Namespace::Site, false).await.unwrap().len(),
            1
        );
        // A no longer does, and A's thread view is empty
        assert!(eng.list_conversations(a, Namespace::Site, false).await.unwrap().is_empty());
        assert!(eng.load_thread(a, root.id).await.unwrap().is_empty());

        let purged = eng.delete_thread(root.id, b).await.unwrap();
        assert_eq!(purged, 1);
        assert!(eng.load_thread(b, root.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archive_scenario() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let root = eng.send(a, b, Namespace::Site, None, "hi").await.unwrap();

        eng.set_archived(root.id, a, true).await.unwrap();
        assert!(eng.list_conversations(a, Namespace::Site, false).await.unwrap().is_empty());
        assert_eq!(
            eng.list_conversations(a, Namespace::Site, true).await.unwrap().len(),
            1
        );
        assert_eq!(
            eng.list_conversations(b, Namespace::Site, false).await.unwrap().len(),
            1
        );

        eng.set_archived(root.id, a, false).await.unwrap();
        assert_eq!(
            eng.list_conversations(a, Namespace::Site, false).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn send_publishes_created_event() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (tx, mut rx) = broadcast::channel(64);
        let eng = ThreadEngine::new(db, tx);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let sent = eng.send(a, b, Namespace::Site, None, "ping").await.unwrap();

        match rx.try_recv().unwrap() {
            RealtimeEvent::MessageCreated { message } => assert_eq!(message.id, sent.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_event_fires_once() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (tx, mut rx) = broadcast::channel(64);
        let eng = ThreadEngine::new(db, tx);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let sent = eng.send(a, b, Namespace::Site, None, "ping").await.unwrap();
        let _ = rx.try_recv().unwrap(); // MessageCreated

        assert!(eng.mark_read(sent.id, b).await.unwrap());
        assert!(matches!(
            rx.try_recv().unwrap(),
            RealtimeEvent::MessageRead { .. }
        ));

        // Idempotent repeat: no second event
        assert!(!eng.mark_read(sent.id, b).await.unwrap());
        assert!(rx.try_recv().is_err());
    }
}
