use std::sync::Arc;

use uuid::Uuid;

use creel_types::api::MessageView;
use creel_types::models::Namespace;

use crate::engine::ThreadEngine;
use crate::{EngineError, Result};

/// Lifecycle of one open thread view.
///
/// `Idle → Loading → Ready ⇄ Sending`, and `Ready → Closed` on navigation
/// away. `Sending` exists while an optimistic entry awaits its store
/// confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Idle,
    Loading,
    Ready,
    Sending,
    Closed,
}

/// One rendered list entry: either an optimistic local send awaiting
/// confirmation, or a message confirmed by the store. Reconciled by id
/// when the confirmation or a duplicate realtime event arrives.
#[derive(Debug, Clone)]
pub enum ThreadEntry {
    Pending { token: Uuid, content: String },
    Confirmed(MessageView),
}

impl ThreadEntry {
    pub fn confirmed_id(&self) -> Option<Uuid> {
        match self {
            Self::Confirmed(view) => Some(view.id),
            Self::Pending { .. } => None,
        }
    }
}

/// One account's open view of one conversation.
pub struct ThreadView {
    engine: Arc<ThreadEngine>,
    account: Uuid,
    other_party: Uuid,
    namespace: Namespace,
    /// `None` until the first send of a brand-new conversation creates the
    /// root; that root's id is adopted as thread root from then on.
    thread_root: Option<Uuid>,
    state: ViewState,
    entries: Vec<ThreadEntry>,
}

impl ThreadView {
    /// View over an existing thread.
    pub fn for_thread(
        engine: Arc<ThreadEngine>,
        account: Uuid,
        other_party: Uuid,
        namespace: Namespace,
        thread_root: Uuid,
    ) -> Self {
        Self {
            engine,
            account,
            other_party,
            namespace,
            thread_root: Some(thread_root),
            state: ViewState::Idle,
            entries: Vec::new(),
        }
    }

    /// View for a conversation that does not exist yet.
    pub fn new_conversation(
        engine: Arc<ThreadEngine>,
        account: Uuid,
        other_party: Uuid,
        namespace: Namespace,
    ) -> Self {
        Self {
            engine,
            account,
            other_party,
            namespace,
            thread_root: None,
            state: ViewState::Idle,
            entries: Vec::new(),
        }
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn thread_root(&self) -> Option<Uuid> {
        self.thread_root
    }

    pub fn entries(&self) -> &[ThreadEntry] {
        &self.entries
    }

    /// Load the history and mark everything addressed to us as read.
    /// Read-marking is batched and best-effort; a marking failure never
    /// fails the load.
    pub async fn open(&mut self) -> Result<()> {
        if self.state != ViewState::Idle {
            return Err(EngineError::InvalidInput(
                "view already opened".into(),
            ));
        }
        self.state = ViewState::Loading;

        let Some(root) = self.thread_root else {
            // New conversation: nothing stored yet.
            self.state = ViewState::Ready;
            return Ok(());
        };

        let loaded = match self.engine.load_thread(self.account, root).await {
            Ok(views) => views,
            Err(e) => {
                self.state = ViewState::Idle;
                return Err(e);
            }
        };
        self.entries = loaded.into_iter().map(ThreadEntry::Confirmed).collect();
        self.state = ViewState::Ready;

        if let Err(e) = self.engine.mark_thread_read(self.account, root).await {
            tracing::warn!("batch read-marking failed for thread {root}: {e}");
        } else {
            for entry in &mut self.entries {
                if let ThreadEntry::Confirmed(view) = entry {
                    if view.recipient == self.account {
                        view.is_read = true;
                    }
                }
            }
        }

        Ok(())
    }

    /// Optimistically render and send a reply. The pending entry is
    /// reconciled with the confirmation by id; on failure it is retracted
    /// and the error surfaced — no automatic retry.
    pub async fn send(&mut self, content: &str) -> Result<MessageView> {
        if self.state != ViewState::Ready {
            return Err(EngineError::InvalidInput("view is not ready".into()));
        }

        let token = Uuid::new_v4();
        self.entries.push(ThreadEntry::Pending {
            token,
            content: content.to_string(),
        });
        self.state = ViewState::Sending;

        let result = self
            .engine
            .send(
                self.account,
                self.other_party,
                self.namespace,
                self.thread_root,
                content,
            )
            .await;

        match result {
            Ok(confirmed) => {
                self.thread_root = Some(confirmed.thread_root);
                self.resolve_pending(token, confirmed.clone());
                self.state = ViewState::Ready;
                Ok(confirmed)
            }
            Err(e) => {
                self.retract_pending(token);
                self.state = ViewState::Ready;
                Err(e)
            }
        }
    }

    /// Apply a realtime event for this thread. Duplicate-tolerant: a
    /// message already present (confirmed earlier, or our own send echoed
    /// back) is dropped by id.
    pub fn apply_new_message(&mut self, view: MessageView) {
        if self.state == ViewState::Closed {
            return;
        }
        if self
            .entries
            .iter()
            .any(|e| e.confirmed_id() == Some(view.id))
        {
            return;
        }
        self.entries.push(ThreadEntry::Confirmed(view));
    }

    /// Flip the read marker on a confirmed entry (sender-side checkmark).
    pub fn apply_read(&mut self, message_id: Uuid, read_at: chrono::DateTime<chrono::Utc>) {
        for entry in &mut self.entries {
            if let ThreadEntry::Confirmed(view) = entry {
                if view.id == message_id {
                    view.is_read = true;
                    view.read_at = Some(read_at);
                }
            }
        }
    }

    /// Navigation away. In-flight work is abandoned, not cancelled; its
    /// results are simply never rendered.
    pub fn close(&mut self) {
        self.state = ViewState::Closed;
        self.entries.clear();
    }

    fn resolve_pending(&mut self, token: Uuid, confirmed: MessageView) {
        // A realtime echo may have confirmed the message before us.
        let already_present = self
            .entries
            .iter()
            .any(|e| e.confirmed_id() == Some(confirmed.id));

        if let Some(idx) = self.entries.iter().position(
            |e| matches!(e, ThreadEntry::Pending { token: t, .. } if *t == token),
        ) {
            if already_present {
                self.entries.remove(idx);
            } else {
                self.entries[idx] = ThreadEntry::Confirmed(confirmed);
            }
        }
    }

    fn retract_pending(&mut self, token: Uuid) {
        self.entries.retain(
            |e| !matches!(e, ThreadEntry::Pending { token: t, .. } if *t == token),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creel_store::Database;
    use creel_types::models::Namespace;
    use tokio::sync::broadcast;

    fn engine() -> Arc<ThreadEngine> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (tx, _) = broadcast::channel(64);
        Arc::new(ThreadEngine::new(db, tx))
    }

    #[tokio::test]
    async fn new_conversation_adopts_root_id() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let mut view = ThreadView::new_conversation(eng, a, b, Namespace::Site);
        view.open().await.unwrap();
        assert_eq!(view.state(), ViewState::Ready);
        assert!(view.thread_root().is_none());

        let sent = view.send("first cast").await.unwrap();
        assert_eq!(view.thread_root(), Some(sent.id));
        assert_eq!(view.entries().len(), 1);
        assert!(matches!(view.entries()[0], ThreadEntry::Confirmed(_)));
    }

    #[tokio::test]
    async fn open_marks_incoming_read() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let root = eng.send(a, b, Namespace::Site, None, "hello").await.unwrap();

        let mut view = ThreadView::for_thread(eng.clone(), b, a, Namespace::Site, root.id);
        view.open().await.unwrap();

        assert_eq!(eng.count_unread(b, Namespace::Site).await.unwrap(), 0);
        match &view.entries()[0] {
            ThreadEntry::Confirmed(v) => assert!(v.is_read),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_send_retracts_the_pending_entry() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let root = eng.send(a, b, Namespace::Site, None, "hello").await.unwrap();

        // Purge the thread behind the view's back
        eng.delete_thread(root.id, a).await.unwrap();
        eng.delete_thread(root.id, b).await.unwrap();

        let mut view = ThreadView::for_thread(eng, a, b, Namespace::Site, root.id);
        view.open().await.unwrap();
        assert!(view.entries().is_empty());

        let err = view.send("into the void").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound));
        assert_eq!(view.state(), ViewState::Ready);
        assert!(view.entries().is_empty(), "optimistic entry must be retracted");
    }

    #[tokio::test]
    async fn duplicate_realtime_event_is_dropped() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let root = eng.send(a, b, Namespace::Site, None, "hello").await.unwrap();

        let mut view = ThreadView::for_thread(eng.clone(), b, a, Namespace::Site, root.id);
        view.open().await.unwrap();
        assert_eq!(view.entries().len(), 1);

        // At-least-once delivery: same event twice
        let reply = eng.send(a, b, Namespace::Site, Some(root.id), "again").await.unwrap();
        view.apply_new_message(reply.clone());
        view.apply_new_message(reply);
        assert_eq!(view.entries().len(), 2);
    }

    #[tokio::test]
    async fn own_echo_after_confirmation_is_dropped() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let root = eng.send(a, b, Namespace::Site, None, "hello").await.unwrap();

        let mut view = ThreadView::for_thread(eng, a, b, Namespace::Site, root.id);
        view.open().await.unwrap();

        let sent = view.send("reply").await.unwrap();
        assert_eq!(view.entries().len(), 2);

        // The dispatcher echoes our own message back
        view.apply_new_message(sent);
        assert_eq!(view.entries().len(), 2);
    }

    #[tokio::test]
    async fn read_receipt_flips_checkmark() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let root = eng.send(a, b, Namespace::Site, None, "hello").await.unwrap();

        let mut view = ThreadView::for_thread(eng, a, b, Namespace::Site, root.id);
        view.open().await.unwrap();

        let now = chrono::Utc::now();
        view.apply_read(root.id, now);
        match &view.entries()[0] {
            ThreadEntry::Confirmed(v) => {
                assert!(v.is_read);
                assert_eq!(v.read_at, Some(now));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_view_ignores_events() {
        let eng = engine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let root = eng.send(a, b, Namespace::Site, None, "hello").await.unwrap();

        let mut view = ThreadView::for_thread(eng.clone(), b, a, Namespace::Site, root.id);
        view.open().await.unwrap();
        view.close();

        let reply = eng.send(a, b, Namespace::Site, Some(root.id), "late").await.unwrap();
        view.apply_new_message(reply);
        assert!(view.entries().is_empty());
    }
}
