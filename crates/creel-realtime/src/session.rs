use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use creel_engine::ThreadEngine;
use creel_types::api::MessageView;
use creel_types::events::RealtimeEvent;
use creel_types::models::{Message, Namespace};

/// Duplicates older than this many deliveries are no longer recognized;
/// a re-delivered ancient message degrades to one spurious refresh.
const DELIVERED_WINDOW: usize = 1024;

pub type NewMessageFn = Box<dyn Fn(MessageView) + Send + Sync>;
pub type ListChangedFn = Box<dyn Fn() + Send + Sync>;
pub type MessageReadFn = Box<dyn Fn(Uuid, DateTime<Utc>) + Send + Sync>;
pub type CueFn = Box<dyn Fn() + Send + Sync>;

/// Registration for the one thread view a session currently has open.
pub struct ActiveThreadHandle {
    /// `None` while a brand-new conversation has no stored root yet; the
    /// pair match below still routes its first incoming echo correctly.
    pub thread_root: Option<Uuid>,
    pub selected_message_id: Option<Uuid>,
    pub sender: Uuid,
    pub recipient: Uuid,
    pub namespace: Namespace,
    pub on_new_message: NewMessageFn,
    pub on_list_changed: ListChangedFn,
    pub on_message_read: Option<MessageReadFn>,
}

impl ActiveThreadHandle {
    fn pair_matches(&self, message: &Message) -> bool {
        (message.sender == self.sender && message.recipient == self.recipient)
            || (message.sender == self.recipient && message.recipient == self.sender)
    }

    fn covers_message(&self, message: &Message) -> bool {
        if message.namespace != self.namespace {
            return false;
        }
        Some(message.thread_root) == self.thread_root
            || Some(message.id) == self.selected_message_id
            || Some(message.id) == self.thread_root
            || self.pair_matches(message)
    }

    fn covers_thread(&self, thread_root: Uuid, message_id: Uuid) -> bool {
        Some(thread_root) == self.thread_root
            || Some(message_id) == self.selected_message_id
            || Some(message_id) == self.thread_root
    }
}

/// One caller's realtime delivery state. Owns the single-slot active-thread
/// registration: registering replaces any prior registration atomically
/// (last-write-wins), and clearing it on view close is mandatory so no
/// event is ever delivered to a closed view.
pub struct Session {
    engine: Arc<ThreadEngine>,
    account: Uuid,
    /// Namespace the caller's messaging UI currently browses. Events from
    /// the other namespace never reach this session's callbacks.
    namespace: Namespace,
    active: Option<ActiveThreadHandle>,
    /// Inbox refresh, registered independently of any open thread view so
    /// incoming messages still surface while no view is active.
    on_inbox_changed: Option<ListChangedFn>,
    sound_enabled: bool,
    cue: Option<CueFn>,
    /// Recently delivered ids; the push channel is at-least-once.
    delivered: HashSet<Uuid>,
    delivered_order: VecDeque<Uuid>,
}

impl Session {
    pub fn new(engine: Arc<ThreadEngine>, account: Uuid, namespace: Namespace) -> Self {
        Self {
            engine,
            account,
            namespace,
            active: None,
            on_inbox_changed: None,
            sound_enabled: false,
            cue: None,
            delivered: HashSet::new(),
            delivered_order: VecDeque::new(),
        }
    }

    pub fn account(&self) -> Uuid {
        self.account
    }

    /// Register the currently open thread view, replacing any prior one.
    pub fn set_active_thread(&mut self, handle: ActiveThreadHandle) {
        self.active = Some(handle);
    }

    /// Must be called when the thread view closes.
    pub fn clear_active_thread(&mut self) {
        self.active = None;
    }

    pub fn has_active_thread(&self) -> bool {
        self.active.is_some()
    }

    /// Register the conversation-list refresh. Outlives thread views: an
    /// incoming message fires it even when no view is active.
    pub fn set_inbox_changed(&mut self, callback: ListChangedFn) {
        self.on_inbox_changed = Some(callback);
    }

    /// Toggleable audible-cue preference; persisted outside the core.
    pub fn set_sound_enabled(&mut self, enabled: bool) {
        self.sound_enabled = enabled;
    }

    pub fn set_cue(&mut self, cue: CueFn) {
        self.cue = Some(cue);
    }

    /// Route one event from the push channel. May run interleaved with an
    /// in-flight send on another execution context; everything here is
    /// duplicate-tolerant and ordering-free.
    pub fn handle_event(&mut self, event: &RealtimeEvent) {
        if !event.involves(self.account) {
            return;
        }

        match event {
            RealtimeEvent::MessageCreated { message } => self.on_message_created(message),
            RealtimeEvent::MessageRead {
                message_id,
                thread_root,
                sender,
                read_at,
                ..
            } => {
                // Only the sender's open view renders read markers.
                if *sender != self.account {
                    return;
                }
                if let Some(handle) = &self.active {
                    if handle.covers_thread(*thread_root, *message_id) {
                        if let Some(on_read) = &handle.on_message_read {
                            on_read(*message_id, *read_at);
                        }
                    }
                }
            }
        }
    }

    fn on_message_created(&mut self, message: &Message) {
        if !self.remember_delivered(message.id) {
            return;
        }

        let delivered_to_view = match &self.active {
            Some(handle) if handle.covers_message(message) => {
                let view = self.engine.decrypt_one(message);
                (handle.on_new_message)(view);
                true
            }
            _ => false,
        };

        if !delivered_to_view
            && message.namespace == self.namespace
            && message.recipient == self.account
        {
            if let Some(handle) = &self.active {
                (handle.on_list_changed)();
            }
            if let Some(on_inbox) = &self.on_inbox_changed {
                on_inbox();
            }
        }

        // Audible cue: once per delivered incoming message, when enabled.
        if message.recipient == self.account && self.sound_enabled {
            if let Some(cue) = &self.cue {
                cue();
            }
        }
    }

    /// Record a delivered id, keeping the window bounded so a long-lived
    /// session does not grow without limit. Returns false for a recent
    /// duplicate.
    fn remember_delivered(&mut self, id: Uuid) -> bool {
        if !self.delivered.insert(id) {
            return false;
        }
        self.delivered_order.push_back(id);
        while self.delivered_order.len() > DELIVERED_WINDOW {
            if let Some(evicted) = self.delivered_order.pop_front() {
                self.delivered.remove(&evicted);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creel_store::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{broadcast, mpsc};

    struct Fixture {
        eng: Arc<ThreadEngine>,
        rx: broadcast::Receiver<RealtimeEvent>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (tx, rx) = broadcast::channel(64);
        Fixture {
            eng: Arc::new(ThreadEngine::new(db, tx)),
            rx,
        }
    }

    impl Fixture {
        /// Send through the engine and capture the event it published.
        async fn send_event(&mut self, from: Uuid, to: Uuid) -> RealtimeEvent {
            self.eng
                .send(from, to, Namespace::Site, None, "hello")
                .await
                .unwrap();
            self.rx.recv().await.unwrap()
        }
    }

    fn handle_for(
        thread_root: Option<Uuid>,
        pair: (Uuid, Uuid),
        seen: mpsc::UnboundedSender<Uuid>,
        list_hits: Arc<AtomicUsize>,
    ) -> ActiveThreadHandle {
        ActiveThreadHandle {
            thread_root,
            selected_message_id: None,
            sender: pair.0,
            recipient: pair.1,
            namespace: Namespace::Site,
            on_new_message: Box::new(move |view| {
                let _ = seen.send(view.id);
            }),
            on_list_changed: Box::new(move || {
                list_hits.fetch_add(1, Ordering::SeqCst);
            }),
            on_message_read: None,
        }
    }

    #[tokio::test]
    async fn active_thread_receives_new_messages_once() {
        let mut fx = fixture();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let event = fx.send_event(a, b).await;
        let RealtimeEvent::MessageCreated { message } = &event else {
            unreachable!()
        };

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let list_hits = Arc::new(AtomicUsize::new(0));
        let mut session = Session::new(fx.eng.clone(), b, Namespace::Site);
        session.set_active_thread(handle_for(
            Some(message.thread_root),
            (a, b),
            seen_tx,
            list_hits.clone(),
        ));

        session.handle_event(&event);
        session.handle_event(&event); // at-least-once duplicate

        assert_eq!(seen_rx.try_recv().unwrap(), message.id);
        assert!(seen_rx.try_recv().is_err(), "duplicate must be dropped");
        assert_eq!(list_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn foreign_thread_triggers_list_refresh() {
        let mut fx = fixture();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        // Active thread is with c; the event is a message from a.
        let event = fx.send_event(a, b).await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let list_hits = Arc::new(AtomicUsize::new(0));
        let mut session = Session::new(fx.eng.clone(), b, Namespace::Site);
        session.set_active_thread(handle_for(
            Some(Uuid::new_v4()),
            (c, b),
            seen_tx,
            list_hits.clone(),
        ));

        session.handle_event(&event);
        assert!(seen_rx.try_recv().is_err());
        assert_eq!(list_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn events_for_other_accounts_are_ignored() {
        let mut fx = fixture();
        let (a, b, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let event = fx.send_event(a, b).await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let list_hits = Arc::new(AtomicUsize::new(0));
        let mut session = Session::new(fx.eng.clone(), stranger, Namespace::Site);
        session.set_active_thread(handle_for(None, (a, b), seen_tx, list_hits.clone()));

        session.handle_event(&event);
        assert!(seen_rx.try_recv().is_err());
        assert_eq!(list_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cleared_registration_stops_delivery() {
        let mut fx = fixture();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let event = fx.send_event(a, b).await;
        let RealtimeEvent::MessageCreated { message } = &event else {
            unreachable!()
        };

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let list_hits = Arc::new(AtomicUsize::new(0));
        let mut session = Session::new(fx.eng.clone(), b, Namespace::Site);
        session.set_active_thread(handle_for(
            Some(message.thread_root),
            (a, b),
            seen_tx,
            list_hits.clone(),
        ));
        session.clear_active_thread();

        session.handle_event(&event);
        assert!(seen_rx.try_recv().is_err());
        assert_eq!(list_hits.load(Ordering::SeqCst), 0);
    }

    fn synthetic_incoming(to: Uuid) -> RealtimeEvent {
        let id = Uuid::new_v4();
        RealtimeEvent::MessageCreated {
            message: Message {
                id,
                sender: Uuid::new_v4(),
                recipient: to,
                namespace: Namespace::Site,
                thread_root: id,
                parent: None,
                ciphertext: vec![0; 16],
                nonce: vec![0; 12],
                created_at: Utc::now(),
                read_at: None,
                is_read: false,
                deleted_by_sender: false,
                deleted_by_recipient: false,
                archived_by_sender: false,
                archived_by_recipient: false,
            },
        }
    }

    #[tokio::test]
    async fn incoming_message_refreshes_inbox_without_active_view() {
        let mut fx = fixture();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let event = fx.send_event(a, b).await;

        let inbox_hits = Arc::new(AtomicUsize::new(0));
        let hits = inbox_hits.clone();
        let mut session = Session::new(fx.eng.clone(), b, Namespace::Site);
        session.set_inbox_changed(Box::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!session.has_active_thread());
        session.handle_event(&event);
        session.handle_event(&event); // at-least-once duplicate
        assert_eq!(inbox_hits.load(Ordering::SeqCst), 1);

        // A message rendered by an open view does not also refresh the inbox
        let RealtimeEvent::MessageCreated { message } = &event else {
            unreachable!()
        };
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        session.set_active_thread(handle_for(
            Some(message.thread_root),
            (a, b),
            seen_tx,
            Arc::new(AtomicUsize::new(0)),
        ));
        let event2 = fx.send_event(a, b).await;
        session.handle_event(&event2);
        assert!(seen_rx.try_recv().is_ok());
        assert_eq!(inbox_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delivered_window_stays_bounded() {
        let fx = fixture();
        let b = Uuid::new_v4();

        let inbox_hits = Arc::new(AtomicUsize::new(0));
        let hits = inbox_hits.clone();
        let mut session = Session::new(fx.eng.clone(), b, Namespace::Site);
        session.set_inbox_changed(Box::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));

        let first = synthetic_incoming(b);
        session.handle_event(&first);
        let mut last = first.clone();
        for _ in 0..DELIVERED_WINDOW {
            last = synthetic_incoming(b);
            session.handle_event(&last);
        }
        assert_eq!(inbox_hits.load(Ordering::SeqCst), DELIVERED_WINDOW + 1);

        // The oldest id has been evicted, so its replay is treated as new;
        // a recent duplicate is still dropped.
        session.handle_event(&first);
        assert_eq!(inbox_hits.load(Ordering::SeqCst), DELIVERED_WINDOW + 2);
        session.handle_event(&last);
        assert_eq!(inbox_hits.load(Ordering::SeqCst), DELIVERED_WINDOW + 2);
    }

    #[tokio::test]
    async fn cue_fires_once_per_incoming_message_when_enabled() {
        let mut fx = fixture();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let event = fx.send_event(a, b).await;

        let cues = Arc::new(AtomicUsize::new(0));
        let cues_in = cues.clone();
        let mut session = Session::new(fx.eng.clone(), b, Namespace::Site);
        session.set_cue(Box::new(move || {
            cues_in.fetch_add(1, Ordering::SeqCst);
        }));

        // Disabled by default
        session.handle_event(&event);
        assert_eq!(cues.load(Ordering::SeqCst), 0);

        session.set_sound_enabled(true);
        let event2 = fx.send_event(a, b).await;
        session.handle_event(&event2);
        session.handle_event(&event2);
        assert_eq!(cues.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_receipt_routed_to_the_sender_view() {
        let fx = fixture();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let view = fx.eng.send(a, b, Namespace::Site, None, "hi").await.unwrap();

        let (read_tx, mut read_rx) = mpsc::unbounded_channel();
        let mut session = Session::new(fx.eng.clone(), a, Namespace::Site);
        session.set_active_thread(ActiveThreadHandle {
            thread_root: Some(view.thread_root),
            selected_message_id: None,
            sender: a,
            recipient: b,
            namespace: Namespace::Site,
            on_new_message: Box::new(|_| {}),
            on_list_changed: Box::new(|| {}),
            on_message_read: Some(Box::new(move |id, at| {
                let _ = read_tx.send((id, at));
            })),
        });

        let read_at = Utc::now();
        session.handle_event(&RealtimeEvent::MessageRead {
            message_id: view.id,
            thread_root: view.thread_root,
            namespace: Namespace::Site,
            sender: a,
            recipient: b,
            read_at,
        });

        let (id, at) = read_rx.try_recv().unwrap();
        assert_eq!(id, view.id);
        assert_eq!(at, read_at);
    }
}
