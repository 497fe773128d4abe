//! SessionCoordinator actor.
//!
//! One tokio task owns the `SessionMachine` for a conversation. The public
//! handle only sends commands; remote calls run on their own tasks and post
//! their results back as completions, so every state mutation happens on the
//! actor task. Messages are handed to the `PostQueue`, whose delivery
//! outlives both the view and the coordinator.
//!
//! ```text
//! handle ──commands──► actor ──spawn──► RemoteChatService
//!                        ▲                    │
//!                        └────completions─────┘
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use deskchat_types::chat::{ChatSession, GuestIdentity, SessionState, TypingSignal};
use deskchat_types::error::{QueueError, RemoteError, SessionError};
use deskchat_types::event::ChatEvent;
use deskchat_types::job::{JobId, PostJob};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::{Effect, OpId, SessionMachine};
use super::view::ChatView;
use crate::event::EventBus;
use crate::identity::IdentityProvider;
use crate::queue::{PostJobStore, PostQueue};
use crate::remote::RemoteChatService;

const ABANDONED_REASON: &str = "conversation ended before a session was established";

/// Releasing deferred messages is retried this many times before they are
/// failed.
const MAX_RELEASE_ATTEMPTS: u32 = 3;
const RELEASE_BACKOFF: Duration = Duration::from_millis(200);

enum Command {
    Attach(Arc<dyn ChatView>),
    Detach(Arc<dyn ChatView>),
    StartSession {
        user_name: String,
    },
    Typing(TypingSignal),
    NewMessage {
        text: String,
        reply: oneshot::Sender<Result<JobId, QueueError>>,
    },
    Destroy,
}

enum Completion {
    GuestCreated {
        op: OpId,
        result: Result<GuestIdentity, RemoteError>,
    },
    SessionStarted {
        op: OpId,
        result: Result<ChatSession, RemoteError>,
    },
    SessionEnded {
        op: OpId,
    },
    RetryRelease,
}

/// Handle to one conversation's coordinator.
///
/// Cheap to clone. Every method returns immediately; outcomes arrive as
/// `ChatEvent`s. When the last handle is dropped without `destroy()`, the
/// coordinator tears itself down the same way.
#[derive(Clone)]
pub struct SessionCoordinator {
    conversation: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionCoordinator {
    /// Start a coordinator for a new conversation.
    ///
    /// `on_destroyed` runs exactly once, when teardown completes.
    pub fn spawn<S, R>(queue: PostQueue<S, R>, on_destroyed: impl FnOnce() + Send + 'static) -> Self
    where
        S: PostJobStore,
        R: RemoteChatService,
    {
        let conversation = Uuid::now_v7().to_string();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (completions, completion_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Idle);

        let events = queue.events().clone();
        let actor = Actor {
            conversation: conversation.clone(),
            machine: SessionMachine::new(),
            remote: Arc::clone(queue.remote()),
            identity: Arc::clone(queue.identity()),
            bus: events.subscribe(),
            events,
            queue,
            view: None,
            display_name: String::new(),
            next_seq: 0,
            release_attempts: 0,
            unreleased: false,
            state_tx,
            completions,
            on_destroyed: Some(Box::new(on_destroyed)),
        };
        tokio::spawn(actor.run(command_rx, completion_rx));

        info!(conversation = %conversation, "session coordinator started");
        Self {
            conversation,
            commands,
            state,
        }
    }

    /// The conversation key; also the lane of every message it submits.
    pub fn conversation(&self) -> &str {
        &self.conversation
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the coordinator reaches `target`.
    ///
    /// Returns `false` if it ended without ever reaching it.
    pub async fn wait_for_state(&self, target: SessionState) -> bool {
        let mut state = self.state.clone();
        let reached = match state
            .wait_for(|current| *current == target || current.is_terminal())
            .await
        {
            Ok(current) => Some(*current == target),
            Err(_) => None,
        };
        // The actor dropped its sender; fall back to the last value it sent.
        reached.unwrap_or_else(|| *state.borrow() == target)
    }

    pub fn attach(&self, view: Arc<dyn ChatView>) {
        self.send(Command::Attach(view));
    }

    /// Unbind `view` if it is the bound view.
    pub fn detach(&self, view: &Arc<dyn ChatView>) {
        self.send(Command::Detach(Arc::clone(view)));
    }

    pub fn start_session(&self, user_name: impl Into<String>) {
        self.send(Command::StartSession {
            user_name: user_name.into(),
        });
    }

    pub fn user_started_typing(&self) {
        self.send(Command::Typing(TypingSignal::Started));
    }

    pub fn user_stopped_typing(&self) {
        self.send(Command::Typing(TypingSignal::Stopped));
    }

    /// Submit a message for delivery.
    ///
    /// Resolves once the job is durably recorded, with the id its delivery
    /// events will carry.
    pub async fn handle_new_message(&self, text: impl Into<String>) -> Result<JobId, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::NewMessage {
                text: text.into(),
                reply,
            })
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)?
    }

    pub fn destroy(&self) {
        self.send(Command::Destroy);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(conversation = %self.conversation, "coordinator already ended, command dropped");
        }
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("conversation", &self.conversation)
            .field("state", &self.state())
            .finish()
    }
}

struct Actor<S: PostJobStore, R: RemoteChatService> {
    conversation: String,
    machine: SessionMachine,
    remote: Arc<R>,
    identity: Arc<dyn IdentityProvider>,
    queue: PostQueue<S, R>,
    events: EventBus,
    bus: broadcast::Receiver<ChatEvent>,
    view: Option<Arc<dyn ChatView>>,
    display_name: String,
    next_seq: u64,
    release_attempts: u32,
    /// Deferred messages are waiting on a failed release.
    unreleased: bool,
    state_tx: watch::Sender<SessionState>,
    completions: mpsc::UnboundedSender<Completion>,
    on_destroyed: Option<Box<dyn FnOnce() + Send>>,
}

impl<S: PostJobStore, R: RemoteChatService> Actor<S, R> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut handles_alive = true;

        loop {
            tokio::select! {
                biased;
                Some(done) = completions.recv() => self.on_completion(done).await,
                command = commands.recv(), if handles_alive => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!(conversation = %self.conversation, "all handles dropped, tearing down");
                        handles_alive = false;
                        let effects = self.step(SessionMachine::destroy);
                        self.apply(effects).await;
                    }
                },
                event = self.bus.recv() => self.on_bus(event),
            }

            if self.machine.state().is_terminal() {
                break;
            }
        }

        // Hand the view whatever this conversation published last.
        while let Ok(event) = self.bus.try_recv() {
            self.forward(&event);
        }
        debug!(conversation = %self.conversation, "coordinator stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Attach(view) => {
                debug!(conversation = %self.conversation, "view attached");
                self.view = Some(view);
            }
            Command::Detach(view) => {
                if self
                    .view
                    .as_ref()
                    .is_some_and(|bound| Arc::ptr_eq(bound, &view))
                {
                    debug!(conversation = %self.conversation, "view detached");
                    self.view = None;
                }
            }
            Command::StartSession { user_name } => self.start_session(user_name).await,
            Command::Typing(signal) => self.signal_typing(signal),
            Command::NewMessage { text, reply } => {
                let result = self.submit(text).await;
                let _ = reply.send(result);
            }
            Command::Destroy => {
                info!(conversation = %self.conversation, state = %self.machine.state(), "destroying coordinator");
                let effects = self.step(SessionMachine::destroy);
                self.apply(effects).await;
            }
        }
    }

    async fn on_completion(&mut self, completion: Completion) {
        let effects = match completion {
            Completion::GuestCreated { op, result } => {
                self.step(|machine| machine.guest_created(op, result))
            }
            Completion::SessionStarted { op, result } => {
                self.step(|machine| machine.session_started(op, result))
            }
            Completion::SessionEnded { op } => self.step(|machine| machine.session_ended(op)),
            Completion::RetryRelease => {
                if self.unreleased {
                    self.release_deferred().await;
                }
                return;
            }
        };
        self.apply(effects).await;
    }

    fn on_bus(&mut self, event: Result<ChatEvent, broadcast::error::RecvError>) {
        match event {
            Ok(event) => self.forward(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(conversation = %self.conversation, skipped, "view forwarding lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {}
        }
    }

    fn forward(&self, event: &ChatEvent) {
        if let Some(view) = &self.view
            && event.conversation() == self.conversation
        {
            view.on_event(event);
        }
    }

    async fn start_session(&mut self, user_name: String) {
        if self.machine.state() != SessionState::Idle {
            debug!(conversation = %self.conversation, state = %self.machine.state(), "start_session ignored");
            return;
        }

        if self.identity.conversation_token().is_none() {
            warn!(conversation = %self.conversation, "cannot start session without a conversation token");
            self.events.publish(ChatEvent::SessionFailed {
                conversation: self.conversation.clone(),
                error: SessionError::MissingConversationToken.to_string(),
            });
            return;
        }

        self.display_name = user_name;
        let effects = self.step(SessionMachine::begin);
        self.apply(effects).await;
    }

    fn signal_typing(&self, signal: TypingSignal) {
        let Some((guest, session)) = self.machine.typing_target() else {
            debug!(conversation = %self.conversation, %signal, "typing signal dropped outside active session");
            return;
        };
        let Some(token) = self.identity.conversation_token() else {
            debug!(conversation = %self.conversation, %signal, "typing signal dropped without a conversation token");
            return;
        };

        let remote = Arc::clone(&self.remote);
        let guest = guest.clone();
        let session = session.clone();
        let conversation = self.conversation.clone();
        tokio::spawn(async move {
            if let Err(e) = remote
                .signal_typing(signal, &guest, &session, token.expose_secret())
                .await
            {
                debug!(conversation = %conversation, %signal, error = %e, "typing signal failed");
            }
        });
    }

    async fn submit(&mut self, text: String) -> Result<JobId, QueueError> {
        self.next_seq += 1;
        let id = JobId::new(self.conversation.clone(), self.next_seq);
        let job = match self.machine.address() {
            Some(address) => PostJob::addressed(id.clone(), text, address, Utc::now()),
            None => PostJob::deferred(id.clone(), text, Utc::now()),
        };
        self.queue.enqueue(job).await?;
        Ok(id)
    }

    /// Address and release messages buffered before the session existed.
    ///
    /// A store failure is retried after `RELEASE_BACKOFF`; once the attempts
    /// run out, the messages are failed and reported.
    async fn release_deferred(&mut self) {
        let Some(address) = self.machine.address() else {
            self.abandon_unreleased("session ended before deferred messages were released")
                .await;
            return;
        };

        self.release_attempts += 1;
        match self.queue.release(&self.conversation, &address).await {
            Ok(_) => self.unreleased = false,
            Err(e) if self.release_attempts < MAX_RELEASE_ATTEMPTS => {
                warn!(
                    conversation = %self.conversation,
                    attempt = self.release_attempts,
                    error = %e,
                    "failed to release deferred messages, will retry"
                );
                self.unreleased = true;
                let done = self.completions.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RELEASE_BACKOFF).await;
                    let _ = done.send(Completion::RetryRelease);
                });
            }
            Err(e) => {
                error!(conversation = %self.conversation, error = %e, "giving up on releasing deferred messages");
                self.abandon_unreleased(&format!("deferred messages could not be released: {e}"))
                    .await;
            }
        }
    }

    async fn abandon_unreleased(&mut self, reason: &str) {
        self.unreleased = false;
        if let Err(e) = self.queue.abandon_deferred(&self.conversation, reason).await {
            error!(conversation = %self.conversation, error = %e, "failed to abandon deferred messages");
        }
    }

    /// Run one machine input, publishing the state change it caused.
    fn step(&mut self, input: impl FnOnce(&mut SessionMachine) -> Vec<Effect>) -> Vec<Effect> {
        let from = self.machine.state();
        let effects = input(&mut self.machine);
        let to = self.machine.state();

        if from != to {
            info!(conversation = %self.conversation, %from, %to, "session state changed");
            self.state_tx.send_replace(to);
            self.events.publish(ChatEvent::SessionStateChanged {
                conversation: self.conversation.clone(),
                from,
                to,
            });
        }
        effects
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut work: VecDeque<Effect> = effects.into();

        while let Some(effect) = work.pop_front() {
            match effect {
                Effect::CreateGuest { op } => {
                    let Some(token) = self.identity.conversation_token() else {
                        work.extend(self.step(|m| m.abort(op, SessionError::MissingConversationToken)));
                        continue;
                    };
                    let remote = Arc::clone(&self.remote);
                    let done = self.completions.clone();
                    let display_name = self.display_name.clone();
                    tokio::spawn(async move {
                        let result = remote
                            .create_guest_customer(&display_name, token.expose_secret())
                            .await;
                        let _ = done.send(Completion::GuestCreated { op, result });
                    });
                }
                Effect::StartSession { op, guest } => {
                    let Some(token) = self.identity.conversation_token() else {
                        work.extend(self.step(|m| m.abort(op, SessionError::MissingConversationToken)));
                        continue;
                    };
                    let remote = Arc::clone(&self.remote);
                    let done = self.completions.clone();
                    tokio::spawn(async move {
                        let result = remote.start_session(&guest, token.expose_secret()).await;
                        let _ = done.send(Completion::SessionStarted { op, result });
                    });
                }
                Effect::EndSession { op, guest, session } => {
                    let token = self
                        .identity
                        .conversation_token()
                        .unwrap_or_else(|| SecretString::from(String::new()));
                    let remote = Arc::clone(&self.remote);
                    let done = self.completions.clone();
                    let conversation = self.conversation.clone();
                    tokio::spawn(async move {
                        if let Err(e) = remote
                            .end_session(&guest, &session, token.expose_secret())
                            .await
                        {
                            debug!(conversation = %conversation, error = %e, "session end failed");
                        }
                        let _ = done.send(Completion::SessionEnded { op });
                    });
                }
                Effect::Established { session } => {
                    info!(
                        conversation = %self.conversation,
                        session_id = %session.id,
                        case_link_id = %session.case_link_id,
                        "chat session established"
                    );
                    self.events.publish(ChatEvent::SessionEstablished {
                        conversation: self.conversation.clone(),
                        session_id: session.id,
                        case_link_id: session.case_link_id,
                    });
                    self.release_attempts = 0;
                    self.release_deferred().await;
                }
                Effect::Failed(err) => {
                    warn!(conversation = %self.conversation, error = %err, "session establishment failed");
                    self.events.publish(ChatEvent::SessionFailed {
                        conversation: self.conversation.clone(),
                        error: err.to_string(),
                    });
                }
                Effect::AbandonDeferred => {
                    if let Err(e) = self
                        .queue
                        .abandon_deferred(&self.conversation, ABANDONED_REASON)
                        .await
                    {
                        error!(conversation = %self.conversation, error = %e, "failed to abandon deferred messages");
                    }
                }
                Effect::Finished => {
                    if self.unreleased {
                        self.abandon_unreleased("conversation ended before deferred messages were released")
                            .await;
                    }
                    if let Some(callback) = self.on_destroyed.take() {
                        callback();
                    }
                    info!(conversation = %self.conversation, "session coordinator destroyed");
                    self.events.publish(ChatEvent::CoordinatorDestroyed {
                        conversation: self.conversation.clone(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentityProvider;
    use crate::queue::MemoryPostJobStore;
    use crate::testing::{RecordingView, RemoteCall, ScriptedRemote, next_matching};
    use deskchat_types::config::QueueConfig;
    use deskchat_types::error::RepositoryError;
    use deskchat_types::job::JobStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        remote: Arc<ScriptedRemote>,
        store: Arc<MemoryPostJobStore>,
        queue: PostQueue<MemoryPostJobStore, ScriptedRemote>,
        destroyed: Arc<AtomicUsize>,
    }

    struct NoToken;

    impl IdentityProvider for NoToken {
        fn conversation_token(&self) -> Option<SecretString> {
            None
        }
    }

    fn harness_with(identity: Arc<dyn IdentityProvider>) -> Harness {
        let config = QueueConfig {
            base_delay_ms: 5,
            max_delay_ms: 20,
            lane_idle_timeout_ms: 100,
            ..QueueConfig::default()
        };
        let remote = Arc::new(ScriptedRemote::new());
        let store = Arc::new(MemoryPostJobStore::new());
        let queue = PostQueue::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            identity,
            &config,
            EventBus::new(256),
        );
        Harness {
            remote,
            store,
            queue,
            destroyed: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(StaticIdentityProvider::new("conv-token")))
    }

    impl Harness {
        fn coordinator(&self) -> SessionCoordinator {
            let destroyed = Arc::clone(&self.destroyed);
            SessionCoordinator::spawn(self.queue.clone(), move || {
                destroyed.fetch_add(1, Ordering::SeqCst);
            })
        }

        fn events(&self) -> broadcast::Receiver<ChatEvent> {
            self.queue.events().subscribe()
        }
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn is_destroyed(event: &ChatEvent) -> bool {
        matches!(event, ChatEvent::CoordinatorDestroyed { .. })
    }

    #[tokio::test]
    async fn repeated_start_creates_one_guest() {
        let h = harness();
        let gate = h.remote.hold_guest_creation();
        let coordinator = h.coordinator();

        coordinator.start_session("Ada");
        coordinator.start_session("Ada");
        assert!(coordinator.wait_for_state(SessionState::CreatingGuest).await);
        coordinator.start_session("Ada");

        gate.add_permits(1);
        assert!(coordinator.wait_for_state(SessionState::Active).await);
        coordinator.start_session("Ada");
        // Round-trip through the actor so every start above was processed
        coordinator.handle_new_message("ping").await.unwrap();

        assert_eq!(h.remote.guest_calls().await, 1);
        assert_eq!(h.remote.session_calls().await, 1);
    }

    #[tokio::test]
    async fn session_start_failure_returns_to_idle_and_retry_uses_fresh_guest() {
        let h = harness();
        h.remote
            .fail_next_session(RemoteError::Transient("503".into()))
            .await;
        let mut rx = h.events();
        let coordinator = h.coordinator();

        coordinator.start_session("Ada");
        let failed = next_matching(&mut rx, |e| matches!(e, ChatEvent::SessionFailed { .. }))
            .await
            .expect("expected SessionFailed");
        match failed {
            ChatEvent::SessionFailed { error, .. } => assert!(error.contains("session start")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(coordinator.state(), SessionState::Idle);

        coordinator.start_session("Ada");
        assert!(coordinator.wait_for_state(SessionState::Active).await);

        assert_eq!(h.remote.guest_calls().await, 2);
        let starts: Vec<_> = h
            .remote
            .calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::StartSession { guest_id } => Some(guest_id),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec!["guest-1", "guest-2"]);
    }

    #[tokio::test]
    async fn guest_failure_is_reported_once() {
        let h = harness();
        h.remote
            .fail_next_guest(RemoteError::Rejected("banned".into()))
            .await;
        let mut rx = h.events();
        let coordinator = h.coordinator();

        coordinator.start_session("Ada");
        next_matching(&mut rx, |e| matches!(e, ChatEvent::SessionFailed { .. }))
            .await
            .expect("expected SessionFailed");
        assert_eq!(coordinator.state(), SessionState::Idle);

        coordinator.handle_new_message("ping").await.unwrap();
        assert_eq!(h.remote.guest_calls().await, 1);
        assert_eq!(h.remote.session_calls().await, 0);
    }

    #[tokio::test]
    async fn message_before_active_dispatches_with_session_identifiers() {
        let h = harness();
        let gate = h.remote.hold_guest_creation();
        let mut rx = h.events();
        let coordinator = h.coordinator();

        coordinator.start_session("Ada");
        assert!(coordinator.wait_for_state(SessionState::CreatingGuest).await);

        let id = coordinator.handle_new_message("hello").await.unwrap();
        assert_eq!(id.lane, coordinator.conversation());
        let job = h.store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Deferred);
        assert!(h.remote.posts().await.is_empty());

        gate.add_permits(1);
        next_matching(&mut rx, |e| matches!(e, ChatEvent::MessageDelivered { .. }))
            .await
            .expect("expected delivery");

        let posts = h.remote.posts().await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].body, "hello");
        assert_eq!(posts[0].guest_id, "guest-1");
        assert_eq!(posts[0].guest_token, "token-1");
        assert_eq!(posts[0].case_link_id, "case-1");
        assert_eq!(posts[0].client_id, id);
    }

    #[tokio::test]
    async fn early_and_late_messages_keep_submission_order() {
        let h = harness();
        let gate = h.remote.hold_guest_creation();
        let mut rx = h.events();
        let coordinator = h.coordinator();

        coordinator.start_session("Ada");
        coordinator.handle_new_message("m1").await.unwrap();
        coordinator.handle_new_message("m2").await.unwrap();
        gate.add_permits(1);
        assert!(coordinator.wait_for_state(SessionState::Active).await);
        coordinator.handle_new_message("m3").await.unwrap();

        for _ in 0..3 {
            next_matching(&mut rx, |e| matches!(e, ChatEvent::MessageDelivered { .. }))
                .await
                .expect("expected delivery");
        }
        assert_eq!(h.remote.delivered_bodies().await, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn destroy_without_session_skips_end_call() {
        let h = harness();
        let mut rx = h.events();
        let coordinator = h.coordinator();

        coordinator.destroy();
        coordinator.destroy();
        next_matching(&mut rx, is_destroyed)
            .await
            .expect("expected teardown");

        assert_eq!(coordinator.state(), SessionState::Ended);
        assert!(!coordinator.wait_for_state(SessionState::Active).await);
        assert_eq!(h.remote.end_calls().await, 0);
        assert_eq!(h.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_when_active_ends_session() {
        let h = harness();
        let mut rx = h.events();
        let coordinator = h.coordinator();
        coordinator.start_session("Ada");
        assert!(coordinator.wait_for_state(SessionState::Active).await);

        let gate = h.remote.hold_session_end();
        coordinator.destroy();
        assert!(coordinator.wait_for_state(SessionState::Ending).await);
        assert_eq!(h.destroyed.load(Ordering::SeqCst), 0);

        // Messages submitted while ending still carry the session
        let id = coordinator.handle_new_message("bye").await.unwrap();
        let job = h.store.get(&id).await.unwrap().unwrap();
        assert!(job.address.is_some());
        assert_ne!(job.status, JobStatus::Deferred);
        next_matching(&mut rx, |e| matches!(e, ChatEvent::MessageDelivered { .. }))
            .await
            .expect("expected delivery while ending");
        assert_eq!(h.remote.posts().await[0].guest_id, "guest-1");

        gate.add_permits(1);
        next_matching(&mut rx, is_destroyed)
            .await
            .expect("expected teardown");
        assert_eq!(coordinator.state(), SessionState::Ended);
        assert_eq!(h.remote.end_calls().await, 1);
        assert_eq!(h.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_before_session_fails_deferred_messages() {
        let h = harness();
        let gate = h.remote.hold_guest_creation();
        let mut rx = h.events();
        let coordinator = h.coordinator();

        coordinator.start_session("Ada");
        let id = coordinator.handle_new_message("lost").await.unwrap();
        coordinator.destroy();

        let failed = next_matching(&mut rx, |e| matches!(e, ChatEvent::MessageFailed { .. }))
            .await
            .expect("expected MessageFailed");
        assert_eq!(failed.job_id(), Some(&id));
        assert_eq!(
            h.store.get(&id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );

        // The abandoned guest creation completes into nothing
        gate.add_permits(1);
        next_matching(&mut rx, is_destroyed)
            .await
            .expect("expected teardown");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.remote.session_calls().await, 0);
        assert!(h.remote.posts().await.is_empty());
        assert_eq!(h.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn message_after_ended_is_rejected() {
        let h = harness();
        let mut rx = h.events();
        let coordinator = h.coordinator();
        coordinator.destroy();
        next_matching(&mut rx, is_destroyed)
            .await
            .expect("expected teardown");

        let err = coordinator.handle_new_message("late").await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }

    #[tokio::test]
    async fn dropping_every_handle_runs_teardown() {
        let h = harness();
        let mut rx = h.events();
        let coordinator = h.coordinator();
        let clone = coordinator.clone();
        drop(coordinator);
        drop(clone);

        next_matching(&mut rx, is_destroyed)
            .await
            .expect("expected teardown");
        assert_eq!(h.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn typing_outside_active_is_dropped() {
        let h = harness();
        let gate = h.remote.hold_guest_creation();
        let coordinator = h.coordinator();

        coordinator.user_started_typing();
        coordinator.start_session("Ada");
        assert!(coordinator.wait_for_state(SessionState::CreatingGuest).await);
        coordinator.user_started_typing();
        coordinator.user_stopped_typing();
        coordinator.handle_new_message("ping").await.unwrap();
        assert_eq!(h.remote.typing_calls().await, 0);

        gate.add_permits(1);
        assert!(coordinator.wait_for_state(SessionState::Active).await);
        coordinator.user_started_typing();
        let remote = Arc::clone(&h.remote);
        eventually(async || remote.typing_calls().await == 1).await;
    }

    #[tokio::test]
    async fn typing_failure_is_ignored() {
        let h = harness();
        h.remote
            .fail_typing(RemoteError::Transient("offline".into()))
            .await;
        let mut rx = h.events();
        let coordinator = h.coordinator();
        coordinator.start_session("Ada");
        assert!(coordinator.wait_for_state(SessionState::Active).await);

        coordinator.user_started_typing();
        coordinator.handle_new_message("still here").await.unwrap();
        next_matching(&mut rx, |e| matches!(e, ChatEvent::MessageDelivered { .. }))
            .await
            .expect("expected delivery");
        assert_eq!(coordinator.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn missing_token_fails_start_without_remote_call() {
        let h = harness_with(Arc::new(NoToken));
        let mut rx = h.events();
        let coordinator = h.coordinator();

        coordinator.start_session("Ada");
        let failed = next_matching(&mut rx, |e| matches!(e, ChatEvent::SessionFailed { .. }))
            .await
            .expect("expected SessionFailed");
        assert!(matches!(failed, ChatEvent::SessionFailed { error, .. } if error.contains("token")));
        assert_eq!(coordinator.state(), SessionState::Idle);
        assert_eq!(h.remote.guest_calls().await, 0);
    }

    #[tokio::test]
    async fn attached_view_receives_conversation_events() {
        let h = harness();
        let other = h.coordinator();
        let coordinator = h.coordinator();
        let view = Arc::new(RecordingView::new());
        coordinator.attach(view.clone());

        coordinator.start_session("Ada");
        other.start_session("Bob");
        assert!(coordinator.wait_for_state(SessionState::Active).await);
        assert!(other.wait_for_state(SessionState::Active).await);

        let seen = Arc::clone(&view);
        eventually(async || {
            seen
                .events()
                .iter()
                .any(|e| matches!(e, ChatEvent::SessionEstablished { .. }))
        })
        .await;
        assert!(
            view.events()
                .iter()
                .all(|e| e.conversation() == coordinator.conversation())
        );
    }

    #[tokio::test]
    async fn detach_does_not_cancel_delivery() {
        let h = harness();
        let mut rx = h.events();
        let coordinator = h.coordinator();
        let view = Arc::new(RecordingView::new());
        let bound: Arc<dyn ChatView> = view.clone();
        coordinator.attach(Arc::clone(&bound));
        coordinator.start_session("Ada");
        assert!(coordinator.wait_for_state(SessionState::Active).await);

        coordinator.detach(&bound);
        let id = coordinator.handle_new_message("after detach").await.unwrap();
        next_matching(&mut rx, |e| matches!(e, ChatEvent::MessageDelivered { .. }))
            .await
            .expect("expected delivery");

        assert_eq!(h.remote.delivered_bodies().await, vec!["after detach"]);
        assert!(view.events().iter().all(|e| e.job_id() != Some(&id)));
    }

    #[tokio::test]
    async fn detach_of_other_view_keeps_binding() {
        let h = harness();
        let coordinator = h.coordinator();
        let view = Arc::new(RecordingView::new());
        let stranger: Arc<dyn ChatView> = Arc::new(RecordingView::new());
        coordinator.attach(view.clone());
        coordinator.detach(&stranger);

        coordinator.start_session("Ada");
        let seen = Arc::clone(&view);
        eventually(async || {
            seen
                .events()
                .iter()
                .any(|e| matches!(e, ChatEvent::SessionEstablished { .. }))
        })
        .await;
    }

    /// Memory store whose `release_deferred` fails a set number of times.
    #[derive(Default)]
    struct LockedReleaseStore {
        inner: MemoryPostJobStore,
        release_failures: std::sync::atomic::AtomicU32,
    }

    impl PostJobStore for LockedReleaseStore {
        async fn enqueue(&self, job: &PostJob) -> Result<(), QueueError> {
            self.inner.enqueue(job).await
        }

        async fn dequeue_next_ready(
            &self,
            lane: &str,
            now: chrono::DateTime<Utc>,
        ) -> Result<crate::queue::LaneHead, QueueError> {
            self.inner.dequeue_next_ready(lane, now).await
        }

        async fn ack(&self, id: &JobId, attempts: u32) -> Result<(), QueueError> {
            self.inner.ack(id, attempts).await
        }

        async fn mark_failed(&self, id: &JobId, attempts: u32, error: &str) -> Result<(), QueueError> {
            self.inner.mark_failed(id, attempts, error).await
        }

        async fn retry_after(
            &self,
            id: &JobId,
            attempts: u32,
            at: chrono::DateTime<Utc>,
            error: &str,
        ) -> Result<(), QueueError> {
            self.inner.retry_after(id, attempts, at, error).await
        }

        async fn release_deferred(
            &self,
            lane: &str,
            address: &deskchat_types::job::JobAddress,
        ) -> Result<u64, QueueError> {
            let remaining = self.release_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.release_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(QueueError::Repository(RepositoryError::Query(
                    "database is locked".to_string(),
                )));
            }
            self.inner.release_deferred(lane, address).await
        }

        async fn fail_deferred(&self, lane: &str, error: &str) -> Result<Vec<JobId>, QueueError> {
            self.inner.fail_deferred(lane, error).await
        }

        async fn pending_lanes(&self) -> Result<Vec<String>, QueueError> {
            self.inner.pending_lanes().await
        }

        async fn deferred_lanes(&self) -> Result<Vec<String>, QueueError> {
            self.inner.deferred_lanes().await
        }

        async fn get(&self, id: &JobId) -> Result<Option<PostJob>, QueueError> {
            self.inner.get(id).await
        }

        async fn list(&self, status: Option<JobStatus>) -> Result<Vec<PostJob>, QueueError> {
            self.inner.list(status).await
        }

        async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>, QueueError> {
            self.inner.count_by_status().await
        }

        async fn prune_delivered(&self, before: chrono::DateTime<Utc>) -> Result<u64, QueueError> {
            self.inner.prune_delivered(before).await
        }
    }

    fn locked_release_queue(
        failures: u32,
    ) -> (
        Arc<LockedReleaseStore>,
        Arc<ScriptedRemote>,
        PostQueue<LockedReleaseStore, ScriptedRemote>,
    ) {
        let store = Arc::new(LockedReleaseStore::default());
        store.release_failures.store(failures, Ordering::SeqCst);
        let remote = Arc::new(ScriptedRemote::new());
        let queue = PostQueue::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::new(StaticIdentityProvider::new("conv-token")),
            &QueueConfig {
                base_delay_ms: 5,
                max_delay_ms: 20,
                ..QueueConfig::default()
            },
            EventBus::new(256),
        );
        (store, remote, queue)
    }

    #[tokio::test]
    async fn failed_release_is_retried() {
        let (store, remote, queue) = locked_release_queue(1);
        let gate = remote.hold_guest_creation();
        let mut rx = queue.events().subscribe();
        let coordinator = SessionCoordinator::spawn(queue.clone(), || {});

        coordinator.start_session("Ada");
        assert!(coordinator.wait_for_state(SessionState::CreatingGuest).await);
        let early = coordinator.handle_new_message("early").await.unwrap();
        gate.add_permits(1);
        assert!(coordinator.wait_for_state(SessionState::Active).await);
        coordinator.handle_new_message("late").await.unwrap();

        for _ in 0..2 {
            next_matching(&mut rx, |e| matches!(e, ChatEvent::MessageDelivered { .. }))
                .await
                .expect("expected delivery after release retry");
        }
        assert_eq!(remote.delivered_bodies().await, vec!["early", "late"]);
        let job = store.get(&early).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delivered);
    }

    #[tokio::test]
    async fn release_that_keeps_failing_reports_and_unblocks_lane() {
        let (store, remote, queue) = locked_release_queue(u32::MAX);
        let gate = remote.hold_guest_creation();
        let mut rx = queue.events().subscribe();
        let coordinator = SessionCoordinator::spawn(queue.clone(), || {});

        coordinator.start_session("Ada");
        assert!(coordinator.wait_for_state(SessionState::CreatingGuest).await);
        let early = coordinator.handle_new_message("early").await.unwrap();
        gate.add_permits(1);
        assert!(coordinator.wait_for_state(SessionState::Active).await);
        coordinator.handle_new_message("late").await.unwrap();

        let failed = next_matching(&mut rx, |e| matches!(e, ChatEvent::MessageFailed { .. }))
            .await
            .expect("stuck deferred message should be reported");
        assert!(matches!(failed, ChatEvent::MessageFailed { ref job_id, .. } if *job_id == early));

        next_matching(&mut rx, |e| matches!(e, ChatEvent::MessageDelivered { .. }))
            .await
            .expect("later message should not stay blocked");
        assert_eq!(remote.delivered_bodies().await, vec!["late"]);
        assert_eq!(
            store.get(&early).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }
}
