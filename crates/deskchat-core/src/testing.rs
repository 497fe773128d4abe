//! Test doubles for the core ports.
//!
//! `ScriptedRemote` records every remote call and answers from a script;
//! `RecordingView` collects the events forwarded to a view. Enabled for this
//! crate's tests and, through the `testing` feature, for downstream crates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use deskchat_types::chat::{ChatSession, GuestIdentity, TypingSignal};
use deskchat_types::error::RemoteError;
use deskchat_types::event::ChatEvent;
use deskchat_types::job::JobId;
use tokio::sync::{Mutex, Semaphore, broadcast};

use crate::remote::{OutboundMessage, RemoteChatService};
use crate::session::view::ChatView;

/// One call observed by `ScriptedRemote`, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    CreateGuest { display_name: String },
    StartSession { guest_id: String },
    EndSession { guest_id: String, session_id: String },
    Typing { signal: TypingSignal, session_id: String },
    Post(RecordedPost),
}

/// An owned copy of an `OutboundMessage`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPost {
    pub client_id: JobId,
    pub body: String,
    pub guest_id: String,
    pub guest_token: String,
    pub conversation_token: String,
    pub case_link_id: String,
}

#[derive(Default)]
struct Script {
    calls: Vec<RemoteCall>,
    delivered: Vec<String>,
    guests_created: u64,
    sessions_started: u64,
    guest_failures: VecDeque<RemoteError>,
    session_failures: VecDeque<RemoteError>,
    post_failures: HashMap<String, VecDeque<RemoteError>>,
    typing_failure: Option<RemoteError>,
}

/// A `RemoteChatService` driven by a script.
///
/// Guests are issued as `guest-N`/`token-N` and sessions as
/// `session-N`/`case-N`, counting from 1.
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<Script>,
    guest_gate: StdMutex<Option<Arc<Semaphore>>>,
    end_gate: StdMutex<Option<Arc<Semaphore>>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail posts of `body` with `errors`, one per attempt, then succeed.
    pub async fn fail_post(&self, body: &str, errors: Vec<RemoteError>) {
        self.script
            .lock()
            .await
            .post_failures
            .insert(body.to_string(), errors.into());
    }

    pub async fn fail_next_guest(&self, error: RemoteError) {
        self.script.lock().await.guest_failures.push_back(error);
    }

    pub async fn fail_next_session(&self, error: RemoteError) {
        self.script.lock().await.session_failures.push_back(error);
    }

    pub async fn fail_typing(&self, error: RemoteError) {
        self.script.lock().await.typing_failure = Some(error);
    }

    /// Make guest creation wait for a permit on the returned semaphore.
    pub fn hold_guest_creation(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.guest_gate) = Some(Arc::clone(&gate));
        gate
    }

    /// Make session end wait for a permit on the returned semaphore.
    pub fn hold_session_end(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.end_gate) = Some(Arc::clone(&gate));
        gate
    }

    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.script.lock().await.calls.clone()
    }

    pub async fn posts(&self) -> Vec<RecordedPost> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::Post(post) => Some(post),
                _ => None,
            })
            .collect()
    }

    /// Bodies of every post attempt, failed ones included.
    pub async fn attempted_bodies(&self) -> Vec<String> {
        self.posts().await.into_iter().map(|post| post.body).collect()
    }

    /// Bodies of acknowledged posts, in acknowledgement order.
    pub async fn delivered_bodies(&self) -> Vec<String> {
        self.script.lock().await.delivered.clone()
    }

    pub async fn guest_calls(&self) -> usize {
        self.count(|call| matches!(call, RemoteCall::CreateGuest { .. }))
            .await
    }

    pub async fn session_calls(&self) -> usize {
        self.count(|call| matches!(call, RemoteCall::StartSession { .. }))
            .await
    }

    pub async fn end_calls(&self) -> usize {
        self.count(|call| matches!(call, RemoteCall::EndSession { .. }))
            .await
    }

    pub async fn typing_calls(&self) -> usize {
        self.count(|call| matches!(call, RemoteCall::Typing { .. }))
            .await
    }

    async fn count(&self, pred: impl Fn(&RemoteCall) -> bool) -> usize {
        self.script
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| pred(call))
            .count()
    }

    async fn pass_gate(gate: &StdMutex<Option<Arc<Semaphore>>>) {
        let gate = lock(gate).clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RemoteChatService for ScriptedRemote {
    async fn create_guest_customer(
        &self,
        display_name: &str,
        _conversation_token: &str,
    ) -> Result<GuestIdentity, RemoteError> {
        self.script.lock().await.calls.push(RemoteCall::CreateGuest {
            display_name: display_name.to_string(),
        });
        Self::pass_gate(&self.guest_gate).await;

        let mut script = self.script.lock().await;
        if let Some(error) = script.guest_failures.pop_front() {
            return Err(error);
        }
        script.guests_created += 1;
        let n = script.guests_created;
        Ok(GuestIdentity::new(format!("guest-{n}"), format!("token-{n}")))
    }

    async fn start_session(
        &self,
        guest: &GuestIdentity,
        _conversation_token: &str,
    ) -> Result<ChatSession, RemoteError> {
        let mut script = self.script.lock().await;
        script.calls.push(RemoteCall::StartSession {
            guest_id: guest.id.clone(),
        });
        if let Some(error) = script.session_failures.pop_front() {
            return Err(error);
        }
        script.sessions_started += 1;
        let n = script.sessions_started;
        Ok(ChatSession::new(format!("session-{n}"), format!("case-{n}")))
    }

    async fn end_session(
        &self,
        guest: &GuestIdentity,
        session: &ChatSession,
        _conversation_token: &str,
    ) -> Result<(), RemoteError> {
        self.script.lock().await.calls.push(RemoteCall::EndSession {
            guest_id: guest.id.clone(),
            session_id: session.id.clone(),
        });
        Self::pass_gate(&self.end_gate).await;
        Ok(())
    }

    async fn signal_typing(
        &self,
        signal: TypingSignal,
        _guest: &GuestIdentity,
        session: &ChatSession,
        _conversation_token: &str,
    ) -> Result<(), RemoteError> {
        let mut script = self.script.lock().await;
        script.calls.push(RemoteCall::Typing {
            signal,
            session_id: session.id.clone(),
        });
        match script.typing_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn post_message(&self, message: &OutboundMessage<'_>) -> Result<(), RemoteError> {
        let mut script = self.script.lock().await;
        script.calls.push(RemoteCall::Post(RecordedPost {
            client_id: message.client_id.clone(),
            body: message.body.to_string(),
            guest_id: message.guest_id.to_string(),
            guest_token: message.guest_token.to_string(),
            conversation_token: message.conversation_token.to_string(),
            case_link_id: message.case_link_id.to_string(),
        }));

        let failure = script
            .post_failures
            .get_mut(message.body)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }
        script.delivered.push(message.body.to_string());
        Ok(())
    }
}

/// A `ChatView` that keeps every event it is handed.
#[derive(Default)]
pub struct RecordingView {
    events: StdMutex<Vec<ChatEvent>>,
}

impl RecordingView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChatEvent> {
        lock(&self.events).clone()
    }
}

impl ChatView for RecordingView {
    fn on_event(&self, event: &ChatEvent) {
        lock(&self.events).push(event.clone());
    }
}

/// Receive events until one matches `pred`, giving up after five seconds.
pub async fn next_matching(
    rx: &mut broadcast::Receiver<ChatEvent>,
    pred: impl Fn(&ChatEvent) -> bool,
) -> Option<ChatEvent> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .ok()
        .flatten()
}
