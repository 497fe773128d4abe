//! Session lifecycle state machine.
//!
//! Pure and synchronous: every input returns the effects the coordinator
//! must carry out, and nothing here touches the network or the queue. At
//! most one remote operation is outstanding at a time, tracked in a single
//! pending-operation slot. A completion whose operation id does not match
//! the slot belongs to an abandoned operation and is ignored.

use deskchat_types::chat::{ChatSession, GuestIdentity, SessionState};
use deskchat_types::error::{RemoteError, SessionError};
use deskchat_types::job::JobAddress;

/// Identifies one issued remote operation.
pub type OpId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    CreateGuest,
    StartSession,
    EndSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOp {
    pub id: OpId,
    pub kind: OpKind,
}

/// Work the coordinator must perform after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    CreateGuest { op: OpId },
    StartSession { op: OpId, guest: GuestIdentity },
    EndSession {
        op: OpId,
        guest: GuestIdentity,
        session: ChatSession,
    },
    /// The session is live; deferred messages may be released.
    Established { session: ChatSession },
    /// Establishment failed and the machine is back in `Idle`.
    Failed(SessionError),
    /// No session will ever address this conversation's deferred messages.
    AbandonDeferred,
    /// Teardown is complete.
    Finished,
}

#[derive(Debug, Default)]
pub struct SessionMachine {
    state: SessionState,
    guest: Option<GuestIdentity>,
    session: Option<ChatSession>,
    pending: Option<PendingOp>,
    next_op: OpId,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending(&self) -> Option<PendingOp> {
        self.pending
    }

    /// Identifiers for posting messages, available while a session exists.
    pub fn address(&self) -> Option<JobAddress> {
        match (self.state, &self.guest, &self.session) {
            (SessionState::Active | SessionState::Ending, Some(guest), Some(session)) => {
                Some(JobAddress::new(guest, session))
            }
            _ => None,
        }
    }

    /// Guest and session to signal presence on; only while `Active`.
    pub fn typing_target(&self) -> Option<(&GuestIdentity, &ChatSession)> {
        match (self.state, &self.guest, &self.session) {
            (SessionState::Active, Some(guest), Some(session)) => Some((guest, session)),
            _ => None,
        }
    }

    /// `Idle -> CreatingGuest`. No effect in any other state.
    pub fn begin(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Idle {
            return Vec::new();
        }
        self.state = SessionState::CreatingGuest;
        let op = self.issue(OpKind::CreateGuest);
        vec![Effect::CreateGuest { op }]
    }

    pub fn guest_created(
        &mut self,
        op: OpId,
        result: Result<GuestIdentity, RemoteError>,
    ) -> Vec<Effect> {
        if !self.completes(op, OpKind::CreateGuest) {
            return Vec::new();
        }

        match result {
            Ok(guest) => {
                self.state = SessionState::StartingSession;
                self.guest = Some(guest.clone());
                let op = self.issue(OpKind::StartSession);
                vec![Effect::StartSession { op, guest }]
            }
            Err(e) => self.fail(SessionError::GuestCreation(e)),
        }
    }

    pub fn session_started(
        &mut self,
        op: OpId,
        result: Result<ChatSession, RemoteError>,
    ) -> Vec<Effect> {
        if !self.completes(op, OpKind::StartSession) {
            return Vec::new();
        }

        match (result, self.guest.as_ref()) {
            (Ok(session), Some(_)) => {
                self.state = SessionState::Active;
                self.session = Some(session.clone());
                vec![Effect::Established { session }]
            }
            (Ok(_), None) => self.fail(SessionError::SessionStart(RemoteError::Rejected(
                "session started without a guest".to_string(),
            ))),
            (Err(e), _) => self.fail(SessionError::SessionStart(e)),
        }
    }

    /// Give up on the pending establishment step without a remote result.
    pub fn abort(&mut self, op: OpId, error: SessionError) -> Vec<Effect> {
        let establishing = matches!(
            self.pending,
            Some(PendingOp { id, kind: OpKind::CreateGuest | OpKind::StartSession }) if id == op
        );
        if !establishing {
            return Vec::new();
        }
        self.pending = None;
        self.fail(error)
    }

    pub fn destroy(&mut self) -> Vec<Effect> {
        match self.state {
            SessionState::Ending | SessionState::Ended => Vec::new(),
            SessionState::Active => match (self.guest.clone(), self.session.clone()) {
                (Some(guest), Some(session)) => {
                    self.state = SessionState::Ending;
                    let op = self.issue(OpKind::EndSession);
                    vec![Effect::EndSession { op, guest, session }]
                }
                _ => self.finish(),
            },
            SessionState::Idle | SessionState::CreatingGuest | SessionState::StartingSession => {
                let mut effects = vec![Effect::AbandonDeferred];
                effects.extend(self.finish());
                effects
            }
        }
    }

    /// Session end finished, with any outcome.
    pub fn session_ended(&mut self, op: OpId) -> Vec<Effect> {
        if !self.completes(op, OpKind::EndSession) {
            return Vec::new();
        }
        self.finish()
    }

    fn issue(&mut self, kind: OpKind) -> OpId {
        self.next_op += 1;
        self.pending = Some(PendingOp {
            id: self.next_op,
            kind,
        });
        self.next_op
    }

    fn completes(&mut self, op: OpId, kind: OpKind) -> bool {
        if self.pending == Some(PendingOp { id: op, kind }) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    fn fail(&mut self, error: SessionError) -> Vec<Effect> {
        self.state = SessionState::Idle;
        self.guest = None;
        self.session = None;
        vec![Effect::Failed(error)]
    }

    fn finish(&mut self) -> Vec<Effect> {
        self.state = SessionState::Ended;
        self.pending = None;
        self.guest = None;
        self.session = None;
        vec![Effect::Finished]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest() -> GuestIdentity {
        GuestIdentity::new("guest-1", "token-1")
    }

    fn session() -> ChatSession {
        ChatSession::new("session-1", "case-1")
    }

    fn op_of(effects: &[Effect]) -> OpId {
        match effects.first() {
            Some(Effect::CreateGuest { op })
            | Some(Effect::StartSession { op, .. })
            | Some(Effect::EndSession { op, .. }) => *op,
            other => panic!("expected a remote operation, got {other:?}"),
        }
    }

    fn active() -> SessionMachine {
        let mut machine = SessionMachine::new();
        let op = op_of(&machine.begin());
        let op = op_of(&machine.guest_created(op, Ok(guest())));
        machine.session_started(op, Ok(session()));
        machine
    }

    #[test]
    fn happy_path_reaches_active() {
        let mut machine = SessionMachine::new();
        assert_eq!(machine.state(), SessionState::Idle);

        let op = op_of(&machine.begin());
        assert_eq!(machine.state(), SessionState::CreatingGuest);

        let effects = machine.guest_created(op, Ok(guest()));
        assert_eq!(machine.state(), SessionState::StartingSession);
        assert!(matches!(&effects[0], Effect::StartSession { guest: g, .. } if g.id == "guest-1"));

        let effects = machine.session_started(op_of(&effects), Ok(session()));
        assert_eq!(machine.state(), SessionState::Active);
        assert_eq!(effects, vec![Effect::Established { session: session() }]);
        assert_eq!(machine.address(), Some(JobAddress::new(&guest(), &session())));
        assert!(machine.pending().is_none());
        assert!(machine.typing_target().is_some());
    }

    #[test]
    fn begin_is_noop_outside_idle() {
        let mut machine = SessionMachine::new();
        machine.begin();
        assert!(machine.begin().is_empty());
        assert!(active().begin().is_empty());
    }

    #[test]
    fn guest_failure_returns_to_idle() {
        let mut machine = SessionMachine::new();
        let op = op_of(&machine.begin());
        let effects = machine.guest_created(op, Err(RemoteError::Transient("503".into())));

        assert_eq!(machine.state(), SessionState::Idle);
        assert!(matches!(&effects[0], Effect::Failed(SessionError::GuestCreation(_))));
    }

    #[test]
    fn session_failure_discards_guest() {
        let mut machine = SessionMachine::new();
        let op = op_of(&machine.begin());
        let op = op_of(&machine.guest_created(op, Ok(guest())));
        let effects = machine.session_started(op, Err(RemoteError::Rejected("no".into())));

        assert_eq!(machine.state(), SessionState::Idle);
        assert!(matches!(&effects[0], Effect::Failed(SessionError::SessionStart(_))));
        assert!(machine.address().is_none());

        // Retry starts from a clean slate
        assert!(matches!(machine.begin()[0], Effect::CreateGuest { .. }));
    }

    #[test]
    fn stale_completion_is_ignored() {
        let mut machine = SessionMachine::new();
        let op = op_of(&machine.begin());
        assert!(machine.guest_created(op + 7, Ok(guest())).is_empty());
        assert_eq!(machine.state(), SessionState::CreatingGuest);

        machine.destroy();
        assert!(machine.guest_created(op, Ok(guest())).is_empty());
        assert_eq!(machine.state(), SessionState::Ended);
    }

    #[test]
    fn abort_returns_to_idle() {
        let mut machine = SessionMachine::new();
        let op = op_of(&machine.begin());
        let effects = machine.abort(op, SessionError::MissingConversationToken);

        assert_eq!(machine.state(), SessionState::Idle);
        assert_eq!(
            effects,
            vec![Effect::Failed(SessionError::MissingConversationToken)]
        );
    }

    #[test]
    fn destroy_before_session_abandons_deferred() {
        let mut machine = SessionMachine::new();
        machine.begin();
        assert_eq!(
            machine.destroy(),
            vec![Effect::AbandonDeferred, Effect::Finished]
        );
        assert_eq!(machine.state(), SessionState::Ended);
        assert!(machine.destroy().is_empty());
    }

    #[test]
    fn destroy_when_active_ends_session() {
        let mut machine = active();
        let effects = machine.destroy();
        assert_eq!(machine.state(), SessionState::Ending);
        assert!(matches!(&effects[0], Effect::EndSession { session: s, .. } if s.id == "session-1"));

        // Still addressable while the end call is in flight, but no typing
        assert!(machine.address().is_some());
        assert!(machine.typing_target().is_none());
        assert!(machine.destroy().is_empty());

        assert_eq!(machine.session_ended(op_of(&effects)), vec![Effect::Finished]);
        assert_eq!(machine.state(), SessionState::Ended);
        assert!(machine.address().is_none());
    }
}
