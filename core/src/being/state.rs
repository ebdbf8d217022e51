//! Behavioral state machine for the being's conversational posture.
//!
//! Every mutation goes through one fixed transition table; a requested
//! transition not reachable from the current state is silently ignored.
//! Some states decay on their own: entering them arms a cancellable timer
//! whose expiry re-validates the decay against the table, so a transition
//! that happened in the meantime always wins over a stale timer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::action::{BeingAction, UserAction};

const TRANSITION_STREAM_CAPACITY: usize = 32;

/// Conversational posture of the being.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BeingBehaviour {
    #[default]
    Idle,
    Focused,
    InConversation,
    Listening,
    RequestProcessing,
    RequestReceived,
    RequestError,
    PlayingBeingAction,
}

impl BeingBehaviour {
    /// States this state may be entered from.
    pub fn allowed_from(self) -> &'static [BeingBehaviour] {
        use BeingBehaviour::*;
        match self {
            Idle => &[Focused],
            Focused => &[Idle, InConversation],
            InConversation => &[
                Focused,
                Idle,
                InConversation,
                Listening,
                PlayingBeingAction,
                RequestError,
            ],
            Listening => &[Focused, Idle, InConversation],
            RequestProcessing => &[Focused, Idle, InConversation, Listening, RequestError],
            RequestReceived => &[RequestProcessing],
            RequestError => &[RequestProcessing],
            PlayingBeingAction => &[RequestReceived],
        }
    }
}

impl fmt::Display for BeingBehaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Focused => "focused",
            Self::InConversation => "in-conversation",
            Self::Listening => "listening",
            Self::RequestProcessing => "request-processing",
            Self::RequestReceived => "request-received",
            Self::RequestError => "request-error",
            Self::PlayingBeingAction => "playing-being-action",
        };
        write!(f, "{name}")
    }
}

/// How long each decaying state holds before sliding to its successor.
#[derive(Debug, Clone, Copy)]
pub struct StateTimeouts {
    pub focused: Duration,
    pub in_conversation: Duration,
    pub listening: Duration,
    pub request_error: Duration,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            focused: Duration::from_secs(20),
            in_conversation: Duration::from_secs(10),
            listening: Duration::from_secs(8),
            request_error: Duration::from_millis(100),
        }
    }
}

impl StateTimeouts {
    /// The decay rule for a state: where it slides and after how long.
    fn auto_rule(&self, state: BeingBehaviour) -> Option<(BeingBehaviour, Duration)> {
        match state {
            BeingBehaviour::Listening => Some((BeingBehaviour::InConversation, self.listening)),
            BeingBehaviour::InConversation => {
                Some((BeingBehaviour::Focused, self.in_conversation))
            }
            BeingBehaviour::RequestError => {
                Some((BeingBehaviour::InConversation, self.request_error))
            }
            BeingBehaviour::Focused => Some((BeingBehaviour::Idle, self.focused)),
            _ => None,
        }
    }
}

/// Read-only snapshot of the machine for UI/animation decisions.
#[derive(Debug, Clone, Default)]
pub struct BeingState {
    pub behaviour: BeingBehaviour,
    pub last_user_action: Option<UserAction>,
    pub last_being_action: Option<BeingAction>,
    pub muted: bool,
}

struct Posture {
    behaviour: BeingBehaviour,
    pending: Option<JoinHandle<()>>,
}

struct StateInner {
    posture: parking_lot::Mutex<Posture>,
    timeouts: StateTimeouts,
    transitions: broadcast::Sender<BeingBehaviour>,
    last_user_action: parking_lot::Mutex<Option<UserAction>>,
    last_being_action: parking_lot::Mutex<Option<BeingAction>>,
    muted: AtomicBool,
}

impl StateInner {
    /// Apply one transition request. Returns whether the request was
    /// accepted; a no-op request (target equals current) is accepted, fires
    /// no event, but still re-arms the decay timer.
    fn apply(self: &Arc<Self>, target: BeingBehaviour) -> bool {
        let changed;
        {
            let mut posture = self.posture.lock();
            let current = posture.behaviour;
            if target != current && !target.allowed_from().contains(&current) {
                tracing::trace!(%current, %target, "transition ignored");
                return false;
            }
            changed = target != current;
            posture.behaviour = target;

            // Whatever was scheduled belongs to the previous state.
            if let Some(pending) = posture.pending.take() {
                pending.abort();
            }
            if let Some((successor, delay)) = self.timeouts.auto_rule(target) {
                // Timers need a runtime; without one the machine still
                // transitions, it just never decays on its own.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let weak = Arc::downgrade(self);
                    posture.pending = Some(handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(inner) = weak.upgrade() {
                            inner.apply(successor);
                        }
                    }));
                } else {
                    tracing::debug!(%target, "no async runtime, state decay disarmed");
                }
            }
        }
        if changed {
            tracing::debug!(%target, "being state changed");
            let _ = self.transitions.send(target);
        }
        true
    }
}

/// Owns the being's behavioral state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BeingStateMachine {
    inner: Arc<StateInner>,
}

impl BeingStateMachine {
    pub fn new(timeouts: StateTimeouts) -> Self {
        Self {
            inner: Arc::new(StateInner {
                posture: parking_lot::Mutex::new(Posture {
                    behaviour: BeingBehaviour::default(),
                    pending: None,
                }),
                timeouts,
                transitions: broadcast::channel(TRANSITION_STREAM_CAPACITY).0,
                last_user_action: parking_lot::Mutex::new(None),
                last_being_action: parking_lot::Mutex::new(None),
                muted: AtomicBool::new(false),
            }),
        }
    }

    pub fn behaviour(&self) -> BeingBehaviour {
        self.inner.posture.lock().behaviour
    }

    pub fn snapshot(&self) -> BeingState {
        BeingState {
            behaviour: self.behaviour(),
            last_user_action: self.inner.last_user_action.lock().clone(),
            last_being_action: self.inner.last_being_action.lock().clone(),
            muted: self.is_muted(),
        }
    }

    /// Request a transition; returns whether it was accepted.
    pub fn try_transition(&self, target: BeingBehaviour) -> bool {
        self.inner.apply(target)
    }

    /// Stream of accepted state changes (no-op re-arms excluded).
    pub fn subscribe(&self) -> broadcast::Receiver<BeingBehaviour> {
        self.inner.transitions.subscribe()
    }

    pub fn record_user_action(&self, action: UserAction) {
        *self.inner.last_user_action.lock() = Some(action);
    }

    pub fn record_being_action(&self, action: BeingAction) {
        *self.inner.last_being_action.lock() = Some(action);
    }

    /// Returns whether the flag actually changed.
    pub fn set_muted(&self, muted: bool) -> bool {
        self.inner.muted.swap(muted, Ordering::SeqCst) != muted
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }
}

impl Default for BeingStateMachine {
    fn default() -> Self {
        Self::new(StateTimeouts::default())
    }
}
