//! Action token: the fan-out point between handlers and the dispatcher.
//!
//! Handlers publish inbound events through a cloned [`ActionToken`]; every
//! publication lands on one FIFO queue, so per-handler arrival order is
//! preserved (across handlers the order is first-published-first-forwarded,
//! nothing stronger). The dispatcher drains the queue and re-emits each
//! event unchanged onto [`DispatcherEvents`], one broadcast stream per
//! inbound-action variant. Subscribers each own their receiver, so a slow or
//! panicking subscriber can only lag its own stream, never block delivery to
//! the others.

use tokio::sync::{broadcast, mpsc};

use crate::action::{
    BehaviorAction, BeingAction, ConnectionEvent, CustomAction, EngineEvent, InboundAction,
    NamedAction, Signal, UiAction, UserAction,
};

/// Everything a handler can report upward.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    Action(InboundAction),
    Connection(ConnectionEvent),
}

/// Publish handle given to every handler. Cheap to clone; publishing never
/// blocks and never fails visibly (a closed dispatcher just drops events).
#[derive(Clone)]
pub struct ActionToken {
    tx: mpsc::UnboundedSender<TokenEvent>,
}

impl ActionToken {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TokenEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, action: InboundAction) {
        let _ = self.tx.send(TokenEvent::Action(action));
    }

    pub fn publish_connection(&self, event: ConnectionEvent) {
        let _ = self.tx.send(TokenEvent::Connection(event));
    }
}

/// The dispatcher's public event surface: a fixed set of named streams, one
/// per inbound-action variant plus connection lifecycle.
pub struct DispatcherEvents {
    user_action: broadcast::Sender<UserAction>,
    being_action: broadcast::Sender<BeingAction>,
    ui_action: broadcast::Sender<UiAction>,
    custom_action: broadcast::Sender<CustomAction>,
    behavior_action: broadcast::Sender<BehaviorAction>,
    engine_event: broadcast::Sender<EngineEvent>,
    signal: broadcast::Sender<Signal>,
    named_action: broadcast::Sender<NamedAction>,
    speech_recognized: broadcast::Sender<String>,
    conversation_initialized: broadcast::Sender<String>,
    connection: broadcast::Sender<ConnectionEvent>,
}

impl DispatcherEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            user_action: broadcast::channel(capacity).0,
            being_action: broadcast::channel(capacity).0,
            ui_action: broadcast::channel(capacity).0,
            custom_action: broadcast::channel(capacity).0,
            behavior_action: broadcast::channel(capacity).0,
            engine_event: broadcast::channel(capacity).0,
            signal: broadcast::channel(capacity).0,
            named_action: broadcast::channel(capacity).0,
            speech_recognized: broadcast::channel(capacity).0,
            conversation_initialized: broadcast::channel(capacity).0,
            connection: broadcast::channel(capacity).0,
        }
    }

    pub fn user_actions(&self) -> broadcast::Receiver<UserAction> {
        self.user_action.subscribe()
    }

    pub fn being_actions(&self) -> broadcast::Receiver<BeingAction> {
        self.being_action.subscribe()
    }

    pub fn ui_actions(&self) -> broadcast::Receiver<UiAction> {
        self.ui_action.subscribe()
    }

    pub fn custom_actions(&self) -> broadcast::Receiver<CustomAction> {
        self.custom_action.subscribe()
    }

    pub fn behavior_actions(&self) -> broadcast::Receiver<BehaviorAction> {
        self.behavior_action.subscribe()
    }

    pub fn engine_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.engine_event.subscribe()
    }

    pub fn signals(&self) -> broadcast::Receiver<Signal> {
        self.signal.subscribe()
    }

    pub fn named_actions(&self) -> broadcast::Receiver<NamedAction> {
        self.named_action.subscribe()
    }

    pub fn speech_recognized(&self) -> broadcast::Receiver<String> {
        self.speech_recognized.subscribe()
    }

    pub fn conversation_initialized(&self) -> broadcast::Receiver<String> {
        self.conversation_initialized.subscribe()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Re-emit one token event on its variant stream, unchanged.
    pub(crate) fn forward(&self, event: TokenEvent) {
        match event {
            TokenEvent::Action(InboundAction::UserAction(a)) => {
                let _ = self.user_action.send(a);
            }
            TokenEvent::Action(InboundAction::BeingAction(a)) => {
                let _ = self.being_action.send(a);
            }
            TokenEvent::Action(InboundAction::UiAction(a)) => {
                let _ = self.ui_action.send(a);
            }
            TokenEvent::Action(InboundAction::CustomAction(a)) => {
                let _ = self.custom_action.send(a);
            }
            TokenEvent::Action(InboundAction::BehaviorAction(a)) => {
                let _ = self.behavior_action.send(a);
            }
            TokenEvent::Action(InboundAction::EngineEvent(a)) => {
                let _ = self.engine_event.send(a);
            }
            TokenEvent::Action(InboundAction::Signal(a)) => {
                let _ = self.signal.send(a);
            }
            TokenEvent::Action(InboundAction::NamedAction(a)) => {
                let _ = self.named_action.send(a);
            }
            TokenEvent::Action(InboundAction::SpeechRecognized(text)) => {
                let _ = self.speech_recognized.send(text);
            }
            TokenEvent::Action(InboundAction::ConversationInitialized(id)) => {
                let _ = self.conversation_initialized.send(id);
            }
            TokenEvent::Connection(ev) => {
                let _ = self.connection.send(ev);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publication_order_is_preserved() {
        let (token, mut rx) = ActionToken::channel();
        for i in 0..5 {
            token.publish(InboundAction::SpeechRecognized(format!("t{i}")));
        }
        for i in 0..5 {
            match rx.recv().await.unwrap() {
                TokenEvent::Action(InboundAction::SpeechRecognized(text)) => {
                    assert_eq!(text, format!("t{i}"));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_forward_routes_to_variant_stream() {
        let events = DispatcherEvents::new(8);
        let mut signals = events.signals();
        let mut user_actions = events.user_actions();

        events.forward(TokenEvent::Action(InboundAction::Signal(Signal {
            name: "listening-start".to_string(),
            value: String::new(),
        })));

        let signal = signals.recv().await.unwrap();
        assert_eq!(signal.name, "listening-start");
        // Nothing leaked onto another stream
        assert!(user_actions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_events_have_their_own_stream() {
        let events = DispatcherEvents::new(8);
        let mut connection = events.connection_events();
        events.forward(TokenEvent::Connection(ConnectionEvent::Reconnecting));
        assert_eq!(
            connection.recv().await.unwrap(),
            ConnectionEvent::Reconnecting
        );
    }
}
