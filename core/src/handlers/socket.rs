//! Persistent-socket conversation handler.
//!
//! Owns one websocket to the conversation engine for the handler's whole
//! lifetime. Outbound requests are queued and written by a single task;
//! inbound server messages are normalized into `InboundAction`s and
//! published through the action token. A dropped connection is retried a
//! bounded number of times; messages in flight during a drop are lost
//! (no exactly-once guarantee across reconnects).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::action::{
    ConnectionEvent, ConversationMessage, InboundAction, MessageAction, TextAction, UserAction,
};
use crate::auth::HeaderSigner;
use crate::error::{Result, SonaError};
use crate::handler::{
    ActionRequest, Capability, CommunicationHandler, DisposeHook, RoutedRequest,
};
use crate::session::Session;
use crate::token::ActionToken;

use async_trait::async_trait;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NAME: &str = "conversation-socket";
const CAPABILITIES: &[Capability] = &[
    Capability::SendText,
    Capability::SendSignal,
    Capability::SendAudio,
    Capability::SendAudioStream,
];
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// FIFO of serialized outbound frames, clearable without tearing down the
/// connection.
pub(crate) struct OutboundQueue {
    items: parking_lot::Mutex<VecDeque<String>>,
    notify: tokio::sync::Notify,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self {
            items: parking_lot::Mutex::new(VecDeque::new()),
            notify: tokio::sync::Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, frame: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.items.lock().push_back(frame);
        self.notify.notify_one();
    }

    pub(crate) fn clear(&self) {
        self.items.lock().clear();
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Next queued frame, or `None` once the queue is closed and drained.
    pub(crate) async fn pop(&self) -> Option<String> {
        loop {
            if let Some(frame) = self.items.lock().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

/// Wire envelope for frames the client sends.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
enum ClientEnvelope {
    ConversationInit {
        end_user_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
    Message {
        message: ConversationMessage,
    },
    AudioChunk {
        data: String,
        streamed: bool,
    },
}

/// Wire envelope for frames the server sends.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
enum ServerEnvelope {
    ConversationInitialized { conversation_id: String },
    Message { message: ConversationMessage },
}

/// Everything the connection task needs, detached from the handler so the
/// task survives `&self` borrows.
struct ConnectionCtx {
    url: String,
    signer: Arc<dyn HeaderSigner>,
    session: Arc<Session>,
    queue: Arc<OutboundQueue>,
    token: ActionToken,
    requests: mpsc::UnboundedSender<RoutedRequest>,
}

pub struct ConversationSocketHandler {
    url: String,
    signer: Arc<dyn HeaderSigner>,
    token: ActionToken,
    requests: mpsc::UnboundedSender<RoutedRequest>,
    queue: Arc<OutboundQueue>,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
    session: parking_lot::Mutex<Option<Arc<Session>>>,
    prepared: AtomicBool,
    disposed: AtomicBool,
    dispose_hook: DisposeHook,
}

impl ConversationSocketHandler {
    pub fn new(
        url: String,
        signer: Arc<dyn HeaderSigner>,
        token: ActionToken,
        requests: mpsc::UnboundedSender<RoutedRequest>,
    ) -> Self {
        Self {
            url,
            signer,
            token,
            requests,
            queue: Arc::new(OutboundQueue::new()),
            listener: parking_lot::Mutex::new(None),
            session: parking_lot::Mutex::new(None),
            prepared: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            dispose_hook: DisposeHook::new(),
        }
    }

    pub fn set_dispose_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.dispose_hook.set(hook);
    }

    fn push_envelope(&self, envelope: &ClientEnvelope) -> Result<()> {
        if !self.prepared.load(Ordering::SeqCst) {
            return Err(SonaError::action(NAME, "handler is not prepared"));
        }
        let frame = serde_json::to_string(envelope)?;
        self.queue.push(frame);
        Ok(())
    }
}

#[async_trait]
impl CommunicationHandler for ConversationSocketHandler {
    fn name(&self) -> &str {
        NAME
    }

    fn has_capability(&self, capability: Capability) -> bool {
        CAPABILITIES.contains(&capability)
    }

    fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    async fn prepare(&self, session: Arc<Session>) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SonaError::connection(NAME, "handler disposed"));
        }
        if self.prepared.load(Ordering::SeqCst)
            && self.session.lock().as_deref() == Some(&*session)
        {
            return Ok(());
        }

        // New session replaces whatever connection served the previous one.
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.queue.clear();

        let ws = connect(&self.url, self.signer.as_ref(), &session).await?;
        *self.session.lock() = Some(session.clone());

        let ctx = ConnectionCtx {
            url: self.url.clone(),
            signer: self.signer.clone(),
            session,
            queue: self.queue.clone(),
            token: self.token.clone(),
            requests: self.requests.clone(),
        };
        *self.listener.lock() = Some(tokio::spawn(run_connection(ws, ctx)));

        self.prepared.store(true, Ordering::SeqCst);
        self.token.publish_connection(ConnectionEvent::Connected);
        tracing::info!(url = %self.url, "conversation socket prepared");
        Ok(())
    }

    async fn make_action(&self, request: ActionRequest) -> Result<()> {
        match request {
            ActionRequest::Text(text) => self.push_envelope(&ClientEnvelope::Message {
                message: ConversationMessage {
                    action: Some(MessageAction {
                        text: Some(TextAction::from_text(text)),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            }),
            ActionRequest::Signal { name, value } => {
                self.push_envelope(&ClientEnvelope::Message {
                    message: ConversationMessage {
                        action: Some(MessageAction {
                            signal: Some(crate::action::Signal { name, value }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                })
            }
            ActionRequest::Audio(bytes) => self.push_envelope(&ClientEnvelope::AudioChunk {
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
                streamed: false,
            }),
            ActionRequest::AudioStream(bytes) => {
                self.push_envelope(&ClientEnvelope::AudioChunk {
                    data: base64::engine::general_purpose::STANDARD.encode(bytes),
                    streamed: true,
                })
            }
            ActionRequest::Tts(_) => Err(SonaError::action(
                Capability::ProcessTts,
                "not served by the conversation socket",
            )),
        }
    }

    fn clear_processing_queue(&self) {
        self.queue.clear();
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.prepared.store(false, Ordering::SeqCst);
        self.queue.close();
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.dispose_hook.run();
        tracing::debug!("conversation socket disposed");
    }
}

async fn connect(url: &str, signer: &dyn HeaderSigner, session: &Session) -> Result<WsStream> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SonaError::connection(NAME, e))?;
    signer.sign(request.headers_mut());

    let (mut ws, _) = connect_async(request)
        .await
        .map_err(|e| SonaError::connection(NAME, e))?;

    let init = ClientEnvelope::ConversationInit {
        end_user_id: session.end_user_id,
        conversation_id: session.conversation_id.clone(),
    };
    ws.send(Message::Text(serde_json::to_string(&init)?))
        .await
        .map_err(|e| SonaError::connection(NAME, e))?;
    Ok(ws)
}

enum Drive {
    /// Queue closed locally, connection should end for good.
    Closed,
    /// Transport dropped out from under us.
    Lost,
}

async fn run_connection(mut ws: WsStream, ctx: ConnectionCtx) {
    loop {
        match drive(&mut ws, &ctx).await {
            Drive::Closed => {
                let _ = ws.close(None).await;
                return;
            }
            Drive::Lost => {
                let reconnected = retry_connect(&ctx.token, |_| {
                    connect(&ctx.url, ctx.signer.as_ref(), &ctx.session)
                })
                .await;
                match reconnected {
                    Some(new_ws) => ws = new_ws,
                    None => return,
                }
            }
        }
    }
}

/// Bounded reconnect with linear backoff. Announces `Reconnecting` before
/// the first attempt, `Connected` on success and `Disconnected` once the
/// attempt budget is spent.
async fn retry_connect<T, F, Fut>(token: &ActionToken, mut attempt: F) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    token.publish_connection(ConnectionEvent::Reconnecting);
    for n in 1..=MAX_RECONNECT_ATTEMPTS {
        tokio::time::sleep(Duration::from_secs(u64::from(n))).await;
        match attempt(n).await {
            Ok(value) => {
                token.publish_connection(ConnectionEvent::Connected);
                return Some(value);
            }
            Err(e) => tracing::warn!(attempt = n, "reconnect failed: {e}"),
        }
    }
    tracing::warn!("giving up on conversation socket");
    token.publish_connection(ConnectionEvent::Disconnected);
    None
}

async fn drive(ws: &mut WsStream, ctx: &ConnectionCtx) -> Drive {
    loop {
        tokio::select! {
            outbound = ctx.queue.pop() => match outbound {
                Some(frame) => {
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return Drive::Lost;
                    }
                }
                None => return Drive::Closed,
            },
            inbound = ws.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_server_frame(&text, ctx),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Drive::Lost,
            },
        }
    }
}

fn handle_server_frame(frame: &str, ctx: &ConnectionCtx) {
    let envelope: ServerEnvelope = match serde_json::from_str(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("ignoring unparseable server frame: {e}");
            return;
        }
    };
    match envelope {
        ServerEnvelope::ConversationInitialized { conversation_id } => {
            ctx.token
                .publish(InboundAction::ConversationInitialized(conversation_id));
        }
        ServerEnvelope::Message { message } => dispatch_message(message, ctx),
    }
}

/// Normalize one conversation message into typed inbound actions.
fn dispatch_message(message: ConversationMessage, ctx: &ConnectionCtx) {
    let from_end_user = message.is_from_end_user();
    let Some(action) = message.action else {
        return;
    };

    if let Some(text_action) = action.text {
        if let Some(text) = text_action.text {
            if from_end_user {
                if text_action.speech_recognized_state.is_some() {
                    ctx.token
                        .publish(InboundAction::SpeechRecognized(text.clone()));
                }
                ctx.token
                    .publish(InboundAction::UserAction(UserAction { text }));
            } else {
                // Being text needs a voice before it can be played; route a
                // synthesis request back through the dispatcher.
                let _ = ctx.requests.send(RoutedRequest::ProcessTts {
                    text,
                    language: text_action.language,
                });
            }
        }
    }
    if let Some(signal) = action.signal {
        ctx.token.publish(InboundAction::Signal(signal));
    }
    if let Some(engine_event) = action.engine_event {
        ctx.token.publish(InboundAction::EngineEvent(engine_event));
    }
    if let Some(named_action) = action.named_action {
        ctx.token.publish(InboundAction::NamedAction(named_action));
    }
    if let Some(custom_action) = action.custom_action {
        ctx.token.publish(InboundAction::CustomAction(custom_action));
    }
    if let Some(ui_action) = action.ui_action {
        ctx.token.publish(InboundAction::UiAction(ui_action));
    }
    if let Some(behavior_action) = action.behavior_action {
        ctx.token
            .publish(InboundAction::BehaviorAction(behavior_action));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenEvent;

    fn test_ctx() -> (ConnectionCtx, mpsc::UnboundedReceiver<TokenEvent>, mpsc::UnboundedReceiver<RoutedRequest>) {
        let (token, token_rx) = ActionToken::channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let ctx = ConnectionCtx {
            url: "ws://localhost/conversation".to_string(),
            signer: Arc::new(crate::auth::NoopSigner),
            session: Arc::new(Session::new(Uuid::new_v4(), None)),
            queue: Arc::new(OutboundQueue::new()),
            token,
            requests: req_tx,
        };
        (ctx, token_rx, req_rx)
    }

    #[tokio::test]
    async fn test_outbound_queue_clear_drops_pending_frames() {
        let queue = OutboundQueue::new();
        queue.push("a".to_string());
        queue.push("b".to_string());
        queue.clear();
        queue.push("c".to_string());
        assert_eq!(queue.pop().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_outbound_queue_close_unblocks_pop() {
        let queue = Arc::new(OutboundQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(popper.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_end_user_text_becomes_user_action() {
        let (ctx, mut token_rx, _req_rx) = test_ctx();
        let frame = r#"{
            "type": "message",
            "message": {
                "participantType": "EndUser",
                "action": { "text": { "text": "hello", "speechRecognizedState": "recognized" } }
            }
        }"#;
        handle_server_frame(frame, &ctx);

        match token_rx.recv().await.unwrap() {
            TokenEvent::Action(InboundAction::SpeechRecognized(text)) => assert_eq!(text, "hello"),
            other => panic!("expected speech first, got {other:?}"),
        }
        match token_rx.recv().await.unwrap() {
            TokenEvent::Action(InboundAction::UserAction(action)) => {
                assert_eq!(action.text, "hello")
            }
            other => panic!("expected user action, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_being_text_routes_tts_request() {
        let (ctx, _token_rx, mut req_rx) = test_ctx();
        let frame = r#"{
            "type": "message",
            "message": {
                "participantType": "Api",
                "action": { "text": { "text": "welcome", "language": "en-US" } }
            }
        }"#;
        handle_server_frame(frame, &ctx);

        match req_rx.recv().await.unwrap() {
            RoutedRequest::ProcessTts { text, language } => {
                assert_eq!(text, "welcome");
                assert_eq!(language.as_deref(), Some("en-US"));
            }
            other => panic!("expected tts request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_conversation_initialized_frame() {
        let (ctx, mut token_rx, _req_rx) = test_ctx();
        handle_server_frame(
            r#"{ "type": "conversation-initialized", "conversationId": "c-42" }"#,
            &ctx,
        );
        match token_rx.recv().await.unwrap() {
            TokenEvent::Action(InboundAction::ConversationInitialized(id)) => {
                assert_eq!(id, "c-42")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_make_action_requires_prepare() {
        let (token, _rx) = ActionToken::channel();
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let handler = ConversationSocketHandler::new(
            "ws://localhost/conversation".to_string(),
            Arc::new(crate::auth::NoopSigner),
            token,
            req_tx,
        );
        let err = handler
            .make_action(ActionRequest::Text("hi".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, SonaError::Action { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_bounded_attempts() {
        let (token, mut rx) = ActionToken::channel();
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let counter = attempts.clone();
        let outcome = retry_connect(&token, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err::<(), SonaError>(SonaError::connection(NAME, "refused"))
            }
        })
        .await;

        assert!(outcome.is_none());
        assert_eq!(
            attempts.load(std::sync::atomic::Ordering::SeqCst),
            MAX_RECONNECT_ATTEMPTS
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            TokenEvent::Connection(ConnectionEvent::Reconnecting)
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TokenEvent::Connection(ConnectionEvent::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers_before_the_budget_is_spent() {
        let (token, mut rx) = ActionToken::channel();

        let outcome = retry_connect(&token, |attempt| async move {
            if attempt < 2 {
                Err(SonaError::connection(NAME, "refused"))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(outcome, Some(2));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TokenEvent::Connection(ConnectionEvent::Reconnecting)
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TokenEvent::Connection(ConnectionEvent::Connected)
        ));
    }
}
