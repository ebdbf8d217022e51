//! Capability-routing communication dispatcher.
//!
//! The dispatcher owns the handler set assembled from a validated config and
//! routes every outgoing request by capability: send-style requests are
//! broadcast to every prepared handler that declared the capability,
//! synthesis goes to the first capable handler only. Inbound events arrive
//! on the shared action token queue and are re-emitted unchanged onto the
//! per-variant broadcast streams of [`DispatcherEvents`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::action::{BeingAction, InboundAction, VoiceData};
use crate::auth::HeaderSigner;
use crate::config::BeingConfig;
use crate::error::{Result, SonaError};
use crate::handler::{
    ActionRequest, Capability, CommunicationHandler, EngineOverrides, RoutedRequest, SpeechCue,
    TtsRequest,
};
use crate::handlers::{assemble_handlers, HandlerContext};
use crate::session::Session;
use crate::token::{ActionToken, DispatcherEvents, TokenEvent};

const EVENT_STREAM_CAPACITY: usize = 64;

struct DispatcherInner {
    handlers: Vec<Arc<dyn CommunicationHandler>>,
    events: DispatcherEvents,
    overrides: Arc<EngineOverrides>,
    session: parking_lot::RwLock<Option<Arc<Session>>>,
    initialized: AtomicBool,
    disposed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl DispatcherInner {
    fn ensure_ready(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SonaError::Disposed);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(SonaError::NotInitialized);
        }
        Ok(())
    }

    /// Deliver one request to every prepared handler declaring the
    /// capability, in registration order. The first failure is reported
    /// after all handlers were attempted.
    async fn broadcast_action(
        &self,
        capability: Capability,
        make: impl Fn() -> ActionRequest,
    ) -> Result<()> {
        self.ensure_ready()?;
        let mut first_err = None;
        let mut served = false;
        for handler in &self.handlers {
            if !handler.has_capability(capability) || !handler.is_prepared() {
                continue;
            }
            served = true;
            if let Err(e) = handler.make_action(make()).await {
                tracing::warn!(handler = handler.name(), %capability, "request failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None if !served => Err(SonaError::action(capability, "no prepared handler")),
            None => Ok(()),
        }
    }

    /// Synthesis is exclusive: exactly one handler serves it, the first
    /// prepared one in registration order. `Ok(None)` means no handler can
    /// synthesize at all, which is a valid text-only deployment.
    async fn process_tts(
        &self,
        text: String,
        language: Option<String>,
        voice: Option<String>,
    ) -> Result<Option<VoiceData>> {
        self.ensure_ready()?;
        let language = language.or_else(|| self.overrides.tts_language.read().clone());
        let voice = voice.or_else(|| self.overrides.tts_voice.read().clone());

        let Some(handler) = self
            .handlers
            .iter()
            .find(|h| h.has_capability(Capability::ProcessTts) && h.is_prepared())
        else {
            return Ok(None);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        handler
            .make_action(ActionRequest::Tts(TtsRequest {
                text,
                language,
                voice,
                reply: Some(reply_tx),
            }))
            .await?;
        match reply_rx.await {
            Ok(voice) => Ok(Some(voice)),
            Err(_) => Err(SonaError::action(
                Capability::ProcessTts,
                "synthesis produced no voice",
            )),
        }
    }

    /// Handlers hand some work back to be routed like any external request:
    /// being text needs synthesis, final transcripts become outgoing text.
    async fn service(&self, request: RoutedRequest) {
        match request {
            RoutedRequest::ProcessTts { text, language } => {
                let voice = match self.process_tts(text.clone(), language.clone(), None).await {
                    Ok(voice) => voice,
                    Err(e) => {
                        tracing::warn!("synthesis failed, emitting text-only action: {e}");
                        None
                    }
                };
                self.events
                    .forward(TokenEvent::Action(InboundAction::BeingAction(BeingAction {
                        text: Some(text),
                        language,
                        voice,
                        behavior: None,
                    })));
            }
            RoutedRequest::SendText(text) => {
                let result = self
                    .broadcast_action(Capability::SendText, || ActionRequest::Text(text.clone()))
                    .await;
                if let Err(e) = result {
                    tracing::warn!("could not forward transcript as text: {e}");
                }
            }
        }
    }
}

/// Routes outgoing requests to transport handlers and fans inbound events
/// out to subscribers. Cheap to clone; all clones share one handler set.
#[derive(Clone)]
pub struct CommunicationDispatcher {
    inner: Arc<DispatcherInner>,
}

impl CommunicationDispatcher {
    /// Assemble handlers for the config and start the event pumps. No
    /// connection is attempted until [`initialize_with`].
    ///
    /// [`initialize_with`]: Self::initialize_with
    pub fn new(
        config: &BeingConfig,
        host: &str,
        signer: Arc<dyn HeaderSigner>,
        overrides: Arc<EngineOverrides>,
        speech_cues: broadcast::Sender<SpeechCue>,
    ) -> Result<Self> {
        let (token, token_rx) = ActionToken::channel();
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let ctx = HandlerContext {
            host: host.to_string(),
            signer,
            token,
            requests,
            overrides: overrides.clone(),
            speech_cues,
        };
        let handlers = assemble_handlers(config, &ctx)?;
        Ok(Self::from_parts(handlers, overrides, token_rx, requests_rx))
    }

    pub(crate) fn from_parts(
        handlers: Vec<Arc<dyn CommunicationHandler>>,
        overrides: Arc<EngineOverrides>,
        mut token_rx: mpsc::UnboundedReceiver<TokenEvent>,
        mut requests_rx: mpsc::UnboundedReceiver<RoutedRequest>,
    ) -> Self {
        let inner = Arc::new(DispatcherInner {
            handlers,
            events: DispatcherEvents::new(EVENT_STREAM_CAPACITY),
            overrides,
            session: parking_lot::RwLock::new(None),
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        // Both pumps hold the inner weakly so a dropped dispatcher can shut
        // down even with channel senders still alive inside the handlers.
        let forward = {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                while let Some(event) = token_rx.recv().await {
                    let Some(inner) = weak.upgrade() else { return };
                    inner.events.forward(event);
                }
            })
        };
        let requests = {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                while let Some(request) = requests_rx.recv().await {
                    let Some(inner) = weak.upgrade() else { return };
                    inner.service(request).await;
                }
            })
        };
        inner.tasks.lock().extend([forward, requests]);

        Self { inner }
    }

    /// Event streams for subscribers. Each call to a stream accessor yields
    /// an independent receiver.
    pub fn events(&self) -> &DispatcherEvents {
        &self.inner.events
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.session.read().clone()
    }

    /// Prepare every handler for a session, in registration order, stopping
    /// at the first failure. On failure the dispatcher stays uninitialized;
    /// a later retry prepares all handlers again.
    pub async fn initialize_with(
        &self,
        end_user_id: Uuid,
        conversation_id: Option<String>,
    ) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(SonaError::Disposed);
        }
        // The session stays local until every handler accepted it, so a
        // failed attempt never exposes a half-prepared session.
        let session = Arc::new(Session::new(end_user_id, conversation_id));

        for handler in &self.inner.handlers {
            handler.prepare(session.clone()).await.map_err(|e| {
                tracing::error!(handler = handler.name(), "session setup failed: {e}");
                e
            })?;
        }

        *self.inner.session.write() = Some(session.clone());
        self.inner.initialized.store(true, Ordering::SeqCst);
        tracing::info!(end_user_id = %session.end_user_id, "dispatcher initialized");
        Ok(())
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.inner
            .broadcast_action(Capability::SendText, || ActionRequest::Text(text.clone()))
            .await
    }

    pub async fn send_signal(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();
        let value = value.into();
        self.inner
            .broadcast_action(Capability::SendSignal, || ActionRequest::Signal {
                name: name.clone(),
                value: value.clone(),
            })
            .await
    }

    pub async fn send_audio(&self, bytes: Vec<u8>, streamed: bool) -> Result<()> {
        if streamed {
            self.inner
                .broadcast_action(Capability::SendAudioStream, || {
                    ActionRequest::AudioStream(bytes.clone())
                })
                .await
        } else {
            self.inner
                .broadcast_action(Capability::SendAudio, || ActionRequest::Audio(bytes.clone()))
                .await
        }
    }

    pub async fn process_tts(
        &self,
        text: impl Into<String>,
        language: Option<String>,
        voice: Option<String>,
    ) -> Result<Option<VoiceData>> {
        self.inner.process_tts(text.into(), language, voice).await
    }

    /// Drop queued outbound work on every handler, prepared or not. Only a
    /// disposed dispatcher refuses.
    pub fn clear_processing_queue(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(SonaError::Disposed);
        }
        for handler in &self.inner.handlers {
            handler.clear_processing_queue();
        }
        Ok(())
    }

    /// Tear down every handler and stop the event pumps. Safe to call more
    /// than once; only the first call does work.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
        for handler in &self.inner.handlers {
            handler.dispose().await;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("dispatcher disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::AudioParameters;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct StubHandler {
        name: &'static str,
        capabilities: Vec<Capability>,
        fail_prepare: bool,
        prepared: AtomicBool,
        prepare_calls: AtomicUsize,
        dispose_calls: AtomicUsize,
        clear_calls: AtomicUsize,
        actions: parking_lot::Mutex<Vec<Capability>>,
    }

    impl StubHandler {
        fn new(name: &'static str, capabilities: Vec<Capability>) -> Arc<Self> {
            Arc::new(Self {
                name,
                capabilities,
                fail_prepare: false,
                prepared: AtomicBool::new(false),
                prepare_calls: AtomicUsize::new(0),
                dispose_calls: AtomicUsize::new(0),
                clear_calls: AtomicUsize::new(0),
                actions: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                capabilities: vec![Capability::SendText],
                fail_prepare: true,
                prepared: AtomicBool::new(false),
                prepare_calls: AtomicUsize::new(0),
                dispose_calls: AtomicUsize::new(0),
                clear_calls: AtomicUsize::new(0),
                actions: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommunicationHandler for StubHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn has_capability(&self, capability: Capability) -> bool {
            self.capabilities.contains(&capability)
        }

        fn is_prepared(&self) -> bool {
            self.prepared.load(Ordering::SeqCst)
        }

        async fn prepare(&self, _session: Arc<Session>) -> Result<()> {
            self.prepare_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_prepare {
                return Err(SonaError::connection(self.name, "refused"));
            }
            self.prepared.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn make_action(&self, request: ActionRequest) -> Result<()> {
            self.actions.lock().push(request.capability());
            if let ActionRequest::Tts(mut job) = request {
                if let Some(reply) = job.reply.take() {
                    let _ = reply.send(VoiceData {
                        data: vec![1, 2, 3],
                        marks: Vec::new(),
                        audio: AudioParameters::default(),
                    });
                }
            }
            Ok(())
        }

        fn clear_processing_queue(&self) {
            self.clear_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn dispose(&self) {
            self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dispatcher_with(
        handlers: Vec<Arc<StubHandler>>,
    ) -> (
        CommunicationDispatcher,
        mpsc::UnboundedSender<RoutedRequest>,
    ) {
        let (_token, token_rx) = ActionToken::channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let dyn_handlers = handlers
            .into_iter()
            .map(|h| h as Arc<dyn CommunicationHandler>)
            .collect();
        let dispatcher = CommunicationDispatcher::from_parts(
            dyn_handlers,
            Arc::new(EngineOverrides::default()),
            token_rx,
            req_rx,
        );
        (dispatcher, req_tx)
    }

    #[tokio::test]
    async fn test_send_text_broadcasts_to_all_capable_handlers() {
        let a = StubHandler::new("a", vec![Capability::SendText]);
        let b = StubHandler::new("b", vec![Capability::SendText, Capability::SendSignal]);
        let (dispatcher, _req) = dispatcher_with(vec![a.clone(), b.clone()]);

        dispatcher
            .initialize_with(Uuid::new_v4(), None)
            .await
            .unwrap();
        dispatcher.send_text("hello").await.unwrap();

        assert_eq!(a.actions.lock().as_slice(), &[Capability::SendText]);
        assert_eq!(b.actions.lock().as_slice(), &[Capability::SendText]);
    }

    #[tokio::test]
    async fn test_process_tts_uses_first_capable_handler_only() {
        let first = StubHandler::new("first", vec![Capability::ProcessTts]);
        let second = StubHandler::new("second", vec![Capability::ProcessTts]);
        let (dispatcher, _req) = dispatcher_with(vec![first.clone(), second.clone()]);

        dispatcher
            .initialize_with(Uuid::new_v4(), None)
            .await
            .unwrap();
        let voice = dispatcher
            .process_tts("hello", None, None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(voice.data, vec![1, 2, 3]);
        assert_eq!(first.actions.lock().len(), 1);
        assert!(second.actions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_process_tts_without_capable_handler_is_none() {
        let a = StubHandler::new("a", vec![Capability::SendText]);
        let (dispatcher, _req) = dispatcher_with(vec![a]);
        dispatcher
            .initialize_with(Uuid::new_v4(), None)
            .await
            .unwrap();
        assert!(dispatcher
            .process_tts("hello", None, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_requests_fail_before_initialization() {
        let a = StubHandler::new("a", vec![Capability::SendText]);
        let (dispatcher, _req) = dispatcher_with(vec![a.clone()]);

        let err = dispatcher.send_text("hello").await.unwrap_err();
        assert!(matches!(err, SonaError::NotInitialized));
        assert!(a.actions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_is_fail_fast() {
        let first = StubHandler::new("first", vec![Capability::SendText]);
        let failing = StubHandler::failing("failing");
        let third = StubHandler::new("third", vec![Capability::SendText]);
        let (dispatcher, _req) =
            dispatcher_with(vec![first.clone(), failing.clone(), third.clone()]);

        let err = dispatcher
            .initialize_with(Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SonaError::Connection { .. }));
        assert!(!dispatcher.is_initialized());
        // The half-prepared session never becomes visible.
        assert!(dispatcher.session().is_none());
        assert_eq!(first.prepare_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.prepare_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clear_processing_queue_reaches_every_handler() {
        let text = StubHandler::new("text", vec![Capability::SendText]);
        let tts_only = StubHandler::new("tts-only", vec![Capability::ProcessTts]);
        let (dispatcher, _req) = dispatcher_with(vec![text.clone(), tts_only.clone()]);

        // Deliberately not initialized: clearing is unconditional and must
        // reach unprepared handlers and handlers with no send capability.
        dispatcher.clear_processing_queue().unwrap();

        assert_eq!(text.clear_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tts_only.clear_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let a = StubHandler::new("a", vec![Capability::SendText]);
        let (dispatcher, _req) = dispatcher_with(vec![a.clone()]);

        dispatcher.dispose().await;
        dispatcher.dispose().await;

        assert_eq!(a.dispose_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            dispatcher.send_text("hi").await.unwrap_err(),
            SonaError::Disposed
        ));
        assert!(matches!(
            dispatcher.clear_processing_queue().unwrap_err(),
            SonaError::Disposed
        ));
    }

    #[tokio::test]
    async fn test_routed_tts_request_publishes_being_action() {
        let tts = StubHandler::new("tts", vec![Capability::ProcessTts]);
        let (dispatcher, req_tx) = dispatcher_with(vec![tts]);
        dispatcher
            .initialize_with(Uuid::new_v4(), None)
            .await
            .unwrap();

        let mut being_actions = dispatcher.events().being_actions();
        req_tx
            .send(RoutedRequest::ProcessTts {
                text: "welcome".to_string(),
                language: Some("en-US".to_string()),
            })
            .unwrap();

        let action = being_actions.recv().await.unwrap();
        assert_eq!(action.text.as_deref(), Some("welcome"));
        assert_eq!(action.voice.unwrap().data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unserved_capability_is_an_action_error() {
        let a = StubHandler::new("a", vec![Capability::SendText]);
        let (dispatcher, _req) = dispatcher_with(vec![a]);
        dispatcher
            .initialize_with(Uuid::new_v4(), None)
            .await
            .unwrap();

        let err = dispatcher.send_signal("wave", "").await.unwrap_err();
        assert!(matches!(err, SonaError::Action { .. }));
    }
}
