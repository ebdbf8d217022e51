//! The being facade: one object tying together config download, the
//! communication dispatcher, the behavioral state machine and session
//! persistence.
//!
//! Applications talk to a [`Being`] in terms of what happened in the world
//! (a user approached, started speaking, typed a line) and subscribe to
//! dispatcher events and state changes for everything flowing back.

pub mod state;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{HeaderSigner, ProfileSigner};
use crate::config::{BeingConfig, ConfigDownloader};
use crate::dispatcher::CommunicationDispatcher;
use crate::error::Result;
use crate::handler::{EngineOverrides, SpeechCue};
use crate::session::{SessionStore, StoredSession};
use crate::token::DispatcherEvents;

pub use state::{BeingBehaviour, BeingState, BeingStateMachine, StateTimeouts};

const SPEECH_CUE_CAPACITY: usize = 16;
const MUTE_STREAM_CAPACITY: usize = 8;

/// Everything needed to reach one being profile.
#[derive(Debug, Clone)]
pub struct BeingSettings {
    /// URL of the profile configuration document.
    pub config_url: String,
    pub app_identifier: String,
    pub profile_id: String,
    pub profile_secret: String,
    /// Emit the conversation-start signal once the server confirms the
    /// conversation.
    pub auto_start_conversation: bool,
    pub timeouts: StateTimeouts,
}

impl BeingSettings {
    fn signer(&self) -> Arc<dyn HeaderSigner> {
        Arc::new(ProfileSigner::new(
            self.app_identifier.clone(),
            self.profile_id.clone(),
            self.profile_secret.clone(),
        ))
    }
}

pub struct Being {
    config: BeingConfig,
    dispatcher: CommunicationDispatcher,
    machine: BeingStateMachine,
    store: Arc<dyn SessionStore>,
    overrides: Arc<EngineOverrides>,
    speech_cues: broadcast::Sender<SpeechCue>,
    mute_changes: broadcast::Sender<bool>,
    pump: JoinHandle<()>,
}

impl Being {
    /// Download the profile configuration and assemble the full stack.
    pub async fn connect(settings: &BeingSettings, store: Arc<dyn SessionStore>) -> Result<Self> {
        let downloader = ConfigDownloader::new(settings.config_url.clone(), settings.signer())?;
        let config = downloader.download().await?;
        Self::with_config(config, settings, store)
    }

    /// Assemble the stack from an already validated config.
    pub fn with_config(
        config: BeingConfig,
        settings: &BeingSettings,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let host = crate::util::origin(&settings.config_url)?;
        let overrides = Arc::new(EngineOverrides::default());
        let speech_cues = broadcast::channel(SPEECH_CUE_CAPACITY).0;
        let dispatcher = CommunicationDispatcher::new(
            &config,
            &host,
            settings.signer(),
            overrides.clone(),
            speech_cues.clone(),
        )?;
        let machine = BeingStateMachine::new(settings.timeouts);
        Ok(Self::assemble(
            config,
            dispatcher,
            machine,
            store,
            overrides,
            speech_cues,
            settings.auto_start_conversation,
        ))
    }

    fn assemble(
        config: BeingConfig,
        dispatcher: CommunicationDispatcher,
        machine: BeingStateMachine,
        store: Arc<dyn SessionStore>,
        overrides: Arc<EngineOverrides>,
        speech_cues: broadcast::Sender<SpeechCue>,
        auto_start: bool,
    ) -> Self {
        let pump = spawn_event_pump(
            dispatcher.clone(),
            machine.clone(),
            store.clone(),
            auto_start,
        );
        Self {
            config,
            dispatcher,
            machine,
            store,
            overrides,
            speech_cues,
            mute_changes: broadcast::channel(MUTE_STREAM_CAPACITY).0,
            pump,
        }
    }

    pub fn config(&self) -> &BeingConfig {
        &self.config
    }

    /// Dispatcher event streams (user/being actions, UI prompts, signals,
    /// connection changes, ...).
    pub fn events(&self) -> &DispatcherEvents {
        self.dispatcher.events()
    }

    /// Stream of accepted behavioral state changes.
    pub fn state_changes(&self) -> broadcast::Receiver<BeingBehaviour> {
        self.machine.subscribe()
    }

    pub fn mute_changes(&self) -> broadcast::Receiver<bool> {
        self.mute_changes.subscribe()
    }

    pub fn behaviour(&self) -> BeingBehaviour {
        self.machine.behaviour()
    }

    pub fn snapshot(&self) -> BeingState {
        self.machine.snapshot()
    }

    /// Start a brand-new conversation, discarding any stored identity.
    pub async fn start_conversation(&self) -> Result<()> {
        self.store.clear();
        let end_user_id = Uuid::new_v4();
        self.dispatcher.initialize_with(end_user_id, None).await?;
        self.store.save(&StoredSession {
            end_user_id,
            conversation_id: None,
        });
        Ok(())
    }

    /// Continue the conversation persisted in the store, or start fresh if
    /// nothing was stored.
    pub async fn restore_conversation(&self) -> Result<()> {
        let stored = self.store.load();
        let end_user_id = stored
            .as_ref()
            .map(|s| s.end_user_id)
            .unwrap_or_else(Uuid::new_v4);
        let conversation_id = stored.and_then(|s| s.conversation_id);
        self.dispatcher
            .initialize_with(end_user_id, conversation_id.clone())
            .await?;
        self.store.save(&StoredSession {
            end_user_id,
            conversation_id,
        });
        Ok(())
    }

    /// A user entered the being's attention zone. Establishes the session
    /// on first approach.
    pub async fn user_has_approached(&self, force_new_conversation: bool) -> Result<()> {
        if !self.dispatcher.is_initialized() {
            if force_new_conversation {
                self.start_conversation().await?;
            } else {
                self.restore_conversation().await?;
            }
        }
        self.machine.try_transition(BeingBehaviour::Focused);
        Ok(())
    }

    pub fn user_has_engaged(&self) {
        self.machine.try_transition(BeingBehaviour::InConversation);
    }

    pub fn user_started_speaking(&self) {
        if !self.machine.is_muted() {
            let _ = self.speech_cues.send(SpeechCue::Started);
        }
        self.machine.try_transition(BeingBehaviour::Listening);
    }

    pub fn user_stopped_speaking(&self) {
        let _ = self.speech_cues.send(SpeechCue::Stopped);
        self.machine.try_transition(BeingBehaviour::InConversation);
    }

    pub fn user_has_disengaged(&self) {
        self.machine.try_transition(BeingBehaviour::Focused);
    }

    pub fn user_has_left(&self) {
        self.machine.try_transition(BeingBehaviour::Focused);
        self.machine.try_transition(BeingBehaviour::Idle);
    }

    /// The application started playing a received being action.
    pub fn being_action_started(&self) {
        self.machine.try_transition(BeingBehaviour::PlayingBeingAction);
    }

    pub fn being_action_ended(&self) {
        self.machine.try_transition(BeingBehaviour::InConversation);
    }

    /// Send a text utterance on the user's behalf.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.machine
            .try_transition(BeingBehaviour::RequestProcessing);
        match self.dispatcher.send_text(text).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.machine.try_transition(BeingBehaviour::RequestError);
                Err(e)
            }
        }
    }

    /// Send pre-encoded speech audio; `streamed` marks a chunk of an open
    /// utterance rather than a complete one.
    pub async fn send_speech(&self, bytes: Vec<u8>, streamed: bool) -> Result<()> {
        if self.machine.is_muted() {
            return Ok(());
        }
        self.machine
            .try_transition(BeingBehaviour::RequestProcessing);
        match self.dispatcher.send_audio(bytes, streamed).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.machine.try_transition(BeingBehaviour::RequestError);
                Err(e)
            }
        }
    }

    pub async fn send_signal(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.dispatcher.send_signal(name, value).await
    }

    /// Drop everything queued but not yet on the wire.
    pub fn stop_current_and_scheduled_actions(&self) -> Result<()> {
        self.dispatcher.clear_processing_queue()
    }

    pub fn set_muted(&self, muted: bool) {
        if self.machine.set_muted(muted) {
            let _ = self.mute_changes.send(muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.machine.is_muted()
    }

    pub fn set_stt_language(&self, language: impl Into<String>) {
        *self.overrides.stt_language.write() = Some(language.into());
    }

    pub fn set_tts_language(&self, language: impl Into<String>) {
        *self.overrides.tts_language.write() = Some(language.into());
    }

    pub fn set_tts_voice(&self, voice: impl Into<String>) {
        *self.overrides.tts_voice.write() = Some(voice.into());
    }

    pub async fn dispose(&self) {
        self.dispatcher.dispose().await;
        self.pump.abort();
    }
}

impl Drop for Being {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Drives the state machine and the session store from dispatcher events.
fn spawn_event_pump(
    dispatcher: CommunicationDispatcher,
    machine: BeingStateMachine,
    store: Arc<dyn SessionStore>,
    auto_start: bool,
) -> JoinHandle<()> {
    let mut user_actions = dispatcher.events().user_actions();
    let mut being_actions = dispatcher.events().being_actions();
    let mut initialized = dispatcher.events().conversation_initialized();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                action = user_actions.recv() => match action {
                    Ok(action) => machine.record_user_action(action),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "user action stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                action = being_actions.recv() => match action {
                    Ok(action) => {
                        machine.try_transition(BeingBehaviour::RequestReceived);
                        machine.record_being_action(action);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "being action stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                id = initialized.recv() => match id {
                    Ok(id) => {
                        if let Some(session) = dispatcher.session() {
                            store.save(&StoredSession {
                                end_user_id: session.end_user_id,
                                conversation_id: Some(id),
                            });
                        }
                        if auto_start {
                            if let Err(e) = dispatcher.send_signal("conversation-start", "").await {
                                tracing::warn!("could not send conversation-start signal: {e}");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "conversation stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{BeingAction, InboundAction};
    use crate::session::MemorySessionStore;
    use crate::token::{ActionToken, TokenEvent};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn empty_config() -> BeingConfig {
        BeingConfig {
            location_id: None,
            profile_name: None,
            conversation: Vec::new(),
            fallback_stt: None,
            fallback_tts: None,
        }
    }

    /// A being whose dispatcher has no handlers: initialization always
    /// succeeds, every send fails with an action error.
    fn handlerless_being(store: Arc<dyn SessionStore>) -> Being {
        let (_token, token_rx) = ActionToken::channel();
        let (_req_tx, req_rx) = mpsc::unbounded_channel();
        let overrides = Arc::new(EngineOverrides::default());
        let dispatcher = CommunicationDispatcher::from_parts(
            Vec::new(),
            overrides.clone(),
            token_rx,
            req_rx,
        );
        Being::assemble(
            empty_config(),
            dispatcher,
            BeingStateMachine::default(),
            store,
            overrides,
            broadcast::channel(SPEECH_CUE_CAPACITY).0,
            false,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_flow_drives_the_state_machine() {
        let being = handlerless_being(Arc::new(MemorySessionStore::default()));

        being.user_has_approached(false).await.unwrap();
        assert_eq!(being.behaviour(), BeingBehaviour::Focused);

        being.user_has_engaged();
        assert_eq!(being.behaviour(), BeingBehaviour::InConversation);

        being.user_started_speaking();
        assert_eq!(being.behaviour(), BeingBehaviour::Listening);

        being.user_stopped_speaking();
        assert_eq!(being.behaviour(), BeingBehaviour::InConversation);

        being.user_has_disengaged();
        assert_eq!(being.behaviour(), BeingBehaviour::Focused);

        being.user_has_left();
        assert_eq!(being.behaviour(), BeingBehaviour::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_enters_request_error() {
        let being = handlerless_being(Arc::new(MemorySessionStore::default()));
        being.restore_conversation().await.unwrap();

        assert!(being.send_text("hello").await.is_err());
        assert_eq!(being.behaviour(), BeingBehaviour::RequestError);

        // Bounded error window, then the being is conversational again.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(being.behaviour(), BeingBehaviour::InConversation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_reuses_stored_identity() {
        let store = Arc::new(MemorySessionStore::default());
        let end_user_id = Uuid::new_v4();
        store.save(&StoredSession {
            end_user_id,
            conversation_id: Some("conv-7".to_string()),
        });

        let being = handlerless_being(store.clone());
        being.restore_conversation().await.unwrap();

        let stored = store.load().unwrap();
        assert_eq!(stored.end_user_id, end_user_id);
        assert_eq!(stored.conversation_id.as_deref(), Some("conv-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_conversation_discards_stored_identity() {
        let store = Arc::new(MemorySessionStore::default());
        let old_id = Uuid::new_v4();
        store.save(&StoredSession {
            end_user_id: old_id,
            conversation_id: Some("conv-old".to_string()),
        });

        let being = handlerless_being(store.clone());
        being.start_conversation().await.unwrap();

        let stored = store.load().unwrap();
        assert_ne!(stored.end_user_id, old_id);
        assert_eq!(stored.conversation_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_conversation_id_is_persisted() {
        let store = Arc::new(MemorySessionStore::default());
        let being = handlerless_being(store.clone());
        being.restore_conversation().await.unwrap();

        being.events().forward(TokenEvent::Action(
            InboundAction::ConversationInitialized("conv-9".to_string()),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            store.load().unwrap().conversation_id.as_deref(),
            Some("conv-9")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_being_action_updates_state_and_snapshot() {
        let being = handlerless_being(Arc::new(MemorySessionStore::default()));
        being.restore_conversation().await.unwrap();
        assert!(being.send_text("hi").await.is_err());
        // Force the machine back into a flow where a reply is plausible.
        being.machine.try_transition(BeingBehaviour::RequestProcessing);

        being.events().forward(TokenEvent::Action(InboundAction::BeingAction(
            BeingAction {
                text: Some("welcome".to_string()),
                ..Default::default()
            },
        )));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = being.snapshot();
        assert_eq!(snapshot.behaviour, BeingBehaviour::RequestReceived);
        assert_eq!(
            snapshot.last_being_action.unwrap().text.as_deref(),
            Some("welcome")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_changes_are_broadcast_once() {
        let being = handlerless_being(Arc::new(MemorySessionStore::default()));
        let mut changes = being.mute_changes();

        being.set_muted(true);
        being.set_muted(true);
        being.set_muted(false);

        assert!(changes.recv().await.unwrap());
        assert!(!changes.recv().await.unwrap());
        assert!(changes.try_recv().is_err());
    }
}
