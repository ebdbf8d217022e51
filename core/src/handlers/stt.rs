//! Fallback speech-to-text handler over an on-demand socket.
//!
//! Unlike the conversation socket, this transport only lives while the user
//! is speaking: a speech-start cue opens the socket, audio chunks are
//! streamed as binary frames, and a speech-stop cue closes it. Recognized
//! transcripts are published as inbound actions and, once final, forwarded
//! to the dispatcher as an outgoing text request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use crate::action::{AudioParameters, InboundAction};
use crate::auth::HeaderSigner;
use crate::error::{Result, SonaError};
use crate::handler::{
    ActionRequest, Capability, CommunicationHandler, DisposeHook, EngineOverrides, RoutedRequest,
    SpeechCue,
};
use crate::session::Session;
use crate::token::ActionToken;

use async_trait::async_trait;

const NAME: &str = "stt-socket";
const CAPABILITIES: &[Capability] = &[Capability::SendAudio, Capability::SendAudioStream];

/// Transcript frames the STT service sends back.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
enum SttServerEnvelope {
    SpeechRecognized {
        text: String,
        #[serde(default)]
        is_final: bool,
    },
}

struct SttStream {
    chunks: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

/// Stream slot. `Opening` claims the slot before the handshake awaits, so
/// a racing cue and `make_action` cannot each open a socket; whoever holds
/// the claim installs the stream only if nothing closed the slot meanwhile.
enum SttSlot {
    Idle,
    Opening,
    Open(SttStream),
}

pub struct SttSocketHandler {
    url: String,
    signer: Arc<dyn HeaderSigner>,
    token: ActionToken,
    requests: mpsc::UnboundedSender<RoutedRequest>,
    overrides: Arc<EngineOverrides>,
    audio: AudioParameters,
    stream: parking_lot::Mutex<SttSlot>,
    session: parking_lot::Mutex<Option<Arc<Session>>>,
    prepared: AtomicBool,
    disposed: AtomicBool,
    dispose_hook: DisposeHook,
}

impl SttSocketHandler {
    pub fn new(
        url: String,
        signer: Arc<dyn HeaderSigner>,
        token: ActionToken,
        requests: mpsc::UnboundedSender<RoutedRequest>,
        overrides: Arc<EngineOverrides>,
        audio: AudioParameters,
    ) -> Self {
        Self {
            url,
            signer,
            token,
            requests,
            overrides,
            audio,
            stream: parking_lot::Mutex::new(SttSlot::Idle),
            session: parking_lot::Mutex::new(None),
            prepared: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            dispose_hook: DisposeHook::new(),
        }
    }

    /// Follow the user's speech boundaries: open the socket on a start cue,
    /// close it on a stop cue. The watcher is torn down exactly once when
    /// the handler is disposed.
    pub fn attach_speech_cues(self: &Arc<Self>, mut cues: broadcast::Receiver<SpeechCue>) {
        let weak = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            loop {
                match cues.recv().await {
                    Ok(cue) => {
                        let Some(handler) = weak.upgrade() else { return };
                        match cue {
                            SpeechCue::Started => {
                                if let Err(e) = handler.open_stream().await {
                                    tracing::warn!("could not open stt stream: {e}");
                                }
                            }
                            SpeechCue::Stopped => handler.close_stream(),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "stt cue watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        self.dispose_hook.set(move || watcher.abort());
    }

    /// Effective socket URL for one utterance, with framing and language
    /// negotiated via the query string.
    fn stream_url(&self) -> String {
        let mut url = format!(
            "{}?channels={}&frequency={}&sampleBits={}",
            self.url, self.audio.channels, self.audio.frequency, self.audio.sample_bits
        );
        if let Some(language) = self.overrides.stt_language.read().clone() {
            url.push_str("&lang=");
            url.push_str(&language);
        }
        url
    }

    async fn open_stream(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SonaError::connection(NAME, "handler disposed"));
        }
        // Claim the slot before the handshake suspends.
        {
            let mut slot = self.stream.lock();
            if !matches!(&*slot, SttSlot::Idle) {
                return Ok(());
            }
            *slot = SttSlot::Opening;
        }

        let (chunk_tx, task) = match self.connect_stream().await {
            Ok(parts) => parts,
            Err(e) => {
                self.abandon_opening();
                return Err(e);
            }
        };

        let mut slot = self.stream.lock();
        if matches!(&*slot, SttSlot::Opening) {
            *slot = SttSlot::Open(SttStream {
                chunks: chunk_tx,
                task,
            });
            tracing::debug!(url = %self.url, "stt stream opened");
        } else {
            // Closed or disposed while the handshake was in flight.
            drop(chunk_tx);
            task.abort();
        }
        Ok(())
    }

    async fn connect_stream(&self) -> Result<(mpsc::UnboundedSender<Vec<u8>>, JoinHandle<()>)> {
        let mut request = self
            .stream_url()
            .into_client_request()
            .map_err(|e| SonaError::connection(NAME, e))?;
        self.signer.sign(request.headers_mut());
        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| SonaError::connection(NAME, e))?;

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let token = self.token.clone();
        let requests = self.requests.clone();
        let task = tokio::spawn(async move {
            let (mut sink, mut stream) = ws.split();
            loop {
                tokio::select! {
                    chunk = chunk_rx.recv() => match chunk {
                        Some(bytes) => {
                            if sink.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        // Stream handle dropped: flush is done, say goodbye.
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    inbound = stream.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            handle_transcript(&text, &token, &requests);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    },
                }
            }
        });

        Ok((chunk_tx, task))
    }

    fn abandon_opening(&self) {
        let mut slot = self.stream.lock();
        if matches!(&*slot, SttSlot::Opening) {
            *slot = SttSlot::Idle;
        }
    }

    fn close_stream(&self) {
        // Dropping the chunk sender lets the task close the socket cleanly.
        // An in-flight handshake sees its claim gone and discards the socket.
        match std::mem::replace(&mut *self.stream.lock(), SttSlot::Idle) {
            SttSlot::Open(stream) => {
                drop(stream.chunks);
                drop(stream.task);
                tracing::debug!("stt stream closed");
            }
            SttSlot::Opening | SttSlot::Idle => {}
        }
    }

    fn send_chunk(&self, bytes: Vec<u8>) -> Result<()> {
        let guard = self.stream.lock();
        let SttSlot::Open(stream) = &*guard else {
            return Err(SonaError::action(
                Capability::SendAudioStream,
                "no open stt stream",
            ));
        };
        stream
            .chunks
            .send(bytes)
            .map_err(|_| SonaError::action(Capability::SendAudioStream, "stt stream ended"))
    }
}

#[async_trait]
impl CommunicationHandler for SttSocketHandler {
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
        // The socket itself is opened per utterance; preparation only pins
        // the session this handler transcribes for. A session change drops
        // any stream still open for the previous one.
        let same_session = self.session.lock().as_deref() == Some(&*session);
        if !same_session {
            self.close_stream();
        }
        *self.session.lock() = Some(session);
        self.prepared.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn make_action(&self, request: ActionRequest) -> Result<()> {
        if !self.prepared.load(Ordering::SeqCst) {
            return Err(SonaError::action(NAME, "handler is not prepared"));
        }
        match request {
            // Single shot: one utterance per call.
            ActionRequest::Audio(bytes) => {
                self.open_stream().await?;
                self.send_chunk(bytes)?;
                self.close_stream();
                Ok(())
            }
            ActionRequest::AudioStream(bytes) => {
                self.open_stream().await?;
                self.send_chunk(bytes)
            }
            other => Err(SonaError::action(
                other.capability(),
                "not served by the stt socket",
            )),
        }
    }

    fn clear_processing_queue(&self) {
        self.close_stream();
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.prepared.store(false, Ordering::SeqCst);
        self.close_stream();
        self.dispose_hook.run();
        tracing::debug!("stt socket disposed");
    }
}

fn handle_transcript(
    frame: &str,
    token: &ActionToken,
    requests: &mpsc::UnboundedSender<RoutedRequest>,
) {
    match serde_json::from_str(frame) {
        Ok(SttServerEnvelope::SpeechRecognized { text, is_final }) => {
            token.publish(InboundAction::SpeechRecognized(text.clone()));
            if is_final {
                let _ = requests.send(RoutedRequest::SendText(text));
            }
        }
        Err(e) => tracing::warn!("ignoring unparseable stt frame: {e}"),
    }
}
