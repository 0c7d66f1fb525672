//! Session negotiation: the agent announces its version and requested
//! client actions (session type, optional key exchange), the client
//! answers, and an encrypted random challenge proves both ends hold the
//! same data key before any payload is encrypted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use opsgate_common::helpers::serde_base64;
use opsgate_common::{opsgate_version, ClientVersion};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::*;

use crate::cancel::CancelState;
use crate::crypto::{BlockCipher, CryptoError};
use crate::stream::{DataStream, StreamError};
use crate::wire::PayloadType;

const ACTION_SESSION_TYPE: &str = "SessionType";
const ACTION_KMS_ENCRYPTION: &str = "KMSEncryption";

const ACTION_STATUS_SUCCESS: u32 = 1;

const CHALLENGE_LEN: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("client action failed: {0}")]
    ClientActionFailed(String),
    #[error("encryption challenge mismatch")]
    ChallengeMismatch,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("malformed handshake payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to send handshake frame: {0}")]
    Send(String),
    #[error("handshake signal dropped")]
    SignalLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Init,
    AwaitingResponse,
    ResponseReceived,
    AwaitingChallenge,
    Complete,
    Skipped,
    Failed,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RequestedClientAction {
    action_type: String,
    action_parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct HandshakeRequestPayload {
    agent_version: String,
    requested_client_actions: Vec<RequestedClientAction>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ProcessedClientAction {
    action_type: String,
    action_status: u32,
    #[serde(default)]
    action_result: serde_json::Value,
    #[serde(default)]
    error: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct HandshakeResponsePayload {
    client_version: String,
    processed_client_actions: Vec<ProcessedClientAction>,
}

#[derive(Serialize, Deserialize, Debug)]
struct SessionTypeRequest {
    #[serde(rename = "SessionType")]
    session_type: String,
    #[serde(rename = "Properties")]
    properties: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug)]
struct KmsEncryptionRequest {
    #[serde(rename = "KMSKeyId")]
    kms_key_id: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct KmsEncryptionResponse {
    #[serde(rename = "KMSCipherTextKey", with = "serde_base64")]
    kms_cipher_text_key: Bytes,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct EncryptionChallenge {
    #[serde(with = "serde_base64")]
    challenge: Bytes,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct HandshakeCompletePayload {
    handshake_time_to_complete: u64,
    customer_message: String,
}

struct HandshakeInner {
    phase: HandshakePhase,
    client_version_raw: Option<String>,
    client_version: Option<ClientVersion>,
    challenge: Option<Bytes>,
    response_tx: Option<oneshot::Sender<Result<(), HandshakeError>>>,
    challenge_tx: Option<oneshot::Sender<bool>>,
    error: Option<String>,
}

pub struct Handshake {
    timeout: Duration,
    complete: AtomicBool,
    skipped: AtomicBool,
    inner: Mutex<HandshakeInner>,
}

impl Handshake {
    pub fn new(timeout: Duration) -> Self {
        Handshake {
            timeout,
            complete: AtomicBool::new(false),
            skipped: AtomicBool::new(false),
            inner: Mutex::new(HandshakeInner {
                phase: HandshakePhase::Init,
                client_version_raw: None,
                client_version: None,
                challenge: None,
                response_tx: None,
                challenge_tx: None,
                error: None,
            }),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::SeqCst)
    }

    pub async fn phase(&self) -> HandshakePhase {
        if self.is_skipped() {
            return HandshakePhase::Skipped;
        }
        self.inner.lock().await.phase
    }

    /// The recorded failure reason, if the negotiation failed.
    pub async fn error(&self) -> Option<String> {
        self.inner.lock().await.error.clone()
    }

    pub async fn client_version(&self) -> Option<ClientVersion> {
        self.inner.lock().await.client_version
    }

    pub async fn client_version_raw(&self) -> Option<String> {
        self.inner.lock().await.client_version_raw.clone()
    }

    fn skip(&self) {
        self.skipped.store(true, Ordering::SeqCst);
    }

    async fn set_phase(&self, phase: HandshakePhase) {
        self.inner.lock().await.phase = phase;
    }

    pub(crate) async fn on_response(&self, stream: &DataStream, payload: &[u8]) {
        let parsed: HandshakeResponsePayload = match serde_json::from_slice(payload) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(%error, "Malformed handshake response");
                self.signal_response(Err(HandshakeError::Json(error))).await;
                return;
            }
        };

        let mut outcome = Ok(());
        for action in &parsed.processed_client_actions {
            if action.action_status != ACTION_STATUS_SUCCESS {
                warn!(
                    action = %action.action_type,
                    status = action.action_status,
                    error = %action.error,
                    "Client rejected a requested action"
                );
                outcome = Err(HandshakeError::ClientActionFailed(format!(
                    "{}: {}",
                    action.action_type, action.error
                )));
                continue;
            }
            match action.action_type.as_str() {
                ACTION_KMS_ENCRYPTION => {
                    match self.apply_kms_result(stream, &action.action_result).await {
                        Ok(()) => {
                            stream.encryption_enabled.store(true, Ordering::SeqCst);
                        }
                        Err(error) => {
                            error!(%error, "Failed to establish the session data key");
                            outcome = Err(error);
                        }
                    }
                }
                ACTION_SESSION_TYPE => (),
                other => debug!(action = %other, "Ignoring unknown processed action"),
            }
        }

        {
            let mut inner = self.inner.lock().await;
            inner.client_version = parsed.client_version.parse().ok();
            inner.client_version_raw = Some(parsed.client_version.clone());
            if outcome.is_ok() {
                inner.phase = HandshakePhase::ResponseReceived;
            }
        }
        self.signal_response(outcome).await;
    }

    async fn apply_kms_result(
        &self,
        stream: &DataStream,
        action_result: &serde_json::Value,
    ) -> Result<(), HandshakeError> {
        let response: KmsEncryptionResponse = serde_json::from_value(action_result.clone())?;
        let kms = stream
            .kms
            .clone()
            .ok_or_else(|| HandshakeError::ClientActionFailed("no KMS facade".to_owned()))?;
        let key = BlockCipher::unwrap_data_key(
            kms.as_ref(),
            &response.kms_cipher_text_key,
            stream.channel_id(),
            stream.instance_id(),
        )
        .await?;

        let mut guard = stream.cipher.write().await;
        guard
            .as_mut()
            .ok_or(CryptoError::KeyNotReady)?
            .set_key(&key)?;
        Ok(())
    }

    async fn signal_response(&self, outcome: Result<(), HandshakeError>) {
        let tx = self.inner.lock().await.response_tx.take();
        match tx {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!("Unsolicited handshake response"),
        }
    }

    pub(crate) async fn on_challenge_response(&self, stream: &DataStream, payload: &[u8]) {
        let matches = match self.verify_challenge(stream, payload).await {
            Ok(matches) => matches,
            Err(error) => {
                warn!(%error, "Failed to verify the encryption challenge");
                false
            }
        };

        let tx = {
            let mut inner = self.inner.lock().await;
            if !matches {
                inner.error = Some("encryption challenge mismatch".to_owned());
            }
            inner.challenge_tx.take()
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(matches);
            }
            None => debug!("Unsolicited challenge response"),
        }
    }

    async fn verify_challenge(
        &self,
        stream: &DataStream,
        payload: &[u8],
    ) -> Result<bool, HandshakeError> {
        let response: EncryptionChallenge = serde_json::from_slice(payload)?;
        let decrypted = {
            let guard = stream.cipher.read().await;
            guard
                .as_ref()
                .ok_or(CryptoError::KeyNotReady)?
                .decrypt(&response.challenge)?
        };
        let inner = self.inner.lock().await;
        Ok(inner
            .challenge
            .as_ref()
            .map(|sent| sent.as_ref() == decrypted.as_slice())
            .unwrap_or(false))
    }
}

impl DataStream {
    /// Runs the negotiation exchange. Returns once the client confirmed
    /// the session type (and, when requested, proved possession of the
    /// unwrapped data key).
    pub async fn perform_handshake(
        self: &Arc<Self>,
        session_type: &str,
        session_properties: serde_json::Value,
        kms_key_id: Option<String>,
    ) -> Result<Duration, HandshakeError> {
        let started = Instant::now();
        match self
            .try_perform_handshake(session_type, session_properties, kms_key_id, started)
            .await
        {
            Ok(()) => {
                let elapsed = started.elapsed();
                info!(?elapsed, "Handshake complete");
                Ok(elapsed)
            }
            Err(error) => {
                error!(%error, "Handshake failed");
                self.handshake.set_phase(HandshakePhase::Failed).await;
                self.handshake.inner.lock().await.error = Some(error.to_string());
                self.cancel_flag().set(CancelState::Cancelled);
                Err(error)
            }
        }
    }

    async fn try_perform_handshake(
        self: &Arc<Self>,
        session_type: &str,
        session_properties: serde_json::Value,
        kms_key_id: Option<String>,
        started: Instant,
    ) -> Result<(), HandshakeError> {
        let encryption_requested = kms_key_id.is_some();
        if let Some(key_id) = &kms_key_id {
            *self.cipher.write().await = Some(BlockCipher::new(key_id.clone()));
        }

        let mut actions = vec![RequestedClientAction {
            action_type: ACTION_SESSION_TYPE.to_owned(),
            action_parameters: serde_json::to_value(SessionTypeRequest {
                session_type: session_type.to_owned(),
                properties: session_properties,
            })?,
        }];
        if let Some(key_id) = kms_key_id {
            actions.push(RequestedClientAction {
                action_type: ACTION_KMS_ENCRYPTION.to_owned(),
                action_parameters: serde_json::to_value(KmsEncryptionRequest {
                    kms_key_id: key_id,
                })?,
            });
        }

        let request = HandshakeRequestPayload {
            agent_version: opsgate_version().to_owned(),
            requested_client_actions: actions,
        };

        let response_rx = {
            let mut inner = self.handshake.inner.lock().await;
            let (tx, rx) = oneshot::channel();
            inner.response_tx = Some(tx);
            inner.phase = HandshakePhase::AwaitingResponse;
            rx
        };

        self.send_handshake_frame(PayloadType::HandshakeRequest, &request)
            .await?;

        match tokio::time::timeout(self.handshake.timeout, response_rx).await {
            Err(_) => return Err(HandshakeError::Timeout),
            Ok(Err(_)) => return Err(HandshakeError::SignalLost),
            Ok(Ok(outcome)) => outcome?,
        }

        if encryption_requested {
            self.run_encryption_challenge().await?;
        }

        let complete = HandshakeCompletePayload {
            handshake_time_to_complete: started.elapsed().as_millis() as u64,
            customer_message: String::new(),
        };
        self.send_handshake_frame(PayloadType::HandshakeComplete, &complete)
            .await?;

        self.handshake.complete.store(true, Ordering::SeqCst);
        self.handshake.set_phase(HandshakePhase::Complete).await;
        Ok(())
    }

    async fn run_encryption_challenge(self: &Arc<Self>) -> Result<(), HandshakeError> {
        let mut challenge = vec![0u8; CHALLENGE_LEN];
        opsgate_common::helpers::rng::get_crypto_rng().fill_bytes(&mut challenge);
        let challenge = Bytes::from(challenge);

        let encrypted = {
            let guard = self.cipher.read().await;
            guard
                .as_ref()
                .ok_or(CryptoError::KeyNotReady)?
                .encrypt(&challenge)?
        };

        let challenge_rx = {
            let mut inner = self.handshake.inner.lock().await;
            inner.challenge = Some(challenge);
            let (tx, rx) = oneshot::channel();
            inner.challenge_tx = Some(tx);
            inner.phase = HandshakePhase::AwaitingChallenge;
            rx
        };

        self.send_handshake_frame(
            PayloadType::EncChallengeRequest,
            &EncryptionChallenge {
                challenge: encrypted.into(),
            },
        )
        .await?;

        match tokio::time::timeout(self.handshake.timeout, challenge_rx).await {
            Err(_) => Err(HandshakeError::Timeout),
            Ok(Err(_)) => Err(HandshakeError::SignalLost),
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(HandshakeError::ChallengeMismatch),
        }
    }

    async fn send_handshake_frame<T: Serialize>(
        &self,
        payload_type: PayloadType,
        body: &T,
    ) -> Result<(), HandshakeError> {
        let payload = serde_json::to_vec(body)?;
        self.send_stream_data(payload_type, &payload)
            .await
            .map_err(|error: StreamError| HandshakeError::Send(error.to_string()))
    }

    /// The plugin declined negotiation; plugin data flows immediately.
    pub fn skip_handshake(&self) {
        debug!("Handshake skipped");
        self.handshake.skip();
    }
}
