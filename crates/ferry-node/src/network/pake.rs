//! Password-Authenticated Key Exchange
//!
//! SPAKE2 in symmetric mode proves that both endpoints hold the same
//! passphrase before any file metadata crosses the wire. The exchange runs
//! over the swarm's request-response protocol in two rounds:
//!
//! 1. `Exchange` — the initiator sends its SPAKE2 message; the responder
//!    answers with its own message plus a key-confirmation tag.
//! 2. `Confirm` — the initiator returns its confirmation tag; the responder
//!    acks or denies.
//!
//! Session key and the two confirmation tags are independent HKDF-SHA256
//! expansions of the SPAKE2 shared secret, so a confirmed exchange also
//! yields the symmetric key the transfer layer encrypts with.

use std::collections::HashMap;

use async_trait::async_trait;
use hkdf::Hkdf;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use thiserror::Error;
use tracing::{debug, warn};

/// Key material handed to the transfer layer after authentication.
pub type SharedSecret = [u8; 32];

#[derive(Debug, Error)]
pub enum PakeError {
    /// The peer does not hold the same passphrase (or tampered with the
    /// exchange). Final for that peer.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The exchange never completed; transport-level failure.
    #[error("key exchange transport: {0}")]
    Transport(String),
}

/// The single fallible call the connection driver makes per candidate.
#[async_trait]
pub trait KeyExchange: Send + Sync + 'static {
    async fn start_key_exchange(&self, peer_id: PeerId) -> Result<SharedSecret, PakeError>;
}

/// Request half of the exchange protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PakeRequest {
    Exchange { msg: Vec<u8> },
    Confirm { tag: Vec<u8> },
}

/// Response half of the exchange protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PakeResponse {
    Exchange { msg: Vec<u8>, tag: Vec<u8> },
    Confirmed,
    Denied,
}

/// Carries a single request to a peer and returns its response. Implemented
/// by the swarm substrate.
#[async_trait]
pub trait PakeTransport: Send + Sync + 'static {
    async fn request(
        &self,
        peer_id: PeerId,
        request: PakeRequest,
    ) -> Result<PakeResponse, PakeError>;
}

/// Both endpoints bind the exchange to the session's channel number.
fn session_identity(channel: u32) -> Identity {
    let mut hasher = Sha256::default();
    hasher.update(b"ferry session");
    hasher.update(channel.to_be_bytes());
    Identity::new(&hasher.finalize())
}

pub(crate) struct DerivedKeys {
    pub session: SharedSecret,
    pub tag_initiator: [u8; 32],
    pub tag_responder: [u8; 32],
}

pub(crate) fn derive_keys(secret: &[u8]) -> DerivedKeys {
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut session = [0u8; 32];
    let mut tag_initiator = [0u8; 32];
    let mut tag_responder = [0u8; 32];
    hk.expand(b"ferry session key v1", &mut session)
        .expect("32 bytes is a valid HKDF output length");
    hk.expand(b"ferry confirm initiator v1", &mut tag_initiator)
        .expect("32 bytes is a valid HKDF output length");
    hk.expand(b"ferry confirm responder v1", &mut tag_responder)
        .expect("32 bytes is a valid HKDF output length");
    DerivedKeys {
        session,
        tag_initiator,
        tag_responder,
    }
}

/// Initiator side, used by the connection driver on the receiving role.
pub struct Spake2KeyExchange {
    transport: std::sync::Arc<dyn PakeTransport>,
    password: Vec<u8>,
    identity: Identity,
}

impl Spake2KeyExchange {
    pub fn new(
        transport: std::sync::Arc<dyn PakeTransport>,
        channel: u32,
        password: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            transport,
            password: password.as_ref().to_vec(),
            identity: session_identity(channel),
        }
    }
}

#[async_trait]
impl KeyExchange for Spake2KeyExchange {
    async fn start_key_exchange(&self, peer_id: PeerId) -> Result<SharedSecret, PakeError> {
        let (state, msg) = Spake2::<Ed25519Group>::start_symmetric(
            &Password::new(&self.password),
            &self.identity,
        );

        let response = self
            .transport
            .request(peer_id, PakeRequest::Exchange { msg })
            .await?;
        let (peer_msg, peer_tag) = match response {
            PakeResponse::Exchange { msg, tag } => (msg, tag),
            PakeResponse::Denied => {
                return Err(PakeError::Auth("peer denied the exchange".to_string()))
            }
            PakeResponse::Confirmed => {
                return Err(PakeError::Transport(
                    "unexpected response to exchange round".to_string(),
                ))
            }
        };

        let secret = state
            .finish(&peer_msg)
            .map_err(|e| PakeError::Auth(format!("spake2: {e:?}")))?;
        let keys = derive_keys(&secret);

        if peer_tag != keys.tag_responder {
            return Err(PakeError::Auth(
                "peer failed key confirmation".to_string(),
            ));
        }

        let response = self
            .transport
            .request(
                peer_id,
                PakeRequest::Confirm {
                    tag: keys.tag_initiator.to_vec(),
                },
            )
            .await?;
        match response {
            PakeResponse::Confirmed => {
                debug!(
                    peer_id_short = &peer_id.to_base58()[46..],
                    "Key exchange confirmed"
                );
                Ok(keys.session)
            }
            PakeResponse::Denied => Err(PakeError::Auth(
                "peer rejected our key confirmation".to_string(),
            )),
            PakeResponse::Exchange { .. } => Err(PakeError::Transport(
                "unexpected response to confirm round".to_string(),
            )),
        }
    }
}

/// What an inbound exchange produced, reported to the session supervisor.
#[derive(Debug, Clone)]
pub enum ResponderOutcome {
    Authenticated {
        peer_id: PeerId,
        shared_secret: SharedSecret,
    },
    Failed {
        peer_id: PeerId,
    },
}

/// Responder side, driven by the swarm event loop on the sending role.
pub struct PakeResponder {
    password: Vec<u8>,
    identity: Identity,
    /// Exchanges awaiting the confirm round, keyed by peer.
    pending: HashMap<PeerId, DerivedKeys>,
}

impl PakeResponder {
    pub fn new(channel: u32, password: impl AsRef<[u8]>) -> Self {
        Self {
            password: password.as_ref().to_vec(),
            identity: session_identity(channel),
            pending: HashMap::new(),
        }
    }

    /// Handles one inbound request. The response always goes back to the
    /// peer; an accompanying outcome is surfaced when the exchange reached a
    /// verdict.
    pub fn on_request(
        &mut self,
        peer_id: PeerId,
        request: PakeRequest,
    ) -> (PakeResponse, Option<ResponderOutcome>) {
        match request {
            PakeRequest::Exchange { msg } => {
                let (state, our_msg) = Spake2::<Ed25519Group>::start_symmetric(
                    &Password::new(&self.password),
                    &self.identity,
                );
                match state.finish(&msg) {
                    Ok(secret) => {
                        let keys = derive_keys(&secret);
                        let tag = keys.tag_responder.to_vec();
                        self.pending.insert(peer_id, keys);
                        (PakeResponse::Exchange { msg: our_msg, tag }, None)
                    }
                    Err(e) => {
                        warn!(
                            peer_id_short = &peer_id.to_base58()[46..],
                            error = ?e,
                            "Inbound key exchange failed"
                        );
                        (
                            PakeResponse::Denied,
                            Some(ResponderOutcome::Failed { peer_id }),
                        )
                    }
                }
            }
            PakeRequest::Confirm { tag } => match self.pending.remove(&peer_id) {
                Some(keys) if tag == keys.tag_initiator => {
                    debug!(
                        peer_id_short = &peer_id.to_base58()[46..],
                        "Peer passed authentication"
                    );
                    (
                        PakeResponse::Confirmed,
                        Some(ResponderOutcome::Authenticated {
                            peer_id,
                            shared_secret: keys.session,
                        }),
                    )
                }
                _ => {
                    warn!(
                        peer_id_short = &peer_id.to_base58()[46..],
                        "Peer failed key confirmation"
                    );
                    (
                        PakeResponse::Denied,
                        Some(ResponderOutcome::Failed { peer_id }),
                    )
                }
            },
        }
    }
}
