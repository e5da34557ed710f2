//! SCRAM-SHA-256 authentication.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) without channel
//! binding, which is what PostgreSQL offers over plain TCP.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header for "no channel binding, no authzid".
const GS2_HEADER: &str = "n,,";

/// base64("n,,"), the channel-binding attribute of the final message.
const CHANNEL_BINDING: &str = "biws";

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Missing {0} in server message")]
    Missing(&'static str),
    #[error("Server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("Server signature verification failed")]
    BadServerSignature,
    #[error("Server rejected authentication: {0}")]
    ServerError(String),
    #[error("SCRAM exchange out of order")]
    OutOfOrder,
}

/// Values derived from the server-first message, kept for the final check.
struct Exchange {
    salted_password: [u8; 32],
    auth_message: String,
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    client_first_bare: String,
    client_nonce: String,
    password: String,
    exchange: Option<Exchange>,
}

impl ScramClient {
    /// Create a new SCRAM client with a random 18-byte nonce.
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        // PostgreSQL ignores the SCRAM username in favour of the startup
        // user; escape the two reserved characters anyway.
        let user = username.replace('=', "=3D").replace(',', "=2C");
        Self {
            client_first_bare: format!("n={},r={}", user, nonce),
            client_nonce: nonce.to_string(),
            password: password.to_string(),
            exchange: None,
        }
    }

    /// The client-first-message: `n,,n=<user>,r=<nonce>`.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("{}{}", GS2_HEADER, self.client_first_bare).into_bytes()
    }

    /// Process the server-first-message (`r=<nonce>,s=<salt>,i=<iterations>`)
    /// and return the client-final-message.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                let n = value
                    .parse::<u32>()
                    .map_err(|_| ScramError::InvalidIterations)?;
                if n == 0 {
                    return Err(ScramError::InvalidIterations);
                }
                iterations = Some(n);
            }
        }

        let nonce = nonce.ok_or(ScramError::Missing("nonce"))?;
        let salt = salt.ok_or(ScramError::Missing("salt"))?;
        let iterations = iterations.ok_or(ScramError::Missing("iterations"))?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let final_without_proof = format!("c={},r={}", CHANNEL_BINDING, nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        self.exchange = Some(Exchange {
            salted_password,
            auth_message,
        });

        Ok(format!("{},p={}", final_without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Verify the server-final-message (`v=<signature>` or `e=<error>`).
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerError(err.to_string()));
        }

        let verifier = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::InvalidServerMessage)?;
        let server_signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::BadServerSignature)?;

        let exchange = self.exchange.as_ref().ok_or(ScramError::OutOfOrder)?;
        let server_key = hmac_sha256(&exchange.salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, exchange.auth_message.as_bytes());

        if server_signature != expected {
            return Err(ScramError::BadServerSignature);
        }
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("HMAC can take key of any size");
    output
}

/// HMAC-SHA-256
fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Compute the server-final-message a server holding `password` would send.
#[cfg(test)]
pub(crate) fn server_final_for(
    password: &str,
    salt: &[u8],
    iterations: u32,
    auth_message: &str,
) -> String {
    let salted = hi(password, salt, iterations);
    let server_key = hmac_sha256(&salted, b"Server Key");
    let signature = hmac_sha256(&server_key, auth_message.as_bytes());
    format!("v={}", BASE64.encode(signature))
}
