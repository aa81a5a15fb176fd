//! Secure-message payload objects: the JSON bodies carried inside SECURE_MSG
//! once decrypted.

use serde::{Deserialize, Serialize};

use crate::chunk::FileManifest;

/// Application objects exchanged over an established session. The `kind` tag
/// is the wire discriminator; a payload with an unknown tag fails to parse
/// here and is surfaced to the dispatcher for logging, never dropped quietly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SecureObject {
    #[serde(rename = "chat")]
    Chat { text: String },
    #[serde(rename = "file_offer")]
    FileOffer { manifest: FileManifest },
    #[serde(rename = "file_get")]
    FileGet { offer_id: String },
}

impl SecureObject {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
