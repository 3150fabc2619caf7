// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Protocol negotiation through a well-known bucket document.
//!
//! Before any pack is exchanged, every replica reads
//! `_journal_sync_protocol.json`:
//!
//! | Remote document | Action |
//! |-----------------|--------|
//! | absent | write `{version, salt, createdAt}` with the local version |
//! | same version | accept |
//! | older version | rewrite at the local version, keep salt and `createdAt` |
//! | newer version | reject, this build cannot read the bucket |
//! | salt ≠ configured salt | reject, the bucket belongs to another setup |
//!
//! Any failure here is a pre-flight failure: no checkpoint is touched.

use crate::error::{JournalError, Result};
use crate::object_store::ObjectStoreProvider;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Bucket key of the negotiation document.
pub const PROTOCOL_DOC_KEY: &str = "_journal_sync_protocol.json";

/// Pack protocol version written by this build.
pub const PROTOCOL_VERSION: u32 = 2;

const PROTOCOL_MIME: &str = "application/json";

/// Contents of the negotiation document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDocument {
    pub version: u32,
    pub salt: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// What negotiation did to the remote document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Created,
    Compatible,
    Upgraded,
}

/// Result of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub document: ProtocolDocument,
    pub outcome: NegotiationOutcome,
}

/// Derive a fresh salt from a seed and the current time.
pub fn generate_salt(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_be_bytes(),
    );
    hex::encode(&hasher.finalize()[..16])
}

/// Read, create or upgrade the negotiation document.
///
/// `salt_seed` is only used when the document is absent and no
/// `expected_salt` is configured.
pub async fn negotiate<O>(remote: &O, expected_salt: Option<&str>, salt_seed: &str) -> Result<Negotiated>
where
    O: ObjectStoreProvider + ?Sized,
{
    let existing = remote
        .download(PROTOCOL_DOC_KEY)
        .await
        .map_err(|e| JournalError::transport("download_protocol", e.0))?;

    let Some(raw) = existing else {
        let document = ProtocolDocument {
            version: PROTOCOL_VERSION,
            salt: expected_salt.map(str::to_string).unwrap_or_else(|| generate_salt(salt_seed)),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        write_document(remote, &document).await?;
        info!(version = document.version, "Created protocol negotiation document");
        return Ok(Negotiated {
            document,
            outcome: NegotiationOutcome::Created,
        });
    };

    let mut document: ProtocolDocument = serde_json::from_slice(&raw)
        .map_err(|e| JournalError::Protocol(format!("unreadable negotiation document: {}", e)))?;

    if let Some(expected) = expected_salt {
        if document.salt != expected {
            warn!("Remote salt does not match the configured salt");
            return Err(JournalError::Protocol(
                "remote salt does not match the configured salt".to_string(),
            ));
        }
    }

    if document.version > PROTOCOL_VERSION {
        warn!(
            remote_version = document.version,
            local_version = PROTOCOL_VERSION,
            "Remote protocol is newer than this build"
        );
        return Err(JournalError::Protocol(format!(
            "remote protocol version {} is newer than supported version {}",
            document.version, PROTOCOL_VERSION
        )));
    }

    if document.version < PROTOCOL_VERSION {
        let from = document.version;
        document.version = PROTOCOL_VERSION;
        write_document(remote, &document).await?;
        info!(from, to = PROTOCOL_VERSION, "Upgraded protocol negotiation document");
        return Ok(Negotiated {
            document,
            outcome: NegotiationOutcome::Upgraded,
        });
    }

    Ok(Negotiated {
        document,
        outcome: NegotiationOutcome::Compatible,
    })
}

async fn write_document<O>(remote: &O, document: &ProtocolDocument) -> Result<()>
where
    O: ObjectStoreProvider + ?Sized,
{
    let body = serde_json::to_vec(document)?;
    let accepted = remote
        .upload(PROTOCOL_DOC_KEY, body, PROTOCOL_MIME)
        .await
        .map_err(|e| JournalError::transport("upload_protocol", e.0))?;
    if !accepted {
        return Err(JournalError::transport("upload_protocol", "provider rejected upload"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryObjectStore;

    async fn seed(remote: &MemoryObjectStore, version: u32, salt: &str) {
        let doc = ProtocolDocument {
            version,
            salt: salt.to_string(),
            created_at: 1,
        };
        remote
            .insert(PROTOCOL_DOC_KEY, serde_json::to_vec(&doc).unwrap())
            .await;
    }

    async fn stored(remote: &MemoryObjectStore) -> ProtocolDocument {
        serde_json::from_slice(&remote.object(PROTOCOL_DOC_KEY).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_absent_document_is_created() {
        let remote = MemoryObjectStore::new();
        let negotiated = negotiate(&remote, None, "seed").await.unwrap();

        assert_eq!(negotiated.outcome, NegotiationOutcome::Created);
        assert_eq!(negotiated.document.version, PROTOCOL_VERSION);
        assert_eq!(negotiated.document.salt.len(), 32);
        assert_eq!(stored(&remote).await, negotiated.document);
    }

    #[tokio::test]
    async fn test_created_document_uses_expected_salt() {
        let remote = MemoryObjectStore::new();
        let negotiated = negotiate(&remote, Some("pepper"), "seed").await.unwrap();
        assert_eq!(negotiated.document.salt, "pepper");
    }

    #[tokio::test]
    async fn test_same_version_is_compatible() {
        let remote = MemoryObjectStore::new();
        seed(&remote, PROTOCOL_VERSION, "s").await;
        let negotiated = negotiate(&remote, Some("s"), "seed").await.unwrap();
        assert_eq!(negotiated.outcome, NegotiationOutcome::Compatible);
    }

    #[tokio::test]
    async fn test_older_version_is_upgraded_keeping_salt() {
        let remote = MemoryObjectStore::new();
        seed(&remote, 1, "old-salt").await;

        let negotiated = negotiate(&remote, None, "seed").await.unwrap();
        assert_eq!(negotiated.outcome, NegotiationOutcome::Upgraded);

        let doc = stored(&remote).await;
        assert_eq!(doc.version, PROTOCOL_VERSION);
        assert_eq!(doc.salt, "old-salt");
        assert_eq!(doc.created_at, 1);
    }

    #[tokio::test]
    async fn test_newer_version_is_rejected() {
        let remote = MemoryObjectStore::new();
        seed(&remote, PROTOCOL_VERSION + 1, "s").await;
        let err = negotiate(&remote, None, "seed").await.unwrap_err();
        assert!(matches!(err, JournalError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_salt_mismatch_is_rejected() {
        let remote = MemoryObjectStore::new();
        seed(&remote, PROTOCOL_VERSION, "theirs").await;
        let err = negotiate(&remote, Some("ours"), "seed").await.unwrap_err();
        assert!(matches!(err, JournalError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_garbage_document_is_rejected() {
        let remote = MemoryObjectStore::new();
        remote.insert(PROTOCOL_DOC_KEY, b"not json".to_vec()).await;
        let err = negotiate(&remote, None, "seed").await.unwrap_err();
        assert!(matches!(err, JournalError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_unreachable_bucket_is_transport_error() {
        let remote = MemoryObjectStore::new();
        remote.set_available(false);
        let err = negotiate(&remote, None, "seed").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
