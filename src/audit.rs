//! Append-only, Ed25519-signed audit/trace chain.
//!
//! Signing pattern grounded on the registry-entry signing scheme used
//! elsewhere in the broader example pack (`ed25519-dalek` + `sha2` +
//! `hex`, hash-linking each record to its predecessor) rather than on
//! anything in the teacher, which does not sign its own data.

use std::collections::HashMap;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::{TaskId, ThoughtId, TraceId};
use crate::dma::ActionSelection;
use crate::dma::conscience::FacultyVerdict;
use crate::dma::DmaResults;
use crate::error::AuditError;

/// The six trace components sharing one `trace_id` (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceComponents {
    pub observation: String,
    pub context: String,
    pub dma_results: DmaResults,
    pub action: ActionSelection,
    pub conscience: Vec<FacultyVerdict>,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTrace {
    pub trace_id: TraceId,
    pub thought_id: ThoughtId,
    pub task_id: TaskId,
    pub occurrence_id: String,
    pub components: TraceComponents,
    pub recorded_at: DateTime<Utc>,
}

/// One signed, hash-linked entry in the audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub prev_hash: String,
    pub payload: serde_json::Value,
    pub signature: String,
}

fn hash_entry(seq: u64, prev_hash: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_le_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Append-only signed chain. Every write is appended after the previous
/// entry's hash; verification walks the chain checking both the
/// signature and the hash link.
pub struct AuditChain {
    signing_key: SigningKey,
    entries: RwLock<Vec<AuditEntry>>,
}

impl AuditChain {
    pub fn new(signing_key: SigningKey) -> Self {
        Self {
            signing_key,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Append a new trace to the chain, signing its payload and linking
    /// its hash to the previous entry.
    pub fn append(&self, trace: &CompleteTrace) -> Result<u64, AuditError> {
        let mut entries = self.entries.write().expect("audit chain lock poisoned");
        let seq = entries.len() as u64;
        let prev_hash = entries.last().map(|e| hash_entry(e.seq, &e.prev_hash, &e.payload)).unwrap_or_default();
        let payload = serde_json::to_value(trace).expect("trace must serialize");
        let signature: Signature = self.signing_key.sign(payload.to_string().as_bytes());
        entries.push(AuditEntry {
            seq,
            prev_hash,
            payload,
            signature: hex::encode(signature.to_bytes()),
        });
        Ok(seq)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("audit chain lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk the chain verifying every signature and every hash link.
    /// Returns the first broken sequence, if any (Testable Property 8).
    pub fn verify(&self) -> Result<(), AuditError> {
        let entries = self.entries.read().expect("audit chain lock poisoned");
        verify_entries(&entries, &self.verifying_key())
    }

    /// Snapshot of every entry currently in the chain, for export.
    pub fn entries_snapshot(&self) -> Vec<AuditEntry> {
        self.entries.read().expect("audit chain lock poisoned").clone()
    }

    /// Write the chain's verifying key and every entry to a line-delimited
    /// JSON file: a header line carrying the hex-encoded verifying key,
    /// then one `AuditEntry` per line. Overwrites any existing file so a
    /// daemon can re-export after every round without accumulating stale
    /// copies.
    pub fn export(&self, path: &Path) -> Result<(), AuditError> {
        let file = std::fs::File::create(path).map_err(|e| AuditError::LogIo {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let mut writer = BufWriter::new(file);
        let header = AuditLogHeader {
            verifying_key: hex::encode(self.verifying_key().to_bytes()),
        };
        write_line(&mut writer, &header, path)?;
        for entry in self.entries_snapshot().iter() {
            write_line(&mut writer, entry, path)?;
        }
        writer.flush().map_err(|e| AuditError::LogIo {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

fn write_line<T: Serialize>(writer: &mut impl Write, value: &T, path: &Path) -> Result<(), AuditError> {
    let line = serde_json::to_string(value).expect("audit log line must serialize");
    writeln!(writer, "{line}").map_err(|e| AuditError::LogIo {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct AuditLogHeader {
    verifying_key: String,
}

/// Walk a chain's entries verifying every signature and every hash link.
/// Returns the first broken sequence, if any (Testable Property 8).
fn verify_entries(entries: &[AuditEntry], verifying_key: &VerifyingKey) -> Result<(), AuditError> {
    let mut expected_prev_hash = String::new();

    for entry in entries {
        if entry.prev_hash != expected_prev_hash {
            return Err(AuditError::BrokenLink {
                seq: entry.seq,
                expected: expected_prev_hash,
                found: entry.prev_hash.clone(),
            });
        }

        let signature_bytes = hex::decode(&entry.signature).map_err(|_| AuditError::BadSignature { seq: entry.seq })?;
        let signature = Signature::from_slice(&signature_bytes).map_err(|_| AuditError::BadSignature { seq: entry.seq })?;
        verifying_key
            .verify(entry.payload.to_string().as_bytes(), &signature)
            .map_err(|_| AuditError::BadSignature { seq: entry.seq })?;

        expected_prev_hash = hash_entry(entry.seq, &entry.prev_hash, &entry.payload);
    }
    Ok(())
}

/// Report produced by [`verify_audit_file`]: how many entries checked out
/// before verification stopped, independent of whether it stopped because
/// the file ended or because a link broke.
pub struct AuditFileReport {
    pub verified_entries: usize,
}

/// Verify an exported audit log independent of any in-memory `AuditChain` —
/// the entry point behind the `ciris verify-audit` command. Reads the
/// header's embedded verifying key rather than trusting a key supplied by
/// the caller, since the log is self-describing.
pub fn verify_audit_file(path: &Path) -> Result<AuditFileReport, AuditError> {
    let file = std::fs::File::open(path).map_err(|e| AuditError::LogIo {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut lines = std::io::BufReader::new(file).lines();

    let header_line = lines
        .next()
        .ok_or_else(|| AuditError::LogCorrupt { path: path.display().to_string(), message: "file is empty".to_string() })?
        .map_err(|e| AuditError::LogIo { path: path.display().to_string(), message: e.to_string() })?;
    let header: AuditLogHeader = serde_json::from_str(&header_line).map_err(|e| AuditError::LogCorrupt {
        path: path.display().to_string(),
        message: format!("bad header: {e}"),
    })?;
    let key_bytes: [u8; 32] = hex::decode(&header.verifying_key)
        .map_err(|e| AuditError::LogCorrupt { path: path.display().to_string(), message: format!("bad verifying key: {e}") })?
        .try_into()
        .map_err(|_| AuditError::LogCorrupt { path: path.display().to_string(), message: "verifying key is not 32 bytes".to_string() })?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| AuditError::LogCorrupt { path: path.display().to_string(), message: format!("bad verifying key: {e}") })?;

    let mut entries = Vec::new();
    for line in lines {
        let line = line.map_err(|e| AuditError::LogIo { path: path.display().to_string(), message: e.to_string() })?;
        let entry: AuditEntry = serde_json::from_str(&line)
            .map_err(|e| AuditError::LogCorrupt { path: path.display().to_string(), message: format!("bad entry: {e}") })?;
        entries.push(entry);
    }

    verify_entries(&entries, &verifying_key)?;
    Ok(AuditFileReport { verified_entries: entries.len() })
}

/// Signed emergency-command envelope (spec §4.10 / §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EmergencyCommandType {
    ShutdownNow,
    Freeze,
    SafeMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedCommand {
    pub command_type: EmergencyCommandType,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
    pub authority_key_id: String,
}

impl SignedCommand {
    fn signable_bytes(&self) -> Vec<u8> {
        format!("{:?}|{}|{}", self.command_type, self.issued_at, self.expires_at).into_bytes()
    }
}

/// Registry of known authority public keys, used to verify signed
/// emergency commands (spec §4.10).
#[derive(Default)]
pub struct AuthorityRegistry {
    keys: HashMap<String, VerifyingKey>,
}

impl AuthorityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trust(&mut self, key_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(key_id.into(), key);
    }

    /// Verify a signed command: reject unknown authorities, expired
    /// commands, or bad signatures without logging (spec §4.10).
    pub fn verify(&self, command: &SignedCommand, now: DateTime<Utc>) -> Result<(), AuditError> {
        if now > command.expires_at {
            return Err(AuditError::ExpiredCommand {
                expires_at: command.expires_at.to_string(),
            });
        }
        let key = self.keys.get(&command.authority_key_id).ok_or_else(|| AuditError::UnknownAuthority {
            key_id: command.authority_key_id.clone(),
        })?;
        let signature_bytes = hex::decode(&command.signature).map_err(|_| AuditError::BadSignature { seq: 0 })?;
        let signature = Signature::from_slice(&signature_bytes).map_err(|_| AuditError::BadSignature { seq: 0 })?;
        key.verify(&command.signable_bytes(), &signature)
            .map_err(|_| AuditError::BadSignature { seq: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::conscience::FacultyVerdict;
    use crate::dma::{ActionVerb, DmaEvaluation};
    use rand::rngs::OsRng;

    fn trace(id: &str) -> CompleteTrace {
        CompleteTrace {
            trace_id: TraceId(id.to_string()),
            thought_id: ThoughtId("th-1".to_string()),
            task_id: TaskId("t-1".to_string()),
            occurrence_id: "occA".to_string(),
            components: TraceComponents {
                observation: "hello".to_string(),
                context: "{}".to_string(),
                dma_results: DmaResults {
                    pdma: DmaEvaluation { alignment: 0.9, plausibility: 0.9, domain_fit: 0.9, notes: "ok".to_string() },
                    csdma: DmaEvaluation { alignment: 0.9, plausibility: 0.9, domain_fit: 0.9, notes: "ok".to_string() },
                    dsdma: DmaEvaluation { alignment: 0.9, plausibility: 0.9, domain_fit: 0.9, notes: "ok".to_string() },
                    recursion_count: 0,
                },
                action: ActionSelection {
                    selected_action: ActionVerb::Speak,
                    action_parameters: serde_json::json!({}),
                    rationale: "r".to_string(),
                },
                conscience: vec![FacultyVerdict { faculty: "entropy".to_string(), passed: true, reason: None }],
                outcome: "sent".to_string(),
            },
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn chain_of_three_verifies_clean() {
        let key = SigningKey::generate(&mut OsRng);
        let chain = AuditChain::new(key);
        chain.append(&trace("trace-1")).unwrap();
        chain.append(&trace("trace-2")).unwrap();
        chain.append(&trace("trace-3")).unwrap();
        assert!(chain.verify().is_ok());
    }

    #[test]
    fn tampering_with_a_record_is_detected() {
        let key = SigningKey::generate(&mut OsRng);
        let chain = AuditChain::new(key);
        chain.append(&trace("trace-1")).unwrap();
        chain.append(&trace("trace-2")).unwrap();
        {
            let mut entries = chain.entries.write().unwrap();
            entries[0].payload = serde_json::json!({"tampered": true});
        }
        assert!(chain.verify().is_err());
    }

    #[test]
    fn expired_command_is_rejected() {
        let mut authorities = AuthorityRegistry::new();
        let key = SigningKey::generate(&mut OsRng);
        authorities.trust("root", key.verifying_key());
        let now = Utc::now();
        let command = SignedCommand {
            command_type: EmergencyCommandType::ShutdownNow,
            issued_at: now - chrono::Duration::hours(2),
            expires_at: now - chrono::Duration::hours(1),
            signature: hex::encode([0u8; 64]),
            authority_key_id: "root".to_string(),
        };
        assert!(matches!(authorities.verify(&command, now), Err(AuditError::ExpiredCommand { .. })));
    }

    #[test]
    fn unknown_authority_is_rejected() {
        let authorities = AuthorityRegistry::new();
        let now = Utc::now();
        let command = SignedCommand {
            command_type: EmergencyCommandType::Freeze,
            issued_at: now,
            expires_at: now + chrono::Duration::hours(1),
            signature: hex::encode([0u8; 64]),
            authority_key_id: "ghost".to_string(),
        };
        assert!(matches!(authorities.verify(&command, now), Err(AuditError::UnknownAuthority { .. })));
    }

    #[test]
    fn exported_log_verifies_clean() {
        let key = SigningKey::generate(&mut OsRng);
        let chain = AuditChain::new(key);
        chain.append(&trace("trace-1")).unwrap();
        chain.append(&trace("trace-2")).unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        chain.export(&path).unwrap();

        let report = verify_audit_file(&path).unwrap();
        assert_eq!(report.verified_entries, 2);
    }

    #[test]
    fn exported_log_detects_tampering() {
        let key = SigningKey::generate(&mut OsRng);
        let chain = AuditChain::new(key);
        chain.append(&trace("trace-1")).unwrap();
        chain.append(&trace("trace-2")).unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        chain.export(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered = contents.replace("trace-2", "trace-ZZ");
        std::fs::write(&path, tampered).unwrap();

        assert!(matches!(verify_audit_file(&path), Err(AuditError::BadSignature { .. })));
    }

    #[test]
    fn correctly_signed_command_is_accepted() {
        let mut authorities = AuthorityRegistry::new();
        let key = SigningKey::generate(&mut OsRng);
        authorities.trust("root", key.verifying_key());
        let now = Utc::now();
        let mut command = SignedCommand {
            command_type: EmergencyCommandType::SafeMode,
            issued_at: now,
            expires_at: now + chrono::Duration::hours(1),
            signature: String::new(),
            authority_key_id: "root".to_string(),
        };
        let signature = key.sign(&command.signable_bytes());
        command.signature = hex::encode(signature.to_bytes());
        assert!(authorities.verify(&command, now).is_ok());
    }
}
