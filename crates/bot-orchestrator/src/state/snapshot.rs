//! Snapshot schema, checksums, and the stored encoding.
//!
//! A snapshot is stored as compact JSON, gzip-compressed above a size
//! threshold. The checksum is SHA-256 over the canonical JSON of the snapshot
//! with the `checksum` field removed. Verification runs on the stored document
//! before any schema migration, so older payloads verify against the checksum
//! they were written with.

use bot_fleet_core::{BotState, FleetError, FleetResult, StrategyDescriptor, StrategyKind};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Payload layout written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

const CHECKSUM_FIELD: &str = "checksum";

/// Everything needed to rebuild a bot runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub schema_version: u32,
    pub state: BotState,
    pub configuration: Value,
    pub strategy_state: Option<Value>,
}

/// Versioned, checksummed serialization of a bot's runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub bot_id: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: SnapshotPayload,
    pub checksum: String,
}

impl StateSnapshot {
    /// Builds a snapshot and seals it with its checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn seal(
        bot_id: impl Into<String>,
        version: u64,
        timestamp: DateTime<Utc>,
        payload: SnapshotPayload,
    ) -> FleetResult<Self> {
        let mut snapshot = Self {
            bot_id: bot_id.into(),
            version,
            timestamp,
            payload,
            checksum: String::new(),
        };
        snapshot.checksum = snapshot.compute_checksum()?;
        Ok(snapshot)
    }

    /// Recomputes the checksum from the current contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be serialized.
    pub fn compute_checksum(&self) -> FleetResult<String> {
        let value = serde_json::to_value(self)
            .map_err(|e| FleetError::Other(anyhow::Error::new(e).context("snapshot encode")))?;
        Ok(checksum_of(&value))
    }

    /// Whether the stored checksum matches the contents.
    #[must_use]
    pub fn verify(&self) -> bool {
        self.compute_checksum()
            .is_ok_and(|computed| computed == self.checksum)
    }
}

/// SHA-256 hex digest of a JSON document, ignoring its top-level checksum field.
#[must_use]
pub fn checksum_of(document: &Value) -> String {
    let mut canonical = canonicalize(document);
    if let Value::Object(map) = &mut canonical {
        map.remove(CHECKSUM_FIELD);
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Rebuilds objects with keys in sorted order, independent of map implementation.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Stored form of a snapshot.
#[derive(Debug, Clone)]
pub struct EncodedSnapshot {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    /// Uncompressed size.
    pub size_bytes: u64,
}

/// Serializes a snapshot, compressing when it exceeds `threshold` bytes.
///
/// # Errors
///
/// Returns an error if serialization or compression fails.
pub fn encode(snapshot: &StateSnapshot, threshold: usize) -> FleetResult<EncodedSnapshot> {
    let json = serde_json::to_vec(snapshot)
        .map_err(|e| FleetError::Other(anyhow::Error::new(e).context("snapshot encode")))?;
    let size_bytes = json.len() as u64;

    if json.len() <= threshold {
        return Ok(EncodedSnapshot {
            bytes: json,
            compressed: false,
            size_bytes,
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|()| encoder.finish())
        .map(|bytes| EncodedSnapshot {
            bytes,
            compressed: true,
            size_bytes,
        })
        .map_err(|e| FleetError::Other(anyhow::Error::new(e).context("snapshot compression")))
}

/// Decodes a stored snapshot, migrating older schema versions.
///
/// # Errors
///
/// Returns [`FleetError::StateCorrupted`] if the bytes cannot be decoded, the
/// checksum does not match (when `verify` is set), or the schema is unknown.
pub fn decode(
    bot_id: &str,
    bytes: &[u8],
    compressed: bool,
    expected_checksum: Option<&str>,
    verify: bool,
) -> FleetResult<StateSnapshot> {
    let corrupted = |detail: String| FleetError::StateCorrupted {
        bot_id: bot_id.to_string(),
        detail,
    };

    let json = if compressed {
        let mut out = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(|e| corrupted(format!("decompression failed: {e}")))?;
        out
    } else {
        bytes.to_vec()
    };

    let document: Value =
        serde_json::from_slice(&json).map_err(|e| corrupted(format!("invalid json: {e}")))?;

    if verify {
        let embedded = document
            .get(CHECKSUM_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| corrupted("missing checksum".to_string()))?;
        let computed = checksum_of(&document);
        if computed != embedded {
            return Err(corrupted(format!(
                "checksum mismatch: stored {embedded}, computed {computed}"
            )));
        }
        if let Some(expected) = expected_checksum {
            if expected != embedded {
                return Err(corrupted(format!(
                    "checksum mismatch: record {expected}, payload {embedded}"
                )));
            }
        }
    }

    let document = migrate(document).map_err(corrupted)?;
    serde_json::from_value(document).map_err(|e| corrupted(format!("invalid snapshot: {e}")))
}

/// Brings a snapshot document up to [`CURRENT_SCHEMA_VERSION`].
fn migrate(mut document: Value) -> Result<Value, String> {
    loop {
        let version = document
            .pointer("/payload/schema_version")
            .and_then(Value::as_u64)
            .ok_or("missing schema version")?;

        match u32::try_from(version) {
            Ok(CURRENT_SCHEMA_VERSION) => return Ok(document),
            Ok(1) => document = migrate_v1_to_v2(document)?,
            _ => return Err(format!("unsupported schema version {version}")),
        }
    }
}

/// Version 1 kept the strategy as flat `strategy_name`/`strategy_version`
/// fields on the state and had no strategy kind.
fn migrate_v1_to_v2(mut document: Value) -> Result<Value, String> {
    let payload = document
        .get_mut("payload")
        .and_then(Value::as_object_mut)
        .ok_or("missing payload")?;
    let state = payload
        .get_mut("state")
        .and_then(Value::as_object_mut)
        .ok_or("missing state")?;

    let take_str = |state: &mut Map<String, Value>, key: &str| {
        state
            .remove(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    };
    let name = take_str(state, "strategy_name");
    let version = take_str(state, "strategy_version");
    let descriptor = StrategyDescriptor::new(name, version, StrategyKind::BuiltIn);
    state.insert(
        "strategy".to_string(),
        serde_json::to_value(descriptor).map_err(|e| e.to_string())?,
    );

    payload.insert("schema_version".to_string(), Value::from(2));
    payload.entry("strategy_state").or_insert(Value::Null);
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bot_fleet_core::{OrderSide, RuntimeStatus};
    use rust_decimal_macros::dec;

    fn snapshot() -> StateSnapshot {
        let mut state = BotState::new(
            "bot-1",
            StrategyDescriptor::new("momentum", "1.0.0", StrategyKind::BuiltIn),
        );
        state.status = RuntimeStatus::Running;
        state.apply_fill("BTC-USD", OrderSide::Buy, dec!(1), dec!(100), Utc::now());
        StateSnapshot::seal(
            "bot-1",
            3,
            Utc::now(),
            SnapshotPayload {
                schema_version: CURRENT_SCHEMA_VERSION,
                state,
                configuration: serde_json::json!({"lookback": 5, "threshold": 0.5}),
                strategy_state: Some(serde_json::json!({"prices": [1, 2, 3]})),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_checksum_is_stable_and_verifies() {
        let snap = snapshot();
        assert!(snap.verify());
        assert_eq!(snap.compute_checksum().unwrap(), snap.checksum);
        assert_eq!(snap.checksum.len(), 64);
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}, "checksum": "zzz"});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(checksum_of(&a), checksum_of(&b));
    }

    #[test]
    fn test_encode_decode_plain_and_compressed() {
        let snap = snapshot();

        let plain = encode(&snap, usize::MAX).unwrap();
        assert!(!plain.compressed);
        let decoded = decode("bot-1", &plain.bytes, false, Some(&snap.checksum), true).unwrap();
        assert_eq!(decoded, snap);

        let packed = encode(&snap, 16).unwrap();
        assert!(packed.compressed);
        assert_eq!(packed.size_bytes, plain.size_bytes);
        let decoded = decode("bot-1", &packed.bytes, true, None, true).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn test_single_byte_corruption_is_detected() {
        let snap = snapshot();
        let encoded = encode(&snap, usize::MAX).unwrap();

        for index in [10, encoded.bytes.len() / 2, encoded.bytes.len() - 10] {
            let mut bytes = encoded.bytes.clone();
            bytes[index] = if bytes[index] == b'7' { b'8' } else { b'7' };
            let err = decode("bot-1", &bytes, false, None, true).unwrap_err();
            assert_eq!(err.reason(), "state_corrupted", "byte {index} not detected");
        }
    }

    #[test]
    fn test_compressed_corruption_is_detected() {
        let snap = snapshot();
        let mut encoded = encode(&snap, 16).unwrap();
        let mid = encoded.bytes.len() / 2;
        encoded.bytes[mid] ^= 0xFF;

        let err = decode("bot-1", &encoded.bytes, true, None, true).unwrap_err();
        assert_eq!(err.reason(), "state_corrupted");
    }

    #[test]
    fn test_v1_payload_migrates() {
        let mut document = serde_json::to_value(snapshot()).unwrap();
        {
            let state = document
                .pointer_mut("/payload/state")
                .and_then(Value::as_object_mut)
                .unwrap();
            state.remove("strategy");
            state.insert("strategy_name".into(), Value::from("legacy"));
            state.insert("strategy_version".into(), Value::from("0.9"));
        }
        document["payload"]["schema_version"] = Value::from(1);
        document["checksum"] = Value::from(checksum_of(&document));
        let bytes = serde_json::to_vec(&document).unwrap();

        let decoded = decode("bot-1", &bytes, false, None, true).unwrap();
        assert_eq!(decoded.payload.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(decoded.payload.state.strategy.name, "legacy");
        assert_eq!(decoded.payload.state.strategy.version, "0.9");
    }

    #[test]
    fn test_unknown_schema_is_rejected() {
        let mut document = serde_json::to_value(snapshot()).unwrap();
        document["payload"]["schema_version"] = Value::from(99);
        let bytes = serde_json::to_vec(&document).unwrap();

        let err = decode("bot-1", &bytes, false, None, false).unwrap_err();
        assert!(err.to_string().contains("unsupported schema version 99"));
    }
}
