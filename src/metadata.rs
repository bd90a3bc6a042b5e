use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tonic::metadata::{Ascii, KeyAndValueRef, MetadataMap, MetadataValue};
use uuid::Uuid;

pub const CLIENT_TIME_KEY: &str = "grpc-client-time";
pub const CLIENT_OS_KEY: &str = "grpc-client-os";
pub const REQUEST_UUID_KEY: &str = "grpc-request-uuid";

fn ascii(value: &str) -> MetadataValue<Ascii> {
    // Callers only pass values built from ascii-safe sources.
    MetadataValue::from_str(value).unwrap()
}

/// Correlation metadata for one call attempt: client-local timestamp,
/// client platform and a fresh random UUID. Generated per attempt, never
/// reused across retries.
pub fn outgoing() -> MetadataMap {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let mut map = MetadataMap::new();
    map.insert(CLIENT_TIME_KEY, ascii(&format!("{}", now.as_secs())));
    map.insert(CLIENT_OS_KEY, ascii(std::env::consts::OS));
    map.insert(REQUEST_UUID_KEY, ascii(&Uuid::new_v4().to_string()));
    map
}

/// Copy `source` into `target` without disturbing entries tonic already set.
pub fn attach(source: &MetadataMap, target: &mut MetadataMap) {
    for entry in source.iter() {
        if let KeyAndValueRef::Ascii(key, value) = entry {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Flatten inbound header metadata into a plain map. Binary entries are
/// skipped; absent metadata yields an empty map, which is not an error.
pub fn inbound(map: &MetadataMap) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();

    for entry in map.iter() {
        if let KeyAndValueRef::Ascii(key, value) = entry {
            if let Ok(value) = value.to_str() {
                entries.insert(key.as_str().to_string(), value.to_string());
            }
        }
    }

    entries
}

pub fn log_inbound(entries: &BTreeMap<String, String>) {
    if entries.is_empty() {
        tracing::info!("response metadata not found");
        return;
    }

    tracing::info!("response metadata:");
    for (key, value) in entries {
        tracing::info!("  {} : {}", key, value);
    }
}
