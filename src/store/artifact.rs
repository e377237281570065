use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An uploaded file of target hashes. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashFile {
    pub id: Uuid,
    pub name: String,
    pub hash_type: Option<u32>,
    pub hash_count: u64,
    pub created_at: DateTime<Utc>,
}

impl HashFile {
    pub fn new(name: impl Into<String>, hash_type: Option<u32>, hash_count: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            hash_type,
            hash_count,
            created_at: Utc::now(),
        }
    }
}

/// An uploaded wordlist. `word_count` is known once the upload has been
/// indexed; the keyspace splitter needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wordlist {
    pub id: Uuid,
    pub name: String,
    pub word_count: Option<u64>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Wordlist {
    pub fn new(name: impl Into<String>, word_count: Option<u64>, size_bytes: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            word_count,
            size_bytes,
            created_at: Utc::now(),
        }
    }
}
