use super::BlobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobState {
    /// Writable; contents may still change.
    RW,
    /// Committed; contents are immutable.
    RO,
    Deleting,
}

/// Worker-side description of a blob, persisted in `blob/<id>/meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMeta {
    #[serde(rename = "blob-id")]
    pub blob_id: BlobId,
    pub state: BlobState,
    /// Space reserved at creation, then the stored length once committed.
    pub size: u64,
    #[serde(skip_serializing_if = "::serde_json::Value::is_null")]
    #[serde(default)]
    pub metadata: ::serde_json::Value,
}

impl BlobMeta {
    pub fn new(blob_id: &str, size: u64, metadata: ::serde_json::Value) -> Self {
        BlobMeta {
            blob_id: blob_id.to_string(),
            state: BlobState::RW,
            size,
            metadata,
        }
    }

    /// Params of the `blob-update` notification.
    pub fn update_params(&self) -> ::serde_json::Value {
        json!({
            "blob-id": self.blob_id,
            "state": self.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_json() {
        let meta = BlobMeta::new("b1", 42, ::serde_json::Value::Null);
        let value = ::serde_json::to_value(&meta).unwrap();
        assert_eq!(value, json!({"blob-id": "b1", "state": "RW", "size": 42}));
        let back: BlobMeta = ::serde_json::from_value(value).unwrap();
        assert_eq!(back, meta);
        assert_eq!(meta.update_params()["state"], "RW");
    }
}
