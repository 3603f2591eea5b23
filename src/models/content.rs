use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Name of the shared mapping holding the document record.
pub const CONTENT_MAPPING: &str = "document";

/// Keys of the three fields making up the document record.
pub const CONTENT_KEY: &str = "content";
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const ORIGIN_KEY: &str = "origin";

/// The latest known document content, as read back from the shared mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ContentRecord {
    #[schema(value_type = Object)]
    pub data: Value,
    /// Milliseconds since the Unix epoch at the writer.
    pub timestamp: i64,
    pub origin: String,
}
