//! Stratum message types and JSON-RPC serialization.
//!
//! This module defines the wire format the bridge speaks with miners. Messages
//! follow the loose JSON-RPC dialect Stratum uses: requests carry a method and
//! params, notifications are requests with `id: null`, and responses always
//! carry both `result` and `error` (one of them null).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol version string returned from `mining.subscribe`.
pub const PROTOCOL_VERSION: &str = "EthereumStratum/1.0.0";

/// Total nonce width in bytes; the extranonce occupies the top bytes.
pub const NONCE_SIZE: usize = 8;

/// JSON-RPC message envelope.
///
/// Stratum predates JSON-RPC 2.0 and bends it in a few places (null ids on
/// notifications, error arrays instead of objects, no version field), so a
/// small custom type fits better than a JSON-RPC library. Request ids are
/// kept as raw JSON values since miners send both numbers and strings and
/// expect them echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification
    Request {
        /// Message ID (null for notifications)
        id: Option<Value>,
        /// Method name (e.g., "mining.notify", "mining.subscribe")
        method: String,
        /// Method parameters
        #[serde(default)]
        params: Value,
    },

    /// Response to a request
    Response {
        /// Message ID matching the request
        id: Value,
        /// Result value (null on failure)
        result: Option<Value>,
        /// Error value (null on success)
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    /// Create a new request message.
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(Value::from(id)),
            method: method.into(),
            params,
        }
    }

    /// Create a notification (request without ID).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Successful response.
    pub fn result(id: Value, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response carrying a Stratum error triple.
    pub fn error(id: Value, code: ErrorCode, message: impl Into<String>) -> Self {
        JsonRpcMessage::Response {
            id,
            result: None,
            error: Some(json!([code as i32, message.into(), Value::Null])),
        }
    }

    /// Get the message ID if present.
    pub fn id(&self) -> Option<&Value> {
        match self {
            JsonRpcMessage::Request { id, .. } => id.as_ref(),
            JsonRpcMessage::Response { id, .. } => Some(id),
        }
    }

    /// Check if this is a notification (request without ID).
    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Request { id: None, .. })
    }

    /// Get the method name for requests.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// Stratum error codes sent in error responses.
///
/// These are the conventional Stratum v1 codes miners recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Other = 20,
    JobNotFound = 21,
    DuplicateShare = 22,
    LowDifficulty = 23,
    Unauthorized = 24,
    NotSubscribed = 25,
}

/// Methods a miner may call, as a closed set.
///
/// Anything the bridge does not serve parses to `Unknown` and is answered
/// with an error rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumMethod {
    Subscribe,
    Authorize,
    Submit,
    ExtranonceSubscribe,
    Unknown(String),
}

impl StratumMethod {
    pub fn parse(method: &str) -> Self {
        match method {
            "mining.subscribe" => StratumMethod::Subscribe,
            "mining.authorize" => StratumMethod::Authorize,
            "mining.submit" => StratumMethod::Submit,
            "mining.extranonce.subscribe" => StratumMethod::ExtranonceSubscribe,
            other => StratumMethod::Unknown(other.to_string()),
        }
    }
}

/// Parameters of `mining.subscribe`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeParams {
    /// Miner software identification, e.g. "IceRiverMiner-v1.1"
    pub remote_app: String,
}

impl SubscribeParams {
    pub fn from_params(params: &Value) -> Self {
        let remote_app = params
            .as_array()
            .and_then(|p| p.first())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self { remote_app }
    }
}

/// Parameters of `mining.authorize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeParams {
    /// "address[.worker]"
    pub username: String,

    /// Opaque password, kept for the audit trail only
    pub password: String,
}

impl AuthorizeParams {
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let params = params.as_array().ok_or("authorize params not an array")?;
        let username = params
            .first()
            .and_then(Value::as_str)
            .ok_or("username not a string")?
            .to_string();
        let password = params
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self { username, password })
    }
}

/// Parameters of `mining.submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    /// Identity the miner claims; the authorized identity is used instead
    pub username: String,

    /// Job ID this share is for
    pub job_id: u64,

    /// Nonce as sent, hex, possibly without the extranonce prefix
    pub nonce: String,
}

impl SubmitParams {
    /// Parse from Stratum JSON array parameters.
    ///
    /// Job ids are accepted as numbers or decimal strings since miners differ
    /// on which they echo back.
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let params = params.as_array().ok_or("submit params not an array")?;
        if params.len() < 3 {
            return Err(format!(
                "submit expects at least 3 params, got {}",
                params.len()
            ));
        }

        let username = params[0].as_str().unwrap_or_default().to_string();

        let job_id = match &params[1] {
            Value::String(s) => s
                .parse::<u64>()
                .map_err(|e| format!("job id not a number: {}", e))?,
            Value::Number(n) => n.as_u64().ok_or("job id out of range")?,
            _ => return Err("job id must be a string or number".to_string()),
        };

        let nonce = params[2].as_str().ok_or("nonce not a string")?.to_string();

        Ok(Self {
            username,
            job_id,
            nonce,
        })
    }
}

/// How a miner expects `mining.notify` to be laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFormat {
    /// Header as four little-endian u64 words plus a separate timestamp
    Words,

    /// Header and timestamp as one hex string (BzMiner, IceRiver)
    BigJob,
}

/// Mining job notification (`mining.notify`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotification {
    /// Bridge-wide job identifier
    pub job_id: u64,

    /// Pre-PoW header hash
    pub pre_pow_hash: [u8; 32],

    /// Header timestamp in milliseconds
    pub timestamp: u64,

    /// If true, miners should abandon previous jobs
    pub clean_jobs: bool,
}

impl JobNotification {
    /// The pre-PoW hash split into little-endian u64 words.
    pub fn header_words(&self) -> [u64; 4] {
        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(self.pre_pow_hash.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *word = u64::from_le_bytes(bytes);
        }
        words
    }

    /// Build the notification message in the requested layout.
    pub fn to_message(&self, format: JobFormat) -> JsonRpcMessage {
        let job_id = self.job_id.to_string();
        let params = match format {
            JobFormat::Words => json!([
                job_id,
                self.header_words(),
                self.timestamp,
                self.clean_jobs
            ]),
            JobFormat::BigJob => {
                let header = format!(
                    "{}{}",
                    hex::encode(self.pre_pow_hash),
                    hex::encode(self.timestamp.to_le_bytes())
                );
                json!([job_id, header, self.clean_jobs])
            }
        };
        JsonRpcMessage::notification("mining.notify", params)
    }
}

/// `mining.set_difficulty` notification.
pub fn set_difficulty(difficulty: u64) -> JsonRpcMessage {
    JsonRpcMessage::notification("mining.set_difficulty", json!([difficulty]))
}

/// `mining.set_extranonce` notification.
///
/// The second parameter is how many nonce bytes remain for the miner.
pub fn set_extranonce(extranonce_hex: &str, extranonce_len: usize) -> JsonRpcMessage {
    JsonRpcMessage::notification(
        "mining.set_extranonce",
        json!([extranonce_hex, NONCE_SIZE - extranonce_len]),
    )
}
