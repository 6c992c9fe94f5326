//! Recovery keys: enough state to carry a connection into a new client
//! instance.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryKey {
    pub connection_key: String,
    /// Next msgSerial the old instance would have assigned.
    pub msg_serial: i64,
    /// Last channelSerial seen per attached channel.
    #[serde(default)]
    pub channel_serials: HashMap<String, String>,
}

impl RecoveryKey {
    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(s: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(s)?)
    }
}
