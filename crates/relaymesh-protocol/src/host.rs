//! Host description a relay reports when it joins.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostInfo {
    pub computer_name: String,
    pub os: String,
    pub process_id: u32,
}

impl HostInfo {
    /// Describe the current process.
    pub fn gather() -> Self {
        let computer_name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            computer_name,
            os: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            process_id: std::process::id(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Parse(format!("host info: {e}")))
    }
}
