use serde::{Deserialize, Serialize};

/// Per-port metadata persisted by a background server so later launcher
/// invocations can discover and authenticate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    /// High-entropy secret shared with authorized clients.
    pub sensitive_token: String,
    /// Secret proving the server itself is authentic during the challenge
    /// round-trip.
    pub challenge_token: String,
    /// Absolute log file path, or the literal `"stdout"`.
    pub log_file_location: String,
    /// Source-control command this instance was launched for.
    pub command: String,
    /// Tool version reported at launch; a mismatch forces a fresh spawn.
    pub tool_version: String,
}

/// Body returned by `GET /challenge_authenticity` on token match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub challenge_token: String,
    pub pid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let record = ServerRecord {
            sensitive_token: "aa".repeat(16),
            challenge_token: "bb".repeat(16),
            log_file_location: "stdout".to_owned(),
            command: "sl".to_owned(),
            tool_version: "0.2".to_owned(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("sensitiveToken"));
        let back: ServerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
