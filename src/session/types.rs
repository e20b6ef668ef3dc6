use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{PrincipalId, SessionId};

/// Live session metadata from the session authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: SessionId,
    #[serde(with = "time::serde::rfc3339")]
    pub login_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    #[serde(default)]
    pub suspicious_activity: Option<SuspiciousActivity>,
}

/// Anomaly assessment attached to a session by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousActivity {
    pub detected: bool,
    #[serde(default)]
    pub patterns: Vec<ActivityPattern>,
    #[serde(default)]
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityPattern {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: RiskLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// What a heartbeat records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    PageView,
}

/// Periodic "still in use" signal for a child session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityHeartbeat {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub page: String,
    pub action: ActivityAction,
}

/// Anomaly report sent back to the authority when a guard denies access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousActivityReport {
    pub child_id: PrincipalId,
    pub activity_details: SuspiciousActivity,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub location: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn metadata_wire_shape() {
        let meta: SessionMetadata = serde_json::from_value(serde_json::json!({
            "sessionId": "s-1",
            "loginTime": "2026-03-01T09:00:00Z",
            "lastActivity": "2026-03-01T09:20:00Z",
            "suspiciousActivity": {
                "detected": true,
                "patterns": [{ "type": "rapid_navigation", "severity": "medium" }],
                "riskLevel": "high"
            }
        }))
        .unwrap();

        assert_eq!(meta.login_time, datetime!(2026-03-01 09:00 UTC));
        let suspicious = meta.suspicious_activity.unwrap();
        assert!(suspicious.detected);
        assert_eq!(suspicious.risk_level, RiskLevel::High);
        assert_eq!(suspicious.patterns[0].kind, "rapid_navigation");
    }

    #[test]
    fn suspicious_activity_is_optional() {
        let meta: SessionMetadata = serde_json::from_value(serde_json::json!({
            "sessionId": "s-1",
            "loginTime": "2026-03-01T09:00:00Z",
            "lastActivity": "2026-03-01T09:00:00Z"
        }))
        .unwrap();
        assert!(meta.suspicious_activity.is_none());
    }

    #[test]
    fn heartbeat_action_is_page_view() {
        let heartbeat = ActivityHeartbeat {
            timestamp: datetime!(2026-03-01 09:00 UTC),
            page: "/child/dashboard".into(),
            action: ActivityAction::PageView,
        };
        let json = serde_json::to_value(&heartbeat).unwrap();
        assert_eq!(json["action"], "page_view");
        assert_eq!(json["page"], "/child/dashboard");
    }
}
