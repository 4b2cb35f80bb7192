use crate::SequenceRequest;
use core::fmt;
use serde::{Deserialize, Serialize};

/// What happened to a sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// A fresh number was produced by advancing the global counter.
    Generate,
    /// The number was returned to the gap pool.
    Release,
    /// A gap was reused, or withdrawn by an administrator.
    Recover,
    Reserve,
    Expire,
    /// Boundary record written by a system reset.
    Reset,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "GENERATE",
            Self::Release => "RELEASE",
            Self::Recover => "RECOVER",
            Self::Reserve => "RESERVE",
            Self::Expire => "EXPIRE",
            Self::Reset => "RESET",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a number after the recorded transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Active,
    Released,
    Recovered,
    Expired,
    Invalid,
}

impl AuditStatus {
    /// Whether a number in this status is held by a caller.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::Recovered)
    }
}

/// One immutable entry of the audit trail, as persisted in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub audit_id: String,
    pub sequence_number: u64,
    pub site_id: String,
    pub partition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_type: Option<String>,
    pub operation: OperationKind,
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub description: String,
    pub timestamp_millis: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub node_id: String,
    pub instance_name: String,
    pub gap_filled: bool,
    /// Counter value observed when the record was written.
    pub global_counter: u64,
}

/// The caller-provided part of an [`AuditRecord`].
///
/// [`AuditLog::record`](super::AuditLog::record) fills in the id, timestamp
/// and instance identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEvent {
    pub sequence_number: u64,
    pub site_id: String,
    pub partition_id: String,
    pub invoice_type: Option<String>,
    pub operation: OperationKind,
    pub status: AuditStatus,
    pub reason: Option<String>,
    pub description: String,
    pub request_id: Option<String>,
    pub gap_filled: bool,
    pub global_counter: u64,
}

impl AuditEvent {
    /// A number produced by advancing the counter for `request`.
    pub fn generate(number: u64, request: &SequenceRequest, counter: u64) -> Self {
        Self {
            sequence_number: number,
            site_id: request.site_id.clone(),
            partition_id: request.partition_id.clone(),
            invoice_type: Some(request.invoice_type.clone()),
            operation: OperationKind::Generate,
            status: AuditStatus::Active,
            reason: None,
            description: format!("Generated new sequence number {number}"),
            request_id: request.request_id.clone(),
            gap_filled: false,
            global_counter: counter,
        }
    }

    /// A gap reused for `request`. Carries the recovering request's site and
    /// partition, not the releaser's.
    pub fn recover(number: u64, request: &SequenceRequest, counter: u64) -> Self {
        Self {
            sequence_number: number,
            site_id: request.site_id.clone(),
            partition_id: request.partition_id.clone(),
            invoice_type: Some(request.invoice_type.clone()),
            operation: OperationKind::Recover,
            status: AuditStatus::Recovered,
            reason: None,
            description: format!("Recovered gap sequence number {number}"),
            request_id: request.request_id.clone(),
            gap_filled: true,
            global_counter: counter,
        }
    }

    /// A gap withdrawn from the pool by an administrator. The number is not
    /// handed to anyone.
    pub fn withdraw(number: u64, site_id: &str, partition_id: &str, counter: u64) -> Self {
        Self {
            sequence_number: number,
            site_id: site_id.to_string(),
            partition_id: partition_id.to_string(),
            invoice_type: None,
            operation: OperationKind::Recover,
            status: AuditStatus::Invalid,
            reason: Some("administrative recovery".to_string()),
            description: format!("Withdrew gap sequence number {number} from the pool"),
            request_id: None,
            gap_filled: false,
            global_counter: counter,
        }
    }

    pub fn release(
        number: u64,
        site_id: &str,
        partition_id: &str,
        reason: &str,
        counter: u64,
    ) -> Self {
        Self {
            sequence_number: number,
            site_id: site_id.to_string(),
            partition_id: partition_id.to_string(),
            invoice_type: None,
            operation: OperationKind::Release,
            status: AuditStatus::Released,
            reason: Some(reason.to_string()),
            description: format!("Released sequence number {number}: {reason}"),
            request_id: None,
            gap_filled: false,
            global_counter: counter,
        }
    }

    /// A counter number that went to the pool without ever being handed
    /// out, because its allocation could not be audited.
    pub fn unissued(number: u64, site_id: &str, partition_id: &str, counter: u64) -> Self {
        Self {
            sequence_number: number,
            site_id: site_id.to_string(),
            partition_id: partition_id.to_string(),
            invoice_type: None,
            operation: OperationKind::Release,
            status: AuditStatus::Invalid,
            reason: Some("allocation could not be audited".to_string()),
            description: format!("Returned unissued sequence number {number} to the pool"),
            request_id: None,
            gap_filled: false,
            global_counter: counter,
        }
    }

    /// Boundary written by a reset. `previous_counter` is the highest number
    /// being invalidated.
    pub fn reset(previous_counter: u64) -> Self {
        Self {
            sequence_number: previous_counter,
            site_id: String::new(),
            partition_id: String::new(),
            invoice_type: None,
            operation: OperationKind::Reset,
            status: AuditStatus::Invalid,
            reason: Some("system reset".to_string()),
            description: format!("Invalidated sequence numbers through {previous_counter}"),
            request_id: None,
            gap_filled: false,
            global_counter: previous_counter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_upper_case_kinds() {
        let request = SequenceRequest::new("site-1", "a", "standard", 1).with_request_id("req-7");
        let event = AuditEvent::recover(3, &request, 9);
        let record = AuditRecord {
            audit_id: "0000000000001-00000001-node-1".to_string(),
            sequence_number: event.sequence_number,
            site_id: event.site_id,
            partition_id: event.partition_id,
            invoice_type: event.invoice_type,
            operation: event.operation,
            status: event.status,
            reason: event.reason,
            description: event.description,
            timestamp_millis: 1,
            request_id: event.request_id,
            node_id: "node-1".to_string(),
            instance_name: "Instance node-1".to_string(),
            gap_filled: event.gap_filled,
            global_counter: event.global_counter,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["operation"], "RECOVER");
        assert_eq!(json["status"], "RECOVERED");
        assert_eq!(json["requestId"], "req-7");
        assert!(json.get("reason").is_none());

        let decoded: AuditRecord = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn only_handed_out_statuses_are_active() {
        assert!(AuditStatus::Active.is_active());
        assert!(AuditStatus::Recovered.is_active());
        assert!(!AuditStatus::Released.is_active());
        assert!(!AuditStatus::Invalid.is_active());
    }
}
