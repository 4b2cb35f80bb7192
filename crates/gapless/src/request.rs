use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A request for `count` sequence numbers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRequest {
    pub site_id: String,
    pub partition_id: String,
    pub invoice_type: String,
    pub count: u32,
    /// Caller-supplied trace id. One is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl SequenceRequest {
    pub fn new(
        site_id: impl Into<String>,
        partition_id: impl Into<String>,
        invoice_type: impl Into<String>,
        count: u32,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            partition_id: partition_id.into(),
            invoice_type: invoice_type.into(),
            count,
            request_id: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Checks the request shape without touching any shared state.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if an identifier is blank or `count` is
    /// outside `1..=max_batch`.
    pub fn validate(&self, max_batch: u32) -> Result<()> {
        for (field, value) in [
            ("siteId", &self.site_id),
            ("partitionId", &self.partition_id),
            ("invoiceType", &self.invoice_type),
        ] {
            if value.trim().is_empty() {
                return Err(Error::invalid_request(format!("{field} is required")));
            }
        }
        if self.count == 0 {
            return Err(Error::invalid_request("count must be positive"));
        }
        if self.count > max_batch {
            return Err(Error::invalid_request(format!(
                "count {} exceeds the batch limit of {max_batch}",
                self.count
            )));
        }
        Ok(())
    }

    /// Assigns a `req-<millis>-<hex>` id if the caller did not supply one.
    pub(crate) fn ensure_request_id(&mut self, now_millis: u64) -> &str {
        self.request_id
            .get_or_insert_with(|| format!("req-{now_millis}-{:04x}", rand::random::<u16>()))
    }
}

/// A successful allocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceResponse {
    /// Allocated numbers, strictly increasing.
    pub numbers: Vec<u64>,
    /// Whether at least one number came from the gap pool.
    pub gap_filled: bool,
    /// The counter after this allocation: the end of the generated range if
    /// the counter advanced, otherwise the last value this instance saw.
    pub counter_value: u64,
    pub request_id: String,
    pub node_id: String,
    pub processing_time_ms: u64,
}
