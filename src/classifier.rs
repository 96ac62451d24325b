//! Operator lookup by MSISDN prefix.

use dispatch_error::ValidationError;

use crate::types::{Operator, QueueMessage};

const MSISDN_LEN: usize = 11;
const PREFIX_LEN: usize = 3;

/// Ordered prefix table; the first match wins.
const PREFIX_TABLE: &[(&str, Operator)] = &[
    ("017", Operator::Gp),
    ("018", Operator::Robi),
    ("016", Operator::Airtel),
];

/// Maps subscriber numbers to operators using a static prefix table.
#[derive(Debug, Clone)]
pub struct CarrierClassifier {
    table: &'static [(&'static str, Operator)],
}

impl Default for CarrierClassifier {
    fn default() -> Self {
        Self {
            table: PREFIX_TABLE,
        }
    }
}

impl CarrierClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an 11-digit local MSISDN.
    ///
    /// Both failure modes are permanent validation errors.
    pub fn classify(&self, msisdn: &str) -> Result<Operator, ValidationError> {
        if msisdn.len() != MSISDN_LEN || !msisdn.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidMsisdn);
        }

        let prefix = &msisdn[..PREFIX_LEN];
        self.table
            .iter()
            .find(|(p, _)| *p == prefix)
            .map(|(_, op)| *op)
            .ok_or_else(|| ValidationError::UnknownPrefix(prefix.to_string()))
    }

    /// Operator for a consumed message. The MSISDN is always validated; an
    /// explicit `mno` must name a known operator and overrides the prefix
    /// (ported numbers), an empty one is taken from the prefix.
    pub fn resolve(&self, msg: &QueueMessage) -> Result<Operator, ValidationError> {
        let by_prefix = self.classify(&msg.msisdn)?;
        if msg.mno.trim().is_empty() {
            Ok(by_prefix)
        } else {
            msg.mno.parse()
        }
    }
}
