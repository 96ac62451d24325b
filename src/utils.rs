use sha2::{Digest, Sha256};

/// Masks a subscriber number for logs, keeping the operator prefix and the
/// last four digits: `01812345678` -> `018****5678`.
pub fn mask_msisdn(msisdn: &str) -> String {
    let len = msisdn.chars().count();
    if len <= 7 {
        return "*".repeat(len);
    }
    msisdn
        .chars()
        .enumerate()
        .map(|(i, c)| if i < 3 || i >= len - 4 { c } else { '*' })
        .collect()
}

/// Hides userinfo in a connection URL: `amqp://user:pw@host` -> `amqp://***@host`.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at_pos)) if at_pos > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at_pos..])
        }
        _ => url.to_string(),
    }
}

/// Short stable fingerprint of a payload, used when no message id can be decoded.
pub fn body_fingerprint(body: &[u8]) -> String {
    let hash = Sha256::digest(body);

    // First 8 bytes are enough to key a retry counter
    hex::encode(&hash[..8])
}
