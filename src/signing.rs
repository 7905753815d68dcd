use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex-encoded HMAC-SHA256 of `body` keyed with `secret`.
///
/// Signs the raw body bytes exactly as sent, with no timestamp or prefix.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received hex signature in constant time.
///
/// A leading `sha256=` is tolerated.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let signature_hex = signature_hex.trim();
    let signature_hex = signature_hex.strip_prefix("sha256=").unwrap_or(signature_hex);

    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&signature).is_ok()
}

/// Build the signature header for a delivery, if the webhook is signed.
pub fn signature_header(
    header_name: &str,
    secret: Option<&[u8]>,
    body: &[u8],
) -> Option<(String, String)> {
    let secret = secret?;
    Some((header_name.to_string(), compute_signature(secret, body)))
}

/// Find the signature header among a list of headers (case-insensitive).
pub fn parse_signature_header<'a, I>(headers: I, signature_header: &str) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(signature_header))
        .map(|(_, value)| value.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("signature header missing")]
    MissingSignature,
    #[error("signature does not match body")]
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    body: &[u8],
    secret: &[u8],
    signature_header: &str,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let signature = parse_signature_header(headers, signature_header)
        .ok_or(VerificationError::MissingSignature)?;

    if verify_signature(secret, body, &signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
