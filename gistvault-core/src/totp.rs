//! One-time codes (RFC 4226 HOTP and RFC 6238 TOTP) from `otpauth://` URIs.

use crate::{Result, VaultError};
use data_encoding::{BASE32, BASE32_NOPAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::str::FromStr;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

const DEFAULT_DIGITS: u8 = 6;
const DEFAULT_PERIOD: u32 = 30;

/// Counter source for the code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtpKind {
    /// Time-based; counter is `unix_time / period`.
    Totp,
    /// Event-based; counter is stored in the URI.
    Hotp,
}

/// HMAC algorithm named by the `algorithm` URI parameter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OtpAlgorithm {
    #[default]
    #[serde(rename = "sha1")]
    Sha1,
    #[serde(rename = "sha256")]
    Sha256,
    #[serde(rename = "sha512")]
    Sha512,
}

impl std::fmt::Display for OtpAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtpAlgorithm::Sha1 => write!(f, "SHA1"),
            OtpAlgorithm::Sha256 => write!(f, "SHA256"),
            OtpAlgorithm::Sha512 => write!(f, "SHA512"),
        }
    }
}

impl FromStr for OtpAlgorithm {
    type Err = VaultError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sha1" => Ok(OtpAlgorithm::Sha1),
            "sha256" => Ok(OtpAlgorithm::Sha256),
            "sha512" => Ok(OtpAlgorithm::Sha512),
            other => Err(invalid(format!(
                "Unsupported OTP algorithm '{}'. Use SHA1, SHA256 or SHA512.",
                other
            ))),
        }
    }
}

/// A code and how long it stays valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpCode {
    pub code: String,
    /// Seconds until rotation. `None` for HOTP, which only advances on use.
    pub seconds_remaining: Option<u32>,
}

/// Provisioning data parsed from an `otpauth://` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpAuthUri {
    pub kind: OtpKind,
    pub secret_base32: String,
    pub algorithm: OtpAlgorithm,
    pub digits: u8,
    pub period: u32,
    pub counter: u64,
    pub issuer: Option<String>,
    pub account_name: Option<String>,
}

impl OtpAuthUri {
    pub fn parse(uri: &str) -> Result<Self> {
        parse_otpauth_uri(uri)
    }

    /// Current code at `timestamp` (unix seconds). HOTP ignores the time.
    pub fn code_at(&self, timestamp: i64) -> Result<OtpCode> {
        match self.kind {
            OtpKind::Totp => Ok(OtpCode {
                code: generate_totp(
                    &self.secret_base32,
                    self.algorithm,
                    self.digits,
                    self.period,
                    timestamp,
                )?,
                seconds_remaining: Some(seconds_remaining(self.period, timestamp)),
            }),
            OtpKind::Hotp => Ok(OtpCode {
                code: generate_hotp(
                    &self.secret_base32,
                    self.algorithm,
                    self.digits,
                    self.counter,
                )?,
                seconds_remaining: None,
            }),
        }
    }

    /// Label shown next to a code: `issuer (account)` when both are known.
    pub fn label(&self) -> String {
        match (&self.issuer, &self.account_name) {
            (Some(issuer), Some(account)) => format!("{} ({})", issuer, account),
            (Some(issuer), None) => issuer.clone(),
            (None, Some(account)) => account.clone(),
            (None, None) => String::new(),
        }
    }
}

/// Parse an `otpauth://totp/...` or `otpauth://hotp/...` URI.
pub fn parse_otpauth_uri(uri: &str) -> Result<OtpAuthUri> {
    let trimmed = uri.trim();
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| invalid("OTP URI must start with otpauth://"))?;
    if !scheme.eq_ignore_ascii_case("otpauth") {
        return Err(invalid("OTP URI must start with otpauth://"));
    }

    let (kind_raw, remainder) = rest
        .split_once('/')
        .ok_or_else(|| invalid("Invalid otpauth URI format"))?;
    let kind = match kind_raw.to_ascii_lowercase().as_str() {
        "totp" => OtpKind::Totp,
        "hotp" => OtpKind::Hotp,
        other => return Err(invalid(format!("Unsupported OTP type '{}'", other))),
    };

    let (label_raw, query_raw) = remainder.split_once('?').unwrap_or((remainder, ""));

    let label = percent_decode(label_raw)?;
    let (issuer_from_label, account_name) = match label.split_once(':') {
        Some((issuer, account)) => (non_empty(issuer), non_empty(account)),
        None => (None, non_empty(&label)),
    };

    let mut secret = None;
    let mut issuer_from_query = None;
    let mut algorithm = OtpAlgorithm::default();
    let mut digits = DEFAULT_DIGITS;
    let mut period = DEFAULT_PERIOD;
    let mut counter = None;

    for pair in query_raw.split('&').filter(|part| !part.is_empty()) {
        let (key_raw, value_raw) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode(key_raw)?.to_ascii_lowercase();
        let value = percent_decode(value_raw)?;
        if value.trim().is_empty() {
            continue;
        }

        match key.as_str() {
            "secret" => secret = Some(value),
            "issuer" => issuer_from_query = non_empty(&value),
            "algorithm" => algorithm = value.parse()?,
            "digits" => {
                digits = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid("OTP digits must be numeric"))?
            }
            "period" => {
                period = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid("OTP period must be numeric"))?
            }
            "counter" => {
                counter = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|_| invalid("HOTP counter must be numeric"))?,
                )
            }
            _ => {}
        }
    }

    check_digits(digits)?;
    if period == 0 {
        return Err(invalid("OTP period must be greater than 0"));
    }
    if kind == OtpKind::Hotp && counter.is_none() {
        return Err(invalid("HOTP URI is missing counter parameter"));
    }

    let secret = secret.ok_or_else(|| invalid("OTP URI is missing secret parameter"))?;
    let secret = normalize_secret(&secret)?;

    if let (Some(label_issuer), Some(query_issuer)) = (&issuer_from_label, &issuer_from_query) {
        if !label_issuer.eq_ignore_ascii_case(query_issuer) {
            return Err(invalid(
                "Issuer in label does not match issuer query parameter",
            ));
        }
    }

    Ok(OtpAuthUri {
        kind,
        secret_base32: secret,
        algorithm,
        digits,
        period,
        counter: counter.unwrap_or(0),
        issuer: issuer_from_query.or(issuer_from_label),
        account_name,
    })
}

/// RFC 4226 code for `counter`.
pub fn generate_hotp(
    secret_base32: &str,
    algorithm: OtpAlgorithm,
    digits: u8,
    counter: u64,
) -> Result<String> {
    check_digits(digits)?;

    let secret = decode_secret(secret_base32)?;
    let digest = hmac_digest(algorithm, &secret, &counter.to_be_bytes())?;

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    let code = binary % 10u32.pow(digits as u32);
    Ok(format!("{:0width$}", code, width = digits as usize))
}

/// RFC 6238 code at `timestamp` (unix seconds).
pub fn generate_totp(
    secret_base32: &str,
    algorithm: OtpAlgorithm,
    digits: u8,
    period: u32,
    timestamp: i64,
) -> Result<String> {
    if period == 0 {
        return Err(invalid("OTP period must be greater than 0"));
    }
    let counter = (timestamp.max(0) as u64) / period as u64;
    generate_hotp(secret_base32, algorithm, digits, counter)
}

/// Seconds until the next TOTP rotation.
pub fn seconds_remaining(period: u32, timestamp: i64) -> u32 {
    if period == 0 {
        return 0;
    }
    let elapsed = timestamp.rem_euclid(period as i64) as u32;
    period - elapsed
}

fn hmac_digest(algorithm: OtpAlgorithm, key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let bad_key = |_| invalid("Invalid OTP secret");
    let digest = match algorithm {
        OtpAlgorithm::Sha1 => {
            let mut mac = HmacSha1::new_from_slice(key).map_err(bad_key)?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        OtpAlgorithm::Sha256 => {
            let mut mac = HmacSha256::new_from_slice(key).map_err(bad_key)?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        OtpAlgorithm::Sha512 => {
            let mut mac = HmacSha512::new_from_slice(key).map_err(bad_key)?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
    };
    Ok(digest)
}

fn check_digits(digits: u8) -> Result<()> {
    if !(6..=8).contains(&digits) {
        return Err(invalid("OTP digits must be between 6 and 8"));
    }
    Ok(())
}

fn normalize_secret(secret_base32: &str) -> Result<String> {
    let normalized = secret_base32
        .trim()
        .replace([' ', '-'], "")
        .trim_end_matches('=')
        .to_ascii_uppercase();

    if normalized.is_empty() {
        return Err(invalid("OTP secret cannot be empty"));
    }

    decode_secret(&normalized)?;
    Ok(normalized)
}

fn decode_secret(secret_base32: &str) -> Result<Vec<u8>> {
    let normalized = secret_base32
        .trim()
        .replace([' ', '-'], "")
        .to_ascii_uppercase();

    let decoded = BASE32_NOPAD
        .decode(normalized.as_bytes())
        .or_else(|_| BASE32.decode(normalized.as_bytes()))
        .map_err(|_| invalid("OTP secret must be valid base32"))?;

    if decoded.is_empty() {
        return Err(invalid("OTP secret cannot decode to empty bytes"));
    }
    Ok(decoded)
}

fn percent_decode(input: &str) -> Result<String> {
    fn hex(byte: u8) -> Option<u8> {
        (byte as char).to_digit(16).map(|d| d as u8)
    }

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let pair = bytes
                    .get(i + 1)
                    .copied()
                    .and_then(hex)
                    .zip(bytes.get(i + 2).copied().and_then(hex));
                let (hi, lo) =
                    pair.ok_or_else(|| invalid("Invalid percent encoding in OTP URI"))?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8(out).map_err(|_| invalid("OTP URI contains invalid UTF-8"))
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn invalid(message: impl Into<String>) -> VaultError {
    VaultError::InvalidInput(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_SHA1: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_rfc4226_hotp_vectors() {
        assert_eq!(generate_hotp(RFC_SHA1, OtpAlgorithm::Sha1, 6, 0).unwrap(), "755224");
        assert_eq!(generate_hotp(RFC_SHA1, OtpAlgorithm::Sha1, 6, 9).unwrap(), "520489");
    }

    #[test]
    fn test_rfc6238_vectors() {
        assert_eq!(
            generate_totp(RFC_SHA1, OtpAlgorithm::Sha1, 8, 30, 59).unwrap(),
            "94287082"
        );
        assert_eq!(
            generate_totp(RFC_SHA1, OtpAlgorithm::Sha1, 8, 30, 1_111_111_109).unwrap(),
            "07081804"
        );

        let sha256 = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZA";
        assert_eq!(
            generate_totp(sha256, OtpAlgorithm::Sha256, 8, 30, 59).unwrap(),
            "46119246"
        );

        let sha512 = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQGEZDGNA";
        assert_eq!(
            generate_totp(sha512, OtpAlgorithm::Sha512, 8, 30, 59).unwrap(),
            "90693936"
        );
        assert_eq!(
            generate_totp(sha512, OtpAlgorithm::Sha512, 8, 30, 1_111_111_109).unwrap(),
            "25091201"
        );
    }

    #[test]
    fn test_seconds_remaining() {
        assert_eq!(seconds_remaining(30, 59), 1);
        assert_eq!(seconds_remaining(30, 60), 30);
        assert_eq!(seconds_remaining(30, 0), 30);
    }

    #[test]
    fn test_parse_totp_uri_with_all_fields() {
        let parsed = OtpAuthUri::parse(
            "otpauth://totp/Acme:alice%40example.com?secret=JBSWY3DPEHPK3PXP&issuer=Acme&algorithm=SHA512&digits=8&period=45",
        )
        .unwrap();

        assert_eq!(parsed.kind, OtpKind::Totp);
        assert_eq!(parsed.secret_base32, "JBSWY3DPEHPK3PXP");
        assert_eq!(parsed.algorithm, OtpAlgorithm::Sha512);
        assert_eq!(parsed.digits, 8);
        assert_eq!(parsed.period, 45);
        assert_eq!(parsed.label(), "Acme (alice@example.com)");
    }

    #[test]
    fn test_parse_defaults() {
        let parsed = OtpAuthUri::parse("otpauth://totp/alice?secret=jbswy3dpehpk3pxp").unwrap();
        assert_eq!(parsed.algorithm, OtpAlgorithm::Sha1);
        assert_eq!(parsed.digits, 6);
        assert_eq!(parsed.period, 30);
        assert_eq!(parsed.secret_base32, "JBSWY3DPEHPK3PXP");
        assert_eq!(parsed.issuer, None);
    }

    #[test]
    fn test_hotp_uri_uses_counter() {
        let parsed =
            OtpAuthUri::parse("otpauth://hotp/Acme:bob?secret=JBSWY3DPEHPK3PXP&counter=0").unwrap();
        assert_eq!(parsed.kind, OtpKind::Hotp);

        let code = parsed.code_at(1_700_000_000).unwrap();
        assert_eq!(code.code, "282760");
        assert_eq!(code.seconds_remaining, None);
    }

    #[test]
    fn test_seven_digit_codes() {
        assert_eq!(
            generate_hotp("JBSWY3DPEHPK3PXP", OtpAlgorithm::Sha1, 7, 1).unwrap(),
            "1996554"
        );
    }

    #[test]
    fn test_rejects_bad_uris() {
        for uri in [
            "https://totp/x?secret=JBSWY3DPEHPK3PXP",
            "otpauth://steam/x?secret=JBSWY3DPEHPK3PXP",
            "otpauth://hotp/x?secret=JBSWY3DPEHPK3PXP",
            "otpauth://totp/x",
            "otpauth://totp/x?secret=JBSWY3DPEHPK3PXP&digits=9",
            "otpauth://totp/x?secret=JBSWY3DPEHPK3PXP&period=0",
            "otpauth://totp/x?secret=not*base32",
            "otpauth://totp/Acme:x?secret=JBSWY3DPEHPK3PXP&issuer=Other",
        ] {
            assert!(
                matches!(parse_otpauth_uri(uri), Err(VaultError::InvalidInput(_))),
                "{} should be rejected",
                uri
            );
        }
    }
}
