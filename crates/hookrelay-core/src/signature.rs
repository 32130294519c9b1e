//! Payload canonicalization and HMAC-SHA256 signatures.
//!
//! Senders sign the canonical JSON form of the request body:
//! - object keys sorted by code point
//! - `,` and `:` separators with no surrounding whitespace
//! - characters outside printable ASCII escaped as `\uXXXX` (surrogate pairs
//!   above the BMP)
//!
//! The same canonical bytes are signed when relaying the event to the
//! subscriber, so a receiver can verify with the identical routine.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{RelayError, RelayResult};
use crate::types::Subscription;

type HmacSha256 = Hmac<Sha256>;

/// Name of the inbound signature header.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Encode a JSON value into its canonical byte form.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_value(&mut out, value);
    out.into_bytes()
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Sorted explicitly: serde_json's map order depends on the
            // `preserve_order` feature, which any crate in the graph may enable.
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, item);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 || (c as u32) > 0x7e => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn mac_for(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length")
}

/// Sign a payload with HMAC-SHA256, returning lowercase hex.
pub fn sign(secret: &[u8], payload: &Value) -> String {
    let mut mac = mac_for(secret);
    mac.update(&canonicalize(payload));
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature over the canonical payload in constant time.
pub fn verify(secret: &[u8], payload: &Value, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(&canonicalize(payload));
    mac.verify_slice(&signature).is_ok()
}

/// Verify an inbound payload against a subscription's secret.
///
/// Subscriptions without a secret reject every request.
pub fn verify_for_subscription(
    subscription: &Subscription,
    payload: &Value,
    signature: Option<&str>,
) -> RelayResult<()> {
    let signature = signature
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(RelayError::missing_signature)?;

    let secret = subscription
        .secret_key
        .as_deref()
        .ok_or_else(|| RelayError::missing_secret(&subscription.id))?;

    if verify(secret.as_bytes(), payload, signature) {
        Ok(())
    } else {
        Err(RelayError::authentication("Invalid signature"))
    }
}
