// ─────────────────────────────────────────────────────────────────────────────
// signing.rs — HMAC-SHA256 request signing
//
// Ground truth: analyst/adapters/binance.py BinanceAdapter._get_signature.
// Replaces the teacher's EIP-712/wallet signing wholesale — a centralized
// exchange signs URL-encoded request params with a shared secret, it does
// not sign typed structured data with a wallet key.
// ─────────────────────────────────────────────────────────────────────────────
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs the URL-encoded parameter string and returns the hex digest to be
/// appended as `signature=`.
pub fn sign_params(secret_key: &str, encoded_params: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret_key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(encoded_params.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Builds the URL-encoded query string from ordered key/value pairs, the way
/// Python's `urlencode(params)` does for a dict (insertion order preserved).
pub fn urlencode(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding_value(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn urlencoding_value(v: &str) -> String {
    url::form_urlencoded::byte_serialize(v.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_params_is_deterministic_hex() {
        let sig = sign_params("secret", "symbol=BTCUSDT&timestamp=1000");
        // HMAC-SHA256 is deterministic for fixed key+message; just assert
        // shape and stability across calls.
        let sig2 = sign_params("secret", "symbol=BTCUSDT&timestamp=1000");
        assert_eq!(sig, sig2);
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        let a = sign_params("secret-a", "x=1");
        let b = sign_params("secret-b", "x=1");
        assert_ne!(a, b);
    }

    #[test]
    fn urlencode_joins_pairs_with_ampersand_preserving_order() {
        let params = vec![("symbol", "BTCUSDT".to_string()), ("timestamp", "1000".to_string())];
        assert_eq!(urlencode(&params), "symbol=BTCUSDT&timestamp=1000");
    }
}
