//! EBO (EcoStruxure Building Operation) WebStation adapter.
//!
//! Challenge-digest login: SHA-256 over username + domain + password +
//! login path + server nonce, with the password additionally shipped under
//! RSA-OAEP + AES-128-CBC when the transport is HTTPS. Live values come
//! through a subscription: created once over all configured paths, then
//! polled by handle; any subscription failure drops the handle so the next
//! read recreates it. Subscription values arrive as IEEE-754 doubles in hex
//! strings and are decoded at this boundary.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use log::{debug, info, warn};
use rand::RngCore;
use rsa::{BigUint, Oaep, RsaPublicKey, pkcs8::DecodePublicKey};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{AUTH_TIMEOUT, BmsError};
use crate::entity::Credentials;

const LOGIN_PATH: &str = "webstation/vp/Login";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream login error codes worth a readable message.
fn login_error_message(code: i64) -> Option<&'static str> {
    match code {
        131073 => Some("Wrong domain, username, or password"),
        131077 => Some("User account has expired"),
        131094 => Some("A user is already logged on"),
        1048592 => Some("No valid client license"),
        _ => None,
    }
}

pub struct EboClient {
    agent: ureq::Agent,
    base_url: String,
    username: String,
    password: String,
    domain: String,
    csrf_token: Option<String>,
    session_token: Option<String>,
    rsa_public_key: Option<Value>,
    subscription_handle: Option<Value>,
    subscription_paths: Vec<String>,
}

impl EboClient {
    pub fn new(base_url: &str, credentials: &Credentials) -> EboClient {
        EboClient {
            agent: ureq::AgentBuilder::new().timeout(Duration::from_secs(60)).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            domain: credentials.domain.clone(),
            csrf_token: None,
            session_token: None,
            rsa_public_key: None,
            subscription_handle: None,
            subscription_paths: Vec::new(),
        }
    }

    /// Full SxWDigest flow: CSRF token, challenge nonce, login settings,
    /// digest login, WebEntry session init.
    pub fn authenticate(&mut self) -> Result<(), BmsError> {
        debug!("EBO login to {}", self.base_url);

        // A fresh session invalidates any old subscription handle.
        self.subscription_handle = None;

        self.fetch_csrf_token()?;
        let challenge = self.fetch_challenge()?;
        self.fetch_login_settings()?;
        let token = self.authorize(&challenge)?;
        self.session_token = Some(token);

        // WebEntry initializes server-side session state.
        self.post_command(json!({
            "command": "WebEntry",
            "clientLanguage": "sv-SE",
            "clientLocale": "sv-SE",
            "clientSystemOfMeasurement": 0,
        }))?;

        info!("EBO login ok: {}", self.base_url);
        Ok(())
    }

    fn fetch_csrf_token(&mut self) -> Result<(), BmsError> {
        let html = self
            .agent
            .get(&self.base_url)
            .timeout(AUTH_TIMEOUT)
            .call()
            .map_err(http_error)?
            .into_string()
            .map_err(|e| BmsError::Protocol(format!("login page read failed: {}", e)))?;

        let token = extract_csrf(&html)
            .ok_or_else(|| BmsError::Protocol("no CSRF token in login page".to_string()))?;
        self.csrf_token = Some(token);
        Ok(())
    }

    fn fetch_challenge(&self) -> Result<String, BmsError> {
        let body: Value = self
            .agent
            .post(&format!("{}/vp/Challenge", self.base_url))
            .timeout(AUTH_TIMEOUT)
            .set("X-CSRF-Token", self.csrf_token.as_deref().unwrap_or(""))
            .send_bytes(b"")
            .map_err(http_error)?
            .into_json()
            .map_err(|e| BmsError::Protocol(format!("challenge parse failed: {}", e)))?;

        body.get("challenge")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BmsError::Protocol(format!("no challenge in response: {}", body)))
    }

    fn fetch_login_settings(&mut self) -> Result<(), BmsError> {
        let body: Value = self
            .agent
            .post(&format!("{}/webstation/LoginSettings", self.base_url))
            .timeout(AUTH_TIMEOUT)
            .set("X-CSRF-Token", self.csrf_token.as_deref().unwrap_or(""))
            .send_bytes(b"")
            .map_err(http_error)?
            .into_json()
            .map_err(|e| BmsError::Protocol(format!("login settings parse failed: {}", e)))?;

        let settings = body.get("LoginSettings").unwrap_or(&body);
        self.rsa_public_key = settings
            .get("publicKey")
            .or_else(|| settings.get("PublicKey"))
            .cloned();
        Ok(())
    }

    fn authorize(&mut self, challenge: &str) -> Result<String, BmsError> {
        let digest_input = format!(
            "{}{}{}/{}{}",
            self.username, self.domain, self.password, LOGIN_PATH, challenge
        );
        let digest = hex::encode(Sha256::digest(digest_input.as_bytes()));

        let mut params = vec![
            format!("UID={}", percent_encode(&self.username)),
            format!("DOM={}", percent_encode(&self.domain)),
            format!("NV={}", challenge),
            format!("DIG={}", digest),
        ];

        if self.base_url.starts_with("https") && !self.password.is_empty() {
            if let Some(key) = self.rsa_public_key.clone() {
                match encrypt_password(&self.password, &key) {
                    Ok(mut encrypted) => params.append(&mut encrypted),
                    Err(e) => warn!("EBO password encryption skipped: {}", e),
                }
            }
        }

        let auth_header = format!("SxWDigest {}", params.join(","));

        let body: Value = self
            .agent
            .post(&format!("{}/{}", self.base_url, LOGIN_PATH))
            .timeout(AUTH_TIMEOUT)
            .set("Authorization", &auth_header)
            .set("X-CSRF-Token", self.csrf_token.as_deref().unwrap_or(""))
            .send_bytes(b"")
            .map_err(http_error)?
            .into_json()
            .map_err(|e| BmsError::Protocol(format!("login response parse failed: {}", e)))?;

        // Errors come back in the body: {"ErrMsg": "...", "ErrorCode": "131073"}.
        let error_code = body
            .get("ErrorCode")
            .or_else(|| body.get("errorCode"))
            .and_then(|v| v.as_str().and_then(|s| s.parse::<i64>().ok()).or(v.as_i64()))
            .unwrap_or(0);
        let status_false = body.get("Status").and_then(|v| v.as_str()) == Some("false");

        if error_code != 0 || status_false {
            let detail = login_error_message(error_code)
                .map(|m| format!("{} (code {})", m, error_code))
                .unwrap_or_else(|| format!("code {}", error_code));
            let err_msg = body.get("ErrMsg").and_then(|v| v.as_str()).unwrap_or("login failed");
            return match error_code {
                131073 | 131077 | 1048592 => {
                    Err(BmsError::AuthPermanent(format!("{}: {}", err_msg, detail)))
                }
                _ => Err(BmsError::Auth(format!("{}: {}", err_msg, detail))),
            };
        }

        body.get("token")
            .or_else(|| body.get("Token"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BmsError::Protocol(format!("no session token in login response: {}", body)))
    }

    fn post_command(&self, command: Value) -> Result<Value, BmsError> {
        let token = self
            .session_token
            .as_deref()
            .ok_or_else(|| BmsError::Auth("not logged in".to_string()))?;

        self.agent
            .post(&format!("{}/json/POST", self.base_url))
            .timeout(COMMAND_TIMEOUT)
            .set("X-CSRF-Token", token)
            .set("Content-Type", "application/json; charset=utf-8")
            .send_json(command)
            .map_err(http_error)?
            .into_json()
            .map_err(|e| BmsError::Protocol(format!("command response parse failed: {}", e)))
    }

    /// Subscription-backed bulk read: create on first call, poll by handle
    /// afterwards. Any failure clears the handle for a clean retry.
    pub fn read_current_values(
        &mut self,
        signals: &BTreeMap<String, (String, String)>,
    ) -> Result<BTreeMap<String, f64>, BmsError> {
        if self.session_token.is_none() {
            self.authenticate()?;
        }

        let paths: Vec<String> = signals.values().map(|(id, _)| id.clone()).collect();
        if paths.is_empty() {
            return Ok(BTreeMap::new());
        }
        // A live edit to the signal map needs a fresh subscription.
        if paths != self.subscription_paths {
            self.subscription_handle = None;
            self.subscription_paths = paths.clone();
        }

        let items = match self.poll_subscription(&paths) {
            Ok(items) => items,
            Err(e) => {
                self.subscription_handle = None;
                return Err(e);
            }
        };

        let mut by_path: BTreeMap<String, f64> = BTreeMap::new();
        for (position, item) in items.iter().enumerate() {
            let index = item
                .get("index")
                .and_then(|v| v.as_u64())
                .map(|i| i as usize)
                .unwrap_or(position);
            let Some(path) = paths.get(index) else { continue };
            let Some(value) = item
                .get("property")
                .and_then(|p| p.get("value"))
                .and_then(decode_subscription_value)
            else {
                continue;
            };
            by_path.insert(path.clone(), value);
        }

        let mut values = BTreeMap::new();
        for (signal_id, field_name) in signals.values() {
            if let Some(value) = by_path.get(signal_id) {
                values.insert(field_name.clone(), *value);
            }
        }
        Ok(values)
    }

    fn poll_subscription(&mut self, paths: &[String]) -> Result<Vec<Value>, BmsError> {
        let response = match &self.subscription_handle {
            None => {
                debug!("EBO creating subscription over {} path(s)", paths.len());
                let response = self.post_command(json!({
                    "command": "CreateSubscription",
                    "propertyPaths": paths,
                }))?;
                self.subscription_handle = response.get("handle").cloned().filter(|h| !h.is_null());
                if self.subscription_handle.is_none() {
                    return Err(BmsError::Protocol("subscription create returned no handle".to_string()));
                }
                response
            }
            Some(handle) => self.post_command(json!({
                "command": "ReadSubscription",
                "handle": handle,
            }))?,
        };

        Ok(response
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub fn close(&mut self) {
        self.subscription_handle = None;
        self.session_token = None;
        self.csrf_token = None;
    }
}

fn http_error(error: ureq::Error) -> BmsError {
    match error {
        ureq::Error::Status(401, _) => BmsError::Auth("http 401".to_string()),
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_else(|_| String::from("<no body>"));
            BmsError::Http { status, message: body }
        }
        ureq::Error::Transport(t) => BmsError::Transport(t.to_string()),
    }
}

/// Pull the CSRF token out of the login page's hidden input, whichever
/// attribute order the server renders.
fn extract_csrf(html: &str) -> Option<String> {
    let marker = html.find("id=\"csrf\"")?;
    let tag_start = html[..marker].rfind('<')?;
    let tag_end = marker + html[marker..].find('>')?;
    let tag = &html[tag_start..tag_end];
    let value_start = tag.find("value=\"")? + 7;
    let value_end = tag[value_start..].find('"')? + value_start;
    Some(tag[value_start..value_end].to_string())
}

/// Decode a subscription property value. Hex-encoded IEEE-754 doubles are
/// the wire format for analog values; digitals arrive as plain numbers or
/// booleans.
fn decode_subscription_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => decode_hex_double(s),
        _ => None,
    }
}

/// "0x405b6f7ce3333333" -> 109.742..., None for anything that is not a
/// 64-bit hex float.
fn decode_hex_double(text: &str) -> Option<f64> {
    let hex_digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))?;
    let bits = u64::from_str_radix(hex_digits, 16).ok()?;
    Some(f64::from_bits(bits))
}

/// Hybrid password transport: AES-128-CBC over the base64-encoded password,
/// AES key wrapped with RSA-OAEP(SHA-1). Returns the BB8/C3PO/R2D2 params.
fn encrypt_password(password: &str, key_data: &Value) -> Result<Vec<String>, String> {
    use aes::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    let password_b64 = STANDARD.encode(password.as_bytes());

    let mut aes_key = [0u8; 16];
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut aes_key);
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes128CbcEnc::new(&aes_key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(password_b64.as_bytes());

    let rsa_key = import_rsa_key(key_data)?;
    let wrapped_key = rsa_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<sha1::Sha1>(), &aes_key)
        .map_err(|e| format!("RSA wrap failed: {}", e))?;

    Ok(vec![
        format!("BB8={}", STANDARD.encode(&ciphertext)),
        format!("C3PO={}", STANDARD.encode(&wrapped_key)),
        format!("R2D2={}", STANDARD.encode(iv)),
    ])
}

/// Import the server's RSA public key from JWK (n/e), PEM, or base64 DER.
fn import_rsa_key(key_data: &Value) -> Result<RsaPublicKey, String> {
    match key_data {
        Value::Object(jwk) => {
            let n = jwk.get("n").and_then(|v| v.as_str()).ok_or("JWK missing n")?;
            let e = jwk.get("e").and_then(|v| v.as_str()).ok_or("JWK missing e")?;
            let n_bytes = URL_SAFE_NO_PAD
                .decode(n.trim_end_matches('='))
                .map_err(|e| format!("JWK n decode failed: {}", e))?;
            let e_bytes = URL_SAFE_NO_PAD
                .decode(e.trim_end_matches('='))
                .map_err(|e| format!("JWK e decode failed: {}", e))?;
            RsaPublicKey::new(BigUint::from_bytes_be(&n_bytes), BigUint::from_bytes_be(&e_bytes))
                .map_err(|e| format!("invalid JWK key: {}", e))
        }
        Value::String(text) if text.starts_with("-----") => {
            RsaPublicKey::from_public_key_pem(text).map_err(|e| format!("PEM import failed: {}", e))
        }
        Value::String(text) => {
            let der = STANDARD
                .decode(text)
                .map_err(|e| format!("DER decode failed: {}", e))?;
            RsaPublicKey::from_public_key_der(&der).map_err(|e| format!("DER import failed: {}", e))
        }
        other => Err(format!("unsupported RSA key format: {}", other)),
    }
}

fn percent_encode(text: &str) -> String {
    let mut encoded = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_double_round_trip() {
        let value: f64 = 109.74299999999999;
        let encoded = format!("0x{:016x}", value.to_bits());
        assert_eq!(decode_hex_double(&encoded), Some(value));
        assert_eq!(decode_hex_double("21.5"), None);
        assert_eq!(decode_hex_double("0xZZZZ"), None);
    }

    #[test]
    fn subscription_values_decode_by_type() {
        assert_eq!(decode_subscription_value(&json!(21.5)), Some(21.5));
        assert_eq!(decode_subscription_value(&json!(true)), Some(1.0));
        let hex = format!("0x{:016x}", (45.0f64).to_bits());
        assert_eq!(decode_subscription_value(&json!(hex)), Some(45.0));
        assert_eq!(decode_subscription_value(&json!(null)), None);
    }

    #[test]
    fn csrf_extraction_handles_both_attribute_orders() {
        let html = r#"<html><input type="hidden" id="csrf" value=":01000000abcdef"></html>"#;
        assert_eq!(extract_csrf(html).as_deref(), Some(":01000000abcdef"));

        let html = r#"<html><input value=":9900ff" type="hidden" id="csrf"></html>"#;
        assert_eq!(extract_csrf(html).as_deref(), Some(":9900ff"));

        assert_eq!(extract_csrf("<html>no token here</html>"), None);
    }

    #[test]
    fn digest_is_deterministic_and_nonce_sensitive() {
        let input_a = format!("user{}{}/{}{}", "", "pass", LOGIN_PATH, "nonce1");
        let input_b = format!("user{}{}/{}{}", "", "pass", LOGIN_PATH, "nonce2");
        let digest_a = hex::encode(Sha256::digest(input_a.as_bytes()));
        let digest_b = hex::encode(Sha256::digest(input_b.as_bytes()));
        assert_eq!(digest_a.len(), 64);
        assert_ne!(digest_a, digest_b);
        assert_eq!(digest_a, hex::encode(Sha256::digest(input_a.as_bytes())));
    }

    #[test]
    fn percent_encoding_covers_spaces_and_unicode() {
        assert_eq!(percent_encode("Ulf Andersson"), "Ulf%20Andersson");
        assert_eq!(percent_encode("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(percent_encode("å"), "%C3%A5");
    }

    #[test]
    fn login_error_codes_map_to_messages() {
        assert!(login_error_message(131073).unwrap().contains("Wrong domain"));
        assert!(login_error_message(1048592).unwrap().contains("license"));
        assert!(login_error_message(42).is_none());
    }

    #[test]
    fn jwk_key_import() {
        // 2048-bit JWK with the common exponent; n is any well-formed value.
        let n_bytes = vec![0xafu8; 256];
        let jwk = json!({
            "kty": "RSA",
            "n": URL_SAFE_NO_PAD.encode(&n_bytes),
            "e": URL_SAFE_NO_PAD.encode([0x01, 0x00, 0x01]),
        });
        let key = import_rsa_key(&jwk);
        assert!(key.is_ok(), "{key:?}");
    }

    #[test]
    fn password_encryption_emits_three_params() {
        let n_bytes = vec![0xafu8; 256];
        let jwk = json!({
            "n": URL_SAFE_NO_PAD.encode(&n_bytes),
            "e": URL_SAFE_NO_PAD.encode([0x01, 0x00, 0x01]),
        });
        let params = encrypt_password("hemligt", &jwk).unwrap();
        assert_eq!(params.len(), 3);
        assert!(params[0].starts_with("BB8="));
        assert!(params[1].starts_with("C3PO="));
        assert!(params[2].starts_with("R2D2="));
    }
}
