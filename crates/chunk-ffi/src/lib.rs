//! C-callable JSON shim over the AES-GCM chunk primitives.
//!
//! Consumers in other languages call [`encrypt_chunk`] and
//! [`decrypt_chunk`] with a JSON document in a NUL-terminated C string and
//! receive a JSON document back. Binary fields travel base64-encoded, the
//! way `encoding/json` renders byte arrays, so existing callers keep
//! working unchanged. Failures are reported through the `Error` envelope
//! instead of aborting the process.
//!
//! Returned strings are allocated by this library; callers must release
//! them with [`free_chunk_response`].

use std::ffi::{c_char, CStr, CString};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use blockstore::crypto::AeadCodec;

/// Error envelope carried in every response document.
#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "Code")]
    code: i32,
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, Deserialize)]
struct EncryptChunkArgs {
    #[serde(rename = "Data")]
    data: String,
    #[serde(rename = "Key")]
    key: String,
}

#[derive(Debug, Default, Serialize)]
struct EncryptChunkReturn {
    #[serde(rename = "CipherText")]
    cipher_text: Option<String>,
    #[serde(rename = "Nonce")]
    nonce: Option<String>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEnvelope>,
}

#[derive(Debug, Deserialize)]
struct DecryptChunkArgs {
    #[serde(rename = "CipherText")]
    cipher_text: String,
    #[serde(rename = "Nonce")]
    nonce: String,
    #[serde(rename = "Key")]
    key: String,
}

#[derive(Debug, Default, Serialize)]
struct DecryptChunkReturn {
    #[serde(rename = "PlainText")]
    plain_text: Option<String>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEnvelope>,
}

fn encrypt_chunk_json(request: &str) -> EncryptChunkReturn {
    let fail = |message: String| EncryptChunkReturn {
        error: Some(ErrorEnvelope { code: 1, message }),
        ..Default::default()
    };

    let args: EncryptChunkArgs = match serde_json::from_str(request) {
        Ok(args) => args,
        Err(e) => return fail(format!("invalid request document: {e}")),
    };
    let data = match STANDARD.decode(&args.data) {
        Ok(data) => data,
        Err(e) => return fail(format!("invalid data encoding: {e}")),
    };
    let key = match STANDARD.decode(&args.key) {
        Ok(key) => key,
        Err(e) => return fail(format!("invalid key encoding: {e}")),
    };

    let codec = match AeadCodec::new(&key) {
        Ok(codec) => codec,
        Err(e) => return fail(e.to_string()),
    };
    match codec.seal(&data) {
        Ok((nonce, cipher_text)) => EncryptChunkReturn {
            cipher_text: Some(STANDARD.encode(cipher_text)),
            nonce: Some(STANDARD.encode(nonce)),
            error: None,
        },
        Err(e) => fail(e.to_string()),
    }
}

fn decrypt_chunk_json(request: &str) -> DecryptChunkReturn {
    let fail = |message: String| DecryptChunkReturn {
        error: Some(ErrorEnvelope { code: 1, message }),
        ..Default::default()
    };

    let args: DecryptChunkArgs = match serde_json::from_str(request) {
        Ok(args) => args,
        Err(e) => return fail(format!("invalid request document: {e}")),
    };
    let cipher_text = match STANDARD.decode(&args.cipher_text) {
        Ok(ct) => ct,
        Err(e) => return fail(format!("invalid ciphertext encoding: {e}")),
    };
    let nonce = match STANDARD.decode(&args.nonce) {
        Ok(nonce) => nonce,
        Err(e) => return fail(format!("invalid nonce encoding: {e}")),
    };
    let key = match STANDARD.decode(&args.key) {
        Ok(key) => key,
        Err(e) => return fail(format!("invalid key encoding: {e}")),
    };

    let codec = match AeadCodec::new(&key) {
        Ok(codec) => codec,
        Err(e) => return fail(e.to_string()),
    };
    match codec.open(&nonce, &cipher_text) {
        Ok(plain_text) => DecryptChunkReturn {
            plain_text: Some(STANDARD.encode(plain_text)),
            error: None,
        },
        Err(e) => fail(e.to_string()),
    }
}

fn into_c_string(value: impl Serialize) -> *mut c_char {
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        r#"{"Error":{"Code":1,"Message":"failed to serialise response"}}"#.to_owned()
    });
    // A serialised JSON document never contains NUL bytes.
    CString::new(json)
        .expect("JSON contains no NUL bytes")
        .into_raw()
}

/// Encrypt one chunk described by a JSON request document.
///
/// # Safety
///
/// `request_json` must be a valid NUL-terminated C string. The returned
/// pointer must be released with [`free_chunk_response`].
#[no_mangle]
pub unsafe extern "C" fn encrypt_chunk(request_json: *const c_char) -> *mut c_char {
    let request = CStr::from_ptr(request_json).to_string_lossy();
    into_c_string(encrypt_chunk_json(&request))
}

/// Decrypt one chunk described by a JSON request document.
///
/// # Safety
///
/// `request_json` must be a valid NUL-terminated C string. The returned
/// pointer must be released with [`free_chunk_response`].
#[no_mangle]
pub unsafe extern "C" fn decrypt_chunk(request_json: *const c_char) -> *mut c_char {
    let request = CStr::from_ptr(request_json).to_string_lossy();
    into_c_string(decrypt_chunk_json(&request))
}

/// Release a string returned by [`encrypt_chunk`] or [`decrypt_chunk`].
///
/// # Safety
///
/// `response` must be a pointer previously returned by one of the entry
/// points of this library, and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn free_chunk_response(response: *mut c_char) {
    if !response.is_null() {
        drop(CString::from_raw(response));
    }
}
