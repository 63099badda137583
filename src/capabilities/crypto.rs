//! Hashing, randomness and encoding helpers.

use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{str_arg, u64_arg, Binding, BindingError, InstallContext, InstallError};
use crate::engine::Value;

const MODULE: &str = "crypto";

/// Upper bound on bytes produced by a single `crypto.random_hex` call.
pub const MAX_RANDOM_BYTES: u64 = 1024;

/// Install the crypto bindings.
///
/// # Errors
///
/// Never fails; the signature matches the other modules.
pub fn install(_ctx: &mut InstallContext<'_>) -> Result<Vec<Binding>, InstallError> {
    Ok(vec![
        Binding::function(MODULE, "crypto.sha256", |args| {
            let input = str_arg(args, 0, "input")?;
            Ok(Value::String(hex::encode(Sha256::digest(input.as_bytes()))))
        }),
        Binding::function(MODULE, "crypto.random_hex", |args| {
            let len = u64_arg(args, 0, "length")?;
            if len > MAX_RANDOM_BYTES {
                return Err(BindingError::InvalidArgument(format!(
                    "length {len} exceeds {MAX_RANDOM_BYTES}"
                )));
            }
            let len = usize::try_from(len)
                .map_err(|_| BindingError::InvalidArgument("length out of range".to_owned()))?;
            let mut buf = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut buf);
            Ok(Value::String(hex::encode(buf)))
        }),
        Binding::function(MODULE, "crypto.uuid", |_| {
            Ok(Value::String(uuid::Uuid::new_v4().to_string()))
        }),
        Binding::function(MODULE, "crypto.base64_encode", |args| {
            let input = str_arg(args, 0, "input")?;
            Ok(Value::String(
                base64::engine::general_purpose::STANDARD.encode(input.as_bytes()),
            ))
        }),
        Binding::function(MODULE, "crypto.base64_decode", |args| {
            let input = str_arg(args, 0, "input")?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(input)
                .map_err(|e| BindingError::InvalidArgument(format!("invalid base64: {e}")))?;
            let text = String::from_utf8(bytes)
                .map_err(|_| BindingError::InvalidArgument("decoded bytes are not UTF-8".to_owned()))?;
            Ok(Value::String(text))
        }),
    ])
}
