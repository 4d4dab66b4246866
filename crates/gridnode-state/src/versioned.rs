//! Versioned document codec.
//!
//! A document is a semantic version on the first line followed by the JSON
//! body. Readers refuse documents whose major version differs from
//! [`current`].

use semver::Version;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StateError, StateResult};

/// Version written by this build.
pub fn current() -> Version {
    Version::new(1, 0, 0)
}

pub fn encode<T: Serialize>(version: &Version, value: &T) -> StateResult<Vec<u8>> {
    let mut out = format!("{version}\n").into_bytes();
    serde_json::to_writer(&mut out, value).map_err(|e| StateError::Serialize(e.to_string()))?;
    Ok(out)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<(Version, T)> {
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| StateError::Deserialize("missing version header".into()))?;
    let header = std::str::from_utf8(&bytes[..split])
        .map_err(|e| StateError::Deserialize(e.to_string()))?;
    let version = Version::parse(header.trim()).map_err(|e| StateError::Deserialize(e.to_string()))?;

    let supported = current();
    if version.major != supported.major {
        return Err(StateError::Version {
            found: version.to_string(),
            supported: supported.to_string(),
        });
    }

    let value = serde_json::from_slice(&bytes[split + 1..])
        .map_err(|e| StateError::Deserialize(e.to_string()))?;
    Ok((version, value))
}
