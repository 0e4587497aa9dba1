//! Validated session endpoint.
//!
//! An [`Address`] is checked once, before any network activity, and is
//! never mutated afterwards. Only `https` endpoints are accepted.

use std::fmt;

use tonic::transport::Uri;

use crate::error::{CreatureError, Result};

/// The only accepted transport scheme.
pub const SECURE_SCHEME: &str = "https";

/// A non-empty `https` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    raw: String,
    uri: Uri,
}

impl Address {
    /// Validate `address`.
    ///
    /// # Errors
    ///
    /// Returns [`CreatureError::InvalidAddress`] if the address is empty,
    /// does not parse as a URI, has no host, or uses a scheme other than
    /// `https`.
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = |reason| CreatureError::InvalidAddress {
            address: address.to_string(),
            reason,
        };

        if address.trim().is_empty() {
            return Err(invalid("address is empty"));
        }

        let uri: Uri = address
            .parse()
            .map_err(|_| invalid("address is not a valid URI"))?;

        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case(SECURE_SCHEME) => {}
            Some(_) => return Err(invalid("address must use the https scheme")),
            None => return Err(invalid("address has no scheme")),
        }

        if uri.host().map_or(true, str::is_empty) {
            return Err(invalid("address has no host"));
        }

        Ok(Self {
            raw: address.to_string(),
            uri,
        })
    }

    /// The address exactly as supplied.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parsed form.
    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Host part, used as the default TLS server name.
    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for Address {
    type Err = CreatureError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
