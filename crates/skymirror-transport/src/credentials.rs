//! Bearer credentials for remote connections.

use std::path::Path;

use snafu::ResultExt;

use crate::error::InvalidCredentialsSnafu;
use crate::error::ReadCredentialsSnafu;
use crate::error::TransportError;

/// A bearer token presented in the connection hello.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    /// Parse credentials from raw bytes. Surrounding whitespace is trimmed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        let text = std::str::from_utf8(bytes).map_err(|_| TransportError::InvalidCredentials {
            reason: "credentials are not valid UTF-8".to_string(),
        })?;
        let token = text.trim();
        if token.is_empty() {
            return InvalidCredentialsSnafu {
                reason: "credentials are empty",
            }
            .fail();
        }
        Ok(Self {
            token: token.to_string(),
        })
    }

    /// Load credentials from a file.
    pub fn from_file(path: &Path) -> Result<Self, TransportError> {
        let bytes = std::fs::read(path).context(ReadCredentialsSnafu { path })?;
        Self::from_bytes(&bytes)
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("token", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn trims_whitespace() {
        let creds = Credentials::from_bytes(b"  abc123\n").unwrap();
        assert_eq!(creds.token(), "abc123");
    }

    #[test]
    fn empty_is_an_error() {
        assert!(matches!(
            Credentials::from_bytes(b" \n\t"),
            Err(TransportError::InvalidCredentials { .. })
        ));
    }

    #[test]
    fn debug_hides_token() {
        let creds = Credentials::from_bytes(b"hunter2").unwrap();
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "file-token").unwrap();
        let creds = Credentials::from_file(file.path()).unwrap();
        assert_eq!(creds.token(), "file-token");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Credentials::from_file(&dir.path().join("absent.creds"));
        assert!(matches!(result, Err(TransportError::ReadCredentials { .. })));
    }
}
