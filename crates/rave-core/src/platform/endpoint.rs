//! Endpoint address derivation.
//!
//! Every process opening the same location must rendezvous on the same
//! address, so the address is a pure function of the absolute location:
//!
//! - **Unix**: `<location>/rave.sock`
//! - **Windows**: `\\.\pipe\rave\<location>`

use crate::config::RaveConfig;
use crate::error::{RaveError, Result};
use std::path::{Path, PathBuf};

/// Longest socket path accepted by `bind(2)` (excluding the NUL terminator).
#[cfg(target_os = "macos")]
const MAX_SOCKET_PATH_LEN: usize = 103;
#[cfg(all(unix, not(target_os = "macos")))]
const MAX_SOCKET_PATH_LEN: usize = 107;

/// Longest pipe name accepted by `CreateNamedPipe`.
#[cfg(windows)]
const MAX_PIPE_NAME_LEN: usize = 256;

/// Local channel address shared by all instances of one location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    /// Derive the endpoint for `location`, or use `explicit` verbatim.
    ///
    /// `location` must be absolute so that every process derives the same address.
    pub fn resolve(location: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(explicit) = explicit {
            if explicit.as_os_str().is_empty() {
                return Err(RaveError::Config {
                    message: "Socket path override is empty".to_string(),
                });
            }
            return Ok(Self {
                path: explicit.to_path_buf(),
            });
        }

        if !location.is_absolute() {
            return Err(RaveError::Config {
                message: format!("Store location must be absolute: {}", location.display()),
            });
        }

        Self::derive(location)
    }

    #[cfg(unix)]
    fn derive(location: &Path) -> Result<Self> {
        let path = location.join(RaveConfig::SOCKET_FILE_NAME);
        let len = path.as_os_str().len();
        if len > MAX_SOCKET_PATH_LEN {
            return Err(RaveError::Config {
                message: format!(
                    "Socket path {} is {} bytes, longer than the platform limit of {}; \
                     use a shorter location or an explicit socket path",
                    path.display(),
                    len,
                    MAX_SOCKET_PATH_LEN
                ),
            });
        }
        Ok(Self { path })
    }

    #[cfg(windows)]
    fn derive(location: &Path) -> Result<Self> {
        let name = format!("{}{}", RaveConfig::PIPE_NAMESPACE, location.display());
        if name.len() > MAX_PIPE_NAME_LEN {
            return Err(RaveError::Config {
                message: format!(
                    "Pipe name {} is longer than {} characters",
                    name, MAX_PIPE_NAME_LEN
                ),
            });
        }
        Ok(Self {
            path: PathBuf::from(name),
        })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// True when the address is a filesystem artifact that can go stale.
    pub fn is_file_backed(&self) -> bool {
        cfg!(unix)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abs(p: &str) -> PathBuf {
        std::env::temp_dir().join(p)
    }

    #[test]
    fn test_same_location_same_endpoint() {
        let a = Endpoint::resolve(&abs("db-one"), None).unwrap();
        let b = Endpoint::resolve(&abs("db-one"), None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_locations_differ() {
        let a = Endpoint::resolve(&abs("db-one"), None).unwrap();
        let b = Endpoint::resolve(&abs("db-two"), None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_relative_location_rejected() {
        let err = Endpoint::resolve(Path::new("relative/db"), None).unwrap_err();
        assert!(matches!(err, RaveError::Config { .. }));
    }

    #[test]
    fn test_explicit_override_used_verbatim() {
        let explicit = abs("custom.sock");
        let endpoint = Endpoint::resolve(&abs("db-one"), Some(&explicit)).unwrap();
        assert_eq!(endpoint.as_path(), explicit.as_path());
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_socket_lives_in_location() {
        let location = abs("db-one");
        let endpoint = Endpoint::resolve(&location, None).unwrap();
        assert_eq!(endpoint.as_path(), location.join("rave.sock").as_path());
        assert!(endpoint.is_file_backed());
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_socket_path_too_long() {
        let location = PathBuf::from("/").join("x".repeat(200));
        let err = Endpoint::resolve(&location, None).unwrap_err();
        assert!(matches!(err, RaveError::Config { .. }));
    }

    #[cfg(windows)]
    #[test]
    fn test_windows_pipe_name() {
        let endpoint = Endpoint::resolve(Path::new(r"C:\data\db"), None).unwrap();
        assert_eq!(endpoint.to_string(), r"\\.\pipe\rave\C:\data\db");
        assert!(!endpoint.is_file_backed());
    }
}
