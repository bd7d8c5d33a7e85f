use std::{env, path::PathBuf, time::Duration};

use crate::length_codec::DEFAULT_MAX_LENGTH;

/// The socket our server and clients communicate over
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/warden.sock";

/// Overrides [`DEFAULT_SOCKET_PATH`] for both binaries
pub const SOCKET_PATH_ENV: &str = "WARDEN_SOCKET_PATH";

/// Owner read/write only
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

pub const DEFAULT_MAX_FRAME_LENGTH: usize = DEFAULT_MAX_LENGTH;

/// Live connections a server accepts before turning new ones away
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// How long a started frame may take to arrive in full
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a client waits for a response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Socket path from `WARDEN_SOCKET_PATH`, falling back to the default.
pub fn socket_path_from_env() -> PathBuf {
    env::var_os(SOCKET_PATH_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}
