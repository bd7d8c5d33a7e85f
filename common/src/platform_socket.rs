use std::{
    fs, io,
    os::unix::{
        fs::{FileTypeExt, PermissionsExt},
        net::{UnixListener, UnixStream},
    },
    path::Path,
};

#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

use crate::error::{IpcError, Result};

/// Credentials of the process on the other end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCredentials {
    /// Process ID of the peer
    pub pid: u32,
    /// User ID of the peer
    pub uid: u32,
    /// Group ID of the peer
    pub gid: u32,
}

/// Remove a leftover socket entry at `path`.
///
/// Anything that is not a socket is left alone and reported as an error so a
/// misconfigured path can never delete a regular file.
pub fn remove_stale_entry(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("'{}' exists and is not a socket", path.display()),
        ));
    }

    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Bind a listening Unix socket at `path` with permission bits `mode`.
///
/// A stale socket entry is removed first. On failure nothing is left behind:
/// the descriptor is closed and any entry this call created is unlinked. The
/// returned listener is non-blocking so it can be driven from `poll`.
pub fn bind_listener(path: &Path, mode: u32) -> Result<UnixListener> {
    let bind_error = |source: io::Error| IpcError::Bind {
        path: path.to_path_buf(),
        source,
    };

    match remove_stale_entry(path) {
        Ok(true) => tracing::info!(path = %path.display(), "Removed stale socket entry"),
        Ok(false) => tracing::debug!(path = %path.display(), "No stale socket entry"),
        Err(e) => return Err(bind_error(e)),
    }

    let listener = match UnixListener::bind(path) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(path = %path.display(), "Failed to bind socket: {} (kind: {:?})", e, e.kind());
            // Another process may have raced us to the path; only clean up our own mess.
            if e.kind() != io::ErrorKind::AddrInUse {
                let _ = fs::remove_file(path);
            }
            return Err(bind_error(e));
        }
    };

    let configure = || -> io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        listener.set_nonblocking(true)
    };

    if let Err(e) = configure() {
        tracing::error!(path = %path.display(), "Failed to configure socket: {}", e);
        drop(listener);
        let _ = fs::remove_file(path);
        return Err(bind_error(e));
    }

    tracing::debug!(path = %path.display(), "Socket permissions set to {:o}", mode);
    Ok(listener)
}

/// Connect to the socket at `path` in blocking mode.
pub fn connect_stream(path: &Path) -> io::Result<UnixStream> {
    let stream = UnixStream::connect(path)?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Extract the peer's credentials from a connected socket
pub fn peer_credentials(stream: &UnixStream) -> Result<ClientCredentials> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let creds = getsockopt(stream, PeerCredentials)?;
        Ok(ClientCredentials {
            pid: creds.pid() as u32,
            uid: creds.uid(),
            gid: creds.gid(),
        })
    }

    #[cfg(target_os = "macos")]
    {
        use std::os::fd::AsRawFd;

        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;
        // SAFETY: getpeereid only writes to the two stack variables; the
        // descriptor is owned by `stream` and open for the whole call.
        if unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut pid: libc::pid_t = 0;
        let mut len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;
        // SAFETY: `pid` and `len` describe a valid, correctly sized buffer.
        let rc = unsafe {
            libc::getsockopt(
                stream.as_raw_fd(),
                libc::SOL_LOCAL,
                libc::LOCAL_PEERPID,
                &mut pid as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(ClientCredentials {
            pid: pid as u32,
            uid,
            gid,
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    {
        let _ = stream;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "peer credentials are not supported on this platform",
        )
        .into())
    }
}
