use std::{ffi::CString, io};

use uuid::Uuid;
use warden_common::ClientCredentials;

/// What the server knows about the process behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// Correlates log lines of one connection
    pub connection_id: Uuid,
    /// `None` when the platform cannot report them
    pub credentials:   Option<ClientCredentials>,
}

impl PeerInfo {
    pub fn pid(&self) -> Option<u32> {
        self.credentials.map(|c| c.pid)
    }

    pub fn uid(&self) -> Option<u32> {
        self.credentials.map(|c| c.uid)
    }
}

/// Which peer users may connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PeerPolicy {
    #[default]
    AllowAll,
    /// Only these uids. Peers without credentials are refused.
    Uids(Vec<u32>),
}

impl PeerPolicy {
    /// Allow the server's own user and, when running under `sudo`, the user
    /// who invoked it.
    pub fn same_user() -> Self {
        // SAFETY: getuid() is always safe to call - returns the real user ID
        let current_uid = unsafe { libc::getuid() };
        let mut uids = vec![current_uid];

        if current_uid == 0 {
            match std::env::var("SUDO_USER") {
                Ok(sudo_user) => match user_uid(&sudo_user) {
                    Ok(sudo_uid) => {
                        tracing::info!(user = %sudo_user, uid = sudo_uid, "Allowing original sudo user");
                        uids.push(sudo_uid);
                    }
                    Err(e) => tracing::warn!(user = %sudo_user, "Failed to resolve sudo user: {}", e),
                },
                Err(_) => tracing::warn!("Server running as root but SUDO_USER not set"),
            }
        }

        PeerPolicy::Uids(uids)
    }

    /// Add `uids` to the allow-list. Turns [`PeerPolicy::AllowAll`] into a
    /// list.
    pub fn allowing(self, extra: impl IntoIterator<Item = u32>) -> Self {
        let mut uids = match self {
            PeerPolicy::AllowAll => Vec::new(),
            PeerPolicy::Uids(uids) => uids,
        };
        for uid in extra {
            if !uids.contains(&uid) {
                uids.push(uid);
            }
        }
        PeerPolicy::Uids(uids)
    }

    pub fn permits(&self, peer: &PeerInfo) -> bool {
        match self {
            PeerPolicy::AllowAll => true,
            PeerPolicy::Uids(allowed) => peer.uid().is_some_and(|uid| allowed.contains(&uid)),
        }
    }
}

/// Look up the uid of `username` in the password database.
fn user_uid(username: &str) -> io::Result<u32> {
    let username_cstring =
        CString::new(username).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: getpwnam is safe when called with a valid C string pointer.
    // The returned pointer is either null (handled) or points to a valid passwd
    // struct. We check for null before dereferencing and only access the
    // standard pw_uid field.
    unsafe {
        let passwd = libc::getpwnam(username_cstring.as_ptr());
        if passwd.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("user '{username}' not found"),
            ));
        }
        Ok((*passwd).pw_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(uid: Option<u32>) -> PeerInfo {
        PeerInfo {
            connection_id: Uuid::new_v4(),
            credentials:   uid.map(|uid| ClientCredentials { pid: 1, uid, gid: uid }),
        }
    }

    #[test]
    fn uid_list_admits_only_listed_users() {
        let policy = PeerPolicy::AllowAll.allowing([1000, 1001, 1000]);
        assert_eq!(policy, PeerPolicy::Uids(vec![1000, 1001]));

        assert!(policy.permits(&peer(Some(1001))));
        assert!(!policy.permits(&peer(Some(0))));
        assert!(!policy.permits(&peer(None)));
        assert!(PeerPolicy::AllowAll.permits(&peer(None)));
    }

    #[test]
    fn same_user_includes_ourselves() {
        let uid = unsafe { libc::getuid() };
        assert!(PeerPolicy::same_user().permits(&peer(Some(uid))));
    }

    #[test]
    fn root_resolves_to_uid_zero() {
        assert_eq!(user_uid("root").unwrap(), 0);
        assert!(user_uid("no-such-user-for-warden").is_err());
    }
}
