//! POSIX-style chown/chmod authorization
//!
//! - superuser may change anything
//! - owner may "change" uid only to itself
//! - owner may change gid to any group they belong to
//! - owner may change the nine permission bits
//! - everyone else is denied

use super::groups::GroupLookup;
use super::ResolvedPerms;

/// Identity of the process issuing a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }

    pub fn is_superuser(&self) -> bool {
        self.uid == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("operation not permitted")]
    Denied,
    #[error("mode change not supported")]
    NotSupported,
}

const PERMISSION_BITS: u32 = 0o777;

pub fn check_chown(
    caller: Caller,
    current: &ResolvedPerms,
    uid: Option<u32>,
    gid: Option<u32>,
    groups: &dyn GroupLookup,
) -> Result<(), AuthError> {
    if caller.is_superuser() {
        return Ok(());
    }
    if caller.uid != current.uid {
        return Err(AuthError::Denied);
    }
    if let Some(uid) = uid {
        if uid != caller.uid {
            return Err(AuthError::Denied);
        }
    }
    if let Some(gid) = gid {
        if gid != current.gid && !groups.is_member(caller.uid, caller.gid, gid) {
            return Err(AuthError::Denied);
        }
    }
    Ok(())
}

/// Returns the accepted permission bits
///
/// `mode` may carry file type bits from the kernel; those are ignored.
pub fn check_chmod(caller: Caller, current: &ResolvedPerms, mode: u32) -> Result<u32, AuthError> {
    let mode = mode & !(libc::S_IFMT as u32);
    if !caller.is_superuser() && caller.uid != current.uid {
        return Err(AuthError::Denied);
    }
    if mode & !PERMISSION_BITS != 0 {
        return Err(AuthError::NotSupported);
    }
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::groups::StaticGroups;

    fn owned_by(uid: u32, gid: u32) -> ResolvedPerms {
        ResolvedPerms {
            uid,
            gid,
            mode: 0o644,
        }
    }

    #[test]
    fn test_non_owner_denied() {
        let groups = StaticGroups::new();
        let perms = owned_by(1000, 1000);
        let stranger = Caller::new(1001, 1001);

        assert_eq!(
            check_chown(stranger, &perms, None, Some(1001), &groups),
            Err(AuthError::Denied)
        );
        assert_eq!(
            check_chown(stranger, &perms, Some(1001), None, &groups),
            Err(AuthError::Denied)
        );
        assert_eq!(check_chmod(stranger, &perms, 0o600), Err(AuthError::Denied));
    }

    #[test]
    fn test_owner_cannot_give_away() {
        let groups = StaticGroups::new();
        let perms = owned_by(1000, 1000);
        let owner = Caller::new(1000, 1000);

        assert_eq!(check_chown(owner, &perms, Some(1000), None, &groups), Ok(()));
        assert_eq!(
            check_chown(owner, &perms, Some(0), None, &groups),
            Err(AuthError::Denied)
        );
    }

    #[test]
    fn test_owner_chgrp_requires_membership() {
        let groups = StaticGroups::new().with_member(1000, 20);
        let perms = owned_by(1000, 1000);
        let owner = Caller::new(1000, 100);

        assert_eq!(check_chown(owner, &perms, None, Some(20), &groups), Ok(()));
        assert_eq!(check_chown(owner, &perms, None, Some(100), &groups), Ok(()));
        assert_eq!(check_chown(owner, &perms, None, Some(1000), &groups), Ok(()));
        assert_eq!(
            check_chown(owner, &perms, None, Some(30), &groups),
            Err(AuthError::Denied)
        );
    }

    #[test]
    fn test_owner_chmod() {
        let perms = owned_by(1000, 1000);
        let owner = Caller::new(1000, 1000);

        assert_eq!(check_chmod(owner, &perms, 0o600), Ok(0o600));
        assert_eq!(
            check_chmod(owner, &perms, libc::S_IFREG as u32 | 0o640),
            Ok(0o640)
        );
        assert_eq!(
            check_chmod(owner, &perms, 0o4755),
            Err(AuthError::NotSupported)
        );
    }

    #[test]
    fn test_superuser_may_do_anything() {
        let groups = StaticGroups::new();
        let perms = owned_by(1000, 1000);
        let root = Caller::root();

        assert_eq!(
            check_chown(root, &perms, Some(5), Some(6), &groups),
            Ok(())
        );
        assert_eq!(check_chmod(root, &perms, 0o000), Ok(0));
    }
}
