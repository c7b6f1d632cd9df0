//! Group membership lookup used by chown authorization

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

/// Answers "is `uid` a member of `gid`?"
///
/// Kept behind a trait so tests can supply a fixed table.
pub trait GroupLookup: Send + Sync {
    fn is_member(&self, uid: u32, primary_gid: u32, gid: u32) -> bool;
}

/// Membership from the OS user and group databases
pub struct SystemGroups {
    cache: Cache<(u32, u32), Arc<Vec<u32>>>,
}

impl Default for SystemGroups {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl SystemGroups {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(1024)
                .build(),
        }
    }

    fn groups_of(uid: u32, primary_gid: u32) -> Vec<u32> {
        let mut groups = vec![primary_gid];
        let user = match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
            Ok(Some(user)) => user,
            Ok(None) => return groups,
            Err(e) => {
                tracing::debug!(uid, error = %e, "user lookup failed");
                return groups;
            }
        };

        groups.push(user.gid.as_raw());
        #[cfg(not(target_os = "macos"))]
        if let Ok(name) = std::ffi::CString::new(user.name) {
            match nix::unistd::getgrouplist(name.as_c_str(), user.gid) {
                Ok(sups) => groups.extend(sups.into_iter().map(|g| g.as_raw())),
                Err(e) => tracing::debug!(uid, error = %e, "getgrouplist failed"),
            }
        }
        groups.sort_unstable();
        groups.dedup();
        groups
    }
}

impl GroupLookup for SystemGroups {
    fn is_member(&self, uid: u32, primary_gid: u32, gid: u32) -> bool {
        if gid == primary_gid {
            return true;
        }
        self.cache
            .get_with((uid, primary_gid), || {
                Arc::new(Self::groups_of(uid, primary_gid))
            })
            .contains(&gid)
    }
}

/// Fixed membership table
#[derive(Debug, Default, Clone)]
pub struct StaticGroups {
    members: std::collections::HashMap<u32, Vec<u32>>,
}

impl StaticGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(mut self, uid: u32, gid: u32) -> Self {
        self.members.entry(uid).or_default().push(gid);
        self
    }
}

impl GroupLookup for StaticGroups {
    fn is_member(&self, uid: u32, primary_gid: u32, gid: u32) -> bool {
        gid == primary_gid
            || self
                .members
                .get(&uid)
                .is_some_and(|groups| groups.contains(&gid))
    }
}
