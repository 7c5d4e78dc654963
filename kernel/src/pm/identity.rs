//! Process identity.
//!
//! Real, effective, and saved user and group ids with the classic Unix
//! rules: a privileged process (effective uid 0) may set anything; an
//! unprivileged one may only move an effective id to its real or saved
//! value.

use crate::error::PmError;

/// User and group ids of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    uid: u32,
    euid: u32,
    suid: u32,
    gid: u32,
    egid: u32,
    sgid: u32,
}

impl Identity {
    /// The superuser identity.
    pub const fn root() -> Self {
        Self {
            uid: 0,
            euid: 0,
            suid: 0,
            gid: 0,
            egid: 0,
            sgid: 0,
        }
    }

    /// Identity of a freshly spawned process: the saved ids snapshot the
    /// effective ones.
    pub const fn new(uid: u32, euid: u32, gid: u32, egid: u32) -> Self {
        Self {
            uid,
            euid,
            suid: euid,
            gid,
            egid,
            sgid: egid,
        }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn euid(&self) -> u32 {
        self.euid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn egid(&self) -> u32 {
        self.egid
    }

    /// Whether this identity carries superuser privilege.
    pub fn is_privileged(&self) -> bool {
        self.euid == 0
    }

    /// Sets the real user id.
    ///
    /// Privileged: sets real, effective, and saved. Unprivileged: only the
    /// effective id moves, and only to the real or saved value.
    pub fn setuid(&mut self, uid: u32) -> Result<(), PmError> {
        if self.euid == 0 {
            self.uid = uid;
            self.euid = uid;
            self.suid = uid;
            Ok(())
        } else if uid == self.uid || uid == self.suid {
            self.euid = uid;
            Ok(())
        } else {
            Err(PmError::NotPermitted)
        }
    }

    /// Sets the effective user id to `euid`, which must be the real or
    /// saved id unless the caller is privileged.
    pub fn seteuid(&mut self, euid: u32) -> Result<(), PmError> {
        if self.euid == 0 || euid == self.uid || euid == self.suid {
            self.euid = euid;
            Ok(())
        } else {
            Err(PmError::NotPermitted)
        }
    }

    /// Sets the real group id; mirror of [`Identity::setuid`].
    pub fn setgid(&mut self, gid: u32) -> Result<(), PmError> {
        if self.euid == 0 {
            self.gid = gid;
            self.egid = gid;
            self.sgid = gid;
            Ok(())
        } else if gid == self.gid || gid == self.sgid {
            self.egid = gid;
            Ok(())
        } else {
            Err(PmError::NotPermitted)
        }
    }

    /// Sets the effective group id; mirror of [`Identity::seteuid`].
    pub fn setegid(&mut self, egid: u32) -> Result<(), PmError> {
        if self.euid == 0 || egid == self.gid || egid == self.sgid {
            self.egid = egid;
            Ok(())
        } else {
            Err(PmError::NotPermitted)
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_setuid_rewrites_all_three() {
        let mut id = Identity::root();
        id.setuid(1000).unwrap();
        assert_eq!(id.uid(), 1000);
        assert_eq!(id.euid(), 1000);
        // All three were rewritten, so no way back to root.
        assert_eq!(id.seteuid(0), Err(PmError::NotPermitted));
    }

    #[test]
    fn saved_id_allows_the_round_trip() {
        // uid=1000, euid=0: a setuid-root binary dropping privilege.
        let mut id = Identity::new(1000, 0, 100, 100);

        id.seteuid(1000).unwrap();
        assert_eq!(id.euid(), 1000);

        // The saved uid still holds 0, so privilege can be regained.
        id.seteuid(0).unwrap();
        assert_eq!(id.euid(), 0);

        // Privileged setuid burns the saved id.
        id.setuid(1000).unwrap();
        assert_eq!(id.seteuid(0), Err(PmError::NotPermitted));
    }

    #[test]
    fn unprivileged_setuid_moves_effective_only() {
        let mut id = Identity::new(1000, 1000, 100, 100);
        assert_eq!(id.setuid(0), Err(PmError::NotPermitted));
        id.setuid(1000).unwrap();
        assert_eq!(id.uid(), 1000);
    }

    #[test]
    fn group_rules_mirror_user_rules() {
        let mut id = Identity::new(1000, 1000, 100, 100);
        assert_eq!(id.setgid(0), Err(PmError::NotPermitted));
        id.setegid(100).unwrap();

        let mut root = Identity::root();
        root.setgid(5).unwrap();
        assert_eq!(root.egid(), 5);
    }
}
