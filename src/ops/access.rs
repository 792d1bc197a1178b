use crate::structure::inode::Inode;
use crate::util::error::{FsError, FsResult};
use crate::util::mode::STICKY;

/// The identity an operation runs as, as delivered by the upcall bridge.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn root() -> Credentials {
        Credentials::default()
    }

    pub fn new(uid: u32, gid: u32) -> Credentials {
        Credentials { uid, gid, groups: Vec::new() }
    }

    pub fn in_group(&self, gid: u16) -> bool {
        self.gid == gid as u32 || self.groups.iter().any(|&g| g == gid as u32)
    }
}

pub const READ: u8 = 0o4;
pub const WRITE: u8 = 0o2;
pub const EXEC: u8 = 0o1;

/// Classic owner/group/other check. Root is always granted; otherwise the
/// matching permission triad must contain every requested bit.
pub fn check_access(caller: &Credentials, inode: &Inode, requested: u8) -> FsResult<()> {
    if caller.uid == 0 {
        return Ok(());
    }
    let triad = if caller.uid == inode.uid as u32 {
        (inode.mode >> 6) & 0o7
    } else if caller.in_group(inode.gid) {
        (inode.mode >> 3) & 0o7
    } else {
        inode.mode & 0o7
    } as u8;

    if requested & !triad != 0 {
        return Err(FsError::AccessDenied);
    }
    Ok(())
}

/// With the sticky bit on the parent, only root, the parent's owner or the
/// target's owner may unlink or rmdir the target.
pub fn sticky_allows_delete(caller: &Credentials, parent: &Inode, target: &Inode) -> bool {
    if parent.mode & STICKY == 0 {
        return true;
    }
    caller.uid == 0 || caller.uid == parent.uid as u32 || caller.uid == target.uid as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::mode::{TYPE_DIRECTORY, TYPE_REGULAR};

    fn file_inode(uid: u16, gid: u16, permissions: u16) -> Inode {
        Inode {
            mode: TYPE_REGULAR | permissions,
            uid,
            gid,
            ..Inode::default()
        }
    }

    #[test]
    fn root_bypasses_everything() {
        let inode = file_inode(1000, 1000, 0o000);
        let root = Credentials::root();
        assert!(check_access(&root, &inode, READ | WRITE | EXEC).is_ok());
    }

    #[test]
    fn owner_uses_owner_triad() {
        let inode = file_inode(1000, 1000, 0o640);
        let owner = Credentials::new(1000, 2000);
        assert!(check_access(&owner, &inode, READ | WRITE).is_ok());
        assert_eq!(check_access(&owner, &inode, EXEC), Err(FsError::AccessDenied));
    }

    #[test]
    fn group_membership_uses_group_triad() {
        let inode = file_inode(1000, 1000, 0o640);
        let member = Credentials::new(2000, 1000);
        assert!(check_access(&member, &inode, READ).is_ok());
        assert_eq!(check_access(&member, &inode, WRITE), Err(FsError::AccessDenied));

        let supplementary = Credentials {
            uid: 2000,
            gid: 3000,
            groups: vec![4000, 1000],
        };
        assert!(check_access(&supplementary, &inode, READ).is_ok());
    }

    #[test]
    fn others_use_other_triad() {
        let inode = file_inode(1000, 1000, 0o604);
        let other = Credentials::new(2000, 2000);
        assert!(check_access(&other, &inode, READ).is_ok());
        assert_eq!(
            check_access(&other, &inode, READ | WRITE),
            Err(FsError::AccessDenied)
        );
    }

    #[test]
    fn sticky_restricts_delete_to_owners() {
        let mut parent = Inode {
            mode: TYPE_DIRECTORY | STICKY | 0o777,
            uid: 1000,
            ..Inode::default()
        };
        let target = file_inode(2000, 2000, 0o666);

        assert!(sticky_allows_delete(&Credentials::root(), &parent, &target));
        assert!(sticky_allows_delete(&Credentials::new(1000, 1), &parent, &target));
        assert!(sticky_allows_delete(&Credentials::new(2000, 1), &parent, &target));
        assert!(!sticky_allows_delete(&Credentials::new(3000, 1), &parent, &target));

        parent.mode = TYPE_DIRECTORY | 0o777;
        assert!(sticky_allows_delete(&Credentials::new(3000, 1), &parent, &target));
    }
}
