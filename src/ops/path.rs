use crate::consts::{InodeNo, BLOCK_POINTERS, BLOCK_SIZE, MAX_SYMLINK_DEPTH};
use crate::device::BlockDevice;
use crate::ops::access::{check_access, Credentials, EXEC};
use crate::ops::directory;
use crate::structure::inode::Inode;
use crate::structure::Volume;
use crate::util::error::{FsError, FsResult};

/// Read a symlink's target bytes: inline from the pointer array for a fast
/// symlink, from its single data block otherwise.
pub fn read_link_target<D: BlockDevice>(volume: &Volume<D>, inode: &Inode) -> FsResult<Vec<u8>> {
    if !inode.is_symlink() {
        return Err(FsError::InvalidArgument);
    }
    if inode.blocks == 0 {
        if inode.size as usize >= BLOCK_POINTERS * 4 {
            return Err(FsError::Io);
        }
        Ok(inode.inline_target())
    } else {
        if inode.size == 0 || inode.size as usize >= BLOCK_SIZE || inode.block[0] == 0 {
            return Err(FsError::Io);
        }
        let buffer = volume.read_block(inode.block[0])?;
        Ok(buffer[..inode.size as usize].to_vec())
    }
}

/// Split an absolute path into the parent directory and the final name.
/// Duplicate and trailing slashes are collapsed first; the root path yields
/// `("/", "/")` so callers can reject it as a name.
pub fn split_parent(path: &str) -> (String, String) {
    let mut normalized = String::with_capacity(path.len());
    if path.starts_with('/') {
        normalized.push('/');
    }
    for part in path.split('/') {
        if part.is_empty() {
            continue;
        }
        if normalized.len() > 1 {
            normalized.push('/');
        }
        normalized.push_str(part);
    }

    if normalized.is_empty() {
        return (String::from("."), String::new());
    }
    if normalized == "/" {
        return (String::from("/"), String::from("/"));
    }
    match normalized.rfind('/') {
        Some(0) => (String::from("/"), normalized[1..].to_string()),
        Some(position) => (
            normalized[..position].to_string(),
            normalized[position + 1..].to_string(),
        ),
        None => (String::from("."), normalized),
    }
}

/// Resolve an absolute path to an inode number, chasing symbolic links.
/// `follow_last` decides whether a symlink in the final component is
/// followed or returned as-is.
pub fn resolve<D: BlockDevice>(
    volume: &Volume<D>,
    caller: &Credentials,
    path: &str,
    follow_last: bool,
) -> FsResult<InodeNo> {
    resolve_at(volume, caller, path, follow_last, 0)
}

fn resolve_at<D: BlockDevice>(
    volume: &Volume<D>,
    caller: &Credentials,
    path: &str,
    follow_last: bool,
    depth: u32,
) -> FsResult<InodeNo> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(FsError::TooManySymlinks);
    }
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument);
    }

    let components: Vec<&str> = path
        .split('/')
        .filter(|component| !component.is_empty() && *component != ".")
        .collect();
    if components.is_empty() {
        return Ok(volume.superblock.root_inode);
    }

    let mut current = volume.superblock.root_inode;
    // Running path of the directory walked so far; only consulted to anchor
    // relative symlink targets.
    let mut current_path = String::from("/");

    for (index, component) in components.iter().enumerate() {
        let is_last = index == components.len() - 1;

        let dir_inode = volume.read_inode(current)?;
        if !dir_inode.is_directory() {
            return Err(FsError::NotDirectory);
        }
        check_access(caller, &dir_inode, EXEC)?;

        let child_num = directory::lookup(volume, &dir_inode, component.as_bytes())?
            .ok_or(FsError::NoEntry)?;
        let child = volume.read_inode(child_num)?;

        let parent_path = current_path.clone();
        if *component == ".." {
            if current_path.len() > 1 {
                match current_path.rfind('/') {
                    Some(0) => current_path.truncate(1),
                    Some(position) => current_path.truncate(position),
                    None => {}
                }
            }
        } else {
            if current_path.len() > 1 {
                current_path.push('/');
            }
            current_path.push_str(component);
        }

        if child.is_symlink() && (!is_last || follow_last) {
            let target = String::from_utf8(read_link_target(volume, &child)?)
                .map_err(|_| FsError::Io)?;
            let mut next_path = if target.starts_with('/') {
                target
            } else if parent_path == "/" {
                format!("/{}", target)
            } else {
                format!("{}/{}", parent_path, target)
            };
            for rest in &components[index + 1..] {
                if next_path.ends_with('/') {
                    next_path.pop();
                }
                next_path.push('/');
                next_path.push_str(rest);
            }
            return resolve_at(volume, caller, &next_path, follow_last, depth + 1);
        }

        if is_last {
            return Ok(child_num);
        }
        current = child_num;
    }
    Ok(current)
}
