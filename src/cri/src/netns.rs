//! Persistent network namespace handles.
//!
//! A namespace is created by unsharing the net namespace on a scratch
//! thread and bind-mounting that thread's ns file onto a handle under the
//! netns directory. The main thread never switches namespaces.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use nix::mount::{umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{getpid, gettid};

/// Handle path for a named namespace.
pub fn handle_path(netns_dir: &Path, name: &str) -> PathBuf {
    netns_dir.join(name)
}

/// Create a fresh persistent network namespace named `name`.
/// Returns the handle path.
pub fn create(netns_dir: &Path, name: &str) -> io::Result<PathBuf> {
    std::fs::create_dir_all(netns_dir)?;
    let handle = handle_path(netns_dir, name);
    File::create(&handle)?;

    let mount_dest = handle.clone();
    let worker = thread::spawn(move || -> io::Result<()> {
        let thread_ns = format!("/proc/{}/task/{}/ns/net", getpid(), gettid());
        unshare(CloneFlags::CLONE_NEWNET).map_err(io::Error::from)?;
        nix::mount::mount(
            Some(thread_ns.as_str()),
            &mount_dest,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(io::Error::from)
    });

    match worker.join() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(err)) => {
            let _ = std::fs::remove_file(&handle);
            Err(err)
        }
        Err(_) => {
            let _ = std::fs::remove_file(&handle);
            Err(io::Error::other("netns worker thread panicked"))
        }
    }
}

/// Tear down a persistent namespace handle: detach the bind mount and
/// remove the handle file.
pub fn remove(netns_dir: &Path, name: &str) -> io::Result<()> {
    let handle = handle_path(netns_dir, name);
    match umount2(&handle, MntFlags::MNT_DETACH) {
        Ok(()) => {}
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
        Err(err) => return Err(err.into()),
    }
    match std::fs::remove_file(&handle) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_path() {
        assert_eq!(
            handle_path(Path::new("/var/run/netns"), "foo-1a2b"),
            PathBuf::from("/var/run/netns/foo-1a2b")
        );
    }

    #[test]
    fn test_remove_missing_handle_is_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        remove(dir.path(), "absent").unwrap();
    }
}
