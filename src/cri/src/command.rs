//! Container command resolution.
//!
//! The backend expects an absolute argv[0] inside the container chroot.
//! A relative command is resolved the way a shell would: walk the `PATH`
//! directories under the chroot, following symlinks, and accept the first
//! executable non-directory. When nothing resolves, the whole command is
//! handed to `/bin/sh -c`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// PATH used when the environment does not provide one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Maximum symlink depth followed during resolution.
const MAX_SYMLINK_DEPTH: usize = 10;

/// Command the logshim wrapper is never applied to.
const PAUSE_COMMAND: &str = "/pause";

/// Merge the configured command/args with the image default and resolve
/// argv[0] against the chroot at `root`.
///
/// `env` is the final container environment as `KEY=VALUE` entries; its
/// `PATH` drives the lookup.
pub fn resolve(
    cfg_cmd: &[String],
    cfg_args: &[String],
    image_cmd: &[String],
    env: &[String],
    root: &Path,
) -> Vec<String> {
    let mut argv: Vec<String> = if cfg_cmd.is_empty() {
        image_cmd.to_vec()
    } else {
        cfg_cmd.to_vec()
    };
    argv.extend(cfg_args.iter().cloned());

    let Some(first) = argv.first().cloned() else {
        return argv;
    };
    if first.starts_with('/') {
        return argv;
    }

    let path_env = env
        .iter()
        .find_map(|entry| entry.strip_prefix("PATH="))
        .unwrap_or(DEFAULT_PATH);

    for dir in path_env.split(':').filter(|d| !d.is_empty()) {
        if resolves_to_executable(root, &format!("{}/{}", dir, first)) {
            argv[0] = format!("{}/{}", dir.trim_end_matches('/'), first);
            return argv;
        }
    }

    // Nothing on PATH: let the shell sort it out.
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        argv.join(" "),
    ]
}

/// Prepend the log framer unless the command is the bare pause binary or
/// the caller asked to bypass framing.
pub fn wrap_logshim(argv: Vec<String>, logshim: &Path, bypass: bool) -> Vec<String> {
    if bypass || argv == [PAUSE_COMMAND] {
        return argv;
    }
    let mut wrapped = Vec::with_capacity(argv.len() + 1);
    wrapped.push(logshim.to_string_lossy().into_owned());
    wrapped.extend(argv);
    wrapped
}

/// Check whether a container-absolute path points at an executable
/// non-directory inside the chroot, following symlinks.
fn resolves_to_executable(root: &Path, container_path: &str) -> bool {
    let mut host_path = rebase(root, container_path);

    for _ in 0..MAX_SYMLINK_DEPTH {
        let meta = match std::fs::symlink_metadata(&host_path) {
            Ok(meta) => meta,
            Err(_) => return false,
        };

        if meta.file_type().is_symlink() {
            let target = match std::fs::read_link(&host_path) {
                Ok(target) => target,
                Err(_) => return false,
            };
            host_path = if target.is_absolute() {
                rebase(root, &target.to_string_lossy())
            } else {
                match host_path.parent() {
                    Some(parent) => parent.join(target),
                    None => return false,
                }
            };
            continue;
        }

        return !meta.is_dir() && meta.permissions().mode() & 0o111 != 0;
    }

    false
}

fn rebase(root: &Path, container_path: &str) -> PathBuf {
    root.join(container_path.trim_start_matches('/'))
}
