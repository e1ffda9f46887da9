//! Generates the one-shot shell command run by the init container to seed
//! persistent storage from the container image. The init container's
//! entrypoint takes exactly one command string, so the probe-then-branch
//! logic lives in a single generated string and nothing outside this module
//! inspects script text.

use crate::common::{init_log_dir, INIT_LOG_FILE, INIT_MARKER_FILE, INIT_PROGRESS_FILE};

/// Probes whether rsync is installed with the option set we need. Older
/// rsync builds lack --log-file and --info=progress2; the probe exercises
/// them against --version and records the exit status. The dummy log file is
/// never read, it only proves --log-file works.
fn rsync_probe_cmd() -> String {
    "rsync --log-file=./rsync-check-status-dummy.log --info=progress2 --relative -ax --version; \
     RSYNC_CHECK_STATUS=$?;"
        .to_string()
}

/// Copy via rsync, preserving attributes and relative paths, with progress
/// written under the mounted volume for observability. The log directory
/// must exist before rsync opens its log file there.
fn rsync_copy_cmd(persist_dirs: &[String]) -> String {
    format!(
        "mkdir -p /mnt{log_dir}; rsync --log-file=/mnt{log} --info=progress2 --relative -ax {dirs} /mnt > /mnt{progress};",
        log_dir = init_log_dir(),
        log = INIT_LOG_FILE,
        dirs = persist_dirs.join(" "),
        progress = INIT_PROGRESS_FILE,
    )
}

/// Fallback copy: recursive, attribute-preserving, no progress reporting.
fn cp_copy_cmd(persist_dirs: &[String]) -> String {
    format!("cp --parent -ax {} /mnt", persist_dirs.join(" "))
}

/// The complete init-container entrypoint command. Skips the copy when the
/// sentinel marker already exists under the mounted volume (the container
/// may be restarted), otherwise copies with rsync when the probe succeeded
/// and cp when it did not, then writes the sentinel and exits zero.
pub fn init_container_command(persist_dirs: &[String]) -> String {
    format!(
        "{probe} ! [ -f /mnt{marker} ] && ( [ ${{RSYNC_CHECK_STATUS}} != 0 ] && ({cp}) || ({rsync}) ); touch /mnt{marker};",
        probe = rsync_probe_cmd(),
        marker = INIT_MARKER_FILE,
        cp = cp_copy_cmd(persist_dirs),
        rsync = rsync_copy_cmd(persist_dirs),
    )
}
