//! Container isolation backend: namespaced, chrooted, resource-capped
//! execution environments with an ephemeral writable scratch area.
//!
//! Each container is a tmpfs root with read-only bind mounts of the host
//! system directories, its own PID, mount and network namespaces (the
//! network namespace has no interfaces, so workers are offline), and
//! rlimits on CPU, memory, file size, descriptors and stack. Commands run
//! under a wall-clock deadline enforced by a non-blocking wait loop.

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, execvpe, Pid};
use std::ffi::CString;
use std::fs;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{PoolError, SandboxError};
use crate::pool::{Container, ExecBackend, RawExec};

/// Hard ceiling on the worker stack; the in-artifact guard budget sits
/// below it so the rlimit only fires if the guard is bypassed.
const STACK_LIMIT_KB: u64 = 8192;
const NPROC_LIMIT: u64 = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Fixed entry command every artifact is invoked through.
const ENTRY_COMMAND: &str = "/home/solution";

const DEFAULT_MEM_KB: u64 = 524288;
const DEFAULT_FSIZE_KB: u64 = 10240;
const DEFAULT_NOFILE: u64 = 64;

/// Resource caps and command for one invocation inside a container.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub command: Vec<String>,
    /// Wall-clock limit; the process is killed when it elapses.
    pub time_ms: u64,
    pub mem_kb: u64,
    pub fsize_kb: u64,
    pub nofile: u64,
}

/// The real isolation backend: containers are namespaced chroots under a
/// base directory, all sharing fixed resource ceilings.
#[derive(Debug, Clone)]
pub struct SandboxBackend {
    base_dir: std::path::PathBuf,
    mem_kb: u64,
    fsize_kb: u64,
    nofile: u64,
}

impl SandboxBackend {
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            mem_kb: DEFAULT_MEM_KB,
            fsize_kb: DEFAULT_FSIZE_KB,
            nofile: DEFAULT_NOFILE,
        }
    }
}

impl ExecBackend for SandboxBackend {
    fn create(&self, id: &str) -> Result<Container, PoolError> {
        let root = self.base_dir.join(format!("judge-{id}"));
        create_container(&root)?;
        Ok(Container {
            id: id.to_string(),
            root,
        })
    }

    fn wipe(&self, container: &Container) -> Result<(), PoolError> {
        wipe_container(&container.root).map_err(Into::into)
    }

    fn destroy(&self, container: &Container) {
        destroy_container(&container.root);
    }

    fn place_file(
        &self,
        container: &Container,
        rel_path: &str,
        content: &[u8],
        mode: u32,
    ) -> Result<(), PoolError> {
        write_file_in_container(&container.root, rel_path, content, mode).map_err(Into::into)
    }

    fn exec(&self, container: &Container, payload: &str, timeout_ms: u64) -> Result<RawExec, PoolError> {
        let config = RunConfig {
            command: vec![ENTRY_COMMAND.to_string(), payload.to_string()],
            time_ms: timeout_ms,
            mem_kb: self.mem_kb,
            fsize_kb: self.fsize_kb,
            nofile: self.nofile,
        };
        run_in_container(&container.root, &config).map_err(Into::into)
    }
}

/// Builds a container filesystem under the given root path.
pub fn create_container(root: &Path) -> Result<(), SandboxError> {
    if root.exists() {
        destroy_container(root);
    }
    fs::create_dir_all(root).map_err(|e| SandboxError::Setup(format!("mkdir: {e}")))?;

    mount(
        Some("tmpfs"),
        root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("size=256M,mode=755"),
    )
    .map_err(|e| SandboxError::Setup(format!("mount tmpfs: {e}")))?;

    // Read-only views of the host system directories.
    let bind_dirs = ["/bin", "/lib", "/lib64", "/usr", "/etc"];
    for dir in &bind_dirs {
        let target = root.join(&dir[1..]);
        if Path::new(dir).exists() {
            fs::create_dir_all(&target)
                .map_err(|e| SandboxError::Setup(format!("mkdir {dir}: {e}")))?;
            mount(
                Some(*dir),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| SandboxError::Setup(format!("bind mount {dir}: {e}")))?;
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| SandboxError::Setup(format!("remount ro {dir}: {e}")))?;
        }
    }

    // Writable scratch areas, wiped between leases.
    let tmp_dir = root.join("tmp");
    fs::create_dir_all(&tmp_dir).map_err(|e| SandboxError::Setup(format!("mkdir tmp: {e}")))?;
    fs::set_permissions(&tmp_dir, fs::Permissions::from_mode(0o1777))
        .map_err(|e| SandboxError::Setup(format!("chmod tmp: {e}")))?;

    let home_dir = root.join("home");
    fs::create_dir_all(&home_dir).map_err(|e| SandboxError::Setup(format!("mkdir home: {e}")))?;
    fs::set_permissions(&home_dir, fs::Permissions::from_mode(0o755))
        .map_err(|e| SandboxError::Setup(format!("chmod home: {e}")))?;

    let dev_dir = root.join("dev");
    fs::create_dir_all(&dev_dir).map_err(|e| SandboxError::Setup(format!("mkdir dev: {e}")))?;
    for dev in &["null", "zero", "urandom", "random"] {
        let host_dev = format!("/dev/{dev}");
        let sandbox_dev = dev_dir.join(dev);
        if Path::new(&host_dev).exists() {
            fs::write(&sandbox_dev, "")
                .map_err(|e| SandboxError::Setup(format!("touch {dev}: {e}")))?;
            mount(
                Some(host_dev.as_str()),
                &sandbox_dev,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| SandboxError::Setup(format!("bind mount {dev}: {e}")))?;
        }
    }

    let proc_dir = root.join("proc");
    fs::create_dir_all(&proc_dir).map_err(|e| SandboxError::Setup(format!("mkdir proc: {e}")))?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| SandboxError::Setup(format!("mount proc: {e}")))?;

    info!(root = ?root, "container ready");
    Ok(())
}

/// Removes all submitted-code artifacts from the scratch areas so the
/// container can be lent out again.
pub fn wipe_container(root: &Path) -> Result<(), SandboxError> {
    for scratch in ["home", "tmp"] {
        let dir = root.join(scratch);
        for entry in
            fs::read_dir(&dir).map_err(|e| SandboxError::Io(format!("scan {scratch}: {e}")))?
        {
            let entry = entry.map_err(|e| SandboxError::Io(format!("scan {scratch}: {e}")))?;
            let path = entry.path();
            let removed = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| SandboxError::Io(format!("wipe {}: {e}", path.display())))?;
        }
    }
    debug!(root = ?root, "container wiped");
    Ok(())
}

/// Tears a container down; best-effort, unmount failures are detached.
pub fn destroy_container(root: &Path) {
    let mount_points = ["proc", "etc", "usr", "lib64", "lib", "bin"];
    for mp in &mount_points {
        let path = root.join(mp);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }
    let dev_dir = root.join("dev");
    if dev_dir.exists() {
        for dev in &["null", "zero", "urandom", "random"] {
            let dev_path = dev_dir.join(dev);
            if dev_path.exists() {
                let _ = umount2(&dev_path, MntFlags::MNT_DETACH);
            }
        }
    }
    let _ = umount2(root, MntFlags::MNT_DETACH);
    let _ = fs::remove_dir_all(root);
}

/// Places a file into the container filesystem with the given mode.
pub fn write_file_in_container(
    root: &Path,
    rel_path: &str,
    content: &[u8],
    mode: u32,
) -> Result<(), SandboxError> {
    let full_path = root.join(rel_path.trim_start_matches('/'));
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent).map_err(|e| SandboxError::Io(format!("mkdir parent: {e}")))?;
    }
    fs::write(&full_path, content).map_err(|e| SandboxError::Io(format!("write file: {e}")))?;
    fs::set_permissions(&full_path, fs::Permissions::from_mode(mode))
        .map_err(|e| SandboxError::Io(format!("chmod: {e}")))?;
    Ok(())
}

/// Runs one command inside the container under fresh PID, mount and
/// network namespaces, capturing stdout/stderr and enforcing the
/// wall-clock deadline.
pub fn run_in_container(root: &Path, config: &RunConfig) -> Result<RawExec, SandboxError> {
    debug!(command = ?config.command, root = ?root, time_ms = config.time_ms, "running in container");

    let (stdout_read, stdout_write) =
        nix::unistd::pipe().map_err(|e| SandboxError::Exec(format!("pipe: {e}")))?;
    let (stderr_read, stderr_write) =
        nix::unistd::pipe().map_err(|e| SandboxError::Exec(format!("pipe: {e}")))?;

    let stdout_write_fd = stdout_write.as_raw_fd();
    let stderr_write_fd = stderr_write.as_raw_fd();

    let root_buf = root.to_path_buf();
    let config_clone = config.clone();

    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE];

    let clone_flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWNET;

    let child_fn = Box::new(move || {
        unsafe {
            libc::dup2(stdout_write_fd, 1);
            libc::dup2(stderr_write_fd, 2);
            libc::close(stdout_write_fd);
            libc::close(stderr_write_fd);
        }

        if let Err(e) = run_child(&root_buf, &config_clone) {
            eprintln!("container child error: {e}");
            return 1;
        }
        0
    });

    let started = Instant::now();
    let child_pid =
        unsafe { clone(child_fn, &mut stack, clone_flags, Some(Signal::SIGCHLD as i32)) }
            .map_err(|e| SandboxError::Exec(format!("clone: {e}")))?;

    drop(stdout_write);
    drop(stderr_write);

    let (status, timed_out) = wait_with_deadline(child_pid, Duration::from_millis(config.time_ms))?;
    let duration_ms = started.elapsed().as_millis() as u64;

    let stdout = read_from_fd(stdout_read);
    let stderr = read_from_fd(stderr_read);

    let (exit_code, signal) = match status {
        WaitStatus::Exited(_, code) => (Some(code), None),
        WaitStatus::Signaled(_, sig, _) => (None, Some(sig as i32)),
        _ => (None, None),
    };

    debug!(exit_code = ?exit_code, signal = ?signal, timed_out, duration_ms, "container run finished");
    Ok(RawExec {
        stdout,
        stderr,
        exit_code,
        signal,
        timed_out,
        duration_ms,
    })
}

/// Non-blocking wait loop; on deadline the worker is SIGKILLed and reaped.
fn wait_with_deadline(pid: Pid, limit: Duration) -> Result<(WaitStatus, bool), SandboxError> {
    let deadline = Instant::now() + limit;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    warn!(pid = ?pid, "wall-clock deadline hit, killing");
                    let _ = kill(pid, Signal::SIGKILL);
                    let status = waitpid(pid, None)
                        .map_err(|e| SandboxError::Exec(format!("waitpid: {e}")))?;
                    return Ok((status, true));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Ok(status) => return Ok((status, false)),
            Err(e) => return Err(SandboxError::Exec(format!("waitpid: {e}"))),
        }
    }
}

fn read_from_fd(fd: OwnedFd) -> String {
    let mut file = unsafe { std::fs::File::from_raw_fd(fd.as_raw_fd()) };
    std::mem::forget(fd); // Don't double-close
    let mut output = String::new();
    let _ = file.read_to_string(&mut output);
    output
}

fn run_child(root: &Path, config: &RunConfig) -> Result<(), String> {
    chroot(root).map_err(|e| format!("chroot: {e}"))?;
    chdir("/home").map_err(|e| format!("chdir: {e}"))?;

    set_resource_limits(config)?;

    // TODO: drop to an unprivileged uid once the multi-threaded setuid
    // deadlock is sorted out; isolation currently rests on the namespaces
    // and chroot.

    let cmd = CString::new(config.command[0].as_str()).map_err(|e| format!("cmd: {e}"))?;
    let args: Vec<CString> = config
        .command
        .iter()
        .map(|s| CString::new(s.as_str()).map_err(|e| format!("arg: {e}")))
        .collect::<Result<_, _>>()?;

    let env = vec![
        CString::new("PATH=/usr/bin:/bin").map_err(|e| format!("env: {e}"))?,
        CString::new("HOME=/home").map_err(|e| format!("env: {e}"))?,
    ];

    execvpe(&cmd, &args, &env).map_err(|e| format!("exec: {e}"))?;
    Ok(())
}

fn set_resource_limits(config: &RunConfig) -> Result<(), String> {
    let cpu_seconds = std::cmp::max(1, config.time_ms.div_ceil(1000));
    setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds)
        .map_err(|e| format!("rlimit cpu: {e}"))?;

    let mem_bytes = config.mem_kb * 1024;
    setrlimit(Resource::RLIMIT_AS, mem_bytes, mem_bytes).map_err(|e| format!("rlimit as: {e}"))?;

    let fsize_bytes = config.fsize_kb * 1024;
    setrlimit(Resource::RLIMIT_FSIZE, fsize_bytes, fsize_bytes)
        .map_err(|e| format!("rlimit fsize: {e}"))?;

    setrlimit(Resource::RLIMIT_NOFILE, config.nofile, config.nofile)
        .map_err(|e| format!("rlimit nofile: {e}"))?;

    setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(|e| format!("rlimit core: {e}"))?;

    setrlimit(Resource::RLIMIT_NPROC, NPROC_LIMIT, NPROC_LIMIT)
        .map_err(|e| format!("rlimit nproc: {e}"))?;

    let stack_bytes = STACK_LIMIT_KB * 1024;
    setrlimit(Resource::RLIMIT_STACK, stack_bytes, stack_bytes)
        .map_err(|e| format!("rlimit stack: {e}"))?;

    Ok(())
}
