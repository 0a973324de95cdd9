//! Resource, network and filesystem policy for one sandboxed run

use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;

/// Proxy target used when no host is allow-listed. Nothing listens there.
pub const BLACKHOLE_PROXY: &str = "http://127.0.0.1:9";

/// Where the scratch area appears inside the bubblewrap jail.
pub const JAIL_WORKDIR: &str = "/workspace";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    /// Namespaced run under `bwrap`: read-only system mounts, writable
    /// scratch, network unshared unless hosts are allow-listed.
    Bubblewrap,
    /// Plain child process with cleared environment and rlimits only.
    Unjailed,
}

#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    /// Program and leading args; the script path is appended.
    pub interpreter: Vec<String>,
    pub script_name: String,
    pub timeout_ms: u64,
    pub memory_limit_mb: u64,
    /// Default-deny: empty means no network.
    pub allowed_hosts: Vec<String>,
    pub isolation: IsolationMode,
    pub max_output_bytes: usize,
    pub path_env: String,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string()],
            script_name: "analysis.py".to_string(),
            timeout_ms: 30_000,
            memory_limit_mb: 512,
            allowed_hosts: Vec::new(),
            isolation: IsolationMode::Bubblewrap,
            max_output_bytes: 1024 * 1024,
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
        }
    }
}

impl SandboxPolicy {
    pub fn with_isolation(mut self, isolation: IsolationMode) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_memory_limit_mb(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self
    }

    pub fn with_interpreter<I, S>(mut self, interpreter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interpreter = interpreter.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allowed_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_hosts = hosts;
        self
    }

    pub fn network_enabled(&self) -> bool {
        !self.allowed_hosts.is_empty()
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    /// Build the command for `scratch`, which already holds the script and
    /// the `data/` directory.
    pub(crate) fn build_command(&self, scratch: &Path) -> Option<Command> {
        let (program, leading) = self.interpreter.split_first()?;

        let mut cmd = match self.isolation {
            IsolationMode::Bubblewrap => {
                let mut cmd = Command::new("bwrap");
                self.add_bwrap_args(&mut cmd, scratch);
                cmd.arg(program);
                cmd.args(leading);
                cmd.arg(format!("{}/{}", JAIL_WORKDIR, self.script_name));
                cmd
            }
            IsolationMode::Unjailed => {
                let mut cmd = Command::new(program);
                cmd.args(leading);
                cmd.arg(scratch.join(&self.script_name));
                cmd.current_dir(scratch);
                cmd
            }
        };

        let workdir: OsString = match self.isolation {
            IsolationMode::Bubblewrap => JAIL_WORKDIR.into(),
            IsolationMode::Unjailed => scratch.as_os_str().to_owned(),
        };
        let mut data_dir = workdir.clone();
        data_dir.push("/data");

        cmd.env_clear();
        cmd.env("PATH", &self.path_env);
        cmd.env("HOME", &workdir);
        cmd.env("TMPDIR", &workdir);
        cmd.env("SANDBOX_DATA_DIR", data_dir);
        cmd.env("SANDBOX_ALLOWED_HOSTS", self.allowed_hosts.join(","));
        cmd.env("PYTHONDONTWRITEBYTECODE", "1");
        cmd.env("PYTHONUNBUFFERED", "1");
        if !self.network_enabled() {
            for key in ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"] {
                cmd.env(key, BLACKHOLE_PROXY);
            }
        }

        Some(cmd)
    }

    fn add_bwrap_args(&self, cmd: &mut Command, scratch: &Path) {
        cmd.arg("--unshare-all");
        cmd.arg("--die-with-parent");
        cmd.arg("--new-session");

        if self.network_enabled() {
            cmd.arg("--share-net");
        }

        for dir in ["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc/ssl/certs"] {
            if Path::new(dir).exists() {
                cmd.arg("--ro-bind").arg(dir).arg(dir);
            }
        }
        if self.network_enabled() && Path::new("/etc/resolv.conf").exists() {
            cmd.arg("--ro-bind")
                .arg("/etc/resolv.conf")
                .arg("/etc/resolv.conf");
        }

        cmd.arg("--proc").arg("/proc");
        cmd.arg("--dev").arg("/dev");
        cmd.arg("--tmpfs").arg("/tmp");
        cmd.arg("--bind").arg(scratch).arg(JAIL_WORKDIR);
        cmd.arg("--chdir").arg(JAIL_WORKDIR);
    }
}
