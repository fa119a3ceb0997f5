use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::{debug_log, warn_log};

/// Upper bound for one external lookup command
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Finds the process listening on a TCP port
///
/// Lookups are a single best-effort snapshot: every failure (missing tool, unparsable output,
/// timeout) yields `None`.
pub trait PortOwnerResolver: Send + Sync {
    fn find_listening_process_id(&self, port: u16) -> Option<u32>;
}

/// Resolver backed by the platform's socket listing tools
#[derive(Debug, Clone)]
pub struct SystemPortOwnerResolver {
    timeout: Duration,
}

impl Default for SystemPortOwnerResolver {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKUP_TIMEOUT)
    }
}

impl SystemPortOwnerResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    #[cfg(windows)]
    fn lookup(&self, port: u16) -> Option<u32> {
        let output = run_command_with_timeout("netstat", &["-ano", "-p", "tcp"], self.timeout)?;
        parse_netstat_output(&output, port)
    }

    #[cfg(unix)]
    fn lookup(&self, port: u16) -> Option<u32> {
        let lsof_args = [
            "-ti".to_string(),
            format!("tcp:{}", port),
            "-sTCP:LISTEN".to_string(),
        ];
        let from_lsof = run_command_with_timeout("lsof", &lsof_args, self.timeout)
            .and_then(|output| parse_lsof_output(&output));
        // Minimal Linux installs often ship without lsof, ss is part of iproute2
        if from_lsof.is_some() || !cfg!(target_os = "linux") {
            return from_lsof;
        }

        let ss_args = ["-tlnp".to_string(), format!("sport = :{}", port)];
        run_command_with_timeout("ss", &ss_args, self.timeout)
            .and_then(|output| parse_ss_output(&output))
    }

    #[cfg(not(any(unix, windows)))]
    fn lookup(&self, _port: u16) -> Option<u32> {
        None
    }
}

impl PortOwnerResolver for SystemPortOwnerResolver {
    fn find_listening_process_id(&self, port: u16) -> Option<u32> {
        let pid = self.lookup(port);
        debug_log!("Port {} owner lookup: {:?}", port, pid);
        pid
    }
}

/// First pid line of `lsof -t` output
pub fn parse_lsof_output(output: &str) -> Option<u32> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
}

/// First `pid=` field of `ss -tlnp` output, skipping the header row
pub fn parse_ss_output(output: &str) -> Option<u32> {
    output.lines().skip(1).find_map(|line| {
        let pid_part = line.split("pid=").nth(1)?;
        pid_part
            .split(|c: char| !c.is_ascii_digit())
            .next()?
            .parse()
            .ok()
    })
}

/// Pid of the first `LISTENING` row of `netstat -ano` whose local address uses `port`
pub fn parse_netstat_output(output: &str, port: u16) -> Option<u32> {
    let port_suffix = format!(":{}", port);
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 || !line.contains("LISTENING") {
            return None;
        }
        if !parts[1].ends_with(&port_suffix) {
            return None;
        }
        parts.last()?.parse().ok()
    })
}

/// Runs a command and returns its stdout, or `None` if it can't start or outlives `timeout`
fn run_command_with_timeout<S: AsRef<str>>(
    program: &str,
    args: &[S],
    timeout: Duration,
) -> Option<String> {
    let mut command = Command::new(program);
    command
        .args(args.iter().map(|arg| arg.as_ref()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(0x0800_0000);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            debug_log!("Could not run {}: {}", program, e);
            return None;
        }
    };

    let mut stdout = child.stdout.take()?;
    let reader = thread::spawn(move || {
        let mut output = String::new();
        let _ = stdout.read_to_string(&mut output);
        output
    });

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() < deadline => thread::sleep(COMMAND_POLL_INTERVAL),
            Ok(None) => {
                warn_log!("{} did not finish within {:?}, killing it", program, timeout);
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Err(e) => {
                debug_log!("Failed to wait for {}: {}", program, e);
                let _ = child.kill();
                return None;
            }
        }
    }

    reader.join().ok()
}
