//! Remote side of mosh negotiation: probing for `mosh-server`, optionally
//! installing it, and starting it to obtain connect parameters.

use tether_core::{
    parse_connect_output, shell_quote, MoshBootstrapError, MoshConnectInfo, MoshOptions,
    TetherError, TetherResult,
};

use super::RemoteExec;

/// Printed by the probe when `mosh-server` is on the search path.
pub(crate) const PROBE_MARKER: &str = "__tether_mosh_server_ok__";

/// Directories searched in addition to the login `PATH`; non-interactive
/// exec sessions often miss package-manager prefixes.
const EXTRA_PATH: &str = "/usr/local/bin:/opt/homebrew/bin:/usr/bin:/snap/bin";

/// Program run under `mosh-server` when no startup command is given.
const DEFAULT_PROGRAM: &str = "exec \"${SHELL:-/bin/sh}\" -l";

const LOCALE: &str = "LANG=en_US.UTF-8";

/// Package managers tried in order: (binary, install command, needs root).
const PACKAGE_MANAGERS: &[(&str, &str, bool)] = &[
    ("apt-get", "DEBIAN_FRONTEND=noninteractive apt-get install -y mosh", true),
    ("dnf", "dnf install -y mosh", true),
    ("yum", "yum install -y mosh", true),
    ("apk", "apk add --no-cache mosh", true),
    ("pacman", "pacman -S --noconfirm mosh", true),
    ("zypper", "zypper --non-interactive install mosh", true),
    ("brew", "brew install mosh", false),
];

/// Drives remote `mosh-server` negotiation over any [`RemoteExec`].
#[derive(Debug, Clone, Default)]
pub struct MoshNegotiator {
    options: MoshOptions,
}

impl MoshNegotiator {
    pub fn new(options: MoshOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MoshOptions {
        &self.options
    }

    /// Whether `mosh-server` can be found on the remote host.
    ///
    /// Every failure, including a timeout, counts as "not available".
    pub async fn is_server_available(&self, exec: &dyn RemoteExec) -> bool {
        match exec.execute(&probe_command(), self.options.probe_timeout).await {
            Ok(output) => {
                let found = output.contains(PROBE_MARKER);
                tracing::debug!("mosh-server probe: found={}", found);
                found
            }
            Err(e) => {
                tracing::debug!("mosh-server probe failed: {}", e);
                false
            }
        }
    }

    /// Start `mosh-server` and parse the port and key it announces.
    pub async fn bootstrap_connect_info(
        &self,
        exec: &dyn RemoteExec,
        startup_command: Option<&str>,
    ) -> Result<MoshConnectInfo, MoshBootstrapError> {
        let command = self.bootstrap_command(startup_command);
        tracing::debug!("bootstrapping mosh-server: {}", command);

        let output = match exec.execute(&command, self.options.bootstrap_timeout).await {
            Ok(output) => output,
            Err(TetherError::Timeout) => return Err(MoshBootstrapError::TimedOut),
            Err(e) => return Err(MoshBootstrapError::ProcessExited(e.to_string())),
        };

        let info = parse_connect_output(&output)?;
        tracing::info!("mosh-server listening on udp port {}", info.port);
        Ok(info)
    }

    /// Install `mosh-server` with the first package manager found.
    ///
    /// Succeeds only when a fresh probe finds the server afterwards; the
    /// installer's output is the error detail otherwise.
    pub async fn install_server(&self, exec: &dyn RemoteExec) -> TetherResult<()> {
        tracing::info!("installing mosh-server on the remote host");
        let output = exec
            .execute(&install_command(), self.options.install_timeout)
            .await?;

        if output.contains(PROBE_MARKER) {
            tracing::info!("mosh-server installed");
            Ok(())
        } else {
            let detail = output.trim();
            Err(TetherError::MoshBootstrapFailed(if detail.is_empty() {
                "mosh-server installation failed".to_string()
            } else {
                detail.to_string()
            }))
        }
    }

    /// Remote command line that starts `mosh-server` for `startup_command`.
    pub fn bootstrap_command(&self, startup_command: Option<&str>) -> String {
        let (low, high) = self.options.port_range;
        let program = resolve_startup_command(startup_command);
        format!(
            "PATH=\"$PATH:{EXTRA_PATH}\" mosh-server new -s -c 256 -l {} -p {low}:{high} -- sh -c {} 2>&1",
            shell_quote(LOCALE),
            shell_quote(&program),
        )
    }
}

fn probe_command() -> String {
    format!("PATH=\"$PATH:{EXTRA_PATH}\"; command -v mosh-server >/dev/null 2>&1 && echo {PROBE_MARKER}")
}

fn install_command() -> String {
    let mut script = String::from("SUDO=''; [ \"$(id -u)\" = 0 ] || SUDO='sudo -n'; ");
    for (index, (binary, install, needs_root)) in PACKAGE_MANAGERS.iter().enumerate() {
        let keyword = if index == 0 { "if" } else { "elif" };
        let prefix = if *needs_root { "$SUDO " } else { "" };
        script.push_str(&format!(
            "{keyword} command -v {binary} >/dev/null 2>&1; then {prefix}{install}; "
        ));
    }
    script.push_str("else echo 'no supported package manager found'; fi; ");
    script.push_str(&probe_command());
    format!("{{ {script}; }} 2>&1")
}

/// The program `mosh-server` should run.
///
/// A login shell when nothing is given. A `sh -c '...'` style wrapper is
/// unwrapped to its inner command, since the bootstrap adds its own.
pub fn resolve_startup_command(startup_command: Option<&str>) -> String {
    match startup_command.map(str::trim).filter(|c| !c.is_empty()) {
        None => DEFAULT_PROGRAM.to_string(),
        Some(command) => unwrap_shell_wrapper(command).unwrap_or(command).to_string(),
    }
}

fn unwrap_shell_wrapper(command: &str) -> Option<&str> {
    let (shell, rest) = command.split_once(char::is_whitespace)?;
    let shell_name = shell.rsplit('/').next().unwrap_or(shell);
    if !matches!(shell_name, "sh" | "bash" | "zsh" | "dash" | "ksh" | "fish") {
        return None;
    }

    let mut rest = rest.trim_start();
    loop {
        let (flag, tail) = rest.split_once(char::is_whitespace)?;
        if !flag.starts_with('-') || flag.len() < 2 {
            return None;
        }
        rest = tail.trim_start();
        if flag.ends_with('c') {
            break;
        }
    }

    let quote = rest.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let inner = rest.strip_prefix(quote)?.strip_suffix(quote)?;
    if inner.contains(quote) || (quote == '"' && inner.contains(['\\', '$', '`'])) {
        return None;
    }
    Some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tether_core::IoFuture;

    /// Answers commands from a fixed list of (needle, reply) pairs.
    struct Canned {
        replies: Vec<(&'static str, TetherResult<String>)>,
        seen: Arc<Mutex<Vec<(String, Duration)>>>,
    }

    impl Canned {
        fn new(replies: Vec<(&'static str, TetherResult<String>)>) -> Self {
            Self {
                replies,
                seen: Arc::default(),
            }
        }

        fn seen(&self) -> Vec<(String, Duration)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl RemoteExec for Canned {
        fn execute<'a>(&'a self, command: &'a str, timeout: Duration) -> IoFuture<'a, String> {
            self.seen.lock().unwrap().push((command.to_string(), timeout));
            let reply = self
                .replies
                .iter()
                .find(|(needle, _)| command.contains(needle))
                .map(|(_, reply)| match reply {
                    Ok(out) => Ok(out.clone()),
                    Err(TetherError::Timeout) => Err(TetherError::Timeout),
                    Err(e) => Err(TetherError::Unknown(e.to_string())),
                })
                .unwrap_or_else(|| Ok(String::new()));
            Box::pin(async move { reply })
        }
    }

    #[tokio::test]
    async fn probe_detects_marker() {
        let exec = Canned::new(vec![("command -v mosh-server", Ok(format!("{PROBE_MARKER}\n")))]);
        let negotiator = MoshNegotiator::default();
        assert!(negotiator.is_server_available(&exec).await);
        assert_eq!(exec.seen()[0].1, Duration::from_secs(8));
    }

    #[tokio::test]
    async fn probe_failures_mean_unavailable() {
        let negotiator = MoshNegotiator::default();
        let empty = Canned::new(vec![]);
        assert!(!negotiator.is_server_available(&empty).await);

        let timed_out = Canned::new(vec![("mosh-server", Err(TetherError::Timeout))]);
        assert!(!negotiator.is_server_available(&timed_out).await);
    }

    #[tokio::test]
    async fn bootstrap_parses_banner_amid_noise() {
        let output = "\nMOSH CONNECT 60001 ABCDEFGHIJKLMNOPQRSTUV\n\nmosh-server (mosh 1.4.0)\n";
        let exec = Canned::new(vec![("mosh-server new", Ok(output.to_string()))]);
        let info = MoshNegotiator::default()
            .bootstrap_connect_info(&exec, None)
            .await
            .unwrap();
        assert_eq!(info.port, 60001);
        assert_eq!(info.key, "ABCDEFGHIJKLMNOPQRSTUV");
        assert_eq!(exec.seen()[0].1, Duration::from_secs(25));
    }

    #[tokio::test]
    async fn bootstrap_reports_missing_server() {
        let output = "sh: 1: mosh-server: not found\n";
        let exec = Canned::new(vec![("mosh-server new", Ok(output.to_string()))]);
        let err = MoshNegotiator::default()
            .bootstrap_connect_info(&exec, None)
            .await
            .unwrap_err();
        assert_eq!(err, MoshBootstrapError::ServerMissing);
    }

    #[tokio::test]
    async fn bootstrap_timeout_maps_to_timed_out() {
        let exec = Canned::new(vec![("mosh-server new", Err(TetherError::Timeout))]);
        let err = MoshNegotiator::default()
            .bootstrap_connect_info(&exec, None)
            .await
            .unwrap_err();
        assert_eq!(err, MoshBootstrapError::TimedOut);
    }

    #[tokio::test]
    async fn install_requires_successful_reprobe() {
        let negotiator = MoshNegotiator::default();

        let ok = Canned::new(vec![("apt-get", Ok(format!("Setting up mosh\n{PROBE_MARKER}\n")))]);
        negotiator.install_server(&ok).await.unwrap();
        assert_eq!(ok.seen()[0].1, Duration::from_secs(180));

        let failed = Canned::new(vec![("apt-get", Ok("sudo: a password is required\n".into()))]);
        match negotiator.install_server(&failed).await {
            Err(TetherError::MoshBootstrapFailed(detail)) => {
                assert_eq!(detail, "sudo: a password is required")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn install_script_tries_managers_in_order() {
        let script = install_command();
        let apt = script.find("apt-get").unwrap();
        let dnf = script.find("dnf").unwrap();
        let brew = script.find("brew").unwrap();
        assert!(apt < dnf && dnf < brew);
        assert!(script.contains("sudo -n"));
        assert!(script.contains("then brew install mosh"));
        assert!(script.ends_with("} 2>&1"));
    }

    #[test]
    fn bootstrap_command_defaults_to_login_shell() {
        let command = MoshNegotiator::default().bootstrap_command(None);
        assert!(command.contains("mosh-server new -s -c 256 -l 'LANG=en_US.UTF-8' -p 60001:60999 -- sh -c "));
        assert!(command.contains("'exec \"${SHELL:-/bin/sh}\" -l'"));
        assert!(command.ends_with(" 2>&1"));
    }

    #[test]
    fn bootstrap_command_quotes_startup() {
        let command = MoshNegotiator::default().bootstrap_command(Some("echo it's here"));
        assert!(command.contains("-- sh -c 'echo it'\\''s here'"));
    }

    #[test]
    fn startup_wrappers_are_unwrapped() {
        assert_eq!(
            resolve_startup_command(Some("bash -lc 'tmux attach -t main'")),
            "tmux attach -t main"
        );
        assert_eq!(resolve_startup_command(Some("/bin/zsh -c \"htop\"")), "htop");
        assert_eq!(resolve_startup_command(Some("sh -l -c 'top'")), "top");
        assert_eq!(resolve_startup_command(Some("htop")), "htop");
        assert_eq!(resolve_startup_command(Some("  ")), DEFAULT_PROGRAM);
        assert_eq!(resolve_startup_command(None), DEFAULT_PROGRAM);
    }

    #[test]
    fn complex_wrappers_are_kept_whole() {
        let quoted = "sh -c \"echo $HOME\"";
        assert_eq!(resolve_startup_command(Some(quoted)), quoted);
        let python = "python3 -c 'print(1)'";
        assert_eq!(resolve_startup_command(Some(python)), python);
    }
}
