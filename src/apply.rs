use log::{debug, info};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// nftables file (re)written on each activation
    #[serde(default = "default_path")]
    pub path: PathBuf,
    /// syntax check, run with the file path as last argument
    #[serde(default = "default_check")]
    pub check: Exec,
    /// reload of the enforcing service
    #[serde(default = "default_reload")]
    pub reload: Exec,
}
fn default_path() -> PathBuf {
    "/etc/nftables/firewall-policy-controller.v4".into()
}
fn default_check() -> Exec {
    Exec {
        cmd: "/usr/sbin/nft".into(),
        args: vec!["-c".into(), "-f".into()],
    }
}
fn default_reload() -> Exec {
    Exec {
        cmd: "/bin/systemctl".into(),
        args: vec!["reload".into(), "nftables.service".into()],
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: default_path(),
            check: default_check(),
            reload: default_reload(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Exec {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Exec {
    async fn output(&self, path: Option<&Path>) -> std::io::Result<Output> {
        let mut cmd = Command::new(&self.cmd);
        cmd.args(&self.args);
        if let Some(path) = path {
            cmd.arg(path);
        }
        cmd.stdin(Stdio::null());
        cmd.output().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Write,
    Validate,
    Reload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Write => "write",
            Self::Validate => "validate",
            Self::Reload => "reload",
        })
    }
}

pub type Result = std::result::Result<(), Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("write {path} failed: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("check exec failed: {0}")]
    CheckFailed(std::io::Error),
    #[error("rules rejected by check (exit code {code:?}): {output}")]
    Invalid { code: Option<i32>, output: String },
    #[error("reload exec failed: {0}")]
    ReloadFailed(std::io::Error),
    #[error("reload: exit code {code:?}: {output}")]
    ReloadCommandFailed { code: Option<i32>, output: String },
}

impl Error {
    pub fn stage(&self) -> Stage {
        use Error as E;
        match self {
            E::Write { .. } => Stage::Write,
            E::CheckFailed(_) | E::Invalid { .. } => Stage::Validate,
            E::ReloadFailed(_) | E::ReloadCommandFailed { .. } => Stage::Reload,
        }
    }
}

/// Makes a rendered document the live firewall configuration.
pub trait Activate {
    /// On error, the running configuration is the previous one.
    fn apply(&self, document: &str) -> impl Future<Output = Result> + Send;
}

pub struct Activator {
    cfg: Config,
}

impl Activator {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    pub fn path(&self) -> &Path {
        &self.cfg.path
    }
}

impl Activate for Activator {
    async fn apply(&self, document: &str) -> Result {
        let path = self.cfg.path.as_path();

        tokio::fs::write(path, document)
            .await
            .map_err(|source| Error::Write {
                path: path.display().to_string(),
                source,
            })?;

        debug!("checking {}", path.display());
        let out = (self.cfg.check.output(Some(path)).await).map_err(Error::CheckFailed)?;
        if !out.status.success() {
            // the rejected file stays for inspection
            return Err(Error::Invalid {
                code: out.status.code(),
                output: diagnostic(&out),
            });
        }

        let out = (self.cfg.reload.output(None).await).map_err(Error::ReloadFailed)?;
        if !out.status.success() {
            return Err(Error::ReloadCommandFailed {
                code: out.status.code(),
                output: diagnostic(&out),
            });
        }

        info!("activated {}", path.display());
        Ok(())
    }
}

fn diagnostic(out: &Output) -> String {
    let mut s = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        if !s.is_empty() {
            s.push('\n');
        }
        s.push_str(stdout);
    }
    s
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn exec(cmd: &str, args: &[&str]) -> Exec {
        Exec {
            cmd: cmd.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn activator(dir: &Path, check: Exec, reload: Exec) -> Activator {
        Activator::new(Config {
            path: dir.join("rules.v4"),
            check,
            reload,
        })
    }

    fn touch(marker: &Path) -> Exec {
        exec("sh", &["-c", &format!("touch {}", marker.display())])
    }

    #[tokio::test]
    async fn test_apply() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reloaded");

        // the check receives the file path as $0
        let check = exec("sh", &["-c", "grep -q 'counter accept' \"$0\""]);
        let a = activator(dir.path(), check, touch(&marker));

        a.apply("counter accept\n").await.unwrap();

        assert_eq!(
            std::fs::read_to_string(a.path()).unwrap(),
            "counter accept\n"
        );
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let a = activator(dir.path(), exec("true", &[]), exec("true", &[]));

        a.apply("first version, longer than the second\n").await.unwrap();
        a.apply("second\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(a.path()).unwrap(), "second\n");
    }

    #[tokio::test]
    async fn test_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reloaded");

        let check = exec("sh", &["-c", "echo \"syntax error in $0\" >&2; exit 1"]);
        let a = activator(dir.path(), check, touch(&marker));

        let err = a.apply("bogus {\n").await.unwrap_err();

        assert_eq!(err.stage(), Stage::Validate);
        match err {
            Error::Invalid { code, output } => {
                assert_eq!(code, Some(1));
                assert!(output.starts_with("syntax error in "));
            }
            e => panic!("unexpected error: {e}"),
        }

        // left for inspection, never loaded
        assert_eq!(std::fs::read_to_string(a.path()).unwrap(), "bogus {\n");
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_reload_failure() {
        let dir = tempfile::tempdir().unwrap();
        let a = activator(dir.path(), exec("true", &[]), exec("false", &[]));

        let err = a.apply("counter accept\n").await.unwrap_err();
        assert_eq!(err.stage(), Stage::Reload);
    }

    #[tokio::test]
    async fn test_missing_commands() {
        let dir = tempfile::tempdir().unwrap();

        let a = activator(
            dir.path(),
            exec("/nonexistent/nft", &[]),
            exec("true", &[]),
        );
        let err = a.apply("x\n").await.unwrap_err();
        assert!(matches!(err, Error::CheckFailed(_)));
        assert_eq!(err.stage(), Stage::Validate);

        let a = activator(
            dir.path(),
            exec("true", &[]),
            exec("/nonexistent/systemctl", &[]),
        );
        let err = a.apply("x\n").await.unwrap_err();
        assert!(matches!(err, Error::ReloadFailed(_)));
    }

    #[tokio::test]
    async fn test_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let a = activator(
            &dir.path().join("missing-dir"),
            exec("true", &[]),
            exec("true", &[]),
        );

        let err = a.apply("x\n").await.unwrap_err();
        assert_eq!(err.stage(), Stage::Write);
    }

    #[test]
    fn test_config_defaults() {
        let cfg: Config = serde_yaml::from_str("check: { cmd: nft, args: [-c, -f] }").unwrap();
        assert_eq!(
            cfg.path,
            PathBuf::from("/etc/nftables/firewall-policy-controller.v4")
        );
        assert_eq!(cfg.check.cmd, "nft");
        assert_eq!(cfg.reload.cmd, "/bin/systemctl");
        assert_eq!(cfg.reload.args, vec!["reload", "nftables.service"]);
    }
}
