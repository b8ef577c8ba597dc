use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::Command;
use tracing::trace;

use crate::identity::LoginUser;

/// Turn the server's argument blob into a single-quoted shell fragment.
///
/// Every literal `,,` separates two arguments and becomes `' '`; the whole blob is then wrapped in
/// single quotes. The substitution is unconditional, quotes inside the blob are not escaped.
/// An empty blob yields an empty fragment.
pub fn quote_args(args: &str) -> String {
    if args.is_empty() {
        return String::new();
    }
    format!("'{}'", args.replace(",,", "' '"))
}

/// Command line for one materialised task script.
#[derive(Debug, Clone)]
pub struct ScriptCommand {
    script: PathBuf,
    args: String,
    account: String,
}

impl ScriptCommand {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            args: String::new(),
            account: String::new(),
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// `<script-path> <quoted-args>` as handed to the shell.
    pub fn shell_line(&self) -> String {
        let quoted = quote_args(&self.args);
        if quoted.is_empty() {
            self.script.display().to_string()
        } else {
            format!("{} {}", self.script.display(), quoted)
        }
    }

    /// Build the process for `login`.
    ///
    /// Only a root agent switches identity (`su -c <line> - <account>`); a non-root agent ignores the
    /// target account and runs `sh -c <line>` from its own home directory.
    /// All three standard streams are piped.
    pub fn build(&self, login: &LoginUser) -> Command {
        let line = self.shell_line();

        let mut cmd = if login.is_root() && self.account != "root" && !self.account.is_empty() {
            let mut cmd = Command::new("su");
            cmd.arg("-c").arg(&line).arg("-").arg(&self.account);
            cmd
        } else {
            let mut cmd = shell(&line);
            cmd.current_dir(&login.home);
            cmd
        };

        trace!(target: "ibex.exec", %line, account = %self.account, login = %login.name, "command built");

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        cmd
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_family = "windows")] {
        fn shell(line: &str) -> Command {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(line);
            cmd
        }
    } else {
        fn shell(line: &str) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(cmd: &Command) -> Vec<String> {
        let std = cmd.as_std();
        std::iter::once(std.get_program())
            .chain(std.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn double_comma_splits_arguments() {
        assert_eq!(quote_args("a,,b,,c"), "'a' 'b' 'c'");
        assert_eq!(quote_args("--flag value"), "'--flag value'");
        assert_eq!(quote_args(""), "");
    }

    #[test]
    fn shell_line_without_args_is_bare_path() {
        let cmd = ScriptCommand::new("/meta/1/script");
        assert_eq!(cmd.shell_line(), "/meta/1/script");

        let cmd = cmd.with_args("x,,y");
        assert_eq!(cmd.shell_line(), "/meta/1/script 'x' 'y'");
    }

    #[cfg(unix)]
    #[test]
    fn root_switches_to_target_account() {
        let root = LoginUser::new("root", "/root");
        let cmd = ScriptCommand::new("/meta/1/script")
            .with_account("deploy")
            .build(&root);
        assert_eq!(argv(&cmd), ["su", "-c", "/meta/1/script", "-", "deploy"]);
    }

    #[cfg(unix)]
    #[test]
    fn root_running_as_root_uses_sh_in_home() {
        let root = LoginUser::new("root", "/root");
        let cmd = ScriptCommand::new("/meta/1/script")
            .with_account("root")
            .build(&root);
        assert_eq!(argv(&cmd), ["sh", "-c", "/meta/1/script"]);
        assert_eq!(cmd.as_std().get_current_dir(), Some(Path::new("/root")));
    }

    #[cfg(unix)]
    #[test]
    fn non_root_ignores_account() {
        let user = LoginUser::new("ops", "/home/ops");
        let cmd = ScriptCommand::new("/meta/1/script")
            .with_account("root")
            .with_args("a")
            .build(&user);
        assert_eq!(argv(&cmd), ["sh", "-c", "/meta/1/script 'a'"]);
        assert_eq!(cmd.as_std().get_current_dir(), Some(Path::new("/home/ops")));
    }
}
