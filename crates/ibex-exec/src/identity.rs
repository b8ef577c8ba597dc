use std::path::PathBuf;

use crate::error::{ExecError, ExecResult};

/// The account the agent itself runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginUser {
    pub name: String,
    pub home: PathBuf,
}

impl LoginUser {
    pub fn new(name: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            home: home.into(),
        }
    }

    /// Look up the real uid of this process in the user database.
    #[cfg(unix)]
    pub fn current() -> ExecResult<Self> {
        use nix::unistd::{Uid, User};

        let uid = Uid::current();
        match User::from_uid(uid) {
            Ok(Some(user)) => Ok(Self::new(user.name, user.dir)),
            Ok(None) => Err(ExecError::LoginUser(format!("no passwd entry for uid {uid}"))),
            Err(e) => Err(ExecError::LoginUser(e.to_string())),
        }
    }

    #[cfg(not(unix))]
    pub fn current() -> ExecResult<Self> {
        let name = std::env::var("USERNAME").map_err(|e| ExecError::LoginUser(e.to_string()))?;
        let home =
            std::env::var("USERPROFILE").map_err(|e| ExecError::LoginUser(e.to_string()))?;
        Ok(Self::new(name, home))
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.name == "root"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn current_user_resolves() {
        let user = LoginUser::current().unwrap();
        assert!(!user.name.is_empty());
        assert_eq!(user.is_root(), nix::unistd::Uid::current().is_root());
    }
}
