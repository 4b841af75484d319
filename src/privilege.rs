//! Effective-uid/gid privilege helpers (§5).
//!
//! Two distinct mechanisms, both grounded in the original `isptar`'s
//! `misc::Su` class and its `SetEUid` function:
//!
//! - [`ElevateGuard`] is the RAII "restore root for one sensitive
//!   operation" guard: if the real uid is 0 but the effective id has
//!   been dropped (by [`drop_to_user`] or by the OS), it raises euid/egid
//!   back to 0 for its scope and restores the prior ids on drop — even on
//!   an unwinding panic.
//! - [`drop_to_user`] is the one-way `-U user` switch: it permanently
//!   lowers the process's effective identity, including its supplementary
//!   group list, to the named user for the remainder of the command.

use nix::unistd::{self, Gid, Uid, User};

use crate::error::{Error, Result};

/// Restores the effective uid/gid active when the guard was created.
/// A no-op to construct and drop unless the real uid is root and the
/// effective id has already been lowered below it.
pub struct ElevateGuard {
    prev_euid: Uid,
    prev_egid: Gid,
    active: bool,
}

impl ElevateGuard {
    pub fn new() -> Result<Self> {
        let prev_euid = unistd::geteuid();
        let prev_egid = unistd::getegid();
        let mut active = false;

        if unistd::getuid().is_root() {
            if !prev_euid.is_root() {
                unistd::seteuid(Uid::from_raw(0))?;
                active = true;
            }
            if !prev_egid.is_root() {
                unistd::setegid(Gid::from_raw(0))?;
                active = true;
            }
        }

        Ok(Self { prev_euid, prev_egid, active })
    }
}

impl Drop for ElevateGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = unistd::setegid(self.prev_egid);
            let _ = unistd::seteuid(self.prev_euid);
        }
    }
}

/// Permanently switch the process's effective identity to `user` (a
/// numeric uid or a username), including its supplementary group list.
/// Backs the `-U user` option on `create`/`extract`/`client`/`server`.
pub fn drop_to_user(user: &str) -> Result<()> {
    let target = match user.parse::<u32>() {
        Ok(uid) => User::from_uid(Uid::from_raw(uid))?,
        Err(_) => User::from_name(user)?,
    }
    .ok_or_else(|| Error::usage(format!("unknown user '{user}'")))?;

    let name = std::ffi::CString::new(target.name.as_str())
        .map_err(|_| Error::usage(format!("user name '{}' contains a NUL byte", target.name)))?;
    unistd::initgroups(&name, target.gid)?;
    unistd::setegid(target.gid)?;
    unistd::seteuid(target.uid)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevate_guard_is_inert_for_a_non_root_process() {
        // Under a normal (non-root) test runner this never touches ids.
        let guard = ElevateGuard::new().unwrap();
        assert!(!guard.active || unistd::getuid().is_root());
    }

    #[test]
    fn drop_to_user_rejects_unknown_numeric_uid() {
        let err = drop_to_user("4294967295").unwrap_err();
        assert!(matches!(err, Error::Usage(_)) || matches!(err, Error::Nix(_)));
    }
}
