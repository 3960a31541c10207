// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! uid/gid resolution and ownership-aware filesystem helpers.
//!
//! Every file a pod owns is chowned to the manifest's `run_as` user;
//! these helpers keep the mkdir/chown/chmod dance in one place.

use camino::Utf8Path;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::fs::chown;

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("no such user {0:?}")]
    UnknownUser(String),

    #[error("I/O failure on {path}")]
    Io {
        path: String,
        #[source]
        err: std::io::Error,
    },
}

/// Resolve a user name to its uid and primary gid.
pub fn ids(name: &str) -> Result<(u32, u32), UserError> {
    let user = uzers::get_user_by_name(name)
        .ok_or_else(|| UserError::UnknownUser(name.to_string()))?;
    Ok((user.uid(), user.primary_group_id()))
}

fn io_err(path: &Utf8Path, err: std::io::Error) -> UserError {
    UserError::Io { path: path.to_string(), err }
}

/// Create a directory (and any missing parents) owned by uid/gid with
/// the given mode.
pub async fn mkdir_chown_all(
    path: &Utf8Path,
    uid: u32,
    gid: u32,
    mode: u32,
) -> Result<(), UserError> {
    tokio::fs::create_dir_all(path).await.map_err(|err| io_err(path, err))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|err| io_err(path, err))?;
    chown(path.as_std_path(), Some(uid), Some(gid))
        .map_err(|err| io_err(path, err))?;
    Ok(())
}

/// Chown a single path.
pub fn chown_path(
    path: &Utf8Path,
    uid: u32,
    gid: u32,
) -> Result<(), UserError> {
    chown(path.as_std_path(), Some(uid), Some(gid))
        .map_err(|err| io_err(path, err))
}

/// Chown everything under `root`, including `root` itself.
pub fn chown_recursive(
    root: &Utf8Path,
    uid: u32,
    gid: u32,
) -> Result<(), UserError> {
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|err| UserError::Io {
            path: root.to_string(),
            err: err.into(),
        })?;
        chown(entry.path(), Some(uid), Some(gid)).map_err(|err| {
            UserError::Io { path: entry.path().display().to_string(), err }
        })?;
    }
    Ok(())
}

/// Write one environment file: the file's name is the variable, its
/// contents are the value (the supervisor's env-dir convention).
pub async fn write_env_file(
    env_dir: &Utf8Path,
    name: &str,
    value: &str,
    uid: u32,
    gid: u32,
) -> Result<(), UserError> {
    let path = env_dir.join(name);
    tokio::fs::write(&path, value).await.map_err(|err| io_err(&path, err))?;
    tokio::fs::set_permissions(
        &path,
        std::fs::Permissions::from_mode(0o644),
    )
    .await
    .map_err(|err| io_err(&path, err))?;
    chown(path.as_std_path(), Some(uid), Some(gid))
        .map_err(|err| io_err(&path, err))?;
    Ok(())
}

/// Name of the user this process runs as; what tests use for `run_as`.
pub fn current_username() -> Option<String> {
    uzers::get_current_username()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn test_resolves_current_user() {
        let name = current_username().expect("process has a user");
        let (uid, _gid) = ids(&name).unwrap();
        assert_eq!(uid, uzers::get_current_uid());
    }

    #[test]
    fn test_unknown_user_errors() {
        assert!(matches!(
            ids("no-such-user-here"),
            Err(UserError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn test_env_file_layout() {
        let tmp = Utf8TempDir::new().unwrap();
        let name = current_username().unwrap();
        let (uid, gid) = ids(&name).unwrap();

        let env_dir = tmp.path().join("env");
        mkdir_chown_all(&env_dir, uid, gid, 0o755).await.unwrap();
        write_env_file(&env_dir, "POD_HOME", "/data/pods/web", uid, gid)
            .await
            .unwrap();

        let value =
            tokio::fs::read_to_string(env_dir.join("POD_HOME")).await.unwrap();
        assert_eq!(value, "/data/pods/web");
    }
}
