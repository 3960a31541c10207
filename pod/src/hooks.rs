// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle hooks: operator-supplied executables run around pod
//! transitions.
//!
//! Each phase is a directory under the hooks root; every executable in
//! it runs with the manifest being applied as JSON on stdin. Hooks are
//! strictly advisory: a missing phase directory, a hook that fails to
//! spawn, and a hook that exits non-zero are all logged and otherwise
//! ignored.

use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;

use camino::Utf8PathBuf;
use slog::{Logger, debug, o, warn};
use slog_error_chain::InlineErrorChain;
use stevedore_common::manifest::Manifest;
use tokio::io::AsyncWriteExt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPhase {
    BeforeInstall,
    AfterInstall,
    BeforeLaunch,
    After,
}

impl HookPhase {
    pub fn dir_name(&self) -> &'static str {
        match self {
            HookPhase::BeforeInstall => "before_install",
            HookPhase::AfterInstall => "after_install",
            HookPhase::BeforeLaunch => "before_launch",
            HookPhase::After => "after",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Hooks {
    root: Utf8PathBuf,
    log: Logger,
}

impl Hooks {
    pub fn new(root: Utf8PathBuf, log: &Logger) -> Hooks {
        Hooks { root, log: log.new(o!("component" => "Hooks")) }
    }

    /// Run every executable in the phase directory, in name order, with
    /// `manifest` serialized as JSON on stdin.
    pub async fn run(&self, phase: HookPhase, manifest: &Manifest) {
        let dir = self.root.join(phase.dir_name());
        let log = self.log.new(o!(
            "phase" => phase.dir_name(),
            "pod" => manifest.id().to_string(),
        ));

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(
                    log,
                    "failed to read hooks directory";
                    "path" => dir.as_str(),
                    "error" => InlineErrorChain::new(&err),
                );
                return;
            }
        };

        let payload = match serde_json::to_vec(manifest) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    log,
                    "failed to encode manifest for hooks";
                    "error" => InlineErrorChain::new(&err),
                );
                return;
            }
        };

        let mut hooks = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => hooks.push(entry.path()),
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        log,
                        "failed to enumerate hooks";
                        "path" => dir.as_str(),
                        "error" => InlineErrorChain::new(&err),
                    );
                    break;
                }
            }
        }
        hooks.sort();

        for hook in hooks {
            let Ok(metadata) = tokio::fs::metadata(&hook).await else {
                continue;
            };
            if !metadata.is_file()
                || metadata.permissions().mode() & 0o111 == 0
            {
                continue;
            }
            let display = hook.display().to_string();
            debug!(log, "running hook"; "hook" => &display);
            if let Err(err) = run_hook(&hook, &payload).await {
                warn!(
                    log,
                    "hook failed";
                    "hook" => &display,
                    "error" => err,
                );
            }
        }
    }
}

async fn run_hook(
    hook: &std::path::Path,
    payload: &[u8],
) -> Result<(), String> {
    let mut child = tokio::process::Command::new(hook)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| format!("failed to spawn: {err}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(payload).await {
            return Err(format!("failed to write manifest to stdin: {err}"));
        }
        // Closing stdin lets hooks that read to EOF finish.
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| format!("failed to await hook: {err}"))?;
    if !output.status.success() {
        return Err(format!(
            "exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use stevedore_common::logging::test_logger;
    use stevedore_common::manifest::ManifestBuilder;

    #[tokio::test]
    async fn test_hooks_receive_manifest_json() {
        let tmp = Utf8TempDir::new().unwrap();
        let phase_dir = tmp.path().join("after");
        tokio::fs::create_dir_all(&phase_dir).await.unwrap();

        let captured = tmp.path().join("captured.json");
        let script = format!("#!/bin/sh\ncat > {captured}\n");
        let hook_path = phase_dir.join("10-capture");
        tokio::fs::write(&hook_path, script).await.unwrap();
        tokio::fs::set_permissions(
            &hook_path,
            std::fs::Permissions::from_mode(0o755),
        )
        .await
        .unwrap();

        let hooks =
            Hooks::new(tmp.path().to_owned(), &test_logger("hooks"));
        let manifest = ManifestBuilder::new("web").status_port(8080).build();
        hooks.run(HookPhase::After, &manifest).await;

        let raw = tokio::fs::read_to_string(&captured).await.unwrap();
        let replayed: serde_json::Value =
            serde_json::from_str(&raw).unwrap();
        assert_eq!(replayed["id"], "web");
        assert_eq!(replayed["status_port"], 8080);
    }

    #[tokio::test]
    async fn test_failing_and_missing_hooks_are_ignored() {
        let tmp = Utf8TempDir::new().unwrap();
        let hooks =
            Hooks::new(tmp.path().to_owned(), &test_logger("hooks"));
        let manifest = ManifestBuilder::new("web").build();

        // No phase directory at all.
        hooks.run(HookPhase::BeforeInstall, &manifest).await;

        // A hook that exits non-zero.
        let phase_dir = tmp.path().join("before_launch");
        tokio::fs::create_dir_all(&phase_dir).await.unwrap();
        let hook_path = phase_dir.join("explode");
        tokio::fs::write(&hook_path, "#!/bin/sh\nexit 3\n").await.unwrap();
        tokio::fs::set_permissions(
            &hook_path,
            std::fs::Permissions::from_mode(0o755),
        )
        .await
        .unwrap();
        hooks.run(HookPhase::BeforeLaunch, &manifest).await;
    }
}
