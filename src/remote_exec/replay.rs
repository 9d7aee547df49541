//! Replays a stage's decorated instruction list against a connected guest
//! (spec §4.4).

use std::collections::HashMap;

use async_trait::async_trait;
use stacked_errors::{bail_locationless, Result, StackableErr};

use super::client::GuestClient;
use crate::{
    build_state::DecoratedInstruction,
    dockerfile::Instruction,
    source::{IgnoreMatcher, ResolvedResource},
};

/// Resolves the content of a non-`--from` `ADD`/`COPY` source. A thin seam so
/// tests can supply fixed bytes instead of touching the filesystem/network
/// (the concrete implementation lives alongside `src/source`).
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(&self, src: &str, dst: &str, chown: Option<&str>) -> Result<Vec<ResolvedResource>>;
}

/// Dependency-stage build outputs, keyed by stage name (spec §4.4: "the
/// resulting artifacts are carried as `ResolvedResource` values keyed by
/// stage name").
#[derive(Debug, Clone, Default)]
pub struct StageArtifacts {
    pub by_stage: HashMap<String, Vec<ResolvedResource>>,
}

impl StageArtifacts {
    pub fn insert(&mut self, stage: impl Into<String>, artifacts: Vec<ResolvedResource>) {
        self.by_stage.insert(stage.into(), artifacts);
    }

    /// Artifacts from `stage` whose recorded source path has `copy_src` as a
    /// prefix. Spec §4.4: "absence of matches is an error."
    fn matching(&self, stage: &str, copy_src: &str) -> Result<Vec<&ResolvedResource>> {
        let artifacts = self
            .by_stage
            .get(stage)
            .stack_err_with(|| format!("COPY --from={stage} references an unbuilt stage"))?;
        let matches: Vec<&ResolvedResource> = artifacts
            .iter()
            .filter(|a| a.source.starts_with(copy_src))
            .collect();
        if matches.is_empty() {
            bail_locationless!(
                "COPY --from={stage} {copy_src} matched no artifacts produced by that stage"
            );
        }
        Ok(matches)
    }
}

/// Runs `pre_hooks`, then every decorated instruction in order, then
/// `post_hooks`, against `guest`. Any failure aborts the replay; the caller
/// is responsible for stopping the guest (spec §4.4: "A failure of any
/// remote operation aborts the build and triggers VM stop").
pub async fn replay_stage(
    guest: &dyn GuestClient,
    instructions: &[DecoratedInstruction],
    excludes: &IgnoreMatcher,
    resolver: &dyn ResourceResolver,
    dep_artifacts: &StageArtifacts,
    pre_hooks: &[String],
    post_hooks: &[String],
) -> Result<()> {
    for hook in pre_hooks {
        run_hook(guest, hook)
            .await
            .stack_err_with(|| format!("replay_stage -> pre-build hook {hook:?}"))?;
    }
    for decorated in instructions {
        replay_one(guest, decorated, excludes, resolver, dep_artifacts)
            .await
            .stack_err_with(|| {
                format!(
                    "replay_stage -> instruction {:?}",
                    decorated.instruction.source()
                )
            })?;
    }
    for hook in post_hooks {
        run_hook(guest, hook)
            .await
            .stack_err_with(|| format!("replay_stage -> post-build hook {hook:?}"))?;
    }
    Ok(())
}

async fn run_hook(guest: &dyn GuestClient, hook: &str) -> Result<()> {
    let result = guest
        .run_shell(
            &["/bin/sh".to_owned(), "-c".to_owned()],
            "0:0",
            "/",
            &Default::default(),
            hook,
        )
        .await
        .stack_err("run_hook")?;
    if !result.success() {
        bail_locationless!(
            "hook {hook:?} exited {}: {}",
            result.exit_code,
            String::from_utf8_lossy(&result.stderr)
        );
    }
    Ok(())
}

async fn replay_one(
    guest: &dyn GuestClient,
    decorated: &DecoratedInstruction,
    excludes: &IgnoreMatcher,
    resolver: &dyn ResourceResolver,
    dep_artifacts: &StageArtifacts,
) -> Result<()> {
    match &decorated.instruction {
        Instruction::Run { command, .. } => {
            let env = decorated.env.clone().unwrap_or_default();
            let shell = decorated
                .shell
                .clone()
                .unwrap_or_else(|| vec!["/bin/sh".to_owned(), "-c".to_owned()]);
            // `run_shell` owns composing the `cd`/`export`/`sudo -u` preamble
            // around `command` (spec §4.4); composing it here too would
            // double it up.
            let result = guest
                .run_shell(&shell, &decorated.user, &decorated.workdir, &env, command)
                .await
                .stack_err("RUN")?;
            if !result.success() {
                bail_locationless!(
                    "RUN {command:?} exited {}: {}",
                    result.exit_code,
                    String::from_utf8_lossy(&result.stderr)
                );
            }
            Ok(())
        }
        Instruction::Add { src, dst, chown, .. } => {
            replay_add_copy(guest, src, dst, chown.as_deref(), None, excludes, resolver).await
        }
        Instruction::Copy {
            src,
            dst,
            from_stage,
            chown,
            ..
        } => {
            replay_add_copy(
                guest,
                src,
                dst,
                chown.as_deref(),
                from_stage.as_deref(),
                excludes,
                resolver,
            )
            .await?;
            if let Some(stage) = from_stage {
                for artifact in dep_artifacts.matching(stage, src)? {
                    if excludes.is_excluded(std::path::Path::new(&artifact.source), false) {
                        tracing::debug!(source = %artifact.source, "excluded by .dockerignore, skipping");
                        continue;
                    }
                    guest
                        .upload(dst, &artifact.bytes, artifact.mode, artifact.chown.as_deref())
                        .await
                        .stack_err_with(|| format!("COPY --from={stage} -> upload {dst:?}"))?;
                }
            }
            Ok(())
        }
        Instruction::Volume { paths, .. } => {
            for path in paths {
                guest
                    .mkdir_p(path, &decorated.user, &decorated.workdir)
                    .await
                    .stack_err_with(|| format!("VOLUME {path:?}"))?;
            }
            Ok(())
        }
        // ENV/LABEL/ARG/CMD/ENTRYPOINT/USER/WORKDIR/SHELL/EXPOSE/FROM have no
        // remote effect: they only shaped build state (spec §4.3/§4.4).
        _ => Ok(()),
    }
}

/// Handles the non-`--from` half of `ADD`/`COPY`: excludes, resolve, upload.
/// For `COPY --from`, the caller additionally consults `dep_artifacts`; this
/// function still runs first so a plain local `src` alongside `--from` (not
/// produced by this grammar, but kept defensive) is not silently dropped.
async fn replay_add_copy(
    guest: &dyn GuestClient,
    src: &str,
    dst: &str,
    chown: Option<&str>,
    from_stage: Option<&str>,
    excludes: &IgnoreMatcher,
    resolver: &dyn ResourceResolver,
) -> Result<()> {
    if from_stage.is_some() {
        // resolution for --from happens entirely against `dep_artifacts` in
        // the caller; nothing to resolve locally.
        return Ok(());
    }
    if excludes.is_excluded(std::path::Path::new(src), false) {
        tracing::debug!(src, "excluded by .dockerignore, skipping");
        return Ok(());
    }
    let resolved = resolver
        .resolve(src, dst, chown)
        .await
        .stack_err_with(|| format!("resolving {src:?} -> {dst:?}"))?;
    for resource in resolved {
        if excludes.is_excluded(std::path::Path::new(&resource.source), false) {
            tracing::debug!(source = %resource.source, "excluded by .dockerignore, skipping");
            continue;
        }
        guest
            .upload(
                &resource.target,
                &resource.bytes,
                resource.mode,
                resource.chown.as_deref(),
            )
            .await
            .stack_err_with(|| format!("upload {:?}", resource.target))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::remote_exec::client::RemoteExecResult;

    #[derive(Default)]
    struct FakeGuest {
        uploaded: Mutex<Vec<(String, Vec<u8>)>>,
        ran: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GuestClient for FakeGuest {
        async fn run_shell(
            &self,
            _shell: &[String],
            _user: &str,
            _workdir: &str,
            _env: &std::collections::BTreeMap<String, String>,
            command: &str,
        ) -> Result<RemoteExecResult> {
            self.ran.lock().unwrap().push(command.to_owned());
            Ok(RemoteExecResult {
                exit_code: 0,
                stdout: vec![],
                stderr: vec![],
            })
        }

        async fn upload(
            &self,
            dst: &str,
            bytes: &[u8],
            _mode: Option<u32>,
            _chown: Option<&str>,
        ) -> Result<()> {
            self.uploaded
                .lock()
                .unwrap()
                .push((dst.to_owned(), bytes.to_owned()));
            Ok(())
        }

        async fn mkdir_p(&self, _path: &str, _user: &str, _workdir: &str) -> Result<()> {
            Ok(())
        }

        async fn download(&self, path: &str) -> Result<Vec<u8>> {
            bail_locationless!("FakeGuest has no downloadable content at {path:?}")
        }
    }

    struct FakeResolver;

    #[async_trait]
    impl ResourceResolver for FakeResolver {
        async fn resolve(
            &self,
            src: &str,
            dst: &str,
            _chown: Option<&str>,
        ) -> Result<Vec<ResolvedResource>> {
            Ok(vec![ResolvedResource::from_bytes(
                src,
                dst,
                b"hello".to_vec(),
            )])
        }
    }

    #[tokio::test]
    async fn copy_from_stage_matches_by_prefix() {
        let guest = FakeGuest::default();
        let mut artifacts = StageArtifacts::default();
        artifacts.insert(
            "builder",
            vec![ResolvedResource::from_bytes(
                "/out/app",
                "/out/app",
                b"binary".to_vec(),
            )],
        );
        let decorated = DecoratedInstruction {
            instruction: Instruction::Copy {
                src: "/out/app".into(),
                dst: "/app".into(),
                from_stage: Some("builder".into()),
                chown: None,
                source: String::new(),
            },
            user: "0:0".into(),
            workdir: "/".into(),
            env: None,
            args: None,
            shell: None,
        };
        let excludes = IgnoreMatcher::load(std::path::Path::new("/nonexistent"));
        replay_one(&guest, &decorated, &excludes, &FakeResolver, &artifacts)
            .await
            .unwrap();
        let uploaded = guest.uploaded.lock().unwrap();
        assert_eq!(uploaded.len(), 1);
        assert_eq!(uploaded[0].0, "/app");
    }

    #[tokio::test]
    async fn copy_from_missing_stage_errors() {
        let guest = FakeGuest::default();
        let artifacts = StageArtifacts::default();
        let decorated = DecoratedInstruction {
            instruction: Instruction::Copy {
                src: "/out/app".into(),
                dst: "/app".into(),
                from_stage: Some("builder".into()),
                chown: None,
                source: String::new(),
            },
            user: "0:0".into(),
            workdir: "/".into(),
            env: None,
            args: None,
            shell: None,
        };
        let excludes = IgnoreMatcher::load(std::path::Path::new("/nonexistent"));
        assert!(
            replay_one(&guest, &decorated, &excludes, &FakeResolver, &artifacts)
                .await
                .is_err()
        );
    }

    /// `replay_one` must hand `run_shell` the raw, uncomposed command —
    /// composition (the `cd`/`export`/`sudo -u` preamble) is `run_shell`'s
    /// job alone. Composing it twice would double the preamble on a real
    /// `SshGuestClient`.
    #[tokio::test]
    async fn run_passes_raw_command_without_local_composition() {
        let guest = FakeGuest::default();
        let artifacts = StageArtifacts::default();
        let decorated = DecoratedInstruction {
            instruction: Instruction::Run {
                command: "echo hi".into(),
                source: String::new(),
            },
            user: "1000:1000".into(),
            workdir: "/app".into(),
            env: Some(std::collections::BTreeMap::from([(
                "FOO".to_owned(),
                "bar".to_owned(),
            )])),
            args: None,
            shell: Some(vec!["/bin/sh".to_owned(), "-c".to_owned()]),
        };
        let excludes = IgnoreMatcher::load(std::path::Path::new("/nonexistent"));
        replay_one(&guest, &decorated, &excludes, &FakeResolver, &artifacts)
            .await
            .unwrap();
        let ran = guest.ran.lock().unwrap();
        assert_eq!(ran.as_slice(), ["echo hi"]);
    }
}
