//! The build state machine (C3): applies parsed instructions against
//! accumulated build state, producing the decorated instruction list C4
//! replays.

use std::collections::BTreeMap;

use stacked_errors::{bail_locationless, Result, StackableErr};

use crate::dockerfile::Instruction;

/// A `RUN`/`ADD`/`COPY`/`VOLUME` instruction tagged with the state it ran
/// under, plus `ENTRYPOINT`'s capture-at-definition snapshot.
#[derive(Debug, Clone)]
pub struct DecoratedInstruction {
    pub instruction: Instruction,
    pub user: String,
    pub workdir: String,
    /// Only populated for `RUN`/`ENTRYPOINT` (spec §4.3 decoration rules).
    pub env: Option<BTreeMap<String, String>>,
    pub args: Option<BTreeMap<String, String>>,
    pub shell: Option<Vec<String>>,
}

/// Mutable accumulator threaded through instruction application (spec §3).
#[derive(Debug, Clone)]
pub struct BuildState {
    pub env: BTreeMap<String, String>,
    pub args: BTreeMap<String, String>,
    pub workdir: String,
    pub user: String,
    pub shell: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: Vec<String>,
    pub volumes: Vec<String>,
    pub instructions: Vec<DecoratedInstruction>,
}

impl Default for BuildState {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            args: BTreeMap::new(),
            workdir: "/".to_owned(),
            user: "0:0".to_owned(),
            shell: vec!["/bin/sh".to_owned(), "-c".to_owned()],
            cmd: None,
            entrypoint: None,
            labels: BTreeMap::new(),
            exposed_ports: vec![],
            volumes: vec![],
            instructions: vec![],
        }
    }
}

impl BuildState {
    /// Applies `instructions` in order, consulting `build_args` for `ARG`s
    /// lacking a default (spec §4.3: "must receive a value ... or the build
    /// fails").
    pub fn apply_all(
        instructions: &[Instruction],
        build_args: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut state = Self::default();
        for instr in instructions {
            state.apply(instr, build_args)?;
        }
        Ok(state)
    }

    fn apply(
        &mut self,
        instr: &Instruction,
        build_args: &BTreeMap<String, String>,
    ) -> Result<()> {
        match instr {
            Instruction::From { .. } => {
                // stage boundary carries no state-machine effect beyond
                // already having been folded by the stage aggregator
            }
            Instruction::Arg { key, default, .. } => {
                let value = build_args
                    .get(key)
                    .cloned()
                    .or_else(|| default.clone())
                    .stack_err_with(|| {
                        format!("ARG {key} has no default and was not supplied as a build-arg")
                    })?;
                self.args.insert(key.clone(), value);
            }
            Instruction::Env { k, v, .. } => {
                let v = self.expand(v);
                self.env.insert(k.clone(), v);
            }
            Instruction::Label { k, v, .. } => {
                let v = self.expand(v);
                self.labels.insert(k.clone(), v);
                self.push_decorated(instr.clone(), None, None, None);
            }
            Instruction::Run { command, source } => {
                let expanded = self.expand(command);
                let decorated_instr = Instruction::Run {
                    command: expanded,
                    source: source.clone(),
                };
                self.push_decorated(
                    decorated_instr,
                    Some(self.env.clone()),
                    Some(self.args.clone()),
                    Some(self.shell.clone()),
                );
            }
            Instruction::Add { .. } | Instruction::Copy { .. } | Instruction::Volume { .. } => {
                self.push_decorated(instr.clone(), None, None, None);
                if let Instruction::Volume { paths, .. } = instr {
                    self.volumes.extend(paths.iter().cloned());
                }
            }
            Instruction::Cmd { args, .. } => {
                self.cmd = Some(args.clone());
            }
            Instruction::Entrypoint { args, .. } => {
                self.entrypoint = Some(args.clone());
                self.push_decorated(
                    instr.clone(),
                    Some(self.env.clone()),
                    None,
                    Some(self.shell.clone()),
                );
            }
            Instruction::Expose { raw, .. } => {
                self.exposed_ports.push(raw.clone());
            }
            Instruction::Shell { args, .. } => {
                if args.is_empty() {
                    bail_locationless!("SHELL requires at least one argument");
                }
                self.shell = args.clone();
            }
            Instruction::User { value, .. } => {
                self.user = value.clone();
            }
            Instruction::Workdir { path, .. } => {
                self.workdir = if path.starts_with('/') {
                    path.clone()
                } else {
                    join_workdir(&self.workdir, path)
                };
            }
            Instruction::Ignored { .. } => {}
        }
        Ok(())
    }

    fn push_decorated(
        &mut self,
        instruction: Instruction,
        env: Option<BTreeMap<String, String>>,
        args: Option<BTreeMap<String, String>>,
        shell: Option<Vec<String>>,
    ) {
        self.instructions.push(DecoratedInstruction {
            instruction,
            user: self.user.clone(),
            workdir: self.workdir.clone(),
            env,
            args,
            shell,
        });
    }

    /// Shell-style `$VAR`/`${VAR}` substitution against the current env
    /// (spec §4.3).
    pub fn expand(&self, s: &str) -> String {
        expand_vars(s, &self.env)
    }
}

fn join_workdir(prev: &str, rel: &str) -> String {
    let mut joined = std::path::PathBuf::from(prev);
    joined.push(rel);
    // normalise `a/./b/../c` style segments without touching the filesystem
    let mut out = std::path::PathBuf::from("/");
    for component in joined.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(seg) => out.push(seg),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out.to_string_lossy().into_owned()
}

fn expand_vars(s: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && i + 1 < chars.len() {
            if chars[i + 1] == '{' {
                if let Some(end) = chars[i + 2..].iter().position(|&c| c == '}') {
                    let name: String = chars[i + 2..i + 2 + end].iter().collect();
                    if let Some(v) = env.get(&name) {
                        out.push_str(v);
                    }
                    i += 2 + end + 1;
                    continue;
                }
            } else if chars[i + 1].is_alphabetic() || chars[i + 1] == '_' {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                if let Some(v) = env.get(&name) {
                    out.push_str(v);
                }
                i = end;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workdir_fold_matches_left_fold() {
        let instrs = vec![
            Instruction::Workdir {
                path: "/a".into(),
                source: String::new(),
            },
            Instruction::Workdir {
                path: "b".into(),
                source: String::new(),
            },
            Instruction::Workdir {
                path: "/c".into(),
                source: String::new(),
            },
            Instruction::Workdir {
                path: "d".into(),
                source: String::new(),
            },
        ];
        let state = BuildState::apply_all(&instrs, &BTreeMap::new()).unwrap();
        assert_eq!(state.workdir, "/c/d");
    }

    #[test]
    fn label_expansion() {
        let instrs = vec![
            Instruction::Env {
                k: "X".into(),
                v: "hello".into(),
                source: String::new(),
            },
            Instruction::Label {
                k: "greeting".into(),
                v: "say ${X} and $X".into(),
                source: String::new(),
            },
        ];
        let state = BuildState::apply_all(&instrs, &BTreeMap::new()).unwrap();
        assert_eq!(state.labels.get("greeting").unwrap(), "say hello and hello");
    }

    #[test]
    fn arg_without_default_requires_build_arg() {
        let instrs = vec![Instruction::Arg {
            key: "MISSING".into(),
            default: None,
            source: String::new(),
        }];
        assert!(BuildState::apply_all(&instrs, &BTreeMap::new()).is_err());
    }
}
