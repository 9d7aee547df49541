//! The `Instruction` tagged enum (spec §3) and the odd-arity/argument-count
//! parse errors named in spec §7.

use serde::{Deserialize, Serialize};

/// One recognised (or recognised-and-ignored) Dockerfile directive, carrying
/// its originating textual form for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Instruction {
    From {
        image: String,
        stage_name: Option<String>,
        source: String,
    },
    Arg {
        key: String,
        default: Option<String>,
        source: String,
    },
    Env {
        k: String,
        v: String,
        source: String,
    },
    Label {
        k: String,
        v: String,
        source: String,
    },
    Run {
        command: String,
        source: String,
    },
    Add {
        src: String,
        dst: String,
        chown: Option<String>,
        source: String,
    },
    Copy {
        src: String,
        dst: String,
        from_stage: Option<String>,
        chown: Option<String>,
        source: String,
    },
    Cmd {
        args: Vec<String>,
        source: String,
    },
    Entrypoint {
        args: Vec<String>,
        source: String,
    },
    Expose {
        raw: String,
        source: String,
    },
    Shell {
        args: Vec<String>,
        source: String,
    },
    User {
        value: String,
        source: String,
    },
    Volume {
        paths: Vec<String>,
        source: String,
    },
    Workdir {
        path: String,
        source: String,
    },
    /// `ONBUILD`, `HEALTHCHECK`, `STOPSIGNAL`, `MAINTAINER` — recognised and
    /// ignored, with a warning logged at parse time.
    Ignored {
        directive: String,
        source: String,
    },
}

impl Instruction {
    pub fn source(&self) -> &str {
        match self {
            Instruction::From { source, .. }
            | Instruction::Arg { source, .. }
            | Instruction::Env { source, .. }
            | Instruction::Label { source, .. }
            | Instruction::Run { source, .. }
            | Instruction::Add { source, .. }
            | Instruction::Copy { source, .. }
            | Instruction::Cmd { source, .. }
            | Instruction::Entrypoint { source, .. }
            | Instruction::Expose { source, .. }
            | Instruction::Shell { source, .. }
            | Instruction::User { source, .. }
            | Instruction::Volume { source, .. }
            | Instruction::Workdir { source, .. }
            | Instruction::Ignored { source, .. } => source,
        }
    }

    /// True for the three directives allowed to precede the first `FROM`.
    pub fn allowed_before_from(&self) -> bool {
        matches!(
            self,
            Instruction::Arg { .. } | Instruction::Env { .. } | Instruction::Label { .. }
        )
    }
}

pub(super) const IGNORED_DIRECTIVES: &[&str] =
    &["ONBUILD", "HEALTHCHECK", "STOPSIGNAL", "MAINTAINER"];
