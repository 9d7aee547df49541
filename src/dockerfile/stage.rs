//! Stage aggregation (spec §4.1, §3 `Stage`/`Stages`).

use stacked_errors::{bail_locationless, Result};

use super::{instruction::Instruction, lexer::lex};

/// An ordered run of instructions beginning with a `FROM`.
#[derive(Debug, Clone)]
pub struct Stage {
    /// Empty for the unnamed (main) stage.
    pub name: String,
    pub base_image: String,
    /// Names of stages this one's `COPY --from` expressions reference.
    pub depends_on: Vec<String>,
    /// A base image was supplied (always true post-parse; kept for parity
    /// with the data model's description of the bit).
    pub is_valid: bool,
    pub instructions: Vec<Instruction>,
}

/// The ordered collection the parser produces.
#[derive(Debug, Clone)]
pub struct Stages {
    pub stages: Vec<Stage>,
}

impl Stages {
    /// Parses `src` end to end: lexing, then folding the flat stream into
    /// stages per spec §4.1.
    pub fn parse(src: &str) -> Result<Self> {
        let instructions = lex(src)?;
        Self::from_instructions(instructions)
    }

    pub fn from_instructions(instructions: Vec<Instruction>) -> Result<Self> {
        let mut preamble = vec![];
        let mut stages: Vec<Stage> = vec![];
        let mut seen_from = false;

        for instr in instructions {
            if let Instruction::From {
                image, stage_name, ..
            } = &instr
            {
                seen_from = true;
                let mut new_stage = Stage {
                    name: stage_name.clone().unwrap_or_default(),
                    base_image: image.clone(),
                    depends_on: vec![],
                    is_valid: true,
                    instructions: preamble.clone(),
                };
                new_stage.instructions.push(instr);
                stages.push(new_stage);
                continue;
            }
            if !seen_from {
                if instr.allowed_before_from() {
                    preamble.push(instr);
                } else {
                    bail_locationless!(
                        "instruction before the first FROM is out of scope: {:?}",
                        instr.source()
                    );
                }
                continue;
            }
            if let Instruction::Copy {
                from_stage: Some(from),
                ..
            } = &instr
            {
                let stage = stages.last_mut().unwrap();
                if !stage.depends_on.contains(from) {
                    stage.depends_on.push(from.clone());
                }
            }
            stages.last_mut().unwrap().instructions.push(instr);
        }

        let mut names = std::collections::HashSet::new();
        let mut unnamed_count = 0;
        for stage in &stages {
            if stage.name.is_empty() {
                unnamed_count += 1;
            } else if !names.insert(stage.name.clone()) {
                bail_locationless!("duplicate stage name {:?}", stage.name);
            }
        }
        if unnamed_count > 1 {
            bail_locationless!("more than one unnamed (main) stage");
        }
        if stages.is_empty() {
            bail_locationless!("Dockerfile has no FROM instruction");
        }

        let result = Self { stages };
        result.check_acyclic()?;
        Ok(result)
    }

    fn check_acyclic(&self) -> Result<()> {
        for stage in &self.stages {
            let mut visited = std::collections::HashSet::new();
            let mut stack = stage.depends_on.clone();
            while let Some(dep) = stack.pop() {
                if dep == stage.name {
                    bail_locationless!("stage dependency cycle involving {:?}", stage.name);
                }
                if !visited.insert(dep.clone()) {
                    continue;
                }
                if let Some(dep_stage) = self.by_name(&dep) {
                    stack.extend(dep_stage.depends_on.clone());
                } else {
                    bail_locationless!(
                        "stage {:?} depends on undeclared stage {:?}",
                        stage.name,
                        dep
                    );
                }
            }
        }
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The single unnamed stage; spec invariant (iii): it must exist and be
    /// valid.
    pub fn main(&self) -> Result<&Stage> {
        match self.stages.iter().find(|s| s.name.is_empty()) {
            Some(s) => Ok(s),
            None => bail_locationless!("no unnamed (main) stage found"),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| !s.name.is_empty())
            .map(|s| s.name.clone())
            .collect()
    }
}
