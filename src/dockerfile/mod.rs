//! Dockerfile tokenising, the `Instruction` model, and stage-graph
//! aggregation (C1).

mod instruction;
mod lexer;
mod stage;

pub use instruction::*;
pub use stage::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_single_stage() {
        let stages = Stages::parse("FROM alpine:3.12\nRUN echo hi\nCMD [\"sh\"]").unwrap();
        assert_eq!(stages.stages.len(), 1);
        let main = stages.main().unwrap();
        assert!(main.name.is_empty());
        assert!(main.is_valid);
        assert_eq!(main.base_image, "alpine:3.12");
        let runs: Vec<_> = main
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Run { .. }))
            .collect();
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn multi_stage_copy_from() {
        let src = "FROM golang:1.20 AS builder\nRUN go build -o /out/app\n\nFROM alpine:3.12\nCOPY --from=builder /out/app /app\n";
        let stages = Stages::parse(src).unwrap();
        assert_eq!(stages.names(), vec!["builder".to_owned()]);
        let main = stages.main().unwrap();
        assert_eq!(main.depends_on, vec!["builder".to_owned()]);
    }
}
