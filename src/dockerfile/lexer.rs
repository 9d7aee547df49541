//! Tokenises raw Dockerfile text into a flat [`Instruction`] stream (spec
//! §4.1). Line continuations (`\` at end of line) are joined before
//! directive-level splitting, mirroring how `docker build`'s own parser
//! treats backslash-newline.

use stacked_errors::{bail_locationless, Result};

use super::instruction::{Instruction, IGNORED_DIRECTIVES};

/// Joins backslash-continued lines and drops comment-only/blank lines,
/// returning one logical line per directive alongside its original text.
fn logical_lines(src: &str) -> Vec<String> {
    let mut out = vec![];
    let mut cur = String::new();
    for raw_line in src.lines() {
        let line = raw_line.trim_end();
        if cur.is_empty() && (line.trim().is_empty() || line.trim_start().starts_with('#')) {
            continue;
        }
        if let Some(stripped) = line.strip_suffix('\\') {
            cur.push_str(stripped.trim_end());
            cur.push(' ');
            continue;
        }
        cur.push_str(line);
        out.push(std::mem::take(&mut cur));
    }
    if !cur.trim().is_empty() {
        out.push(cur);
    }
    out
}

/// Splits a `--flag=value` prefix run off the remainder of an `ADD`/`COPY`
/// argument list, returning `(flags, rest)`.
fn extract_flags(rest: &str) -> (Vec<(String, String)>, String) {
    let mut flags = vec![];
    let mut remainder = rest.trim_start();
    loop {
        if let Some(r) = remainder.strip_prefix("--") {
            if let Some((tok, after)) = r.split_once(char::is_whitespace) {
                if let Some((k, v)) = tok.split_once('=') {
                    flags.push((k.to_owned(), v.to_owned()));
                    remainder = after.trim_start();
                    continue;
                }
            }
        }
        break;
    }
    (flags, remainder.to_owned())
}

/// Parses a whitespace/JSON-array multi-valued argument list (`CMD`,
/// `ENTRYPOINT`, `SHELL`, `VOLUME`).
fn parse_multi_value(rest: &str) -> Vec<String> {
    let trimmed = rest.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
            return v;
        }
    }
    trimmed.split_whitespace().map(|s| s.to_owned()).collect()
}

/// Parses interleaved `key value` pairs for `ENV`/`LABEL`. An odd token count
/// is a parse error (spec §4.1, §7 Parse errors).
fn parse_kv_pairs(directive: &str, rest: &str) -> Result<Vec<(String, String)>> {
    let trimmed = rest.trim();
    // `ENV KEY=VAL KEY2=VAL2` and `ENV KEY VAL` both occur in the wild; if
    // every token contains `=` treat it as the assignment form.
    let tokens = shell_words_lenient(trimmed);
    if tokens.is_empty() {
        bail_locationless!("{directive} -> missing arguments");
    }
    if tokens.iter().all(|t| t.contains('=')) {
        return Ok(tokens
            .into_iter()
            .map(|t| {
                let (k, v) = t.split_once('=').unwrap();
                (k.to_owned(), v.trim_matches('"').to_owned())
            })
            .collect());
    }
    if tokens.len() % 2 != 0 {
        bail_locationless!("{directive} -> odd-arity key/value list: {rest:?}");
    }
    Ok(tokens
        .chunks(2)
        .map(|c| (c[0].clone(), c[1].trim_matches('"').to_owned()))
        .collect())
}

/// A small whitespace splitter that respects double-quoted spans, enough for
/// `ENV`/`LABEL` values containing spaces.
fn shell_words_lenient(s: &str) -> Vec<String> {
    let mut out = vec![];
    let mut cur = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                cur.push(c);
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

fn split_directive(line: &str) -> Option<(String, String)> {
    let line = line.trim_start();
    let (directive, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if directive.is_empty() {
        return None;
    }
    Some((directive.to_ascii_uppercase(), rest.trim_start().to_owned()))
}

/// Tokenises `src` into the flat instruction stream spec §4.1 describes.
pub fn lex(src: &str) -> Result<Vec<Instruction>> {
    let mut out = vec![];
    for line in logical_lines(src) {
        let Some((directive, rest)) = split_directive(&line) else {
            continue;
        };
        let source = line.clone();
        let instr = match directive.as_str() {
            "FROM" => {
                let (image, stage_name) = if let Some((img, tail)) = split_ci(&rest, " as ") {
                    (img.trim().to_owned(), Some(tail.trim().to_owned()))
                } else {
                    (rest.trim().to_owned(), None)
                };
                if image.is_empty() {
                    bail_locationless!("FROM -> missing image: {source:?}");
                }
                Instruction::From {
                    image,
                    stage_name,
                    source,
                }
            }
            "ARG" => {
                let rest = rest.trim();
                if rest.is_empty() {
                    bail_locationless!("ARG -> missing name: {source:?}");
                }
                let (key, default) = match rest.split_once('=') {
                    Some((k, v)) => (k.to_owned(), Some(v.trim_matches('"').to_owned())),
                    None => (rest.to_owned(), None),
                };
                Instruction::Arg {
                    key,
                    default,
                    source,
                }
            }
            "ENV" => {
                let pairs = parse_kv_pairs("ENV", &rest)?;
                // an ENV line with multiple pairs decomposes into multiple
                // instructions sharing the same source text
                for (k, v) in pairs {
                    out.push(Instruction::Env {
                        k,
                        v,
                        source: source.clone(),
                    });
                }
                continue;
            }
            "LABEL" => {
                let pairs = parse_kv_pairs("LABEL", &rest)?;
                for (k, v) in pairs {
                    out.push(Instruction::Label {
                        k,
                        v,
                        source: source.clone(),
                    });
                }
                continue;
            }
            "RUN" => {
                if rest.trim().is_empty() {
                    bail_locationless!("RUN -> missing command: {source:?}");
                }
                Instruction::Run {
                    command: rest.trim().to_owned(),
                    source,
                }
            }
            "ADD" | "COPY" => {
                let (flags, rest) = extract_flags(&rest);
                let tokens = shell_words_lenient(&rest);
                if tokens.len() != 2 {
                    bail_locationless!(
                        "{directive} -> expected exactly 2 arguments, got {}: {source:?}",
                        tokens.len()
                    );
                }
                let chown = flags
                    .iter()
                    .find(|(k, _)| k == "chown")
                    .map(|(_, v)| v.clone());
                let from_stage = flags
                    .iter()
                    .find(|(k, _)| k == "from")
                    .map(|(_, v)| v.clone());
                if directive == "ADD" {
                    if from_stage.is_some() {
                        bail_locationless!("ADD -> --from is not supported by ADD: {source:?}");
                    }
                    Instruction::Add {
                        src: tokens[0].clone(),
                        dst: tokens[1].clone(),
                        chown,
                        source,
                    }
                } else {
                    Instruction::Copy {
                        src: tokens[0].clone(),
                        dst: tokens[1].clone(),
                        from_stage,
                        chown,
                        source,
                    }
                }
            }
            "CMD" => Instruction::Cmd {
                args: parse_multi_value(&rest),
                source,
            },
            "ENTRYPOINT" => Instruction::Entrypoint {
                args: parse_multi_value(&rest),
                source,
            },
            "EXPOSE" => Instruction::Expose {
                raw: rest.trim().to_owned(),
                source,
            },
            "SHELL" => Instruction::Shell {
                args: parse_multi_value(&rest),
                source,
            },
            "USER" => Instruction::User {
                value: rest.trim().to_owned(),
                source,
            },
            "VOLUME" => Instruction::Volume {
                paths: parse_multi_value(&rest),
                source,
            },
            "WORKDIR" => {
                if rest.trim().is_empty() {
                    bail_locationless!("WORKDIR -> missing path: {source:?}");
                }
                Instruction::Workdir {
                    path: rest.trim().to_owned(),
                    source,
                }
            }
            other if IGNORED_DIRECTIVES.contains(&other) => {
                tracing::warn!(directive = other, "ignoring unsupported directive");
                Instruction::Ignored {
                    directive: other.to_owned(),
                    source,
                }
            }
            other => {
                bail_locationless!("unrecognised directive {other:?}: {source:?}");
            }
        };
        out.push(instr);
    }
    Ok(out)
}

/// Case-insensitive split on a literal separator, used for `FROM img AS name`.
fn split_ci<'a>(s: &'a str, sep: &str) -> Option<(&'a str, &'a str)> {
    let lower = s.to_ascii_lowercase();
    let idx = lower.find(&sep.to_ascii_lowercase())?;
    Some((&s[..idx], &s[idx + sep.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_odd_arity_rejected() {
        assert!(lex("FROM a\nENV FOO").is_err());
    }

    #[test]
    fn copy_with_from_and_chown() {
        let instrs = lex("FROM a\nCOPY --from=builder --chown=1000:1000 /out/app /app").unwrap();
        match &instrs[1] {
            Instruction::Copy {
                from_stage, chown, ..
            } => {
                assert_eq!(from_stage.as_deref(), Some("builder"));
                assert_eq!(chown.as_deref(), Some("1000:1000"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cmd_json_array() {
        let instrs = lex("FROM a\nCMD [\"sh\", \"-c\", \"echo hi\"]").unwrap();
        match &instrs[1] {
            Instruction::Cmd { args, .. } => {
                assert_eq!(args, &["sh", "-c", "echo hi"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
