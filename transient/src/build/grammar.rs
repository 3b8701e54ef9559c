//! Imagefile grammar: a line-oriented instruction set (`FROM`, `DISK`,
//! `PARTITION`, `ADD`, `COPY`, `RUN`, `INSPECT`) with `#` comments and
//! trailing-backslash line continuation, ported from the original's Lark
//! LALR grammar into a small hand-rolled recursive-descent parser built on
//! `nom` combinators for the token-level bits (quoted strings, disk sizes).

use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag};
use nom::character::complete::char;
use nom::combinator::{map, opt, value};
use nom::sequence::delimited;
use nom::IResult;

use crate::disk::parse_size_with_unit;
use crate::error::{TransientError, TransientResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionFlag {
    Boot,
    Efi,
    BiosGrub,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskLabel {
    Gpt,
    Mbr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    From {
        source: String,
    },
    Disk {
        size_bytes: u64,
        label: DiskLabel,
    },
    Partition {
        number: u32,
        size_bytes: Option<u64>,
        format: Option<String>,
        format_options: Option<String>,
        mount: Option<String>,
        flags: Vec<PartitionFlag>,
    },
    Add {
        sources: Vec<String>,
        destination: String,
    },
    Copy {
        sources: Vec<String>,
        destination: String,
    },
    Run {
        command: String,
    },
    Inspect,
}

/// Join backslash-continued lines and strip `#` comments (outside quotes),
/// matching the original grammar's `%ignore` rule for line continuation.
fn preprocess(source: &str) -> String {
    let mut joined = String::with_capacity(source.len());
    let mut pending = String::new();
    for raw_line in source.lines() {
        pending.push_str(raw_line);
        if let Some(stripped) = pending.strip_suffix('\\') {
            pending = stripped.to_string();
            pending.push(' ');
            continue;
        }
        joined.push_str(&pending);
        joined.push('\n');
        pending.clear();
    }
    if !pending.is_empty() {
        joined.push_str(&pending);
    }
    joined
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b'#' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

pub fn parse_program(source: &str) -> TransientResult<Vec<Instruction>> {
    let joined = preprocess(source);
    let mut instructions = Vec::new();
    for (idx, raw_line) in joined.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let instr = parse_instruction(line)
            .map_err(|e| TransientError::validation(format!("Imagefile line {}: {}", idx + 1, e)))?;
        instructions.push(instr);
    }
    Ok(instructions)
}

fn parse_instruction(line: &str) -> Result<Instruction, String> {
    let (keyword, rest) = split_keyword(line);
    match keyword.to_ascii_uppercase().as_str() {
        "FROM" => Ok(Instruction::From {
            source: rest.trim().to_string(),
        }),
        "DISK" => parse_disk(rest.trim()),
        "PARTITION" => parse_partition(rest.trim()),
        "ADD" => parse_copy_like(rest.trim()).map(|(sources, destination)| Instruction::Add { sources, destination }),
        "COPY" => parse_copy_like(rest.trim()).map(|(sources, destination)| Instruction::Copy { sources, destination }),
        "RUN" => Ok(Instruction::Run {
            command: rest.trim().to_string(),
        }),
        "INSPECT" => Ok(Instruction::Inspect),
        other => Err(format!("unknown instruction `{other}`")),
    }
}

fn split_keyword(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(idx) => (&line[..idx], &line[idx..]),
        None => (line, ""),
    }
}

fn parse_disk(rest: &str) -> Result<Instruction, String> {
    let mut tokens = rest.split_whitespace();
    let size_token = tokens.next().ok_or("DISK requires a size")?;
    let label_token = tokens.next().ok_or("DISK requires GPT or MBR")?;
    let size_bytes = parse_size_with_unit(size_token).map_err(|e| e.to_string())?;
    let label = match label_token.to_ascii_uppercase().as_str() {
        "GPT" => DiskLabel::Gpt,
        "MBR" => DiskLabel::Mbr,
        other => return Err(format!("unknown disk label `{other}`")),
    };
    Ok(Instruction::Disk { size_bytes, label })
}

fn parse_partition(rest: &str) -> Result<Instruction, String> {
    let mut tokens = rest.split_whitespace().peekable();
    let number: u32 = tokens
        .next()
        .ok_or("PARTITION requires a number")?
        .parse()
        .map_err(|_| "invalid PARTITION number".to_string())?;

    let mut size_bytes = None;
    let mut format = None;
    let mut format_options = None;
    let mut mount = None;
    let mut flags = Vec::new();

    while let Some(&clause) = tokens.peek() {
        match clause.to_ascii_uppercase().as_str() {
            "SIZE" => {
                tokens.next();
                let token = tokens.next().ok_or("SIZE requires a value")?;
                size_bytes = Some(parse_size_with_unit(token).map_err(|e| e.to_string())?);
            }
            "FORMAT" => {
                tokens.next();
                let fmt = tokens.next().ok_or("FORMAT requires a filesystem type")?;
                if !["ext2", "ext3", "ext4", "xfs"].contains(&fmt) {
                    return Err(format!("unsupported partition format `{fmt}`"));
                }
                format = Some(fmt.to_string());
                if tokens.peek().map(|t| t.to_ascii_uppercase()) == Some("OPTIONS".to_string()) {
                    tokens.next();
                    let rest_str: String = tokens.by_ref().collect::<Vec<_>>().join(" ");
                    let (_, opts) = parse_quoted(&rest_str).map_err(|_| "invalid OPTIONS string".to_string())?;
                    format_options = Some(opts);
                    break;
                }
            }
            "MOUNT" => {
                tokens.next();
                mount = Some(tokens.next().ok_or("MOUNT requires a path")?.to_string());
            }
            "FLAGS" => {
                tokens.next();
                let flag_list = tokens.next().ok_or("FLAGS requires a comma-separated list")?;
                for flag in flag_list.split(',') {
                    flags.push(match flag.to_ascii_uppercase().as_str() {
                        "BOOT" => PartitionFlag::Boot,
                        "EFI" => PartitionFlag::Efi,
                        "BIOS_GRUB" => PartitionFlag::BiosGrub,
                        other => return Err(format!("unknown partition flag `{other}`")),
                    });
                }
            }
            other => return Err(format!("unexpected PARTITION clause `{other}`")),
        }
    }

    Ok(Instruction::Partition {
        number,
        size_bytes,
        format,
        format_options,
        mount,
        flags,
    })
}

/// `ADD`/`COPY` share a grammar: one or more sources followed by a single
/// destination, the last whitespace-separated token.
fn parse_copy_like(rest: &str) -> Result<(Vec<String>, String), String> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 2 {
        return Err("expected at least one source and a destination".to_string());
    }
    let (destination, sources) = tokens.split_last().expect("checked len >= 2");
    Ok((sources.iter().map(|s| s.to_string()).collect(), destination.to_string()))
}

/// Parse a double-quoted string with backslash escapes, via `nom`.
fn parse_quoted(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(
            opt(escaped_transform(
                is_not("\"\\"),
                '\\',
                alt((
                    value("\\", tag("\\")),
                    value("\"", tag("\"")),
                )),
            )),
            |s: Option<String>| s.unwrap_or_default(),
        ),
        char('"'),
    )(input.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_from_disk_partition() {
        let source = "FROM centos/7\nDISK 2GB GPT\nPARTITION 1 SIZE 2GB MOUNT / FLAGS boot\n";
        let program = parse_program(source).unwrap();
        assert_eq!(program.len(), 3);
        assert!(matches!(&program[0], Instruction::From { source } if source == "centos/7"));
        assert!(matches!(&program[1], Instruction::Disk { label: DiskLabel::Gpt, .. }));
        match &program[2] {
            Instruction::Partition { number, mount, flags, .. } => {
                assert_eq!(*number, 1);
                assert_eq!(mount.as_deref(), Some("/"));
                assert_eq!(flags, &vec![PartitionFlag::Boot]);
            }
            other => panic!("unexpected instruction: {other:?}"),
        }
    }

    #[test]
    fn joins_backslash_continued_run_lines() {
        let source = "RUN apt-get update && \\\n    apt-get install -y curl\n";
        let program = parse_program(source).unwrap();
        assert_eq!(program.len(), 1);
        match &program[0] {
            Instruction::Run { command } => assert!(command.contains("apt-get install -y curl")),
            other => panic!("unexpected instruction: {other:?}"),
        }
    }

    #[test]
    fn strips_hash_comments() {
        let source = "FROM centos/7 # base image\nINSPECT\n";
        let program = parse_program(source).unwrap();
        assert_eq!(program.len(), 2);
    }

    #[test]
    fn copy_splits_sources_and_destination() {
        let program = parse_program("COPY a.txt b.txt /dest/\n").unwrap();
        match &program[0] {
            Instruction::Copy { sources, destination } => {
                assert_eq!(sources, &vec!["a.txt".to_string(), "b.txt".to_string()]);
                assert_eq!(destination, "/dest/");
            }
            other => panic!("unexpected instruction: {other:?}"),
        }
    }

    #[test]
    fn rejects_unsupported_partition_format() {
        let err = parse_program("PARTITION 1 FORMAT btrfs\n").unwrap_err();
        match err {
            TransientError::Validation { message } => assert!(message.contains("unsupported")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
