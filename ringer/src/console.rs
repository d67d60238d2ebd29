//! Line-oriented console for a ring worker.
//!
//! Commands are case-insensitive and have one-letter aliases:
//!
//! - `SET <key> <value>` (`s`): write to every replica. The value is the rest
//!   of the line.
//! - `GET <key>` (`g`): read from the fastest replica.
//! - `TARGETS <key>` (`t`): list the replicas for a key.
//! - `STATUS` (`st`): stability, leader and active members.
//! - `HELP` (`h`), `EXIT` (`e`).

use anyhow::{Result, anyhow};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::runtime::RingHandle;

const USAGE: &str = "Commands (case-insensitive):
  SET <key> <value>  (alias: s)   write to every replica
  GET <key>          (alias: g)   read from the fastest replica
  TARGETS <key>      (alias: t)   list replicas for a key
  STATUS             (alias: st)  show ring state
  HELP               (alias: h)   show this message
  EXIT               (alias: e)   shut down this worker";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Set { key: String, value: String },
    Get { key: String },
    Targets { key: String },
    Status,
    Help,
    Exit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let mut parts = trimmed.splitn(3, char::is_whitespace);
        let Some(first) = parts.next().filter(|word| !word.is_empty()) else {
            return Err(anyhow!("empty command"));
        };
        let key = parts.next().map(str::to_string);
        let rest = parts.next().map(|rest| rest.trim_start().to_string());

        let cmd = first.to_uppercase();
        let normalized = match cmd.as_str() {
            "S" => "SET",
            "G" => "GET",
            "T" => "TARGETS",
            "ST" => "STATUS",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match (normalized, key, rest) {
            ("EXIT", None, None) => Ok(ConsoleCommand::Exit),
            ("HELP", None, None) => Ok(ConsoleCommand::Help),
            ("STATUS", None, None) => Ok(ConsoleCommand::Status),
            ("GET", Some(key), None) => Ok(ConsoleCommand::Get { key }),
            ("TARGETS", Some(key), None) => Ok(ConsoleCommand::Targets { key }),
            ("SET", Some(key), Some(value)) if !value.is_empty() => {
                Ok(ConsoleCommand::Set { key, value })
            }
            ("GET", ..) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("TARGETS", ..) => Err(anyhow!("TARGETS requires exactly one argument: TARGETS <key>")),
            ("SET", ..) => Err(anyhow!("SET requires a key and a value: SET <key> <value>")),
            ("EXIT" | "HELP" | "STATUS", ..) => Err(anyhow!("{normalized} takes no arguments")),
            _ => Err(anyhow!(
                "invalid command. Try: SET/s <key> <value>, GET/g <key>, TARGETS/t <key>, STATUS/st, HELP/h, EXIT/e"
            )),
        }
    }
}

/// Runs one command and renders its outcome. `None` means the console
/// should stop.
pub async fn execute(ring: &RingHandle, command: ConsoleCommand) -> Option<String> {
    let output = match command {
        ConsoleCommand::Set { key, value } => match ring.set(&key, &value).await {
            Ok(report) => {
                let mut out = format!("OK: {key} stored on {}", report.acked.join(", "));
                for (member, reason) in &report.failed {
                    out.push_str(&format!("\n  failed on {member}: {reason}"));
                }
                out
            }
            Err(err) => format!("ERROR: {err}"),
        },
        ConsoleCommand::Get { key } => match ring.get(&key).await {
            Ok(Some(value)) => format!("{key} = {value}"),
            Ok(None) => format!("{key} not found"),
            Err(err) => format!("ERROR: {err}"),
        },
        ConsoleCommand::Targets { key } => match ring.targets(&key).await {
            Ok(targets) => format!("{key} -> {}", targets.join(", ")),
            Err(err) => format!("ERROR: {err}"),
        },
        ConsoleCommand::Status => match ring.status().await {
            Ok(status) => {
                let mut out = format!(
                    "{} | stable: {} | leader: {} | attempt: {}",
                    status.name,
                    status.is_stable,
                    status.leader.as_deref().unwrap_or("-"),
                    status.attempt
                );
                for member in &status.members {
                    out.push_str(&format!(
                        "\n  {} {} latency={}us",
                        member.name, member.status, member.latency
                    ));
                }
                out
            }
            Err(err) => format!("ERROR: {err}"),
        },
        ConsoleCommand::Help => USAGE.to_string(),
        ConsoleCommand::Exit => return None,
    };
    Some(output)
}

/// Reads commands from `input` until EOF or `EXIT`, writing results to
/// `output`. Parse errors are reported and the loop continues.
pub async fn run<R, W>(ring: &RingHandle, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let rendered = match ConsoleCommand::parse(&line) {
            Ok(command) => match execute(ring, command).await {
                Some(rendered) => rendered,
                None => {
                    output.write_all(b"Shutting down...\n").await?;
                    output.flush().await?;
                    break;
                }
            },
            Err(err) => format!("ERROR: {err}"),
        };
        output.write_all(rendered.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}
