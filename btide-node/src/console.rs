//! Operator console: one command per line.
//!
//! ```text
//! CONNECT ip:port            DISCONNECT ip:port        PEERS
//! ADDPACKAGE path            REMPACKAGE ident          PACKAGES
//! FETCH ip:port ident hash [offset]                    QUIT
//! ```

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;

use btide_core::registry::RegistryError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::node::Node;

/// Identity characters shown in listings.
const IDENT_DISPLAY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(SocketAddr),
    Disconnect(SocketAddr),
    Peers,
    AddPackage(PathBuf),
    RemPackage(String),
    Packages,
    Fetch {
        peer: SocketAddr,
        ident: String,
        hash: String,
        offset: u32,
    },
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Unknown command {0}")]
    Unknown(String),
    #[error("Missing address and port argument")]
    MissingAddress,
    #[error("Invalid address {0}, expected ip:port")]
    BadAddress(String),
    #[error("Missing file argument")]
    MissingFile,
    #[error("Missing identifier argument, please specify the whole identifier or at least 20 characters.")]
    MissingIdent,
    #[error("Missing arguments from command")]
    MissingArguments,
    #[error("Invalid offset {0}")]
    BadOffset(String),
}

impl Command {
    /// Parse one console line. `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let line = line.trim();
        let Some((word, rest)) = split_word(line) else {
            return Ok(None);
        };
        let cmd = match word {
            "CONNECT" => Command::Connect(parse_addr(rest)?),
            "DISCONNECT" => Command::Disconnect(parse_addr(rest)?),
            "PEERS" => Command::Peers,
            "PACKAGES" => Command::Packages,
            "QUIT" => Command::Quit,
            "ADDPACKAGE" if rest.is_empty() => return Err(ParseError::MissingFile),
            "ADDPACKAGE" => Command::AddPackage(PathBuf::from(rest)),
            "REMPACKAGE" if rest.is_empty() => return Err(ParseError::MissingIdent),
            "REMPACKAGE" => Command::RemPackage(rest.to_string()),
            "FETCH" => {
                let args: Vec<&str> = rest.split_whitespace().collect();
                let (peer, ident, hash, offset) = match args.as_slice() {
                    [peer, ident, hash] => (peer, ident, hash, None),
                    [peer, ident, hash, offset] => (peer, ident, hash, Some(offset)),
                    _ => return Err(ParseError::MissingArguments),
                };
                let offset = match offset {
                    Some(o) => o.parse().map_err(|_| ParseError::BadOffset(o.to_string()))?,
                    None => 0,
                };
                Command::Fetch {
                    peer: parse_addr(peer)?,
                    ident: ident.to_string(),
                    hash: hash.to_string(),
                    offset,
                }
            }
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(Some(cmd))
    }
}

fn split_word(line: &str) -> Option<(&str, &str)> {
    if line.is_empty() {
        return None;
    }
    Some(match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    })
}

fn parse_addr(s: &str) -> Result<SocketAddr, ParseError> {
    if s.is_empty() {
        return Err(ParseError::MissingAddress);
    }
    s.parse().map_err(|_| ParseError::BadAddress(s.to_string()))
}

fn short_ident(ident: &str) -> &str {
    ident
        .char_indices()
        .nth(IDENT_DISPLAY_LEN)
        .map_or(ident, |(i, _)| &ident[..i])
}

/// Run `cmd` against `node` and return what to print.
pub async fn execute(node: &Node, cmd: Command) -> String {
    match cmd {
        Command::Connect(addr) => match node.connect(addr).await {
            Ok(()) => "Connection established with peer".to_string(),
            Err(e) => format!("Unable to connect to request peer: {e:#}"),
        },
        Command::Disconnect(addr) => {
            if node.disconnect(addr).await {
                "Disconnected from peer".to_string()
            } else {
                "Unknown peer, not connected".to_string()
            }
        }
        Command::Peers => {
            let peers = node.peers.lock().await;
            let mut out = String::new();
            let outbound: Vec<_> = peers.outbound_addrs().collect();
            if outbound.is_empty() {
                out.push_str("Not connected to any peers");
            } else {
                out.push_str("Connected to:\n");
                for (i, addr) in outbound.iter().enumerate() {
                    let _ = write!(out, "\n{}. {addr}", i + 1);
                }
            }
            let inbound: Vec<_> = peers.inbound_addrs().collect();
            if !inbound.is_empty() {
                out.push_str("\n\nServing:\n");
                for (i, addr) in inbound.iter().enumerate() {
                    let _ = write!(out, "\n{}. {addr}", i + 1);
                }
            }
            out
        }
        Command::AddPackage(path) => match node.add_package(&path).await {
            Ok(added) => format!(
                "Package added: {}, {} : {}",
                short_ident(added.package.ident()),
                added.package.data_path().display(),
                status_word(added.is_complete())
            ),
            Err(e) => format!("Unable to add package: {e:#}"),
        },
        Command::RemPackage(prefix) => match node.remove_package(&prefix).await {
            Ok(_) => "Package has been removed".to_string(),
            Err(e) => match e.downcast_ref::<RegistryError>() {
                Some(RegistryError::PrefixTooShort { .. }) => ParseError::MissingIdent.to_string(),
                _ => "Identifier provided does not match managed packages".to_string(),
            },
        },
        Command::Packages => match node.packages().await {
            Ok(list) if list.is_empty() => "No packages managed".to_string(),
            Ok(list) => list
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    format!(
                        "{}. {}, {} : {}",
                        i + 1,
                        short_ident(&p.ident),
                        p.path.display(),
                        status_word(p.complete)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("Unable to list packages: {e:#}"),
        },
        Command::Fetch {
            peer,
            ident,
            hash,
            offset,
        } => match node.fetch(peer, &ident, &hash, offset).await {
            Ok(report) => format!(
                "Fetched {} bytes in {} segments from {peer}",
                report.bytes, report.segments
            ),
            Err(e) => format!("Unable to request chunk, {e:#}"),
        },
        Command::Quit => String::new(),
    }
}

fn status_word(complete: bool) -> &'static str {
    if complete {
        "COMPLETED"
    } else {
        "INCOMPLETE"
    }
}

/// Read commands from `input` until QUIT or end of input.
pub async fn run_console<R, W>(node: &Node, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match Command::parse(&line) {
            Ok(None) => continue,
            Ok(Some(Command::Quit)) => break,
            Ok(Some(cmd)) => {
                tracing::debug!(?cmd, "console command");
                execute(node, cmd).await
            }
            Err(e) => e.to_string(),
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}
