//! Interactive session: one verification per stdin line, latest wins.

use crate::acquire::ImageSource;
use crate::workflow::{Status, Verifier, VerifyError};
use facecheck_core::{EmbeddingProvider, EmbeddingStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

#[derive(Debug, PartialEq)]
enum Command {
    Verify(ImageSource),
    Help,
    Quit,
}

const HELP: &str = "commands: image <path> | camera [device] | help | quit";

fn parse(line: &str, default_device: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let command = match word {
        "image" | "i" if rest.is_empty() => return Err("usage: image <path>".into()),
        "image" | "i" => Command::Verify(ImageSource::File(PathBuf::from(rest))),
        "camera" | "c" => Command::Verify(ImageSource::Camera {
            device: if rest.is_empty() { default_device } else { rest }.to_string(),
        }),
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(command))
}

/// Read commands from stdin until `quit` or EOF.
///
/// Each command starts a verification that supersedes whatever is still
/// running. Status changes are printed as they are published.
pub async fn run<P, S>(verifier: Arc<Verifier<P, S>>, default_device: String) -> anyhow::Result<()>
where
    P: EmbeddingProvider + 'static,
    S: EmbeddingStore + 'static,
{
    let mut status = verifier.subscribe();
    let renderer = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if current != Status::Idle {
                println!("[{current}]");
            }
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last: Option<JoinHandle<()>> = None;

    while let Some(line) = lines.next_line().await? {
        let command = match parse(&line, &default_device) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(msg) => {
                eprintln!("{msg}");
                continue;
            }
        };
        match command {
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
            Command::Verify(source) => {
                tracing::debug!(%source, "session request");
                let verifier = Arc::clone(&verifier);
                last = Some(tokio::spawn(async move {
                    match verifier.verify_source(&source).await {
                        Ok(report) => {
                            println!("{source}: {}", report.summary());
                            if let Some(warning) = report.persist_warning {
                                eprintln!("warning: {warning}");
                            }
                        }
                        Err(VerifyError::Superseded) => println!("{source}: superseded"),
                        Err(e) => eprintln!("{source}: {e}"),
                    }
                }));
            }
        }
    }

    if let Some(task) = last {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "verification task failed");
        }
    }
    renderer.abort();
    Ok(())
}
