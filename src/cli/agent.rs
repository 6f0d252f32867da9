//! `krill agent` — talk to an agent from the terminal.
//!
//! With `-m` the message is processed once and the reply printed; without it
//! an interactive shell starts. Either way messages flow through the same
//! scheduler path every other channel uses (`channel="cli"`).

use anyhow::Result;
use clap::Args;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::time::Duration;

use super::{build_runtime, Runtime};
use crate::bus::{InboundMessage, MessageBus};

/// Default CLI session key when none is given.
const DEFAULT_SESSION: &str = "cli:default";

#[derive(Args)]
pub struct AgentArgs {
    /// One-shot message; omit for an interactive shell
    #[arg(short, long)]
    pub message: Option<String>,

    /// Session key to use
    #[arg(short, long, env = "KRILL_SESSION")]
    pub session: Option<String>,

    /// Model override for the default agent (reference or alias)
    #[arg(long, env = "KRILL_MODEL")]
    pub model: Option<String>,
}

pub async fn run(args: AgentArgs) -> Result<()> {
    let runtime = build_runtime(args.model.as_deref())?;
    let session_key = args.session.unwrap_or_else(|| DEFAULT_SESSION.to_string());

    let result = match args.message {
        Some(ref message) => send_once(&runtime, &session_key, message).await,
        None => interactive(&runtime, &session_key).await,
    };

    runtime.cancel.cancel();
    result
}

/// Process one message inline and print every non-ephemeral reply.
async fn send_once(runtime: &Runtime, session_key: &str, message: &str) -> Result<()> {
    let mut msg = InboundMessage::new("cli", "user", "direct", message);
    msg.session_key = Some(session_key.to_string());
    runtime.scheduler.handle_inbound(msg).await?;

    for reply in drain_replies(runtime).await {
        println!("{}", reply);
    }
    Ok(())
}

async fn interactive(runtime: &Runtime, session_key: &str) -> Result<()> {
    let agent = runtime.registry.default_agent();
    println!("krill — agent '{}' ({})", agent.id, agent.model);
    println!("Type a message, /clear to reset the session, /quit to exit.\n");

    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line.eq_ignore_ascii_case("/quit") || line.eq_ignore_ascii_case("/exit") {
                    break;
                }
                let _ = editor.add_history_entry(&line);

                let mut msg = InboundMessage::new("cli", "user", "direct", &line);
                msg.session_key = Some(session_key.to_string());
                if let Err(e) = runtime.scheduler.handle_inbound(msg).await {
                    eprintln!("error: {:#}", e);
                    continue;
                }
                for reply in drain_replies(runtime).await {
                    println!("{}\n", reply);
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Collect buffered outbound messages, dropping ephemeral status notices.
async fn drain_replies(runtime: &Runtime) -> Vec<String> {
    let mut replies = Vec::new();
    while let Ok(Some(out)) = tokio::time::timeout(
        Duration::from_millis(50),
        runtime.bus.consume_outbound(),
    )
    .await
    {
        if !out.is_status_update() {
            replies.push(out.content);
        }
    }
    replies
}
