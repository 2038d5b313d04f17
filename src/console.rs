use crate::agent::ChatAgent;
use crate::history::{ format_transcript, Conversation };

use log::{ error, info };
use std::error::Error;
use tokio::io::{ AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader };

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Quit,
    History,
    Chat(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    match line.trim() {
        "/quit" | "/exit" => Command::Quit,
        "/history" => Command::History,
        _ => Command::Chat(line.trim_end_matches(|c: char| c == '\r' || c == '\n')),
    }
}

/// Interactive terminal session on stdin/stdout.
pub async fn run_console(agent: &ChatAgent) -> Result<Conversation, Box<dyn Error + Send + Sync>> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    run_session(agent, stdin, stdout).await
}

/// Runs one session over arbitrary line-oriented input/output until EOF or
/// `/quit`, returning the final conversation.
pub async fn run_session<R, W>(
    agent: &ChatAgent,
    input: R,
    mut output: W
) -> Result<Conversation, Box<dyn Error + Send + Sync>>
    where R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin
{
    let mut conversation = agent.new_conversation();
    info!("Started console session {}", conversation.id());
    output.write_all(format_transcript(&conversation).as_bytes()).await?;

    let mut lines = input.lines();
    loop {
        output.write_all(b"Human: ").await?;
        output.flush().await?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => {
                break;
            }
        };

        match parse_command(&line) {
            Command::Quit => {
                break;
            }
            Command::History => {
                output.write_all(format_transcript(&conversation).as_bytes()).await?;
            }
            Command::Chat(query) =>
                match agent.process_message(&mut conversation, query).await {
                    Ok(Some(response)) => {
                        output.write_all(format!("AI: {}\n", response).as_bytes()).await?;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("Error while generating a response: {}", e);
                        output.write_all(b"AI: (the model call failed, see the log)\n").await?;
                    }
                }
        }
    }

    output.write_all(b"\n").await?;
    output.flush().await?;
    info!("Console session {} ended with {} messages", conversation.id(), conversation.len());
    Ok(conversation)
}
