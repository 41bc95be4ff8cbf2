mod api;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use api::{ApiClient, FrontendEvent};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Pending,
    Status,
    Dismiss(String),
    Force(String),
    Say(String),
    Help,
    Quit,
    Empty,
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match name.to_ascii_lowercase().as_str() {
        "pending" => Command::Pending,
        "status" => Command::Status,
        "dismiss" if !arg.is_empty() => Command::Dismiss(arg.to_string()),
        "force" => Command::Force(if arg.is_empty() {
            "greeting".to_string()
        } else {
            arg.to_string()
        }),
        "quit" | "exit" => Command::Quit,
        _ => Command::Help,
    }
}

const HELP: &str = "Commands: /pending, /status, /dismiss <id>, /force [category], /quit. \
Anything else is sent as your reply.";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,echo=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = ApiClient::from_env();
    tracing::info!("Backend API: {}", client.base_url());
    if !client.has_token() {
        tracing::warn!(
            "ECHO_BACKEND_TOKEN is unset/empty; requests will fail unless backend auth mode is disabled"
        );
    }

    match client.get_config().await {
        Ok(config) => tracing::info!(
            "Connected to {} (model {})",
            config.companion_name,
            config.llm_model
        ),
        Err(error) => tracing::warn!("Could not reach backend yet: {:#}", error),
    }

    let (event_tx, event_rx) = flume::unbounded();
    tokio::spawn(client.clone().stream_events_forever(event_tx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // Most recent message shown and not yet answered.
    let mut latest: Option<String> = None;

    println!("{}", HELP);
    loop {
        tokio::select! {
            event = event_rx.recv_async() => {
                let Ok(event) = event else { break };
                match event {
                    FrontendEvent::ProactiveMessage(candidate) => {
                        println!("\n[{}] {}", candidate.category.as_db_str(), candidate.payload);
                        println!("  (id {})", candidate.id);
                        latest = Some(candidate.id);
                    }
                    FrontendEvent::CandidateDismissed { id } => {
                        if latest.as_deref() == Some(id.as_str()) {
                            latest = None;
                        }
                        tracing::debug!("Candidate {} dismissed", id);
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(&client, parse_command(&line), &mut latest).await {
                    break;
                }
            }
        }
    }

    tracing::info!("Echo client exiting");
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_command(client: &ApiClient, command: Command, latest: &mut Option<String>) -> bool {
    let result = match command {
        Command::Empty => Ok(()),
        Command::Quit => return false,
        Command::Help => {
            println!("{}", HELP);
            Ok(())
        }
        Command::Pending => client.pending_candidates().await.map(|pending| {
            if pending.is_empty() {
                println!("No pending messages.");
            }
            for candidate in pending {
                println!(
                    "{}  p{} {:<14} {}",
                    candidate.id,
                    candidate.priority,
                    candidate.category.as_db_str(),
                    candidate.payload
                );
            }
        }),
        Command::Status => client.status().await.map(|status| {
            println!(
                "running={} pending={} cooldown={}s enhancement={} failures={}",
                status.running,
                status.pending_count,
                status.cooldown_remaining_secs,
                status.enhancement_enabled,
                status.consecutive_enhancement_failures
            );
            if let Some(at) = status.last_emission_at {
                println!("last message at {}", at.to_rfc3339());
            }
        }),
        Command::Dismiss(id) => client.dismiss(&id).await.map(|dismissed| {
            if !dismissed {
                println!("No pending message with id {}", id);
            }
            if latest.as_deref() == Some(id.as_str()) {
                *latest = None;
            }
        }),
        Command::Force(category) => client.force(&category).await.map(|outcome| {
            if !outcome.accepted {
                println!("A manual message is already pending ({})", outcome.candidate_id);
            } else if outcome.emitted.is_none() {
                match outcome.cooldown_remaining_secs {
                    Some(secs) => println!("Queued; cooling down for {}s", secs),
                    None => println!("Queued"),
                }
            }
        }),
        Command::Say(text) => match latest.take() {
            Some(id) => client.respond(&id, &text).await.map(|_| ()),
            None => client.record_interaction(&text).await,
        },
    };

    if let Err(error) = result {
        tracing::warn!("Request failed: {:#}", error);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_reply() {
        assert_eq!(parse_command("  hi there "), Command::Say("hi there".to_string()));
        assert_eq!(parse_command("   "), Command::Empty);
    }

    #[test]
    fn slash_commands_parse_arguments() {
        assert_eq!(parse_command("/pending"), Command::Pending);
        assert_eq!(parse_command("/STATUS"), Command::Status);
        assert_eq!(parse_command("/dismiss abc-1"), Command::Dismiss("abc-1".to_string()));
        assert_eq!(parse_command("/force dream_share"), Command::Force("dream_share".to_string()));
        assert_eq!(parse_command("/force"), Command::Force("greeting".to_string()));
        assert_eq!(parse_command("/exit"), Command::Quit);
    }

    #[test]
    fn incomplete_or_unknown_commands_show_help() {
        assert_eq!(parse_command("/dismiss"), Command::Help);
        assert_eq!(parse_command("/dance"), Command::Help);
    }
}
