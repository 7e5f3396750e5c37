//! Chat command parsing.
//!
//! Chat lines starting with `/` are commands. The first token names the
//! command; commands taking free text (`/t`, `/votekick`) receive the raw
//! remainder of the line so names with spaces survive.

/// Prefix marking a chat line as a command.
pub const COMMAND_PREFIX: char = '/';

/// A parsed client chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Help { page: Option<String> },
    TeamChat { message: String },
    VoteKick { target: Option<String> },
    Vote { choice: Option<String> },
    Sync,
    Unknown(String),
}

impl ClientCommand {
    /// Parses a chat line. Returns `None` for ordinary chat.
    pub fn parse(line: &str) -> Option<Self> {
        let body = line.trim().strip_prefix(COMMAND_PREFIX)?;
        let (name, rest) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (body, ""),
        };
        let rest_opt = (!rest.is_empty()).then(|| rest.to_string());
        let first = parse_command_line(rest).into_iter().next();

        Some(match name.to_ascii_lowercase().as_str() {
            "help" => ClientCommand::Help { page: first },
            "t" => ClientCommand::TeamChat {
                message: rest.to_string(),
            },
            "votekick" => ClientCommand::VoteKick { target: rest_opt },
            "vote" => ClientCommand::Vote { choice: first },
            "sync" => ClientCommand::Sync,
            _ => ClientCommand::Unknown(name.to_string()),
        })
    }

    /// Usage lines for `/help`.
    pub fn usage() -> &'static [(&'static str, &'static str)] {
        &[
            ("/help [page]", "Lists all commands."),
            ("/t <message...>", "Send a message only to your teammates."),
            ("/votekick [player...]", "Vote to kick a player, with a cooldown."),
            ("/vote <y/n>", "Vote on the current kick."),
            ("/sync", "Re-synchronize world state."),
        ]
    }
}

/// Parses a command line into tokens, respecting quotes.
pub fn parse_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
            }
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => {
                current.push(c);
            }
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}
