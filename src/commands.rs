//! Line commands for the driver binary.
//!
//! One command per stdin line, whitespace separated. `stage` takes the rest
//! of the line as a JSON object.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::session::{SessionError, SessionReconciler};
use crate::watchers::LifecycleEvent;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("lifecycle watcher stopped")]
    WatcherClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Online,
    Foreground,
    Login { email: String, password: String },
    Register { name: String, email: String, password: String },
    Anonymous,
    Stage(Value),
    Upgrade { name: String, email: String, password: String },
    Check { email: String },
    Logout,
    Status,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Unknown verbs, wrong arity, or a `stage` payload that is not a JSON object.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();
        let command = match verb {
            "" => return Ok(None),
            "online" => Self::Online,
            "foreground" => Self::Foreground,
            "anon" => Self::Anonymous,
            "logout" => Self::Logout,
            "status" => Self::Status,
            "quit" | "exit" => Self::Quit,
            "login" => match args.as_slice() {
                [email, password] => Self::Login { email: (*email).to_owned(), password: (*password).to_owned() },
                _ => return Err(CommandError::Usage("login <email> <password>")),
            },
            "register" | "upgrade" => {
                let [name, email, password] = args.as_slice() else {
                    return Err(CommandError::Usage("register|upgrade <name> <email> <password>"));
                };
                let (name, email, password) = ((*name).to_owned(), (*email).to_owned(), (*password).to_owned());
                if verb == "register" {
                    Self::Register { name, email, password }
                } else {
                    Self::Upgrade { name, email, password }
                }
            }
            "check" => match args.as_slice() {
                [email] => Self::Check { email: (*email).to_owned() },
                _ => return Err(CommandError::Usage("check <email>")),
            },
            "stage" => {
                let payload: Value = serde_json::from_str(rest.trim())?;
                if !payload.is_object() {
                    return Err(CommandError::Usage("stage <json object>"));
                }
                Self::Stage(payload)
            }
            other => return Err(CommandError::Unknown(other.to_owned())),
        };
        Ok(Some(command))
    }
}

/// Run a command against the reconciler and describe the outcome.
///
/// # Errors
///
/// Session operation failures and a closed lifecycle channel.
pub async fn execute(
    reconciler: &SessionReconciler,
    lifecycle: &mpsc::Sender<LifecycleEvent>,
    command: Command,
) -> Result<String, CommandError> {
    let reply = match command {
        Command::Online => queue(lifecycle, LifecycleEvent::ConnectivityRestored).await?,
        Command::Foreground => queue(lifecycle, LifecycleEvent::Foregrounded).await?,
        Command::Login { email, password } => {
            let target = reconciler.login(&email, &password).await?;
            format!("signed in; go to {target:?}")
        }
        Command::Register { name, email, password } => {
            let target = reconciler.register(&name, &email, &password).await?;
            format!("registered; go to {target:?}")
        }
        Command::Anonymous => {
            reconciler.sign_in_anonymously().await?;
            "anonymous session started".to_owned()
        }
        Command::Stage(data) => {
            reconciler.stage_anonymous_data(&data).await?;
            "staged".to_owned()
        }
        Command::Upgrade { name, email, password } => {
            let target = reconciler
                .complete_anonymous_registration(&name, &email, &password)
                .await?;
            format!("account created; go to {target:?}")
        }
        Command::Check { email } => {
            let status = reconciler.check_email_status(&email).await?;
            serde_json::to_string(&status)?
        }
        Command::Logout => {
            reconciler.sign_out().await;
            "signed out".to_owned()
        }
        Command::Status => serde_json::to_string(&reconciler.state())?,
        Command::Quit => "bye".to_owned(),
    };
    Ok(reply)
}

async fn queue(lifecycle: &mpsc::Sender<LifecycleEvent>, event: LifecycleEvent) -> Result<String, CommandError> {
    lifecycle
        .send(event)
        .await
        .map_err(|_| CommandError::WatcherClosed)?;
    Ok(format!("{event:?} queued"))
}

#[cfg(test)]
#[path = "commands_test.rs"]
mod tests;
