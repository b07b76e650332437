//! Remote control of the relay pipeline through a Telegram bot.
//!
//! Authorized chats can switch the pipeline on and off or restart it. The
//! pipeline runs as a task owned by [`Supervisor`]; stopping it cancels the
//! task and waits for it to wind down.

use crate::telegram::TelegramClient;
use futures::future::BoxFuture;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LONG_POLL_WAIT: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(10);

pub const UNAUTHORIZED_REPLY: &str = "Unauthorized user";

const HELP_TEXT: &str = "Available commands:
/on - Start the relay
/off - Stop the relay
/restart - Restart the relay
/help - Show this help message";

/// Creates one run of the pipeline; it must return once the token is cancelled.
pub type PipelineFactory =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct RunningPipeline {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns at most one running pipeline task.
pub struct Supervisor {
    factory: PipelineFactory,
    running: Option<RunningPipeline>,
}

impl Supervisor {
    pub fn new(factory: PipelineFactory) -> Self {
        Self {
            factory,
            running: None,
        }
    }

    /// True while a pipeline task is alive. A task that ended on its own
    /// (for example after a failed login) no longer counts.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Starts the pipeline unless it is already running. Returns whether a new task was spawned.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return false;
        }

        let cancel = CancellationToken::new();
        let pipeline = (self.factory)(cancel.clone());
        let handle = tokio::spawn(async move {
            match pipeline.await {
                Ok(()) => info!("Relay pipeline exited"),
                Err(e) => error!("Relay pipeline stopped with error: {:?}", e),
            }
        });

        self.running = Some(RunningPipeline { cancel, handle });
        info!("Relay pipeline started");
        true
    }

    /// Stops the pipeline if one is running. Returns whether anything was stopped.
    pub async fn stop(&mut self) -> bool {
        let Some(RunningPipeline { cancel, mut handle }) = self.running.take() else {
            return false;
        };

        let was_running = !handle.is_finished();
        cancel.cancel();

        if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
            warn!("Relay pipeline did not stop within {:?}, aborting", STOP_GRACE);
            handle.abort();
        }

        info!("Relay pipeline stopped");
        was_running
    }

    pub async fn restart(&mut self) {
        self.stop().await;
        self.start();
    }
}

/// Commands understood by the control bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    On,
    Off,
    Restart,
    Help,
}

impl ControlCommand {
    /// Parses the first word of a message, accepting the `/cmd@botname` form.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let command = word.strip_prefix('/')?;
        let command = command.split('@').next().unwrap_or(command);

        match command.to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "restart" => Some(Self::Restart),
            "help" => Some(Self::Help),
            _ => None,
        }
    }
}

/// The control bot: authorizes callers and drives the supervisor.
pub struct Controller {
    client: TelegramClient,
    authorized_users: HashSet<String>,
    supervisor: Supervisor,
}

impl Controller {
    pub fn new(client: TelegramClient, authorized_users: &[String], supervisor: Supervisor) -> Self {
        if authorized_users.is_empty() {
            warn!("No authorized users configured, every control command will be refused");
        }

        Self {
            client,
            authorized_users: authorized_users.iter().cloned().collect(),
            supervisor,
        }
    }

    pub fn is_authorized(&self, chat_id: &str) -> bool {
        self.authorized_users.contains(chat_id)
    }

    /// Executes `command` on behalf of `chat_id` and returns the reply text.
    pub async fn handle(&mut self, chat_id: &str, command: ControlCommand) -> String {
        if command == ControlCommand::Help {
            return HELP_TEXT.to_string();
        }

        if !self.is_authorized(chat_id) {
            warn!("Refused {:?} from unauthorized chat {}", command, chat_id);
            return UNAUTHORIZED_REPLY.to_string();
        }

        info!("Chat {} requested {:?}", chat_id, command);
        match command {
            ControlCommand::Start => format!(
                "Welcome to the OTP relay bot!\nThe relay is currently {}.\n\n{}",
                if self.supervisor.is_running() { "running" } else { "stopped" },
                HELP_TEXT
            ),
            ControlCommand::On => {
                if self.supervisor.start() {
                    "Relay started".to_string()
                } else {
                    "Relay is already running".to_string()
                }
            }
            ControlCommand::Off => {
                if self.supervisor.stop().await {
                    "Relay stopped".to_string()
                } else {
                    "Relay is not running".to_string()
                }
            }
            ControlCommand::Restart => {
                self.supervisor.restart().await;
                "Relay restarted".to_string()
            }
            ControlCommand::Help => HELP_TEXT.to_string(),
        }
    }

    /// Starts the pipeline, then serves commands until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.supervisor.start();

        let mut offset: i64 = 0;
        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.client.get_updates(offset, LONG_POLL_WAIT) => result,
            };

            let updates = match updates {
                Ok(updates) => updates,
                Err(e) => {
                    warn!("Error polling Telegram for commands: {:?}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    }
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);

                let Some(message) = update.message else {
                    continue;
                };
                let Some(command) = message.text.as_deref().and_then(ControlCommand::parse)
                else {
                    continue;
                };

                let chat_id = message.chat.id.to_string();
                let reply = self.handle(&chat_id, command).await;
                if let Err(e) = self.client.send_message(&chat_id, &reply, None).await {
                    error!("Error replying to chat {}: {:?}", chat_id, e);
                }
            }
        }

        info!("Control bot shutting down");
        self.supervisor.stop().await;
        Ok(())
    }
}
