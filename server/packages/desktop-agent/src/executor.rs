//! Action executor.
//!
//! Translates [`Action`]s into `xdotool` / ImageMagick invocations issued
//! through a [`CommandChannel`]. Every call is independent: the executor
//! keeps no connection or input state between actions.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use desktop_agent_error::DesktopError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionResult};

/// X display the sandbox image runs Xvfb on.
pub const DEFAULT_DISPLAY: &str = ":99";

/// Discrete wheel clicks per scroll call, independent of the requested delta.
pub const SCROLL_TICKS: usize = 3;

const BROWSER: &str = "firefox-esr";

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("`{command}` exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i64,
        stderr: String,
    },
    #[error("command channel failed: {0}")]
    Channel(String),
    #[error("{0}")]
    Invalid(String),
}

/// One program invocation against the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Launch and return without waiting for the program to exit.
    pub detached: bool,
}

impl DisplayCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            detached: false,
        }
    }

    pub fn xdotool<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("xdotool", args)
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn display_string(&self) -> String {
        self.argv().join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

/// Generic "run this command and capture output" primitive.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn run(&self, display: &str, command: &DisplayCommand)
        -> Result<CommandOutput, ActionError>;
}

/// Runs commands as child processes of the current process. Used when this
/// binary runs inside the sandbox.
#[derive(Debug, Default, Clone)]
pub struct LocalCommandChannel;

#[async_trait]
impl CommandChannel for LocalCommandChannel {
    async fn run(
        &self,
        display: &str,
        command: &DisplayCommand,
    ) -> Result<CommandOutput, ActionError> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args).env("DISPLAY", display);

        if command.detached {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            let child = cmd
                .spawn()
                .map_err(|err| ActionError::Channel(format!("{}: {err}", command.program)))?;
            debug!(program = %command.program, pid = ?child.id(), "launched detached command");
            return Ok(CommandOutput::default());
        }

        let output = cmd
            .output()
            .await
            .map_err(|err| ActionError::Channel(format!("{}: {err}", command.program)))?;
        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Modifier {
    Ctrl,
    Shift,
}

impl Modifier {
    const RELEASE_ORDER: [Modifier; 2] = [Modifier::Ctrl, Modifier::Shift];

    fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("ctrl") {
            Some(Modifier::Ctrl)
        } else if token.eq_ignore_ascii_case("shift") {
            Some(Modifier::Shift)
        } else {
            None
        }
    }

    fn keysym(&self) -> &'static str {
        match self {
            Modifier::Ctrl => "ctrl",
            Modifier::Shift => "shift",
        }
    }
}

pub fn button_number(button: &str) -> u8 {
    match button.to_ascii_lowercase().as_str() {
        "middle" | "wheel" => 2,
        "right" => 3,
        _ => 1,
    }
}

fn keysym_for(token: &str) -> String {
    let lower = token.to_lowercase();
    match lower.as_str() {
        "enter" => "Return".to_string(),
        "space" => "space".to_string(),
        _ => lower,
    }
}

#[derive(Clone)]
pub struct ActionExecutor {
    channel: Arc<dyn CommandChannel>,
    display: String,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("display", &self.display)
            .finish()
    }
}

impl ActionExecutor {
    pub fn new(channel: Arc<dyn CommandChannel>) -> Self {
        Self::with_display(channel, DEFAULT_DISPLAY)
    }

    pub fn with_display(channel: Arc<dyn CommandChannel>, display: &str) -> Self {
        Self {
            channel,
            display: display.to_string(),
        }
    }

    async fn exec(&self, command: DisplayCommand) -> Result<CommandOutput, ActionError> {
        let output = self.channel.run(&self.display, &command).await?;
        if output.exit_code != 0 {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(command = %command.display_string(), code = output.exit_code, %stderr, "display command failed");
            return Err(ActionError::CommandFailed {
                command: command.display_string(),
                code: output.exit_code,
                stderr,
            });
        }
        Ok(output)
    }

    /// Runs one action, mapping failures into [`DesktopError::ActionExecution`].
    pub async fn dispatch(&self, action: &Action) -> Result<ActionResult, DesktopError> {
        let result = match action {
            Action::Click { x, y, button } => self.click(*x, *y, button).await,
            Action::DoubleClick { x, y } => self.double_click(*x, *y).await,
            Action::Scroll {
                x,
                y,
                scroll_x,
                scroll_y,
            } => self.scroll(*x, *y, *scroll_x, *scroll_y).await,
            Action::Keypress { keys } => self.keypress(keys).await,
            Action::Type { text } => self.type_text(text).await,
            Action::Wait { seconds } => self.wait(*seconds).await,
            Action::Navigate { url } => self.navigate(url).await,
            Action::Screenshot => Ok(self.screenshot().await),
        };
        result.map_err(|err| DesktopError::ActionExecution {
            action: action.name().to_string(),
            message: err.to_string(),
        })
    }

    pub async fn click(&self, x: i32, y: i32, button: &str) -> Result<ActionResult, ActionError> {
        let number = button_number(button);
        info!(x, y, button, mapped = number, "click");
        self.exec(DisplayCommand::xdotool([
            "mousemove".to_string(),
            x.to_string(),
            y.to_string(),
            "click".to_string(),
            number.to_string(),
        ]))
        .await?;
        Ok(ActionResult::success("click")
            .with("x", x)
            .with("y", y)
            .with("button", button))
    }

    pub async fn double_click(&self, x: i32, y: i32) -> Result<ActionResult, ActionError> {
        info!(x, y, "double click");
        self.exec(DisplayCommand::xdotool([
            "mousemove".to_string(),
            x.to_string(),
            y.to_string(),
            "click".to_string(),
            "--repeat".to_string(),
            "2".to_string(),
            "1".to_string(),
        ]))
        .await?;
        Ok(ActionResult::success("double_click").with("x", x).with("y", y))
    }

    pub async fn scroll(
        &self,
        x: i32,
        y: i32,
        scroll_x: i32,
        scroll_y: i32,
    ) -> Result<ActionResult, ActionError> {
        info!(x, y, scroll_x, scroll_y, "scroll");
        self.exec(DisplayCommand::xdotool([
            "mousemove".to_string(),
            x.to_string(),
            y.to_string(),
        ]))
        .await?;

        // 4/5 are wheel up/down, 6/7 are wheel left/right.
        if scroll_y != 0 {
            let button = if scroll_y < 0 { "4" } else { "5" };
            self.scroll_ticks(button).await?;
        }
        if scroll_x != 0 {
            let button = if scroll_x < 0 { "6" } else { "7" };
            self.scroll_ticks(button).await?;
        }

        Ok(ActionResult::success("scroll")
            .with("x", x)
            .with("y", y)
            .with("scroll_x", scroll_x)
            .with("scroll_y", scroll_y))
    }

    async fn scroll_ticks(&self, button: &str) -> Result<(), ActionError> {
        for _ in 0..SCROLL_TICKS {
            self.exec(DisplayCommand::xdotool(["click", button])).await?;
        }
        Ok(())
    }

    /// Presses keys in order. `CTRL`/`SHIFT` are held for the rest of the
    /// batch and released exactly once afterwards, whether or not a later key
    /// failed.
    pub async fn keypress(&self, keys: &[String]) -> Result<ActionResult, ActionError> {
        info!(?keys, "keypress");
        let mut held: Vec<Modifier> = Vec::new();
        let mut failure: Option<ActionError> = None;

        for key in keys {
            let step = match Modifier::from_token(key) {
                Some(modifier) => {
                    if held.contains(&modifier) {
                        continue;
                    }
                    held.push(modifier);
                    self.exec(DisplayCommand::xdotool(["keydown", modifier.keysym()]))
                        .await
                }
                None => {
                    self.exec(DisplayCommand::xdotool(["key".to_string(), keysym_for(key)]))
                        .await
                }
            };
            if let Err(err) = step {
                failure = Some(err);
                break;
            }
        }

        for modifier in Modifier::RELEASE_ORDER {
            if !held.contains(&modifier) {
                continue;
            }
            if let Err(err) = self
                .exec(DisplayCommand::xdotool(["keyup", modifier.keysym()]))
                .await
            {
                warn!(modifier = modifier.keysym(), error = %err, "failed to release modifier");
                failure.get_or_insert(err);
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(ActionResult::success("keypress").with("keys", keys.to_vec())),
        }
    }

    pub async fn type_text(&self, text: &str) -> Result<ActionResult, ActionError> {
        info!(chars = text.chars().count(), "type");
        self.exec(DisplayCommand::xdotool([
            "type",
            "--clearmodifiers",
            "--",
            text,
        ]))
        .await?;
        Ok(ActionResult::success("type").with("text", text))
    }

    pub async fn wait(&self, seconds: f64) -> Result<ActionResult, ActionError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ActionError::Invalid(format!(
                "wait seconds must be a non-negative number, got {seconds}"
            )));
        }
        info!(seconds, "wait");
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(ActionResult::success("wait").with("seconds", seconds))
    }

    /// Opens `url` in a new browser tab. The browser is launched detached, so
    /// success only means the launch was accepted.
    pub async fn navigate(&self, url: &str) -> Result<ActionResult, ActionError> {
        info!(url, "navigate");
        self.exec(DisplayCommand::new(BROWSER, ["-new-tab", url]).detached())
            .await?;
        Ok(ActionResult::success("navigate").with("url", url))
    }

    /// Captures the root window as base64 PNG. Never fails: capture errors
    /// come back as an `error` result.
    pub async fn screenshot(&self) -> ActionResult {
        let output = self
            .exec(DisplayCommand::new("import", ["-window", "root", "png:-"]))
            .await;
        match output {
            Ok(output) if !output.stdout.is_empty() => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&output.stdout);
                debug!(bytes = output.stdout.len(), "captured screenshot");
                ActionResult::success("screenshot").with("screenshot", encoded)
            }
            Ok(_) => {
                warn!("screenshot command produced no data");
                ActionResult::error("screenshot", "screenshot command produced no data")
            }
            Err(err) => {
                warn!(error = %err, "screenshot failed");
                ActionResult::error("screenshot", err.to_string())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    /// Records every command and fails the ones whose argv contains a
    /// configured token.
    #[derive(Default)]
    pub struct RecordingChannel {
        pub commands: Mutex<Vec<DisplayCommand>>,
        fail_tokens: Mutex<HashSet<String>>,
        stdout: Mutex<Vec<u8>>,
    }

    impl RecordingChannel {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                stdout: Mutex::new(b"\x89PNG".to_vec()),
                ..Default::default()
            })
        }

        pub fn fail_on(&self, token: &str) {
            self.fail_tokens.lock().unwrap().insert(token.to_string());
        }

        pub fn argvs(&self) -> Vec<String> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .map(DisplayCommand::display_string)
                .collect()
        }
    }

    #[async_trait]
    impl CommandChannel for RecordingChannel {
        async fn run(
            &self,
            _display: &str,
            command: &DisplayCommand,
        ) -> Result<CommandOutput, ActionError> {
            self.commands.lock().unwrap().push(command.clone());
            let fails = {
                let tokens = self.fail_tokens.lock().unwrap();
                command.argv().iter().any(|arg| tokens.contains(arg))
            };
            if fails {
                return Ok(CommandOutput {
                    stdout: Vec::new(),
                    stderr: b"boom".to_vec(),
                    exit_code: 1,
                });
            }
            Ok(CommandOutput {
                stdout: self.stdout.lock().unwrap().clone(),
                stderr: Vec::new(),
                exit_code: 0,
            })
        }
    }
}
