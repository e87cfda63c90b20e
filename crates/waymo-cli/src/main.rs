use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use waymo::{Action, ActionOutcome, EventLoop, LoopConfig, MouseButton};
use waymo_input::{EiConnector, WaylandConnector, XkbCompiler};

mod config;

use config::Backend;

/// Inject synthetic keyboard and pointer input into a Wayland session.
///
/// Runs one action per invocation and exits once it has been delivered.
#[derive(Parser, Debug)]
#[command(name = "waymo", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Injection backend (`wayland` or `libei`).
    #[arg(long, global = true)]
    backend: Option<Backend>,

    /// XKB keyboard layout used to resolve characters.
    #[arg(long, global = true)]
    layout: Option<String>,

    /// Minimum gap between actions, in milliseconds.
    #[arg(long, global = true)]
    cooldown_ms: Option<u64>,

    /// Command queue capacity.
    #[arg(long, global = true)]
    max_commands: Option<usize>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Move the pointer to (X, Y), or by (X, Y) with --relative.
    Move {
        #[arg(allow_hyphen_values = true)]
        x: i32,
        #[arg(allow_hyphen_values = true)]
        y: i32,
        #[arg(long)]
        relative: bool,
    },
    /// Click a mouse button.
    Click {
        #[arg(long, default_value = "left")]
        button: MouseButton,
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long, default_value_t = 20)]
        hold_ms: u64,
    },
    /// Press or release a mouse button.
    Button {
        button: MouseButton,
        direction: Direction,
    },
    /// Press or release the key that types CHAR.
    Key {
        key: char,
        direction: Direction,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Hold the key that types CHAR.
    Hold {
        key: char,
        #[arg(long)]
        hold_ms: u64,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Type TEXT one character at a time.
    Type {
        text: String,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Connect, report the loop status and exit.
    Status,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Down,
    Up,
}

impl Direction {
    const fn is_down(self) -> bool {
        matches!(self, Self::Down)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let (backend, loop_config) = load_and_merge_config(&cli)?;
    tracing::debug!(%backend, ?loop_config, "Starting event loop");

    let (mut event_loop, status) = match backend {
        Backend::Wayland => {
            EventLoop::create_with(loop_config, WaylandConnector, XkbCompiler::default())
        }
        Backend::Libei => EventLoop::create_with(loop_config, EiConnector, XkbCompiler::default()),
    };

    if matches!(cli.command, Command::Status) {
        println!("{status} ({})", status.code());
    }
    status
        .into_result()
        .with_context(|| format!("{backend} event loop is not usable (status {})", status.code()))?;

    let result = match to_action(&cli.command) {
        Some(action) => run(&event_loop, action),
        None => Ok(()),
    };
    event_loop.destroy();
    result
}

/// Load config from file and apply CLI overrides.
fn load_and_merge_config(cli: &Cli) -> Result<(Backend, LoopConfig)> {
    let file = config::load(cli.config.as_deref())?;
    let mut loop_config = file.event_loop;

    if let Some(layout) = &cli.layout {
        loop_config.keyboard_layout.clone_from(layout);
    }
    if let Some(ms) = cli.cooldown_ms {
        loop_config.action_cooldown_ms = ms;
    }
    if let Some(n) = cli.max_commands {
        loop_config.max_commands = n;
    }
    if loop_config.max_commands == 0 {
        bail!("max_commands must be at least 1");
    }

    Ok((cli.backend.unwrap_or(file.backend), loop_config))
}

/// The action a subcommand stands for; `None` for `status`.
fn to_action(command: &Command) -> Option<Action> {
    let ms = Duration::from_millis;
    let with_interval = |action: Action, interval_ms: Option<u64>| match interval_ms {
        Some(v) => action.with_interval(ms(v)),
        None => action,
    };

    let action = match *command {
        Command::Move { x, y, relative } => {
            if relative {
                Action::move_by(x, y)
            } else {
                Action::move_to(x, y)
            }
        }
        Command::Click {
            button,
            count,
            hold_ms,
        } => Action::click(button, count, ms(hold_ms)),
        Command::Button { button, direction } => Action::press_mouse(button, direction.is_down()),
        Command::Key {
            key,
            direction,
            interval_ms,
        } => with_interval(Action::press_key(key, direction.is_down()), interval_ms),
        Command::Hold {
            key,
            hold_ms,
            interval_ms,
        } => with_interval(Action::hold_key(key, ms(hold_ms)), interval_ms),
        Command::Type {
            ref text,
            interval_ms,
        } => with_interval(Action::type_text(text.as_str()), interval_ms),
        Command::Status => return None,
    };
    Some(action)
}

/// Submit one action and wait for it to be delivered.
fn run(event_loop: &EventLoop, action: Action) -> Result<()> {
    let kind = action.kind();
    let outcome = event_loop
        .submit_and_wait(action)
        .with_context(|| format!("failed to submit {kind}"))?;

    match outcome {
        Some(ActionOutcome::Completed) => {
            tracing::debug!(action = kind, "Delivered");
            Ok(())
        }
        Some(ActionOutcome::Partial { unresolved }) => {
            let missing: String = unresolved.into_iter().collect();
            tracing::warn!(
                action = kind,
                missing = %missing.escape_debug(),
                "Some characters have no key in this layout"
            );
            Ok(())
        }
        Some(ActionOutcome::Skipped { reason }) => bail!("{kind} skipped: {reason}"),
        Some(ActionOutcome::Failed { reason }) => bail!("{kind} failed: {reason}"),
        None => bail!(
            "{kind} was discarded before dispatch (status: {})",
            event_loop.status()
        ),
    }
}
