use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_AGENT_CMD: &str = "python";
const DEFAULT_AGENT_ARGS: &str = "main.py";
const DEFAULT_AGENT_DIR: &str = ".";
const DEFAULT_UI_CMD: &str = "npm";
const DEFAULT_UI_ARGS: &str = "run dev";
const DEFAULT_UI_DIR: &str = "frontend";
const DEFAULT_HANDOFF_PATH: &str = "frontend/src/session-endpoint.json";
const DEFAULT_RESTART_DELAY_MS: u64 = 3000;
const DEFAULT_STOP_GRACE_MS: u64 = 10_000;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

fn restart_delay_ms(raw: Option<u64>) -> u64 {
    raw.map(|v| v.clamp(500, 300_000))
        .unwrap_or(DEFAULT_RESTART_DELAY_MS)
}

fn stop_grace_ms(raw: Option<u64>) -> u64 {
    raw.map(|v| v.clamp(1000, 120_000))
        .unwrap_or(DEFAULT_STOP_GRACE_MS)
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Command line for one child role.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub agent: SpawnSpec,
    pub ui: SpawnSpec,
    pub handoff_path: PathBuf,
    pub restart_delay: Duration,
    pub stop_grace: Duration,
}

impl Config {
    /// Defaults reproduce the reference deployment: a Python agent run from
    /// the launcher directory and an `npm run dev` viewer in `frontend/`.
    pub fn from_env() -> Self {
        let agent = SpawnSpec {
            command: env_string("HANDOVER_AGENT_CMD")
                .unwrap_or_else(|| DEFAULT_AGENT_CMD.to_string()),
            args: split_args(
                &env_string("HANDOVER_AGENT_ARGS")
                    .unwrap_or_else(|| DEFAULT_AGENT_ARGS.to_string()),
            ),
            cwd: PathBuf::from(
                env_string("HANDOVER_AGENT_DIR").unwrap_or_else(|| DEFAULT_AGENT_DIR.to_string()),
            ),
        };

        let ui = SpawnSpec {
            command: env_string("HANDOVER_UI_CMD").unwrap_or_else(|| DEFAULT_UI_CMD.to_string()),
            args: split_args(
                &env_string("HANDOVER_UI_ARGS").unwrap_or_else(|| DEFAULT_UI_ARGS.to_string()),
            ),
            cwd: PathBuf::from(
                env_string("HANDOVER_UI_DIR").unwrap_or_else(|| DEFAULT_UI_DIR.to_string()),
            ),
        };

        Self {
            agent,
            ui,
            handoff_path: PathBuf::from(
                env_string("HANDOVER_HANDOFF_PATH")
                    .unwrap_or_else(|| DEFAULT_HANDOFF_PATH.to_string()),
            ),
            restart_delay: Duration::from_millis(restart_delay_ms(env_u64(
                "HANDOVER_RESTART_DELAY_MS",
            ))),
            stop_grace: Duration::from_millis(stop_grace_ms(env_u64("HANDOVER_STOP_GRACE_MS"))),
        }
    }
}
