use specta::Type;

/// Which of the two supervised children a process handle belongs to.
///
/// NOTE: Roles are fixed. The launcher enforces at most one live instance
/// per role at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Agent,
    Ui,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::Agent => f.write_str("agent"),
            ProcessRole::Ui => f.write_str("ui"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Exited,
    Failed,
}

impl ProcessState {
    /// True while the child still holds (or may hold) an OS process.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct ProcessStatus {
    pub role: ProcessRole,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
}

/// The single record bridged from the agent process to the Viewer client.
///
/// The Viewer polls this record and treats a missing or null `endpoint` as
/// "not yet available". The launcher nulls it before every agent spawn so a
/// reader can never act on an endpoint from a previous, now-dead session.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct HandoffRecord {
    pub endpoint: Option<String>,
    pub written_at_unix_ms: Option<u64>,
}
