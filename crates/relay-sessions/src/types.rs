use serde::{Deserialize, Serialize};

/// Lifecycle state of an [`AgentSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSessionState {
    Active,
    Completed,
    Expired,
}

impl std::fmt::Display for AgentSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentSessionState::Active => write!(f, "active"),
            AgentSessionState::Completed => write!(f, "completed"),
            AgentSessionState::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for AgentSessionState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(AgentSessionState::Active),
            "completed" => Ok(AgentSessionState::Completed),
            "expired" => Ok(AgentSessionState::Expired),
            other => Err(format!("unknown agent session state: {other}")),
        }
    }
}

/// Attributes a block of conversation on one channel to a particular agent.
///
/// The invariant enforced by [`crate::manager::SessionManager`] is that at
/// most one row per `channel` is in state [`AgentSessionState::Active`] at a
/// time; `get_or_create_active` is the only way to obtain a live session and
/// always upholds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: String,
    pub channel: String,
    pub agent: String,
    pub created_at: String,
    pub last_activity: String,
    pub state: AgentSessionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            AgentSessionState::Active,
            AgentSessionState::Completed,
            AgentSessionState::Expired,
        ] {
            let parsed: AgentSessionState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }
}
