use serde::{Deserialize, Serialize};

use crate::{
    DoorState, EntityId,
    action_map::ButtonToken,
    agent::Agent,
    memory::Memory,
    protocol::RejectionKind,
    world::World,
};

/// Where one agent stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPosition {
    pub id: EntityId,
    pub row: usize,
    pub col: usize,
}

/// Snapshot of the given agents, ordered by id.
pub fn agent_positions(agents: &[Agent]) -> Vec<AgentPosition> {
    let mut positions: Vec<AgentPosition> = agents
        .iter()
        .map(|agent| AgentPosition {
            id: agent.id,
            row: agent.position.row,
            col: agent.position.col,
        })
        .collect();
    positions.sort_by_key(|p| p.id);
    positions
}

/// Why the previous reply was refused, sent back so the oracle can correct itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub reason: RejectionKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_reply: Option<String>,
}

/// Everything the oracle sees for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub current_turn: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub door_state: Option<DoorState>,
    pub agent_positions: Vec<AgentPosition>,
    pub ascii_grid: Vec<String>,
    pub button_tokens: Vec<ButtonToken>,
    pub history: Memory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<Correction>,
}

/// Builds the observation from current state and the accumulated history.
///
/// `door_state` is `None` when the run has no door buttons.
pub fn serialize_observation(
    world: &World,
    agents: &[Agent],
    door_state: Option<DoorState>,
    turn: u64,
    button_tokens: &[ButtonToken],
    history: &Memory,
) -> Observation {
    Observation {
        current_turn: turn,
        door_state,
        agent_positions: agent_positions(agents),
        ascii_grid: world.to_ascii_rows(),
        button_tokens: button_tokens.to_vec(),
        history: history.clone(),
        correction: None,
    }
}

impl Observation {
    /// Same observation, annotated with why the last reply was refused.
    pub fn with_correction(mut self, correction: Correction) -> Self {
        self.correction = Some(correction);
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
