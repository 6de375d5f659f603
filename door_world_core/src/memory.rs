use serde::{Deserialize, Serialize};

use crate::{DoorState, action_map::ButtonToken, observation::AgentPosition};

/// The oracle's self-reported fields for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnAnnotation {
    pub action_taken: ButtonToken,
    pub prev_reasoning: String,
    pub next_reasoning: String,
    pub action_map_guess: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub turn: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub door_state: Option<DoorState>,
    pub agent_positions: Vec<AgentPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle: Option<TurnAnnotation>,
}

impl MemoryEntry {
    pub fn is_backfilled(&self) -> bool {
        self.oracle.is_some()
    }
}

/// Ordered, append-only turn history. `entries[i].turn == i`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Memory {
    entries: Vec<MemoryEntry>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the snapshot for `turn`.
    ///
    /// # Panics
    ///
    /// Panics if `turn` does not directly follow the last recorded turn.
    pub fn record_turn_start(
        &mut self,
        turn: u64,
        door_state: Option<DoorState>,
        agent_positions: Vec<AgentPosition>,
    ) {
        let expected = self.entries.len() as u64;
        assert_eq!(
            turn, expected,
            "memory turns must be contiguous: expected turn {expected}, got {turn}"
        );
        self.entries.push(MemoryEntry {
            turn,
            door_state,
            agent_positions,
            oracle: None,
        });
    }

    /// Writes the oracle's fields into the entry one before the most recently appended one.
    ///
    /// # Panics
    ///
    /// Panics if there is no such entry or it was already back-filled.
    pub fn backfill_previous_turn(&mut self, annotation: TurnAnnotation) {
        let len = self.entries.len();
        assert!(len >= 2, "no previous turn to back-fill (history has {len} entries)");
        let entry = &mut self.entries[len - 2];
        assert!(
            entry.oracle.is_none(),
            "memory entry for turn {} is already back-filled",
            entry.turn
        );
        entry.oracle = Some(annotation);
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn positions(row: usize) -> Vec<AgentPosition> {
        vec![AgentPosition { id: 1, row, col: 1 }]
    }

    fn annotation(token: usize) -> TurnAnnotation {
        TurnAnnotation {
            action_taken: ButtonToken::numbered(token),
            prev_reasoning: "nothing happened yet".to_string(),
            next_reasoning: "try another button".to_string(),
            action_map_guess: json!({"btn1": "up"}),
        }
    }

    #[test]
    fn backfills_the_entry_before_the_newest() {
        let mut memory = Memory::new();
        memory.record_turn_start(0, Some(DoorState::Closed), positions(3));
        memory.record_turn_start(1, Some(DoorState::Closed), positions(2));
        memory.backfill_previous_turn(annotation(2));

        let entries = memory.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].oracle, Some(annotation(2)));
        assert!(!entries[1].is_backfilled());
    }

    #[test]
    #[should_panic(expected = "already back-filled")]
    fn double_backfill_fails_fast() {
        let mut memory = Memory::new();
        memory.record_turn_start(0, None, positions(3));
        memory.record_turn_start(1, None, positions(2));
        memory.backfill_previous_turn(annotation(1));
        memory.backfill_previous_turn(annotation(3));
    }

    #[test]
    #[should_panic(expected = "no previous turn")]
    fn backfill_without_previous_entry_fails_fast() {
        let mut memory = Memory::new();
        memory.record_turn_start(0, None, positions(3));
        memory.backfill_previous_turn(annotation(1));
    }

    #[test]
    #[should_panic(expected = "contiguous")]
    fn turn_gaps_are_rejected() {
        let mut memory = Memory::new();
        memory.record_turn_start(0, None, positions(3));
        memory.record_turn_start(2, None, positions(3));
    }

    #[test]
    fn serializes_as_a_plain_list() {
        let mut memory = Memory::new();
        memory.record_turn_start(0, None, positions(3));
        let value = serde_json::to_value(&memory).unwrap();
        assert_eq!(
            value,
            json!([{"turn": 0, "agent_positions": [{"id": 1, "row": 3, "col": 1}]}])
        );
    }
}
