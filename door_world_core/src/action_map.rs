use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::Direction;

/// An opaque button symbol such as `btn3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ButtonToken(String);

impl ButtonToken {
    /// Token for the 1-based button `index`.
    pub fn numbered(index: usize) -> Self {
        ButtonToken(format!("btn{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ButtonToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What pressing a button does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    Move(Direction),
    OpenDoor,
    CloseDoor,
}

/// Which primitives a run exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlScheme {
    /// Four movement buttons; the door stays open.
    Movement,
    /// Movement plus open/close door buttons; the door starts closed.
    WithDoor,
}

impl ControlScheme {
    pub fn from_button_count(count: usize) -> Option<Self> {
        match count {
            4 => Some(ControlScheme::Movement),
            6 => Some(ControlScheme::WithDoor),
            _ => None,
        }
    }

    pub fn primitives(self) -> Vec<Primitive> {
        let mut primitives: Vec<Primitive> =
            Direction::ALL.iter().copied().map(Primitive::Move).collect();
        if self == ControlScheme::WithDoor {
            primitives.push(Primitive::OpenDoor);
            primitives.push(Primitive::CloseDoor);
        }
        primitives
    }

    /// True when the door state is part of what the oracle observes and controls.
    pub fn has_door_buttons(self) -> bool {
        self == ControlScheme::WithDoor
    }
}

/// A fixed, randomly permuted assignment of primitives to button tokens.
///
/// Built once per run and never shown to the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMap {
    bindings: Vec<(ButtonToken, Primitive)>,
}

impl ActionMap {
    /// Shuffles the scheme's primitives onto `btn1..btnN`.
    pub fn generate<R: Rng + ?Sized>(scheme: ControlScheme, rng: &mut R) -> Self {
        let mut primitives = scheme.primitives();
        primitives.shuffle(rng);
        let bindings = primitives
            .into_iter()
            .enumerate()
            .map(|(index, primitive)| (ButtonToken::numbered(index + 1), primitive))
            .collect();
        ActionMap { bindings }
    }

    /// Builds a map from explicit bindings, keeping their order.
    pub fn from_bindings(bindings: Vec<(ButtonToken, Primitive)>) -> Self {
        ActionMap { bindings }
    }

    /// Door buttons present means [`ControlScheme::WithDoor`].
    pub fn scheme(&self) -> ControlScheme {
        let has_door = self
            .bindings
            .iter()
            .any(|(_, p)| matches!(p, Primitive::OpenDoor | Primitive::CloseDoor));
        if has_door {
            ControlScheme::WithDoor
        } else {
            ControlScheme::Movement
        }
    }

    /// The valid tokens in button order.
    pub fn tokens(&self) -> Vec<ButtonToken> {
        self.bindings.iter().map(|(token, _)| token.clone()).collect()
    }

    pub fn resolve(&self, token: &ButtonToken) -> Option<Primitive> {
        self.bindings
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, primitive)| *primitive)
    }

    /// Sorted view used for the turn log header.
    pub fn to_table(&self) -> BTreeMap<ButtonToken, Primitive> {
        self.bindings.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};
    use std::collections::HashSet;

    #[test]
    fn generates_a_permutation_for_each_scheme() {
        for scheme in [ControlScheme::Movement, ControlScheme::WithDoor] {
            let mut rng = StdRng::seed_from_u64(3);
            let map = ActionMap::generate(scheme, &mut rng);
            let tokens = map.tokens();
            assert_eq!(tokens.len(), scheme.primitives().len());
            assert_eq!(tokens[0].as_str(), "btn1");

            let bound: HashSet<Primitive> = tokens.iter().filter_map(|t| map.resolve(t)).collect();
            let expected: HashSet<Primitive> = scheme.primitives().into_iter().collect();
            assert_eq!(bound, expected);
        }
    }

    #[test]
    fn same_seed_same_map() {
        let a = ActionMap::generate(ControlScheme::WithDoor, &mut StdRng::seed_from_u64(11));
        let b = ActionMap::generate(ControlScheme::WithDoor, &mut StdRng::seed_from_u64(11));
        assert_eq!(a, b);
    }

    #[test]
    fn resolve_unknown_token() {
        let map = ActionMap::generate(ControlScheme::Movement, &mut StdRng::seed_from_u64(1));
        assert!(map.resolve(&ButtonToken::numbered(5)).is_none());
        assert!(map.resolve(&ButtonToken::numbered(4)).is_some());
    }

    #[test]
    fn primitive_serializes_snake_case() {
        let json = serde_json::to_string(&Primitive::Move(Direction::Left)).unwrap();
        assert_eq!(json, r#"{"move":"left"}"#);
        let json = serde_json::to_string(&Primitive::OpenDoor).unwrap();
        assert_eq!(json, r#""open_door""#);
    }
}
