use rand::seq::SliceRandom;
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{
    Direction, DoorState, EntityId, Position,
    world::{Cell, World},
};

/// Who decides an agent's moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Driven by the oracle through the decision protocol.
    Controlled,
    /// Driven by a local [`MovePolicy`].
    Autonomous,
}

/// Result of [`Agent::attempt_move`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Target not passable; nothing changed.
    Blocked,
    /// Agent now occupies the target cell.
    Moved,
    /// Agent stepped through the open door and left the grid.
    Exited,
}

/// An agent on the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: EntityId,
    pub position: Position,
    pub role: Role,
}

impl Agent {
    pub fn new(id: EntityId, position: Position, role: Role) -> Self {
        Agent { id, position, role }
    }

    pub fn is_controlled(&self) -> bool {
        self.role == Role::Controlled
    }

    /// The cell one step away in `direction`. Does not touch any state.
    pub fn propose_move(&self, direction: Direction) -> Option<Position> {
        self.position.step(direction)
    }

    /// Moves to `candidate` if it is passable.
    ///
    /// Stepping onto an open door cell is an exit: the old cell reverts to floor and the
    /// door cell stays a door. Callers must retire an exited agent from the active set.
    pub fn attempt_move(
        &mut self,
        world: &mut World,
        candidate: Position,
        door_state: DoorState,
    ) -> MoveOutcome {
        if !world.is_passable(candidate, door_state) {
            return MoveOutcome::Blocked;
        }

        world.clear(self.position);
        self.position = candidate;

        if world.cell(candidate) == Some(Cell::Door) {
            return MoveOutcome::Exited;
        }
        world.place(candidate, self.id);
        MoveOutcome::Moved
    }

    /// Proposes and attempts a single step in `direction`.
    pub fn step(&mut self, world: &mut World, direction: Direction, door_state: DoorState) -> MoveOutcome {
        match self.propose_move(direction) {
            Some(candidate) => self.attempt_move(world, candidate, door_state),
            None => MoveOutcome::Blocked,
        }
    }
}

/// Chooses moves for agents that are not oracle-controlled.
pub trait MovePolicy: Send {
    /// Returns the direction to move in, or `None` to stay put this turn.
    fn choose_move(&mut self, agent: &Agent, world: &World, door_state: DoorState) -> Option<Direction>;
}

/// Shuffles the four directions and takes the first passable one.
#[derive(Debug)]
pub struct RandomWalker {
    rng: StdRng,
}

impl RandomWalker {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl MovePolicy for RandomWalker {
    fn choose_move(&mut self, agent: &Agent, world: &World, door_state: DoorState) -> Option<Direction> {
        let mut directions = Direction::ALL;
        directions.shuffle(&mut self.rng);
        directions.into_iter().find(|direction| {
            agent
                .propose_move(*direction)
                .is_some_and(|candidate| world.is_passable(candidate, door_state))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(rows: &[&str]) -> (World, Agent) {
        let (world, agents) = World::from_ascii(rows).unwrap();
        let (id, pos) = agents[0];
        (world, Agent::new(id, pos, Role::Controlled))
    }

    #[test]
    fn propose_move_is_pure() {
        let (_, agent) = world(&["###", "#1#", "###"]);
        assert_eq!(agent.propose_move(Direction::Up), Some(Position::new(0, 1)));
        assert_eq!(agent.propose_move(Direction::Right), Some(Position::new(1, 2)));
        assert_eq!(agent.position, Position::new(1, 1));
        let corner = Agent::new(1, Position::new(0, 0), Role::Autonomous);
        assert_eq!(corner.propose_move(Direction::Left), None);
    }

    #[test]
    fn move_onto_floor_updates_cells() {
        let (mut world, mut agent) = world(&["####", "#1.#", "####"]);
        let outcome = agent.step(&mut world, Direction::Right, DoorState::Closed);
        assert_eq!(outcome, MoveOutcome::Moved);
        assert_eq!(agent.position, Position::new(1, 2));
        assert_eq!(world.cell(Position::new(1, 1)), Some(Cell::Floor));
        assert_eq!(world.cell(Position::new(1, 2)), Some(Cell::Occupied(1)));
    }

    #[test]
    fn walls_and_agents_block() {
        let (mut world, agents) = World::from_ascii(&["####", "#12#", "####"]).unwrap();
        let mut first = Agent::new(agents[0].0, agents[0].1, Role::Controlled);
        assert_eq!(first.step(&mut world, Direction::Up, DoorState::Open), MoveOutcome::Blocked);
        assert_eq!(first.step(&mut world, Direction::Right, DoorState::Open), MoveOutcome::Blocked);
        assert_eq!(first.position, Position::new(1, 1));
        assert_eq!(world.to_ascii_rows(), ["####", "#12#", "####"]);
    }

    #[test]
    fn closed_door_blocks_open_door_exits() {
        let (mut world, mut agent) = world(&["#D#", "#1#", "###"]);
        assert_eq!(agent.step(&mut world, Direction::Up, DoorState::Closed), MoveOutcome::Blocked);
        assert_eq!(agent.step(&mut world, Direction::Up, DoorState::Open), MoveOutcome::Exited);
        assert_eq!(world.cell(Position::new(1, 1)), Some(Cell::Floor));
        assert_eq!(world.cell(Position::new(0, 1)), Some(Cell::Door));
    }

    #[test]
    fn random_walker_is_reproducible() {
        let (world, agent) = world(&["#####", "#...#", "#.1.#", "#...#", "#####"]);
        let mut a = RandomWalker::new(9);
        let mut b = RandomWalker::new(9);
        for _ in 0..20 {
            assert_eq!(
                a.choose_move(&agent, &world, DoorState::Open),
                b.choose_move(&agent, &world, DoorState::Open)
            );
        }
    }

    #[test]
    fn random_walker_only_picks_passable() {
        // Only Up leads somewhere.
        let (world, agent) = world(&["#####", "##.##", "##1##", "#####"]);
        let mut walker = RandomWalker::new(1);
        for _ in 0..10 {
            assert_eq!(
                walker.choose_move(&agent, &world, DoorState::Open),
                Some(Direction::Up)
            );
        }
    }

    #[test]
    fn random_walker_stays_when_boxed_in() {
        let (world, agent) = world(&["###", "#1#", "###"]);
        let mut walker = RandomWalker::new(5);
        assert_eq!(walker.choose_move(&agent, &world, DoorState::Open), None);
    }
}
