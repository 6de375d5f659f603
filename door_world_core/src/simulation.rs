use std::collections::HashMap;
use std::fmt;

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, info, warn};

use crate::{
    Direction, DoorState, EntityId, Position,
    action_map::{ActionMap, ButtonToken, ControlScheme, Primitive},
    agent::{Agent, MoveOutcome, MovePolicy, RandomWalker, Role},
    config::{ConfigError, SimConfig},
    memory::Memory,
    observation::{Correction, Observation, agent_positions, serialize_observation},
    oracle::{OracleRequest, default_preamble},
    protocol::{Decision, DecisionProtocol, ProtocolPhase, Rejection, RejectionKind},
    turn_log::{TurnLog, TurnLogError, TurnRecord},
    world::World,
};

/// How a run ended. Only the controlled agent's exit ends a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The controlled agent left through the door as the last agent inside.
    Won { agent: EntityId },
    /// The controlled agent left while others were still inside.
    ExitedEarly { agent: EntityId, remaining: usize },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Won { agent } => write!(f, "YOU WIN! Agent {agent} left the room last."),
            RunOutcome::ExitedEarly { agent, remaining } => write!(
                f,
                "YOU LOSE! Agent {agent} left with {remaining} agent(s) still inside."
            ),
        }
    }
}

/// Fatal errors. Oracle-side problems never surface here unless the retry cap is hit.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("oracle reply rejected {attempts} times in a row on turn {turn}, giving up")]
    RetryLimitExceeded { turn: u64, attempts: u32 },
    #[error(transparent)]
    TurnLog(#[from] TurnLogError),
    #[error("observation encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No decision available yet; render only.
    Waiting,
    /// A decision was applied and the next request is in flight.
    Advanced {
        turn: u64,
        choice: ButtonToken,
        exited: Vec<EntityId>,
    },
    /// The reply was refused and a corrective request was sent.
    Retrying { kind: RejectionKind, attempt: u32 },
    Finished(RunOutcome),
}

/// Per-run knobs that are not part of the world itself.
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub max_retries: Option<u32>,
    /// Replaces the built-in preamble.
    pub preamble: Option<String>,
    /// Seeds the autonomous agents' move policies.
    pub policy_seed: u64,
}

/// Owns all simulation state. Mutated only from the thread calling [`Simulation::tick`].
pub struct Simulation {
    world: World,
    agents: Vec<Agent>,
    policies: HashMap<EntityId, Box<dyn MovePolicy>>,
    controlled_id: EntityId,
    action_map: ActionMap,
    door_state: DoorState,
    turn: u64,
    memory: Memory,
    protocol: DecisionProtocol,
    turn_log: Box<dyn TurnLog>,
    preamble: String,
    max_retries: Option<u32>,
    consecutive_rejections: u32,
    sent: Option<Observation>,
    last_decision: Option<Decision>,
    last_rejection: Option<Rejection>,
    outcome: Option<RunOutcome>,
}

impl Simulation {
    /// Builds a random run from `config` and sends the first decision request.
    pub fn setup(
        config: &SimConfig,
        protocol: DecisionProtocol,
        turn_log: Box<dyn TurnLog>,
    ) -> Result<Self, SimulationError> {
        let config = config.clone().validated()?;
        let scheme = config.control_scheme()?;
        let mut rng = match config.game.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let action_map = ActionMap::generate(scheme, &mut rng);
        let grid = &config.grid;
        let (world, positions) = World::generate(
            grid.total_rows(),
            grid.total_cols(),
            grid.agent_count,
            grid.door_span,
            &mut rng,
        )?;
        let controlled_id = config
            .game
            .controlled_agent
            .unwrap_or_else(|| rng.random_range(1..=grid.agent_count));
        let placements: Vec<(EntityId, Position)> = positions
            .into_iter()
            .enumerate()
            .map(|(index, pos)| (index + 1, pos))
            .collect();
        let door_state = match scheme {
            ControlScheme::Movement => DoorState::Open,
            ControlScheme::WithDoor => DoorState::Closed,
        };
        let settings = RunSettings {
            max_retries: config.game.max_retries,
            preamble: config.oracle.preamble.clone(),
            policy_seed: rng.random(),
        };

        Self::new(
            world,
            &placements,
            controlled_id,
            action_map,
            door_state,
            protocol,
            turn_log,
            settings,
        )
    }

    /// Starts a run on a prepared world: logs the header, records turn 0 and sends the
    /// first decision request.
    ///
    /// # Panics
    ///
    /// Panics if `controlled_id` is not among `placements`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        world: World,
        placements: &[(EntityId, Position)],
        controlled_id: EntityId,
        action_map: ActionMap,
        door_state: DoorState,
        protocol: DecisionProtocol,
        turn_log: Box<dyn TurnLog>,
        settings: RunSettings,
    ) -> Result<Self, SimulationError> {
        assert!(
            placements.iter().any(|(id, _)| *id == controlled_id),
            "controlled agent {controlled_id} is not on the grid"
        );

        let mut agents = Vec::with_capacity(placements.len());
        let mut policies: HashMap<EntityId, Box<dyn MovePolicy>> = HashMap::new();
        for (id, pos) in placements {
            let role = if *id == controlled_id {
                Role::Controlled
            } else {
                policies.insert(
                    *id,
                    Box::new(RandomWalker::new(settings.policy_seed.wrapping_add(*id as u64))),
                );
                Role::Autonomous
            };
            agents.push(Agent::new(*id, *pos, role));
        }
        agents.sort_by_key(|agent| agent.id);

        let preamble = settings.preamble.unwrap_or_else(|| {
            default_preamble(&action_map.tokens(), action_map.scheme().has_door_buttons())
        });

        let mut simulation = Simulation {
            world,
            agents,
            policies,
            controlled_id,
            action_map,
            door_state,
            turn: 0,
            memory: Memory::new(),
            protocol,
            turn_log,
            preamble,
            max_retries: settings.max_retries,
            consecutive_rejections: 0,
            sent: None,
            last_decision: None,
            last_rejection: None,
            outcome: None,
        };

        info!(
            controlled = controlled_id,
            agents = simulation.agents.len(),
            buttons = simulation.action_map.tokens().len(),
            door = ?simulation.door_state,
            "simulation ready"
        );
        debug!(action_map = ?simulation.action_map.to_table(), "hidden button mapping");

        simulation.turn_log.record(&TurnRecord::Header {
            controlled_agent_id: controlled_id,
            action_map: simulation.action_map.to_table(),
        })?;
        simulation.record_turn_start();
        simulation.send_request(None)?;
        Ok(simulation)
    }

    /// Advances the run by one tick without ever blocking on the oracle.
    pub fn tick(&mut self) -> Result<TickOutcome, SimulationError> {
        if let Some(outcome) = self.outcome {
            return Ok(TickOutcome::Finished(outcome));
        }
        if self.protocol.poll() == ProtocolPhase::RequestInFlight {
            return Ok(TickOutcome::Waiting);
        }

        let tokens = self.action_map.tokens();
        match self.protocol.take_outcome(&tokens) {
            None => Ok(TickOutcome::Waiting),
            Some(Ok(decision)) => self.apply_decision(decision),
            Some(Err(rejection)) => self.retry(rejection),
        }
    }

    fn apply_decision(&mut self, decision: Decision) -> Result<TickOutcome, SimulationError> {
        self.consecutive_rejections = 0;
        self.last_rejection = None;

        if let Some(sent) = self.sent.take() {
            self.turn_log.record(&TurnRecord::Turn {
                observation: serde_json::to_value(&sent)?,
                reply: decision.reply.clone(),
            })?;
        }

        let Some(primitive) = self.action_map.resolve(&decision.choice) else {
            panic!("validated choice {} has no binding", decision.choice);
        };
        info!(
            turn = self.turn,
            choice = %decision.choice,
            ?primitive,
            "applying oracle decision"
        );

        match primitive {
            Primitive::Move(direction) => {
                if self.move_controlled(direction) == MoveOutcome::Exited {
                    let outcome = self.finish_run();
                    self.close_turn(decision);
                    return Ok(TickOutcome::Finished(outcome));
                }
            }
            Primitive::OpenDoor => self.door_state = DoorState::Open,
            Primitive::CloseDoor => self.door_state = DoorState::Closed,
        }

        let exited = self.move_autonomous();
        let choice = decision.choice.clone();
        self.close_turn(decision);
        self.send_request(None)?;

        Ok(TickOutcome::Advanced {
            turn: self.turn,
            choice,
            exited,
        })
    }

    fn retry(&mut self, rejection: Rejection) -> Result<TickOutcome, SimulationError> {
        self.consecutive_rejections += 1;
        let kind = rejection.kind();
        let attempt = self.consecutive_rejections;
        warn!(
            turn = self.turn,
            ?kind,
            attempt,
            error = %rejection.error,
            "oracle reply rejected"
        );

        if let Some(max) = self.max_retries {
            if attempt > max {
                return Err(SimulationError::RetryLimitExceeded {
                    turn: self.turn,
                    attempts: attempt,
                });
            }
        }

        let correction = rejection.correction();
        self.last_rejection = Some(rejection);
        self.send_request(Some(correction))?;
        Ok(TickOutcome::Retrying { kind, attempt })
    }

    fn move_controlled(&mut self, direction: Direction) -> MoveOutcome {
        let door_state = self.door_state;
        let Some(agent) = self.agents.iter_mut().find(|a| a.id == self.controlled_id) else {
            panic!("controlled agent {} is not active", self.controlled_id);
        };
        let outcome = agent.step(&mut self.world, direction, door_state);
        debug!(agent = agent.id, ?direction, ?outcome, "controlled move");
        outcome
    }

    /// Moves every autonomous agent once in id order and retires those that exit.
    fn move_autonomous(&mut self) -> Vec<EntityId> {
        let door_state = self.door_state;
        let mut exited = Vec::new();

        for index in 0..self.agents.len() {
            let agent = &self.agents[index];
            if agent.role != Role::Autonomous {
                continue;
            }
            let Some(policy) = self.policies.get_mut(&agent.id) else {
                continue;
            };
            let Some(direction) = policy.choose_move(agent, &self.world, door_state) else {
                continue;
            };
            let agent = &mut self.agents[index];
            if agent.step(&mut self.world, direction, door_state) == MoveOutcome::Exited {
                info!(agent = agent.id, "autonomous agent left through the door");
                exited.push(agent.id);
            }
        }

        self.agents.retain(|agent| !exited.contains(&agent.id));
        for id in &exited {
            self.policies.remove(id);
        }
        exited
    }

    fn finish_run(&mut self) -> RunOutcome {
        let agent = self.controlled_id;
        self.agents.retain(|a| a.id != agent);
        let remaining = self.agents.len();
        let outcome = if remaining == 0 {
            RunOutcome::Won { agent }
        } else {
            RunOutcome::ExitedEarly { agent, remaining }
        };
        info!(%outcome, "run finished");
        self.outcome = Some(outcome);
        outcome
    }

    /// Advances the turn counter, snapshots the new turn and back-fills the one just played.
    fn close_turn(&mut self, decision: Decision) {
        self.turn += 1;
        self.record_turn_start();
        self.memory.backfill_previous_turn(decision.annotation());
        self.last_decision = Some(decision);
    }

    fn record_turn_start(&mut self) {
        let door_state = self.reported_door_state();
        self.memory
            .record_turn_start(self.turn, door_state, agent_positions(&self.agents));
    }

    fn send_request(&mut self, correction: Option<Correction>) -> Result<(), SimulationError> {
        let mut observation = self.observation();
        if let Some(correction) = correction {
            observation = observation.with_correction(correction);
        }
        let request = OracleRequest {
            preamble: self.preamble.clone(),
            observation: observation.to_json()?,
        };
        self.protocol.issue_request(request);
        self.sent = Some(observation);
        Ok(())
    }

    fn reported_door_state(&self) -> Option<DoorState> {
        self.action_map
            .scheme()
            .has_door_buttons()
            .then_some(self.door_state)
    }

    /// The observation for the current turn, without any correction.
    pub fn observation(&self) -> Observation {
        serialize_observation(
            &self.world,
            &self.agents,
            self.reported_door_state(),
            self.turn,
            &self.action_map.tokens(),
            &self.memory,
        )
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Agents still inside, ordered by id.
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn controlled_id(&self) -> EntityId {
        self.controlled_id
    }

    pub fn door_state(&self) -> DoorState {
        self.door_state
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn action_map(&self) -> &ActionMap {
        &self.action_map
    }

    pub fn phase(&self) -> ProtocolPhase {
        self.protocol.phase()
    }

    /// Oracle requests sent so far, retries included.
    pub fn requests_issued(&self) -> u64 {
        self.protocol.requests_issued()
    }

    pub fn consecutive_rejections(&self) -> u32 {
        self.consecutive_rejections
    }

    pub fn last_decision(&self) -> Option<&Decision> {
        self.last_decision.as_ref()
    }

    pub fn last_rejection(&self) -> Option<&Rejection> {
        self.last_rejection.as_ref()
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }
}
