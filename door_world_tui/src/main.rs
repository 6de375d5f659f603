use anyhow::{Context, Result};
use clap::Parser;
use door_world_core::{
    DoorState, EntityId,
    agent::{Agent, Role},
    config::{DEFAULT_CONFIG_FILE_NAME, SimConfig},
    oracle::{HttpOracle, OracleClient},
    protocol::DecisionProtocol,
    simulation::{RunOutcome, Simulation, TickOutcome},
    turn_log::JsonlTurnLog,
    world::{Cell, World},
};
use ratatui::{
    crossterm::{
        self,
        event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
        execute,
        terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
    },
    prelude::*,
    widgets::*,
};
use std::{
    fs::{self, File},
    io::{self, Stdout},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::runtime::{Handle, Runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;

const AGENT_COLORS: [Color; 6] = [
    Color::Cyan,
    Color::Magenta,
    Color::Yellow,
    Color::LightBlue,
    Color::LightRed,
    Color::LightGreen,
];

#[derive(Parser, Debug)]
#[command(version, about = "Grid room with a hidden button mapping, driven by an LLM", long_about = None)]
struct Args {
    /// TOML config file; defaults apply if it does not exist
    #[arg(short, long, value_name = "CONFIG_FILE", default_value = DEFAULT_CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Seed for layout, button mapping and autonomous agents
    #[arg(short, long)]
    seed: Option<u64>,

    /// Number of buttons (4 = movement only, 6 = movement plus door)
    #[arg(short, long)]
    buttons: Option<usize>,

    /// Id of the agent the oracle controls
    #[arg(long)]
    controlled_agent: Option<EntityId>,

    /// Abort after this many consecutive rejected replies
    #[arg(long)]
    max_retries: Option<u32>,

    /// Directory for the turn log and, in TUI mode, the trace log
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Run without the terminal UI, logging to stderr
    #[arg(long)]
    headless: bool,
}

struct App {
    /// The core simulation.
    simulation: Simulation,
    /// Flag to control the main loop.
    should_quit: bool,
    /// Flag to control if the run is over.
    game_over: bool,
    /// One-line summary of the last thing that happened.
    last_event: String,
}

impl App {
    fn new(simulation: Simulation) -> Self {
        App {
            simulation,
            should_quit: false,
            game_over: false,
            last_event: "waiting for the first decision".to_string(),
        }
    }

    /// Handles one step of the simulation.
    fn tick(&mut self) -> Result<()> {
        if self.game_over {
            return Ok(());
        }
        match self.simulation.tick()? {
            TickOutcome::Waiting => {}
            TickOutcome::Advanced {
                turn,
                choice,
                exited,
            } => {
                self.last_event = if exited.is_empty() {
                    format!("turn {turn}: pressed {choice}")
                } else {
                    format!("turn {turn}: pressed {choice}, agents {exited:?} left")
                };
            }
            TickOutcome::Retrying { kind, attempt } => {
                self.last_event = format!("reply rejected ({kind:?}), retry {attempt}");
            }
            TickOutcome::Finished(outcome) => {
                self.last_event = outcome.to_string();
                self.game_over = true;
            }
        }
        Ok(())
    }

    /// Sets the quit flag.
    fn quit(&mut self) {
        self.should_quit = true;
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_dir = args
        .log_dir
        .clone()
        .unwrap_or_else(|| SimConfig::log_dir_hint(&args.config));
    init_tracing(&log_dir, args.headless)?;

    let config = load_config(&args)?;
    let runtime = Runtime::new().context("starting oracle runtime")?;
    let result = run(&args, &config, runtime.handle());
    shutdown_oracle_runtime(runtime);

    println!("{}", result?);
    Ok(())
}

/// Loads the config file and applies command line overrides.
fn load_config(args: &Args) -> Result<SimConfig> {
    let mut config = SimConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if args.seed.is_some() {
        config.game.seed = args.seed;
    }
    if let Some(buttons) = args.buttons {
        config.game.buttons = buttons;
    }
    if args.controlled_agent.is_some() {
        config.game.controlled_agent = args.controlled_agent;
    }
    if args.max_retries.is_some() {
        config.game.max_retries = args.max_retries;
    }
    if let Some(log_dir) = &args.log_dir {
        config.game.log_dir = log_dir.clone();
    }
    config.validated().context("invalid configuration")
}

/// Plays one run and returns the line to print once the terminal is back.
fn run(args: &Args, config: &SimConfig, runtime: &Handle) -> Result<String> {
    let oracle = HttpOracle::from_config(&config.oracle).context("building oracle client")?;
    let turn_log = JsonlTurnLog::create(&config.game.log_dir, oracle.model_name())
        .context("creating turn log")?;
    info!(path = %turn_log.path().display(), model = oracle.model_name(), "turn log opened");

    let protocol = DecisionProtocol::new(Arc::new(oracle), runtime.clone());
    let simulation = Simulation::setup(config, protocol, Box::new(turn_log))?;
    let mut app = App::new(simulation);
    let tick_rate = Duration::from_millis(config.game.tick_rate_ms);

    if args.headless {
        run_headless(&mut app, tick_rate)?;
    } else {
        let mut terminal = setup_terminal()?;
        let result = run_app(&mut terminal, &mut app, tick_rate);
        restore_terminal(&mut terminal)?;
        result?;
    }

    Ok(match app.simulation.outcome() {
        Some(outcome) => outcome.to_string(),
        None => format!("Quit on turn {}.", app.simulation.turn()),
    })
}

/// Stops the runtime without waiting for an oracle request that is still in flight.
fn shutdown_oracle_runtime(runtime: Runtime) {
    runtime.shutdown_background();
}

/// Logs go to stderr when headless, otherwise to a file so they do not tear the UI.
fn init_tracing(log_dir: &Path, headless: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if headless {
        builder.with_writer(io::stderr).init();
    } else {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("creating log directory {}", log_dir.display()))?;
        let file = File::create(log_dir.join("door_world.log")).context("creating log file")?;
        builder.with_writer(Mutex::new(file)).with_ansi(false).init();
    }
    Ok(())
}

/// Ticks until the run ends.
fn run_headless(app: &mut App, tick_rate: Duration) -> Result<()> {
    while !app.game_over {
        app.tick()?;
        std::thread::sleep(tick_rate);
    }
    Ok(())
}

/// Configures the terminal for TUI interaction.
fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    let mut stdout = io::stdout();
    enable_raw_mode()?;
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).map_err(Into::into)
}

/// Restores the terminal to its original state.
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

/// Runs the main loop of the TUI application.
fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
    tick_rate: Duration,
) -> Result<()> {
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|f| ui(f, app))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));

        if crossterm::event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => app.quit(),
                    _ => {}
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            app.tick()?;
            last_tick = Instant::now();
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}

/// Renders the user interface.
fn ui(frame: &mut Frame, app: &App) {
    let main_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(60),
            Constraint::Percentage(32),
            Constraint::Length(2),
        ])
        .split(frame.area());
    let lower = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(main_layout[1]);

    let simulation = &app.simulation;
    render_map(
        frame,
        main_layout[0],
        simulation.world(),
        simulation.door_state(),
        simulation.controlled_id(),
    );
    render_agents(frame, lower[0], simulation.agents());
    render_status(frame, lower[1], app);

    let help_text = Paragraph::new("Press 'q' or 'Esc' to quit.")
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::TOP));
    frame.render_widget(help_text, main_layout[2]);
}

fn agent_style(id: EntityId, controlled_id: EntityId) -> Style {
    let style = Style::default().fg(AGENT_COLORS[id % AGENT_COLORS.len()]);
    if id == controlled_id {
        style.bold().underlined()
    } else {
        style
    }
}

/// Renders the grid onto the frame.
fn render_map(
    frame: &mut Frame,
    area: Rect,
    world: &World,
    door_state: DoorState,
    controlled_id: EntityId,
) {
    let mut lines: Vec<Line> = Vec::with_capacity(world.rows());

    for row in 0..world.rows() {
        let spans: Vec<Span> = world
            .cells()
            .row(row)
            .iter()
            .map(|cell| match cell {
                Cell::Wall => Span::styled("#", Style::default().fg(Color::DarkGray)),
                Cell::Floor => Span::raw("."),
                Cell::Door if door_state.is_open() => {
                    Span::styled("+", Style::default().fg(Color::Green).bold())
                }
                Cell::Door => Span::styled("|", Style::default().fg(Color::Red).bold()),
                Cell::Occupied(id) => {
                    Span::styled(cell.symbol().to_string(), agent_style(*id, controlled_id))
                }
            })
            .collect();
        lines.push(Line::from(spans));
    }

    let map_paragraph = Paragraph::new(lines)
        .block(Block::default().title("Door World").borders(Borders::ALL))
        .alignment(Alignment::Center);

    frame.render_widget(map_paragraph, area);
}

/// Lists the agents still inside.
fn render_agents(frame: &mut Frame, area: Rect, agents: &[Agent]) {
    let controlled_id = agents
        .iter()
        .find(|agent| agent.is_controlled())
        .map(|agent| agent.id)
        .unwrap_or_default();
    let items: Vec<ListItem> = agents
        .iter()
        .map(|agent| {
            let role = match agent.role {
                Role::Controlled => "oracle",
                Role::Autonomous => "random",
            };
            ListItem::from(Line::from(vec![
                Span::styled(
                    format!("Agent {}", agent.id),
                    agent_style(agent.id, controlled_id),
                ),
                Span::raw(format!(
                    " ({}, {}) {role}",
                    agent.position.row, agent.position.col
                )),
            ]))
        })
        .collect();

    let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Agents"));
    frame.render_widget(list, area);
}

/// Turn counter, door, oracle phase and the oracle's latest reasoning.
fn render_status(frame: &mut Frame, area: Rect, app: &App) {
    let simulation = &app.simulation;
    let span = simulation.world().door_cells().len();
    let door = if simulation.action_map().scheme().has_door_buttons() {
        format!("{:?}, {span} cells", simulation.door_state())
    } else {
        format!("always open, {span} cells")
    };
    let mut lines = vec![
        Line::from(format!(
            "Turn {}  |  Door: {door}  |  Oracle: {} ({} requests)",
            simulation.turn(),
            simulation.phase(),
            simulation.requests_issued()
        )),
        Line::from(format!(
            "Controlling agent {}  |  Agents inside: {}  |  Rejections in a row: {}",
            simulation.controlled_id(),
            simulation.agents().len(),
            simulation.consecutive_rejections()
        )),
        Line::from(app.last_event.clone()),
    ];
    if let Some(decision) = simulation.last_decision() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            format!("Plan: {}", decision.next_reasoning),
            Style::default().italic(),
        )));
    }
    if let Some(rejection) = simulation.last_rejection() {
        lines.push(Line::from(Span::styled(
            rejection.error.to_string(),
            Style::default().fg(Color::Red),
        )));
    }
    if let Some(outcome) = simulation.outcome() {
        let color = match outcome {
            RunOutcome::Won { .. } => Color::Green,
            RunOutcome::ExitedEarly { .. } => Color::Red,
        };
        lines.push(Line::from(Span::styled(
            outcome.to_string(),
            Style::default().fg(color).bold(),
        )));
    }

    let status = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title("Status"));
    frame.render_widget(status, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use door_world_core::{
        Direction,
        action_map::{ActionMap, ButtonToken, Primitive},
        oracle::{OracleError, OracleRequest},
        simulation::RunSettings,
        turn_log::MemoryTurnLog,
    };

    /// Answers only after a long pause, like a slow model endpoint.
    struct Sluggish;

    impl OracleClient for Sluggish {
        fn complete(&self, _request: &OracleRequest) -> Result<String, OracleError> {
            std::thread::sleep(Duration::from_secs(3));
            Err(OracleError::EmptyChoice)
        }
    }

    #[test]
    fn quitting_mid_request_does_not_wait_for_the_oracle() {
        let runtime = Runtime::new().unwrap();
        let (world, placements) = World::from_ascii(&["#####", "#.1.#", "#####"]).unwrap();
        let action_map = ActionMap::from_bindings(
            Direction::ALL
                .iter()
                .enumerate()
                .map(|(index, direction)| (ButtonToken::numbered(index + 1), Primitive::Move(*direction)))
                .collect(),
        );
        let protocol = DecisionProtocol::new(Arc::new(Sluggish), runtime.handle().clone());
        let simulation = Simulation::new(
            world,
            &placements,
            1,
            action_map,
            DoorState::Open,
            protocol,
            Box::new(MemoryTurnLog::new()),
            RunSettings::default(),
        )
        .unwrap();
        let mut app = App::new(simulation);
        app.tick().unwrap();
        app.quit();

        let started = Instant::now();
        drop(app);
        shutdown_oracle_runtime(runtime);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
