use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::{
    DoorState, EntityId, Position,
    config::{ConfigError, validate_layout},
    map::Grid,
};

/// Represents the content of a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    Wall,
    Floor,
    Door,
    Occupied(EntityId),
}

impl Cell {
    /// ASCII symbol used in observations.
    pub fn symbol(self) -> char {
        match self {
            Cell::Wall => '#',
            Cell::Floor => '.',
            Cell::Door => 'D',
            Cell::Occupied(id) => char::from_digit(id as u32, 10).unwrap_or('?'),
        }
    }
}

/// The four border walls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    North,
    East,
    South,
    West,
}

/// Errors raised while reading a world from its ASCII form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapParseError {
    #[error("map is empty")]
    Empty,
    #[error("inconsistent width at row {row}: expected {expected}, found {found}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("unknown map symbol '{symbol}' at ({row}, {col})")]
    UnknownSymbol { symbol: char, row: usize, col: usize },
    #[error("agent {id} appears more than once")]
    DuplicateAgent { id: EntityId },
}

/// A bordered grid with a door span cut into one of its walls.
///
/// Dimensions and the door span are fixed after construction; only occupancy changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct World {
    cells: Grid<Cell>,
    door: Vec<Position>,
}

impl World {
    /// Builds a walled `rows` x `cols` grid (borders included), carves a door span on a
    /// random side and places `agent_count` agents with ids `1..=agent_count` on distinct
    /// interior cells.
    ///
    /// Returns the world and the agents' starting positions in id order.
    pub fn generate<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        agent_count: usize,
        door_span: usize,
        rng: &mut R,
    ) -> Result<(World, Vec<Position>), ConfigError> {
        validate_layout(rows, cols, agent_count, door_span)?;

        let cells = Grid::from_generator(rows, cols, |pos| {
            if pos.row == 0 || pos.col == 0 || pos.row == rows - 1 || pos.col == cols - 1 {
                Cell::Wall
            } else {
                Cell::Floor
            }
        });
        let mut world = World {
            cells,
            door: Vec::new(),
        };

        let side = match rng.random_range(0..4) {
            0 => Side::North,
            1 => Side::East,
            2 => Side::South,
            _ => Side::West,
        };
        let wall_len = match side {
            Side::North | Side::South => cols,
            Side::East | Side::West => rows,
        };
        // Corners are never part of the span.
        let center = rng.random_range(1..wall_len - 1);
        world.carve_door(side, center, door_span);

        let mut interior: Vec<Position> = world
            .cells
            .enumerate()
            .filter(|(pos, _)| !world.cells.is_border(*pos))
            .map(|(pos, _)| pos)
            .collect();
        interior.shuffle(rng);
        interior.truncate(agent_count);

        for (index, pos) in interior.iter().enumerate() {
            world.place(*pos, index + 1);
        }

        Ok((world, interior))
    }

    /// Turns up to `span` wall cells centered on `center` into door cells, clipped to the
    /// side's non-corner cells.
    fn carve_door(&mut self, side: Side, center: usize, span: usize) {
        let (rows, cols) = (self.rows(), self.cols());
        let wall_len = match side {
            Side::North | Side::South => cols,
            Side::East | Side::West => rows,
        };
        let half = span / 2;
        let start = center.saturating_sub(half).max(1);
        let end = (center + half).min(wall_len - 2);

        for offset in start..=end {
            let pos = match side {
                Side::North => Position::new(0, offset),
                Side::South => Position::new(rows - 1, offset),
                Side::West => Position::new(offset, 0),
                Side::East => Position::new(offset, cols - 1),
            };
            self.cells[pos] = Cell::Door;
            self.door.push(pos);
        }
    }

    /// Reads a world from ASCII rows (`#` wall, `.` floor, `D` door, `1`-`9` agents).
    ///
    /// Returns the world and the agents found, sorted by id.
    pub fn from_ascii(lines: &[&str]) -> Result<(World, Vec<(EntityId, Position)>), MapParseError> {
        let rows = lines.len();
        let cols = lines.first().map(|line| line.chars().count()).unwrap_or(0);
        if rows == 0 || cols == 0 {
            return Err(MapParseError::Empty);
        }

        let mut parsed = Vec::with_capacity(rows);
        for (row, line) in lines.iter().enumerate() {
            let symbols: Vec<char> = line.chars().collect();
            if symbols.len() != cols {
                return Err(MapParseError::RaggedRow {
                    row,
                    expected: cols,
                    found: symbols.len(),
                });
            }
            parsed.push(symbols);
        }

        let mut agents: Vec<(EntityId, Position)> = Vec::new();
        let mut door = Vec::new();
        let mut cells = Vec::with_capacity(rows * cols);
        for (row, symbols) in parsed.iter().enumerate() {
            for (col, symbol) in symbols.iter().enumerate() {
                let pos = Position::new(row, col);
                let cell = match symbol {
                    '#' => Cell::Wall,
                    '.' => Cell::Floor,
                    'D' => {
                        door.push(pos);
                        Cell::Door
                    }
                    '1'..='9' => {
                        let id = symbol.to_digit(10).unwrap_or_default() as EntityId;
                        if agents.iter().any(|(existing, _)| *existing == id) {
                            return Err(MapParseError::DuplicateAgent { id });
                        }
                        agents.push((id, pos));
                        Cell::Occupied(id)
                    }
                    other => {
                        return Err(MapParseError::UnknownSymbol {
                            symbol: *other,
                            row,
                            col,
                        });
                    }
                };
                cells.push(cell);
            }
        }

        let mut cells = cells.into_iter();
        let grid = Grid::from_generator(rows, cols, |_| cells.next().unwrap_or(Cell::Wall));
        agents.sort_by_key(|(id, _)| *id);
        Ok((World { cells: grid, door }, agents))
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.cells.rows()
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cells.cols()
    }

    /// Returns the cell at `pos`, or `None` if out of bounds.
    pub fn cell(&self, pos: Position) -> Option<Cell> {
        self.cells.get(pos).copied()
    }

    pub fn cells(&self) -> &Grid<Cell> {
        &self.cells
    }

    /// Positions of the door span.
    pub fn door_cells(&self) -> &[Position] {
        &self.door
    }

    /// True iff `pos` is free floor, or a door cell while the door is open.
    pub fn is_passable(&self, pos: Position, door_state: DoorState) -> bool {
        match self.cell(pos) {
            Some(Cell::Floor) => true,
            Some(Cell::Door) => door_state.is_open(),
            _ => false,
        }
    }

    /// Marks `pos` as occupied by `id`.
    ///
    /// # Panics
    ///
    /// Panics if the cell is not free floor.
    pub fn place(&mut self, pos: Position, id: EntityId) {
        match self.cell(pos) {
            Some(Cell::Floor) => self.cells[pos] = Cell::Occupied(id),
            other => panic!("cannot place agent {id} at {pos:?}: cell is {other:?}"),
        }
    }

    /// Reverts an occupied cell to floor.
    ///
    /// # Panics
    ///
    /// Panics if the cell is not occupied.
    pub fn clear(&mut self, pos: Position) {
        match self.cell(pos) {
            Some(Cell::Occupied(_)) => self.cells[pos] = Cell::Floor,
            other => panic!("cannot clear {pos:?}: cell is {other:?}"),
        }
    }

    /// One string per grid row.
    pub fn to_ascii_rows(&self) -> Vec<String> {
        (0..self.rows())
            .map(|row| self.cells.row(row).iter().map(|cell| cell.symbol()).collect())
            .collect()
    }
}
