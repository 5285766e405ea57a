use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::protocol::WireCell;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(ActorId);
id_newtype!(RoomId);
id_newtype!(WorldId);

/// Board position. Ordered row-major so snapshots iterate top-left first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl PartialOrd for Coord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Coord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.y, self.x).cmp(&(other.y, other.x))
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Decodes from either the flat `ownerId` shape or the nested `owner` square
/// shape; see [`crate::protocol::WireCell`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "WireCell")]
pub struct Cell {
    pub x: i32,
    pub y: i32,
    pub owner_id: Option<ActorId>,
    pub defense_bonus: u32,
}

impl Cell {
    pub fn new(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            owner_id: None,
            defense_bonus: 0,
        }
    }

    pub fn coord(&self) -> Coord {
        Coord::new(self.x, self.y)
    }

    pub fn with_owner(mut self, owner: Option<ActorId>) -> Self {
        self.owner_id = owner;
        self
    }

    pub fn with_defense_bonus(mut self, defense_bonus: u32) -> Self {
        self.defense_bonus = defense_bonus;
        self
    }

    pub fn clamped(mut self, max_defense_bonus: u32) -> Self {
        self.defense_bonus = self.defense_bonus.min(max_defense_bonus);
        self
    }
}

/// The whole board at one instant, keyed by coordinate identity.
///
/// Duplicate coordinates collapse to the last cell seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Cell>", into = "Vec<Cell>")]
pub struct BoardSnapshot {
    cells: BTreeMap<Coord, Cell>,
}

impl BoardSnapshot {
    pub fn from_cells(cells: impl IntoIterator<Item = Cell>) -> Self {
        Self {
            cells: cells.into_iter().map(|cell| (cell.coord(), cell)).collect(),
        }
    }

    /// An unowned `width` x `height` board starting at (0, 0).
    pub fn empty(width: i32, height: i32) -> Self {
        Self::from_cells((0..height).flat_map(|y| (0..width).map(move |x| Cell::new(x, y))))
    }

    pub fn get(&self, coord: Coord) -> Option<&Cell> {
        self.cells.get(&coord)
    }

    pub fn contains(&self, coord: Coord) -> bool {
        self.cells.contains_key(&coord)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    /// Replaces the cell with the same identity. Returns the previous value,
    /// or `None` without inserting when the coordinate is not on the board.
    pub fn replace_cell(&mut self, cell: Cell) -> Option<Cell> {
        let slot = self.cells.get_mut(&cell.coord())?;
        Some(std::mem::replace(slot, cell))
    }

    pub fn clamped(self, max_defense_bonus: u32) -> Self {
        Self::from_cells(
            self.cells
                .into_values()
                .map(|cell| cell.clamped(max_defense_bonus)),
        )
    }

    pub fn owned_by<'a>(&'a self, actor: &'a ActorId) -> impl Iterator<Item = &'a Cell> + 'a {
        self.cells
            .values()
            .filter(move |cell| cell.owner_id.as_ref() == Some(actor))
    }
}

impl From<Vec<Cell>> for BoardSnapshot {
    fn from(cells: Vec<Cell>) -> Self {
        Self::from_cells(cells)
    }
}

impl From<BoardSnapshot> for Vec<Cell> {
    fn from(board: BoardSnapshot) -> Self {
        board.cells.into_values().collect()
    }
}

impl FromIterator<Cell> for BoardSnapshot {
    fn from_iter<T: IntoIterator<Item = Cell>>(iter: T) -> Self {
        Self::from_cells(iter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorSummary {
    pub id: ActorId,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldMeta {
    pub id: WorldId,
    pub slug: RoomId,
    pub name: String,
    #[serde(default)]
    pub owner: Option<ActorSummary>,
    pub board_size: u32,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub max_teams: Option<u32>,
    #[serde(default)]
    pub allow_player_team_creation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Capture,
    Defend,
    Reset,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Capture => "capture",
            Self::Defend => "defend",
            Self::Reset => "reset",
        })
    }
}
