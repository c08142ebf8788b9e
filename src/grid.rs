//! The spatial side of a program: positions, regions, and read access to the symbols placed in a world.

use std::collections::BTreeMap;
use std::ops::Add;
use std::fmt;

use compact_str::CompactString;
use serde::{Serialize, Deserialize};

use crate::runtime::Item;

/// A cell position in the grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}
impl GridPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
    /// Scales all components by `k`.
    pub const fn scale(self, k: i32) -> Self {
        Self { x: self.x * k, y: self.y * k, z: self.z * k }
    }
    /// Key used to order program entry points deterministically (`z`, then `y`, then `x`).
    pub fn scan_order(self) -> (i32, i32, i32) {
        (self.z, self.y, self.x)
    }
}
impl Add for GridPos {
    type Output = GridPos;
    fn add(self, rhs: GridPos) -> GridPos {
        GridPos::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}
impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// An axis-aligned box of cells, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Region {
    pub min: GridPos,
    pub max: GridPos,
}
impl Region {
    /// Creates the smallest region containing both corners.
    pub fn new(a: GridPos, b: GridPos) -> Self {
        Self {
            min: GridPos::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: GridPos::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }
    pub fn contains(&self, pos: GridPos) -> bool {
        (self.min.x..=self.max.x).contains(&pos.x)
        && (self.min.y..=self.max.y).contains(&pos.y)
        && (self.min.z..=self.max.z).contains(&pos.z)
    }
}

/// Where a program (or a run of it) originates: the world it was built in and its entry cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub world: CompactString,
    pub pos: GridPos,
}
impl Origin {
    pub fn new(world: &str, pos: GridPos) -> Self {
        Self { world: world.into(), pos }
    }
}
impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.world, self.pos)
    }
}

/// Read access to a world's placed symbols and their attached metadata.
///
/// The revision counter must change whenever anything observable through this trait changes;
/// compiled programs are cached against it.
pub trait Grid {
    /// The identifier of the world this grid belongs to.
    fn world(&self) -> &str;
    /// A counter that changes on every edit.
    fn revision(&self) -> u64;
    /// The symbol kind placed at the given cell, if any.
    fn symbol_at(&self, pos: GridPos) -> Option<&str>;
    /// The text lines of the label attached at the given cell, if any.
    fn label_at(&self, pos: GridPos) -> Option<&[CompactString]>;
    /// The slots of the container at the given cell, if any.
    fn container_at(&self, pos: GridPos) -> Option<&[Option<Item>]>;
    /// All symbols placed inside the region.
    fn symbols_in(&self, region: Region) -> Vec<(GridPos, &str)>;
}

/// A simple in-memory [`Grid`], used by hosts that mirror world state and by tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryGrid {
    world: CompactString,
    revision: u64,
    symbols: BTreeMap<GridPos, CompactString>,
    labels: BTreeMap<GridPos, Vec<CompactString>>,
    containers: BTreeMap<GridPos, Vec<Option<Item>>>,
}
impl MemoryGrid {
    pub fn new(world: &str) -> Self {
        Self { world: world.into(), ..Default::default() }
    }
    /// Places (or replaces) a symbol.
    pub fn place(&mut self, pos: GridPos, symbol: &str) {
        self.symbols.insert(pos, symbol.into());
        self.revision += 1;
    }
    /// Attaches label lines at the given cell.
    pub fn set_label<I: IntoIterator<Item = S>, S: Into<CompactString>>(&mut self, pos: GridPos, lines: I) {
        self.labels.insert(pos, lines.into_iter().map(Into::into).collect());
        self.revision += 1;
    }
    /// Attaches a container with the given slots at the given cell.
    pub fn set_container(&mut self, pos: GridPos, slots: Vec<Option<Item>>) {
        self.containers.insert(pos, slots);
        self.revision += 1;
    }
    /// Removes whatever is at the given cell (symbol, label, and container).
    pub fn clear(&mut self, pos: GridPos) {
        let removed = self.symbols.remove(&pos).is_some() | self.labels.remove(&pos).is_some() | self.containers.remove(&pos).is_some();
        if removed {
            self.revision += 1;
        }
    }
}
impl Grid for MemoryGrid {
    fn world(&self) -> &str {
        &self.world
    }
    fn revision(&self) -> u64 {
        self.revision
    }
    fn symbol_at(&self, pos: GridPos) -> Option<&str> {
        self.symbols.get(&pos).map(|x| x.as_str())
    }
    fn label_at(&self, pos: GridPos) -> Option<&[CompactString]> {
        self.labels.get(&pos).map(|x| x.as_slice())
    }
    fn container_at(&self, pos: GridPos) -> Option<&[Option<Item>]> {
        self.containers.get(&pos).map(|x| x.as_slice())
    }
    fn symbols_in(&self, region: Region) -> Vec<(GridPos, &str)> {
        self.symbols.iter().filter(|(pos, _)| region.contains(**pos)).map(|(pos, sym)| (*pos, sym.as_str())).collect()
    }
}

#[test]
fn test_memory_grid_revision() {
    let mut grid = MemoryGrid::new("overworld");
    assert_eq!(grid.revision(), 0);
    grid.place(GridPos::new(0, 0, 0), "event");
    grid.set_label(GridPos::new(0, 0, -1), ["on trigger"]);
    assert_eq!(grid.revision(), 2);
    grid.clear(GridPos::new(5, 5, 5));
    assert_eq!(grid.revision(), 2);
    grid.clear(GridPos::new(0, 0, 0));
    assert_eq!(grid.revision(), 3);
    assert_eq!(grid.symbol_at(GridPos::new(0, 0, 0)), None);
    assert_eq!(grid.label_at(GridPos::new(0, 0, -1)).map(|x| x.len()), Some(1));
}

#[test]
fn test_region() {
    let r = Region::new(GridPos::new(4, 0, 2), GridPos::new(-4, 3, 0));
    assert_eq!(r.min, GridPos::new(-4, 0, 0));
    assert_eq!(r.max, GridPos::new(4, 3, 2));
    assert!(r.contains(GridPos::new(0, 3, 1)));
    assert!(!r.contains(GridPos::new(0, 4, 1)));
    assert_eq!(GridPos::new(1, 2, 3) + GridPos::new(1, 0, 0).scale(2), GridPos::new(3, 2, 3));
}
