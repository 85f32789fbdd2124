//! Tile scheduling for the grouped GEMM.
//!
//! Maps the logical 2D grid of `(row_block, col_block)` output tiles onto a
//! 1D sequence of execution units. Tiles are enumerated in a grouped
//! ("swizzled") order: row blocks are partitioned into groups, and inside a
//! group consecutive tile ids cycle through the group's rows before moving
//! to the next column, which keeps an expert weight column tile resident
//! across several row tiles.

/// How tiles are distributed over execution units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// One tile per unit; units whose row block lies past the populated
    /// region exit with no work.
    Direct,
    /// A fixed wave of `num_units` units, each walking the tile sequence
    /// with stride `num_units` until exhausted.
    Persistent { num_units: usize },
}

/// Logical output tile grid for one grouped GEMM invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    /// Row blocks in the worst-case aligned layout.
    pub num_row_blocks: usize,
    /// Column blocks over the output width.
    pub num_col_blocks: usize,
    /// Row blocks per swizzle group.
    pub group_size: usize,
}

impl TileGrid {
    pub fn total_tiles(&self) -> usize {
        self.num_row_blocks * self.num_col_blocks
    }

    /// Map a linear tile id to its `(row_block, col_block)`.
    ///
    /// With `group_size == 1` the mapping degenerates to plain row-major
    /// order and skips the group arithmetic.
    pub fn tile_at(&self, tile_id: usize) -> (usize, usize) {
        if self.group_size == 1 {
            return (
                tile_id / self.num_col_blocks,
                tile_id % self.num_col_blocks,
            );
        }
        let tiles_per_group = self.group_size * self.num_col_blocks;
        let group_id = tile_id / tiles_per_group;
        let first_row = group_id * self.group_size;
        let rows_in_group = (self.num_row_blocks - first_row).min(self.group_size);
        let within = tile_id % tiles_per_group;
        (first_row + within % rows_in_group, within / rows_in_group)
    }
}

/// Count the populated tiles an execution unit visits when walking tile ids
/// `start, start + stride, ...` through the grid.
///
/// A tile is populated when its row block lies below
/// `populated_row_blocks`; tiles past that boundary belong entirely to
/// alignment padding and carry no work. This pre-pass is what the
/// persistent policy runs before executing, and it is exact: interleaving
/// of populated and padded rows inside the boundary swizzle group does not
/// terminate the walk early.
pub fn populated_tile_count(
    grid: &TileGrid,
    start: usize,
    stride: usize,
    populated_row_blocks: usize,
) -> usize {
    UnitTiles::new(*grid, start, stride, populated_row_blocks).count()
}

/// Iterator over the populated tiles owned by one execution unit.
#[derive(Debug, Clone)]
pub struct UnitTiles {
    grid: TileGrid,
    tile: usize,
    stride: usize,
    populated_row_blocks: usize,
}

impl UnitTiles {
    fn new(grid: TileGrid, start: usize, stride: usize, populated_row_blocks: usize) -> Self {
        Self {
            grid,
            tile: start,
            stride,
            populated_row_blocks,
        }
    }
}

impl Iterator for UnitTiles {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        while self.tile < self.grid.total_tiles() {
            let (row, col) = self.grid.tile_at(self.tile);
            self.tile += self.stride;
            if row < self.populated_row_blocks {
                return Some((row, col));
            }
        }
        None
    }
}

/// Assigns tiles to execution units under a [`SchedulePolicy`].
#[derive(Debug, Clone, Copy)]
pub struct TileScheduler {
    grid: TileGrid,
    policy: SchedulePolicy,
}

impl TileScheduler {
    pub fn new(grid: TileGrid, policy: SchedulePolicy) -> Self {
        Self { grid, policy }
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    /// Number of execution units the policy launches.
    pub fn unit_count(&self) -> usize {
        match self.policy {
            SchedulePolicy::Direct => self.grid.total_tiles(),
            SchedulePolicy::Persistent { num_units } => {
                num_units.min(self.grid.total_tiles())
            }
        }
    }

    /// Populated tiles owned by `unit`, in execution order.
    pub fn tiles_for_unit(&self, unit: usize, populated_row_blocks: usize) -> UnitTiles {
        match self.policy {
            // A direct unit owns exactly the tile with its own id; a stride
            // of the full grid ends the walk after one candidate.
            SchedulePolicy::Direct => UnitTiles::new(
                self.grid,
                unit,
                self.grid.total_tiles().max(1),
                populated_row_blocks,
            ),
            SchedulePolicy::Persistent { .. } => {
                UnitTiles::new(self.grid, unit, self.unit_count(), populated_row_blocks)
            }
        }
    }
}
