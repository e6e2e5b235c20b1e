use std::{fmt, str::FromStr};

use rand::Rng;

use super::{partition::Partition, topology::RowRange};
use crate::{Error, Result};

pub const DEAD: u8 = 0;
pub const ALIVE: u8 = 1;

/// Validates a cell value received over the wire.
pub fn cell_from_wire(value: i32) -> Result<u8> {
    match value {
        0 => Ok(DEAD),
        1 => Ok(ALIVE),
        other => Err(Error::protocol(format!("cell value {other} is neither 0 nor 1"))),
    }
}

/// A `height x width` matrix of cells stored row-major.
#[derive(Clone, PartialEq, Eq)]
pub struct Grid {
    height: usize,
    width: usize,
    cells: Vec<u8>,
}

impl Grid {
    /// An all-dead grid.
    pub fn new(height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(Error::config(format!(
                "grid dimensions must be positive, got {height}x{width}"
            )));
        }
        let len = height
            .checked_mul(width)
            .ok_or_else(|| Error::config(format!("a {height}x{width} grid is too large")))?;
        Ok(Self {
            height,
            width,
            cells: vec![DEAD; len],
        })
    }

    pub fn from_rows<R: AsRef<[u8]>>(rows: &[R]) -> Result<Self> {
        let width = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut grid = Self::new(rows.len(), width)?;
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != width {
                return Err(Error::config(format!(
                    "row {i} has {} cells, expected {width}",
                    row.len()
                )));
            }
            if let Some(bad) = row.iter().find(|&&c| c > ALIVE) {
                return Err(Error::config(format!("row {i} holds cell value {bad}")));
            }
            grid.row_mut(i).copy_from_slice(row);
        }
        Ok(grid)
    }

    /// A grid where each cell is alive with probability `density`.
    pub fn random<R: Rng + ?Sized>(
        height: usize,
        width: usize,
        density: f64,
        rng: &mut R,
    ) -> Result<Self> {
        let mut grid = Self::new(height, width)?;
        let density = density.clamp(0.0, 1.0);
        for cell in grid.cells.iter_mut() {
            *cell = u8::from(rng.gen_bool(density));
        }
        Ok(grid)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn row(&self, i: usize) -> &[u8] {
        &self.cells[i * self.width..(i + 1) * self.width]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.cells[i * self.width..(i + 1) * self.width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        self.cells.chunks_exact(self.width)
    }

    pub fn alive(&self) -> usize {
        self.cells.iter().filter(|&&c| c == ALIVE).count()
    }

    /// Every cell, row after row.
    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [u8] {
        &mut self.cells
    }

    /// The rows of `range` as one contiguous slice.
    pub fn block_mut(&mut self, range: RowRange) -> &mut [u8] {
        &mut self.cells[range.from * self.width..range.end() * self.width]
    }

    /// The rows of `range` with one ghost row above and below. Ghosts outside
    /// the grid are synthesized dead; inside they copy the neighbouring rows.
    pub fn padded_rows(&self, range: RowRange) -> Vec<u8> {
        let mut slab = Vec::with_capacity((range.count + 2) * self.width);
        match range.from.checked_sub(1) {
            Some(above) => slab.extend_from_slice(self.row(above)),
            None => slab.resize(self.width, DEAD),
        }
        slab.extend_from_slice(&self.cells[range.from * self.width..range.end() * self.width]);
        if range.end() < self.height {
            slab.extend_from_slice(self.row(range.end()));
        } else {
            slab.resize(slab.len() + self.width, DEAD);
        }
        slab
    }

    /// Advances the whole grid one generation in a single partition. This is
    /// the sequential reference the distributed run must agree with.
    pub fn step(&self) -> Grid {
        let range = RowRange {
            from: 0,
            count: self.height,
        };
        let mut partition = Partition::from_slab(self.width, self.height, self.padded_rows(range));
        partition.step();
        Grid {
            height: self.height,
            width: self.width,
            cells: partition.interior().to_vec(),
        }
    }
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.rows() {
            for &cell in row {
                f.write_str(if cell == ALIVE { "*" } else { "o" })?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Grid {}x{}", self.height, self.width)?;
        write!(f, "{self}")
    }
}

/// Parses the console format: `height width` followed by `height * width`
/// whitespace separated 0/1 values.
impl FromStr for Grid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut values = s.split_whitespace().map(|tok| {
            tok.parse::<usize>()
                .map_err(|_| Error::config(format!("`{tok}` is not a number")))
        });
        let mut next = |what: &str| {
            values
                .next()
                .unwrap_or_else(|| Err(Error::config(format!("missing {what}"))))
        };
        let height = next("height")?;
        let width = next("width")?;
        let mut grid = Grid::new(height, width)?;
        for cell in grid.cells.iter_mut() {
            *cell = match next("cell")? {
                0 => DEAD,
                1 => ALIVE,
                other => return Err(Error::config(format!("cell value {other} is neither 0 nor 1"))),
            };
        }
        Ok(grid)
    }
}
