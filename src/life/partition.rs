use super::grid::{ALIVE, DEAD};
use crate::{Error, Result};

/// One worker's block of rows plus a ghost row above and below.
///
/// Two equally sized buffers hold the current and next generation; `step`
/// writes into the inactive one and flips `current`, so a tick never
/// allocates. Padded row 0 and padded row `rows + 1` are the ghosts.
#[derive(Debug)]
pub struct Partition {
    width: usize,
    rows: usize,
    buffers: [Vec<u8>; 2],
    current: usize,
}

impl Partition {
    /// Builds a partition from `padded_height` rows as shipped by the manager,
    /// ghosts included.
    pub fn from_padded(width: usize, slab: Vec<u8>) -> Result<Self> {
        if width == 0 || slab.len() % width != 0 {
            return Err(Error::protocol(format!(
                "{} cells do not form rows of width {width}",
                slab.len()
            )));
        }
        let padded_height = slab.len() / width;
        if padded_height < 3 {
            return Err(Error::protocol(format!(
                "a partition needs at least one row besides its two ghosts, got {padded_height}"
            )));
        }
        if slab.iter().any(|&c| c > ALIVE) {
            return Err(Error::protocol("partition holds a cell that is neither 0 nor 1"));
        }
        Ok(Self::from_slab(width, padded_height - 2, slab))
    }

    pub(crate) fn from_slab(width: usize, rows: usize, slab: Vec<u8>) -> Self {
        debug_assert_eq!(slab.len(), (rows + 2) * width);
        let spare = slab.clone();
        Self {
            width,
            rows,
            buffers: [slab, spare],
            current: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows this partition owns, ghosts excluded.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn padded_height(&self) -> usize {
        self.rows + 2
    }

    fn cells(&self) -> &[u8] {
        &self.buffers[self.current]
    }

    fn cells_mut(&mut self) -> &mut [u8] {
        &mut self.buffers[self.current]
    }

    /// Padded row `i`; 0 and `rows + 1` are the ghosts.
    pub fn row(&self, i: usize) -> &[u8] {
        &self.cells()[i * self.width..(i + 1) * self.width]
    }

    /// The authoritative rows, contiguous and in order.
    pub fn interior(&self) -> &[u8] {
        &self.cells()[self.width..(self.rows + 1) * self.width]
    }

    pub fn first_row(&self) -> &[u8] {
        self.row(1)
    }

    pub fn last_row(&self) -> &[u8] {
        self.row(self.rows)
    }

    pub fn top_ghost_mut(&mut self) -> &mut [u8] {
        let width = self.width;
        &mut self.cells_mut()[..width]
    }

    pub fn bottom_ghost_mut(&mut self) -> &mut [u8] {
        let (width, rows) = (self.width, self.rows);
        &mut self.cells_mut()[(rows + 1) * width..(rows + 2) * width]
    }

    /// Advances every owned row one generation. A cell's potential is the sum
    /// of the cells directly above and below it (ghosts included) and, where
    /// the column exists, directly left and right. Columns do not wrap. A
    /// cell lives on a potential of 3, keeps its state on 2 and dies
    /// otherwise. Ghost rows are carried over unchanged.
    pub fn step(&mut self) {
        let (width, rows) = (self.width, self.rows);
        let [first, second] = &mut self.buffers;
        let (cur, next) = if self.current == 0 {
            (&*first, second)
        } else {
            (&*second, first)
        };

        next[..width].copy_from_slice(&cur[..width]);
        let bottom = (rows + 1) * width;
        next[bottom..].copy_from_slice(&cur[bottom..]);

        for i in 1..=rows {
            let up = &cur[(i - 1) * width..i * width];
            let here = &cur[i * width..(i + 1) * width];
            let down = &cur[(i + 1) * width..(i + 2) * width];
            let out = &mut next[i * width..(i + 1) * width];
            for j in 0..width {
                let mut potential = up[j] + down[j];
                if j > 0 {
                    potential += here[j - 1];
                }
                if j + 1 < width {
                    potential += here[j + 1];
                }
                out[j] = match potential {
                    3 => ALIVE,
                    2 => here[j],
                    _ => DEAD,
                };
            }
        }

        self.current ^= 1;
    }
}
