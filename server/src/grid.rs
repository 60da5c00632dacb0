//! Tile grid and pathfinding.
//!
//! DESIGN
//! ======
//! A room's floor is a rectangular map of walkable/blocked tiles. Movement is
//! 8-connected: cardinal steps cost 10, diagonal steps 14 (integer-scaled
//! 1 / √2), and a diagonal step is legal only when both orthogonal tiles
//! sharing its corner are walkable, so nobody squeezes through wall corners.
//! `find_path` runs A* with a Manhattan heuristic and FIFO tie-breaking on
//! equal `f`, returning the steps strictly after the origin.
//!
//! Legacy room data may carry blocked border tiles; construction forces every
//! edge tile walkable. The persisted row is never touched.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Tile value for a walkable cell.
pub const WALKABLE: u8 = 0;
/// Tile value for a blocked cell.
pub const BLOCKED: u8 = 1;

const CARDINAL_COST: u32 = 10;
const DIAGONAL_COST: u32 = 14;

/// The eight neighbour offsets, cardinals first.
const NEIGHBOURS: [(i32, i32); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

/// A rectangular walkable/blocked tile map with normalized borders.
#[derive(Debug, Clone)]
pub struct Grid {
    width: i32,
    height: i32,
    /// Row-major: `tiles[y][x]`.
    tiles: Vec<Vec<u8>>,
}

impl Grid {
    /// Build a grid from persisted tile rows, forcing all border tiles
    /// walkable. Rows are truncated or padded (blocked) to `width` ×
    /// `height` so a corrupt row can never cause out-of-range indexing.
    #[must_use]
    pub fn new(width: u32, height: u32, mut tiles: Vec<Vec<u8>>) -> Self {
        let (w, h) = (width as usize, height as usize);
        tiles.resize(h, vec![BLOCKED; w]);
        for row in &mut tiles {
            row.resize(w, BLOCKED);
        }

        for (y, row) in tiles.iter_mut().enumerate() {
            for (x, tile) in row.iter_mut().enumerate() {
                if y == 0 || y == h - 1 || x == 0 || x == w - 1 {
                    *tile = WALKABLE;
                }
            }
        }

        #[allow(clippy::cast_possible_wrap)]
        let (width, height) = (w as i32, h as i32);
        Self { width, height, tiles }
    }

    /// An all-walkable grid, used for default rooms.
    #[must_use]
    pub fn open(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![vec![WALKABLE; width as usize]; height as usize])
    }

    #[must_use]
    pub fn width(&self) -> i32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> i32 {
        self.height
    }

    /// The normalized tile rows, as sent to clients.
    #[must_use]
    pub fn tiles(&self) -> &[Vec<u8>] {
        &self.tiles
    }

    #[must_use]
    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && x < self.width && y >= 0 && y < self.height
    }

    /// Whether `(x, y)` can be stood on. Out of bounds is not walkable.
    #[must_use]
    pub fn walkable(&self, x: i32, y: i32) -> bool {
        self.in_bounds(x, y) && self.tiles[y as usize][x as usize] == WALKABLE
    }

    /// Where a new participant is placed: `(0, 0)` when walkable, otherwise
    /// the first walkable tile in row-major order. Border normalization makes
    /// the first case hold for every well-formed room; `(0, 0)` remains the
    /// fallback for degenerate maps.
    #[must_use]
    pub fn spawn_point(&self) -> (i32, i32) {
        if self.walkable(0, 0) {
            return (0, 0);
        }
        for y in 0..self.height {
            for x in 0..self.width {
                if self.walkable(x, y) {
                    return (x, y);
                }
            }
        }
        (0, 0)
    }

    /// Shortest 8-connected path from `from` to `to`, as the sequence of
    /// tiles strictly after `from` and ending at `to`.
    ///
    /// Empty when `from == to` and empty when no path exists; callers that
    /// need to tell these apart compare the endpoints.
    #[must_use]
    pub fn find_path(&self, from: (i32, i32), to: (i32, i32)) -> Vec<(i32, i32)> {
        if from == to || !self.walkable(from.0, from.1) || !self.walkable(to.0, to.1) {
            return Vec::new();
        }

        // Min-heap on (f, insertion sequence): FIFO among equal f.
        let mut open: BinaryHeap<Reverse<(u32, u64, (i32, i32))>> = BinaryHeap::new();
        let mut seq: u64 = 0;
        let mut g_score: HashMap<(i32, i32), u32> = HashMap::new();
        let mut came_from: HashMap<(i32, i32), (i32, i32)> = HashMap::new();

        g_score.insert(from, 0);
        open.push(Reverse((heuristic(from, to), seq, from)));

        while let Some(Reverse((_, _, current))) = open.pop() {
            if current == to {
                return self.reconstruct(&came_from, from, to);
            }
            let current_g = g_score[&current];

            for (dx, dy) in NEIGHBOURS {
                let next = (current.0 + dx, current.1 + dy);
                if !self.walkable(next.0, next.1) {
                    continue;
                }
                let diagonal = dx != 0 && dy != 0;
                // No corner cutting: both tiles flanking the diagonal must be open.
                if diagonal && !(self.walkable(current.0 + dx, current.1) && self.walkable(current.0, current.1 + dy)) {
                    continue;
                }

                let step = if diagonal { DIAGONAL_COST } else { CARDINAL_COST };
                let tentative = current_g + step;
                if g_score.get(&next).is_none_or(|&g| tentative < g) {
                    g_score.insert(next, tentative);
                    came_from.insert(next, current);
                    seq += 1;
                    open.push(Reverse((tentative + heuristic(next, to), seq, next)));
                }
            }
        }

        Vec::new()
    }

    fn reconstruct(
        &self,
        came_from: &HashMap<(i32, i32), (i32, i32)>,
        from: (i32, i32),
        to: (i32, i32),
    ) -> Vec<(i32, i32)> {
        let mut path = vec![to];
        let mut node = to;
        while let Some(&prev) = came_from.get(&node) {
            if prev == from {
                break;
            }
            path.push(prev);
            node = prev;
        }
        path.reverse();
        path
    }
}

fn heuristic(a: (i32, i32), b: (i32, i32)) -> u32 {
    let dx = a.0.abs_diff(b.0);
    let dy = a.1.abs_diff(b.1);
    (dx + dy) * CARDINAL_COST
}

#[cfg(test)]
#[path = "grid_test.rs"]
mod tests;
