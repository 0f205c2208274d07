use crate::foundation::error::{ComposeError, ComposeResult};
use crate::state::config::SessionOpts;

/// One display tile: its raster size and the process that shows it.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct TileParams {
    /// Tile width in pixels.
    pub width: usize,
    /// Tile height in pixels.
    pub height: usize,
    /// Rank of the process that displays this tile.
    pub display_node: usize,
}

impl TileParams {
    /// Pixel count of the tile.
    pub fn num_pixels(&self) -> usize {
        self.width * self.height
    }
}

/// Cluster and tile topology for one compose.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Topology {
    /// Number of participating processes.
    pub num_processes: usize,
    /// This process's rank.
    pub rank: usize,
    /// The display tiles.
    pub tiles: Vec<TileParams>,
    /// `contained_masks[p][t]` is true when process `p` renders a
    /// contribution for tile `t`.
    pub contained_masks: Vec<Vec<bool>>,
}

impl Topology {
    /// Number of processes contributing to tile `t`.
    pub fn contrib_count(&self, t: usize) -> usize {
        self.contained_masks.iter().filter(|m| m[t]).count()
    }

    /// Per-tile contribution counts.
    pub fn contrib_counts(&self) -> Vec<usize> {
        (0..self.tiles.len()).map(|t| self.contrib_count(t)).collect()
    }

    /// Total contribution count across all tiles.
    pub fn total_contrib(&self) -> usize {
        self.contained_masks
            .iter()
            .map(|m| m.iter().filter(|&&b| b).count())
            .sum()
    }

    /// The tile this process displays, if any.
    pub fn displayed_tile(&self) -> Option<usize> {
        self.tiles.iter().position(|t| t.display_node == self.rank)
    }

    pub(crate) fn validate(&self, opts: &SessionOpts) -> ComposeResult<()> {
        if self.num_processes == 0 {
            return Err(ComposeError::topology("topology has no processes"));
        }
        if self.rank >= self.num_processes {
            return Err(ComposeError::topology(format!(
                "rank {} out of range for {} processes",
                self.rank, self.num_processes
            )));
        }
        if self.contained_masks.len() != self.num_processes {
            return Err(ComposeError::topology(
                "contained mask row per process required",
            ));
        }
        for (p, mask) in self.contained_masks.iter().enumerate() {
            if mask.len() != self.tiles.len() {
                return Err(ComposeError::topology(format!(
                    "contained mask for process {p} does not cover every tile"
                )));
            }
        }
        let mut seen_display = vec![false; self.num_processes];
        for (t, tile) in self.tiles.iter().enumerate() {
            if tile.display_node >= self.num_processes {
                return Err(ComposeError::topology(format!(
                    "display node {} of tile {t} out of range",
                    tile.display_node
                )));
            }
            if seen_display[tile.display_node] {
                return Err(ComposeError::topology(format!(
                    "process {} displays more than one tile",
                    tile.display_node
                )));
            }
            seen_display[tile.display_node] = true;
        }
        if opts.ordered_composite {
            let order = &opts.composite_order;
            if order.len() != self.num_processes {
                return Err(ComposeError::topology(
                    "composite order must list every rank",
                ));
            }
            let mut seen = vec![false; self.num_processes];
            for &r in order {
                if r >= self.num_processes || seen[r] {
                    return Err(ComposeError::topology(
                        "composite order must be a permutation of ranks",
                    ));
                }
                seen[r] = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::config::{ColorFormat, CompositeMode, DepthFormat};

    fn opts() -> SessionOpts {
        SessionOpts::default()
    }

    fn two_tile_topology() -> Topology {
        Topology {
            num_processes: 4,
            rank: 0,
            tiles: vec![
                TileParams {
                    width: 4,
                    height: 2,
                    display_node: 0,
                },
                TileParams {
                    width: 4,
                    height: 2,
                    display_node: 1,
                },
            ],
            contained_masks: vec![
                vec![true, false],
                vec![true, true],
                vec![false, true],
                vec![false, true],
            ],
        }
    }

    #[test]
    fn counts_are_derived_from_masks() {
        let topo = two_tile_topology();
        assert_eq!(topo.contrib_counts(), vec![2, 3]);
        assert_eq!(topo.total_contrib(), 5);
        assert_eq!(topo.displayed_tile(), Some(0));
    }

    #[test]
    fn rejects_duplicate_display_nodes() {
        let mut topo = two_tile_topology();
        topo.tiles[1].display_node = 0;
        assert!(topo.validate(&opts()).is_err());
    }

    #[test]
    fn rejects_bad_mask_shape() {
        let mut topo = two_tile_topology();
        topo.contained_masks[2].pop();
        assert!(topo.validate(&opts()).is_err());
    }

    #[test]
    fn ordered_mode_requires_rank_permutation() {
        let mut o = SessionOpts {
            composite_mode: CompositeMode::Blend,
            color_format: ColorFormat::RgbaUbyte,
            depth_format: DepthFormat::None,
            ordered_composite: true,
            composite_order: vec![2, 0, 1],
            ..SessionOpts::default()
        };
        let topo = two_tile_topology();
        assert!(topo.validate(&o).is_err());
        o.composite_order = vec![2, 0, 1, 3];
        assert!(topo.validate(&o).is_ok());
        o.composite_order = vec![2, 0, 1, 1];
        assert!(topo.validate(&o).is_err());
    }
}
