//! Layer assignment for cell banks.
//!
//! Overlapping cells cannot live on the same image layer without hiding
//! each other, so each bank's cells are greedily packed onto the minimum
//! number of non-intersecting layers for layered export.

use crate::nitro::cells::Cell;

/// Open-interval rectangle overlap test; touching edges do not count.
pub fn cells_intersect(a: &Cell, b: &Cell) -> bool {
    (a.x as i32) < b.x as i32 + b.width as i32
        && a.x as i32 + a.width as i32 > b.x as i32
        && (a.y as i32) < b.y as i32 + b.height as i32
        && a.y as i32 + a.height as i32 > b.y as i32
}

/// Assign every cell to a z-layer and return the layer count.
///
/// Cells are visited in ascending (priority, declaration order), the
/// back-to-front draw order. Each cell joins the current top layer unless
/// it intersects a cell already there, in which case it opens a new
/// layer. No re-packing happens afterwards, so layers reflect the draw
/// order exactly.
pub fn assign_layers(cells: &mut [Cell]) -> u32 {
    if cells.is_empty() {
        return 0;
    }

    let mut order: Vec<usize> = (0..cells.len()).collect();
    order.sort_by_key(|&k| (cells[k].priority, cells[k].index));

    let mut layer_count = 1u32;
    cells[order[0]].layer = 0;
    for &current in order.iter().skip(1) {
        let top = layer_count as i32 - 1;
        let hit = (0..cells.len()).any(|other| {
            other != current
                && cells[other].layer == top
                && cells_intersect(&cells[current], &cells[other])
        });
        if hit {
            cells[current].layer = layer_count as i32;
            layer_count += 1;
        } else {
            cells[current].layer = top;
        }
    }
    layer_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nitro::cells::CellAttrs;

    fn cell(x: i16, y: i16, width: u16, height: u16, priority: u8, index: usize) -> Cell {
        Cell {
            x,
            y,
            width,
            height,
            shape: 0,
            size: 0,
            tile_offset: 0,
            attrs: CellAttrs::Normal {
                x_flip: false,
                y_flip: false,
                disabled: false,
            },
            obj_mode: 0,
            mosaic: false,
            depth: false,
            priority,
            palette: 0,
            layer: -1,
            index,
        }
    }

    #[test]
    fn disjoint_cells_share_one_layer() {
        let mut cells = vec![
            cell(0, 0, 8, 8, 0, 0),
            cell(16, 0, 8, 8, 0, 1),
            cell(0, 16, 8, 8, 0, 2),
        ];
        assert_eq!(assign_layers(&mut cells), 1);
        assert!(cells.iter().all(|c| c.layer == 0));
    }

    #[test]
    fn identical_rectangles_need_two_layers() {
        let mut cells = vec![cell(0, 0, 16, 16, 0, 0), cell(0, 0, 16, 16, 0, 1)];
        assert_eq!(assign_layers(&mut cells), 2);
        assert_eq!(cells[0].layer, 0);
        assert_eq!(cells[1].layer, 1);
    }

    #[test]
    fn touching_edges_do_not_intersect() {
        let a = cell(0, 0, 8, 8, 0, 0);
        let b = cell(8, 0, 8, 8, 0, 1);
        assert!(!cells_intersect(&a, &b));
        let c = cell(7, 0, 8, 8, 0, 2);
        assert!(cells_intersect(&a, &c));
    }

    #[test]
    fn assignment_follows_priority_order() {
        // The low-priority cell is visited first even though it is
        // declared last.
        let mut cells = vec![cell(0, 0, 8, 8, 1, 0), cell(0, 0, 8, 8, 0, 1)];
        assert_eq!(assign_layers(&mut cells), 2);
        assert_eq!(cells[1].layer, 0);
        assert_eq!(cells[0].layer, 1);
    }

    #[test]
    fn new_layer_only_checks_the_top() {
        // Third cell overlaps the first (layer 0) but not the second
        // (layer 1), so it joins layer 1.
        let mut cells = vec![
            cell(0, 0, 16, 16, 0, 0),
            cell(0, 0, 8, 8, 0, 1),
            cell(8, 8, 8, 8, 0, 2),
        ];
        assert_eq!(assign_layers(&mut cells), 2);
        assert_eq!(cells[2].layer, 1);
    }
}
