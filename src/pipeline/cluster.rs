//! Union-find clustering of vector-drawing primitives.
//!
//! Two boxes belong to the same cluster when both their horizontal and
//! vertical gaps (zero when overlapping on that axis) are within the
//! proximity threshold; clusters are the connected components of that
//! relation. Comparison is pairwise, which is fine for the few hundred
//! primitives a page carries.

use crate::output::BoundingBox;

/// Disjoint-set forest with path compression and union by rank.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// One connected group of primitives.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub bbox: BoundingBox,
    /// Number of primitives in the group.
    pub members: usize,
}

/// Gap between two intervals, zero when they overlap.
fn axis_gap(a0: f32, a1: f32, b0: f32, b1: f32) -> f32 {
    (a0.max(b0) - a1.min(b1)).max(0.0)
}

fn near(a: &BoundingBox, b: &BoundingBox, max_gap: f32) -> bool {
    axis_gap(a.x0, a.x1, b.x0, b.x1) <= max_gap && axis_gap(a.y0, a.y1, b.y0, b.y1) <= max_gap
}

/// Group `boxes` into clusters, sorted top-to-bottom then left-to-right.
///
/// The result does not depend on input order.
pub fn cluster_boxes(boxes: &[BoundingBox], max_gap: f32) -> Vec<Cluster> {
    let mut uf = UnionFind::new(boxes.len());
    for i in 0..boxes.len() {
        for j in (i + 1)..boxes.len() {
            if near(&boxes[i], &boxes[j], max_gap) {
                uf.union(i, j);
            }
        }
    }

    let mut by_root: std::collections::HashMap<usize, Cluster> = std::collections::HashMap::new();
    for (i, b) in boxes.iter().enumerate() {
        let root = uf.find(i);
        by_root
            .entry(root)
            .and_modify(|c| {
                c.bbox = c.bbox.union(b);
                c.members += 1;
            })
            .or_insert(Cluster {
                bbox: *b,
                members: 1,
            });
    }

    let mut clusters: Vec<Cluster> = by_root.into_values().collect();
    clusters.sort_by(|a, b| {
        a.bbox
            .y0
            .total_cmp(&b.bbox.y0)
            .then(a.bbox.x0.total_cmp(&b.bbox.x0))
            .then(a.bbox.y1.total_cmp(&b.bbox.y1))
            .then(a.bbox.x1.total_cmp(&b.bbox.x1))
            .then(a.members.cmp(&b.members))
    });
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(x0: f32, y0: f32, x1: f32, y1: f32) -> BoundingBox {
        BoundingBox::new(x0, y0, x1, y1)
    }

    #[test]
    fn union_find_components() {
        let mut uf = UnionFind::new(5);
        uf.union(0, 1);
        uf.union(3, 4);
        uf.union(1, 4);
        assert_eq!(uf.find(0), uf.find(3));
        assert_ne!(uf.find(0), uf.find(2));
    }

    #[test]
    fn gap_threshold_is_inclusive() {
        let boxes = [bb(0.0, 0.0, 10.0, 10.0), bb(40.0, 0.0, 50.0, 10.0)];
        assert_eq!(cluster_boxes(&boxes, 30.0).len(), 1);
        assert_eq!(cluster_boxes(&boxes, 29.9).len(), 2);
    }

    #[test]
    fn both_axes_must_be_close() {
        // Horizontally overlapping but far apart vertically.
        let boxes = [bb(0.0, 0.0, 10.0, 10.0), bb(0.0, 100.0, 10.0, 110.0)];
        assert_eq!(cluster_boxes(&boxes, 30.0).len(), 2);
    }

    #[test]
    fn chains_merge_transitively() {
        let boxes = [
            bb(0.0, 0.0, 10.0, 10.0),
            bb(35.0, 0.0, 45.0, 10.0),
            bb(70.0, 0.0, 80.0, 10.0),
        ];
        let clusters = cluster_boxes(&boxes, 30.0);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, 3);
        assert_eq!(clusters[0].bbox, bb(0.0, 0.0, 80.0, 10.0));
    }

    #[test]
    fn input_order_does_not_matter() {
        let boxes = vec![
            bb(100.0, 100.0, 150.0, 140.0),
            bb(500.0, 600.0, 520.0, 620.0),
            bb(160.0, 120.0, 200.0, 180.0),
            bb(10.0, 700.0, 30.0, 720.0),
            bb(530.0, 610.0, 560.0, 650.0),
            bb(120.0, 150.0, 130.0, 400.0),
        ];
        let forward = cluster_boxes(&boxes, 30.0);
        let mut reversed = boxes.clone();
        reversed.reverse();
        assert_eq!(forward, cluster_boxes(&reversed, 30.0));
        let mut rotated = boxes.clone();
        rotated.rotate_left(2);
        assert_eq!(forward, cluster_boxes(&rotated, 30.0));
        assert_eq!(forward, cluster_boxes(&boxes, 30.0));
        assert_eq!(forward.len(), 3);
    }

    #[test]
    fn empty_input() {
        assert!(cluster_boxes(&[], 30.0).is_empty());
    }
}
