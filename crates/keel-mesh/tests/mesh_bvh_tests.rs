// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Whole-index tests: brute-force cross-checks and quantization
//! conservatism.

use keel_geom::{Aabb, Vec3};
use keel_mesh::{StaticBvh, TriangleMesh, TriangleSoup};
use proptest::prelude::*;

/// A flat grid of `n x n` cells, two triangles per cell, in the XZ plane.
fn grid_soup(n: u32) -> TriangleSoup {
    let mut vertices = Vec::new();
    for z in 0..=n {
        for x in 0..=n {
            vertices.push(Vec3::new(x as f32, 0.0, z as f32));
        }
    }
    let stride = n + 1;
    let mut triangles = Vec::new();
    for z in 0..n {
        for x in 0..n {
            let a = z * stride + x;
            let b = a + 1;
            let c = a + stride;
            let d = c + 1;
            triangles.push([a, b, d]);
            triangles.push([a, d, c]);
        }
    }
    let mut soup = TriangleSoup::new();
    soup.add_part(vertices, triangles);
    soup
}

fn brute_force_hits(soup: &TriangleSoup, query: &Aabb) -> Vec<(usize, usize)> {
    let mut hits = Vec::new();
    soup.process_all_triangles(&mut |tri: &[Vec3; 3], part: usize, index: usize| {
        if query.overlaps(&Aabb::from_points(tri)) {
            hits.push((part, index));
        }
    });
    hits.sort_unstable();
    hits
}

#[test]
fn grid_queries_match_brute_force_up_to_conservatism() {
    let soup = grid_soup(10);
    let bvh = StaticBvh::build(&soup, &soup.compute_bounds());
    let queries = [
        Aabb::new(Vec3::new(2.2, -0.5, 2.2), Vec3::new(4.8, 0.5, 4.8)),
        Aabb::new(Vec3::new(0.0, -0.1, 0.0), Vec3::new(0.4, 0.1, 0.4)),
        Aabb::new(Vec3::new(9.5, -1.0, 9.5), Vec3::new(12.0, 1.0, 12.0)),
    ];
    for query in &queries {
        let expected = brute_force_hits(&soup, query);
        let mut got = Vec::new();
        bvh.aabb_overlapping_nodes(query, |part, tri| got.push((part, tri)));
        got.sort_unstable();
        // Quantized bounds only ever grow, so the index may report extras
        // but must never miss a true hit.
        for hit in &expected {
            assert!(got.contains(hit), "missed {hit:?} for query {query:?}");
        }
    }
}

#[test]
fn large_grid_records_subtree_headers_below_the_size_cap() {
    let soup = grid_soup(16);
    let bvh = StaticBvh::build(&soup, &soup.compute_bounds());
    // 512 triangles: the tree is far beyond one subtree's worth of nodes.
    let headers = bvh.subtree_headers();
    assert!(!headers.is_empty());
    for h in headers {
        assert!(h.size * 16 <= 2048);
        assert!(h.root + h.size <= bvh.node_count());
    }
}

#[test]
fn box_cast_reaches_leaves_a_thin_ray_misses() {
    let soup = grid_soup(10);
    let bvh = StaticBvh::build(&soup, &soup.compute_bounds());
    let from = Vec3::new(0.5, 5.0, 0.5);
    let to = Vec3::new(0.5, -5.0, 0.5);

    let mut thin = Vec::new();
    bvh.ray_overlapping_nodes(&from, &to, |part, tri| thin.push((part, tri)));
    let mut wide = Vec::new();
    bvh.box_cast_overlapping_nodes(
        &from,
        &to,
        &Vec3::new(-2.0, 0.0, -2.0),
        &Vec3::new(2.0, 0.0, 2.0),
        |part, tri| wide.push((part, tri)),
    );
    assert!(!thin.is_empty());
    assert!(wide.len() > thin.len());
    for hit in &thin {
        assert!(wide.contains(hit));
    }
}

proptest! {
    #[test]
    fn quantized_leaf_bounds_contain_their_triangles(
        tris in prop::collection::vec(
            (
                (-50.0f32..50.0, -50.0f32..50.0, -50.0f32..50.0),
                (-50.0f32..50.0, -50.0f32..50.0, -50.0f32..50.0),
                (-50.0f32..50.0, -50.0f32..50.0, -50.0f32..50.0),
            ),
            1..40,
        )
    ) {
        let mut vertices = Vec::new();
        let mut triangles = Vec::new();
        for (i, (a, b, c)) in tris.iter().enumerate() {
            vertices.push(Vec3::new(a.0, a.1, a.2));
            vertices.push(Vec3::new(b.0, b.1, b.2));
            vertices.push(Vec3::new(c.0, c.1, c.2));
            let base = (i * 3) as u32;
            triangles.push([base, base + 1, base + 2]);
        }
        let mut soup = TriangleSoup::new();
        soup.add_part(vertices, triangles);
        let bvh = StaticBvh::build(&soup, &soup.compute_bounds());

        // Every triangle must be reported by a query equal to its own box.
        soup.process_all_triangles(&mut |tri: &[Vec3; 3], part: usize, index: usize| {
            let query = Aabb::from_points(tri);
            let mut found = false;
            bvh.aabb_overlapping_nodes(&query, |p, t| {
                found = found || (p == part && t == index);
            });
            assert!(found, "triangle ({part}, {index}) escaped its own box");
        });
    }
}
