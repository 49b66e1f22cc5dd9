//! Score one query against many raw `f32` targets packed back to back.
//!
//! Each lane chunk of the query is loaded once and applied to a group of targets before the
//! kernel advances, which amortizes query loads when reranking short candidate lists. Results are
//! similarity scores normalized the same way as the lookup engine output.

use crate::{
    VectorSimilarity,
    capability::InstructionSet,
    distance::{LanePath, dot},
};

fn check_shape(query: &[f32], packed: &[f32], out: &[f32]) {
    assert_eq!(
        packed.len(),
        query.len() * out.len(),
        "packed targets must hold out.len() vectors of query.len() dimensions"
    );
}

/// Write the normalized dot product score of `query` against each target in `packed` to `out`.
///
/// *Panics* if `packed.len() != query.len() * out.len()`.
pub fn dot_product_multi(query: &[f32], packed: &[f32], out: &mut [f32], width: InstructionSet) {
    check_shape(query, packed, out);
    let kernels = LanePath::select(query.len(), width).kernels();
    // SAFETY: select() only returns paths whose features were probed.
    unsafe { (kernels.dot_multi)(query, packed, out) };
    for o in out.iter_mut() {
        *o = VectorSimilarity::Dot.score(*o);
    }
}

/// Write the normalized squared l2 score of `query` against each target in `packed` to `out`.
///
/// *Panics* if `packed.len() != query.len() * out.len()`.
pub fn square_distance_multi(
    query: &[f32],
    packed: &[f32],
    out: &mut [f32],
    width: InstructionSet,
) {
    check_shape(query, packed, out);
    let kernels = LanePath::select(query.len(), width).kernels();
    // SAFETY: select() only returns paths whose features were probed.
    unsafe { (kernels.l2sq_multi)(query, packed, out) };
    for o in out.iter_mut() {
        *o = VectorSimilarity::Euclidean.score(*o);
    }
}

/// Write the normalized cosine score of `query` against each target in `packed` to `out`.
///
/// A zero magnitude query or target is treated as orthogonal to everything.
///
/// *Panics* if `packed.len() != query.len() * out.len()`.
pub fn cosine_multi(query: &[f32], packed: &[f32], out: &mut [f32], width: InstructionSet) {
    check_shape(query, packed, out);
    if query.is_empty() {
        out.fill(VectorSimilarity::Cosine.score(0.0));
        return;
    }
    let kernels = LanePath::select(query.len(), width).kernels();
    // SAFETY: select() only returns paths whose features were probed.
    unsafe { (kernels.dot_multi)(query, packed, out) };
    let query_mag = dot(query, query, width);
    for (o, target) in out.iter_mut().zip(packed.chunks_exact(query.len())) {
        let denom = (query_mag * dot(target, target, width)).sqrt();
        let cos = if denom > 0.0 { *o / denom } else { 0.0 };
        *o = VectorSimilarity::Cosine.score(cos);
    }
}
