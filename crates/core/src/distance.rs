/// Distance reported for zero-norm or mismatched operands.
pub const MAX_COSINE_DISTANCE: f32 = 2.0;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut a_norm = 0.0f32;
    let mut b_norm = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        a_norm += x * x;
        b_norm += y * y;
    }
    if a_norm == 0.0 || b_norm == 0.0 {
        return None;
    }
    Some(dot / (a_norm.sqrt() * b_norm.sqrt()))
}

/// `1 - cosine_similarity`, clamped to `[0, 2]`. Never divides by a zero norm.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    match cosine_similarity(a, b) {
        Some(similarity) => (1.0 - similarity).clamp(0.0, MAX_COSINE_DISTANCE),
        None => MAX_COSINE_DISTANCE,
    }
}
