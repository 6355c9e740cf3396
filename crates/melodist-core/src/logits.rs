use itertools::Itertools;

/// Divide every score by `temperature`.
///
/// Scores are first shifted so the highest one is 0; softmax is unchanged by the shift,
/// and a tiny temperature can then only push scores down to `-inf`, never up to `+inf`.
pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let shift = match max.is_finite() {
        true => max,
        false => 0.0,
    };
    logits
        .iter_mut()
        .for_each(|x| *x = (*x - shift) / temperature);
}

/// Keep the `top_k` highest scores and mask the rest with `-inf`.
///
/// Ties at the boundary are kept in favor of the lower token id.
pub fn apply_top_k(logits: &mut [f32], top_k: usize) {
    if top_k >= logits.len() {
        return;
    }
    let masked = logits
        .iter()
        .enumerate()
        .sorted_by(|(_, x), (_, y)| x.total_cmp(y).reverse())
        .skip(top_k)
        .map(|(id, _)| id)
        .collect_vec();
    for id in masked {
        logits[id] = f32::NEG_INFINITY;
    }
}

/// Turn scores into a probability distribution. Entries at `-inf` become exactly 0.
///
/// If any score is `+inf`, those entries share all of the mass equally.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::INFINITY {
        let count = logits.iter().filter(|&&x| x == max).count() as f32;
        return logits
            .iter()
            .map(|&x| match x == max {
                true => 1.0 / count,
                false => 0.0,
            })
            .collect();
    }
    let exps = logits.iter().map(|&x| (x - max).exp()).collect_vec();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|x| x / sum).collect()
}
