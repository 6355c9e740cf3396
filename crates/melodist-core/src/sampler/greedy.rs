use super::Sampler;

/// Always picks the most probable token, the lowest id among ties.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn sample(&mut self, probs: &[f32]) -> Option<u32> {
        let mut best: Option<(usize, f32)> = None;
        for (id, &x) in probs.iter().enumerate() {
            if x > best.map_or(0.0, |(_, p)| p) {
                best = Some((id, x));
            }
        }
        best.map(|(id, _)| id as u32)
    }
}
