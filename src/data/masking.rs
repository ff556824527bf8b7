use rand::Rng;

/// Masked language modeling corruption, as in the BERT paper.
///
/// Each regular token is selected with probability `mlm_probability`. A selected token is
/// replaced by `<mask>` 80% of the time, by a random regular token 10% of the time, and left
/// unchanged otherwise. Only selected tokens contribute to the loss.
#[derive(Debug, Clone)]
pub struct MaskingConfig {
    pub mlm_probability: f64,
    pub mask_token: usize,
    /// Label of positions excluded from the loss
    pub ignore_label: usize,
    pub vocab_size: usize,
    /// Tokens never selected and never used as random replacements
    pub special_tokens: Vec<usize>,
}

const MASK_REPLACE_PROB: f64 = 0.8;
const RANDOM_REPLACE_PROB: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedSequence {
    pub inputs: Vec<usize>,
    pub labels: Vec<usize>,
}

impl MaskingConfig {
    fn is_special(&self, token: usize) -> bool {
        self.special_tokens.contains(&token)
    }

    fn random_token<R: Rng>(&self, rng: &mut R) -> usize {
        // Rejection sampling, special tokens are a handful of ids.
        loop {
            let token = rng.gen_range(0..self.vocab_size);
            if !self.is_special(token) {
                return token;
            }
        }
    }

    /// Corrupt one tokenized sequence.
    pub fn mask<R: Rng>(&self, tokens: &[usize], rng: &mut R) -> MaskedSequence {
        let can_replace = self.vocab_size > self.special_tokens.len();
        let mut inputs = Vec::with_capacity(tokens.len());
        let mut labels = Vec::with_capacity(tokens.len());

        for &token in tokens {
            if self.is_special(token) || !rng.gen_bool(self.mlm_probability) {
                inputs.push(token);
                labels.push(self.ignore_label);
                continue;
            }

            labels.push(token);
            let input = if rng.gen_bool(MASK_REPLACE_PROB) {
                self.mask_token
            } else if can_replace && rng.gen_bool(RANDOM_REPLACE_PROB) {
                self.random_token(rng)
            } else {
                token
            };
            inputs.push(input);
        }

        MaskedSequence { inputs, labels }
    }

    /// Mask the first regular token of the batch.
    ///
    /// Used when sampling selected nothing, which happens with short batches.
    pub fn force_mask(&self, sequences: &mut [MaskedSequence]) {
        for sequence in sequences.iter_mut() {
            let position = sequence
                .inputs
                .iter()
                .position(|token| !self.is_special(*token));

            if let Some(position) = position {
                sequence.labels[position] = sequence.inputs[position];
                sequence.inputs[position] = self.mask_token;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const PAD: usize = 1;
    const MASK: usize = 4;

    fn config(mlm_probability: f64) -> MaskingConfig {
        MaskingConfig {
            mlm_probability,
            mask_token: MASK,
            ignore_label: PAD,
            vocab_size: 100,
            special_tokens: vec![0, 1, 2, 3, 4],
        }
    }

    fn sequence(len: usize) -> Vec<usize> {
        let mut tokens = vec![0];
        tokens.extend((0..len).map(|i| 5 + i % 95));
        tokens.push(2);
        tokens
    }

    #[test]
    fn special_tokens_are_never_selected() {
        let mut rng = StdRng::seed_from_u64(0);
        let tokens = vec![0, 10, 11, 2, 1, 1];

        let masked = config(1.0).mask(&tokens, &mut rng);

        assert_eq!(masked.inputs[0], 0);
        assert_eq!(masked.inputs[3..], [2, 1, 1]);
        assert_eq!(masked.labels[0], PAD);
        assert_eq!(masked.labels[3..], [PAD, PAD, PAD]);
    }

    #[test]
    fn probability_one_labels_every_regular_token() {
        let mut rng = StdRng::seed_from_u64(1);
        let tokens = sequence(50);

        let masked = config(1.0).mask(&tokens, &mut rng);

        assert_eq!(masked.labels[1..51], tokens[1..51]);
    }

    #[test]
    fn probability_zero_leaves_sequence_untouched() {
        let mut rng = StdRng::seed_from_u64(2);
        let tokens = sequence(50);

        let masked = config(0.0).mask(&tokens, &mut rng);

        assert_eq!(masked.inputs, tokens);
        assert!(masked.labels.iter().all(|label| *label == PAD));
    }

    #[test]
    fn unselected_positions_keep_their_token() {
        let mut rng = StdRng::seed_from_u64(3);
        let tokens = sequence(500);

        let masked = config(0.15).mask(&tokens, &mut rng);

        for ((input, label), token) in masked.inputs.iter().zip(&masked.labels).zip(&tokens) {
            if *label == PAD {
                assert_eq!(input, token);
            } else {
                assert_eq!(label, token);
            }
        }
    }

    #[test]
    fn corruption_follows_eighty_ten_ten() {
        let mut rng = StdRng::seed_from_u64(4);
        let tokens = sequence(20_000);

        let masked = config(0.15).mask(&tokens, &mut rng);

        let selected = masked.labels.iter().filter(|l| **l != PAD).count() as f64;
        let masks = masked.inputs.iter().filter(|t| **t == MASK).count() as f64;
        let kept = masked
            .inputs
            .iter()
            .zip(&masked.labels)
            .filter(|(input, label)| **label != PAD && input == label)
            .count() as f64;

        assert!((selected / 20_000.0 - 0.15).abs() < 0.01);
        assert!((masks / selected - 0.8).abs() < 0.03);
        // Kept tokens include random replacements that drew the same id.
        assert!((kept / selected - 0.1).abs() < 0.03);
    }

    #[test]
    fn force_mask_picks_first_regular_token() {
        let mut sequences = vec![
            MaskedSequence {
                inputs: vec![0, 2],
                labels: vec![PAD, PAD],
            },
            MaskedSequence {
                inputs: vec![0, 17, 18, 2],
                labels: vec![PAD, PAD, PAD, PAD],
            },
        ];

        config(0.15).force_mask(&mut sequences);

        assert_eq!(sequences[0].inputs, vec![0, 2]);
        assert_eq!(sequences[1].inputs, vec![0, MASK, 18, 2]);
        assert_eq!(sequences[1].labels, vec![PAD, 17, PAD, PAD]);
    }

    #[test]
    fn random_replacements_are_regular_tokens() {
        let mut rng = StdRng::seed_from_u64(5);
        let tokens = sequence(5_000);

        let masked = config(1.0).mask(&tokens, &mut rng);

        assert!(masked
            .inputs
            .iter()
            .zip(&masked.labels)
            .filter(|(_, label)| **label != PAD)
            .all(|(input, _)| *input == MASK || *input >= 5));
    }
}
