//! Greedy CTC decoding of recognition model output
//!
//! Picks the arg-max class per timestep, drops blanks and collapses
//! consecutive repeats. Ties go to the lowest class index.

use tracing::debug;

use super::dictionary::Dictionary;
use super::types::Recognition;

/// Work out `(time, classes)` for a flat `[.., time, classes]` tensor.
///
/// The declared shape wins when it is consistent with the data; otherwise the
/// class count comes from the dictionary and time from the data length.
pub fn resolve_layout(data_len: usize, shape: &[i64], dictionary_len: usize) -> Option<(usize, usize)> {
    if data_len == 0 {
        return None;
    }

    let declared_ok = !shape.is_empty() && shape.iter().all(|&d| d > 0) && {
        let product: i64 = shape.iter().product();
        product as usize == data_len
    };

    if declared_ok {
        let classes = *shape.last()? as usize;
        return Some((data_len / classes, classes));
    }

    if dictionary_len == 0 || data_len % dictionary_len != 0 {
        debug!(
            "CTC: unusable shape {:?} for {} values and {} classes",
            shape, data_len, dictionary_len
        );
        return None;
    }
    Some((data_len / dictionary_len, dictionary_len))
}

/// Index of the largest value; the first index wins on exact ties
pub fn argmax(row: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &value) in row.iter().enumerate() {
        match best {
            Some((_, best_value)) if !(value > best_value) => {}
            _ if value.is_nan() => {}
            _ => best = Some((index, value)),
        }
    }
    best
}

/// Decode a flat probability tensor. Returns `None` on malformed input, never panics.
pub fn decode(data: &[f32], shape: &[i64], dictionary: &Dictionary) -> Option<Recognition> {
    let (time, classes) = resolve_layout(data.len(), shape, dictionary.len())?;

    let mut text = String::new();
    let mut score_sum = 0.0f32;
    let mut emitted = 0usize;
    let mut previous: Option<usize> = None;

    for step in data.chunks_exact(classes).take(time) {
        let Some((index, probability)) = argmax(step) else {
            previous = None;
            continue;
        };

        if index != 0 && previous != Some(index) {
            if let Some(symbol) = dictionary.symbol(index) {
                text.push_str(symbol);
                score_sum += probability;
                emitted += 1;
            }
        }
        previous = Some(index);
    }

    let confidence = if emitted == 0 {
        0.0
    } else {
        (score_sum / emitted as f32).clamp(0.0, 1.0)
    };

    Some(Recognition { text, confidence })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(indices: &[usize], classes: usize, p: f32) -> Vec<f32> {
        let mut data = vec![0.0; indices.len() * classes];
        for (t, &i) in indices.iter().enumerate() {
            for c in 0..classes {
                data[t * classes + c] = if c == i { p } else { (1.0 - p) / (classes - 1) as f32 };
            }
        }
        data
    }

    #[test]
    fn test_collapse_and_blank_removal() {
        let dict = Dictionary::from_symbols(["你", "好"]);
        let data = one_hot(&[0, 1, 1, 0, 2, 2, 0], 3, 0.9);
        let result = decode(&data, &[1, 7, 3], &dict).unwrap();
        assert_eq!(result.text, "你好");
        assert!((result.confidence - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_repeat_separated_by_blank_is_kept() {
        let dict = Dictionary::from_symbols(["l", "o"]);
        let data = one_hot(&[1, 1, 0, 1, 2], 3, 0.8);
        let result = decode(&data, &[1, 5, 3], &dict).unwrap();
        assert_eq!(result.text, "llo");
    }

    #[test]
    fn test_all_blank_gives_zero_confidence() {
        let dict = Dictionary::from_symbols(["a"]);
        let data = one_hot(&[0, 0, 0], 2, 0.99);
        let result = decode(&data, &[1, 3, 2], &dict).unwrap();
        assert_eq!(result.text, "");
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_tie_prefers_first_index() {
        assert_eq!(argmax(&[0.1, 0.45, 0.45]), Some((1, 0.45)));
        assert_eq!(argmax(&[f32::NAN, 0.2, 0.1]), Some((1, 0.2)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_unusable_shape_falls_back_to_dictionary() {
        let dict = Dictionary::from_symbols(["a", "b"]);
        let data = one_hot(&[1, 2], 3, 0.7);
        let result = decode(&data, &[-1, 0], &dict).unwrap();
        assert_eq!(result.text, "ab");
    }

    #[test]
    fn test_indivisible_data_returns_none() {
        let dict = Dictionary::from_symbols(["a", "b"]);
        let data = vec![0.5; 7];
        assert!(decode(&data, &[], &dict).is_none());
        assert!(decode(&[], &[1, 0, 3], &dict).is_none());
    }

    #[test]
    fn test_output_never_contains_blank_or_uncollapsed_repeats() {
        let dict = Dictionary::from_symbols(["x", "y", "z"]);
        // Pseudo-random argmax sequence
        let indices: Vec<usize> = (0..64).map(|i| (i * 7 + i / 3) % 4).collect();
        let data = one_hot(&indices, 4, 0.6);
        let result = decode(&data, &[1, 64, 4], &dict).unwrap();

        let mut expected = String::new();
        let mut previous = None;
        for &i in &indices {
            if i != 0 && previous != Some(i) {
                expected.push_str(dict.symbol(i).unwrap());
            }
            previous = Some(i);
        }
        assert_eq!(result.text, expected);
        assert!(!result.text.contains('\0'));
    }

    #[test]
    fn test_classes_wider_than_dictionary_skip_unknown() {
        let dict = Dictionary::from_symbols(["a"]);
        // Class 2 has no symbol
        let data = one_hot(&[1, 2, 1], 3, 0.9);
        let result = decode(&data, &[1, 3, 3], &dict).unwrap();
        assert_eq!(result.text, "aa");
    }
}
