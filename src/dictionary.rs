//! Dense integer codes for the distinct amplitudes of a corpus.

use serde::{Deserialize, Serialize};

/// Sorted set of every amplitude observed in a corpus.
///
/// The code of an amplitude is its rank in ascending order, so two corpora
/// with the same values produce the same dictionary regardless of row order.
///
/// Deserialization rejects lists that `build` could not have produced, since
/// lookups binary-search the stored values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct AmplitudeDictionary {
    amplitudes: Vec<f64>,
}

impl AmplitudeDictionary {
    /// Collect the distinct values of `amplitudes`. Non-finite values are ignored.
    pub fn build(amplitudes: impl IntoIterator<Item = f64>) -> Self {
        let mut values: Vec<f64> = amplitudes
            .into_iter()
            .filter(|v| v.is_finite())
            .map(positive_zero)
            .collect();
        values.sort_by(f64::total_cmp);
        values.dedup();
        Self { amplitudes: values }
    }

    pub fn len(&self) -> usize {
        self.amplitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amplitudes.is_empty()
    }

    /// Code assigned to `amplitude`, if it was observed.
    pub fn code_of(&self, amplitude: f64) -> Option<usize> {
        let amplitude = positive_zero(amplitude);
        self.amplitudes
            .binary_search_by(|probe| probe.total_cmp(&amplitude))
            .ok()
    }

    /// Amplitude carrying `code`.
    pub fn amplitude_of(&self, code: usize) -> Option<f64> {
        self.amplitudes.get(code).copied()
    }

    /// Closest observed amplitude to `value`. Ties go to the smaller one.
    pub fn nearest(&self, value: f64) -> Option<f64> {
        let idx = self.amplitudes.partition_point(|&a| a < value);
        let above = self.amplitudes.get(idx).copied();
        let below = idx
            .checked_sub(1)
            .and_then(|i| self.amplitudes.get(i))
            .copied();
        match (below, above) {
            (Some(b), Some(a)) => Some(if value - b <= a - value { b } else { a }),
            (b, a) => b.or(a),
        }
    }

    pub fn amplitudes(&self) -> &[f64] {
        &self.amplitudes
    }
}

impl TryFrom<Vec<f64>> for AmplitudeDictionary {
    type Error = String;

    fn try_from(amplitudes: Vec<f64>) -> Result<Self, Self::Error> {
        if let Some(bad) = amplitudes.iter().find(|v| !v.is_finite()) {
            return Err(format!("amplitude {bad} is not finite"));
        }
        if amplitudes.iter().any(|v| v.is_sign_negative() && *v == 0.0) {
            return Err("amplitudes must not contain -0".to_string());
        }
        if let Some(pair) = amplitudes.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(format!(
                "amplitudes must be strictly ascending, found {} before {}",
                pair[0], pair[1]
            ));
        }
        Ok(Self { amplitudes })
    }
}

impl From<AmplitudeDictionary> for Vec<f64> {
    fn from(dictionary: AmplitudeDictionary) -> Self {
        dictionary.amplitudes
    }
}

fn positive_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}
