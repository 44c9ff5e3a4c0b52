//! Architecture template: per-slot capacity and current content.
//!
//! A template is an ordered list of layer slots. Each slot has a fixed
//! `capacity` (the widest it may ever become) and a `content` that is either
//! the current width or `None` for a dormant layer waiting to be
//! materialized. The final slot is the output layer and is always enabled.

use serde::{Deserialize, Serialize};

use crate::error::SproutError;

/// Layer capacities and contents for a growable network.
///
/// # Example
///
/// ```
/// use sprout_core::ModelTemplate;
///
/// // Two hidden slots (the second dormant) followed by a 2-wide output.
/// let template = ModelTemplate::with_output(vec![4, 2], vec![Some(2), None], 2).unwrap();
/// assert_eq!(template.contents(), &[Some(2), None, Some(2)]);
/// assert_eq!(template.enabled_layers(), vec![0, 2]);
/// assert_eq!(template.disabled_layers(), vec![1]);
/// assert_eq!(template.in_out_indices(1).unwrap(), (1, 2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTemplate")]
pub struct ModelTemplate {
    capacities: Vec<usize>,
    contents: Vec<Option<usize>>,
}

/// Unchecked wire form; deserialisation goes through [`ModelTemplate::new`].
#[derive(Deserialize)]
struct RawTemplate {
    capacities: Vec<usize>,
    contents: Vec<Option<usize>>,
}

impl TryFrom<RawTemplate> for ModelTemplate {
    type Error = SproutError;

    fn try_from(raw: RawTemplate) -> Result<Self, Self::Error> {
        Self::new(raw.capacities, raw.contents)
    }
}

impl ModelTemplate {
    /// Builds a template from full capacity and content vectors.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Config`] if the vectors differ in length, are
    /// empty, a capacity or content is zero, a content exceeds its
    /// capacity, the final slot is dormant, or the enabled contents are
    /// increasing somewhere along the sequence.
    pub fn new(capacities: Vec<usize>, contents: Vec<Option<usize>>) -> Result<Self, SproutError> {
        if capacities.is_empty() {
            return Err(SproutError::config("template has no layer slots"));
        }
        if capacities.len() != contents.len() {
            return Err(SproutError::config(format!(
                "template has {} capacities but {} contents",
                capacities.len(),
                contents.len()
            )));
        }
        for (i, (&cap, content)) in capacities.iter().zip(contents.iter()).enumerate() {
            if cap == 0 {
                return Err(SproutError::config(format!("layer {i} has zero capacity")));
            }
            match content {
                Some(0) => {
                    return Err(SproutError::config(format!(
                        "layer {i} is enabled with zero width"
                    )))
                }
                Some(c) if *c > cap => {
                    return Err(SproutError::config(format!(
                        "layer {i} content {c} exceeds capacity {cap}"
                    )))
                }
                _ => {}
            }
        }
        if contents.last().copied().flatten().is_none() {
            return Err(SproutError::config("the final (output) layer must be enabled"));
        }
        let enabled: Vec<usize> = contents.iter().filter_map(|c| *c).collect();
        if enabled.windows(2).any(|w| w[0] < w[1]) {
            return Err(SproutError::config(format!(
                "enabled contents must be non-increasing, got {enabled:?}"
            )));
        }
        Ok(Self {
            capacities,
            contents,
        })
    }

    /// Builds a template from hidden slots and appends an output slot of
    /// width `out_size`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ModelTemplate::new`].
    pub fn with_output(
        hidden_capacities: Vec<usize>,
        hidden_contents: Vec<Option<usize>>,
        out_size: usize,
    ) -> Result<Self, SproutError> {
        let mut capacities = hidden_capacities;
        let mut contents = hidden_contents;
        capacities.push(out_size);
        contents.push(Some(out_size));
        Self::new(capacities, contents)
    }

    /// Number of layer slots, output included.
    pub fn num_layers(&self) -> usize {
        self.capacities.len()
    }

    /// Per-slot capacities.
    pub fn capacities(&self) -> &[usize] {
        &self.capacities
    }

    /// Per-slot contents (`None` = dormant).
    pub fn contents(&self) -> &[Option<usize>] {
        &self.contents
    }

    /// Capacity of one slot.
    pub fn capacity(&self, index: usize) -> Option<usize> {
        self.capacities.get(index).copied()
    }

    /// Content of one slot; `None` for dormant or out-of-range slots.
    pub fn content(&self, index: usize) -> Option<usize> {
        self.contents.get(index).copied().flatten()
    }

    /// Width of the output layer.
    pub fn output_size(&self) -> usize {
        self.contents.last().copied().flatten().unwrap_or(0)
    }

    /// Indices of enabled slots, in order.
    pub fn enabled_layers(&self) -> Vec<usize> {
        self.contents
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.map(|_| i))
            .collect()
    }

    /// Indices of dormant slots, in order.
    pub fn disabled_layers(&self) -> Vec<usize> {
        self.contents
            .iter()
            .enumerate()
            .filter_map(|(i, c)| if c.is_none() { Some(i) } else { None })
            .collect()
    }

    /// Input and output boundary for a growth site.
    ///
    /// `in_index` is one past the nearest enabled slot strictly before
    /// `site` (0 if there is none): every slot in `in_index..=site` sees the
    /// same incoming activations. `out_index` is the nearest enabled slot
    /// strictly after `site`, the layer that would receive a new feature.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Invariant`] if `site` is out of range or no
    /// enabled slot follows it.
    ///
    /// # Example
    ///
    /// ```
    /// use sprout_core::ModelTemplate;
    ///
    /// let t = ModelTemplate::new(vec![8, 8, 8, 3], vec![Some(4), None, None, Some(3)]).unwrap();
    /// assert_eq!(t.in_out_indices(0).unwrap(), (0, 3));
    /// assert_eq!(t.in_out_indices(2).unwrap(), (1, 3));
    /// assert!(t.in_out_indices(3).is_err());
    /// ```
    pub fn in_out_indices(&self, site: usize) -> Result<(usize, usize), SproutError> {
        if site >= self.contents.len() {
            return Err(SproutError::invariant(format!(
                "growth site {site} is outside a template of {} layers",
                self.contents.len()
            )));
        }
        let in_index = self.contents[..site]
            .iter()
            .rposition(|c| c.is_some())
            .map_or(0, |i| i + 1);
        let out_index = self.contents[site + 1..]
            .iter()
            .position(|c| c.is_some())
            .map(|offset| site + 1 + offset)
            .ok_or_else(|| {
                SproutError::invariant(format!("no enabled layer follows growth site {site}"))
            })?;
        Ok((in_index, out_index))
    }

    /// True if `index` is an enabled, non-final slot with free capacity.
    pub fn is_width_growable(&self, index: usize) -> bool {
        index + 1 < self.contents.len()
            && matches!(self.contents[index], Some(c) if c < self.capacities[index])
    }

    /// True if `index` is a dormant slot.
    pub fn is_depth_growable(&self, index: usize) -> bool {
        index + 1 < self.contents.len() && self.contents[index].is_none()
    }

    /// Overwrites the content of one slot.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Invariant`] if the index is out of range, the
    /// new content exceeds capacity, or the output slot would be disabled.
    pub fn set_content(&mut self, index: usize, content: Option<usize>) -> Result<(), SproutError> {
        let cap = self.capacity(index).ok_or_else(|| {
            SproutError::invariant(format!("layer {index} is outside the template"))
        })?;
        if let Some(c) = content {
            if c == 0 || c > cap {
                return Err(SproutError::invariant(format!(
                    "layer {index} content {c} outside 1..={cap}"
                )));
            }
        } else if index + 1 == self.contents.len() {
            return Err(SproutError::invariant("the output layer cannot be disabled"));
        }
        self.contents[index] = content;
        Ok(())
    }

    /// Total active width over all enabled slots.
    pub fn total_features(&self) -> usize {
        self.contents.iter().filter_map(|c| *c).sum()
    }

    /// Compact rendering such as `[4, -, 2]` for logs and error dumps.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .contents
            .iter()
            .map(|c| c.map_or_else(|| "-".to_string(), |w| w.to_string()))
            .collect();
        format!("[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_templates() -> Vec<ModelTemplate> {
        // Every on/off pattern over four hidden slots with an enabled output.
        let mut out = Vec::new();
        for mask in 0u32..16 {
            let contents: Vec<Option<usize>> = (0..4)
                .map(|i| if mask & (1 << i) != 0 { Some(3) } else { None })
                .collect();
            out.push(ModelTemplate::with_output(vec![5; 4], contents, 2).unwrap());
        }
        out
    }

    #[test]
    fn in_out_indices_bracket_the_site() {
        for template in all_templates() {
            for site in 0..template.num_layers() - 1 {
                let (i, o) = template.in_out_indices(site).unwrap();
                assert!(i <= site, "{} site {site}: in {i}", template.summary());
                assert!(site < o, "{} site {site}: out {o}", template.summary());
                assert!(template.content(o).is_some());
                // Nothing between in_index and the site is enabled.
                assert!((i..site).all(|k| template.content(k).is_none()));
            }
        }
    }

    #[test]
    fn deserialising_checks_contents() {
        let t = ModelTemplate::with_output(vec![4, 4], vec![Some(3), None], 2).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(serde_json::from_str::<ModelTemplate>(&json).unwrap(), t);

        let increasing = r#"{"capacities":[8,8,2],"contents":[2,4,2]}"#;
        let err = serde_json::from_str::<ModelTemplate>(increasing).unwrap_err();
        assert!(err.to_string().contains("non-increasing"));
        let dormant_output = r#"{"capacities":[4,2],"contents":[3,null]}"#;
        assert!(serde_json::from_str::<ModelTemplate>(dormant_output).is_err());
    }

    #[test]
    fn final_layer_has_no_out_index() {
        let t = ModelTemplate::with_output(vec![3], vec![Some(3)], 2).unwrap();
        assert!(t.in_out_indices(1).is_err());
        assert!(t.in_out_indices(7).is_err());
    }

    #[test]
    fn rejects_increasing_contents() {
        let err = ModelTemplate::new(vec![8, 8, 2], vec![Some(2), Some(4), Some(2)]).unwrap_err();
        assert!(matches!(err, SproutError::Config { .. }));
    }

    #[test]
    fn rejects_dormant_output_and_overfull_slot() {
        assert!(ModelTemplate::new(vec![4, 2], vec![Some(2), None]).is_err());
        assert!(ModelTemplate::new(vec![4, 2], vec![Some(5), Some(2)]).is_err());
        assert!(ModelTemplate::new(vec![4], vec![]).is_err());
    }

    #[test]
    fn growability() {
        let t = ModelTemplate::with_output(vec![3, 4], vec![Some(3), None], 2).unwrap();
        assert!(!t.is_width_growable(0), "slot 0 is full");
        assert!(t.is_depth_growable(1));
        assert!(!t.is_width_growable(2), "output never grows");
        assert!(!t.is_depth_growable(2));
    }

    #[test]
    fn set_content_guards_bounds() {
        let mut t = ModelTemplate::with_output(vec![3], vec![Some(2)], 2).unwrap();
        t.set_content(0, Some(3)).unwrap();
        assert_eq!(t.total_features(), 5);
        assert!(t.set_content(0, Some(4)).is_err());
        assert!(t.set_content(1, None).is_err());
        assert_eq!(t.summary(), "[3, 2]");
    }

    #[test]
    fn serde_round_trip() {
        let t = ModelTemplate::with_output(vec![4, 2], vec![Some(2), None], 2).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: ModelTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}
