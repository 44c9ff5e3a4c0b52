//! Candidate synthesis and embedding.
//!
//! Embedding is functional: [`embed_feature`] and [`embed_layer`] take the
//! current template and network by reference and return the grown pair,
//! so a caller can keep the old state for rollback. Both preserve the
//! network function exactly and finish with [`verify_state`].

use sprout_core::{Key, ModelTemplate, SproutError};
use sprout_net::linalg::make_invertible;
use sprout_net::{Basis, Feature, LayerParams, Network};

/// Random candidate reading `input_size` activations, of which only the
/// non-null ones get nonzero weights.
///
/// # Errors
///
/// Returns [`SproutError::Shape`] if `input_size` is smaller than the
/// number of active inputs.
pub fn new_feature(
    null: &[bool],
    input_size: usize,
    output_size: usize,
    key: Key,
) -> Result<Feature, SproutError> {
    let active = null.iter().filter(|&&n| !n).count();
    if input_size < active {
        return Err(SproutError::shape(format!(
            "{active} active inputs do not fit in {input_size}"
        )));
    }
    let feature = Feature::init(&mut key.rng(), active, output_size);
    Ok(feature.pad_inputs(input_size - active))
}

/// Checks that template contents, null masks and parameter shapes agree.
///
/// # Errors
///
/// Returns [`SproutError::Invariant`] describing the first mismatch.
pub fn verify_state(template: &ModelTemplate, net: &Network) -> Result<(), SproutError> {
    if template.num_layers() != net.num_layers() {
        return Err(SproutError::invariant(format!(
            "template has {} slots, network {}",
            template.num_layers(),
            net.num_layers()
        )));
    }
    net.check_shapes()
        .map_err(|e| SproutError::invariant(e.to_string()))?;
    for i in 0..template.num_layers() {
        match (template.content(i), net.layer(i), net.null(i)) {
            (None, None, None) => {}
            (Some(content), Some(layer), Some(null)) => {
                let active = null.iter().filter(|&&n| !n).count();
                if active != content {
                    return Err(SproutError::invariant(format!(
                        "content-null mismatch at slot {i}: content {content}, {active} active"
                    )));
                }
                if null.len() != template.capacity(i).unwrap_or(0) {
                    return Err(SproutError::invariant(format!(
                        "slot {i} mask has {} entries for capacity {:?}",
                        null.len(),
                        template.capacity(i)
                    )));
                }
                if null[..content].iter().any(|&n| n) {
                    return Err(SproutError::invariant(format!(
                        "slot {i} active positions are not a prefix"
                    )));
                }
                if layer.width() != content {
                    return Err(SproutError::invariant(format!(
                        "slot {i} stores {} units for content {content}",
                        layer.width()
                    )));
                }
            }
            _ => {
                return Err(SproutError::invariant(format!(
                    "slot {i} enabled in template and network disagree"
                )))
            }
        }
    }
    Ok(())
}

/// Adds one unit to the enabled slot `site`.
///
/// The unit takes the first null position; the receiving slot gets a zero
/// row for it, so outputs are unchanged until training moves that row.
///
/// # Errors
///
/// Returns [`SproutError::Invariant`] if `site` is dormant or full, and
/// [`SproutError::Shape`] if the feature is not one unit over the slot's
/// inputs.
pub fn embed_feature(
    template: &ModelTemplate,
    net: &Network,
    feature: &Feature,
    site: usize,
) -> Result<(ModelTemplate, Network), SproutError> {
    let content = template
        .content(site)
        .ok_or_else(|| SproutError::invariant(format!("cannot add width to dormant slot {site}")))?;
    let null = net
        .null(site)
        .ok_or_else(|| SproutError::invariant(format!("slot {site} has no null mask")))?;
    let position = null
        .iter()
        .position(|&n| n)
        .ok_or_else(|| SproutError::invariant(format!("slot {site} has no free position")))?;
    let (_, out_index) = template.in_out_indices(site)?;
    let layer = net
        .layer(site)
        .ok_or_else(|| SproutError::invariant(format!("slot {site} has no parameters")))?;
    if feature.outputs() != 1 || feature.inputs() != layer.input_width() {
        return Err(SproutError::shape(format!(
            "slot {site} takes {}x1 features, got {:?}",
            layer.input_width(),
            feature.kernel.shape()
        )));
    }
    let basis = layer
        .basis
        .clone()
        .ok_or_else(|| SproutError::invariant(format!("slot {site} has no basis")))?;

    let mut kernel = layer.kernel.clone().insert_column(position, 0.0);
    kernel.set_column(position, &feature.kernel.column(0));
    let grown = LayerParams {
        kernel,
        bias: layer.bias.clone().insert_column(position, feature.bias[(0, 0)]),
        basis: Some(basis.insert_unit(
            position,
            feature.basis.constant[(0, 0)],
            feature.basis.linear[(0, 0)],
            feature.basis.silu[(0, 0)],
        )),
    };

    let receiving = net
        .layer(out_index)
        .ok_or_else(|| SproutError::invariant(format!("receiving slot {out_index} is dormant")))?;
    let widened = LayerParams {
        kernel: receiving.kernel.clone().insert_row(position, 0.0),
        ..receiving.clone()
    };

    let mut mask = null.to_vec();
    mask[position] = false;

    let mut new_net = net.clone();
    new_net.set_layer(site, Some(grown))?;
    new_net.set_layer(out_index, Some(widened))?;
    new_net.set_null(site, Some(mask))?;
    let mut new_template = template.clone();
    new_template.set_content(site, Some(content + 1))?;

    verify_state(&new_template, &new_net)?;
    Ok((new_template, new_net))
}

/// Activates the dormant slot `site` with the square kernel of `feature`.
///
/// The kernel is made invertible and installed with an identity basis; the
/// receiving slot is compensated (`K ← W⁻¹K`, `b ← b − b_new W⁻¹K`) so the
/// network function is unchanged. The new content is the slot's input width.
///
/// The identity basis makes the new layer linear at first, even though the
/// candidate was scored through SiLU; training moves the basis weights after.
///
/// # Errors
///
/// Returns [`SproutError::Invariant`] if `site` is enabled or too small,
/// and [`SproutError::Shape`] if the feature is not `k × k` for the slot's
/// input width `k`.
pub fn embed_layer(
    template: &ModelTemplate,
    net: &Network,
    feature: &Feature,
    site: usize,
) -> Result<(ModelTemplate, Network), SproutError> {
    if template.content(site).is_some() {
        return Err(SproutError::invariant(format!(
            "cannot insert a layer at enabled slot {site}"
        )));
    }
    let (_, out_index) = template.in_out_indices(site)?;
    let width = net.input_width(site);
    if feature.kernel.shape() != (width, width) {
        return Err(SproutError::shape(format!(
            "slot {site} needs a {width}x{width} kernel, got {:?}",
            feature.kernel.shape()
        )));
    }
    let capacity = template.capacity(site).unwrap_or(0);
    if width > capacity {
        return Err(SproutError::invariant(format!(
            "slot {site} capacity {capacity} cannot hold {width} units"
        )));
    }

    let (w, w_inv) = make_invertible(&feature.kernel)?;
    let receiving = net
        .layer(out_index)
        .ok_or_else(|| SproutError::invariant(format!("receiving slot {out_index} is dormant")))?;
    let kernel = &w_inv * &receiving.kernel;
    let bias = &receiving.bias - &feature.bias * &kernel;
    let compensated = LayerParams {
        kernel,
        bias,
        basis: receiving.basis.clone(),
    };
    let inserted = LayerParams {
        kernel: w,
        bias: feature.bias.clone(),
        basis: Some(Basis::identity(width)),
    };

    let mut new_net = net.clone();
    new_net.set_layer(site, Some(inserted))?;
    new_net.set_layer(out_index, Some(compensated))?;
    new_net.set_null(site, Some((0..capacity).map(|i| i >= width).collect()))?;
    let mut new_template = template.clone();
    new_template.set_content(site, Some(width))?;

    verify_state(&new_template, &new_net)?;
    Ok((new_template, new_net))
}
