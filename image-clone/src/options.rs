// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image creation options and their resolution against a clone's parent

use crate::error::Error;
use crate::features::Features;
use crate::types::{ImageHeader, PoolId};
use serde::{Deserialize, Serialize};

/// Smallest supported object order (4 KiB objects)
pub const MIN_ORDER: u8 = 12;
/// Largest supported object order (32 MiB objects)
pub const MAX_ORDER: u8 = 25;
/// Image format used when the caller does not ask for one
pub const DEFAULT_FORMAT: u8 = 2;

/// Options a caller may pass when creating or cloning an image
///
/// Every field is optional.  Unset fields take their value from
/// configured defaults (see [`ImageOptions::or_defaults`]) and then, for
/// clones, from the parent image.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageOptions {
    /// On-store format version; clones require format 2
    pub format: Option<u8>,
    /// Raw requested feature bitmask
    ///
    /// Kept raw so that bits this implementation does not know about can be
    /// reported rather than silently dropped.
    pub features: Option<u64>,
    /// log2 of the object size
    pub order: Option<u8>,
    pub stripe_unit: Option<u64>,
    pub stripe_count: Option<u64>,
    /// Pool holding the image's data objects, if not the image's own pool
    pub data_pool: Option<PoolId>,
}

impl ImageOptions {
    /// Returns a copy of these options with unset fields filled in from
    /// `defaults`
    pub fn or_defaults(&self, defaults: &ImageOptions) -> ImageOptions {
        ImageOptions {
            format: self.format.or(defaults.format),
            features: self.features.or(defaults.features),
            order: self.order.or(defaults.order),
            stripe_unit: self.stripe_unit.or(defaults.stripe_unit),
            stripe_count: self.stripe_count.or(defaults.stripe_count),
            data_pool: self.data_pool.or(defaults.data_pool),
        }
    }

    /// Checks that do not depend on the parent image
    pub fn preflight(&self) -> Result<(), Error> {
        let format = self.format.unwrap_or(DEFAULT_FORMAT);
        if format < 2 {
            return Err(Error::invalid_value(
                "format",
                "format 2 or later required for clone",
            ));
        }
        if let Some(bits) = self.features {
            Features::from_raw(bits)?;
        }
        Ok(())
    }
}

/// Fully-resolved options handed to the create sub-saga
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOptions {
    pub order: u8,
    pub features: Features,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub data_pool: Option<PoolId>,
}

impl ResolvedOptions {
    pub fn object_size(&self) -> u64 {
        1u64 << self.order
    }
}

/// Resolve the options for a clone of `parent` created in `child_pool`
///
/// Unset options are inherited from the parent.  An explicit feature request
/// may only add features in [`Features::CLONE_ADDABLE`] on top of the
/// parent's features, and must keep layering enabled.
pub fn resolve_clone_options(
    opts: &ImageOptions,
    parent: &ImageHeader,
    child_pool: PoolId,
) -> Result<ResolvedOptions, Error> {
    opts.preflight()?;

    let data_pool = opts.data_pool.filter(|pool| *pool != child_pool);

    let features = match opts.features {
        Some(bits) => {
            let requested = Features::from_raw(bits)?;
            if !requested.contains(Features::LAYERING) {
                return Err(Error::unsupported(
                    "cloning image must support layering",
                ));
            }

            let mut addable = Features::CLONE_ADDABLE;
            if data_pool.is_none() {
                addable.remove(Features::DATA_POOL);
            }
            let extra = requested - parent.features - addable;
            if !extra.is_empty() {
                return Err(Error::invalid_value(
                    "features",
                    format!(
                        "requested features {:?} are not supported by the \
                         parent image",
                        extra
                    ),
                ));
            }
            requested
        }
        None => {
            // The parent's data pool belongs to the parent.
            let mut inherited = parent.features - Features::DATA_POOL;
            if !inherited.contains(Features::LAYERING) {
                return Err(Error::unsupported(
                    "cloning image must support layering",
                ));
            }
            if data_pool.is_some() {
                inherited.insert(Features::DATA_POOL);
            }
            inherited
        }
    };
    if features.contains(Features::DATA_POOL) && data_pool.is_none() {
        return Err(Error::invalid_value(
            "data_pool",
            "data-pool feature requested without a separate data pool",
        ));
    }
    features.check_dependencies()?;

    let order = opts.order.unwrap_or(parent.order);
    if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
        return Err(Error::invalid_value(
            "order",
            format!("order must be in the range [{MIN_ORDER}, {MAX_ORDER}]"),
        ));
    }
    let object_size = 1u64 << order;

    let (stripe_unit, stripe_count) = match (opts.stripe_unit, opts.stripe_count)
    {
        (Some(unit), Some(count)) => (unit, count),
        (None, None) => {
            if parent.features.contains(Features::STRIPINGV2) {
                (parent.stripe_unit, parent.stripe_count)
            } else {
                (object_size, 1)
            }
        }
        _ => {
            return Err(Error::invalid_value(
                "stripe_unit",
                "stripe unit and stripe count must be specified together",
            ));
        }
    };
    if stripe_unit == 0 || stripe_count == 0 {
        return Err(Error::invalid_value(
            "stripe_unit",
            "stripe unit and stripe count must be non-zero",
        ));
    }
    if stripe_unit > object_size || object_size % stripe_unit != 0 {
        return Err(Error::invalid_value(
            "stripe_unit",
            format!(
                "stripe unit {stripe_unit} is incompatible with object size \
                 {object_size} (order {order})"
            ),
        ));
    }
    let default_striping = stripe_unit == object_size && stripe_count == 1;
    if !default_striping && !features.contains(Features::STRIPINGV2) {
        return Err(Error::invalid_value(
            "features",
            "non-default striping requires the striping-v2 feature",
        ));
    }

    Ok(ResolvedOptions {
        order,
        features,
        stripe_unit,
        stripe_count,
        data_pool,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::ImageId;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    const CHILD_POOL: PoolId = PoolId(2);

    fn parent_header(features: Features) -> ImageHeader {
        ImageHeader {
            id: ImageId::new("parent"),
            size: 1 << 30,
            order: 22,
            features,
            stripe_unit: 1 << 22,
            stripe_count: 1,
            data_pool: None,
            object_prefix: ImageId::new("parent").object_prefix(),
            parent: None,
            snapshots: BTreeMap::new(),
        }
    }

    #[test]
    fn test_defaults_inherit_parent() {
        let parent = parent_header(Features::LAYERING | Features::DEEP_FLATTEN);
        let resolved =
            resolve_clone_options(&ImageOptions::default(), &parent, CHILD_POOL)
                .unwrap();
        assert_eq!(resolved.features, parent.features);
        assert_eq!(resolved.order, 22);
        assert_eq!(resolved.stripe_unit, 1 << 22);
        assert_eq!(resolved.stripe_count, 1);
        assert_eq!(resolved.data_pool, None);
    }

    #[test]
    fn test_explicit_features_must_keep_layering() {
        let parent = parent_header(Features::LAYERING);
        let opts = ImageOptions {
            features: Some(Features::EXCLUSIVE_LOCK.bits()),
            ..Default::default()
        };
        assert_matches!(
            resolve_clone_options(&opts, &parent, CHILD_POOL),
            Err(Error::Unsupported { .. })
        );
    }

    #[test]
    fn test_explicit_features_limited_to_parent_and_addable() {
        let parent = parent_header(Features::LAYERING);

        let opts = ImageOptions {
            features: Some(
                (Features::LAYERING
                    | Features::EXCLUSIVE_LOCK
                    | Features::OBJECT_MAP)
                    .bits(),
            ),
            ..Default::default()
        };
        let resolved = resolve_clone_options(&opts, &parent, CHILD_POOL).unwrap();
        assert!(resolved.features.contains(Features::OBJECT_MAP));

        let opts = ImageOptions {
            features: Some((Features::LAYERING | Features::DEEP_FLATTEN).bits()),
            ..Default::default()
        };
        assert_matches!(
            resolve_clone_options(&opts, &parent, CHILD_POOL),
            Err(Error::InvalidValue { label, .. }) if label == "features"
        );
    }

    #[test]
    fn test_data_pool_override() {
        let parent = parent_header(Features::LAYERING | Features::DATA_POOL);

        let resolved = resolve_clone_options(
            &ImageOptions::default(),
            &parent,
            CHILD_POOL,
        )
        .unwrap();
        assert!(!resolved.features.contains(Features::DATA_POOL));

        let opts =
            ImageOptions { data_pool: Some(PoolId(9)), ..Default::default() };
        let resolved = resolve_clone_options(&opts, &parent, CHILD_POOL).unwrap();
        assert!(resolved.features.contains(Features::DATA_POOL));
        assert_eq!(resolved.data_pool, Some(PoolId(9)));

        // Naming the child's own pool is the same as not overriding.
        let opts =
            ImageOptions { data_pool: Some(CHILD_POOL), ..Default::default() };
        let resolved = resolve_clone_options(&opts, &parent, CHILD_POOL).unwrap();
        assert_eq!(resolved.data_pool, None);
    }

    #[test]
    fn test_striping_validation() {
        let parent = parent_header(Features::LAYERING | Features::STRIPINGV2);

        let opts = ImageOptions {
            stripe_unit: Some(1 << 16),
            ..Default::default()
        };
        assert_matches!(
            resolve_clone_options(&opts, &parent, CHILD_POOL),
            Err(Error::InvalidValue { .. })
        );

        let opts = ImageOptions {
            order: Some(20),
            stripe_unit: Some(1 << 21),
            stripe_count: Some(4),
            ..Default::default()
        };
        assert_matches!(
            resolve_clone_options(&opts, &parent, CHILD_POOL),
            Err(Error::InvalidValue { label, .. }) if label == "stripe_unit"
        );

        let opts = ImageOptions {
            stripe_unit: Some(1 << 16),
            stripe_count: Some(8),
            ..Default::default()
        };
        let resolved = resolve_clone_options(&opts, &parent, CHILD_POOL).unwrap();
        assert_eq!((resolved.stripe_unit, resolved.stripe_count), (1 << 16, 8));

        // Fancy striping without striping-v2 on the parent cannot be
        // requested.
        let parent = parent_header(Features::LAYERING);
        assert_matches!(
            resolve_clone_options(&opts, &parent, CHILD_POOL),
            Err(Error::InvalidValue { label, .. }) if label == "features"
        );
    }

    #[test]
    fn test_order_and_format_bounds() {
        let parent = parent_header(Features::LAYERING);
        let opts = ImageOptions { order: Some(30), ..Default::default() };
        assert_matches!(
            resolve_clone_options(&opts, &parent, CHILD_POOL),
            Err(Error::InvalidValue { label, .. }) if label == "order"
        );
        let opts = ImageOptions { format: Some(1), ..Default::default() };
        assert_matches!(
            opts.preflight(),
            Err(Error::InvalidValue { label, .. }) if label == "format"
        );
    }

    #[test]
    fn test_or_defaults() {
        let defaults = ImageOptions {
            order: Some(20),
            features: Some(Features::LAYERING.bits()),
            ..Default::default()
        };
        let opts = ImageOptions { order: Some(23), ..Default::default() };
        let merged = opts.or_defaults(&defaults);
        assert_eq!(merged.order, Some(23));
        assert_eq!(merged.features, Some(Features::LAYERING.bits()));
        assert_eq!(merged.stripe_unit, None);
    }
}
