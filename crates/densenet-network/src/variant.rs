use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::model::DenseNetConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    DenseNet121,
    DenseNet169,
    DenseNet201,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Self::DenseNet121, Self::DenseNet169, Self::DenseNet201];

    pub fn name(self) -> &'static str {
        match self {
            Self::DenseNet121 => "densenet121",
            Self::DenseNet169 => "densenet169",
            Self::DenseNet201 => "densenet201",
        }
    }

    /// Building blocks in each of the three active stages.
    pub fn blocks(self) -> [usize; 3] {
        match self {
            Self::DenseNet121 => [4, 8, 10],
            Self::DenseNet169 => [6, 12, 32],
            Self::DenseNet201 => [6, 12, 48],
        }
    }

    /// Blocks of the disabled fourth stage, for use with [`DenseNetConfig::with_fourth_stage`].
    pub fn dormant_stage(self) -> usize {
        match self {
            Self::DenseNet121 => 12,
            Self::DenseNet169 | Self::DenseNet201 => 32,
        }
    }

    pub fn config(self) -> DenseNetConfig {
        DenseNetConfig::new(self.blocks())
    }
}

impl Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant `{0}`, expected one of densenet121, densenet169 or densenet201")]
pub struct ParseVariantError(String);

impl FromStr for Variant {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.name() == s)
            .ok_or_else(|| ParseVariantError(s.to_owned()))
    }
}

/// The modified DenseNet-121: stages of 4, 8 and 10 blocks.
pub fn densenet121() -> DenseNetConfig {
    Variant::DenseNet121.config()
}

pub fn densenet169() -> DenseNetConfig {
    Variant::DenseNet169.config()
}

pub fn densenet201() -> DenseNetConfig {
    Variant::DenseNet201.config()
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::model::{legacy_name, Weights};

    #[test_case(densenet121(), [4, 8, 10]; "121")]
    #[test_case(densenet169(), [6, 12, 32]; "169")]
    #[test_case(densenet201(), [6, 12, 48]; "201")]
    fn factories_fix_only_the_stages(config: DenseNetConfig, blocks: [usize; 3]) {
        assert_eq!(config.blocks, blocks);
        assert!(config.include_top);
        assert_eq!(config.weights, Weights::ImageNet);
        assert_eq!(config.classes, 1000);
        assert_eq!(config.fourth_stage, None);
        assert_eq!(config.variant, None);
    }

    #[test]
    fn names_round_trip() {
        for variant in Variant::ALL {
            assert_eq!(variant.name().parse::<Variant>(), Ok(variant));
        }

        assert_eq!(
            "densenet264".parse::<Variant>(),
            Err(ParseVariantError("densenet264".to_owned()))
        );
    }

    #[test]
    fn factories_keep_the_generic_name() {
        for variant in Variant::ALL {
            assert_eq!(legacy_name(&variant.config().stages()), "densenet");
        }
    }

    #[test]
    fn restored_fourth_stage_reaches_canonical_names() {
        let names = Variant::ALL.map(|variant| {
            let config = variant
                .config()
                .with_fourth_stage(Some(variant.dormant_stage()));

            legacy_name(&config.stages())
        });

        // The modified DenseNet-121 stages differ from the canonical ones.
        assert_eq!(names, ["densenet", "densenet169", "densenet201"]);
    }
}
