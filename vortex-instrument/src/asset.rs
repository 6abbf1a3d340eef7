use derive_more::{Constructor, Display, From};
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, StrExt};

/// Canonical uppercase asset name.
///
/// eg/ "BTC", "USDT"
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    Display,
    From,
    Constructor,
)]
pub struct AssetName(SmolStr);

impl AssetName {
    /// Construct an [`AssetName`], uppercasing the input if required.
    pub fn from_name<S>(name: S) -> Self
    where
        S: AsRef<str>,
    {
        let name = name.as_ref();
        if name.chars().all(|char| char.is_ascii_uppercase() || char.is_ascii_digit()) {
            Self(SmolStr::new(name))
        } else {
            Self(name.to_uppercase_smolstr())
        }
    }

    pub fn name(&self) -> &SmolStr {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for AssetName {
    fn from(value: &str) -> Self {
        Self::from_name(value)
    }
}
