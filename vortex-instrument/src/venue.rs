use serde::{Deserialize, Serialize};

/// Unique identifier for an execution and/or market-data venue.
///
/// The `Simulated` venue is backed by the in-process simulated execution
/// model rather than an external exchange connection.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename = "venue", rename_all = "snake_case")]
pub enum Venue {
    Simulated,
    Binance,
    Okx,
    Bybit,
    Coinbase,
}

impl Venue {
    /// Return the &str representation of this [`Venue`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Simulated => "simulated",
            Venue::Binance => "binance",
            Venue::Okx => "okx",
            Venue::Bybit => "bybit",
            Venue::Coinbase => "coinbase",
        }
    }

    /// All venues the core can be configured with.
    pub const ALL: [Venue; 5] = [
        Venue::Simulated,
        Venue::Binance,
        Venue::Okx,
        Venue::Bybit,
        Venue::Coinbase,
    ];
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Venue {
    type Err = crate::symbol::SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simulated" | "sim" => Ok(Venue::Simulated),
            "binance" => Ok(Venue::Binance),
            "okx" => Ok(Venue::Okx),
            "bybit" => Ok(Venue::Bybit),
            "coinbase" => Ok(Venue::Coinbase),
            other => Err(crate::symbol::SymbolError::UnknownVenue(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_round_trips_serde_rename() {
        let json = serde_json::to_string(&Venue::Okx).unwrap();
        assert_eq!(json, "\"okx\"");
        assert_eq!(serde_json::from_str::<Venue>(&json).unwrap(), Venue::Okx);
    }
}
