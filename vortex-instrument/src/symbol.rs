use crate::asset::AssetName;
use derive_more::Display;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, StrExt};
use thiserror::Error;

/// Quote assets recognised when inferring an [`Instrument`] from a bare
/// symbol. Ordered longest-first so eg/ "USDT" wins over "USD".
const KNOWN_QUOTES: [&str; 6] = ["USDT", "USDC", "BUSD", "USD", "BTC", "ETH"];

/// Canonical uppercase instrument symbol used as a key across the core.
///
/// eg/ "BTCUSDT"
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct SymbolId(SmolStr);

impl SymbolId {
    /// Construct a [`SymbolId`], canonicalising to uppercase and validating
    /// the `[A-Z0-9]+` character set.
    pub fn new<S>(symbol: S) -> Result<Self, SymbolError>
    where
        S: AsRef<str>,
    {
        let symbol = symbol.as_ref();
        if symbol.is_empty() {
            return Err(SymbolError::Empty);
        }

        let canonical = symbol.to_uppercase_smolstr();
        if !canonical
            .chars()
            .all(|char| char.is_ascii_uppercase() || char.is_ascii_digit())
        {
            return Err(SymbolError::InvalidCharacters(symbol.to_string()));
        }

        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Tradable instrument: a symbol together with its base and quote assets.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Instrument {
    pub symbol: SymbolId,
    pub base: AssetName,
    pub quote: AssetName,
}

impl Instrument {
    pub fn new(symbol: SymbolId, base: AssetName, quote: AssetName) -> Self {
        Self {
            symbol,
            base,
            quote,
        }
    }

    /// Infer an [`Instrument`] from a bare symbol by splitting on a known
    /// quote asset suffix.
    ///
    /// eg/ "BTCUSDT" → base "BTC", quote "USDT"
    pub fn infer(symbol: &SymbolId) -> Result<Self, SymbolError> {
        let name = symbol.as_str();

        KNOWN_QUOTES
            .iter()
            .find_map(|quote| {
                let base = name.strip_suffix(quote)?;
                (!base.is_empty()).then(|| {
                    Self::new(
                        symbol.clone(),
                        AssetName::from_name(base),
                        AssetName::from_name(quote),
                    )
                })
            })
            .ok_or_else(|| SymbolError::UnknownQuote(name.to_string()))
    }
}

/// Registry mapping [`SymbolId`]s to their [`Instrument`] definitions.
///
/// Instruments can be registered explicitly (venue-provided definitions), or
/// created lazily on first use via suffix inference.
#[derive(Debug, Clone, Default)]
pub struct InstrumentMap {
    instruments: FnvHashMap<SymbolId, Instrument>,
}

impl InstrumentMap {
    pub fn new<Iter>(instruments: Iter) -> Self
    where
        Iter: IntoIterator<Item = Instrument>,
    {
        Self {
            instruments: instruments
                .into_iter()
                .map(|instrument| (instrument.symbol.clone(), instrument))
                .collect(),
        }
    }

    pub fn insert(&mut self, instrument: Instrument) {
        self.instruments
            .insert(instrument.symbol.clone(), instrument);
    }

    pub fn get(&self, symbol: &SymbolId) -> Option<&Instrument> {
        self.instruments.get(symbol)
    }

    /// Find the [`Instrument`] for `symbol`, lazily inferring and caching it
    /// if not yet registered.
    pub fn resolve(&mut self, symbol: &SymbolId) -> Result<&Instrument, SymbolError> {
        if !self.instruments.contains_key(symbol) {
            let inferred = Instrument::infer(symbol)?;
            self.instruments.insert(symbol.clone(), inferred);
        }

        Ok(self
            .instruments
            .get(symbol)
            .expect("instrument inserted above"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> + '_ {
        self.instruments.values()
    }
}

/// Errors produced when parsing symbols, venues and sides.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize, Error)]
pub enum SymbolError {
    #[error("symbol is empty")]
    Empty,

    #[error("symbol contains invalid characters: {0}")]
    InvalidCharacters(String),

    #[error("symbol has no recognised quote asset suffix: {0}")]
    UnknownQuote(String),

    #[error("unknown venue: {0}")]
    UnknownVenue(String),

    #[error("invalid side: {0}")]
    InvalidSide(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_id_canonicalises_and_validates() {
        assert_eq!(
            SymbolId::new("btcusdt").unwrap(),
            SymbolId::new("BTCUSDT").unwrap()
        );
        assert_eq!(SymbolId::new("1000PEPEUSDT").unwrap().as_str(), "1000PEPEUSDT");
        assert_eq!(SymbolId::new(""), Err(SymbolError::Empty));
        assert!(matches!(
            SymbolId::new("BTC-USDT"),
            Err(SymbolError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn test_instrument_infer_prefers_longest_quote() {
        struct TestCase {
            input: &'static str,
            expected: Result<(&'static str, &'static str), SymbolError>,
        }

        let cases = vec![
            TestCase {
                input: "BTCUSDT",
                expected: Ok(("BTC", "USDT")),
            },
            TestCase {
                input: "ETHBTC",
                expected: Ok(("ETH", "BTC")),
            },
            TestCase {
                input: "SOLUSD",
                expected: Ok(("SOL", "USD")),
            },
            TestCase {
                input: "USDT",
                expected: Err(SymbolError::UnknownQuote("USDT".to_string())),
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let symbol = SymbolId::new(test.input).unwrap();
            let actual = Instrument::infer(&symbol)
                .map(|instrument| (instrument.base, instrument.quote));
            let expected = test.expected.map(|(base, quote)| {
                (AssetName::from_name(base), AssetName::from_name(quote))
            });
            assert_eq!(actual, expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_instrument_map_resolves_lazily() {
        let mut map = InstrumentMap::default();
        let symbol = SymbolId::new("ETHUSDT").unwrap();

        assert!(map.get(&symbol).is_none());
        let instrument = map.resolve(&symbol).unwrap();
        assert_eq!(instrument.base, AssetName::from_name("ETH"));
        assert!(map.get(&symbol).is_some());
    }
}
