//! Symbol decomposition and the spot -> perpetual futures mapping.
//!
//! Grounded on the base/quote-asset suffix matching used throughout the
//! teacher's market-data scrapers, generalized to the fixed quote-asset set
//! and alias table from spec.md §3 and §6.

use std::collections::HashSet;

/// Quote assets recognized when decomposing a spot symbol into base+quote.
/// Order matters: longer/more-specific suffixes must be tried before
/// shorter ones that could also match (e.g. `BUSD` before `USD`-likes).
pub const QUOTE_ASSETS: &[&str] = &["USDT", "USDC", "BUSD", "FDUSD", "BTC", "ETH", "BNB"];

/// Stablecoin base-asset names (spec.md §6). `TRIBE`/`RSR` inclusion is
/// unusual for a "stablecoin" list but is inherited verbatim per the
/// spec's open question — see DESIGN.md.
pub const STABLECOINS: &[&str] = &[
    "USDT", "USDC", "BUSD", "DAI", "TUSD", "USDP", "USDD", "FRAX", "FDUSD", "PYUSD", "LUSD",
    "GUSD", "SUSD", "HUSD", "OUSD", "USDK", "USDN", "UST", "USTC", "CUSD", "DOLA", "USDX", "RSR",
    "TRIBE",
];

/// `"1000"`-prefixed futures aliases for micro-priced spot pairs (spec.md §6).
const THOUSAND_ALIASES: &[(&str, &str)] = &[
    ("PEPEUSDT", "1000PEPEUSDT"),
    ("SHIBUSDT", "1000SHIBUSDT"),
    ("LUNCUSDT", "1000LUNCUSDT"),
    ("XECUSDT", "1000XECUSDT"),
    ("FLOKIUSDT", "1000FLOKIUSDT"),
    ("RATSUSDT", "1000RATSUSDT"),
    ("BONKUSDT", "1000BONKUSDT"),
];

/// A decomposed trading pair: `{base}{quote}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolParts {
    pub base_asset: String,
    pub quote_asset: String,
}

/// Split `symbol` into base/quote by suffix-matching against `QUOTE_ASSETS`.
/// Returns `None` if no known quote asset suffixes the symbol (or the
/// remaining base would be empty).
pub fn decompose(symbol: &str) -> Option<SymbolParts> {
    for quote in QUOTE_ASSETS {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Some(SymbolParts {
                    base_asset: base.to_string(),
                    quote_asset: quote.to_string(),
                });
            }
        }
    }
    None
}

pub fn stablecoin_set() -> HashSet<&'static str> {
    STABLECOINS.iter().copied().collect()
}

pub fn is_stablecoin_base(base_asset: &str) -> bool {
    STABLECOINS.iter().any(|s| *s == base_asset)
}

/// Resolve the perpetual-futures symbol tracking a given spot `symbol`,
/// given the set of symbols the feed's perp-exchange-info batch call
/// reports as PERPETUAL and TRADING (spec.md §3, rule order 1-4).
///
/// `perpetual_universe` is the full set of live perpetual contract symbols,
/// resolved once per backtest run (spec.md §4.5).
pub fn resolve_futures_symbol(symbol: &str, perpetual_universe: &HashSet<String>) -> Option<String> {
    // Rule 1: identity — the spot symbol itself trades as a perpetual.
    if perpetual_universe.contains(symbol) {
        return Some(symbol.to_string());
    }

    // Rule 2: fixed "1000"-prefixed alias table.
    if let Some((_, alias)) = THOUSAND_ALIASES.iter().find(|(spot, _)| *spot == symbol) {
        if perpetual_universe.contains(*alias) {
            return Some(alias.to_string());
        }
    }

    // Rule 3: auto-attempt "1000" + base + "USDT" for any remaining ...USDT pair.
    if let Some(base) = symbol.strip_suffix("USDT") {
        let candidate = format!("1000{base}USDT");
        if perpetual_universe.contains(&candidate) {
            return Some(candidate);
        }
    }

    // Rule 4: no mapping.
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decompose_round_trip() {
        for symbol in ["BTCUSDT", "ETHBTC", "SOLUSDC", "PEPEUSDT"] {
            let parts = decompose(symbol).expect("should decompose");
            let rebuilt = format!("{}{}", parts.base_asset, parts.quote_asset);
            assert_eq!(rebuilt, symbol);
        }
    }

    #[test]
    fn decompose_unknown_quote_returns_none() {
        assert_eq!(decompose("XYZZZZ"), None);
    }

    #[test]
    fn futures_identity_mapping() {
        let mut universe = HashSet::new();
        universe.insert("ETHUSDT".to_string());
        assert_eq!(
            resolve_futures_symbol("ETHUSDT", &universe),
            Some("ETHUSDT".to_string())
        );
    }

    #[test]
    fn futures_alias_table_mapping() {
        let mut universe = HashSet::new();
        universe.insert("1000PEPEUSDT".to_string());
        assert_eq!(
            resolve_futures_symbol("PEPEUSDT", &universe),
            Some("1000PEPEUSDT".to_string())
        );
    }

    #[test]
    fn futures_auto_thousand_prefix() {
        let mut universe = HashSet::new();
        universe.insert("1000XYZUSDT".to_string());
        assert_eq!(
            resolve_futures_symbol("XYZUSDT", &universe),
            Some("1000XYZUSDT".to_string())
        );
    }

    #[test]
    fn futures_no_mapping_is_none() {
        let universe = HashSet::new();
        assert_eq!(resolve_futures_symbol("SOMECOINUSDT", &universe), None);
    }

    #[test]
    fn stablecoin_membership() {
        assert!(is_stablecoin_base("USDT"));
        assert!(is_stablecoin_base("TRIBE"));
        assert!(!is_stablecoin_base("BTC"));
    }
}
