// ===============================
// src/listing.rs
// ===============================
//
// Listing detection shared by the push feed and the polling fallback:
// - ListingFilters : which pairs we care about (quote asset, stablecoins, blocklist)
// - diff_symbols   : pure known-set vs snapshot diff
// - KnownSymbols   : owner of the known set, turns tickers into events
//
use ahash::AHashSet as HashSet;
use chrono::Utc;

use crate::binance::Ticker24h;
use crate::domain::{DelistingNotice, ListingEvent};

#[derive(Debug, Clone)]
pub struct ListingFilters {
    pub quote_asset: String,
    pub exclude_stablecoins: bool,
    pub stablecoins: HashSet<String>,
    pub excluded_tokens: HashSet<String>,
    pub min_volume_24h: f64,
}

impl ListingFilters {
    pub fn new(quote_asset: &str) -> Self {
        Self {
            quote_asset: quote_asset.to_ascii_uppercase(),
            exclude_stablecoins: true,
            stablecoins: default_stablecoins(),
            excluded_tokens: HashSet::new(),
            min_volume_24h: 0.0,
        }
    }

    /// Base asset of a pair quoted in our quote asset.
    pub fn base_asset<'a>(&self, symbol: &'a str) -> Option<&'a str> {
        symbol
            .strip_suffix(self.quote_asset.as_str())
            .filter(|b| !b.is_empty())
    }

    /// Quote asset, stablecoin exclusion and explicit blocklist.
    pub fn admits(&self, symbol: &str) -> bool {
        let Some(base) = self.base_asset(symbol) else {
            return false;
        };
        if self.exclude_stablecoins && self.stablecoins.contains(base) {
            return false;
        }
        !(self.excluded_tokens.contains(base) || self.excluded_tokens.contains(symbol))
    }

    pub fn meets_volume(&self, quote_volume: f64) -> bool {
        quote_volume >= self.min_volume_24h
    }
}

pub fn default_stablecoins() -> HashSet<String> {
    ["USDT", "USDC", "BUSD", "TUSD", "FDUSD", "DAI", "USDP", "PAX", "UST", "USDD", "EUR", "AEUR", "EURI", "PYUSD", "USDE"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SymbolDiff {
    pub fn is_empty(&self) -> bool { self.added.is_empty() && self.removed.is_empty() }
}

/// Compare a snapshot with the known set.
///
/// `complete` marks a full snapshot: only then are known symbols missing from it
/// reported as removed. Partial stream updates only ever add. Duplicates inside one
/// snapshot are reported once.
pub fn diff_symbols<'a, I>(known: &HashSet<String>, snapshot: I, complete: bool) -> SymbolDiff
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: HashSet<&str> = HashSet::new();
    let mut added = Vec::new();
    for s in snapshot {
        if seen.insert(s) && !known.contains(s) {
            added.push(s.to_string());
        }
    }
    let mut removed = Vec::new();
    if complete {
        removed = known.iter().filter(|k| !seen.contains(k.as_str())).cloned().collect();
        removed.sort();
    }
    SymbolDiff { added, removed }
}

#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub listings: Vec<ListingEvent>,
    pub delistings: Vec<DelistingNotice>,
}

/// Owner of the known-symbol set. Only the monitor task holds one.
#[derive(Debug, Clone)]
pub struct KnownSymbols {
    filters: ListingFilters,
    set: HashSet<String>,
    seeded: bool,
}

impl KnownSymbols {
    pub fn new(filters: ListingFilters) -> Self {
        Self { filters, set: HashSet::new(), seeded: false }
    }

    pub fn len(&self) -> usize { self.set.len() }
    pub fn is_empty(&self) -> bool { self.set.is_empty() }
    pub fn is_seeded(&self) -> bool { self.seeded }
    pub fn contains(&self, symbol: &str) -> bool { self.set.contains(symbol) }

    /// Initial population: no events.
    pub fn seed<'a, I: IntoIterator<Item = &'a str>>(&mut self, symbols: I) {
        self.set = symbols.into_iter().filter(|s| self.filters.admits(s)).map(String::from).collect();
        self.seeded = true;
    }

    /// Apply a batch of tickers. The first complete snapshot on an unseeded set only seeds.
    pub fn apply(&mut self, tickers: &[Ticker24h], complete: bool) -> Detection {
        let admitted: Vec<&Ticker24h> = tickers.iter().filter(|t| self.filters.admits(&t.symbol)).collect();
        if !self.seeded {
            if complete {
                self.seed(admitted.iter().map(|t| t.symbol.as_str()));
            }
            return Detection::default();
        }

        let diff = diff_symbols(&self.set, admitted.iter().map(|t| t.symbol.as_str()), complete);
        let now = Utc::now();
        let mut out = Detection::default();
        for sym in diff.added {
            if let Some(t) = admitted.iter().find(|t| t.symbol == sym) {
                out.listings.push(ListingEvent {
                    symbol: sym.clone(),
                    price: t.last_price,
                    volume: t.volume,
                    quote_volume: t.quote_volume,
                    price_change_percent: t.price_change_percent,
                    detected_at: now,
                });
            }
            self.set.insert(sym);
        }
        for sym in diff.removed {
            self.set.remove(&sym);
            out.delistings.push(DelistingNotice { symbol: sym, detected_at: now });
        }
        out
    }
}
