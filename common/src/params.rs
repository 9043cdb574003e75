//! Network policy constants and the subsidy schedule

/// Base units per coin.
pub const COIN: u64 = 100_000_000;

/// Blocks between subsidy halvings.
pub const HALVING_INTERVAL: u64 = 210_000;

/// Subsidy of the genesis era, in base units.
pub const INITIAL_SUBSIDY: u64 = 50 * COIN;

/// Trailing window, below the fleet's best height, scanned for
/// same-height block races.
pub const STALE_WINDOW: u64 = 100;

/// How far past a contested height branch chains are followed when
/// classifying transaction conflicts.
pub const DOUBLE_SPEND_RANGE: u64 = 30;

/// Upper bound on invalidate/verify cycles in one mirror rollback.
pub const ROLLBACK_MAX_ITERATIONS: u32 = 100;

/// A conflicting spend whose per-output values differ by at most this many
/// base units (and whose output scripts match) counts as a fee bump.
pub const RBF_VALUE_TOLERANCE: u64 = 10_000;

/// Maximum blocks one inflation audit will roll the mirror through.
pub const AUDIT_MAX_BLOCKS: usize = 10;

/// Pause after a failed audit before the mirror is used again.
pub const MIRROR_REST_SECS: u64 = 60;

/// Slack applied when comparing supply deltas against the subsidy ceiling.
/// Totals are integer base units end to end, so the default is exact.
pub const INFLATION_TOLERANCE: u64 = 0;

/// Top bits of the block version field reserved by the version-bits
/// deployment scheme; masked off before reading signal bits.
pub const VERSION_RESERVED_BITS: u32 = 0xe000_0000;

/// Largest issuance any single block at `height` may add to the supply.
pub fn max_issuance(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        0
    } else {
        INITIAL_SUBSIDY >> halvings
    }
}

/// Indices of the signal bits set in a block version field.
pub fn signal_bits(version: u32) -> Vec<u8> {
    let masked = version & !VERSION_RESERVED_BITS;
    (0..29).filter(|bit| masked & (1 << bit) != 0).collect()
}

const POOL_TAGS: &[(&str, &str)] = &[
    ("/Foundry USA Pool/", "Foundry USA"),
    ("/AntPool/", "AntPool"),
    ("/ViaBTC/", "ViaBTC"),
    ("/F2Pool/", "F2Pool"),
    ("/Binance/", "Binance Pool"),
    ("/Luxor/", "Luxor"),
    ("/MARA Pool/", "MARA Pool"),
    ("/BTC.com/", "BTC.com"),
    ("/SBI Crypto/", "SBI Crypto"),
    ("/Braiins/", "Braiins Pool"),
    ("/slush/", "Braiins Pool"),
];

/// Miner attribution from the coinbase scriptSig tag, if recognized.
pub fn pool_from_coinbase_tag(tag: &[u8]) -> Option<&'static str> {
    let text = String::from_utf8_lossy(tag);
    POOL_TAGS
        .iter()
        .find(|(marker, _)| text.contains(marker))
        .map(|(_, name)| *name)
}
