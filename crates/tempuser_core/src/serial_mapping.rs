use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::SerialMappingConfig;
use crate::error::TempUserError;

pub trait SerialMapping: Send + Sync {
    fn serial_id_for_index(&self, index: u64) -> String;
}

/// Factory for mapping types registered outside this crate.
pub type SerialMappingFactory =
    Box<dyn Fn(&SerialMappingConfig) -> Result<Arc<dyn SerialMapping>> + Send + Sync>;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OffsetOptions {
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalizedOptions {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilteredRadixOptions {
    #[serde(default = "default_radix")]
    pub radix: u32,
    #[serde(default)]
    pub bad_indexes: Vec<u64>,
    #[serde(default)]
    pub uppercase: bool,
    #[serde(default)]
    pub exclude_ambiguous: bool,
}

fn default_radix() -> u32 {
    10
}

/// The mapping types this crate knows how to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownSerialMapping {
    PlainNumeric(OffsetOptions),
    ReadableNumeric(OffsetOptions),
    LocalizedNumeric(LocalizedOptions),
    FilteredRadix(FilteredRadixOptions),
    Scramble(OffsetOptions),
}

impl KnownSerialMapping {
    /// Returns `Ok(None)` for types that are not built in.
    pub fn from_config(config: &SerialMappingConfig) -> Result<Option<Self>, TempUserError> {
        let known = match config.kind.as_str() {
            "plain-numeric" => Self::PlainNumeric(parse_options(config)?),
            "readable-numeric" => Self::ReadableNumeric(parse_options(config)?),
            "localized-numeric" => Self::LocalizedNumeric(parse_options(config)?),
            "filtered-radix" => Self::FilteredRadix(parse_options(config)?),
            "scramble" => Self::Scramble(parse_options(config)?),
            _ => return Ok(None),
        };
        Ok(Some(known))
    }

    pub fn build(self) -> Result<Arc<dyn SerialMapping>, TempUserError> {
        Ok(match self {
            Self::PlainNumeric(options) => Arc::new(PlainNumericMapping::new(options.offset)),
            Self::ReadableNumeric(options) => Arc::new(ReadableNumericMapping::new(options.offset)),
            Self::LocalizedNumeric(options) => Arc::new(LocalizedNumericMapping::new(
                &options.language,
                options.offset,
            )),
            Self::FilteredRadix(options) => Arc::new(FilteredRadixMapping::new(options)?),
            Self::Scramble(options) => Arc::new(ScrambleMapping::new(options.offset)),
        })
    }
}

fn parse_options<T: DeserializeOwned>(config: &SerialMappingConfig) -> Result<T, TempUserError> {
    toml::Value::Table(config.options.clone())
        .try_into()
        .map_err(|err: toml::de::Error| TempUserError::InvalidMappingOptions {
            kind: config.kind.clone(),
            reason: err.message().to_string(),
        })
}

/// Resolves a mapping `type` to an implementation: built-ins first, then
/// externally registered factories.
#[derive(Default)]
pub struct SerialMappingRegistry {
    factories: HashMap<String, SerialMappingFactory>,
}

impl SerialMappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: SerialMappingFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn create(&self, config: &SerialMappingConfig) -> Result<Arc<dyn SerialMapping>> {
        if let Some(known) = KnownSerialMapping::from_config(config)? {
            return Ok(known.build()?);
        }
        match self.factories.get(&config.kind) {
            Some(factory) => factory(config),
            None => Err(TempUserError::UnknownSerialMapping(config.kind.clone()).into()),
        }
    }
}

impl std::fmt::Debug for SerialMappingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("SerialMappingRegistry")
            .field("extensions", &kinds)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PlainNumericMapping {
    offset: u64,
}

impl PlainNumericMapping {
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }
}

impl SerialMapping for PlainNumericMapping {
    fn serial_id_for_index(&self, index: u64) -> String {
        index.saturating_add(self.offset).to_string()
    }
}

/// Decimal digits in hyphen-separated groups of five, e.g. `12345-678`.
#[derive(Debug, Clone)]
pub struct ReadableNumericMapping {
    offset: u64,
}

impl ReadableNumericMapping {
    const GROUP: usize = 5;

    pub fn new(offset: u64) -> Self {
        Self { offset }
    }
}

impl SerialMapping for ReadableNumericMapping {
    fn serial_id_for_index(&self, index: u64) -> String {
        let digits = index.saturating_add(self.offset).to_string();
        let mut out = String::with_capacity(digits.len() + digits.len() / Self::GROUP);
        for (i, ch) in digits.chars().enumerate() {
            if i > 0 && i % Self::GROUP == 0 {
                out.push('-');
            }
            out.push(ch);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct LocalizedNumericMapping {
    zero: char,
    offset: u64,
}

impl LocalizedNumericMapping {
    pub fn new(language: &str, offset: u64) -> Self {
        Self {
            zero: native_zero(language),
            offset,
        }
    }
}

impl SerialMapping for LocalizedNumericMapping {
    fn serial_id_for_index(&self, index: u64) -> String {
        let digits = index.saturating_add(self.offset).to_string();
        if self.zero == '0' {
            return digits;
        }
        digits
            .bytes()
            .map(|b| char::from_u32(self.zero as u32 + u32::from(b - b'0')).unwrap_or('?'))
            .collect()
    }
}

/// Zero glyph of the native digit block for `language`. All listed scripts
/// encode 0-9 contiguously.
fn native_zero(language: &str) -> char {
    let base = language
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match base.as_str() {
        "ar" => '\u{0660}',
        "fa" => '\u{06F0}',
        "hi" | "mr" | "ne" | "sa" => '\u{0966}',
        "bn" | "as" => '\u{09E6}',
        "pa" => '\u{0A66}',
        "gu" => '\u{0AE6}',
        "or" => '\u{0B66}',
        "ta" => '\u{0BE6}',
        "te" => '\u{0C66}',
        "kn" => '\u{0CE6}',
        "ml" => '\u{0D66}',
        "th" => '\u{0E50}',
        "lo" => '\u{0ED0}',
        "bo" => '\u{0F20}',
        "my" => '\u{1040}',
        "km" => '\u{17E0}',
        _ => '0',
    }
}

const RADIX_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyz";
const AMBIGUOUS: [char; 4] = ['i', 'l', 'o', 'u'];

/// Radix encoding that skips configured bad indexes and can drop the
/// look-alike letters `i l o u` from its alphabet.
#[derive(Debug, Clone)]
pub struct FilteredRadixMapping {
    alphabet: Vec<char>,
    radix: u64,
    bad_indexes: Vec<u64>,
}

impl FilteredRadixMapping {
    pub fn new(options: FilteredRadixOptions) -> Result<Self, TempUserError> {
        let alphabet: Vec<char> = RADIX_ALPHABET
            .chars()
            .filter(|ch| !options.exclude_ambiguous || !AMBIGUOUS.contains(ch))
            .map(|ch| {
                if options.uppercase {
                    ch.to_ascii_uppercase()
                } else {
                    ch
                }
            })
            .collect();
        if options.radix < 2 || options.radix as usize > alphabet.len() {
            return Err(TempUserError::InvalidMappingOptions {
                kind: "filtered-radix".to_string(),
                reason: format!("radix must be between 2 and {}", alphabet.len()),
            });
        }
        let mut bad_indexes = options.bad_indexes;
        bad_indexes.sort_unstable();
        bad_indexes.dedup();
        Ok(Self {
            alphabet,
            radix: u64::from(options.radix),
            bad_indexes,
        })
    }

    /// Shift `index` past every bad index at or below it.
    pub fn adjust_index(&self, index: u64) -> u64 {
        let mut adjusted = index;
        for bad in &self.bad_indexes {
            if *bad <= adjusted {
                adjusted = adjusted.saturating_add(1);
            }
        }
        adjusted
    }
}

impl SerialMapping for FilteredRadixMapping {
    fn serial_id_for_index(&self, index: u64) -> String {
        let mut value = self.adjust_index(index);
        let mut digits = Vec::new();
        loop {
            digits.push(self.alphabet[(value % self.radix) as usize]);
            value /= self.radix;
            if value == 0 {
                break;
            }
        }
        digits.iter().rev().collect()
    }
}

/// Length-preserving scramble of the decimal representation.
///
/// For an input with `d` digits the value is pushed through rounds of an
/// affine map modulo `10^d` (multipliers coprime to 10) and a digit rotation,
/// then zero-padded back to `d` digits. Every step is a bijection on
/// `[0, 10^d)`, so distinct inputs give distinct outputs. Inputs above 18
/// digits pass through unchanged.
#[derive(Debug, Clone)]
pub struct ScrambleMapping {
    offset: u64,
}

impl ScrambleMapping {
    const MULTIPLIERS: [u64; 3] = [0xD1B5_4A32_D192_ED03, 0x94D0_49BB_1331_11EB, 0xBF58_476D_1CE4_E5B9];
    const INCREMENTS: [u64; 3] = [0x1405_7B7E_F767_814F, 0x2545_F491_4F6C_DD1D, 0x1B87_3593];
    const MAX_DIGITS: u32 = 18;

    pub fn new(offset: u64) -> Self {
        Self { offset }
    }

    fn scramble(value: u64) -> String {
        let width = value.checked_ilog10().map_or(1, |log| log + 1);
        if width > Self::MAX_DIGITS {
            return value.to_string();
        }
        let modulus = 10u128.pow(width);
        let turn = width.div_ceil(2);
        let low = 10u128.pow(width - turn);
        let high = 10u128.pow(turn);

        let mut x = u128::from(value);
        for (mul, inc) in Self::MULTIPLIERS.iter().zip(Self::INCREMENTS.iter()) {
            let mul = u128::from(*mul) % modulus;
            let inc = u128::from(*inc) % modulus;
            x = (x * mul + inc) % modulus;
            if width > 1 {
                x = (x % low) * high + x / low;
            }
        }
        format!("{x:0width$}", width = width as usize)
    }
}

impl SerialMapping for ScrambleMapping {
    fn serial_id_for_index(&self, index: u64) -> String {
        Self::scramble(index.saturating_add(self.offset))
    }
}
