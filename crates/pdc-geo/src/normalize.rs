//! Canonicalization of heterogeneous location identifiers.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use pdc_core::{GeoError, GeoId, GeoLevel, NATIONAL_ID};
use serde::Deserialize;
use strsim::jaro_winkler;

use crate::crosswalk::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInfo {
    pub fips: &'static str,
    pub usps: &'static str,
    pub name: &'static str,
}

const fn st(fips: &'static str, usps: &'static str, name: &'static str) -> StateInfo {
    StateInfo { fips, usps, name }
}

/// States, DC and the inhabited territories.
pub const STATES: &[StateInfo] = &[
    st("01", "AL", "Alabama"),
    st("02", "AK", "Alaska"),
    st("04", "AZ", "Arizona"),
    st("05", "AR", "Arkansas"),
    st("06", "CA", "California"),
    st("08", "CO", "Colorado"),
    st("09", "CT", "Connecticut"),
    st("10", "DE", "Delaware"),
    st("11", "DC", "District of Columbia"),
    st("12", "FL", "Florida"),
    st("13", "GA", "Georgia"),
    st("15", "HI", "Hawaii"),
    st("16", "ID", "Idaho"),
    st("17", "IL", "Illinois"),
    st("18", "IN", "Indiana"),
    st("19", "IA", "Iowa"),
    st("20", "KS", "Kansas"),
    st("21", "KY", "Kentucky"),
    st("22", "LA", "Louisiana"),
    st("23", "ME", "Maine"),
    st("24", "MD", "Maryland"),
    st("25", "MA", "Massachusetts"),
    st("26", "MI", "Michigan"),
    st("27", "MN", "Minnesota"),
    st("28", "MS", "Mississippi"),
    st("29", "MO", "Missouri"),
    st("30", "MT", "Montana"),
    st("31", "NE", "Nebraska"),
    st("32", "NV", "Nevada"),
    st("33", "NH", "New Hampshire"),
    st("34", "NJ", "New Jersey"),
    st("35", "NM", "New Mexico"),
    st("36", "NY", "New York"),
    st("37", "NC", "North Carolina"),
    st("38", "ND", "North Dakota"),
    st("39", "OH", "Ohio"),
    st("40", "OK", "Oklahoma"),
    st("41", "OR", "Oregon"),
    st("42", "PA", "Pennsylvania"),
    st("44", "RI", "Rhode Island"),
    st("45", "SC", "South Carolina"),
    st("46", "SD", "South Dakota"),
    st("47", "TN", "Tennessee"),
    st("48", "TX", "Texas"),
    st("49", "UT", "Utah"),
    st("50", "VT", "Vermont"),
    st("51", "VA", "Virginia"),
    st("53", "WA", "Washington"),
    st("54", "WV", "West Virginia"),
    st("55", "WI", "Wisconsin"),
    st("56", "WY", "Wyoming"),
    st("60", "AS", "American Samoa"),
    st("66", "GU", "Guam"),
    st("69", "MP", "Northern Mariana Islands"),
    st("72", "PR", "Puerto Rico"),
    st("78", "VI", "U.S. Virgin Islands"),
];

const COUNTY_SUFFIXES: &[&str] = &[
    " city and borough",
    " census area",
    " municipality",
    " borough",
    " county",
    " parish",
];

/// How a location arrived in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawGeoKey {
    /// FIPS or ZIP code as text, possibly missing leading zeros.
    Code(String),
    /// Code that was stored as an integer upstream.
    Numeric(u64),
    /// State name, USPS abbreviation or FIPS code.
    StateName(String),
    CountyName { county: String, state: String },
    /// Separately stored state/county/tract columns.
    Parts {
        state: String,
        county: Option<String>,
        tract: Option<String>,
    },
}

impl From<&str> for RawGeoKey {
    fn from(value: &str) -> Self {
        RawGeoKey::Code(value.to_string())
    }
}

impl From<u64> for RawGeoKey {
    fn from(value: u64) -> Self {
        RawGeoKey::Numeric(value)
    }
}

#[derive(Debug, Deserialize)]
struct CountyNameRow {
    state_fips: String,
    county_fips: String,
    name: String,
}

/// Pure key normalizer with bounded name tables. Never guesses: an
/// unresolvable key is an error, with the closest known name as a hint.
#[derive(Debug, Clone)]
pub struct Normalizer {
    state_lookup: HashMap<String, &'static StateInfo>,
    counties: HashMap<(&'static str, String), String>,
    county_names: HashMap<&'static str, Vec<String>>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        let mut state_lookup = HashMap::new();
        for info in STATES {
            state_lookup.insert(info.fips.to_string(), info);
            state_lookup.insert(info.usps.to_ascii_lowercase(), info);
            state_lookup.insert(normalize_name(info.name), info);
        }
        Self {
            state_lookup,
            counties: HashMap::new(),
            county_names: HashMap::new(),
        }
    }

    /// Register county names. `county_fips` may be the 3-digit part or the
    /// full 5-digit code.
    pub fn with_counties<I, S>(mut self, rows: I) -> Result<Self, GeoError>
    where
        I: IntoIterator<Item = (S, S, S)>,
        S: AsRef<str>,
    {
        for (state, county, name) in rows {
            let state_info = self.state_by_code(state.as_ref())?;
            let county = county.as_ref().trim();
            let width = GeoLevel::County.code_width();
            let part = if county.len() == width {
                let full = pad_digits(county, width..=width, width, county)?;
                if &full[..2] != state_info.fips {
                    return Err(GeoError::InvalidGeography {
                        raw: county.to_string(),
                        reason: format!("county code outside state {}", state_info.fips),
                    });
                }
                full[2..].to_string()
            } else {
                pad_digits(county, 1..=3, 3, county)?
            };
            let code = format!("{}{}", state_info.fips, part);
            let key = normalize_county_name(name.as_ref());
            self.county_names
                .entry(state_info.fips)
                .or_default()
                .push(key.clone());
            self.counties.insert((state_info.fips, key), code);
        }
        Ok(self)
    }

    /// Load `state_fips,county_fips,name` rows from a reference CSV.
    pub fn with_county_file(self, path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.with_county_reader(file)
    }

    pub fn with_county_reader<R: Read>(self, reader: R) -> Result<Self, LoadError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let rows = rdr
            .deserialize::<CountyNameRow>()
            .map(|row| row.map(|r| (r.state_fips, r.county_fips, r.name)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_counties(rows)?)
    }

    pub fn county_count(&self) -> usize {
        self.counties.len()
    }

    /// FIPS code for a state name, USPS abbreviation or code.
    pub fn state_fips(&self, raw: &str) -> Option<&'static str> {
        self.lookup_state(raw).map(|info| info.fips)
    }

    pub fn is_known_state(&self, fips: &str) -> bool {
        STATES.iter().any(|s| s.fips == fips)
    }

    pub fn normalize(&self, raw: &RawGeoKey, hint: Option<GeoLevel>) -> Result<GeoId, GeoError> {
        match raw {
            RawGeoKey::Code(code) => self.normalize_code(code, hint),
            RawGeoKey::Numeric(n) => self.normalize_code(&n.to_string(), hint),
            RawGeoKey::StateName(name) => {
                expect_hint(hint, GeoLevel::State, name)?;
                let info = self.lookup_state(name).ok_or_else(|| GeoError::InvalidGeography {
                    raw: name.clone(),
                    reason: unknown_name_reason(
                        "state",
                        &normalize_name(name),
                        STATES.iter().map(|s| normalize_name(s.name)),
                    ),
                })?;
                GeoId::new(GeoLevel::State, info.fips)
            }
            RawGeoKey::CountyName { county, state } => {
                expect_hint(hint, GeoLevel::County, county)?;
                self.normalize_county_name(county, state)
            }
            RawGeoKey::Parts {
                state,
                county,
                tract,
            } => self.normalize_parts(state, county.as_deref(), tract.as_deref(), hint),
        }
    }

    /// Zero-pad a code to its canonical width. Without a hint, 1–2 digits are
    /// a state, 4–5 a county and 10–11 a tract; ZIP codes need a hint.
    pub fn normalize_code(&self, raw: &str, hint: Option<GeoLevel>) -> Result<GeoId, GeoError> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(NATIONAL_ID) || trimmed.eq_ignore_ascii_case("usa") {
            expect_hint(hint, GeoLevel::National, raw)?;
            return Ok(GeoId::national());
        }
        if trimmed.is_empty() {
            return Err(invalid(raw, "empty key"));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid(raw, "contains non-digit characters"));
        }

        let width = trimmed.len();
        let level = match hint {
            Some(level) => {
                if !accepted_widths(level).contains(&width) {
                    return Err(invalid(
                        raw,
                        &format!("{width} digits contradicts level {level}"),
                    ));
                }
                level
            }
            None => match width {
                1..=2 => GeoLevel::State,
                4..=5 => GeoLevel::County,
                10..=11 => GeoLevel::Tract,
                _ => {
                    return Err(invalid(
                        raw,
                        &format!("cannot infer a level from {width} digits"),
                    ))
                }
            },
        };

        let padded = format!("{:0>w$}", trimmed, w = level.code_width());
        self.validate_code(raw, level, &padded)?;
        GeoId::new(level, padded)
    }

    fn validate_code(&self, raw: &str, level: GeoLevel, padded: &str) -> Result<(), GeoError> {
        if level.is_fips_hierarchy() && !self.is_known_state(&padded[..2]) {
            return Err(invalid(raw, &format!("unknown state FIPS {}", &padded[..2])));
        }
        let all_zero = |s: &str| s.bytes().all(|b| b == b'0');
        match level {
            GeoLevel::County if all_zero(&padded[2..]) => {
                Err(invalid(raw, "county part is 000"))
            }
            GeoLevel::Tract if all_zero(&padded[2..5]) => {
                Err(invalid(raw, "county part is 000"))
            }
            GeoLevel::Zip | GeoLevel::CommutingZone if all_zero(padded) => {
                Err(invalid(raw, "all-zero code"))
            }
            _ => Ok(()),
        }
    }

    fn normalize_parts(
        &self,
        state: &str,
        county: Option<&str>,
        tract: Option<&str>,
        hint: Option<GeoLevel>,
    ) -> Result<GeoId, GeoError> {
        let raw = [Some(state), county, tract]
            .iter()
            .flatten()
            .copied()
            .collect::<Vec<_>>()
            .join("/");
        let state = pad_digits(state, 1..=2, 2, &raw)?;
        let level = match (county, tract) {
            (_, Some(_)) => GeoLevel::Tract,
            (Some(_), None) => GeoLevel::County,
            (None, None) => GeoLevel::State,
        };
        expect_hint(hint, level, &raw)?;

        let mut code = state;
        if level != GeoLevel::State {
            let county = county.ok_or_else(|| invalid(&raw, "tract without county part"))?;
            code.push_str(&pad_digits(county, 1..=3, 3, &raw)?);
        }
        if let Some(tract) = tract {
            code.push_str(&pad_digits(tract, 1..=6, 6, &raw)?);
        }
        self.validate_code(&raw, level, &code)?;
        GeoId::new(level, code)
    }

    fn normalize_county_name(&self, county: &str, state: &str) -> Result<GeoId, GeoError> {
        let info = self.lookup_state(state).ok_or_else(|| GeoError::InvalidGeography {
            raw: format!("{county}, {state}"),
            reason: format!("unknown state {state:?}"),
        })?;
        let key = normalize_county_name(county);
        match self.counties.get(&(info.fips, key.clone())) {
            Some(code) => GeoId::new(GeoLevel::County, code.clone()),
            None => {
                let candidates = self
                    .county_names
                    .get(info.fips)
                    .map(|names| names.to_vec())
                    .unwrap_or_default();
                Err(GeoError::InvalidGeography {
                    raw: format!("{county}, {state}"),
                    reason: unknown_name_reason(
                        &format!("county in {}", info.usps),
                        &key,
                        candidates.into_iter(),
                    ),
                })
            }
        }
    }

    fn lookup_state(&self, raw: &str) -> Option<&'static StateInfo> {
        let trimmed = raw.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) && trimmed.len() <= 2 {
            let code = format!("{trimmed:0>2}");
            return self.state_lookup.get(&code).copied();
        }
        if trimmed.len() == 2 {
            return self.state_lookup.get(&trimmed.to_ascii_lowercase()).copied();
        }
        self.state_lookup.get(&normalize_name(trimmed)).copied()
    }

    fn state_by_code(&self, raw: &str) -> Result<&'static StateInfo, GeoError> {
        self.lookup_state(raw)
            .ok_or_else(|| invalid(raw, "unknown state"))
    }
}

fn invalid(raw: &str, reason: &str) -> GeoError {
    GeoError::InvalidGeography {
        raw: raw.to_string(),
        reason: reason.to_string(),
    }
}

fn expect_hint(hint: Option<GeoLevel>, detected: GeoLevel, raw: &str) -> Result<(), GeoError> {
    match hint {
        Some(level) if level != detected => Err(invalid(
            raw,
            &format!("key is a {detected} but level {level} was requested"),
        )),
        _ => Ok(()),
    }
}

fn accepted_widths(level: GeoLevel) -> std::ops::RangeInclusive<usize> {
    match level {
        GeoLevel::State => 1..=2,
        GeoLevel::County | GeoLevel::Zip => 4..=5,
        GeoLevel::Tract => 10..=11,
        GeoLevel::CommutingZone => 1..=5,
        // "US" is handled before width detection
        GeoLevel::National => 0..=0,
    }
}

fn pad_digits(
    part: &str,
    widths: std::ops::RangeInclusive<usize>,
    width: usize,
    raw: &str,
) -> Result<String, GeoError> {
    let part = part.trim();
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(raw, &format!("part {part:?} is not numeric")));
    }
    if !widths.contains(&part.len()) {
        return Err(invalid(raw, &format!("part {part:?} is wider than {width}")));
    }
    Ok(format!("{part:0>width$}"))
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .replace('.', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_county_name(name: &str) -> String {
    let mut name = normalize_name(name);
    for suffix in COUNTY_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped.to_string();
            break;
        }
    }
    name.replace("saint ", "st ")
}

fn unknown_name_reason(kind: &str, key: &str, candidates: impl Iterator<Item = String>) -> String {
    let best = candidates
        .map(|c| (jaro_winkler(key, &c), c))
        .filter(|(score, _)| *score >= 0.85)
        .max_by(|a, b| a.0.total_cmp(&b.0));
    match best {
        Some((_, name)) => format!("unknown {kind} name (closest known: {name:?})"),
        None => format!("unknown {kind} name"),
    }
}
