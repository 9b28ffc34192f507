use std::fmt;

use chrono::NaiveDate;
use rand::Rng;
use thiserror::Error;

pub const ACCESS_KEY_LENGTH: usize = 49;

const DATE_RANGE: (usize, usize) = (0, 8);
const DOCUMENT_TYPE_RANGE: (usize, usize) = (8, 10);
const RUC_RANGE: (usize, usize) = (10, 23);
const ENVIRONMENT_OFFSET: usize = 23;
const ESTABLISHMENT_RANGE: (usize, usize) = (24, 27);
const EMISSION_POINT_RANGE: (usize, usize) = (27, 30);
const SEQUENCE_OFFSET: usize = 30;
const SEQUENCE_LENGTH: usize = 9;

pub const MAX_SEQUENCE: u32 = 999_999_999;

/// Emission type digit for regular (online) emission.
const NORMAL_EMISSION: char = '1';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedKey {
    #[error("access key must be {ACCESS_KEY_LENGTH} characters, got {0}")]
    Length(usize),
    #[error("access key must contain only digits")]
    NonNumeric,
    #[error("invalid access key component: {0}")]
    Component(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Test,
    Production,
}

impl Environment {
    pub fn code(self) -> char {
        match self {
            Environment::Test => '1',
            Environment::Production => '2',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "1" => Some(Environment::Test),
            "2" => Some(Environment::Production),
            _ => None,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Test => f.write_str("test"),
            Environment::Production => f.write_str("production"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessKeyParts<'a> {
    pub emission_date: NaiveDate,
    pub document_type: &'a str,
    pub ruc: &'a str,
    pub environment: Environment,
    pub establishment: &'a str,
    pub emission_point: &'a str,
    pub sequence: u32,
    /// Eight-digit code; a random one is drawn when absent.
    pub numeric_code: Option<u32>,
}

/// A 49-digit access key. Holding one guarantees the shape is valid; the check
/// digit is verified separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessKey(String);

impl AccessKey {
    pub fn parse(raw: &str) -> Result<Self, MalformedKey> {
        if raw.len() != ACCESS_KEY_LENGTH {
            return Err(MalformedKey::Length(raw.chars().count()));
        }
        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MalformedKey::NonNumeric);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn generate(parts: &AccessKeyParts<'_>) -> Result<Self, MalformedKey> {
        let document_type = fixed_digits("document type", parts.document_type, 2)?;
        let ruc = fixed_digits("ruc", parts.ruc, 13)?;
        let establishment = fixed_digits("establishment", parts.establishment, 3)?;
        let emission_point = fixed_digits("emission point", parts.emission_point, 3)?;
        if parts.sequence == 0 || parts.sequence > MAX_SEQUENCE {
            return Err(MalformedKey::Component(format!(
                "sequence {} out of range",
                parts.sequence
            )));
        }
        let numeric_code = parts
            .numeric_code
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..100_000_000));
        if numeric_code >= 100_000_000 {
            return Err(MalformedKey::Component("numeric code exceeds 8 digits".into()));
        }

        let mut key = String::with_capacity(ACCESS_KEY_LENGTH);
        key.push_str(&parts.emission_date.format("%d%m%Y").to_string());
        key.push_str(document_type);
        key.push_str(ruc);
        key.push(parts.environment.code());
        key.push_str(establishment);
        key.push_str(emission_point);
        key.push_str(&format!("{:09}", parts.sequence));
        key.push_str(&format!("{numeric_code:08}"));
        key.push(NORMAL_EMISSION);
        key.push(check_digit(&key));

        Self::parse(&key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The nine sequence digits as written in the key.
    pub fn sequence_digits(&self) -> &str {
        &self.0[SEQUENCE_OFFSET..SEQUENCE_OFFSET + SEQUENCE_LENGTH]
    }

    pub fn sequence(&self) -> u32 {
        // shape was validated on construction
        self.sequence_digits().parse().unwrap_or_default()
    }

    pub fn emission_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.slice(DATE_RANGE), "%d%m%Y").ok()
    }

    pub fn document_type(&self) -> &str {
        self.slice(DOCUMENT_TYPE_RANGE)
    }

    pub fn ruc(&self) -> &str {
        self.slice(RUC_RANGE)
    }

    pub fn environment(&self) -> Option<Environment> {
        Environment::from_code(&self.0[ENVIRONMENT_OFFSET..ENVIRONMENT_OFFSET + 1])
    }

    pub fn establishment(&self) -> &str {
        self.slice(ESTABLISHMENT_RANGE)
    }

    pub fn emission_point(&self) -> &str {
        self.slice(EMISSION_POINT_RANGE)
    }

    pub fn has_valid_check_digit(&self) -> bool {
        let (body, last) = self.0.split_at(ACCESS_KEY_LENGTH - 1);
        last.starts_with(check_digit(body))
    }

    fn slice(&self, (start, end): (usize, usize)) -> &str {
        &self.0[start..end]
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extracts the sequence number embedded in a raw access key.
pub fn decode_sequence(raw: &str) -> Result<String, MalformedKey> {
    AccessKey::parse(raw).map(|key| key.sequence_digits().to_string())
}

fn fixed_digits<'a>(name: &str, value: &'a str, len: usize) -> Result<&'a str, MalformedKey> {
    if value.len() == len && value.bytes().all(|b| b.is_ascii_digit()) {
        Ok(value)
    } else {
        Err(MalformedKey::Component(format!(
            "{name} must be {len} digits, got {value:?}"
        )))
    }
}

fn check_digit(body: &str) -> char {
    let sum: u32 = body
        .bytes()
        .rev()
        .zip([2u32, 3, 4, 5, 6, 7].into_iter().cycle())
        .map(|(digit, weight)| u32::from(digit - b'0') * weight)
        .sum();
    match 11 - (sum % 11) {
        11 => '0',
        10 => '1',
        digit => char::from_digit(digit, 10).unwrap_or('0'),
    }
}
