//! Parsing of Kubernetes resource quantities as they appear in webhook
//! resource annotations and the `toptierlimit` annotation.

use std::{fmt::Display, str::FromStr};

use snafu::{ResultExt, Snafu, ensure};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("quantity is empty or contains non-ascii characters"))]
    InvalidFormat,

    #[snafu(display("invalid quantity value {value:?}"))]
    InvalidValue {
        source: std::num::ParseFloatError,
        value: String,
    },

    #[snafu(display("unknown quantity suffix {suffix:?}"))]
    UnknownSuffix { suffix: String },

    #[snafu(display(
        "unsupported CPU precision in {value:?}, use the milli form (e.g. 5m) for fractions"
    ))]
    UnsupportedCpuPrecision { value: String },

    #[snafu(display("invalid CPU quantity {value:?}"))]
    InvalidCpuQuantity {
        source: std::num::ParseIntError,
        value: String,
    },
}

/// Byte-multiple suffixes accepted in memory quantities, both binary
/// (powers of 1024) and decimal (powers of 1000).
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum Suffix {
    #[strum(serialize = "")]
    None,

    #[strum(serialize = "Ki")]
    Kibi,

    #[strum(serialize = "Mi")]
    Mebi,

    #[strum(serialize = "Gi")]
    Gibi,

    #[strum(serialize = "Ti")]
    Tebi,

    #[strum(serialize = "k")]
    Kilo,

    #[strum(serialize = "M")]
    Mega,

    #[strum(serialize = "G")]
    Giga,

    #[strum(serialize = "T")]
    Tera,
}

impl Suffix {
    fn factor(self) -> f64 {
        match self {
            Self::None => 1.0,
            Self::Kibi => 2f64.powi(10),
            Self::Mebi => 2f64.powi(20),
            Self::Gibi => 2f64.powi(30),
            Self::Tebi => 2f64.powi(40),
            Self::Kilo => 1e3,
            Self::Mega => 1e6,
            Self::Giga => 1e9,
            Self::Tera => 1e12,
        }
    }
}

/// A memory quantity in bytes, parsed from the Kubernetes serialization
/// format (`128974848`, `64Mi`, `1G`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemQuantity {
    bytes: u64,
}

impl MemQuantity {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self { bytes }
    }

    pub const fn as_bytes(&self) -> u64 {
        self.bytes
    }
}

impl FromStr for MemQuantity {
    type Err = Error;

    fn from_str(quantity: &str) -> Result<Self> {
        ensure!(
            !quantity.is_empty() && quantity.is_ascii(),
            InvalidFormatSnafu
        );

        let split = quantity
            .find(|c: char| c != '.' && !c.is_ascii_digit())
            .unwrap_or(quantity.len());
        let (value, suffix) = quantity.split_at(split);

        let value: f64 = value.parse().context(InvalidValueSnafu { value: quantity })?;
        let suffix =
            Suffix::from_str(suffix).map_err(|_| Error::UnknownSuffix { suffix: suffix.into() })?;

        Ok(Self {
            bytes: (value * suffix.factor()) as u64,
        })
    }
}

impl Display for MemQuantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bytes)
    }
}

/// A CPU quantity with milli precision, parsed from either the milli form
/// (`500m`) or the plain form (`0.5`, `2`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CpuQuantity {
    millis: i64,
}

impl CpuQuantity {
    pub const fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    pub const fn as_millis(&self) -> i64 {
        self.millis
    }
}

impl FromStr for CpuQuantity {
    type Err = Error;

    fn from_str(quantity: &str) -> Result<Self> {
        let split = quantity.find(|c: char| c != '.' && !c.is_ascii_digit());
        if let Some(split) = split {
            let (value, unit) = quantity.split_at(split);
            ensure!(unit == "m", UnsupportedCpuPrecisionSnafu { value: quantity });
            let millis = value.parse().context(InvalidCpuQuantitySnafu { value: quantity })?;
            return Ok(Self::from_millis(millis));
        }

        let cpus: f64 = quantity.parse().context(InvalidValueSnafu { value: quantity })?;
        let millis = cpus * 1000.0;
        ensure!(
            millis == millis.round(),
            UnsupportedCpuPrecisionSnafu { value: quantity }
        );
        Ok(Self::from_millis(millis as i64))
    }
}

impl Display for CpuQuantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.millis % 1000 == 0 {
            true => write!(f, "{}", self.millis / 1000),
            false => write!(f, "{}m", self.millis),
        }
    }
}
