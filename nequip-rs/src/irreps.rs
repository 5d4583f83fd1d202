//! Irreducible representation descriptors.
//!
//! Only the bookkeeping needed to propagate field types through graph
//! modules lives here: parsing, comparison and dimension counting. There is
//! no tensor algebra.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{NequipError, NequipResult};

/// Field name to irreps map. `None` marks a field with no equivariant
/// structure (integer indices, cell metadata, ...).
pub type IrrepsDict = BTreeMap<String, Option<Irreps>>;

/// Parity of an irrep under inversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Parity {
    /// Even (`e`)
    Even,
    /// Odd (`o`)
    Odd,
}

/// A single irreducible representation of O(3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Irrep {
    /// Angular momentum order
    pub l: u32,
    /// Parity
    pub p: Parity,
}

impl Irrep {
    /// Create a new irrep.
    pub const fn new(l: u32, p: Parity) -> Self {
        Self { l, p }
    }

    /// Dimension `2l + 1`.
    #[must_use]
    pub const fn dim(&self) -> usize {
        2 * self.l as usize + 1
    }
}

impl FromStr for Irrep {
    type Err = NequipError;

    fn from_str(s: &str) -> NequipResult<Self> {
        let s = s.trim();
        let invalid = || NequipError::invalid_config(format!("invalid irrep '{s}'"));
        let last = s.chars().last().ok_or_else(invalid)?;
        let p = match last {
            'e' => Parity::Even,
            'o' => Parity::Odd,
            _ => return Err(invalid()),
        };
        let l = s[..s.len() - last.len_utf8()]
            .parse::<u32>()
            .map_err(|_| invalid())?;
        Ok(Self::new(l, p))
    }
}

impl fmt::Display for Irrep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = match self.p {
            Parity::Even => 'e',
            Parity::Odd => 'o',
        };
        write!(f, "{}{}", self.l, p)
    }
}

/// A direct sum of irreps with multiplicities, e.g. `2x0e+1x1o`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Irreps(Vec<(usize, Irrep)>);

impl Irreps {
    /// A single scalar, `1x0e`.
    pub fn scalar() -> Self {
        Self(vec![(1, Irrep::new(0, Parity::Even))])
    }

    /// A single polar vector, `1x1o`.
    pub fn vector() -> Self {
        Self(vec![(1, Irrep::new(1, Parity::Odd))])
    }

    /// Total dimension.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.0.iter().map(|(mul, ir)| mul * ir.dim()).sum()
    }

    /// Number of irreps counting multiplicity.
    #[must_use]
    pub fn num_irreps(&self) -> usize {
        self.0.iter().map(|(mul, _)| mul).sum()
    }
}

impl FromStr for Irreps {
    type Err = NequipError;

    fn from_str(s: &str) -> NequipResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        let mut out = Vec::new();
        for term in s.split('+') {
            let term = term.trim();
            let (mul, ir) = match term.split_once('x') {
                Some((mul, ir)) => {
                    let mul = mul.trim().parse::<usize>().map_err(|_| {
                        NequipError::invalid_config(format!("invalid multiplicity in '{term}'"))
                    })?;
                    (mul, ir.parse::<Irrep>()?)
                }
                None => (1, term.parse::<Irrep>()?),
            };
            out.push((mul, ir));
        }
        Ok(Self(out))
    }
}

impl fmt::Display for Irreps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (mul, ir)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{mul}x{ir}")?;
        }
        Ok(())
    }
}

/// Parse an `IrrepsDict` from string pairs; `None` values stay untyped.
pub fn irreps_dict<'a, I>(entries: I) -> NequipResult<IrrepsDict>
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    entries
        .into_iter()
        .map(|(k, v)| Ok((k.to_string(), v.map(str::parse).transpose()?)))
        .collect()
}
