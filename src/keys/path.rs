//! Derivation paths: `m/44'/0'/0'` ↔ `Vec<u32>`, and the short per-address
//! form `m/<branch>/<index>` recorded in address infos.

use super::format::Branch;
use super::KeyError;
use crate::crypto::HARDENED;
use bitcoin::bip32::{self, ChildNumber, DerivationPath};
use std::fmt;
use std::str::FromStr;

/// Parse one path component. Accepts `'` or `h` as the hardened marker.
pub fn parse_index(component: &str) -> Result<u32, KeyError> {
    let trimmed = component.trim();
    ChildNumber::from_str(trimmed).map(u32::from).map_err(|e| path_error(trimmed, e))
}

/// Parse `m/44'/0'/0'` into raw child indices (hardened ones offset by 2^31).
pub fn parse_path(path: &str) -> Result<Vec<u32>, KeyError> {
    let trimmed = path.trim();
    if trimmed != "m" && !trimmed.starts_with("m/") {
        return Err(KeyError::InvalidPath(path.to_string()));
    }
    let parsed = DerivationPath::from_str(trimmed).map_err(|e| path_error(trimmed, e))?;
    Ok((&parsed).into_iter().map(|child| u32::from(*child)).collect())
}

pub fn format_path(indices: &[u32]) -> String {
    indices.iter().fold(String::from("m"), |mut out, &index| {
        out.push('/');
        out.push_str(&ChildNumber::from(index).to_string());
        out
    })
}

/// Indices past the u32 range surface as `InvalidChildNumberFormat`; report
/// those as out of range rather than malformed.
fn path_error(path: &str, error: bip32::Error) -> KeyError {
    match error {
        bip32::Error::InvalidChildNumber(index) => KeyError::IndexOutOfRange(u64::from(index)),
        _ => oversized_index(path).map_or_else(|| KeyError::InvalidPath(path.to_string()), KeyError::IndexOutOfRange),
    }
}

fn oversized_index(path: &str) -> Option<u64> {
    path.split('/').find_map(|component| {
        let digits = component.trim_end_matches(&['\'', 'h'][..]);
        let value: u64 = digits.parse().ok()?;
        (value > u64::from(u32::MAX)).then_some(value)
    })
}

/// Location of one address relative to the wallet's master (account) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressPath {
    pub branch: Branch,
    pub index: u32,
}

impl AddressPath {
    pub fn new(branch: Branch, index: u32) -> Self { Self { branch, index } }
}

impl fmt::Display for AddressPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m/{}/{}", self.branch.child_index(), self.index)
    }
}

impl FromStr for AddressPath {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_path(s)?.as_slice() {
            [branch, index] if *index < HARDENED => {
                let branch = Branch::from_child_index(*branch).ok_or_else(|| KeyError::InvalidPath(s.to_string()))?;
                Ok(Self { branch, index: *index })
            }
            _ => Err(KeyError::InvalidPath(s.to_string())),
        }
    }
}
