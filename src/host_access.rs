//! Allow/deny list of IPv4 patterns consulted before admitting a connection.
//!
//! A pattern is four dot-separated fields, each either a number 0-255 or
//! `*`. An address is permitted when it matches at least one accept pattern
//! and no deny pattern. The table is filled at startup and then shared
//! read-only, so lookups need no locking.

use crate::{Result, SbwError};
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPattern {
    // `None` is a wildcard octet.
    octets: [Option<u8>; 4],
}

impl AddressPattern {
    // ---

    pub fn matches(&self, address: Ipv4Addr) -> bool {
        // ---
        self.octets
            .iter()
            .zip(address.octets())
            .all(|(field, octet)| field.map_or(true, |v| v == octet))
    }
}

impl FromStr for AddressPattern {
    type Err = SbwError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        let invalid = || SbwError::Config(format!("invalid address pattern {s:?}"));
        let fields: Vec<&str> = s.trim().split('.').collect();
        if fields.len() != 4 {
            return Err(invalid());
        }

        let mut octets = [None; 4];
        for (slot, field) in octets.iter_mut().zip(fields) {
            *slot = match field {
                "*" => None,
                digits if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                    Some(digits.parse::<u8>().map_err(|_| invalid())?)
                }
                _ => return Err(invalid()),
            };
        }
        Ok(Self { octets })
    }
}

impl std::fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        let fields: Vec<String> = self
            .octets
            .iter()
            .map(|o| o.map_or_else(|| "*".to_owned(), |v| v.to_string()))
            .collect();
        f.write_str(&fields.join("."))
    }
}

/// Whether `pattern` is a well-formed dotted quad with optional wildcards.
pub fn address_is_valid(pattern: &str) -> bool {
    pattern.parse::<AddressPattern>().is_ok()
}

#[derive(Debug, Clone, Default)]
pub struct HostAccessTable {
    // ---
    accept: Vec<AddressPattern>,
    deny: Vec<AddressPattern>,
}

impl HostAccessTable {
    // ---

    /// Empty table: nothing is permitted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table that accepts only the loopback address.
    pub fn local_only() -> Self {
        // ---
        let mut table = Self::new();
        table.accept.push(AddressPattern {
            octets: [Some(127), Some(0), Some(0), Some(1)],
        });
        table
    }

    pub fn accept_address(&mut self, pattern: &str) -> Result<()> {
        // ---
        self.accept.push(pattern.parse()?);
        Ok(())
    }

    pub fn deny_address(&mut self, pattern: &str) -> Result<()> {
        // ---
        self.deny.push(pattern.parse()?);
        Ok(())
    }

    /// Decide for a dotted-quad string; anything unparsable is refused.
    pub fn is_permitted(&self, address: &str) -> bool {
        // ---
        match address.trim().parse::<Ipv4Addr>() {
            Ok(ip) => self.is_permitted_ip(ip),
            Err(_) => false,
        }
    }

    pub fn is_permitted_ip(&self, address: Ipv4Addr) -> bool {
        // ---
        self.accept.iter().any(|p| p.matches(address)) && !self.deny.iter().any(|p| p.matches(address))
    }

    pub fn accepted(&self) -> &[AddressPattern] {
        &self.accept
    }

    pub fn denied(&self) -> &[AddressPattern] {
        &self.deny
    }
}
