use std::collections::BTreeSet;

use crate::error::{FleetError, Result};

/// Hash types and attack modes an agent declared it can run.
///
/// Parsed from the descriptor string agents send at registration:
/// `hash=0,100,1400;mode=0,3`. A bare list is read as hash types, and a
/// missing section, an empty descriptor or `*` means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    hash_types: Option<BTreeSet<u32>>,
    attack_modes: Option<BTreeSet<u32>>,
}

impl CapabilitySet {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn parse(descriptor: &str) -> Result<Self> {
        let mut set = CapabilitySet::any();

        for section in descriptor.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, list) = match section.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), v),
                None => ("hash".to_string(), section),
            };
            let values = parse_list(list)?;
            match key.as_str() {
                "hash" | "hashes" => set.hash_types = values,
                "mode" | "modes" => set.attack_modes = values,
                other => {
                    return Err(FleetError::Validation(format!(
                        "unknown capability section '{}'",
                        other
                    )))
                }
            }
        }

        Ok(set)
    }

    pub fn supports(&self, hash_type: u32, attack_mode: u32) -> bool {
        let hash_ok = self
            .hash_types
            .as_ref()
            .map_or(true, |s| s.contains(&hash_type));
        let mode_ok = self
            .attack_modes
            .as_ref()
            .map_or(true, |s| s.contains(&attack_mode));
        hash_ok && mode_ok
    }

    /// Declared hash types, or `None` when any is accepted.
    pub fn hash_types(&self) -> Option<&BTreeSet<u32>> {
        self.hash_types.as_ref()
    }

    pub fn attack_modes(&self) -> Option<&BTreeSet<u32>> {
        self.attack_modes.as_ref()
    }
}

fn parse_list(list: &str) -> Result<Option<BTreeSet<u32>>> {
    let mut values = BTreeSet::new();
    for token in list
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        if token == "*" {
            return Ok(None);
        }
        let value = token.parse::<u32>().map_err(|_| {
            FleetError::Validation(format!("invalid capability value '{}'", token))
        })?;
        values.insert(value);
    }
    if values.is_empty() {
        Ok(None)
    } else {
        Ok(Some(values))
    }
}
