//! Batch of input rows processed together in one run

use super::record::InputItem;
use bibscout_common::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Ordered, id-deduplicated input list
#[derive(Debug, Clone)]
pub struct Batch {
    items: Vec<InputItem>,
    duplicates: usize,
}

impl Batch {
    /// Build a batch, keeping the first occurrence of each id
    ///
    /// Blank ids are rejected before any work starts.
    pub fn from_inputs(inputs: Vec<InputItem>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(inputs.len());
        let mut duplicates = 0;

        for (index, mut item) in inputs.into_iter().enumerate() {
            let id = item.id.trim().to_string();
            if id.is_empty() {
                return Err(Error::InvalidInput(format!("Blank id at input row {}", index + 1)));
            }
            if !seen.insert(id.clone()) {
                duplicates += 1;
                continue;
            }
            item.id = id;
            items.push(item);
        }

        if duplicates > 0 {
            tracing::warn!(duplicates, "Collapsed duplicate ids in input");
        }

        Ok(Self { items, duplicates })
    }

    pub fn items(&self) -> &[InputItem] {
        &self.items
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Stable key identifying this batch's membership (SHA-256 of ordered ids)
    pub fn batch_key(&self) -> String {
        let mut hasher = Sha256::new();
        for item in &self.items {
            hasher.update(item.id.as_bytes());
            hasher.update(b"\n");
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
