//! Size-driven layout selection
//!
//! Strategy:
//! - Small objects get small stripe units (less padding per write)
//! - Larger objects get progressively larger units (fewer backend ops)
//! - Anything past the configured size cap gets the maximum layout
//!
//! The table is built once from configuration and is read-only afterwards, so
//! it can be shared freely between requests.

use crate::config::{LayoutBracket, LayoutConfig};
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};

/// Unit size of layout 1; each following layout doubles it
const BASE_UNIT_SIZE: u64 = 4096;

/// Striping descriptor used for backend I/O on one object or fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutDescriptor {
    pub layout_id: u8,
    pub unit_size: u64,
}

impl LayoutDescriptor {
    /// Descriptor for a known layout id
    pub fn for_id(layout_id: u8) -> Self {
        LayoutDescriptor {
            layout_id,
            unit_size: unit_size_for_layout(layout_id),
        }
    }
}

/// Stripe unit size in bytes for a layout id
pub fn unit_size_for_layout(layout_id: u8) -> u64 {
    let shift = layout_id.saturating_sub(1).min(32) as u32;
    BASE_UNIT_SIZE << shift
}

/// Size-sorted lookup table from object size to layout
#[derive(Debug, Clone)]
pub struct LayoutTable {
    brackets: Vec<LayoutBracket>,
    max_layout_id: u8,
    size_cap: u64,
}

impl LayoutTable {
    /// Build the table, rejecting brackets that would make lookup non-monotonic
    pub fn from_config(config: &LayoutConfig) -> Result<Self> {
        let mut brackets = config.brackets.clone();
        brackets.sort_by_key(|b| b.max_size);

        for pair in brackets.windows(2) {
            if pair[1].layout_id < pair[0].layout_id {
                return Err(GatewayError::Config(format!(
                    "layout table not monotonic: {} bytes -> {} but {} bytes -> {}",
                    pair[0].max_size, pair[0].layout_id, pair[1].max_size, pair[1].layout_id
                )));
            }
        }
        if let Some(last) = brackets.last() {
            if last.layout_id > config.max_layout_id {
                return Err(GatewayError::Config(format!(
                    "layout id {} exceeds max layout id {}",
                    last.layout_id, config.max_layout_id
                )));
            }
        }

        Ok(LayoutTable {
            brackets,
            max_layout_id: config.max_layout_id,
            size_cap: config.size_cap,
        })
    }

    /// Smallest layout whose bracket covers `size`
    pub fn select(&self, size: u64) -> LayoutDescriptor {
        if size > self.size_cap {
            return LayoutDescriptor::for_id(self.max_layout_id);
        }
        let idx = self.brackets.partition_point(|b| b.max_size < size);
        let layout_id = self
            .brackets
            .get(idx)
            .map(|b| b.layout_id)
            .unwrap_or(self.max_layout_id);
        LayoutDescriptor::for_id(layout_id)
    }

    pub fn max_layout_id(&self) -> u8 {
        self.max_layout_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LayoutTable {
        LayoutTable::from_config(&LayoutConfig::default()).unwrap()
    }

    #[test]
    fn test_unit_sizes_double() {
        assert_eq!(unit_size_for_layout(1), 4096);
        assert_eq!(unit_size_for_layout(2), 8192);
        assert_eq!(unit_size_for_layout(9), 1024 * 1024);
    }

    #[test]
    fn test_select_brackets() {
        let t = table();
        assert_eq!(t.select(0).layout_id, 1);
        assert_eq!(t.select(4096).layout_id, 1);
        assert_eq!(t.select(4097).layout_id, 2);
        assert_eq!(t.select(1024 * 1024).layout_id, 9);
        assert_eq!(t.select(3 * 1024 * 1024).layout_id, 10);
        assert_eq!(t.select(16 * 1024 * 1024).layout_id, 11);
    }

    #[test]
    fn test_select_clamps_past_cap() {
        let t = table();
        let d = t.select(5 * 1024 * 1024 * 1024);
        assert_eq!(d.layout_id, t.max_layout_id());
        assert_eq!(d.unit_size, unit_size_for_layout(t.max_layout_id()));
    }

    #[test]
    fn test_select_is_monotonic() {
        let t = table();
        let mut last = 0;
        for size in (0..40 * 1024 * 1024u64).step_by(64 * 1024 + 7) {
            let id = t.select(size).layout_id;
            assert!(id >= last, "size {} went from layout {} to {}", size, last, id);
            last = id;
        }
    }

    #[test]
    fn test_rejects_non_monotonic_table() {
        let config = LayoutConfig {
            brackets: vec![
                LayoutBracket {
                    max_size: 4096,
                    layout_id: 5,
                },
                LayoutBracket {
                    max_size: 8192,
                    layout_id: 2,
                },
            ],
            max_layout_id: 9,
            size_cap: 8192,
        };
        assert!(LayoutTable::from_config(&config).is_err());
    }
}
