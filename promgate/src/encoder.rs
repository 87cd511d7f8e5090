//! Exposition encoding of merged families.

use std::io::Write;

use promgate_common::exposition::{WriteOptions, write_family};
use tracing::warn;

use crate::merger::MergedFamilies;

/// Counts from one encoding pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeSummary {
    /// Families written to the output.
    pub encoded: usize,
    /// Families left out because they could not be rendered.
    pub skipped: usize,
}

/// Writes merged families in the text exposition format.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder {
    options: WriteOptions,
}

impl Encoder {
    pub fn new(strip_comments: bool) -> Self {
        Self {
            options: WriteOptions { strip_comments },
        }
    }

    /// Encode every family in name order.
    ///
    /// A family that fails to render is logged and left out; the others are
    /// still written.
    pub fn encode<W: Write>(&self, merged: &MergedFamilies, out: &mut W) -> EncodeSummary {
        let mut summary = EncodeSummary::default();

        for family in merged.iter() {
            match write_family(family, out, self.options) {
                Ok(()) => summary.encoded += 1,
                Err(e) => {
                    warn!(family = %family.name, error = %e, "Failed to encode metric family");
                    summary.skipped += 1;
                }
            }
        }

        summary
    }
}
