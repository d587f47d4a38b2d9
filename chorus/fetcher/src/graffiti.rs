use std::collections::HashMap;

use dv_types::{PubKey, Root};

/// Resolves the graffiti to include in produced blocks: a per-validator
/// override when configured, otherwise the cluster-wide default.
#[derive(Default)]
pub struct GraffitiBuilder {
    default: Option<Root>,
    overrides: HashMap<PubKey, Root>,
}

impl GraffitiBuilder {
    pub fn new(default: Option<Root>) -> Self {
        GraffitiBuilder {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Parses a UTF-8 graffiti string into its zero-padded 32-byte form.
    /// Longer strings are truncated.
    pub fn from_text(text: &str) -> Self {
        Self::new(Some(pad_graffiti(text)))
    }

    pub fn set_override(&mut self, pubkey: PubKey, graffiti: Root) {
        self.overrides.insert(pubkey, graffiti);
    }

    pub fn get(&self, pubkey: &PubKey) -> Option<Root> {
        self.overrides.get(pubkey).copied().or(self.default)
    }
}

fn pad_graffiti(text: &str) -> Root {
    let mut bytes = [0u8; 32];
    let take = text.len().min(32);
    bytes[..take].copy_from_slice(&text.as_bytes()[..take]);
    Root::from_slice(&bytes)
}
