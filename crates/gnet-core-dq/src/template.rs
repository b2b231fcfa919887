//! Per-query message templates.
//!
//! The search payload received at launch is kept verbatim as a template.
//! Forwarding at TTL `t` uses a cached copy whose header TTL byte was
//! rewritten to `t`; the copy is made once and reused for every later
//! dispatch at the same TTL.

use gnet_core_common::{Muid, SearchMessage};

use crate::horizon::MAX_TTL;

/// The immutable query template and its by-TTL copies.
pub(crate) struct TemplateCache {
    template: SearchMessage,
    by_ttl: [Option<SearchMessage>; MAX_TTL as usize],
}

impl TemplateCache {
    pub fn new(template: SearchMessage) -> Self {
        Self {
            template,
            by_ttl: Default::default(),
        }
    }

    /// The original payload, TTL as received.
    pub fn template(&self) -> &SearchMessage {
        &self.template
    }

    /// The wire MUID of the query.
    pub fn muid(&self) -> Muid {
        self.template.muid()
    }

    /// The message to put on the wire at the given TTL, building and
    /// caching it on first use.
    pub fn for_ttl(&mut self, ttl: u8) -> &SearchMessage {
        let idx = ttl.clamp(1, MAX_TTL) as usize - 1;
        if self.by_ttl[idx].is_none() {
            let mut copy = self.template.clone();
            copy.set_ttl(idx as u8 + 1);
            self.by_ttl[idx] = Some(copy);
        }
        self.by_ttl[idx].as_ref().expect("cached above")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> TemplateCache {
        TemplateCache::new(SearchMessage::query(
            Muid::from_bytes([3; 16]),
            4,
            1,
            0,
            "ogg vorbis",
        ))
    }

    #[test]
    fn copies_differ_only_in_ttl_byte() {
        let mut cache = template();
        let original = cache.template().clone();
        let patched = cache.for_ttl(2).clone();

        assert_eq!(patched.ttl(), 2);
        let diff: Vec<usize> = original
            .as_bytes()
            .iter()
            .zip(patched.as_bytes())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(diff, vec![17]);
    }

    #[test]
    fn repeated_requests_return_identical_bytes() {
        let mut cache = template();
        let first = cache.for_ttl(3).clone();
        let second = cache.for_ttl(3).clone();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn ttl_clamps_to_table_range() {
        let mut cache = template();
        assert_eq!(cache.for_ttl(9).ttl(), MAX_TTL);
        assert_eq!(cache.for_ttl(0).ttl(), 1);
    }
}
