//! C4: upstream — a weighted, ordered list of backend servers.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub protocol: Protocol,
    pub location: String,
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.location)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub server: Server,
    pub weight: u32,
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.server, self.weight)
    }
}

/// An ordered, non-empty sequence of weighted server selections.
///
/// Equality is selection-sequence equality (Open Question (b) in
/// DESIGN.md): two upstreams are equal iff their selection vectors are
/// equal, not by any identity or name comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Upstream {
    selections: Vec<Selection>,
}

impl Upstream {
    /// Panics if `selections` is empty; callers that parse from
    /// user-controlled text should route through [`crate::parser::upstream::parse_upstream`]
    /// instead, which returns a `ParseError` for the empty case.
    pub fn new(selections: Vec<Selection>) -> Self {
        assert!(!selections.is_empty(), "Upstream must have at least one selection");
        Upstream { selections }
    }

    pub fn selections(&self) -> &[Selection] {
        &self.selections
    }

    pub fn servers(&self) -> Vec<&Server> {
        self.selections.iter().map(|s| &s.server).collect()
    }

    pub fn total(&self) -> u32 {
        self.selections.iter().map(|s| s.weight).sum()
    }

    /// True iff every selection carries the same weight.
    pub fn uniform(&self) -> bool {
        let first = self.selections[0].weight;
        self.selections.iter().all(|s| s.weight == first)
    }

    /// Weighted-random pick. Uniform upstreams draw uniformly; otherwise a
    /// cumulative-weight scan breaks ties by insertion order (§4.4).
    pub fn select(&self) -> &Server {
        self.select_with(&mut rand::thread_rng())
    }

    pub fn select_with(&self, rng: &mut impl Rng) -> &Server {
        if self.uniform() {
            let i = rng.gen_range(0..self.selections.len());
            return &self.selections[i].server;
        }
        let total = self.total();
        let choice = rng.gen_range(0..total);
        let mut offset = 0u32;
        for selection in &self.selections {
            if choice < offset + selection.weight {
                return &selection.server;
            }
            offset += selection.weight;
        }
        unreachable!("selection scan covers [0, total)");
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.selections.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", parts.join(" "))
    }
}

impl TryFrom<String> for Upstream {
    type Error = crate::error::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        crate::parser::upstream::parse_upstream(&value)
    }
}

impl From<Upstream> for String {
    fn from(value: Upstream) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn up(pairs: &[(&str, u32)]) -> Upstream {
        Upstream::new(
            pairs
                .iter()
                .map(|(loc, w)| Selection {
                    server: Server {
                        protocol: Protocol::Http,
                        location: loc.to_string(),
                    },
                    weight: *w,
                })
                .collect(),
        )
    }

    #[test]
    fn total_and_uniform() {
        let u = up(&[("a", 1), ("b", 3)]);
        assert_eq!(u.total(), 4);
        assert!(!u.uniform());
        let u2 = up(&[("a", 1), ("b", 1)]);
        assert!(u2.uniform());
    }

    #[test]
    fn display_matches_dsl_form() {
        let u = up(&[("a", 1), ("b", 3)]);
        assert_eq!(u.to_string(), "http://a,1 http://b,3");
    }

    #[test]
    fn weighted_pick_respects_cumulative_boundaries() {
        let u = up(&[("a", 1), ("b", 3)]);
        // choice = 0 -> a; choice in 1..4 -> b.
        let mut rng = StepRng::new(0, 1);
        assert_eq!(u.select_with(&mut rng).location, "a");
    }

    #[test]
    fn equality_is_selection_sequence_equality() {
        let a = up(&[("a", 1)]);
        let b = up(&[("a", 1)]);
        assert_eq!(a, b);
        let c = up(&[("a", 2)]);
        assert_ne!(a, c);
    }
}
