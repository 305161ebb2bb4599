//! ODID range filter expression, used by the output manager (spec §4.7).
//!
//! A direct Rust port of `examples/original_source/src/core/odid_range.c`'s
//! `ipx_orange`: a sorted array of value/interval nodes, parsed from a
//! comma-separated expression of `N` or `from-to` tokens (either bound of an
//! interval may be omitted), queried with a short-circuiting linear scan
//! since the nodes are kept sorted by their lower bound.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeNode {
    Value(u32),
    Interval { from: u32, to: u32 },
}

impl RangeNode {
    fn lower(&self) -> u32 {
        match self {
            RangeNode::Value(v) => *v,
            RangeNode::Interval { from, .. } => *from,
        }
    }

    fn upper(&self) -> u32 {
        match self {
            RangeNode::Value(v) => *v,
            RangeNode::Interval { to, .. } => *to,
        }
    }

    fn contains(&self, odid: u32) -> bool {
        match self {
            RangeNode::Value(v) => odid == *v,
            RangeNode::Interval { from, to } => odid >= *from && odid <= *to,
        }
    }
}

/// A parsed ODID range expression (spec §4.7).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OdidRange {
    nodes: Vec<RangeNode>,
}

/// How an output's ODID filter is applied (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Deliver unconditionally.
    None,
    /// Deliver iff ODID matches.
    Only,
    /// Deliver iff ODID does not match.
    Except,
}

/// An output's ODID filter: a type plus (for `Only`/`Except`) a range.
#[derive(Debug, Clone)]
pub struct OdidFilter {
    pub filter_type: FilterType,
    pub range: OdidRange,
}

impl OdidFilter {
    pub fn none() -> Self {
        OdidFilter { filter_type: FilterType::None, range: OdidRange::default() }
    }

    pub fn only(range: OdidRange) -> Self {
        OdidFilter { filter_type: FilterType::Only, range }
    }

    pub fn except(range: OdidRange) -> Self {
        OdidFilter { filter_type: FilterType::Except, range }
    }

    /// Evaluates whether this output should receive a message with `odid`.
    pub fn matches(&self, odid: u32) -> bool {
        match self.filter_type {
            FilterType::None => true,
            FilterType::Only => self.range.contains(odid),
            FilterType::Except => !self.range.contains(odid),
        }
    }
}

/// Parse error for an ODID range expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty expression")]
    Empty,
    #[error("malformed token: {0:?}")]
    Malformed(String),
    #[error("interval bounds reversed: {from} > {to}")]
    ReversedInterval { from: u32, to: u32 },
}

fn is_blank(s: &str) -> bool {
    s.chars().all(|c| c.is_whitespace())
}

fn parse_u32(token: &str) -> Result<u32, ParseError> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Malformed(token.to_string()));
    }
    trimmed.parse::<u32>().map_err(|_| ParseError::Malformed(token.to_string()))
}

fn parse_token(token: &str) -> Result<RangeNode, ParseError> {
    match token.find('-') {
        None => Ok(RangeNode::Value(parse_u32(token)?)),
        Some(pos) => {
            let (from_str, rest) = token.split_at(pos);
            let to_str = &rest[1..];

            let from_empty = is_blank(from_str);
            let to_empty = is_blank(to_str);
            if from_empty && to_empty {
                return Err(ParseError::Malformed(token.to_string()));
            }

            let from = if from_empty { 0 } else { parse_u32(from_str)? };
            let to = if to_empty { u32::MAX } else { parse_u32(to_str)? };

            if from > to {
                return Err(ParseError::ReversedInterval { from, to });
            }

            if from == to {
                Ok(RangeNode::Value(from))
            } else {
                Ok(RangeNode::Interval { from, to })
            }
        }
    }
}

impl OdidRange {
    /// Parses a comma-separated list of values and/or `from-to` intervals.
    pub fn parse(expr: &str) -> Result<Self, ParseError> {
        if expr.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut nodes = Vec::new();
        for token in expr.split(',') {
            nodes.push(parse_token(token)?);
        }

        nodes.sort_by(|a, b| a.lower().cmp(&b.lower()).then(a.upper().cmp(&b.upper())));
        Ok(OdidRange { nodes })
    }

    /// Membership test, short-circuiting once nodes are known to sort past
    /// `odid` (nodes are sorted ascending by lower bound).
    pub fn contains(&self, odid: u32) -> bool {
        for node in &self.nodes {
            if node.contains(odid) {
                return true;
            }
            if odid < node.lower() {
                break;
            }
        }
        false
    }
}

impl fmt::Display for OdidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .nodes
            .iter()
            .map(|n| match n {
                RangeNode::Value(v) => v.to_string(),
                RangeNode::Interval { from, to } => format!("{}-{}", from, to),
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_values() {
        let r = OdidRange::parse("1,3,6").unwrap();
        assert!(r.contains(1));
        assert!(r.contains(3));
        assert!(r.contains(6));
        assert!(!r.contains(2));
    }

    #[test]
    fn closed_interval() {
        let r = OdidRange::parse("1-5").unwrap();
        for i in 1..=5 {
            assert!(r.contains(i));
        }
        assert!(!r.contains(0));
        assert!(!r.contains(6));
    }

    #[test]
    fn open_lower_bound() {
        let r = OdidRange::parse("-5").unwrap();
        assert!(r.contains(0));
        assert!(r.contains(5));
        assert!(!r.contains(6));
    }

    #[test]
    fn open_upper_bound() {
        let r = OdidRange::parse("100-").unwrap();
        assert!(r.contains(100));
        assert!(r.contains(u32::MAX));
        assert!(!r.contains(99));
    }

    #[test]
    fn reversed_interval_is_format_error() {
        assert_eq!(OdidRange::parse("5-1"), Err(ParseError::ReversedInterval { from: 5, to: 1 }));
    }

    #[test]
    fn both_bounds_empty_is_malformed() {
        assert!(OdidRange::parse("-").is_err());
    }

    #[test]
    fn empty_expression_rejected() {
        assert_eq!(OdidRange::parse(""), Err(ParseError::Empty));
    }

    #[test]
    fn mixed_values_and_intervals() {
        let r = OdidRange::parse("1-5,10,20-25").unwrap();
        assert!(r.contains(3));
        assert!(r.contains(10));
        assert!(r.contains(22));
        assert!(!r.contains(15));
        assert!(!r.contains(30));
    }

    proptest::proptest! {
        #[test]
        fn contains_matches_naive_membership(
            lo in 0u32..1000, hi in 0u32..1000, x in 0u32..1000,
        ) {
            let (from, to) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            let expr = format!("{}-{}", from, to);
            let r = OdidRange::parse(&expr).unwrap();
            let naive = x >= from && x <= to;
            proptest::prop_assert_eq!(r.contains(x), naive);
        }
    }
}
