// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Declarative route table
//!
//! Patterns are slash-delimited. `*` matches exactly one segment, `**`
//! matches the (non-empty) remainder and must come last. When several
//! patterns match, the most specific wins, compared segment by segment:
//! literal beats `*` beats `**`.

use axum::http::Method;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },

    #[error("No route for {method} {path}")]
    NotFound { method: Method, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Rest,
}

impl Segment {
    fn rank(&self) -> u8 {
        match self {
            Segment::Literal(_) => 2,
            Segment::One => 1,
            Segment::Rest => 0,
        }
    }
}

struct Route<H> {
    method: Method,
    pattern: String,
    segments: Vec<Segment>,
    handler: H,
}

/// A resolved route; `params` holds the wildcard captures in order
#[derive(Debug)]
pub struct RouteMatch<'a, H> {
    pub handler: &'a H,
    pub params: Vec<String>,
}

impl<H> RouteMatch<'_, H> {
    pub fn param(&self, index: usize) -> &str {
        self.params.get(index).map(String::as_str).unwrap_or("")
    }
}

pub struct RouteTable<H> {
    routes: Vec<Route<H>>,
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> RouteTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, method: Method, pattern: &str, handler: H) -> Result<(), RouteError> {
        let segments = parse_pattern(pattern)?;
        self.routes.push(Route {
            method,
            pattern: pattern.trim_matches('/').to_string(),
            segments,
            handler,
        });
        Ok(())
    }

    /// Builder form of [`add`](Self::add) for static tables
    pub fn route(mut self, method: Method, pattern: &str, handler: H) -> Result<Self, RouteError> {
        self.add(method, pattern, handler)?;
        Ok(self)
    }

    pub fn find(&self, method: &Method, path: &str) -> Result<RouteMatch<'_, H>, RouteError> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let mut best: Option<(&Route<H>, Vec<String>)> = None;

        for route in self.routes.iter().filter(|r| &r.method == method) {
            let Some(params) = match_segments(&route.segments, &parts) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => {
                    compare_specificity(&route.segments, &current.segments) == Ordering::Greater
                }
            };
            if better {
                best = Some((route, params));
            }
        }

        best.map(|(route, params)| RouteMatch {
            handler: &route.handler,
            params,
        })
        .ok_or_else(|| RouteError::NotFound {
            method: method.clone(),
            path: path.to_string(),
        })
    }

    /// `"<METHOD> <pattern>"` for every registered route
    pub fn endpoints(&self) -> Vec<String> {
        self.routes
            .iter()
            .map(|r| format!("{} {}", r.method, r.pattern))
            .collect()
    }
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    let invalid = |reason| RouteError::InvalidPattern {
        pattern: pattern.to_string(),
        reason,
    };
    let raw: Vec<&str> = pattern.split('/').filter(|p| !p.is_empty()).collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (index, part) in raw.iter().enumerate() {
        let segment = match *part {
            "*" => Segment::One,
            "**" if index + 1 == raw.len() => Segment::Rest,
            "**" => return Err(invalid("'**' must be the last segment")),
            p if p.contains('*') => return Err(invalid("wildcards must span a whole segment")),
            p => Segment::Literal(p.to_string()),
        };
        segments.push(segment);
    }
    Ok(segments)
}

fn match_segments(segments: &[Segment], parts: &[&str]) -> Option<Vec<String>> {
    let mut params = Vec::new();
    for (index, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Rest => {
                let rest = parts.get(index..).filter(|r| !r.is_empty())?;
                params.push(rest.join("/"));
                return Some(params);
            }
            Segment::One => params.push(parts.get(index)?.to_string()),
            Segment::Literal(literal) => {
                if parts.get(index) != Some(&literal.as_str()) {
                    return None;
                }
            }
        }
    }
    (segments.len() == parts.len()).then_some(params)
}

fn compare_specificity(a: &[Segment], b: &[Segment]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.rank().cmp(&y.rank()) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
