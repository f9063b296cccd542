//! The matcher: decides whether a concrete `Request` satisfies a prototype
//! built from a `RequestSpec`.
//!
//! Matching is a fixed sequence of gates over `Request`'s known fields,
//! each short-circuiting to `false` on the first mismatch, rather than
//! reflecting over whatever attributes happen to be set on the prototype.

use bson::{Bson, Document};

use crate::message::{Kind, Request, RequestSpec};

/// Wraps a prototype `Request` and matches candidate requests against it.
#[derive(Debug, Clone)]
pub struct Matcher {
    prototype: Request,
}

impl Matcher {
    pub fn new(spec: impl Into<RequestSpec>) -> Self {
        Self {
            prototype: spec.into().into_prototype(),
        }
    }

    pub fn prototype(&self) -> &Request {
        &self.prototype
    }

    /// Does `candidate` satisfy this matcher's prototype?
    pub fn matches(&self, candidate: &Request) -> bool {
        self.opcode_gate(candidate)
            && self.attribute_gate(candidate)
            && self.doc_count_gate(candidate)
            && self.doc_subset_gate(candidate)
            && self.order_gate(candidate)
    }

    /// Gate 1: a non-wildcard prototype's kind must be compatible with the
    /// candidate's. A `Command` prototype matches only `Command`
    /// candidates; any other concrete kind (`OpQuery`, `OpInsert`, ...)
    /// matches candidates of that exact wire opcode, which — since
    /// `Command` shares OP_QUERY's wire opcode — includes `Command`
    /// candidates too ("commands are queries, too").
    fn opcode_gate(&self, candidate: &Request) -> bool {
        match self.prototype.kind {
            Kind::Any => true,
            Kind::Command => candidate.kind == Kind::Command,
            other => other.wire_opcode() == candidate.kind.wire_opcode(),
        }
    }

    /// Gate 2: every non-`None`, non-document attribute the prototype set
    /// must equal the candidate's.
    fn attribute_gate(&self, candidate: &Request) -> bool {
        let p = &self.prototype;

        if let Some(ns) = &p.namespace {
            if candidate.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        if let Some(flags) = p.flags {
            if candidate.flags != Some(flags) {
                return false;
            }
        }
        if let Some(n) = p.num_to_skip {
            if candidate.num_to_skip != Some(n) {
                return false;
            }
        }
        if let Some(n) = p.num_to_return {
            if candidate.num_to_return != Some(n) {
                return false;
            }
        }
        if let Some(fields) = &p.fields {
            if candidate.fields.as_ref() != Some(fields) {
                return false;
            }
        }
        if let Some(id) = p.cursor_id {
            if candidate.cursor_id != Some(id) {
                return false;
            }
        }
        if let Some(ids) = &p.cursor_ids {
            if candidate.cursor_ids.as_ref() != Some(ids) {
                return false;
            }
        }
        true
    }

    /// Gate 3: if the prototype specified any docs, the candidate must have
    /// the same number of them.
    fn doc_count_gate(&self, candidate: &Request) -> bool {
        if self.prototype.docs.is_empty() {
            return true;
        }
        self.prototype.docs.len() == candidate.docs.len()
    }

    /// Gate 4: each prototype doc must be a key/value subset of the
    /// candidate doc at the same position. For a `Command` prototype, the
    /// first key (the command name) is compared case-insensitively; every
    /// other key/value pair compares exactly.
    fn doc_subset_gate(&self, candidate: &Request) -> bool {
        for (proto_doc, cand_doc) in self.prototype.docs.iter().zip(candidate.docs.iter()) {
            if !doc_is_subset(proto_doc, cand_doc, self.prototype.is_command()) {
                return false;
            }
        }
        true
    }

    /// Gate 5: the prototype doc's key order must appear as a subsequence
    /// of the candidate doc's key order (document ordering is preserved
    /// end to end, so this is always enforced, not conditional on an
    /// "ordered mapping" flag).
    fn order_gate(&self, candidate: &Request) -> bool {
        for (proto_doc, cand_doc) in self.prototype.docs.iter().zip(candidate.docs.iter()) {
            let proto_keys = normalized_keys(proto_doc, self.prototype.is_command());
            let cand_keys = normalized_keys(cand_doc, self.prototype.is_command());
            if !is_subsequence(&proto_keys, &cand_keys) {
                return false;
            }
        }
        true
    }
}

fn doc_is_subset(proto: &Document, candidate: &Document, case_insensitive_first_key: bool) -> bool {
    for (i, (key, value)) in proto.iter().enumerate() {
        let found = if i == 0 && case_insensitive_first_key {
            candidate
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        } else {
            candidate.get(key)
        };
        match found {
            Some(v) if bson_eq(v, value) => {}
            _ => return false,
        }
    }
    true
}

fn bson_eq(a: &Bson, b: &Bson) -> bool {
    a == b
}

/// The document's keys, with the first one lowercased when it stands for a
/// command name compared case-insensitively.
fn normalized_keys(doc: &Document, case_insensitive_first_key: bool) -> Vec<String> {
    doc.keys()
        .enumerate()
        .map(|(i, k)| {
            if i == 0 && case_insensitive_first_key {
                k.to_ascii_lowercase()
            } else {
                k.clone()
            }
        })
        .collect()
}

/// Is `needle` a (not necessarily contiguous) subsequence of `haystack`,
/// preserving relative order?
fn is_subsequence(needle: &[String], haystack: &[String]) -> bool {
    let mut hay = haystack.iter();
    needle.iter().all(|n| hay.any(|h| h == n))
}
