//! Seed corpora and byte mutators for the no-5xx property
//!
//! Mutation is driven by a seeded `StdRng`, so a failing input can be
//! regenerated from the seed printed alongside it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

/// Fragments that tend to upset template engines and JSON decoders
const TOKENS: &[&[u8]] = &[
    b"{{",
    b"}}",
    b"{%",
    b"%}",
    b"{% for x in y %}",
    b"{% endfor %}",
    b"{{ x|filter:\"",
    b"\0",
    b"\xff\xfe",
    b"\xef\xbf\xbd",
    b"\"",
    b"\\",
    b"null",
    b"[[[[[[[[",
    b"]]]]]]]]",
    b"{\"$where\":\"1\"}",
    b"../../../../etc/passwd",
    b"%s%s%s%n",
    b"1e309",
    b"-0",
];

/// Template bodies, well-formed and not
pub fn template_seeds() -> Vec<Vec<u8>> {
    [
        "Report generated",
        "{{ account.id }}",
        "{% for a in ledger.account %}{{ a.id }};{{ a.status }}\n{% endfor %}",
        "{% if x %}unterminated",
        "{{ }}",
        "{{ a.b.c.d.e.f.g.h }}",
        "{% for %}{% endfor %}",
        "<html><body>{{ report.title|upper }}</body></html>",
        "id,name\n{% for r in db.table %}{{ r.id }},{{ r.name }}\n{% endfor %}",
        "<?xml version=\"1.0\"?><root>{{ x }}</root>",
        "{{ \"\\u0000\" }}",
        "",
    ]
    .iter()
    .map(|s| s.as_bytes().to_vec())
    .collect()
}

/// `POST /v1/reports` bodies, well-formed and not
pub fn report_payload_seeds() -> Vec<Value> {
    vec![
        json!({"templateId": "00000000-0000-0000-0000-000000000000"}),
        json!({"templateId": "not-a-uuid"}),
        json!({"templateId": ""}),
        json!({"templateId": 42}),
        json!({"templateId": null, "filters": null}),
        json!({
            "templateId": "0190b0f2-d6b9-7c3c-8f1e-2a3b4c5d6e7f",
            "filters": {"db": {"table": {"field": {"eq": ["x"]}}}}
        }),
        json!({
            "templateId": "0190b0f2-d6b9-7c3c-8f1e-2a3b4c5d6e7f",
            "filters": {"db": {"table": {"field": {"between": [1]}}}}
        }),
        json!({
            "templateId": "0190b0f2-d6b9-7c3c-8f1e-2a3b4c5d6e7f",
            "filters": {"db": {"table": {"field": {"in": [true, 1.5, "a", null]}}}}
        }),
        json!({"filters": {"": {"": {"": {}}}}}),
        json!([]),
        json!("templateId"),
    ]
}

/// `depth` levels of nested arrays around a scalar
pub fn deep_nesting(depth: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(depth * 2 + 1);
    out.extend(std::iter::repeat(b'[').take(depth));
    out.push(b'1');
    out.extend(std::iter::repeat(b']').take(depth));
    out
}

/// Byte-level mutator
#[derive(Debug)]
pub struct Mutator {
    rng: StdRng,
}

impl Mutator {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Apply one to four random edits to `input`
    pub fn mutate(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = input.to_vec();
        let edits = self.rng.gen_range(1..=4);
        for _ in 0..edits {
            self.edit(&mut out);
        }
        out
    }

    fn edit(&mut self, out: &mut Vec<u8>) {
        match self.rng.gen_range(0..6) {
            0 if !out.is_empty() => {
                let i = self.rng.gen_range(0..out.len());
                out[i] ^= 1 << self.rng.gen_range(0..8);
            }
            1 => {
                let i = self.rng.gen_range(0..=out.len());
                out.insert(i, self.rng.gen());
            }
            2 if !out.is_empty() => {
                let i = self.rng.gen_range(0..out.len());
                out.remove(i);
            }
            3 if !out.is_empty() => {
                let start = self.rng.gen_range(0..out.len());
                let end = self.rng.gen_range(start..=out.len());
                let chunk = out[start..end].to_vec();
                out.splice(end..end, chunk);
            }
            4 if !out.is_empty() => {
                let at = self.rng.gen_range(0..out.len());
                out.truncate(at);
            }
            _ => {
                let token = TOKENS[self.rng.gen_range(0..TOKENS.len())];
                let i = self.rng.gen_range(0..=out.len());
                out.splice(i..i, token.iter().copied());
            }
        }
    }

    /// `count` mutants drawn from random seeds
    pub fn generate(&mut self, seeds: &[Vec<u8>], count: usize) -> Vec<Vec<u8>> {
        if seeds.is_empty() {
            return Vec::new();
        }
        (0..count)
            .map(|_| {
                let seed = &seeds[self.rng.gen_range(0..seeds.len())];
                self.mutate(seed)
            })
            .collect()
    }
}
