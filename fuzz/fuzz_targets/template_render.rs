//! Structured fuzz target for rendering.
//!
//! Builds small templates from fragments and checks that every bound value
//! gets exactly one placeholder.
//!
//! Run with:
//! ```bash
//! cargo +nightly fuzz run fuzz_template_render
//! ```

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pgstencil_template::{Renderer, to_params};
use serde_json::json;

#[derive(Debug, Arbitrary)]
enum Fragment {
    Text(String),
    Output(u8),
    Inclause,
    IfFlag(Vec<Fragment>),
    ForItems,
}

#[derive(Debug, Arbitrary)]
struct FuzzTemplate {
    fragments: Vec<Fragment>,
    flag: bool,
    items: Vec<i32>,
}

fn emit(fragment: &Fragment, out: &mut String, depth: usize) {
    match fragment {
        Fragment::Text(text) => {
            let clean: String = text
                .chars()
                .filter(|c| !matches!(c, '{' | '}' | '%' | '#' | '$'))
                .take(32)
                .collect();
            out.push_str(&clean);
        }
        Fragment::Output(n) => out.push_str(&format!("{{{{ v{} }}}}", n % 4)),
        Fragment::Inclause => out.push_str("{% if items %}{{ items | inclause }}{% endif %}"),
        Fragment::IfFlag(inner) if depth < 4 => {
            out.push_str("{% if flag %}");
            for f in inner {
                emit(f, out, depth + 1);
            }
            out.push_str("{% endif %}");
        }
        Fragment::IfFlag(_) => {}
        Fragment::ForItems => out.push_str("{% for i in items %}{{ i }}{% endfor %}"),
    }
}

fuzz_target!(|input: FuzzTemplate| {
    let mut source = String::new();
    for fragment in &input.fragments {
        emit(fragment, &mut source, 0);
    }

    let params = to_params(&json!({
        "v0": 0, "v1": "one", "v2": null, "v3": [1, 2],
        "flag": input.flag,
        "items": input.items,
    }))
    .unwrap();

    let statement = Renderer::new()
        .render(&source, &params, None)
        .expect("generated templates are valid");

    let placeholders = (1..=statement.params().len())
        .filter(|i| statement.sql().contains(&format!("${i}")))
        .count();
    assert_eq!(placeholders, statement.params().len());
});
