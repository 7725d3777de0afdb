use std::collections::BTreeMap as Map;
use std::env;

use serde::Deserialize;

use nullability::analysis::nullability::{analyze, NullabilityAnalysis};
use nullability::analysis::{Annotation, Globals, Routine};
use nullability::commons::Validate;
use nullability::bytecode::parser::parse;

// Routine metadata supplied next to the listing.
#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    params: Vec<String>,
    #[serde(default)]
    annotations: Map<String, Annotation>,
    #[serde(default)]
    globals: Globals,
}

pub fn run() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 {
        panic!("usage: nullcheck <listing> <meta.json>");
    }

    let listing_file_name = &args[1];
    let meta_file_name = &args[2];

    let output = nullcheck(listing_file_name, meta_file_name);
    println!("{output}");
}

fn main() {
    run();
}

fn nullcheck(listing_file_name: &str, meta_file_name: &str) -> String {
    let code = parse(&read_from(listing_file_name)).unwrap_or_else(|e| panic!("{e}"));
    let meta: Meta = serde_json::from_str(&read_from(meta_file_name))
        .unwrap_or_else(|e| panic!("could not parse {meta_file_name}: {e}"));

    let routine = Routine {
        name: meta.name.unwrap_or_else(|| "routine".to_string()),
        params: meta.params,
        annotations: meta.annotations,
        code,
    }
    .validate()
    .unwrap_or_else(|e| panic!("{e}"));

    let dfa = NullabilityAnalysis::new(&routine, &meta.globals);
    for diagnostic in &dfa.diagnostics {
        eprintln!("warning: {diagnostic}");
    }

    let solution = analyze(&routine, &meta.globals).unwrap_or_else(|e| panic!("{e}"));

    let mut s = String::new();
    s += &format!("{}:\n\n", routine.0.name);
    for instr in &routine.0.code {
        s += &format!("{instr}\n");
        if let Some(before) = solution.state.before.get(&instr.offset) {
            s += &format!("    before: {before}\n");
        }
        if let Some(after) = solution.state.after.get(&instr.offset) {
            s += &format!("    after:  {after}\n");
        }
    }
    s += &format!("\nreturns: {}\n", solution.summary);
    s
}

fn read_from(path: &str) -> String {
    String::from_utf8(
        std::fs::read(path).unwrap_or_else(|_| panic!("Could not read the input file {}", path)),
    )
    .expect("The input file does not contain valid utf-8 text")
}
