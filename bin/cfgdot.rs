use std::env;

use nullability::bytecode::cfg;
use nullability::bytecode::parser::parse;

pub fn run() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        panic!("usage: cfgdot <listing> [name]");
    }

    let listing_file_name = &args[1];
    let name = args.get(2).map(String::as_str).unwrap_or("cfg").to_string();

    let instrs = parse(&read_from(listing_file_name)).unwrap_or_else(|e| panic!("{e}"));
    let cfg = cfg::build(&instrs).unwrap_or_else(|e| panic!("{e}"));
    println!("{}", cfg.dot(&name));
}

fn main() {
    run();
}

fn read_from(path: &str) -> String {
    String::from_utf8(
        std::fs::read(path).unwrap_or_else(|_| panic!("Could not read the input file {}", path)),
    )
    .expect("The input file does not contain valid utf-8 text")
}
