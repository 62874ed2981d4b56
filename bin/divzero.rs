// Divide-by-zero checker driver: reads a JSON-encoded lir program, runs
// the analysis on every function, and reports each division whose divisor
// may be zero together with the abstract state it was reached in.

use std::io::{BufWriter, Write};

use clap::Parser;

use divzero::commons::Valid;
use divzero::middle_end::analysis::divzero::{analyze, analyze_with_pointers, check};
use divzero::middle_end::analysis::pointer::FlowInsensitivePointerInfo;
use divzero::middle_end::analysis::stmt_at;
use divzero::middle_end::lir::*;

// Command-line arguments
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// JSON-encoded lir program to check
    input_file: String,
    /// Write the report here instead of stdout
    #[arg(short, long)]
    output_file: Option<String>,
    /// Check only this function
    #[arg(short, long)]
    function: Option<String>,
    /// Model memory through a flow-insensitive may-alias oracle
    #[arg(short, long)]
    pointers: bool,
}

fn report(program: &Valid<Program>, use_pointers: bool, only: Option<&str>) -> String {
    let mut w = BufWriter::new(Vec::new());

    for (fid, f) in &program.0.functions {
        if only.is_some_and(|name| name != fid.name()) {
            continue;
        }

        let (in_map, _) = if use_pointers {
            let oracle = FlowInsensitivePointerInfo::new(f);
            analyze_with_pointers(program, fid.clone(), &oracle)
        } else {
            analyze(program, fid.clone())
        };

        let flagged = check(f, &in_map);

        writeln!(w, "{fid}: {} possible division(s) by zero", flagged.len()).unwrap();

        for id in &flagged {
            let (bb, idx) = id;
            writeln!(w, "  at {bb}.{idx}: {}", stmt_at(f, id)).unwrap();
            writeln!(w, "  in-state:\n{}", in_map[id]).unwrap();
        }

        writeln!(w).unwrap();
    }

    String::from_utf8(w.into_inner().unwrap()).unwrap()
}

pub fn main() {
    env_logger::init();

    let args = Args::parse();
    let input_file = args.input_file.as_str();

    let read = |input_file: &str| {
        String::from_utf8(
            std::fs::read(input_file)
                .unwrap_or_else(|_| panic!("Could not read the input file {}", input_file)),
        )
        .expect("The input file does not contain valid utf-8 text")
    };

    let input_program: Valid<Program> = serde_json::from_str::<Program>(&read(input_file))
        .unwrap_or_else(|e| panic!("Could not parse the input file {}: {}", input_file, e))
        .validate()
        .unwrap_or_else(|e| panic!("Invalid input program: {}", e));

    let output = report(&input_program, args.pointers, args.function.as_deref());

    match &args.output_file {
        Some(output_file) => {
            std::fs::write(output_file, output).unwrap_or_else(|_| {
                panic!("Failed to write the report to the output file: {}", output_file)
            });
        }
        None => print!("{output}"),
    }
}
