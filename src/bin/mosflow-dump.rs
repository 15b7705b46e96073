// Copyright (c) 2017-2021 Fabian Schuiki

#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

use anyhow::{anyhow, Context, Result};
use clap::Arg;
use itertools::Itertools;
use mosflow::{
    analysis::DOMINATOR_TREE_TIME, parse_listing, pipeline::analyze, structure::STRUCTURING_TIME,
    verifier::VerifyFlags, PassContext, ProgramAnalysis,
};
use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    sync::atomic::Ordering,
};

fn main() {
    match main_inner() {
        Ok(_) => (),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn main_inner() -> Result<()> {
    let matches = app_from_crate!()
        .about("Recovers and structures the control flow of decoded 6502 listings.")
        .arg(
            Arg::with_name("verbosity")
                .short("v")
                .multiple(true)
                .help("Increase message verbosity")
                .long_help(HELP_VERBOSITY),
        )
        .arg(
            Arg::with_name("input")
                .help("Listing file to analyze")
                .required(true),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .takes_value(true)
                .help("File to write output to; stdout if omitted"),
        )
        .arg(
            Arg::with_name("time-passes")
                .short("t")
                .long("time")
                .help("Print execution time statistics per stage"),
        )
        .arg(
            Arg::with_name("single-threaded")
                .short("s")
                .long("no-parallel")
                .help("Do not parallelize execution"),
        )
        .arg(
            Arg::with_name("no-verify")
                .long("no-verify")
                .help("Do not check the analysis results for consistency"),
        )
        .arg(
            Arg::with_name("dump")
                .short("d")
                .long("dump")
                .value_name("WHAT")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .possible_values(&[
                    "blocks", "calls", "cfg", "dom", "loops", "conds", "regions", "code",
                ])
                .help("Results to print; structured code if omitted")
                .long_help(HELP_DUMP),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Print all results as JSON"),
        )
        .get_matches();

    // Configure the logger.
    let verbose = std::cmp::max(1, matches.occurrences_of("verbosity") as usize) - 1;
    let quiet = !matches.is_present("verbosity");
    stderrlog::new()
        .module("mosflow")
        .module("mosflow_dump")
        .quiet(quiet)
        .verbosity(verbose)
        .init()?;

    let ctx = PassContext {
        parallel: !matches.is_present("single-threaded"),
        verify: if matches.is_present("no-verify") {
            VerifyFlags::empty()
        } else {
            VerifyFlags::ALL
        },
    };

    // Prepare the time tracking.
    let mut times = vec![];
    let tinit = time::precise_time_ns();

    // Read the input.
    let t0 = time::precise_time_ns();
    let prog = {
        let path = matches
            .value_of("input")
            .ok_or_else(|| anyhow!("no input file"))?;
        let mut contents = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut contents))
            .with_context(|| format!("cannot read `{}`", path))?;
        parse_listing(&contents).with_context(|| format!("cannot parse `{}`", path))?
    };
    let t1 = time::precise_time_ns();
    times.push(("parse".to_owned(), t1 - t0));

    // Run the analyses.
    let t0 = time::precise_time_ns();
    let analysis = analyze(&ctx, &prog)?;
    let t1 = time::precise_time_ns();
    times.push(("analyze".to_owned(), t1 - t0));

    // Write the output.
    let t0 = time::precise_time_ns();
    let mut output: Box<dyn Write> = match matches.value_of("output") {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("cannot create `{}`", path))?;
            Box::new(BufWriter::with_capacity(1 << 20, file))
        }
        None => Box::new(std::io::stdout()),
    };
    if matches.is_present("json") {
        serde_json::to_writer_pretty(&mut output, &analysis)?;
        writeln!(output)?;
    } else {
        let dumps: Vec<&str> = match matches.values_of("dump") {
            Some(values) => values.collect(),
            None => vec!["code"],
        };
        dump(&mut output, &analysis, &dumps)?;
    }
    output.flush()?;
    let t1 = time::precise_time_ns();
    times.push(("output".to_owned(), t1 - t0));

    // Final time stat.
    let tfinal = time::precise_time_ns();
    times.push(("total".to_owned(), tfinal - tinit));

    // Print execution time statistics if requested by the user.
    if matches.is_present("time-passes") {
        eprintln!("Execution Time Statistics:");
        for (mut name, ns) in times {
            name.push(':');
            eprintln!("  {:10}  {:8.3} ms", name, ns as f64 * 1.0e-6);
        }
        eprintln!("");
        eprintln!("Structure Statistics:");
        eprintln!(
            "  Dominator Tree Construction: {:8.3} ms",
            DOMINATOR_TREE_TIME.load(Ordering::SeqCst) as f64 * 1.0e-6
        );
        eprintln!(
            "  Structuring:                 {:8.3} ms",
            STRUCTURING_TIME.load(Ordering::SeqCst) as f64 * 1.0e-6
        );
    }

    // Report functions that could not be analyzed.
    let failed = analysis.failed().count();
    if failed > 0 {
        for err in analysis.failed() {
            error!("{}", err);
        }
        return Err(anyhow!("analysis of {} function(s) failed", failed));
    }

    info!("Used {} rayon worker threads", rayon::current_num_threads());
    Ok(())
}

fn dump(out: &mut dyn Write, analysis: &ProgramAnalysis, what: &[&str]) -> Result<()> {
    if what.contains(&"blocks") {
        writeln!(out, "; blocks")?;
        write!(out, "{}", analysis.blocks)?;
        if !analysis.reach.dead().is_empty() {
            writeln!(
                out,
                "; unreachable: {}",
                analysis.reach.dead().iter().join(", ")
            )?;
        }
    }
    if what.contains(&"calls") {
        writeln!(out, "; call graph")?;
        write!(out, "{}", analysis.calls)?;
    }
    for entry in &analysis.cfg.unmapped {
        writeln!(out, "; unmapped entry {:?}", entry)?;
    }
    if !analysis.cfg.shared.is_empty() {
        writeln!(
            out,
            "; blocks in several functions: {}",
            analysis.cfg.shared.iter().join(", ")
        )?;
    }
    for func in analysis.analyzed() {
        let name = func.cfg.display_name();
        for &w in what {
            match w {
                "cfg" => write!(out, "{}", func.cfg)?,
                "dom" => write!(out, "; dominators of {}\n{}", name, func.domtree)?,
                "loops" => write!(out, "; loops of {}\n{}", name, func.loops)?,
                "conds" => write!(out, "; conditionals of {}\n{}", name, func.conds)?,
                "regions" => write!(out, "; regions of {}\n{}", name, func.regions)?,
                "code" => {
                    let stats = func.structure.stats();
                    writeln!(
                        out,
                        "{}() {{ // {} blocks, {} loops, {} ifs, {} gotos, {} unresolved",
                        name, stats.blocks, stats.loops, stats.ifs, stats.gotos, stats.unresolved
                    )?;
                    for line in func.structure.to_string().lines() {
                        writeln!(out, "    {}", line)?;
                    }
                    writeln!(out, "}}")?;
                }
                _ => (),
            }
        }
    }
    Ok(())
}

static HELP_VERBOSITY: &str = "Increase message verbosity

This option can be specified multiple times to increase the level of verbosity \
in the output:

-v      Only print errors
-vv     Also print warnings
-vvv    Also print info messages
-vvvv   Also print debug messages
-vvvvv  Also print detailed tracing messages
";

static HELP_DUMP: &str = "Results to print

This option can be specified multiple times. The admissible values are as \
follows:

blocks      Basic blocks and unreachable instructions
calls       Call graph with call cycles
cfg         Function control flow graphs
dom         Dominator trees with frontiers and back edges
loops       Natural loops
conds       Conditionals
regions     Region trees
code        Structured code
";
