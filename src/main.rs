//! The `weft` command-line tool.
//!
//! Thin driver over [`weft::database::Database`]: read the input documents,
//! run one subcommand, and report any failure as a single
//! `name:line:col: message` line (preceded by an annotated source snippet
//! for parse errors) with exit status 1.

use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use log::{info, LevelFilter};
use std::fs;
use std::io;
use std::io::{Read, Write};
use std::path::Path;
use std::process;
use weft::config::{DbOptions, Delimiter};
use weft::database::Database;
use weft::diag::WeftError;

fn input_arg() -> Arg<'static, 'static> {
    Arg::with_name("INPUT")
        .help("Literate source documents, in threading order")
        .required(true)
        .multiple(true)
}

fn delimiter_arg() -> Arg<'static, 'static> {
    Arg::with_name("delimiter")
        .long("delimiter")
        .takes_value(true)
        .value_name("CLASS")
        .possible_values(&["ignore", "chevron", "brace", "bracket", "paren"])
        .help("Override every block's declared placeholder delimiter")
}

fn main() {
    let app = App::new("weft")
        .version(crate_version!())
        .about("A literate programming tangle engine")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .global(true)
                .help("Increase log verbosity (repeatable)"),
        )
        .arg(
            Arg::with_name("timing")
                .long("timing")
                .global(true)
                .help("Log how long each pass takes"),
        )
        .subcommand(
            SubCommand::with_name("tangle")
                .about("Reconstruct every declared output file")
                .arg(input_arg())
                .arg(delimiter_arg())
                .arg(
                    Arg::with_name("allow-absolute-paths")
                        .long("allow-absolute-paths")
                        .help("Permit output paths beginning with '/' or '~'"),
                )
                .arg(
                    Arg::with_name("omit-trailing-newline")
                        .long("omit-trailing-newline")
                        .help("Do not end output files with a newline"),
                )
                .arg(
                    Arg::with_name("output-dir")
                        .long("output-dir")
                        .takes_value(true)
                        .value_name("DIR")
                        .help("Directory output paths are resolved against"),
                ),
        )
        .subcommand(
            SubCommand::with_name("ls")
                .about("List declared output files or tags")
                .arg(input_arg())
                .arg(delimiter_arg())
                .arg(
                    Arg::with_name("list-files")
                        .long("list-files")
                        .help("List output files (the default)"),
                )
                .arg(
                    Arg::with_name("list-tags")
                        .long("list-tags")
                        .help("List tags instead of files"),
                ),
        )
        .subcommand(
            SubCommand::with_name("call")
                .about("Expand files or tags to standard output")
                .arg(input_arg())
                .arg(delimiter_arg())
                .arg(
                    Arg::with_name("file")
                        .long("file")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .value_name("PATH")
                        .help("An output file to expand (repeatable)"),
                )
                .arg(
                    Arg::with_name("tag")
                        .long("tag")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .value_name("NAME")
                        .help("A tag to expand (repeatable)"),
                ),
        )
        .subcommand(
            SubCommand::with_name("find")
                .about("Report where tags are defined")
                .arg(input_arg())
                .arg(
                    Arg::with_name("tag")
                        .long("tag")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .value_name("NAME")
                        .required(true)
                        .help("A tag to look up (repeatable)"),
                ),
        )
        .subcommand(
            SubCommand::with_name("init")
                .about("Write a starter literate document")
                .arg(
                    Arg::with_name("stdin")
                        .long("stdin")
                        .help("Wrap standard input as the initial block body"),
                )
                .arg(Arg::with_name("PATH").help("File to create; standard output when absent")),
        );
    #[cfg(feature = "dot")]
    let app = app.subcommand(
        SubCommand::with_name("graph")
            .about("Render the call graph of a file or tag as DOT")
            .arg(input_arg())
            .arg(
                Arg::with_name("file")
                    .long("file")
                    .takes_value(true)
                    .value_name("PATH")
                    .help("Graph the named output file"),
            )
            .arg(
                Arg::with_name("tag")
                    .long("tag")
                    .takes_value(true)
                    .value_name("NAME")
                    .help("Graph the named tag"),
            ),
    );
    let matches = app.get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .unwrap();

    process::exit(run(&matches));
}

fn run(matches: &ArgMatches) -> i32 {
    let result = match matches.subcommand() {
        ("tangle", Some(sub)) => cmd_tangle(matches, sub),
        ("ls", Some(sub)) => cmd_ls(matches, sub),
        ("call", Some(sub)) => cmd_call(matches, sub),
        ("find", Some(sub)) => cmd_find(matches, sub),
        #[cfg(feature = "dot")]
        ("graph", Some(sub)) => cmd_graph(matches, sub),
        ("init", Some(sub)) => cmd_init(sub),
        _ => unreachable!("a subcommand is required"),
    };
    match result {
        Ok(()) => 0,
        Err(error) => {
            report(&error);
            1
        }
    }
}

fn report(error: &WeftError) {
    if let WeftError::Parse { snippet, .. } = error {
        if !snippet.is_empty() {
            eprintln!("{}", snippet);
        }
    }
    eprintln!("{}", error);
}

fn options_from(matches: &ArgMatches, sub: &ArgMatches) -> DbOptions {
    let delimiter = sub.value_of("delimiter").map(|value| {
        value
            .parse::<Delimiter>()
            .expect("clap restricts the delimiter values")
    });
    DbOptions {
        delimiter,
        allow_absolute_paths: sub.is_present("allow-absolute-paths"),
        omit_trailing_newline: sub.is_present("omit-trailing-newline"),
        timing: matches.is_present("timing"),
    }
}

/// Reads and parses every input document, in order.
fn load(sub: &ArgMatches, options: DbOptions) -> Result<Database, WeftError> {
    let mut db = Database::new(options);
    for path in sub.values_of("INPUT").into_iter().flatten() {
        let text = fs::read(path)?;
        db.parse_with_snippet(path, text)?;
    }
    Ok(db)
}

fn cmd_tangle(matches: &ArgMatches, sub: &ArgMatches) -> Result<(), WeftError> {
    let mut db = load(sub, options_from(matches, sub))?;
    let root = sub.value_of("output-dir").unwrap_or(".");
    for path in db.tangle(Path::new(root))? {
        info!("wrote {}", path.display());
    }
    Ok(())
}

fn cmd_ls(matches: &ArgMatches, sub: &ArgMatches) -> Result<(), WeftError> {
    let mut db = load(sub, options_from(matches, sub))?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if sub.is_present("list-tags") {
        for listing in db.list_tags()? {
            writeln!(out, "{}", listing.name)?;
        }
    }
    if sub.is_present("list-files") || !sub.is_present("list-tags") {
        for listing in db.list_files()? {
            writeln!(out, "{}", listing.name)?;
        }
    }
    Ok(())
}

fn cmd_call(matches: &ArgMatches, sub: &ArgMatches) -> Result<(), WeftError> {
    let mut db = load(sub, options_from(matches, sub))?;
    let stdout = io::stdout();
    for name in sub.values_of("file").into_iter().flatten() {
        db.call_file(name, stdout.lock())?;
    }
    for name in sub.values_of("tag").into_iter().flatten() {
        db.call_tag(name, stdout.lock())?;
    }
    Ok(())
}

fn cmd_find(matches: &ArgMatches, sub: &ArgMatches) -> Result<(), WeftError> {
    let mut db = load(sub, options_from(matches, sub))?;
    let names: Vec<&str> = sub.values_of("tag").into_iter().flatten().collect();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for row in db.find_tags(&names)? {
        writeln!(out, "{}:{}: {}", row.object, row.location, row.name)?;
    }
    Ok(())
}

#[cfg(feature = "dot")]
fn cmd_graph(matches: &ArgMatches, sub: &ArgMatches) -> Result<(), WeftError> {
    let mut db = load(sub, options_from(matches, sub))?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Some(name) = sub.value_of("file") {
        write!(out, "{}", db.graph_file(name)?)?;
    }
    if let Some(name) = sub.value_of("tag") {
        write!(out, "{}", db.graph_tag(name)?)?;
    }
    Ok(())
}

fn block_into(doc: &mut String, header: &str, body: &[&str]) {
    doc.push_str(&format!(
        "    {}\n    {}\n\n",
        header,
        "-".repeat(header.len())
    ));
    for line in body {
        doc.push_str("    ");
        doc.push_str(line);
        doc.push('\n');
    }
}

fn cmd_init(sub: &ArgMatches) -> Result<(), WeftError> {
    let mut doc = String::from(
        "A literate document is prose with embedded code blocks.  A block\n\
         starts after a blank line, indented four spaces, with a header\n\
         naming its language, escape delimiters, and target.\n\n",
    );
    if sub.is_present("stdin") {
        let mut input = String::new();
        io::stdin().read_to_string(&mut input)?;
        let lines: Vec<&str> = input.lines().collect();
        block_into(&mut doc, "lang: text esc: none file: out.txt", &lines);
    } else {
        block_into(
            &mut doc,
            "lang: text esc: <<>> file: hello.txt",
            &["<<greeting>>, world."],
        );
        doc.push('\n');
        block_into(
            &mut doc,
            "lang: text esc: none tag: #greeting",
            &["Hello"],
        );
    }
    match sub.value_of("PATH") {
        Some(path) => fs::write(path, doc)?,
        None => io::stdout().write_all(doc.as_bytes())?,
    }
    Ok(())
}
