use mutator::bytecode::Module;
use mutator::config::{self, Isolation, MutationConfig};
use mutator::dispatcher::{self, Dispatcher, DispatcherConfig, InlineExecutor, RemoteDispatcher};
use mutator::output;
use mutator::report::MutationReport;
use mutator::runner::{self, MutationError, RunOutcome};
use mutator::state;
use mutator::suite::TestSuite;
use mutator::turtles::TurtleKind;
use mutator::worker;

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "mutator", version, about = "Mutation testing for bytecode modules")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Test suite whose module is mutated
    suite: PathBuf,
    /// Method to mutate (repeatable; default: every method with a body)
    #[arg(short, long)]
    method: Vec<String>,
    /// Mutation category to apply (repeatable; default: all)
    #[arg(short, long, value_enum)]
    turtle: Vec<TurtleKind>,
    /// Output JSON instead of human-readable text
    #[arg(long)]
    json: bool,
    /// Exit code only, no output
    #[arg(short, long)]
    quiet: bool,
    /// Multiplier applied to the baseline test time to get a mutant's budget
    #[arg(
        long,
        env = "MUTATOR_RUNTIME_MULTIPLIER",
        default_value_t = config::DEFAULT_RUNTIME_MULTIPLIER
    )]
    runtime_multiplier: f64,
    /// Budget for the unmutated baseline runs
    #[arg(long, default_value_t = config::DEFAULT_BASELINE_TIMEOUT_MS)]
    baseline_timeout_ms: u64,
    /// Number of worker processes (default: available parallelism)
    #[arg(long, env = "MUTATOR_POOL_SIZE")]
    pool_size: Option<usize>,
    /// Cap on simultaneously busy workers (default: pool size)
    #[arg(long, env = "MUTATOR_MAX_BUSY")]
    max_busy: Option<usize>,
    /// Use each worker process for one job only
    #[arg(long)]
    one_shot: bool,
    /// Where mutant tests execute
    #[arg(long, value_enum, default_value_t = Isolation::Pool)]
    isolation: Isolation,
    /// Pass when the score reaches this even with survivors (0.0 - 1.0)
    #[arg(long)]
    min_score: Option<f64>,
    /// Write the structured mutation report here
    #[arg(long)]
    report: Option<PathBuf>,
    /// Ignore source mappings (disables sequence point deletion)
    #[arg(long)]
    no_symbols: bool,
    /// Session ID for isolation (default: auto-generated). Agents should pass their own.
    #[arg(long)]
    session: Option<String>,
    /// Directory to create mutant scratch copies in (default: system temp dir)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run mutation testing against a test suite
    Run(RunArgs),
    /// Show details for a survived mutant by ref
    Show {
        /// Mutant ref (e.g. @m1 or m1)
        #[arg(name = "ref")]
        mutant_ref: String,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Summary of last run
    Status {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Merge mutation reports by structural union
    Merge {
        /// Reports to merge
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Merged report destination
        #[arg(short, long)]
        output: PathBuf,
        /// Output JSON summary
        #[arg(long)]
        json: bool,
    },
    /// List mutable methods with their covering tests, and the turtles
    List {
        suite: PathBuf,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Run jobs read from INBOUND and write verdicts to OUTBOUND ("-" for stdio)
    #[command(hide = true)]
    Worker { inbound: String, outbound: String },
    /// Broker jobs over a pool of worker processes ("-" for stdio; a COMMAND
    /// of "-" reads commands from INBOUND)
    #[command(hide = true)]
    Dispatch {
        inbound: String,
        outbound: String,
        command: String,
        pool_size: usize,
        #[arg(long)]
        max_busy: Option<usize>,
        #[arg(long)]
        one_shot: bool,
        #[arg(long, default_value_t = config::DEFAULT_TIMEOUT_GRACE_MS)]
        timeout_grace_ms: u64,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Show { mutant_ref, json } => cmd_show(mutant_ref, json),
        Commands::Status { json } => cmd_status(json),
        Commands::Merge {
            inputs,
            output,
            json,
        } => cmd_merge(inputs, output, json),
        Commands::List { suite, json } => cmd_list(suite, json),
        Commands::Worker { inbound, outbound } => cmd_worker(&inbound, &outbound),
        Commands::Dispatch {
            inbound,
            outbound,
            command,
            pool_size,
            max_busy,
            one_shot,
            timeout_grace_ms,
        } => cmd_dispatch(
            &inbound,
            &outbound,
            &command,
            pool_size,
            max_busy,
            one_shot,
            timeout_grace_ms,
        ),
    };

    process::exit(exit_code);
}

fn print_json<T: Serialize>(value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => {
            println!("{}", json);
            true
        }
        Err(e) => {
            output::print_error(&format!("Failed to serialize output: {}", e));
            false
        }
    }
}

fn open_input(handle: &str) -> io::Result<Box<dyn BufRead + Send>> {
    if handle == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(handle)?)))
    }
}

fn open_output(handle: &str) -> io::Result<Box<dyn Write + Send>> {
    if handle == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        Ok(Box::new(File::create(handle)?))
    }
}

fn build_config(args: &RunArgs) -> MutationConfig {
    let mut config = MutationConfig::new(&args.suite);
    config.methods = args.method.clone();
    if !args.turtle.is_empty() {
        config.turtles = args.turtle.clone();
    }
    config.runtime_multiplier = args.runtime_multiplier;
    config.baseline_timeout_ms = args.baseline_timeout_ms;
    if let Some(n) = args.pool_size {
        config.pool_size = n;
        config.max_busy = n;
    }
    if let Some(n) = args.max_busy {
        config.max_busy = n;
    }
    config.one_shot = args.one_shot;
    config.load_symbols = !args.no_symbols;
    config.isolation = args.isolation;
    config.min_score = args.min_score;
    config.scratch_root = args.scratch_dir.clone();
    if let Some(session) = &args.session {
        config.session = session.clone();
    }
    config
}

fn execute_run(config: &MutationConfig, report: &MutationReport) -> Result<RunOutcome, i32> {
    let result = match config.isolation {
        Isolation::InProcess => runner::run_mutation_tests(config, &InlineExecutor::new(), report),
        Isolation::Pool => {
            let pool = match Dispatcher::with_process_workers(config.dispatcher_config()) {
                Ok(d) => d,
                Err(e) => {
                    output::print_error(&format!("Failed to start workers: {}", e));
                    return Err(3);
                }
            };
            let result = runner::run_mutation_tests(config, &pool, report);
            pool.stop();
            result
        }
        Isolation::Subprocess => {
            let spawned = std::env::current_exe()
                .map_err(dispatcher::DispatchError::Spawn)
                .and_then(|exe| RemoteDispatcher::spawn(&exe, &config.dispatcher_config()));
            let remote = match spawned {
                Ok(d) => d,
                Err(e) => {
                    output::print_error(&format!("Failed to start dispatcher: {}", e));
                    return Err(3);
                }
            };
            let result = runner::run_mutation_tests(config, &remote, report);
            if result.is_ok() {
                if let Err(e) = remote.stop() {
                    log::warn!("dispatcher did not shut down cleanly: {}", e);
                }
            }
            result
        }
    };

    result.map_err(|e| {
        match &e {
            MutationError::BaselineFailed(detail) => output::print_error(&format!(
                "Tests fail before mutation. Fix failing tests first.\n{}",
                detail
            )),
            other => output::print_error(&other.to_string()),
        }
        match e {
            MutationError::Config(_)
            | MutationError::Load(_)
            | MutationError::UnknownMethod { .. } => 2,
            _ => 3,
        }
    })
}

fn cmd_run(args: RunArgs) -> i32 {
    if !args.suite.exists() {
        output::print_error(&format!(
            "Test suite not found: {}. Check the path and try again.",
            args.suite.display()
        ));
        return 2;
    }

    let config = build_config(&args);
    if let Err(e) = config.validate() {
        output::print_error(&e.to_string());
        return 2;
    }

    let report = MutationReport::new();
    let outcome = match execute_run(&config, &report) {
        Ok(outcome) => outcome,
        Err(code) => return code,
    };

    if let Some(path) = &args.report {
        if let Err(e) = report.save(path) {
            output::print_error(&e.to_string());
            return 3;
        }
    }

    let run_result = state::RunResult::from_outcome(&outcome);
    state::save_last_run(&run_result);
    let code = if run_result.passed { 0 } else { 1 };

    if args.quiet {
        return code;
    }

    if args.json {
        if !print_json(&run_result) {
            return 3;
        }
    } else {
        output::print_run_result(&run_result, &args.suite);
    }

    code
}

fn cmd_show(mutant_ref: String, json_mode: bool) -> i32 {
    let ref_id = mutant_ref.trim_start_matches('@');

    let last_run = match state::load_last_run() {
        Some(r) => r,
        None => {
            output::print_error("No previous run found. Run `mutator run` first.");
            return 2;
        }
    };

    match last_run.find(ref_id) {
        Some(m) => {
            if json_mode {
                if !print_json(m) {
                    return 3;
                }
            } else {
                output::print_mutant_detail(m);
            }
            0
        }
        None => {
            let valid: Vec<_> = last_run
                .survived_mutants
                .iter()
                .map(|m| format!("@{}", m.ref_id))
                .collect();
            output::print_error(&format!(
                "Mutant @{} not found. Valid refs: {}",
                ref_id,
                valid.join(", ")
            ));
            2
        }
    }
}

fn cmd_status(json_mode: bool) -> i32 {
    match state::load_last_run() {
        Some(result) => {
            if json_mode {
                if !print_json(&result) {
                    return 3;
                }
            } else {
                output::print_status(&result);
            }
            0
        }
        None => {
            output::print_error("No previous run found. Run `mutator run` first.");
            2
        }
    }
}

fn cmd_merge(inputs: Vec<PathBuf>, destination: PathBuf, json_mode: bool) -> i32 {
    let merged = MutationReport::new();
    for input in &inputs {
        match MutationReport::load(input) {
            Ok(report) => {
                let added = merged.merge(&report);
                log::info!("merged {} new mutants from {}", added, input.display());
            }
            Err(e) => {
                output::print_error(&e.to_string());
                return 2;
            }
        }
    }
    if let Err(e) = merged.save(&destination) {
        output::print_error(&e.to_string());
        return 3;
    }

    let summary = merged.summary();
    if json_mode {
        if !print_json(&summary) {
            return 3;
        }
    } else {
        output::print_success(&format!("Merged {} reports", inputs.len()));
        output::print_report_summary(&summary, &destination);
    }
    0
}

#[derive(Serialize)]
struct MethodListing {
    name: String,
    tests: Vec<String>,
}

#[derive(Serialize)]
struct TurtleListing {
    name: String,
    description: &'static str,
}

#[derive(Serialize)]
struct Listing {
    methods: Vec<MethodListing>,
    turtles: Vec<TurtleListing>,
}

fn cmd_list(suite_path: PathBuf, json_mode: bool) -> i32 {
    let loaded = TestSuite::load(&suite_path).and_then(|suite| {
        let module = Module::load(&suite.module_path(&suite_path)?, true)?;
        Ok((suite, module))
    });
    let (suite, mut module) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            output::print_error(&e.to_string());
            return 2;
        }
    };
    module.simplify();

    let listing = Listing {
        methods: module
            .mutable_methods()
            .into_iter()
            .map(|name| MethodListing {
                tests: suite.resolve_tests(&module, &name),
                name,
            })
            .collect(),
        turtles: TurtleKind::ALL
            .iter()
            .map(|kind| TurtleListing {
                name: kind
                    .to_possible_value()
                    .map(|v| v.get_name().to_string())
                    .unwrap_or_default(),
                description: kind.strategy().description(),
            })
            .collect(),
    };

    if json_mode {
        return if print_json(&listing) { 0 } else { 3 };
    }

    println!("Methods in {}:", module.name);
    for method in &listing.methods {
        output::print_method_listing(&method.name, &method.tests);
    }
    println!();
    println!("Turtles:");
    for turtle in &listing.turtles {
        println!("  {:<16} {}", turtle.name, turtle.description);
    }
    0
}

fn cmd_worker(inbound: &str, outbound: &str) -> i32 {
    let (mut input, mut output) = match (open_input(inbound), open_output(outbound)) {
        (Ok(input), Ok(output)) => (input, output),
        (Err(e), _) | (_, Err(e)) => {
            log::error!("worker could not open its channels: {}", e);
            return 2;
        }
    };
    match worker::serve(&mut *input, &mut *output) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("worker channel failed: {}", e);
            1
        }
    }
}

fn cmd_dispatch(
    inbound: &str,
    outbound: &str,
    command: &str,
    pool_size: usize,
    max_busy: Option<usize>,
    one_shot: bool,
    timeout_grace_ms: u64,
) -> i32 {
    if pool_size == 0 {
        output::print_error("Pool size must be at least 1.");
        return 2;
    }
    let config = DispatcherConfig {
        pool_size,
        max_busy: max_busy.unwrap_or(pool_size),
        one_shot,
        timeout_grace_ms,
        ..DispatcherConfig::default()
    };

    let channels = open_input(inbound).and_then(|input| {
        let output = open_output(outbound)?;
        let commands = if command == "-" {
            None
        } else {
            Some(open_input(command)?)
        };
        Ok((input, output, commands))
    });
    let (input, output, commands) = match channels {
        Ok(channels) => channels,
        Err(e) => {
            log::error!("dispatcher could not open its channels: {}", e);
            return 2;
        }
    };

    let broker = match Dispatcher::with_process_workers(config) {
        Ok(d) => d,
        Err(e) => {
            log::error!("{}", e);
            return 3;
        }
    };
    match dispatcher::serve(broker, input, output, commands) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("dispatcher failed: {}", e);
            3
        }
    }
}
