use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use reachtree::bmc::{Bmc, BmcConfig, Verdict};
use reachtree::ir::{Endianness, GotoProgram};
use reachtree::parser::parse_file;
use reachtree::smt::portfolio::PortfolioConfig;
use reachtree::smt::select::SelectionStrategy;
use reachtree::smt::{BackendKind, ProgramGraph, Query, SolverConfig};
use reachtree::symex::{ExploreConfig, InterleavingPolicy, ReachabilityTree, slice};

// --- Command Line Arguments ---

#[derive(Parser)]
#[command(name = "reachtree")]
#[command(about = "reachtree - bounded model checker for multi-threaded goto programs")]
#[command(version)]
#[command(subcommand_required = true)]
#[command(arg_required_else_help = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

/// CLI interleaving policy selection
#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliPolicy {
    /// Next live thread after the current one
    RoundRobin,
    /// Lowest thread id first
    Sequential,
    /// Seeded shuffle (see --seed)
    Random,
}

/// CLI solver selection strategy
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum CliSelector {
    /// Configured order
    #[default]
    Fixed,
    /// Try the backend that answered last first
    LastWinner,
}

impl From<CliSelector> for SelectionStrategy {
    fn from(cli: CliSelector) -> Self {
        match cli {
            CliSelector::Fixed => SelectionStrategy::Fixed,
            CliSelector::LastWinner => SelectionStrategy::LastWinner,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the assertions of a goto program
    Verify {
        /// Path to the goto program
        file: PathBuf,

        // --- Exploration bounds ---
        /// Loop and recursion unwinding bound
        #[arg(long)]
        unwind: Option<u32>,
        /// Maximum number of steps along one interleaving
        #[arg(long, default_value = "100000")]
        max_steps: usize,
        /// Maximum number of context switches along one interleaving
        #[arg(long)]
        context_bound: Option<usize>,
        /// Interleaving policy
        #[arg(long, value_enum, default_value = "round-robin")]
        policy: CliPolicy,
        /// Seed for the random policy
        #[arg(long, default_value = "0")]
        seed: u64,

        // --- Solving ---
        /// Solver backend (repeatable, tried in order)
        #[arg(long = "solver")]
        solvers: Vec<BackendKind>,
        /// Race the solver backends on worker threads
        #[arg(long)]
        parallel_solve: bool,
        /// Solver timeout in seconds (0 disables the timeout)
        #[arg(long, default_value = "30")]
        solver_timeout: u64,
        /// How backends are ordered before each query
        #[arg(long, value_enum, default_value = "fixed")]
        selector: CliSelector,
        /// Command that ranks backends from the program graph (JSON on stdin)
        #[arg(long)]
        selector_command: Option<String>,

        // --- Run control ---
        /// Keep exploring after the first counterexample
        #[arg(long)]
        all_runs: bool,
        /// Stop after this many interleavings (the verdict stays open)
        #[arg(long)]
        max_interleavings: Option<usize>,
        /// Do not slice equations before solving
        #[arg(long)]
        no_slice: bool,
        /// Print each equation
        #[arg(long)]
        show_program: bool,
        /// Print the SMT-LIB2 formulas instead of solving them
        #[arg(long)]
        smt_formula_only: bool,

        // --- Target ---
        /// Model a big-endian target
        #[arg(long, conflicts_with = "little_endian")]
        big_endian: bool,
        /// Model a little-endian target (default)
        #[arg(long)]
        little_endian: bool,

        // --- Checks ---
        /// Do not check division by zero
        #[arg(long)]
        no_div_by_zero_check: bool,
        /// Check signed arithmetic overflow
        #[arg(long)]
        overflow_check: bool,
        /// Assert instead of assume when the unwinding bound cuts a loop
        #[arg(long)]
        unwinding_assertions: bool,
        /// Check for data races on shared globals
        #[arg(long)]
        data_races_check: bool,
        /// Check for deadlocks
        #[arg(long)]
        deadlock_check: bool,
        /// Treat every global access as a context-switch point
        #[arg(long)]
        no_por: bool,

        /// Enable verbose output
        #[arg(long, short)]
        verbose: bool,
    },
    /// Print the validated goto program
    Program {
        /// Path to the goto program
        file: PathBuf,
    },
    /// Print the program graph of the first formula as JSON
    Graph {
        /// Path to the goto program
        file: PathBuf,
        /// Loop and recursion unwinding bound
        #[arg(long)]
        unwind: Option<u32>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load(path: &Path) -> Result<GotoProgram, Box<dyn std::error::Error>> {
    Ok(parse_file(path)?)
}

/// Options for one verification run
struct VerifyOptions {
    config: BmcConfig,
    smt_formula_only: bool,
}

// --- Verification ---

fn verify(path: &Path, options: &VerifyOptions) -> Result<bool, Box<dyn std::error::Error>> {
    let program = load(path)?;
    if !options.smt_formula_only {
        println!("Verifying: {}", path.display());
        println!(
            "Policy: {}, unwind: {}, {}",
            options.config.explore.policy,
            options
                .config
                .explore
                .unwind
                .map_or("none".to_string(), |u| u.to_string()),
            options.config.explore.endianness
        );
    }

    let outcome = Bmc::new(&program, options.config.clone()).run()?;
    if options.smt_formula_only {
        return Ok(true);
    }

    println!();
    outcome.statistics.print_summary();
    println!();
    if let Verdict::Unsafe(cex) = &outcome.verdict {
        println!("{}", cex);
    }
    if let Verdict::Unknown(reason) = &outcome.verdict {
        println!("Reason: {}", reason);
    }
    println!("{}", outcome.verdict);
    Ok(outcome.verdict.is_safe())
}

fn show_program(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let program = load(path)?;
    print!("{}", program);
    Ok(())
}

fn show_graph(path: &Path, unwind: Option<u32>) -> Result<(), Box<dyn std::error::Error>> {
    let program = load(path)?;
    let mut config = ExploreConfig::default();
    config.unwind = unwind;
    let mut tree = ReachabilityTree::new(&program, config);
    tree.setup_for_new_explore()?;
    let mut result = tree.get_next_formula()?;
    slice(&mut result.equation);
    let graph = ProgramGraph::from_query(&Query::encode(&result.equation));
    println!("{}", graph.to_json_pretty()?);
    Ok(())
}

fn main() {
    let args = Args::parse();

    match args.command {
        Commands::Verify {
            file,
            unwind,
            max_steps,
            context_bound,
            policy,
            seed,
            solvers,
            parallel_solve,
            solver_timeout,
            selector,
            selector_command,
            all_runs,
            max_interleavings,
            no_slice,
            show_program,
            smt_formula_only,
            big_endian,
            little_endian: _,
            no_div_by_zero_check,
            overflow_check,
            unwinding_assertions,
            data_races_check,
            deadlock_check,
            no_por,
            verbose,
        } => {
            init_logging(verbose);

            let policy = match policy {
                CliPolicy::RoundRobin => InterleavingPolicy::RoundRobin,
                CliPolicy::Sequential => InterleavingPolicy::Sequential,
                CliPolicy::Random => InterleavingPolicy::Random { seed },
            };
            let mut explore = ExploreConfig::default()
                .with_max_steps(Some(max_steps))
                .with_policy(policy)
                .with_endianness(if big_endian { Endianness::Big } else { Endianness::Little })
                .with_div_by_zero_check(!no_div_by_zero_check)
                .with_overflow_check(overflow_check)
                .with_unwinding_assertions(unwinding_assertions)
                .with_data_races_check(data_races_check)
                .with_deadlock_check(deadlock_check)
                .with_por(!no_por);
            explore.unwind = unwind;
            explore.context_bound = context_bound;

            let solver = if solver_timeout == 0 {
                SolverConfig::no_timeout()
            } else {
                SolverConfig::with_timeout_secs(solver_timeout)
            };
            let portfolio = PortfolioConfig::default()
                .with_parallel(parallel_solve)
                .with_timeout_option(solver.timeout.map(|t| t + Duration::from_secs(1)));
            let selection = match selector_command {
                Some(cmd) => SelectionStrategy::External(cmd),
                None => selector.into(),
            };

            let options = VerifyOptions {
                config: BmcConfig::default()
                    .with_explore(explore)
                    .with_solver(solver)
                    .with_backends(solvers)
                    .with_portfolio(portfolio)
                    .with_selection(selection)
                    .with_all_runs(all_runs)
                    .with_max_interleavings(max_interleavings)
                    .with_slice(!no_slice)
                    .with_show_program(show_program)
                    .with_smt_formula_only(smt_formula_only),
                smt_formula_only,
            };

            match verify(&file, &options) {
                Ok(true) => {}
                Ok(false) => std::process::exit(1),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Program { file } => {
            init_logging(false);
            if let Err(e) = show_program(&file) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Graph { file, unwind } => {
            init_logging(false);
            if let Err(e) = show_graph(&file, unwind) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}
