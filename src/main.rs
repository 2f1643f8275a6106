use std::{process::exit, time::Duration};
use structopt::StructOpt;
use sysfuzz::Config;

#[derive(Debug, StructOpt)]
#[structopt(name = "sysfuzz", about = "linux syscall fuzzer driving a pool of forked workers.")]
struct Settings {
    /// Number of worker processes.
    #[structopt(short = "C", long, default_value = "4")]
    workers: usize,
    /// Calls between two regenerations of fds and mappings.
    #[structopt(long, default_value = "100000")]
    regen_threshold: u64,
    /// Seconds without progress before a worker is killed.
    #[structopt(long, default_value = "30")]
    hang_timeout: u64,
    /// Calls a worker makes before it is replaced.
    #[structopt(long, default_value = "10000")]
    syscalls_per_child: u64,
    /// Stop after this many calls in total.
    #[structopt(short = "N", long)]
    max_syscalls: Option<u64>,
    /// Alarm in seconds armed around calls that may block.
    #[structopt(long, default_value = "1")]
    alarm: u32,
    /// Probability of a fully random flag argument.
    #[structopt(long, default_value = "0.1")]
    wild_ratio: f64,
    /// Seed of the supervisor's rng, random by default.
    #[structopt(short, long)]
    seed: Option<u64>,
    /// Fuzz only these syscalls, avoided ones must be named here to be used.
    #[structopt(short = "c", long = "syscall")]
    only: Vec<String>,
    /// Never fuzz these syscalls.
    #[structopt(short = "x", long)]
    exclude: Vec<String>,
    /// Keep going when the kernel gets tainted.
    #[structopt(long)]
    no_taint_check: bool,
    /// Seconds between two status lines.
    #[structopt(long, default_value = "10")]
    stats_interval: u64,
    /// Verbose output, repeat for more.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
    /// List the selected syscalls and exit.
    #[structopt(long)]
    list: bool,
}

impl Settings {
    fn config(self) -> Config {
        Config {
            workers: self.workers,
            regen_threshold: self.regen_threshold,
            hang_timeout: Duration::from_secs(self.hang_timeout),
            syscalls_per_worker: self.syscalls_per_child,
            max_syscalls: self.max_syscalls,
            alarm_secs: self.alarm,
            flag_wild_ratio: self.wild_ratio,
            seed: self.seed,
            only: self.only,
            exclude: self.exclude,
            check_tainted: !self.no_taint_check,
            stats_interval: Duration::from_secs(self.stats_interval),
            ..Default::default()
        }
    }
}

pub fn main() {
    let settings = Settings::from_args();
    let level = match settings.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )
    .unwrap();

    let list = settings.list;
    let config = settings.config();
    if list {
        match sysfuzz::registry(&config) {
            Ok(registry) => {
                for call in registry.iter() {
                    let entry = call.entry();
                    let mut marks = Vec::new();
                    if call.has_hooks() {
                        marks.push("hooks");
                    }
                    if entry.need_alarm() {
                        marks.push("alarm");
                    }
                    if entry.avoid() {
                        marks.push("avoid");
                    }
                    if marks.is_empty() {
                        println!("{}", entry);
                    } else {
                        println!("{} [{}]", entry, marks.join(", "));
                    }
                }
            }
            Err(e) => {
                log::error!("{:?}", e);
                exit(1);
            }
        }
        return;
    }

    match sysfuzz::boot(config) {
        Ok(summary) if summary.exit_reason.is_abnormal() => exit(1),
        Ok(_) => (),
        Err(e) => {
            log::error!("{:?}", e);
            exit(1);
        }
    }
}
