#[macro_use]
extern crate cfg_if;

use clap::{value_parser, Arg, ArgMatches, Command};
use crossbeam_utils::thread::scope;
use csv::Writer;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::cmp::max;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{stdout, Write};
use std::sync::{mpsc, Arc, Barrier};
use std::time::{Duration, Instant};

use tsdeque::Deque;

cfg_if! {
    if #[cfg(all(not(feature = "sanitize"), target_os = "linux"))] {
        use tikv_jemallocator::Jemalloc;

        #[global_allocator]
        static ALLOC: Jemalloc = Jemalloc;

        struct MemSampler {
            epoch_mib: tikv_jemalloc_ctl::epoch_mib,
            allocated_mib: tikv_jemalloc_ctl::stats::allocated_mib,
        }
        impl MemSampler {
            pub fn new() -> Self {
                MemSampler {
                    epoch_mib: tikv_jemalloc_ctl::epoch::mib().unwrap(),
                    allocated_mib: tikv_jemalloc_ctl::stats::allocated::mib().unwrap(),
                }
            }
            pub fn sample(&self) -> usize {
                self.epoch_mib.advance().unwrap();
                self.allocated_mib.read().unwrap()
            }
        }
    } else {
        struct MemSampler {}
        impl MemSampler {
            pub fn new() -> Self {
                println!("NOTE: memory sampling is supported only on linux.");
                MemSampler {}
            }
            pub fn sample(&self) -> usize {
                0
            }
        }
    }
}

// push_front, push_back, pop_front, pop_back
const OP_NAMES: [&str; 4] = ["push_front", "push_back", "pop_front", "pop_back"];

struct Config {
    threads: usize,
    prefill: usize,
    push_rate: u8,
    op_dist: WeightedIndex<u32>,
    interval: u64,
    duration: Duration,
    sampling: bool,
    sampling_period: Duration,
    aux_thread: usize,
    mem_sampler: MemSampler,
}

fn main() {
    let matches = Command::new("tsdeque-bench")
        .arg(
            Arg::new("threads")
                .short('t')
                .value_parser(value_parser!(usize))
                .required(true)
                .help("Number of worker threads"),
        )
        .arg(
            Arg::new("push rate")
                .short('g')
                .value_parser(value_parser!(u8).range(0..=100))
                .default_value("50")
                .help("Percentage of operations that push"),
        )
        .arg(
            Arg::new("prefill")
                .short('p')
                .value_parser(value_parser!(usize))
                .default_value("10000")
                .help("Items pushed before measurement starts"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .value_parser(value_parser!(u64))
                .default_value("10")
                .help("Seconds to run the benchmark"),
        )
        .arg(
            Arg::new("sampling period")
                .short('s')
                .value_parser(value_parser!(u64))
                .default_value("1")
                .help("Period for jemalloc stats.allocated queries (ms), 0 disables"),
        )
        .arg(Arg::new("output").short('o').help(
            "Output CSV filename. Appends if the file exists. \
             [default: results/tsdeque.csv]",
        ))
        .get_matches();

    let (config, mut output) = setup(matches);
    bench(&config, &mut output);
}

fn setup(m: ArgMatches) -> (Config, Writer<File>) {
    let threads = m.get_one::<usize>("threads").copied().unwrap();
    let push_rate = m.get_one::<u8>("push rate").copied().unwrap();
    let prefill = m.get_one::<usize>("prefill").copied().unwrap();
    let interval = m.get_one::<u64>("interval").copied().unwrap();
    let sampling_period = m.get_one::<u64>("sampling period").copied().unwrap();
    let sampling = sampling_period > 0 && cfg!(all(not(feature = "sanitize"), target_os = "linux"));

    // Each push weight splits across both ends, same for pops.
    let push = push_rate as u32;
    let pop = 100 - push;
    let op_dist = WeightedIndex::new([push, push, pop, pop]).unwrap();

    let output_name = m
        .get_one::<String>("output")
        .cloned()
        .unwrap_or_else(|| "results/tsdeque.csv".to_string());
    create_dir_all("results").unwrap();
    let output = match OpenOptions::new().append(true).open(&output_name) {
        Ok(f) => csv::Writer::from_writer(f),
        Err(_) => {
            let f = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&output_name)
                .unwrap();
            let mut output = csv::Writer::from_writer(f);
            output
                .write_record([
                    "threads",
                    "push_rate",
                    "prefill",
                    "interval",
                    "throughput",
                    "peak_mem",
                    "avg_mem",
                ])
                .unwrap();
            output.flush().unwrap();
            output
        }
    };

    let config = Config {
        threads,
        prefill,
        push_rate,
        op_dist,
        interval,
        duration: Duration::from_secs(interval),
        sampling,
        sampling_period: Duration::from_millis(sampling_period.max(1)),
        aux_thread: usize::from(sampling),
        mem_sampler: MemSampler::new(),
    };
    (config, output)
}

fn bench(config: &Config, output: &mut Writer<File>) {
    println!(
        "tsdeque: {} threads, g{}, p{}, i{}",
        config.threads, config.push_rate, config.prefill, config.interval
    );

    let deque: Deque<u64> = Deque::with_max_threads(config.threads + config.aux_thread + 1);
    for i in 0..config.prefill {
        deque.push_back(i as u64).unwrap();
    }
    print!("prefilled... ");
    stdout().flush().unwrap();

    let barrier = &Arc::new(Barrier::new(config.threads + config.aux_thread));
    let (ops_sender, ops_receiver) = mpsc::channel();
    let (mem_sender, mem_receiver) = mpsc::channel();

    scope(|s| {
        if config.aux_thread > 0 {
            let mem_sender = mem_sender.clone();
            s.spawn(move |_| {
                let mut samples = 0usize;
                let mut acc = 0usize;
                let mut peak = 0usize;
                barrier.clone().wait();

                let start = Instant::now();
                let mut next_sampling = start + config.sampling_period;
                while start.elapsed() < config.duration {
                    let now = Instant::now();
                    if now > next_sampling {
                        let allocated = config.mem_sampler.sample();
                        samples += 1;
                        acc += allocated;
                        peak = max(peak, allocated);
                        next_sampling = now + config.sampling_period;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                if samples > 0 {
                    mem_sender.send((peak, acc / samples)).unwrap();
                } else {
                    mem_sender.send((0, 0)).unwrap();
                }
            });
        } else {
            mem_sender.send((0, 0)).unwrap();
        }

        for tid in 0..config.threads {
            let ops_sender = ops_sender.clone();
            let deque = deque.clone();
            s.spawn(move |_| {
                let mut ops: u64 = 0;
                let mut rng = rand::thread_rng();
                let mut counter: u64 = 0;
                barrier.clone().wait();
                let start = Instant::now();

                while start.elapsed() < config.duration {
                    match config.op_dist.sample(&mut rng) {
                        0 => {
                            deque.push_front(pack(tid, &mut counter)).unwrap();
                        }
                        1 => {
                            deque.push_back(pack(tid, &mut counter)).unwrap();
                        }
                        2 => {
                            deque.pop_front().unwrap();
                        }
                        _ => {
                            deque.pop_back().unwrap();
                        }
                    }
                    ops += 1;
                }
                ops_sender.send(ops).unwrap();
            });
        }
    })
    .unwrap();
    println!("end");

    let mut ops = 0;
    for _ in 0..config.threads {
        ops += ops_receiver.recv().unwrap();
    }
    let ops_per_sec = ops / config.interval;
    let (peak_mem, avg_mem) = mem_receiver.recv().unwrap();

    output
        .write_record([
            config.threads.to_string(),
            config.push_rate.to_string(),
            config.prefill.to_string(),
            config.interval.to_string(),
            ops_per_sec.to_string(),
            peak_mem.to_string(),
            avg_mem.to_string(),
        ])
        .unwrap();
    output.flush().unwrap();

    println!("ops/s: {}, peak mem: {}, avg mem: {}", ops_per_sec, peak_mem, avg_mem);
    println!("{}", deque.stats());
}

#[inline]
fn pack(tid: usize, counter: &mut u64) -> u64 {
    let v = ((tid as u64) << 32) | *counter;
    *counter += 1;
    v
}
