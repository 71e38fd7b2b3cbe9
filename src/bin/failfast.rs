use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;

use failfast_pool::{FailFastThreadPool, FailureObserver, PoolConfig};

#[derive(Parser, Debug)]
#[command(about = "run jobs on a fail-fast worker pool and report every failure")]
struct Cli {
    #[arg(short, long, default_value_t = 4)]
    threads: u32,

    #[arg(short, long, default_value_t = 10)]
    jobs: u32,

    #[arg(long, default_value_t = 0, help = "make every n-th job return an error")]
    fail_every: u32,

    #[arg(long, default_value_t = 0, help = "make every n-th job panic outside a handle")]
    panic_every: u32,

    #[arg(long, default_value_t = 0)]
    sleep_ms: u64,

    #[arg(long, help = "cancel queued jobs on shutdown instead of running them")]
    no_drain: bool,
}

fn every(n: u32, i: u32) -> bool {
    n > 0 && i % n == 0
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (observer, observed) = FailureObserver::channel();
    let config = PoolConfig::builder()
        .threads(cli.threads)
        .observer(observer)
        .build()?;
    let pool = FailFastThreadPool::with_config(config)?;

    let sleep = Duration::from_millis(cli.sleep_ms);
    let mut handles = Vec::new();
    for i in 1..=cli.jobs {
        if every(cli.panic_every, i) {
            pool.execute(move || {
                thread::sleep(sleep);
                panic!("job {} panicked", i);
            });
            continue;
        }

        let fail = every(cli.fail_every, i);
        let handle = pool.submit(move || {
            thread::sleep(sleep);
            if fail {
                return Err(anyhow!("job {} failed", i));
            }
            Ok(i)
        });
        handles.push((i, handle));
    }

    let abandoned = pool.shutdown(!cli.no_drain);
    if abandoned > 0 {
        log::warn!("{} jobs were abandoned", abandoned);
    }

    let (mut succeeded, mut failed) = (0, 0);
    for (i, handle) in handles {
        match handle.join() {
            Ok(value) => {
                succeeded += 1;
                println!("job {}: ok {}", i, value);
            }
            Err(failure) => {
                failed += 1;
                println!("job {}: {}", i, failure);
            }
        }
    }

    let observed: Vec<_> = observed.try_iter().collect();
    for failure in &observed {
        println!("observed: {}", failure);
    }

    println!(
        "succeeded={} failed={} observed={}",
        succeeded,
        failed,
        observed.len()
    );

    if failed + observed.len() > 0 {
        bail!("{} failures", failed + observed.len());
    }
    Ok(())
}
