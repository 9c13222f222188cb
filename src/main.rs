use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod correlator;
mod engine;
mod flow_key;
mod monitor;
mod policy;
mod redirect;
mod rewriter;
mod segment;
#[cfg(test)]
mod testutil;

use anyhow::{Context, Result};
use clap::Parser;
use nfq::{Queue, Verdict};
use tracing::{info, warn};

use crate::correlator::Correlator;
use crate::engine::{Decision, Interceptor};
use crate::monitor::Monitor;
use crate::policy::{MarkerMatcher, RedirectResponder};
use crate::redirect::RedirectGuard;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Inline NFQUEUE interceptor: rewrites HTTP responses to matched requests into a redirect, forwards everything else untouched."
)]
struct Args {
    /// NFQUEUE queue number to bind
    #[arg(short, long, default_value_t = 0)]
    queue_num: u16,

    /// TCP port whose traffic is inspected
    #[arg(short, long, default_value_t = 80)]
    port: u16,

    /// Byte marker a request payload must contain to be intercepted
    #[arg(short, long, default_value = ".exe")]
    marker: String,

    /// URL the client is redirected to instead of the requested resource
    #[arg(short, long)]
    location: String,

    /// Seconds a recorded match may wait for its response before eviction
    #[arg(long, default_value_t = 30)]
    ttl_secs: u64,

    /// Upper bound on outstanding matches per flow
    #[arg(long, default_value_t = 32)]
    max_per_flow: usize,

    /// Install (and remove on exit) the iptables NFQUEUE rules
    #[arg(long, default_value_t = false)]
    install_rules: bool,

    /// Divert the FORWARD chain instead of OUTPUT/INPUT (gateway mode)
    #[arg(long, default_value_t = false)]
    forward: bool,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn make_queue(queue_num: u16) -> Result<Queue, std::io::Error> {
    let mut q = Queue::open()?;
    q.bind(queue_num)?;
    q.set_copy_range(queue_num, 0xFFFF)?;
    q.set_queue_max_len(queue_num, 10000)?;
    q.set_nonblocking(true);
    Ok(q)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if args.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut engine = Interceptor::new(
        args.port,
        Box::new(MarkerMatcher::new(args.marker.clone().into_bytes())),
        Box::new(RedirectResponder::new(&args.location)),
        Correlator::new(Duration::from_secs(args.ttl_secs), args.max_per_flow),
    );

    // rules must be live before the first recv and gone after the last
    // verdict; the guard's Drop covers normal return, error and signal exits
    let _rules = if args.install_rules {
        Some(
            RedirectGuard::install(args.port, args.queue_num, args.forward)
                .context("installing iptables rules")?,
        )
    } else {
        None
    };

    let mut queue = make_queue(args.queue_num)
        .with_context(|| format!("binding NFQUEUE {}", args.queue_num))?;

    install_signal_handlers();
    let mut monitor = Monitor::new("diverter", Duration::from_secs(5));

    info!(
        queue = args.queue_num,
        port = args.port,
        marker = %args.marker,
        location = %args.location,
        "interception loop running"
    );

    while RUNNING.load(Ordering::Relaxed) {
        match queue.recv() {
            Ok(mut msg) => {
                let decision = engine.handle(msg.get_payload());
                if let Decision::Replace(bytes) = decision {
                    msg.set_payload(bytes);
                }
                // everything is forwarded, mutated or not
                msg.set_verdict(Verdict::Accept);
                if let Err(err) = queue.verdict(msg) {
                    warn!(%err, "failed to hand back a verdict");
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::Interrupted =>
            {
                std::thread::sleep(Duration::from_micros(100));
            }
            Err(err) => {
                // fatal queue error: the guard still tears the rules down
                return Err(err).context("receiving from NFQUEUE");
            }
        }

        if monitor.check_and_report(&engine) {
            engine.sweep();
        }
    }

    info!("stopped, releasing diversion rules");
    Ok(())
}
