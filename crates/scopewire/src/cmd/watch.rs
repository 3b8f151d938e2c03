use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use scopewire::config::Service;
use scopewire_property::PropertySubscriber;
use scopewire_rpc::Reply;
use serde_json::Map;
use tracing::debug;

use crate::cmd::{connect, WatchArgs};
use crate::exit::{fault_error, property_error, rpc_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_update, OutputFormat};

/// The publisher registers new subscriptions on its next poll.
const SUBSCRIBE_SETTLE: Duration = Duration::from_millis(200);

pub fn run(args: WatchArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.endpoints.resolve()?;
    let prefixes: Vec<&str> = if args.prefixes.is_empty() {
        vec![""]
    } else {
        args.prefixes.iter().map(String::as_str).collect()
    };

    let endpoint = config.endpoint(Service::Property);
    let mut subscriber = PropertySubscriber::connect_filtered(&endpoint, &prefixes)
        .map_err(|err| property_error(&format!("subscribe to {endpoint} failed"), err))?;
    let (tx, rx) = mpsc::channel();
    for prefix in &prefixes {
        let tx = tx.clone();
        subscriber.subscribe_prefix(prefix, move |name, value| {
            let _ = tx.send((name.to_string(), value.clone()));
        });
    }
    drop(tx);

    if args.snapshot {
        std::thread::sleep(SUBSCRIBE_SETTLE);
        let mut client = connect(&config, Some(Duration::from_secs(5)))?;
        match client
            .call("rebroadcast_properties", Vec::new(), Map::new())
            .map_err(|err| rpc_error("rebroadcast failed", err))?
        {
            Reply::Error(fault) => return Err(fault_error("rebroadcast failed", &fault)),
            reply => debug!(?reply, "rebroadcast requested"),
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let Ok((name, value)) = rx.recv_timeout(Duration::from_millis(100)) else {
            continue;
        };
        print_update(&name, &value, format);
        printed = printed.saturating_add(1);
        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
    }
    subscriber.stop();
    Ok(SUCCESS)
}
